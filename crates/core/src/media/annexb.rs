use std::ops::Range;
use std::path::Path;

use super::{MIME_VIDEO_AVC, MediaSource, TrackFormat};
use crate::error::{Error, Result};

const START_CODE: [u8; 4] = [0, 0, 0, 1];

/// NAL unit types that carry slice data (RFC 6184 §1.3, table 1).
const VCL_NAL_TYPES: std::ops::RangeInclusive<u8> = 1..=5;
const NAL_TYPE_AUD: u8 = 9;

/// Non-VCL types that can only appear before the first slice of an access
/// unit (H.264 7.4.1.2.3): SEI, SPS, PPS, AUD and 14..=18.
fn starts_access_unit(nal_type: u8) -> bool {
    matches!(nal_type, 6..=9 | 14..=18)
}

/// `first_mb_in_slice == 0` is coded as a single `1` bit, so the first
/// slice of a picture has the top bit of the slice header set.
fn is_first_slice(nal: &[u8]) -> bool {
    nal.get(1).is_none_or(|b| b & 0x80 != 0)
}

#[derive(Debug, Clone)]
pub struct AnnexBConfig {
    /// Frame rate used to synthesize presentation timestamps.
    pub frame_rate: u32,
}

impl Default for AnnexBConfig {
    fn default() -> Self {
        Self { frame_rate: 30 }
    }
}

/// H.264 Annex B elementary-stream source.
///
/// Exposes a single `video/avc` track. The bitstream is split into access
/// units at NAL start codes. A unit opens at an access unit delimiter,
/// parameter set or SEI that follows a slice, or at a slice whose
/// `first_mb_in_slice` is zero. Further slices of the same picture join the
/// open unit.
///
/// An elementary stream has no timestamps, so sample `n` is stamped
/// `n * 1_000_000 / frame_rate` microseconds. Each sample is emitted in
/// Annex B form (4-byte start code before every NAL).
#[derive(Debug)]
pub struct AnnexBSource {
    units: Vec<Vec<u8>>,
    frame_rate: u32,
    selected: bool,
    cursor: usize,
}

impl AnnexBSource {
    pub fn open(path: impl AsRef<Path>, config: &AnnexBConfig) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path).map_err(|e| Error::SourceOpen {
            locator: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let source = Self::from_bytes(&data, config)?;
        tracing::info!(
            path = %path.display(),
            access_units = source.units.len(),
            frame_rate = source.frame_rate,
            "opened Annex B source"
        );
        Ok(source)
    }

    pub fn from_bytes(data: &[u8], config: &AnnexBConfig) -> Result<Self> {
        if config.frame_rate == 0 {
            return Err(Error::SourceOpen {
                locator: "<annex-b>".to_string(),
                reason: "frame rate must be positive".to_string(),
            });
        }

        let nal_ranges = find_nal_units(data);
        if nal_ranges.is_empty() {
            return Err(Error::SourceOpen {
                locator: "<annex-b>".to_string(),
                reason: "no H.264 start codes found".to_string(),
            });
        }

        Ok(Self {
            units: group_access_units(data, &nal_ranges),
            frame_rate: config.frame_rate,
            selected: false,
            cursor: 0,
        })
    }

    /// Number of access units in the stream.
    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    fn check_track(&self, index: usize) -> Result<()> {
        if index == 0 {
            Ok(())
        } else {
            Err(Error::TrackIndex { index, tracks: 1 })
        }
    }

    fn check_selected(&self) -> Result<()> {
        if self.selected {
            Ok(())
        } else {
            Err(Error::Source("no track selected".to_string()))
        }
    }
}

impl MediaSource for AnnexBSource {
    fn track_count(&self) -> usize {
        1
    }

    fn track_format(&self, index: usize) -> Result<TrackFormat> {
        self.check_track(index)?;
        Ok(TrackFormat {
            mime: MIME_VIDEO_AVC.to_string(),
            frame_rate: Some(self.frame_rate),
        })
    }

    fn select_track(&mut self, index: usize) -> Result<()> {
        self.check_track(index)?;
        self.selected = true;
        self.cursor = 0;
        Ok(())
    }

    fn sample_time_us(&self) -> Result<Option<i64>> {
        self.check_selected()?;
        if self.cursor >= self.units.len() {
            return Ok(None);
        }
        Ok(Some(self.cursor as i64 * 1_000_000 / self.frame_rate as i64))
    }

    fn read_sample(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.check_selected()?;
        let unit = self
            .units
            .get(self.cursor)
            .ok_or_else(|| Error::Source("read past end of stream".to_string()))?;
        if unit.len() > buf.len() {
            return Err(Error::SampleTooLarge {
                size: unit.len(),
                capacity: buf.len(),
            });
        }
        buf[..unit.len()].copy_from_slice(unit);
        Ok(unit.len())
    }

    fn advance(&mut self) -> Result<()> {
        self.check_selected()?;
        if self.cursor < self.units.len() {
            self.cursor += 1;
        }
        Ok(())
    }
}

/// Locate NAL units in an Annex B bitstream.
///
/// Scans for both 4-byte `00 00 00 01` and 3-byte `00 00 01` start codes
/// and returns the byte range of each NAL, start code excluded. The start
/// code length is tracked per NAL so that boundaries stay correct when the
/// two forms are mixed.
fn find_nal_units(data: &[u8]) -> Vec<Range<usize>> {
    // (nal_data_start_index, start_code_length)
    let mut starts: Vec<(usize, usize)> = Vec::new();
    let mut i = 0usize;

    while i < data.len() {
        if i + 3 < data.len() && data[i..i + 4] == START_CODE {
            starts.push((i + 4, 4));
            i += 4;
        } else if i + 2 < data.len() && data[i..i + 3] == [0, 0, 1] {
            starts.push((i + 3, 3));
            i += 3;
        } else {
            i += 1;
        }
    }

    starts
        .iter()
        .enumerate()
        .filter_map(|(idx, &(start, _))| {
            let end = match starts.get(idx + 1) {
                Some(&(next_start, next_sc_len)) => next_start - next_sc_len,
                None => data.len(),
            };
            (start < end).then_some(start..end)
        })
        .collect()
}

fn group_access_units(data: &[u8], nal_ranges: &[Range<usize>]) -> Vec<Vec<u8>> {
    let mut units = Vec::new();
    let mut current: Vec<u8> = Vec::new();
    let mut has_slice = false;

    for range in nal_ranges {
        let nal = &data[range.clone()];
        let nal_type = nal[0] & 0x1f;
        let is_slice = VCL_NAL_TYPES.contains(&nal_type);

        let boundary = if nal_type == NAL_TYPE_AUD {
            !current.is_empty()
        } else if is_slice {
            has_slice && is_first_slice(nal)
        } else {
            has_slice && starts_access_unit(nal_type)
        };
        if boundary {
            units.push(std::mem::take(&mut current));
            has_slice = false;
        }

        current.extend_from_slice(&START_CODE);
        current.extend_from_slice(nal);
        has_slice |= is_slice;
    }

    if !current.is_empty() {
        units.push(current);
    }
    units
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nal(bytes: &[u8]) -> Vec<u8> {
        let mut out = START_CODE.to_vec();
        out.extend_from_slice(bytes);
        out
    }

    /// SPS, PPS, IDR slice, non-IDR slice, non-IDR slice.
    fn three_frame_stream() -> Vec<u8> {
        [
            nal(&[0x67, 0x42, 0x00, 0x1e]),
            nal(&[0x68, 0xce, 0x38, 0x80]),
            nal(&[0x65, 0x88, 0x84]),
            nal(&[0x41, 0x9a, 0x02]),
            nal(&[0x41, 0x9a, 0x04]),
        ]
        .concat()
    }

    fn open(data: &[u8]) -> AnnexBSource {
        let mut source = AnnexBSource::from_bytes(data, &AnnexBConfig::default()).unwrap();
        source.select_track(0).unwrap();
        source
    }

    #[test]
    fn finds_nals_with_mixed_start_codes() {
        let mut data = vec![0, 0, 0, 1, 0x67, 0x42];
        data.extend_from_slice(&[0, 0, 1, 0x68, 0xCE]);
        let ranges = find_nal_units(&data);
        assert_eq!(ranges.len(), 2);
        assert_eq!(&data[ranges[0].clone()], &[0x67, 0x42]);
        assert_eq!(&data[ranges[1].clone()], &[0x68, 0xCE]);
    }

    #[test]
    fn no_start_code_is_rejected() {
        let err = AnnexBSource::from_bytes(&[0xFF, 0xFE], &AnnexBConfig::default()).unwrap_err();
        assert!(matches!(err, Error::SourceOpen { .. }));
    }

    #[test]
    fn parameter_sets_join_the_first_slice() {
        let source = open(&three_frame_stream());
        assert_eq!(source.len(), 3);
        let first = find_nal_units(&source.units[0]);
        assert_eq!(first.len(), 3);
    }

    #[test]
    fn slices_of_one_picture_stay_together() {
        let data = [
            nal(&[0x67, 0x42, 0x00, 0x1e]),
            nal(&[0x68, 0xce, 0x38, 0x80]),
            nal(&[0x65, 0x88, 0x84]),
            nal(&[0x65, 0x40, 0x84]),
            nal(&[0x41, 0x9a, 0x02]),
        ]
        .concat();
        let mut source = open(&data);
        assert_eq!(source.len(), 2);
        assert_eq!(find_nal_units(&source.units[0]).len(), 4);

        let mut buf = vec![0u8; 1024];
        let mut times = Vec::new();
        while let Some(t) = source.sample_time_us().unwrap() {
            source.read_sample(&mut buf).unwrap();
            source.advance().unwrap();
            times.push(t);
        }
        assert_eq!(times, vec![0, 33_333]);
    }

    #[test]
    fn parameter_sets_after_a_picture_open_the_next_unit() {
        let data = [
            nal(&[0x65, 0x88, 0x84]),
            nal(&[0x67, 0x42, 0x00, 0x1e]),
            nal(&[0x68, 0xce, 0x38, 0x80]),
            nal(&[0x65, 0x88, 0x84]),
        ]
        .concat();
        let source = open(&data);
        assert_eq!(source.len(), 2);
        assert_eq!(find_nal_units(&source.units[1]).len(), 3);
    }

    #[test]
    fn aud_splits_units() {
        let data = [
            nal(&[0x09, 0xf0]),
            nal(&[0x06, 0x05]),
            nal(&[0x09, 0xf0]),
            nal(&[0x65, 0x88]),
        ]
        .concat();
        let source = open(&data);
        assert_eq!(source.len(), 2);
    }

    #[test]
    fn timestamps_follow_frame_rate() {
        let mut source = open(&three_frame_stream());
        let mut buf = vec![0u8; 1024];
        let mut times = Vec::new();
        while let Some(t) = source.sample_time_us().unwrap() {
            source.read_sample(&mut buf).unwrap();
            source.advance().unwrap();
            times.push(t);
        }
        assert_eq!(times, vec![0, 33_333, 66_666]);
    }

    #[test]
    fn oversized_sample_is_rejected() {
        let mut source = open(&three_frame_stream());
        let mut buf = vec![0u8; 4];
        assert!(matches!(
            source.read_sample(&mut buf),
            Err(Error::SampleTooLarge { capacity: 4, .. })
        ));
    }

    #[test]
    fn samples_require_selection() {
        let source = AnnexBSource::from_bytes(&three_frame_stream(), &AnnexBConfig::default()).unwrap();
        assert!(source.sample_time_us().is_err());
    }

    #[test]
    fn single_avc_track() {
        let source = open(&three_frame_stream());
        assert_eq!(source.track_count(), 1);
        let format = source.track_format(0).unwrap();
        assert_eq!(format.mime, MIME_VIDEO_AVC);
        assert_eq!(format.frame_rate, Some(30));
        assert!(matches!(
            source.track_format(1),
            Err(Error::TrackIndex { index: 1, tracks: 1 })
        ));
    }
}
