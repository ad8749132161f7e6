//! Media source adapter.
//!
//! The orchestrator reads samples through the [`MediaSource`] trait only.
//! A source exposes one or more tracks, each described by a [`TrackFormat`];
//! once a track is selected, samples are consumed strictly in order:
//!
//! ```text
//! sample_time_us() -> read_sample(buf) -> advance() -> sample_time_us() -> ...
//! ```
//!
//! `sample_time_us` returning `Ok(None)` is the normal end of stream.
//!
//! ## Supported video codecs
//!
//! | MIME type | Packetization |
//! |-----------|---------------|
//! | `video/avc` | [`Packetization::H264`] |
//! | `video/hevc` | [`Packetization::H265`] |

pub mod annexb;

use std::fmt;

use crate::error::Result;

pub use annexb::{AnnexBConfig, AnnexBSource};

pub const MIME_VIDEO_AVC: &str = "video/avc";
pub const MIME_VIDEO_HEVC: &str = "video/hevc";

/// Codec-specific scheme used to fragment samples into transport packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Packetization {
    H264,
    H265,
}

impl Packetization {
    /// Map a track MIME type to a supported video packetization.
    ///
    /// Matching is case-insensitive; anything that is not a supported
    /// video codec yields `None`.
    pub fn from_mime(mime: &str) -> Option<Self> {
        if mime.eq_ignore_ascii_case(MIME_VIDEO_AVC) {
            Some(Self::H264)
        } else if mime.eq_ignore_ascii_case(MIME_VIDEO_HEVC) {
            Some(Self::H265)
        } else {
            None
        }
    }

    /// RTP clock rate in Hz. Both video codecs use 90 kHz (RFC 3551 §4).
    pub fn clock_rate(&self) -> u32 {
        90_000
    }
}

impl fmt::Display for Packetization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::H264 => write!(f, "H264"),
            Self::H265 => write!(f, "H265"),
        }
    }
}

/// Description of one track of a media source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackFormat {
    pub mime: String,
    /// Nominal frame rate, when the source knows it.
    pub frame_rate: Option<u32>,
}

impl TrackFormat {
    pub fn new(mime: &str) -> Self {
        Self {
            mime: mime.to_string(),
            frame_rate: None,
        }
    }

    pub fn packetization(&self) -> Option<Packetization> {
        Packetization::from_mime(&self.mime)
    }
}

/// Ordered, timestamped samples from an opened media asset.
pub trait MediaSource: Send {
    fn track_count(&self) -> usize;

    fn track_format(&self, index: usize) -> Result<TrackFormat>;

    fn select_track(&mut self, index: usize) -> Result<()>;

    /// Presentation time of the current sample in microseconds, or `None`
    /// at end of stream.
    fn sample_time_us(&self) -> Result<Option<i64>>;

    /// Copy the current sample into `buf` and return its length.
    ///
    /// A sample longer than `buf` is a contract violation and yields
    /// [`Error::SampleTooLarge`](crate::Error::SampleTooLarge).
    fn read_sample(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Move to the next sample.
    fn advance(&mut self) -> Result<()>;
}

/// Index of the first track whose format maps to a supported video codec.
pub fn find_video_track(source: &dyn MediaSource) -> Result<Option<(usize, Packetization)>> {
    for index in 0..source.track_count() {
        let format = source.track_format(index)?;
        if let Some(packetization) = format.packetization() {
            return Ok(Some((index, packetization)));
        }
        tracing::trace!(index, mime = %format.mime, "skipping unsupported track");
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mime_matching_is_case_insensitive() {
        assert_eq!(Packetization::from_mime("video/avc"), Some(Packetization::H264));
        assert_eq!(Packetization::from_mime("VIDEO/AVC"), Some(Packetization::H264));
        assert_eq!(Packetization::from_mime("video/HEVC"), Some(Packetization::H265));
    }

    #[test]
    fn audio_and_unknown_video_are_unsupported() {
        assert_eq!(Packetization::from_mime("audio/mp4a-latm"), None);
        assert_eq!(Packetization::from_mime("video/x-vnd.on2.vp8"), None);
        assert_eq!(Packetization::from_mime(""), None);
    }

    #[test]
    fn display_names() {
        assert_eq!(Packetization::H264.to_string(), "H264");
        assert_eq!(Packetization::H265.to_string(), "H265");
    }
}
