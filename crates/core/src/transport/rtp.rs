/// RTP fixed header writer (RFC 3550 §5.1).
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |V=2|P|X|  CC   |M|     PT      |       Sequence Number         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                           Timestamp                           |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                             SSRC                              |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// Holds the per-stream state: the SSRC and the wrapping 16-bit sequence
/// number. Payload type and timestamp are supplied per packet, since the
/// sender is told both with every buffer.
///
/// Version is always 2. Padding, extension, and CSRC count are always 0.
#[derive(Debug)]
pub struct RtpHeader {
    /// Synchronization source identifier (RFC 3550 §8.1).
    pub ssrc: u32,
    sequence: u16,
}

pub const RTP_HEADER_LEN: usize = 12;

impl RtpHeader {
    pub fn new(ssrc: u32, initial_sequence: u16) -> Self {
        tracing::debug!(
            ssrc = format_args!("{:#010X}", ssrc),
            initial_sequence,
            "RTP header state created"
        );
        Self {
            ssrc,
            sequence: initial_sequence,
        }
    }

    /// Random SSRC and initial sequence number, as RFC 3550 §5.1 and §8.1
    /// recommend.
    pub fn random() -> Self {
        Self::new(rand::random::<u32>(), rand::random::<u16>())
    }

    /// Sequence number the next [`write`](Self::write) will use.
    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    /// Serialize a 12-byte header and advance the sequence number.
    ///
    /// `marker` is set on the last packet of a sample.
    pub fn write(&mut self, payload_type: u8, marker: bool, timestamp: u32) -> [u8; RTP_HEADER_LEN] {
        let mut header = [0u8; RTP_HEADER_LEN];
        header[0] = 2 << 6;
        header[1] = ((marker as u8) << 7) | (payload_type & 0x7f);
        header[2..4].copy_from_slice(&self.sequence.to_be_bytes());
        header[4..8].copy_from_slice(&timestamp.to_be_bytes());
        header[8..12].copy_from_slice(&self.ssrc.to_be_bytes());

        self.sequence = self.sequence.wrapping_add(1);
        header
    }
}

/// Convert a presentation time in microseconds to an RTP timestamp at
/// `clock_rate` Hz. The result wraps modulo 2^32.
pub fn rtp_timestamp(time_us: i64, clock_rate: u32) -> u32 {
    (time_us as i128 * clock_rate as i128 / 1_000_000) as u32
}

/// Payload type of an RTP packet, if `packet` looks like one.
pub fn payload_type(packet: &[u8]) -> Option<u8> {
    if packet.len() < RTP_HEADER_LEN || packet[0] >> 6 != 2 {
        return None;
    }
    Some(packet[1] & 0x7f)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_header() -> RtpHeader {
        RtpHeader::new(0xAABBCCDD, 0)
    }

    #[test]
    fn version_is_2() {
        let mut h = make_header();
        let buf = h.write(33, false, 0);
        assert_eq!(buf[0] >> 6, 2);
    }

    #[test]
    fn marker_bit() {
        let mut h = make_header();
        let no_marker = h.write(33, false, 0);
        assert_eq!(no_marker[1] & 0x80, 0);

        let with_marker = h.write(33, true, 0);
        assert_eq!(with_marker[1] & 0x80, 0x80);
    }

    #[test]
    fn payload_type_masked_to_7_bits() {
        let mut h = make_header();
        let buf = h.write(33, true, 0);
        assert_eq!(payload_type(&buf), Some(33));
        let buf = h.write(0xFF, false, 0);
        assert_eq!(buf[1], 0x7f);
    }

    #[test]
    fn sequence_wraps() {
        let mut h = RtpHeader::new(1, u16::MAX);
        let buf = h.write(33, false, 0);
        assert_eq!(u16::from_be_bytes([buf[2], buf[3]]), u16::MAX);
        assert_eq!(h.sequence(), 0);
    }

    #[test]
    fn timestamp_and_ssrc_written() {
        let mut h = make_header();
        let buf = h.write(33, false, 0x01020304);
        assert_eq!(u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]), 0x01020304);
        assert_eq!(u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]), 0xAABBCCDD);
    }

    #[test]
    fn media_time_to_90khz() {
        assert_eq!(rtp_timestamp(0, 90_000), 0);
        assert_eq!(rtp_timestamp(33_333, 90_000), 2_999);
        assert_eq!(rtp_timestamp(1_000_000, 90_000), 90_000);
    }

    #[test]
    fn short_or_non_rtp_packets_have_no_payload_type() {
        assert_eq!(payload_type(&[0x80, 33]), None);
        assert_eq!(payload_type(&[0u8; 12]), None);
    }
}
