use crate::media::Packetization;
use crate::transport::TransportMode;

/// Default RTP payload type for the video stream.
pub const DEFAULT_PAYLOAD_TYPE: u8 = 33;

/// Default capacity of the sample read buffer (1 MiB).
pub const DEFAULT_MAX_SAMPLE_SIZE: usize = 1024 * 1024;

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Locator of the media asset streamed in connect mode.
    pub media_source: String,
    /// RTP payload type declared by the receiver and stamped by the sender.
    pub payload_type: u8,
    /// Packetization the receiver maps `payload_type` to.
    pub packetization: Packetization,
    /// Capacity of the buffer each sample is read into. Larger samples
    /// abort the stream.
    pub max_sample_size: usize,
    /// Transport kind of the media channel, both roles.
    pub media_mode: TransportMode,
    /// Transport kind of the control channel, both roles.
    pub control_mode: TransportMode,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            media_source: "media/test.h264".to_string(),
            payload_type: DEFAULT_PAYLOAD_TYPE,
            packetization: Packetization::H264,
            max_sample_size: DEFAULT_MAX_SAMPLE_SIZE,
            media_mode: TransportMode::Udp,
            control_mode: TransportMode::Udp,
        }
    }
}
