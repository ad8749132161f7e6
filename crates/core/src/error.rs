//! Error types for the RTP test orchestrator.

use std::fmt;

use crate::looper::HandlerId;
use crate::transport::TransportMode;

/// Errors that can occur while bringing up or running a session.
///
/// Variants map to the failure classes the orchestrator distinguishes:
///
/// - **Setup**: [`SourceOpen`](Self::SourceOpen),
///   [`NoCompatibleTrack`](Self::NoCompatibleTrack),
///   [`InvalidEndpoint`](Self::InvalidEndpoint),
///   [`TrackIndex`](Self::TrackIndex).
/// - **Asynchronous init**: [`UnsupportedTransport`](Self::UnsupportedTransport),
///   [`Resolve`](Self::Resolve), [`Io`](Self::Io).
/// - **Source contract**: [`SampleTooLarge`](Self::SampleTooLarge),
///   [`Source`](Self::Source).
/// - **Endpoint state**: [`NotInitialized`](Self::NotInitialized),
///   [`PayloadConflict`](Self::PayloadConflict).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Underlying I/O or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The media source at the configured locator could not be opened.
    #[error("failed to open media source {locator}: {reason}")]
    SourceOpen { locator: String, reason: String },

    /// None of the source's tracks carries a supported video codec.
    #[error("no compatible video track among {tracks} track(s)")]
    NoCompatibleTrack { tracks: usize },

    /// Track index out of range for the opened source.
    #[error("track index {index} out of range ({tracks} track(s))")]
    TrackIndex { index: usize, tracks: usize },

    /// A sample did not fit into the fixed-capacity read buffer.
    #[error("sample of {size} bytes exceeds buffer capacity of {capacity} bytes")]
    SampleTooLarge { size: usize, capacity: usize },

    /// The media source failed mid-stream.
    #[error("media source error: {0}")]
    Source(String),

    /// Remote endpoint could not be used (bad host, port out of range).
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// Remote host name did not resolve to any address.
    #[error("could not resolve {host}: {reason}")]
    Resolve { host: String, reason: String },

    /// The endpoint does not implement the requested transport kind.
    #[error("unsupported transport for {channel} channel: {mode}")]
    UnsupportedTransport { channel: Channel, mode: TransportMode },

    /// A command arrived before asynchronous initialization completed.
    #[error("endpoint not initialized")]
    NotInitialized,

    /// A payload type was registered twice with different packetizations.
    #[error("payload type {payload_type} already mapped to {existing}")]
    PayloadConflict { payload_type: u8, existing: String },

    /// A message was addressed to a handler that is no longer registered.
    #[error("no handler registered for {0}")]
    StaleHandler(HandlerId),
}

/// Which of the two logical transport flows an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Media,
    Control,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Media => write!(f, "media"),
            Self::Control => write!(f, "control"),
        }
    }
}

/// Convenience alias for `Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;
