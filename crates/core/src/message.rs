//! Messages exchanged on the orchestrator's looper.
//!
//! Every message kind is a variant with a statically typed payload; there is
//! no string-keyed field lookup. Variants fall in three groups:
//!
//! | Group | Variants | Addressed to |
//! |-------|----------|--------------|
//! | Orchestrator commands | `Listen`, `Connect`, `SendMore`, `Stop` | orchestrator |
//! | Collaborator notifications | `SenderNotify`, `ReceiverNotify` | orchestrator |
//! | Endpoint commands | `Sender(..)`, `Receiver(..)` | sender / receiver |

use crate::error::Result;
use crate::looper::{HandlerId, Poster};
use crate::media::Packetization;
use crate::transport::TransportMode;

/// A sample read from the media source, carried to the sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessUnit {
    /// Presentation time in microseconds, as reported by the source.
    pub time_us: i64,
    pub data: Vec<u8>,
}

/// Outcome reported by a transport endpoint.
#[derive(Debug)]
pub enum TransportEvent {
    /// Asynchronous initialization finished; carries the locally bound
    /// media port on success.
    InitDone(Result<u16>),
    /// Mid-stream failure after initialization.
    Error(crate::error::Error),
}

#[derive(Debug)]
pub enum SenderCommand {
    Init {
        remote_host: String,
        media_port: u16,
        media_mode: TransportMode,
        control_port: u16,
        control_mode: TransportMode,
    },
    QueueBuffer {
        unit: AccessUnit,
        payload_type: u8,
        packetization: Packetization,
    },
    /// Completion of the sender's background address resolution.
    Resolved(Result<std::net::SocketAddr>),
}

#[derive(Debug)]
pub enum ReceiverCommand {
    RegisterPayload {
        payload_type: u8,
        packetization: Packetization,
    },
    Init {
        media_mode: TransportMode,
        control_mode: TransportMode,
    },
    /// A datagram arrived on the media socket.
    Datagram { len: usize, payload_type: Option<u8> },
}

#[derive(Debug)]
pub enum Message {
    Listen,
    Connect { host: String, port: u16 },
    SenderNotify(TransportEvent),
    ReceiverNotify(TransportEvent),
    SendMore(AccessUnit),
    Stop,
    Sender(SenderCommand),
    Receiver(ReceiverCommand),
}

impl Message {
    /// Short variant name for log lines (payloads can be large).
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Listen => "listen",
            Self::Connect { .. } => "connect",
            Self::SenderNotify(_) => "sender-notify",
            Self::ReceiverNotify(_) => "receiver-notify",
            Self::SendMore(_) => "send-more",
            Self::Stop => "stop",
            Self::Sender(_) => "sender-command",
            Self::Receiver(_) => "receiver-command",
        }
    }
}

/// Where an endpoint sends its notifications.
///
/// Replaces a back-reference to the orchestrator: the endpoint posts a
/// [`TransportEvent`], wrapped in the variant chosen by whoever created it,
/// to a fixed handler id.
#[derive(Clone)]
pub struct Notify {
    poster: Poster<Message>,
    target: HandlerId,
    wrap: fn(TransportEvent) -> Message,
}

impl Notify {
    pub fn new(poster: Poster<Message>, target: HandlerId, wrap: fn(TransportEvent) -> Message) -> Self {
        Self {
            poster,
            target,
            wrap,
        }
    }

    pub fn post(&self, event: TransportEvent) {
        self.poster.post(self.target, (self.wrap)(event), 0);
    }
}
