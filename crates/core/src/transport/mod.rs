//! Transport endpoints.
//!
//! Each endpoint is a [`Handler`](crate::looper::Handler) registered in the
//! orchestrator's looper. It receives commands as [`Message`]s and reports
//! back through a [`Notify`](crate::message::Notify):
//!
//! ```text
//! orchestrator --Sender(Init)-----------> UdpSender --resolver thread--+
//!                                             ^                        |
//!                                             +---Sender(Resolved)-----+
//! orchestrator <--SenderNotify(InitDone)-- UdpSender
//! ```
//!
//! The endpoints here are thin reference implementations over UDP:
//!
//! - [`sender::UdpSender`]: media to `host:port`, control socket connected
//!   to `host:port+1`. Each sample goes out as datagrams of at most one MTU,
//!   each behind an RTP fixed header ([`rtp::RtpHeader`]).
//! - [`receiver::UdpReceiver`]: binds an even/odd port pair and counts
//!   inbound datagrams against its payload-type map.
//!
//! Codec-specific payload formats (FU-A fragmentation, parameter-set
//! handling) and RTCP are not implemented.

pub mod receiver;
pub mod rtp;
pub mod sender;
pub mod udp;

use std::fmt;

use crate::error::Result;
use crate::looper::Handler;
use crate::media::{AnnexBConfig, AnnexBSource, MediaSource};
use crate::message::{Message, Notify};
use crate::orchestrator::Endpoints;

pub use receiver::{ReceiverStats, UdpReceiver};
pub use sender::UdpSender;

/// Network delivery mode for one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportMode {
    /// Connectionless datagrams.
    Udp,
    /// Dedicated TCP connection.
    Tcp,
    /// Multiplexed onto an existing TCP connection.
    TcpInterleaved,
    /// Channel not used.
    None,
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Udp => write!(f, "udp"),
            Self::Tcp => write!(f, "tcp"),
            Self::TcpInterleaved => write!(f, "tcp-interleaved"),
            Self::None => write!(f, "none"),
        }
    }
}

/// [`Endpoints`] backed by the UDP endpoints and an Annex B file source.
#[derive(Debug, Clone, Default)]
pub struct UdpEndpoints {
    pub source: AnnexBConfig,
}

impl UdpEndpoints {
    pub fn new(source: AnnexBConfig) -> Self {
        Self { source }
    }
}

impl Endpoints for UdpEndpoints {
    fn create_receiver(&mut self, notify: Notify) -> Box<dyn Handler<Message>> {
        Box::new(UdpReceiver::new(notify))
    }

    fn create_sender(&mut self, notify: Notify) -> Box<dyn Handler<Message>> {
        Box::new(UdpSender::new(notify))
    }

    fn open_source(&mut self, locator: &str) -> Result<Box<dyn MediaSource>> {
        Ok(Box::new(AnnexBSource::open(locator, &self.source)?))
    }
}
