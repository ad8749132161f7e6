pub mod config;
pub mod error;
pub mod looper;
pub mod media;
pub mod message;
pub mod orchestrator;
pub mod pacing;
pub mod transport;

pub use config::OrchestratorConfig;
pub use error::{Error, Result};
pub use looper::{Context, Handler, HandlerId, Looper, LooperThread, Poster};
pub use media::{AnnexBConfig, AnnexBSource, MediaSource, Packetization, TrackFormat};
pub use message::{AccessUnit, Message, Notify, TransportEvent};
pub use orchestrator::{Endpoints, Orchestrator, OrchestratorHandle, Role, State, Status};
pub use transport::{TransportMode, UdpEndpoints};
