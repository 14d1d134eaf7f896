pub mod audio;
pub mod config;
pub mod error;
pub mod events;
pub mod models;
pub mod peer;
pub mod session;
pub mod signaling;
pub mod store;

pub use config::SessionConfig;
pub use error::CallError;
pub use events::{create_event_bus, EventReceiver, EventSender, SessionEvent};
pub use models::{AudioPacket, ConnectionState, IceCandidate, Role, SdpKind, SessionDescription};
pub use peer::{PeerConnection, PeerTransport, PeerTransportFactory, RtcTransportFactory};
pub use session::{run_session, spawn_session, SessionCommand, SessionHandle};
pub use signaling::{SignalingChannel, SignalingEvent};
pub use store::{MemoryStore, RendezvousStore};
