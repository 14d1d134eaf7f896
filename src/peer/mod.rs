pub mod loopback;
pub mod manager;
pub mod rtc;
pub mod transport;

pub use loopback::LoopbackTransport;
pub use manager::PeerConnection;
pub use rtc::{RtcTransport, RtcTransportFactory};
pub use transport::{PeerTransport, PeerTransportFactory, TransportEvent, TransportState};
