//! Abstract peer-connection primitive.
//!
//! The manager never touches WebRTC types directly; it drives this trait and
//! consumes `TransportEvent`s. That keeps the state machine testable and the
//! primitive swappable (real WebRTC stack, or the in-process loopback pair).

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::config::SessionConfig;
use crate::error::CallError;
use crate::models::{IceCandidate, SessionDescription};

/// Native connection state as reported by the primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Notifications from the primitive, delivered over a channel so they
/// interleave with signaling events in one actor loop.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    StateChanged(TransportState),
    /// A local ICE candidate was gathered and must be relayed to the peer.
    LocalCandidate(IceCandidate),
    /// The audio data channel is open (created locally, or received from the
    /// offerer on the answering side).
    ChannelOpen,
    /// An inbound data-channel message.
    Message(Bytes),
}

#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, CallError>;

    async fn create_answer(&self) -> Result<SessionDescription, CallError>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), CallError>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), CallError>;

    /// Adding a candidate before a remote description exists is a protocol
    /// error; the manager queues candidates until then.
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), CallError>;

    /// Open the single audio data channel, unordered with zero retransmits.
    /// Only the offering side ever calls this; the answering side receives
    /// the channel through `TransportEvent::ChannelOpen`.
    async fn create_data_channel(&self) -> Result<(), CallError>;

    async fn send(&self, payload: Bytes) -> Result<(), CallError>;

    async fn close(&self) -> Result<(), CallError>;

    /// Last state the primitive reported. Used to turn a scheduled ICE
    /// restart into a no-op when the grace delay let the connection
    /// self-heal.
    fn connection_state(&self) -> TransportState;
}

/// Builds one transport per negotiation attempt.
#[async_trait]
pub trait PeerTransportFactory: Send + Sync {
    async fn create(
        &self,
        config: &SessionConfig,
    ) -> Result<(Arc<dyn PeerTransport>, mpsc::UnboundedReceiver<TransportEvent>), CallError>;
}
