use serde::Serialize;
use tokio::sync::broadcast;

use crate::models::{AudioPacket, ConnectionState};

/// Events surfaced to the embedding application.
/// Emitted by the session driver, consumed by whatever owns the UI/store.
///
/// `PartnerJoined` is idempotently re-fireable: a partner whose store
/// connection cycled re-triggers it, so consumers must check their own
/// connection state before re-negotiating.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data")]
pub enum SessionEvent {
    RoomCreated { code: String },
    RoomJoined { code: String },
    /// Membership reached two. May recover a `PartnerLeft`.
    PartnerJoined,
    /// Membership dropped back to one after a partner had been seen.
    /// May self-heal; the room still exists.
    PartnerLeft,
    /// The room itself is gone. Unrecoverable.
    RoomDeleted,
    ConnectionStateChanged { state: ConnectionState },
    AudioReceived(AudioPacket),
}

pub type EventSender = broadcast::Sender<SessionEvent>;
pub type EventReceiver = broadcast::Receiver<SessionEvent>;

pub fn create_event_bus() -> (EventSender, EventReceiver) {
    broadcast::channel(256)
}
