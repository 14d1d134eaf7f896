use thiserror::Error;

/// Errors surfaced by room setup and signaling operations.
///
/// Negotiation and transport failures are deliberately absent: those are
/// reported as a `failed` connection state through the event stream, never
/// as an error return.
#[derive(Debug, Clone, Error)]
pub enum CallError {
    /// The room code does not resolve to an existing room.
    #[error("room not found")]
    RoomNotFound,

    /// This identity already holds a member slot in the room.
    #[error("already joined this room")]
    AlreadyJoined,

    /// An offerer-only operation was called by the answerer, or vice versa.
    /// This is a programming error, not a recoverable condition.
    #[error("operation not permitted for role: {0}")]
    RoleViolation(&'static str),

    /// No identity was available when one was required.
    #[error("not authenticated")]
    NotAuthenticated,

    /// The rendezvous store rejected or failed an operation.
    #[error("store error: {0}")]
    Store(String),

    /// The peer-connection primitive failed an operation.
    #[error("transport error: {0}")]
    Transport(String),

    /// The session driver has shut down and can no longer accept commands.
    #[error("session closed")]
    Closed,
}
