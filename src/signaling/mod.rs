pub mod channel;
pub mod code;

pub use channel::{SignalingChannel, SignalingEvent};
