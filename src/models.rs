use std::collections::HashMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Which side of the negotiation this participant is.
///
/// The role is fixed by who created the room: the offerer owns the room and
/// initiates every offer (including ICE restarts), the answerer only ever
/// responds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Offerer,
    Answerer,
}

/// A participant's entry under `room/{code}/members/{id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Member {
    pub role: Role,
    pub joined_at: String,
}

/// Room metadata as stored at `room/{code}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomInfo {
    pub created_at: String,
    pub created_by: String,
    #[serde(default)]
    pub members: HashMap<String, Member>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// An SDP offer or answer, stored in the room's single mutable `offer` /
/// `answer` slot. Overwritten wholesale on ICE restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

/// One connectivity option, appended under the sender's candidate stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
}

/// Connection lifecycle state, owned exclusively by the peer-connection
/// manager and derived from the primitive's native signal. There is no
/// terminal state; the machine can cycle until explicitly closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Idle enough to start a fresh negotiation.
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Disconnected)
    }
}

/// One voice-activity burst. Delivery is best-effort: no sequence numbers,
/// no reassembly, a dropped burst is a dropped word.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AudioPacket {
    /// Opaque encoded payload; the codec is the application's business.
    pub audio: Bytes,
    pub sample_rate: u32,
    pub channels: u16,
}
