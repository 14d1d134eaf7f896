//! In-process transport pair.
//!
//! Two halves of a link that "negotiate" instantly: once both sides hold a
//! remote description the link reports connected and data-channel messages
//! flow directly between the halves. Tests use the knobs (`interrupt`,
//! `restore`, `fail`) to script the native-state sequences a real WebRTC
//! stack would produce across screen locks and network blips.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::CallError;
use crate::models::{IceCandidate, SdpKind, SessionDescription};

use super::transport::{PeerTransport, TransportEvent, TransportState};

struct SideState {
    tx: mpsc::UnboundedSender<TransportEvent>,
    state: TransportState,
    remote: Option<SessionDescription>,
    applied: Vec<IceCandidate>,
    /// One entry per created offer; `true` marks an ICE-restart offer.
    offers: Vec<bool>,
    channel_created: bool,
}

impl SideState {
    fn new(tx: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self {
            tx,
            state: TransportState::New,
            remote: None,
            applied: Vec::new(),
            offers: Vec::new(),
            channel_created: false,
        }
    }
}

struct LinkInner {
    sides: [SideState; 2],
    connected: bool,
}

pub struct LoopbackTransport {
    link: Arc<Mutex<LinkInner>>,
    idx: usize,
}

type Half = (Arc<LoopbackTransport>, mpsc::UnboundedReceiver<TransportEvent>);

impl LoopbackTransport {
    pub fn pair() -> (Half, Half) {
        let (tx0, rx0) = mpsc::unbounded_channel();
        let (tx1, rx1) = mpsc::unbounded_channel();
        let link = Arc::new(Mutex::new(LinkInner {
            sides: [SideState::new(tx0), SideState::new(tx1)],
            connected: false,
        }));
        (
            (Arc::new(Self { link: link.clone(), idx: 0 }), rx0),
            (Arc::new(Self { link, idx: 1 }), rx1),
        )
    }

    /// Candidates applied to this half, in application order.
    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.link.lock().unwrap().sides[self.idx].applied.clone()
    }

    /// Restart flags of every offer this half has created.
    pub fn offer_log(&self) -> Vec<bool> {
        self.link.lock().unwrap().sides[self.idx].offers.clone()
    }

    /// Both sides report `disconnected`, as on a screen lock or brief
    /// connectivity loss.
    pub fn interrupt(&self) {
        let mut inner = self.link.lock().unwrap();
        inner.connected = false;
        for side in inner.sides.iter_mut() {
            side.state = TransportState::Disconnected;
            let _ = side
                .tx
                .send(TransportEvent::StateChanged(TransportState::Disconnected));
        }
    }

    /// The drop self-heals: both sides report `connected` again.
    pub fn restore(&self) {
        let mut inner = self.link.lock().unwrap();
        inner.connected = true;
        for side in inner.sides.iter_mut() {
            side.state = TransportState::Connected;
            let _ = side
                .tx
                .send(TransportEvent::StateChanged(TransportState::Connected));
        }
    }

    /// This half's primitive gives up entirely.
    pub fn fail(&self) {
        let mut inner = self.link.lock().unwrap();
        inner.connected = false;
        let side = &mut inner.sides[self.idx];
        side.state = TransportState::Failed;
        let _ = side
            .tx
            .send(TransportEvent::StateChanged(TransportState::Failed));
    }
}

fn establish(inner: &mut LinkInner) {
    if inner.sides[0].remote.is_some() && inner.sides[1].remote.is_some() {
        inner.connected = true;
        let channel = inner.sides.iter().any(|s| s.channel_created);
        for side in inner.sides.iter_mut() {
            side.state = TransportState::Connected;
            let _ = side
                .tx
                .send(TransportEvent::StateChanged(TransportState::Connected));
            if channel {
                let _ = side.tx.send(TransportEvent::ChannelOpen);
            }
        }
    }
}

#[async_trait]
impl PeerTransport for LoopbackTransport {
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, CallError> {
        let mut inner = self.link.lock().unwrap();
        let side = &mut inner.sides[self.idx];
        side.offers.push(ice_restart);
        Ok(SessionDescription {
            kind: SdpKind::Offer,
            sdp: format!("v=0 loopback offer {}", side.offers.len()),
        })
    }

    async fn create_answer(&self) -> Result<SessionDescription, CallError> {
        let inner = self.link.lock().unwrap();
        if inner.sides[self.idx].remote.is_none() {
            return Err(CallError::Transport(
                "create_answer before remote description".into(),
            ));
        }
        Ok(SessionDescription {
            kind: SdpKind::Answer,
            sdp: "v=0 loopback answer".into(),
        })
    }

    async fn set_local_description(&self, _desc: SessionDescription) -> Result<(), CallError> {
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), CallError> {
        let mut inner = self.link.lock().unwrap();
        inner.sides[self.idx].remote = Some(desc);
        establish(&mut inner);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), CallError> {
        let mut inner = self.link.lock().unwrap();
        let side = &mut inner.sides[self.idx];
        if side.remote.is_none() {
            return Err(CallError::Transport(
                "candidate added before remote description".into(),
            ));
        }
        side.applied.push(candidate);
        Ok(())
    }

    async fn create_data_channel(&self) -> Result<(), CallError> {
        let mut inner = self.link.lock().unwrap();
        inner.sides[self.idx].channel_created = true;
        Ok(())
    }

    async fn send(&self, payload: Bytes) -> Result<(), CallError> {
        let inner = self.link.lock().unwrap();
        if !inner.connected {
            return Err(CallError::Transport("link not connected".into()));
        }
        let _ = inner.sides[1 - self.idx]
            .tx
            .send(TransportEvent::Message(payload));
        Ok(())
    }

    async fn close(&self) -> Result<(), CallError> {
        let mut inner = self.link.lock().unwrap();
        inner.connected = false;
        inner.sides[self.idx].state = TransportState::Closed;
        let other = &mut inner.sides[1 - self.idx];
        if other.state != TransportState::Closed {
            other.state = TransportState::Disconnected;
            let _ = other
                .tx
                .send(TransportEvent::StateChanged(TransportState::Disconnected));
        }
        Ok(())
    }

    fn connection_state(&self) -> TransportState {
        self.link.lock().unwrap().sides[self.idx].state
    }
}
