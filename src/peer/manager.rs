//! Peer-connection lifecycle state machine.
//!
//! States cycle `disconnected → connecting → connected → reconnecting →
//! failed` with no terminal state; the machine runs until explicitly closed.
//! The one piece of time-based behavior lives here: a dropped connection
//! gets a grace window to self-heal before the offering side initiates an
//! ICE restart.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::CallError;
use crate::models::{ConnectionState, IceCandidate, Role, SessionDescription};

use super::transport::{PeerTransport, TransportState};

pub struct PeerConnection {
    transport: Arc<dyn PeerTransport>,
    role: Role,
    state: ConnectionState,
    restart_grace: Duration,
    /// Candidates that arrived before the remote description, in arrival
    /// order. Flushed in that order immediately after the description lands.
    pending_candidates: Vec<IceCandidate>,
    have_remote_description: bool,
    restart_timer: Option<JoinHandle<()>>,
    tick_tx: mpsc::UnboundedSender<()>,
}

impl PeerConnection {
    /// The returned receiver fires when a scheduled restart comes due; the
    /// driver answers it with `restart_if_due`.
    pub fn new(
        transport: Arc<dyn PeerTransport>,
        role: Role,
        restart_grace: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<()>) {
        let (tick_tx, tick_rx) = mpsc::unbounded_channel();
        (
            Self {
                transport,
                role,
                state: ConnectionState::Disconnected,
                restart_grace,
                pending_candidates: Vec::new(),
                have_remote_description: false,
                restart_timer: None,
                tick_tx,
            },
            tick_rx,
        )
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Start a fresh negotiation: open the data channel (unordered, no
    /// retransmits — audio favors recency over completeness) and produce
    /// the initial offer.
    pub async fn create_offer(&mut self) -> Result<SessionDescription, CallError> {
        if self.role != Role::Offerer {
            return Err(CallError::RoleViolation("create_offer"));
        }
        self.transport.create_data_channel().await?;
        let offer = self.transport.create_offer(false).await?;
        self.transport.set_local_description(offer.clone()).await?;
        self.set_state(ConnectionState::Connecting);
        Ok(offer)
    }

    /// Handle an inbound offer and produce the answer. Initial offers and
    /// ICE-restart offers arrive through this one path and are handled
    /// identically.
    pub async fn handle_offer(
        &mut self,
        offer: SessionDescription,
    ) -> Result<SessionDescription, CallError> {
        self.transport.set_remote_description(offer).await?;
        self.have_remote_description = true;
        self.flush_pending().await?;
        let answer = self.transport.create_answer().await?;
        self.transport.set_local_description(answer.clone()).await?;
        self.set_state(ConnectionState::Connecting);
        Ok(answer)
    }

    pub async fn handle_answer(&mut self, answer: SessionDescription) -> Result<(), CallError> {
        self.transport.set_remote_description(answer).await?;
        self.have_remote_description = true;
        self.flush_pending().await
    }

    /// Candidates arriving before the remote description are buffered, never
    /// dropped.
    pub async fn add_remote_candidate(&mut self, candidate: IceCandidate) -> Result<(), CallError> {
        if self.have_remote_description {
            self.transport.add_ice_candidate(candidate).await
        } else {
            debug!("buffering candidate until remote description is set");
            self.pending_candidates.push(candidate);
            Ok(())
        }
    }

    /// Feed a native state report into the machine. Returns a restart offer
    /// when one was initiated (on `failed`, as a last resort) that the
    /// caller must deliver through the normal offer channel.
    pub async fn handle_transport_state(
        &mut self,
        native: TransportState,
    ) -> Result<Option<SessionDescription>, CallError> {
        match native {
            TransportState::Connected => {
                self.cancel_restart_timer();
                self.set_state(ConnectionState::Connected);
                Ok(None)
            }
            TransportState::Disconnected => {
                // Brief drops (screen lock, tab backgrounding) often
                // self-heal; wait out the grace window before restarting.
                self.set_state(ConnectionState::Reconnecting);
                self.schedule_restart();
                Ok(None)
            }
            TransportState::Failed => {
                self.cancel_restart_timer();
                self.set_state(ConnectionState::Failed);
                self.try_restart().await
            }
            TransportState::Closed => {
                self.cancel_restart_timer();
                self.set_state(ConnectionState::Disconnected);
                Ok(None)
            }
            TransportState::New | TransportState::Connecting => Ok(None),
        }
    }

    /// Answer a grace-timer tick. No-op if the connection self-healed while
    /// we waited, or if this side is not the restart initiator.
    pub async fn restart_if_due(&mut self) -> Result<Option<SessionDescription>, CallError> {
        if self.state != ConnectionState::Reconnecting {
            return Ok(None);
        }
        if self.transport.connection_state() == TransportState::Connected {
            debug!("connection self-healed within grace window; skipping ICE restart");
            return Ok(None);
        }
        self.try_restart().await
    }

    /// Idempotent teardown: cancels the timer, clears the candidate queue,
    /// closes the channel and primitive.
    pub async fn close(&mut self) {
        self.cancel_restart_timer();
        self.pending_candidates.clear();
        self.have_remote_description = false;
        if let Err(e) = self.transport.close().await {
            warn!("error closing peer transport: {e}");
        }
        self.state = ConnectionState::Disconnected;
    }

    /// Restart needs exactly one initiator; the role fixed at room creation
    /// decides. The answering side only ever reacts to the fresh offer
    /// arriving through the normal offer channel.
    async fn try_restart(&mut self) -> Result<Option<SessionDescription>, CallError> {
        if self.role != Role::Offerer {
            return Ok(None);
        }
        info!("initiating ICE restart");
        let offer = self.transport.create_offer(true).await?;
        self.transport.set_local_description(offer.clone()).await?;
        Ok(Some(offer))
    }

    async fn flush_pending(&mut self) -> Result<(), CallError> {
        for candidate in std::mem::take(&mut self.pending_candidates) {
            self.transport.add_ice_candidate(candidate).await?;
        }
        Ok(())
    }

    fn schedule_restart(&mut self) {
        self.cancel_restart_timer();
        let tick_tx = self.tick_tx.clone();
        let grace = self.restart_grace;
        self.restart_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let _ = tick_tx.send(());
        }));
    }

    fn cancel_restart_timer(&mut self) {
        if let Some(timer) = self.restart_timer.take() {
            timer.abort();
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            debug!("connection state {:?} -> {:?}", self.state, state);
            self.state = state;
        }
    }
}
