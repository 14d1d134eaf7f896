//! Session driver: one actor loop per side.
//!
//! Everything that can happen to a call arrives here as a message — commands
//! from the embedding application, signaling events from the rendezvous
//! store, notifications from the peer-connection primitive, and the ICE
//! restart grace tick — and is applied to the signaling channel and the
//! connection state machine in arrival order. This is where the relays live:
//! local candidate → candidate stream, remote offer → answer, restart offer
//! → the same offer slot as an initial one.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::audio;
use crate::config::SessionConfig;
use crate::error::CallError;
use crate::events::{create_event_bus, EventReceiver, EventSender, SessionEvent};
use crate::models::{AudioPacket, ConnectionState, Role};
use crate::peer::{PeerConnection, PeerTransport, PeerTransportFactory, TransportEvent};
use crate::signaling::{SignalingChannel, SignalingEvent};
use crate::store::RendezvousStore;

/// Commands from the embedding application. Setup operations carry a reply
/// channel so `RoomNotFound`/`AlreadyJoined`/`NotAuthenticated` surface
/// synchronously to the caller.
#[derive(Debug)]
pub enum SessionCommand {
    CreateRoom {
        reply: oneshot::Sender<Result<String, CallError>>,
    },
    JoinRoom {
        code: String,
        reply: oneshot::Sender<Result<String, CallError>>,
    },
    SendAudio(AudioPacket),
    /// Mute is a capture-side concern: it gates outbound bursts locally and
    /// is not signaled to the partner.
    SetMuted(bool),
    Leave {
        reply: oneshot::Sender<()>,
    },
}

/// Handle for driving a session from the embedding application.
#[derive(Clone)]
pub struct SessionHandle {
    command_tx: mpsc::Sender<SessionCommand>,
}

impl SessionHandle {
    pub async fn create_room(&self) -> Result<String, CallError> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(SessionCommand::CreateRoom { reply: tx })
            .await
            .map_err(|_| CallError::Closed)?;
        rx.await.map_err(|_| CallError::Closed)?
    }

    pub async fn join_room(&self, code: &str) -> Result<String, CallError> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(SessionCommand::JoinRoom {
                code: code.to_string(),
                reply: tx,
            })
            .await
            .map_err(|_| CallError::Closed)?;
        rx.await.map_err(|_| CallError::Closed)?
    }

    pub async fn send_audio(&self, packet: AudioPacket) -> Result<(), CallError> {
        self.command_tx
            .send(SessionCommand::SendAudio(packet))
            .await
            .map_err(|_| CallError::Closed)
    }

    pub async fn set_muted(&self, muted: bool) -> Result<(), CallError> {
        self.command_tx
            .send(SessionCommand::SetMuted(muted))
            .await
            .map_err(|_| CallError::Closed)
    }

    pub async fn leave(&self) -> Result<(), CallError> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(SessionCommand::Leave { reply: tx })
            .await
            .map_err(|_| CallError::Closed)?;
        rx.await.map_err(|_| CallError::Closed)
    }
}

/// Spawn the session driver loop.
pub fn spawn_session(
    store: Arc<dyn RendezvousStore>,
    identity: Option<String>,
    transports: Arc<dyn PeerTransportFactory>,
    config: SessionConfig,
) -> (SessionHandle, EventReceiver) {
    let (command_tx, command_rx) = mpsc::channel(64);
    let (event_tx, event_rx) = create_event_bus();
    tokio::spawn(run_session(
        store, identity, transports, config, command_rx, event_tx,
    ));
    (SessionHandle { command_tx }, event_rx)
}

/// Run the session event loop. Exits when the command channel closes.
pub async fn run_session(
    store: Arc<dyn RendezvousStore>,
    identity: Option<String>,
    transports: Arc<dyn PeerTransportFactory>,
    config: SessionConfig,
    mut cmd_rx: mpsc::Receiver<SessionCommand>,
    event_tx: EventSender,
) {
    info!("session driver started");

    // Active-call state; all `Some` together once a room is entered.
    let mut signaling: Option<SignalingChannel> = None;
    let mut sig_rx: Option<mpsc::UnboundedReceiver<SignalingEvent>> = None;
    let mut conn: Option<PeerConnection> = None;
    let mut transport: Option<Arc<dyn PeerTransport>> = None;
    let mut transport_rx: Option<mpsc::UnboundedReceiver<TransportEvent>> = None;
    let mut tick_rx: Option<mpsc::UnboundedReceiver<()>> = None;
    let mut is_muted = false;
    let mut last_state = ConnectionState::Disconnected;

    macro_rules! teardown {
        () => {
            if let Some(mut pc) = conn.take() {
                pc.close().await;
            }
            if let Some(mut sc) = signaling.take() {
                if let Err(e) = sc.leave().await {
                    warn!("error leaving room: {e}");
                }
            }
            transport.take();
            transport_rx.take();
            sig_rx.take();
            tick_rx.take();
            is_muted = false;
            if last_state != ConnectionState::Disconnected {
                last_state = ConnectionState::Disconnected;
                let _ = event_tx.send(SessionEvent::ConnectionStateChanged { state: last_state });
            }
        };
    }

    macro_rules! sync_state {
        () => {
            if let Some(pc) = conn.as_ref() {
                if pc.state() != last_state {
                    last_state = pc.state();
                    let _ =
                        event_tx.send(SessionEvent::ConnectionStateChanged { state: last_state });
                }
            }
        };
    }

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else {
                    teardown!();
                    break;
                };
                match cmd {
                    SessionCommand::CreateRoom { reply } => {
                        teardown!();
                        match SignalingChannel::new(store.clone(), identity.clone()) {
                            Ok((mut sc, rx)) => match sc.create_room().await {
                                Ok(code) => match transports.create(&config).await {
                                    Ok((t, t_rx)) => {
                                        let (pc, ticks) = PeerConnection::new(
                                            t.clone(),
                                            Role::Offerer,
                                            config.restart_grace(),
                                        );
                                        signaling = Some(sc);
                                        sig_rx = Some(rx);
                                        conn = Some(pc);
                                        transport = Some(t);
                                        transport_rx = Some(t_rx);
                                        tick_rx = Some(ticks);
                                        let _ = event_tx
                                            .send(SessionEvent::RoomCreated { code: code.clone() });
                                        let _ = reply.send(Ok(code));
                                    }
                                    Err(e) => {
                                        // Don't leave an orphaned room behind.
                                        if let Err(le) = sc.leave().await {
                                            warn!("cleanup after transport failure failed: {le}");
                                        }
                                        let _ = reply.send(Err(e));
                                    }
                                },
                                Err(e) => {
                                    let _ = reply.send(Err(e));
                                }
                            },
                            Err(e) => {
                                let _ = reply.send(Err(e));
                            }
                        }
                    }

                    SessionCommand::JoinRoom { code, reply } => {
                        teardown!();
                        match SignalingChannel::new(store.clone(), identity.clone()) {
                            Ok((mut sc, rx)) => match sc.join_room(&code).await {
                                Ok(code) => match transports.create(&config).await {
                                    Ok((t, t_rx)) => {
                                        let (pc, ticks) = PeerConnection::new(
                                            t.clone(),
                                            Role::Answerer,
                                            config.restart_grace(),
                                        );
                                        signaling = Some(sc);
                                        sig_rx = Some(rx);
                                        conn = Some(pc);
                                        transport = Some(t);
                                        transport_rx = Some(t_rx);
                                        tick_rx = Some(ticks);
                                        let _ = event_tx
                                            .send(SessionEvent::RoomJoined { code: code.clone() });
                                        let _ = reply.send(Ok(code));
                                    }
                                    Err(e) => {
                                        if let Err(le) = sc.leave().await {
                                            warn!("cleanup after transport failure failed: {le}");
                                        }
                                        let _ = reply.send(Err(e));
                                    }
                                },
                                Err(e) => {
                                    let _ = reply.send(Err(e));
                                }
                            },
                            Err(e) => {
                                let _ = reply.send(Err(e));
                            }
                        }
                    }

                    SessionCommand::SendAudio(packet) => {
                        if is_muted {
                            continue;
                        }
                        if let Some(t) = transport.as_ref() {
                            if let Err(e) = t.send(audio::encode(&packet)).await {
                                debug!("failed to send audio burst: {e}");
                            }
                        }
                    }

                    SessionCommand::SetMuted(muted) => {
                        is_muted = muted;
                        info!("mute set to {muted}");
                    }

                    SessionCommand::Leave { reply } => {
                        teardown!();
                        let _ = reply.send(());
                    }
                }
            }

            Some(event) = async {
                if let Some(rx) = sig_rx.as_mut() {
                    rx.recv().await
                } else {
                    std::future::pending().await
                }
            } => {
                match event {
                    SignalingEvent::PartnerJoined => {
                        let _ = event_tx.send(SessionEvent::PartnerJoined);
                        // Only the offerer starts negotiation, and only from
                        // idle: a partner re-joining after a store blip must
                        // not trigger a duplicate offer mid-call.
                        if let (Some(pc), Some(sc)) = (conn.as_mut(), signaling.as_ref()) {
                            if pc.role() == Role::Offerer && pc.state().is_idle() {
                                match pc.create_offer().await {
                                    Ok(offer) => {
                                        if let Err(e) = sc.send_offer(&offer).await {
                                            error!("failed to publish offer: {e}");
                                        }
                                    }
                                    Err(e) => error!("failed to create offer: {e}"),
                                }
                            } else {
                                debug!(
                                    "partner joined while connection is {:?}; not re-negotiating",
                                    pc.state()
                                );
                            }
                        }
                        sync_state!();
                    }

                    SignalingEvent::PartnerLeft => {
                        let _ = event_tx.send(SessionEvent::PartnerLeft);
                    }

                    SignalingEvent::RoomDeleted => {
                        let _ = event_tx.send(SessionEvent::RoomDeleted);
                        teardown!();
                    }

                    SignalingEvent::OfferReceived(offer) => {
                        if let (Some(pc), Some(sc)) = (conn.as_mut(), signaling.as_ref()) {
                            match pc.handle_offer(offer).await {
                                Ok(answer) => {
                                    if let Err(e) = sc.send_answer(&answer).await {
                                        error!("failed to publish answer: {e}");
                                    }
                                }
                                Err(e) => error!("failed to handle offer: {e}"),
                            }
                        }
                        sync_state!();
                    }

                    SignalingEvent::AnswerReceived(answer) => {
                        if let Some(pc) = conn.as_mut() {
                            if let Err(e) = pc.handle_answer(answer).await {
                                error!("failed to handle answer: {e}");
                            }
                        }
                        sync_state!();
                    }

                    SignalingEvent::CandidateReceived(candidate) => {
                        if let Some(pc) = conn.as_mut() {
                            if let Err(e) = pc.add_remote_candidate(candidate).await {
                                debug!("failed to add remote candidate: {e}");
                            }
                        }
                    }
                }
            }

            Some(event) = async {
                if let Some(rx) = transport_rx.as_mut() {
                    rx.recv().await
                } else {
                    std::future::pending().await
                }
            } => {
                match event {
                    TransportEvent::StateChanged(native) => {
                        if let (Some(pc), Some(sc)) = (conn.as_mut(), signaling.as_ref()) {
                            match pc.handle_transport_state(native).await {
                                Ok(Some(restart_offer)) => {
                                    // Delivered exactly like an initial offer.
                                    if let Err(e) = sc.send_offer(&restart_offer).await {
                                        error!("failed to publish restart offer: {e}");
                                    }
                                }
                                Ok(None) => {}
                                Err(e) => warn!("transport state handling failed: {e}"),
                            }
                        }
                        sync_state!();
                    }

                    TransportEvent::LocalCandidate(candidate) => {
                        if let Some(sc) = signaling.as_ref() {
                            if let Err(e) = sc.send_ice_candidate(&candidate).await {
                                warn!("failed to publish ICE candidate: {e}");
                            }
                        }
                    }

                    TransportEvent::ChannelOpen => {
                        debug!("audio data channel open");
                    }

                    TransportEvent::Message(data) => {
                        let _ = event_tx.send(SessionEvent::AudioReceived(audio::decode(data)));
                    }
                }
            }

            Some(()) = async {
                if let Some(rx) = tick_rx.as_mut() {
                    rx.recv().await
                } else {
                    std::future::pending().await
                }
            } => {
                if let (Some(pc), Some(sc)) = (conn.as_mut(), signaling.as_ref()) {
                    match pc.restart_if_due().await {
                        Ok(Some(offer)) => {
                            if let Err(e) = sc.send_offer(&offer).await {
                                error!("failed to publish restart offer: {e}");
                            }
                        }
                        Ok(None) => {}
                        Err(e) => warn!("ICE restart attempt failed: {e}"),
                    }
                }
                sync_state!();
            }
        }
    }

    info!("session driver stopped");
}
