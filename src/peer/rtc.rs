//! `PeerTransport` backed by the `webrtc` crate.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::config::SessionConfig;
use crate::error::CallError;
use crate::models::{IceCandidate, SdpKind, SessionDescription};

use super::transport::{PeerTransport, PeerTransportFactory, TransportEvent, TransportState};

/// Exactly one data channel is ever active per connection.
pub const AUDIO_CHANNEL_LABEL: &str = "audio";

pub struct RtcTransport {
    pc: Arc<RTCPeerConnection>,
    /// Created by the offerer, received by the answerer; either way at most
    /// one at a time.
    data_channel: Arc<Mutex<Option<Arc<RTCDataChannel>>>>,
    /// Cache of the last native state report, so a scheduled ICE restart can
    /// re-probe without an async round trip.
    native_state: Arc<Mutex<TransportState>>,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
}

impl RtcTransport {
    pub async fn connect(
        config: &SessionConfig,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<TransportEvent>), CallError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(transport_err)?;

        let mut registry = Registry::new();
        registry =
            register_default_interceptors(registry, &mut media_engine).map_err(transport_err)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: config.ice_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        };

        let pc = Arc::new(api.new_peer_connection(rtc_config).await.map_err(transport_err)?);
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let transport = Arc::new(Self {
            pc: pc.clone(),
            data_channel: Arc::new(Mutex::new(None)),
            native_state: Arc::new(Mutex::new(TransportState::New)),
            event_tx: event_tx.clone(),
        });

        let state_cache = transport.native_state.clone();
        let tx = event_tx.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let mapped = map_state(state);
            info!("peer connection state: {state}");
            *state_cache.lock().unwrap() = mapped;
            let _ = tx.send(TransportEvent::StateChanged(mapped));
            Box::pin(async {})
        }));

        let tx = event_tx.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let tx = tx.clone();
            Box::pin(async move {
                if let Some(candidate) = candidate {
                    match candidate.to_json() {
                        Ok(init) => {
                            let _ = tx.send(TransportEvent::LocalCandidate(from_init(init)));
                        }
                        Err(e) => warn!("failed to serialize local ICE candidate: {e}"),
                    }
                }
            })
        }));

        // The answering side receives the channel instead of creating one.
        let slot = transport.data_channel.clone();
        let tx = event_tx.clone();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let slot = slot.clone();
            let tx = tx.clone();
            Box::pin(async move {
                if dc.label() == AUDIO_CHANNEL_LABEL {
                    info!("received data channel '{}'", dc.label());
                    attach_channel(&dc, &tx);
                    *slot.lock().unwrap() = Some(dc);
                } else {
                    debug!("ignoring unexpected data channel '{}'", dc.label());
                }
            })
        }));

        Ok((transport, event_rx))
    }
}

fn attach_channel(dc: &Arc<RTCDataChannel>, event_tx: &mpsc::UnboundedSender<TransportEvent>) {
    let tx = event_tx.clone();
    dc.on_open(Box::new(move || {
        let _ = tx.send(TransportEvent::ChannelOpen);
        Box::pin(async {})
    }));
    let tx = event_tx.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let _ = tx.send(TransportEvent::Message(msg.data));
        Box::pin(async {})
    }));
}

#[async_trait]
impl PeerTransport for RtcTransport {
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, CallError> {
        let options = ice_restart.then(|| RTCOfferOptions {
            ice_restart: true,
            ..Default::default()
        });
        let offer = self.pc.create_offer(options).await.map_err(transport_err)?;
        from_rtc(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, CallError> {
        let answer = self.pc.create_answer(None).await.map_err(transport_err)?;
        from_rtc(answer)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), CallError> {
        self.pc
            .set_local_description(to_rtc(&desc)?)
            .await
            .map_err(transport_err)
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), CallError> {
        self.pc
            .set_remote_description(to_rtc(&desc)?)
            .await
            .map_err(transport_err)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), CallError> {
        self.pc
            .add_ice_candidate(to_init(candidate))
            .await
            .map_err(transport_err)
    }

    async fn create_data_channel(&self) -> Result<(), CallError> {
        let init = RTCDataChannelInit {
            ordered: Some(false),
            max_retransmits: Some(0),
            ..Default::default()
        };
        let dc = self
            .pc
            .create_data_channel(AUDIO_CHANNEL_LABEL, Some(init))
            .await
            .map_err(transport_err)?;
        attach_channel(&dc, &self.event_tx);
        *self.data_channel.lock().unwrap() = Some(dc);
        Ok(())
    }

    async fn send(&self, payload: Bytes) -> Result<(), CallError> {
        let dc = self
            .data_channel
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| CallError::Transport("no open data channel".into()))?;
        dc.send(&payload).await.map(|_| ()).map_err(transport_err)
    }

    async fn close(&self) -> Result<(), CallError> {
        let dc = self.data_channel.lock().unwrap().take();
        if let Some(dc) = dc {
            if let Err(e) = dc.close().await {
                debug!("error closing data channel: {e}");
            }
        }
        self.pc.close().await.map_err(transport_err)
    }

    fn connection_state(&self) -> TransportState {
        *self.native_state.lock().unwrap()
    }
}

/// Default factory: one fresh WebRTC peer connection per negotiation.
pub struct RtcTransportFactory;

#[async_trait]
impl PeerTransportFactory for RtcTransportFactory {
    async fn create(
        &self,
        config: &SessionConfig,
    ) -> Result<(Arc<dyn PeerTransport>, mpsc::UnboundedReceiver<TransportEvent>), CallError> {
        let (transport, rx) = RtcTransport::connect(config).await?;
        Ok((transport as Arc<dyn PeerTransport>, rx))
    }
}

fn map_state(state: RTCPeerConnectionState) -> TransportState {
    match state {
        RTCPeerConnectionState::New | RTCPeerConnectionState::Unspecified => TransportState::New,
        RTCPeerConnectionState::Connecting => TransportState::Connecting,
        RTCPeerConnectionState::Connected => TransportState::Connected,
        RTCPeerConnectionState::Disconnected => TransportState::Disconnected,
        RTCPeerConnectionState::Failed => TransportState::Failed,
        RTCPeerConnectionState::Closed => TransportState::Closed,
    }
}

fn to_rtc(desc: &SessionDescription) -> Result<RTCSessionDescription, CallError> {
    match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp.clone()),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp.clone()),
    }
    .map_err(transport_err)
}

fn from_rtc(desc: RTCSessionDescription) -> Result<SessionDescription, CallError> {
    let kind = match desc.sdp_type {
        RTCSdpType::Offer => SdpKind::Offer,
        RTCSdpType::Answer => SdpKind::Answer,
        other => {
            return Err(CallError::Transport(format!(
                "unexpected sdp type {other:?}"
            )))
        }
    };
    Ok(SessionDescription {
        kind,
        sdp: desc.sdp,
    })
}

fn to_init(candidate: IceCandidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_mline_index,
        username_fragment: None,
    }
}

fn from_init(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
    }
}

fn transport_err<E: std::fmt::Display>(e: E) -> CallError {
    CallError::Transport(e.to_string())
}
