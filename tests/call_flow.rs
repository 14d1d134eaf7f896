//! End-to-end call scenarios: two session drivers sharing one in-process
//! rendezvous store, with a loopback transport pair standing in for the
//! WebRTC stack.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use talkr::peer::{LoopbackTransport, PeerTransport, PeerTransportFactory, TransportEvent};
use talkr::session::SessionHandle;
use talkr::signaling::code::CODE_ALPHABET;
use talkr::{
    spawn_session, AudioPacket, CallError, ConnectionState, EventReceiver, MemoryStore,
    RendezvousStore, SessionConfig, SessionEvent,
};

/// Hands out pre-built transport halves, one per room entry.
struct ScriptedTransports {
    queue: Mutex<VecDeque<(Arc<dyn PeerTransport>, mpsc::UnboundedReceiver<TransportEvent>)>>,
}

impl ScriptedTransports {
    fn with(
        half: (Arc<LoopbackTransport>, mpsc::UnboundedReceiver<TransportEvent>),
    ) -> Arc<Self> {
        let (transport, rx) = half;
        Arc::new(Self {
            queue: Mutex::new(VecDeque::from([(
                transport as Arc<dyn PeerTransport>,
                rx,
            )])),
        })
    }

    fn empty() -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(VecDeque::new()),
        })
    }
}

#[async_trait]
impl PeerTransportFactory for ScriptedTransports {
    async fn create(
        &self,
        _config: &SessionConfig,
    ) -> Result<(Arc<dyn PeerTransport>, mpsc::UnboundedReceiver<TransportEvent>), CallError> {
        self.queue
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| CallError::Transport("no scripted transport available".into()))
    }
}

fn test_config() -> SessionConfig {
    SessionConfig {
        ice_servers: Vec::new(),
        restart_grace_ms: 100,
    }
}

struct Side {
    handle: SessionHandle,
    events: EventReceiver,
    transport: Arc<LoopbackTransport>,
}

/// Two sessions over one store, wired to the two halves of a loopback link.
fn linked_sessions(store: &Arc<MemoryStore>) -> (Side, Side) {
    let _ = tracing_subscriber::fmt::try_init();
    let (half_a, half_b) = LoopbackTransport::pair();
    let transport_a = half_a.0.clone();
    let transport_b = half_b.0.clone();

    let store_a: Arc<dyn RendezvousStore> = store.clone();
    let (handle_a, events_a) = spawn_session(
        store_a,
        Some("alice".into()),
        ScriptedTransports::with(half_a),
        test_config(),
    );
    let store_b: Arc<dyn RendezvousStore> = store.clone();
    let (handle_b, events_b) = spawn_session(
        store_b,
        Some("bob".into()),
        ScriptedTransports::with(half_b),
        test_config(),
    );

    (
        Side {
            handle: handle_a,
            events: events_a,
            transport: transport_a,
        },
        Side {
            handle: handle_b,
            events: events_b,
            transport: transport_b,
        },
    )
}

async fn wait_for(
    rx: &mut EventReceiver,
    what: &str,
    mut pred: impl FnMut(&SessionEvent) -> bool,
) -> SessionEvent {
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match tokio::time::timeout(remaining, rx.recv()).await {
            Ok(Ok(event)) => {
                if pred(&event) {
                    return event;
                }
            }
            Ok(Err(e)) => panic!("event bus closed while waiting for {what}: {e}"),
            Err(_) => panic!("timed out waiting for {what}"),
        }
    }
}

async fn wait_connected(rx: &mut EventReceiver, who: &str) {
    wait_for(rx, &format!("{who} connected"), |e| {
        matches!(
            e,
            SessionEvent::ConnectionStateChanged {
                state: ConnectionState::Connected
            }
        )
    })
    .await;
}

#[tokio::test]
async fn full_call_flow_reaches_connected_and_carries_audio() {
    let store = Arc::new(MemoryStore::new());
    let (mut alice, mut bob) = linked_sessions(&store);

    let code = alice.handle.create_room().await.unwrap();
    assert_eq!(code.len(), 6);
    assert!(code.chars().all(|c| CODE_ALPHABET.contains(c)));

    // Codes are case-insensitive on entry.
    bob.handle.join_room(&code.to_lowercase()).await.unwrap();

    wait_for(&mut alice.events, "alice partner joined", |e| {
        matches!(e, SessionEvent::PartnerJoined)
    })
    .await;
    wait_for(&mut bob.events, "bob partner joined", |e| {
        matches!(e, SessionEvent::PartnerJoined)
    })
    .await;

    // Offer/answer flow runs without further prompting.
    wait_connected(&mut alice.events, "alice").await;
    wait_connected(&mut bob.events, "bob").await;
    assert_eq!(alice.transport.offer_log(), vec![false]);
    assert!(bob.transport.offer_log().is_empty());

    // Audio metadata survives the trip; nothing gets defaulted.
    bob.handle
        .send_audio(AudioPacket {
            audio: Bytes::from_static(b"burst"),
            sample_rate: 44_100,
            channels: 2,
        })
        .await
        .unwrap();
    let event = wait_for(&mut alice.events, "audio at alice", |e| {
        matches!(e, SessionEvent::AudioReceived(_))
    })
    .await;
    let SessionEvent::AudioReceived(packet) = event else {
        unreachable!()
    };
    assert_eq!(packet.sample_rate, 44_100);
    assert_eq!(packet.channels, 2);
    assert_eq!(&packet.audio[..], b"burst");
}

#[tokio::test]
async fn join_with_unknown_code_fails_fast() {
    let store = Arc::new(MemoryStore::new());
    let store_dyn: Arc<dyn RendezvousStore> = store.clone();
    let (handle, _events) = spawn_session(
        store_dyn,
        Some("carol".into()),
        ScriptedTransports::empty(),
        test_config(),
    );

    assert!(matches!(
        handle.join_room("ZZZZZZ").await,
        Err(CallError::RoomNotFound)
    ));
    // The failed join must not have created the room.
    assert!(store.get("room/ZZZZZZ").await.unwrap().is_none());
}

#[tokio::test]
async fn interruption_past_grace_restarts_from_the_offerer_only() {
    let store = Arc::new(MemoryStore::new());
    let (mut alice, mut bob) = linked_sessions(&store);

    let code = alice.handle.create_room().await.unwrap();
    bob.handle.join_room(&code).await.unwrap();
    wait_connected(&mut alice.events, "alice").await;
    wait_connected(&mut bob.events, "bob").await;

    // Screen lock: both primitives report disconnected and stay that way.
    alice.transport.interrupt();

    wait_for(&mut alice.events, "alice reconnecting", |e| {
        matches!(
            e,
            SessionEvent::ConnectionStateChanged {
                state: ConnectionState::Reconnecting
            }
        )
    })
    .await;

    // Past the grace window the offerer restarts; the restart offer travels
    // the normal offer path and the call re-establishes.
    wait_connected(&mut alice.events, "alice (after restart)").await;
    wait_connected(&mut bob.events, "bob (after restart)").await;

    assert_eq!(alice.transport.offer_log(), vec![false, true]);
    assert!(
        bob.transport.offer_log().is_empty(),
        "the answerer must never generate an offer"
    );
}

#[tokio::test]
async fn interruption_healed_within_grace_never_restarts() {
    let store = Arc::new(MemoryStore::new());
    let (mut alice, mut bob) = linked_sessions(&store);

    let code = alice.handle.create_room().await.unwrap();
    bob.handle.join_room(&code).await.unwrap();
    wait_connected(&mut alice.events, "alice").await;
    wait_connected(&mut bob.events, "bob").await;

    alice.transport.interrupt();
    tokio::time::sleep(Duration::from_millis(20)).await;
    alice.transport.restore();

    wait_connected(&mut alice.events, "alice (after self-heal)").await;
    // Give any stray restart timer a chance to misfire before checking.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(
        alice.transport.offer_log(),
        vec![false],
        "a drop that healed within the grace window must not restart ICE"
    );
}

#[tokio::test]
async fn offerer_leave_deletes_the_room_for_everyone() {
    let store = Arc::new(MemoryStore::new());
    let (alice, mut bob) = linked_sessions(&store);

    let code = alice.handle.create_room().await.unwrap();
    bob.handle.join_room(&code).await.unwrap();
    wait_for(&mut bob.events, "bob partner joined", |e| {
        matches!(e, SessionEvent::PartnerJoined)
    })
    .await;

    alice.handle.leave().await.unwrap();

    wait_for(&mut bob.events, "bob room deleted", |e| {
        matches!(e, SessionEvent::RoomDeleted)
    })
    .await;
    assert!(store.get(&format!("room/{code}")).await.unwrap().is_none());

    // A third party reading the room afterwards sees no room at all.
    let store_dyn: Arc<dyn RendezvousStore> = store.clone();
    let (carol, _events) = spawn_session(
        store_dyn,
        Some("carol".into()),
        ScriptedTransports::empty(),
        test_config(),
    );
    assert!(matches!(
        carol.join_room(&code).await,
        Err(CallError::RoomNotFound)
    ));
}

#[tokio::test]
async fn muted_side_sends_nothing() {
    let store = Arc::new(MemoryStore::new());
    let (mut alice, mut bob) = linked_sessions(&store);

    let code = alice.handle.create_room().await.unwrap();
    bob.handle.join_room(&code).await.unwrap();
    wait_connected(&mut alice.events, "alice").await;
    wait_connected(&mut bob.events, "bob").await;

    alice.handle.set_muted(true).await.unwrap();
    alice
        .handle
        .send_audio(AudioPacket {
            audio: Bytes::from_static(b"should not arrive"),
            sample_rate: 48_000,
            channels: 1,
        })
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    while let Ok(event) = bob.events.try_recv() {
        assert!(
            !matches!(event, SessionEvent::AudioReceived(_)),
            "muted audio burst leaked through"
        );
    }
}
