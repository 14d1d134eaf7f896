//! Turns the shared rendezvous store into a good-enough rendezvous for
//! exactly-two-party negotiation: room lifecycle, membership tracking, and
//! the offer/answer/candidate exchange.

use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::CallError;
use crate::models::{IceCandidate, Member, Role, RoomInfo, SdpKind, SessionDescription};
use crate::store::{DisconnectGuard, RendezvousStore, SubscriptionHandle};

use super::code::{generate_code, normalize_code};

/// Everything the signaling layer can tell the rest of the system.
#[derive(Debug, Clone)]
pub enum SignalingEvent {
    PartnerJoined,
    PartnerLeft,
    RoomDeleted,
    /// Covers both the initial offer and ICE-restart offers; the two are
    /// indistinguishable at this layer.
    OfferReceived(SessionDescription),
    AnswerReceived(SessionDescription),
    CandidateReceived(IceCandidate),
}

pub struct SignalingChannel {
    store: Arc<dyn RendezvousStore>,
    self_id: String,
    event_tx: mpsc::UnboundedSender<SignalingEvent>,
    role: Option<Role>,
    room_code: Option<String>,
    subs: Vec<SubscriptionHandle>,
    tasks: Vec<JoinHandle<()>>,
    /// Current disconnect hook; replaced by the repair task after the store
    /// transport cycles, canceled on explicit leave.
    disconnect_guard: Arc<Mutex<Option<DisconnectGuard>>>,
}

fn room_path(code: &str) -> String {
    format!("room/{code}")
}

fn members_path(code: &str) -> String {
    format!("room/{code}/members")
}

fn member_path(code: &str, id: &str) -> String {
    format!("room/{code}/members/{id}")
}

fn slot_path(code: &str, kind: SdpKind) -> String {
    match kind {
        SdpKind::Offer => format!("room/{code}/offer"),
        SdpKind::Answer => format!("room/{code}/answer"),
    }
}

/// The stream written by `producer`.
fn candidates_path(code: &str, producer: Role) -> String {
    match producer {
        Role::Offerer => format!("room/{code}/offerCandidates"),
        Role::Answerer => format!("room/{code}/answerCandidates"),
    }
}

impl SignalingChannel {
    /// The store handle and identity are passed in explicitly; there is no
    /// ambient global state, so concurrent sessions don't interfere.
    pub fn new(
        store: Arc<dyn RendezvousStore>,
        identity: Option<String>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SignalingEvent>), CallError> {
        let self_id = identity
            .filter(|id| !id.is_empty())
            .ok_or(CallError::NotAuthenticated)?;
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Ok((
            Self {
                store,
                self_id,
                event_tx,
                role: None,
                room_code: None,
                subs: Vec::new(),
                tasks: Vec::new(),
                disconnect_guard: Arc::new(Mutex::new(None)),
            },
            event_rx,
        ))
    }

    pub fn role(&self) -> Option<Role> {
        self.role
    }

    pub fn room_code(&self) -> Option<&str> {
        self.room_code.as_deref()
    }

    /// Create a fresh room with this participant as offerer. Returns the
    /// room code to hand to the other party.
    pub async fn create_room(&mut self) -> Result<String, CallError> {
        if self.room_code.is_some() {
            return Err(CallError::AlreadyJoined);
        }
        let mut code = generate_code();
        let mut attempts = 0;
        while self.store.get(&room_path(&code)).await?.is_some() {
            attempts += 1;
            if attempts > 4 {
                return Err(CallError::Store("room code space exhausted".into()));
            }
            code = generate_code();
        }

        let now = Utc::now().to_rfc3339();
        let member = Member {
            role: Role::Offerer,
            joined_at: now.clone(),
        };
        let base = room_path(&code);
        self.store
            .update(vec![
                (format!("{base}/createdAt"), Some(json!(now))),
                (format!("{base}/createdBy"), Some(json!(self.self_id))),
                (
                    member_path(&code, &self.self_id),
                    Some(encode(&member)?),
                ),
            ])
            .await?;

        self.arm_disconnect(&code).await?;
        self.start_watchers(&code, Role::Offerer);
        self.role = Some(Role::Offerer);
        self.room_code = Some(code.clone());
        info!("created room {code}");
        Ok(code)
    }

    /// Join an existing room as answerer. The code is case-insensitive.
    pub async fn join_room(&mut self, code: &str) -> Result<String, CallError> {
        if self.room_code.is_some() {
            return Err(CallError::AlreadyJoined);
        }
        let code = normalize_code(code).ok_or(CallError::RoomNotFound)?;
        let raw = self
            .store
            .get(&room_path(&code))
            .await?
            .ok_or(CallError::RoomNotFound)?;
        let room: RoomInfo =
            serde_json::from_value(raw).map_err(|e| CallError::Store(e.to_string()))?;
        if room.members.contains_key(&self.self_id) {
            return Err(CallError::AlreadyJoined);
        }
        debug!(
            "room {code} created by {} at {}",
            room.created_by, room.created_at
        );

        let member = Member {
            role: Role::Answerer,
            joined_at: Utc::now().to_rfc3339(),
        };
        self.store
            .set(&member_path(&code, &self.self_id), encode(&member)?)
            .await?;

        self.arm_disconnect(&code).await?;
        self.start_watchers(&code, Role::Answerer);
        self.role = Some(Role::Answerer);
        self.room_code = Some(code.clone());
        info!("joined room {code}");
        Ok(code)
    }

    pub async fn send_offer(&self, desc: &SessionDescription) -> Result<(), CallError> {
        self.role_gate(Role::Offerer, "send_offer")?;
        let code = self.current_code()?;
        self.store
            .set(&slot_path(code, SdpKind::Offer), encode(desc)?)
            .await
    }

    pub async fn send_answer(&self, desc: &SessionDescription) -> Result<(), CallError> {
        self.role_gate(Role::Answerer, "send_answer")?;
        let code = self.current_code()?;
        self.store
            .set(&slot_path(code, SdpKind::Answer), encode(desc)?)
            .await
    }

    /// Append a local candidate to this side's stream; the partner listens
    /// only to the stream it didn't produce.
    pub async fn send_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), CallError> {
        let Some(role) = self.role else {
            return Err(CallError::RoleViolation("send_ice_candidate"));
        };
        let code = self.current_code()?;
        let path = format!("{}/{}", candidates_path(code, role), Uuid::new_v4());
        self.store.set(&path, encode(candidate)?).await
    }

    /// The other member currently present, if any.
    pub async fn partner_id(&self) -> Result<Option<String>, CallError> {
        let Some(code) = self.room_code.as_deref() else {
            return Ok(None);
        };
        let Some(raw) = self.store.get(&members_path(code)).await? else {
            return Ok(None);
        };
        let Some(members) = raw.as_object() else {
            return Ok(None);
        };
        Ok(members.keys().find(|id| id.as_str() != self.self_id).cloned())
    }

    /// Tear down: drain every subscription and watcher task first, then
    /// cancel the disconnect hook (cleanup is explicit now), then remove
    /// self — the offerer owns the room and deletes it entirely.
    pub async fn leave(&mut self) -> Result<(), CallError> {
        for sub in self.subs.drain(..) {
            sub.cancel();
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
        if let Some(guard) = self.disconnect_guard.lock().unwrap().take() {
            guard.cancel();
        }
        let (Some(role), Some(code)) = (self.role.take(), self.room_code.take()) else {
            return Ok(());
        };
        info!("leaving room {code}");
        match role {
            Role::Offerer => self.store.remove(&room_path(&code)).await,
            Role::Answerer => self.store.remove(&member_path(&code, &self.self_id)).await,
        }
    }

    fn role_gate(&self, required: Role, op: &'static str) -> Result<(), CallError> {
        if self.role == Some(required) {
            Ok(())
        } else {
            Err(CallError::RoleViolation(op))
        }
    }

    fn current_code(&self) -> Result<&str, CallError> {
        self.room_code.as_deref().ok_or(CallError::RoomNotFound)
    }

    /// Register the server-side removal of our own member entry — never the
    /// whole room, which would strand the other party on a transient drop.
    async fn arm_disconnect(&self, code: &str) -> Result<(), CallError> {
        let guard = self
            .store
            .on_disconnect_remove(&member_path(code, &self.self_id))
            .await?;
        *self.disconnect_guard.lock().unwrap() = Some(guard);
        Ok(())
    }

    fn start_watchers(&mut self, code: &str, role: Role) {
        self.spawn_membership_watcher(code);
        // Listen to the slot and stream the other side writes.
        match role {
            Role::Offerer => {
                self.spawn_slot_watcher(code, SdpKind::Answer);
                self.spawn_candidate_watcher(code, Role::Answerer);
            }
            Role::Answerer => {
                self.spawn_slot_watcher(code, SdpKind::Offer);
                self.spawn_candidate_watcher(code, Role::Offerer);
            }
        }
        self.spawn_reconnect_repair(code, role);
    }

    /// Partner presence is derived from membership *count* transitions, not
    /// identity diffing — the map is mutated by both sides and by the
    /// store's disconnect mechanism, with last-writer-wins races.
    fn spawn_membership_watcher(&mut self, code: &str) {
        let (handle, mut rx) = self.store.subscribe_value(&members_path(code));
        self.subs.push(handle);
        let store = self.store.clone();
        let tx = self.event_tx.clone();
        let room = room_path(code);
        self.tasks.push(tokio::spawn(async move {
            let mut partner_seen = false;
            let mut prev_count = 0usize;
            while let Some(snapshot) = rx.recv().await {
                let count = snapshot
                    .as_ref()
                    .and_then(Value::as_object)
                    .map_or(0, |m| m.len());
                if count >= 2 {
                    if prev_count < 2 {
                        debug!("membership reached {count}: partner joined");
                        let _ = tx.send(SignalingEvent::PartnerJoined);
                    }
                    partner_seen = true;
                } else if count == 0 {
                    // Everyone gone, including us: distinguish a deleted room
                    // (unrecoverable) from a membership blip.
                    match store.get(&room).await {
                        Ok(None) => {
                            info!("room no longer exists");
                            let _ = tx.send(SignalingEvent::RoomDeleted);
                        }
                        Ok(Some(_)) => {
                            if partner_seen && prev_count >= 2 {
                                let _ = tx.send(SignalingEvent::PartnerLeft);
                            }
                        }
                        Err(e) => warn!("room existence re-check failed: {e}"),
                    }
                } else if partner_seen && prev_count >= 2 {
                    debug!("membership dropped to {count}: partner left");
                    let _ = tx.send(SignalingEvent::PartnerLeft);
                }
                prev_count = count;
            }
        }));
    }

    fn spawn_slot_watcher(&mut self, code: &str, kind: SdpKind) {
        let (handle, mut rx) = self.store.subscribe_value(&slot_path(code, kind));
        self.subs.push(handle);
        let tx = self.event_tx.clone();
        self.tasks.push(tokio::spawn(async move {
            while let Some(snapshot) = rx.recv().await {
                // The slot starts empty; skip until something is written.
                let Some(value) = snapshot else { continue };
                match serde_json::from_value::<SessionDescription>(value) {
                    Ok(desc) => {
                        let event = match kind {
                            SdpKind::Offer => SignalingEvent::OfferReceived(desc),
                            SdpKind::Answer => SignalingEvent::AnswerReceived(desc),
                        };
                        let _ = tx.send(event);
                    }
                    Err(e) => warn!("malformed {kind:?} slot ignored: {e}"),
                }
            }
        }));
    }

    fn spawn_candidate_watcher(&mut self, code: &str, producer: Role) {
        let (handle, mut rx) = self
            .store
            .subscribe_child_added(&candidates_path(code, producer));
        self.subs.push(handle);
        let tx = self.event_tx.clone();
        self.tasks.push(tokio::spawn(async move {
            while let Some((_key, value)) = rx.recv().await {
                match serde_json::from_value::<IceCandidate>(value) {
                    Ok(candidate) => {
                        let _ = tx.send(SignalingEvent::CandidateReceived(candidate));
                    }
                    Err(e) => warn!("malformed candidate entry ignored: {e}"),
                }
            }
        }));
    }

    /// The disconnect hook fires on *transient* transport drops too, which
    /// would make the room believe we left. Once the transport comes back,
    /// re-write our member entry and re-arm the hook.
    fn spawn_reconnect_repair(&mut self, code: &str, role: Role) {
        let mut online = self.store.watch_online();
        let store = self.store.clone();
        let guard_slot = self.disconnect_guard.clone();
        let path = member_path(code, &self.self_id);
        self.tasks.push(tokio::spawn(async move {
            let mut was_online = *online.borrow();
            while online.changed().await.is_ok() {
                let now_online = *online.borrow();
                if now_online && !was_online {
                    info!("store transport restored; repairing membership");
                    let member = Member {
                        role,
                        joined_at: Utc::now().to_rfc3339(),
                    };
                    match serde_json::to_value(&member) {
                        Ok(value) => {
                            if let Err(e) = store.set(&path, value).await {
                                warn!("membership repair write failed: {e}");
                            }
                        }
                        Err(e) => warn!("membership repair encode failed: {e}"),
                    }
                    match store.on_disconnect_remove(&path).await {
                        Ok(guard) => *guard_slot.lock().unwrap() = Some(guard),
                        Err(e) => warn!("re-registering disconnect hook failed: {e}"),
                    }
                }
                was_online = now_online;
            }
        }));
    }
}

fn encode<T: serde::Serialize>(value: &T) -> Result<Value, CallError> {
    serde_json::to_value(value).map_err(|e| CallError::Store(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::time::Duration;

    fn channel(
        store: &Arc<MemoryStore>,
        id: &str,
    ) -> (SignalingChannel, mpsc::UnboundedReceiver<SignalingEvent>) {
        let store: Arc<dyn RendezvousStore> = store.clone();
        SignalingChannel::new(store, Some(id.to_string())).unwrap()
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<SignalingEvent>) -> SignalingEvent {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for signaling event")
            .expect("event channel closed")
    }

    #[test]
    fn missing_identity_is_not_authenticated() {
        let store: Arc<dyn RendezvousStore> = Arc::new(MemoryStore::new());
        assert!(matches!(
            SignalingChannel::new(store.clone(), None),
            Err(CallError::NotAuthenticated)
        ));
        assert!(matches!(
            SignalingChannel::new(store, Some(String::new())),
            Err(CallError::NotAuthenticated)
        ));
    }

    #[tokio::test]
    async fn join_nonexistent_room_fails() {
        let store = Arc::new(MemoryStore::new());
        let (mut bob, _rx) = channel(&store, "bob");
        assert!(matches!(
            bob.join_room("ABC234").await,
            Err(CallError::RoomNotFound)
        ));
        // A failed join must not create the room.
        assert!(store.get("room/ABC234").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn join_is_case_insensitive() {
        let store = Arc::new(MemoryStore::new());
        let (mut alice, _a_rx) = channel(&store, "alice");
        let code = alice.create_room().await.unwrap();

        let (mut bob, _b_rx) = channel(&store, "bob");
        let joined = bob.join_room(&code.to_lowercase()).await.unwrap();
        assert_eq!(joined, code);
        assert_eq!(bob.partner_id().await.unwrap().as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn same_identity_cannot_join_twice() {
        let store = Arc::new(MemoryStore::new());
        let (mut alice, _a_rx) = channel(&store, "alice");
        let code = alice.create_room().await.unwrap();

        let (mut bob, _b_rx) = channel(&store, "bob");
        bob.join_room(&code).await.unwrap();

        // Same account, second device.
        let (mut bob2, _b2_rx) = channel(&store, "bob");
        assert!(matches!(
            bob2.join_room(&code).await,
            Err(CallError::AlreadyJoined)
        ));
    }

    #[tokio::test]
    async fn partner_presence_events_fire_in_order() {
        let store = Arc::new(MemoryStore::new());
        let (mut alice, mut a_rx) = channel(&store, "alice");
        let code = alice.create_room().await.unwrap();

        let (mut bob, mut b_rx) = channel(&store, "bob");
        bob.join_room(&code).await.unwrap();

        assert!(matches!(recv(&mut a_rx).await, SignalingEvent::PartnerJoined));
        assert!(matches!(recv(&mut b_rx).await, SignalingEvent::PartnerJoined));

        bob.leave().await.unwrap();
        assert!(matches!(recv(&mut a_rx).await, SignalingEvent::PartnerLeft));
    }

    #[tokio::test]
    async fn no_partner_left_before_partner_joined() {
        let store = Arc::new(MemoryStore::new());
        let (mut alice, mut a_rx) = channel(&store, "alice");
        alice.create_room().await.unwrap();

        // Our own entry vanishes on a transport drop; no partner was ever
        // present, so nothing should fire.
        store.simulate_disconnect();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(a_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn offerer_leave_deletes_the_room() {
        let store = Arc::new(MemoryStore::new());
        let (mut alice, _a_rx) = channel(&store, "alice");
        let code = alice.create_room().await.unwrap();

        let (mut bob, mut b_rx) = channel(&store, "bob");
        bob.join_room(&code).await.unwrap();
        assert!(matches!(recv(&mut b_rx).await, SignalingEvent::PartnerJoined));

        alice.leave().await.unwrap();
        assert!(matches!(recv(&mut b_rx).await, SignalingEvent::RoomDeleted));

        let (mut carol, _c_rx) = channel(&store, "carol");
        assert!(matches!(
            carol.join_room(&code).await,
            Err(CallError::RoomNotFound)
        ));
    }

    #[tokio::test]
    async fn negotiation_messages_reach_the_other_side() {
        let store = Arc::new(MemoryStore::new());
        let (mut alice, mut a_rx) = channel(&store, "alice");
        let code = alice.create_room().await.unwrap();
        let (mut bob, mut b_rx) = channel(&store, "bob");
        bob.join_room(&code).await.unwrap();
        assert!(matches!(recv(&mut a_rx).await, SignalingEvent::PartnerJoined));
        assert!(matches!(recv(&mut b_rx).await, SignalingEvent::PartnerJoined));

        alice
            .send_offer(&SessionDescription {
                kind: SdpKind::Offer,
                sdp: "v=0 offer".into(),
            })
            .await
            .unwrap();
        let SignalingEvent::OfferReceived(offer) = recv(&mut b_rx).await else {
            panic!("expected offer");
        };
        assert_eq!(offer.sdp, "v=0 offer");

        bob.send_answer(&SessionDescription {
            kind: SdpKind::Answer,
            sdp: "v=0 answer".into(),
        })
        .await
        .unwrap();
        let SignalingEvent::AnswerReceived(answer) = recv(&mut a_rx).await else {
            panic!("expected answer");
        };
        assert_eq!(answer.sdp, "v=0 answer");

        alice
            .send_ice_candidate(&IceCandidate {
                candidate: "candidate:1".into(),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
            })
            .await
            .unwrap();
        let SignalingEvent::CandidateReceived(candidate) = recv(&mut b_rx).await else {
            panic!("expected candidate");
        };
        assert_eq!(candidate.candidate, "candidate:1");
    }

    #[tokio::test]
    async fn wrong_role_writes_are_violations() {
        let store = Arc::new(MemoryStore::new());
        let (mut alice, _a_rx) = channel(&store, "alice");
        let code = alice.create_room().await.unwrap();
        let (mut bob, _b_rx) = channel(&store, "bob");
        bob.join_room(&code).await.unwrap();

        let desc = SessionDescription {
            kind: SdpKind::Offer,
            sdp: "v=0".into(),
        };
        assert!(matches!(
            bob.send_offer(&desc).await,
            Err(CallError::RoleViolation(_))
        ));
        assert!(matches!(
            alice.send_answer(&desc).await,
            Err(CallError::RoleViolation(_))
        ));
    }

    #[tokio::test]
    async fn transient_disconnect_is_repaired() {
        let store = Arc::new(MemoryStore::new());
        let (mut alice, _a_rx) = channel(&store, "alice");
        let code = alice.create_room().await.unwrap();
        let member = format!("room/{code}/members/alice");

        store.simulate_disconnect();
        assert!(store.get(&member).await.unwrap().is_none());

        store.simulate_reconnect();
        // The repair task runs asynchronously; poll briefly.
        let mut repaired = false;
        for _ in 0..50 {
            if store.get(&member).await.unwrap().is_some() {
                repaired = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(repaired, "member entry was not re-created after reconnect");

        // The hook must be re-armed too: a second drop removes the entry again.
        // (Give the repair task a moment to finish re-arming after the write.)
        tokio::time::sleep(Duration::from_millis(50)).await;
        store.simulate_disconnect();
        assert!(store.get(&member).await.unwrap().is_none());
    }
}
