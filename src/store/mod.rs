//! Rendezvous store adapter.
//!
//! The store is a shared, reactive, tree-structured key/value service used
//! purely to exchange signaling messages, never audio. The trait captures the
//! contract the signaling layer needs: point reads, atomic multi-path writes,
//! value and child-added subscriptions, best-effort "run this write when I
//! disconnect" hooks, and an online/offline watch for membership repair.

pub mod memory;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, watch};

use crate::error::CallError;

pub use memory::MemoryStore;

/// Owned handle for one reactive subscription. Subscriptions are collected in
/// a set and drained on `leave()`/`close()` so no callback can fire against a
/// torn-down room.
#[derive(Debug)]
pub struct SubscriptionHandle {
    active: Arc<AtomicBool>,
}

impl SubscriptionHandle {
    pub fn new(active: Arc<AtomicBool>) -> Self {
        Self { active }
    }

    pub fn cancel(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

/// Handle for a registered disconnect-triggered write. Canceling disarms the
/// server-side action; the hook also disarms itself once it has fired.
#[derive(Debug)]
pub struct DisconnectGuard {
    armed: Arc<AtomicBool>,
}

impl DisconnectGuard {
    pub fn new(armed: Arc<AtomicBool>) -> Self {
        Self { armed }
    }

    pub fn cancel(&self) {
        self.armed.store(false, Ordering::SeqCst);
    }

    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::SeqCst)
    }
}

/// Abstract rendezvous store.
///
/// Paths are `/`-separated, e.g. `room/ABC234/members/alice`. Subscriptions
/// replay current state on attach: a value subscription immediately delivers
/// the value at the path (or `None`), a child-added subscription immediately
/// delivers every existing child. Snapshots for one subscription arrive in
/// write order; out-of-order delivery is the store's responsibility to
/// prevent.
#[async_trait]
pub trait RendezvousStore: Send + Sync {
    async fn get(&self, path: &str) -> Result<Option<Value>, CallError>;

    async fn set(&self, path: &str, value: Value) -> Result<(), CallError>;

    /// Atomic multi-path write. `None` deletes the path.
    async fn update(&self, writes: Vec<(String, Option<Value>)>) -> Result<(), CallError>;

    async fn remove(&self, path: &str) -> Result<(), CallError>;

    fn subscribe_value(
        &self,
        path: &str,
    ) -> (SubscriptionHandle, mpsc::UnboundedReceiver<Option<Value>>);

    /// Each delivered item is `(child key, child value)`.
    fn subscribe_child_added(
        &self,
        path: &str,
    ) -> (SubscriptionHandle, mpsc::UnboundedReceiver<(String, Value)>);

    /// Register a server-side removal of `path` to run when this client's
    /// transport drops. Fires on *transient* drops too, which is why the
    /// signaling layer repairs its membership after reconnecting.
    async fn on_disconnect_remove(&self, path: &str) -> Result<DisconnectGuard, CallError>;

    /// `true` while the client's realtime transport is up.
    fn watch_online(&self) -> watch::Receiver<bool>;
}

pub(crate) fn split_path(path: &str) -> Vec<String> {
    path.split('/')
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}
