//! In-process implementation of the rendezvous store contract.
//!
//! Backs tests and loopback sessions. `simulate_disconnect` /
//! `simulate_reconnect` model the realtime transport cycling, which fires the
//! registered disconnect hooks server-side exactly like the hosted store.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, watch};

use crate::error::CallError;

use super::{split_path, DisconnectGuard, RendezvousStore, SubscriptionHandle};

struct ValueSub {
    path: Vec<String>,
    active: Arc<AtomicBool>,
    tx: mpsc::UnboundedSender<Option<Value>>,
}

struct ChildSub {
    path: Vec<String>,
    active: Arc<AtomicBool>,
    seen: HashSet<String>,
    tx: mpsc::UnboundedSender<(String, Value)>,
}

struct DisconnectEntry {
    path: Vec<String>,
    armed: Arc<AtomicBool>,
}

struct Inner {
    root: Value,
    value_subs: Vec<ValueSub>,
    child_subs: Vec<ChildSub>,
    disconnect_removes: Vec<DisconnectEntry>,
}

pub struct MemoryStore {
    inner: Mutex<Inner>,
    online_tx: watch::Sender<bool>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (online_tx, _) = watch::channel(true);
        Self {
            inner: Mutex::new(Inner {
                root: Value::Object(Map::new()),
                value_subs: Vec::new(),
                child_subs: Vec::new(),
                disconnect_removes: Vec::new(),
            }),
            online_tx,
        }
    }

    /// Drop the realtime transport: flips the online watch and fires every
    /// armed disconnect hook, consuming it.
    pub fn simulate_disconnect(&self) {
        self.online_tx.send_replace(false);
        let mut inner = self.inner.lock().unwrap();
        let entries: Vec<DisconnectEntry> = inner.disconnect_removes.drain(..).collect();
        let mut changed = Vec::new();
        for entry in entries {
            if entry.armed.swap(false, Ordering::SeqCst) {
                remove_node(&mut inner.root, &entry.path);
                changed.push(entry.path);
            }
        }
        notify(&mut inner, &changed);
    }

    pub fn simulate_reconnect(&self) {
        self.online_tx.send_replace(true);
    }
}

#[async_trait]
impl RendezvousStore for MemoryStore {
    async fn get(&self, path: &str) -> Result<Option<Value>, CallError> {
        let inner = self.inner.lock().unwrap();
        Ok(get_node(&inner.root, &split_path(path)).cloned())
    }

    async fn set(&self, path: &str, value: Value) -> Result<(), CallError> {
        let mut inner = self.inner.lock().unwrap();
        let path = split_path(path);
        set_node(&mut inner.root, &path, value);
        notify(&mut inner, std::slice::from_ref(&path));
        Ok(())
    }

    async fn update(&self, writes: Vec<(String, Option<Value>)>) -> Result<(), CallError> {
        let mut inner = self.inner.lock().unwrap();
        let mut changed = Vec::with_capacity(writes.len());
        for (path, value) in writes {
            let path = split_path(&path);
            match value {
                Some(v) => set_node(&mut inner.root, &path, v),
                None => remove_node(&mut inner.root, &path),
            }
            changed.push(path);
        }
        notify(&mut inner, &changed);
        Ok(())
    }

    async fn remove(&self, path: &str) -> Result<(), CallError> {
        let mut inner = self.inner.lock().unwrap();
        let path = split_path(path);
        remove_node(&mut inner.root, &path);
        notify(&mut inner, std::slice::from_ref(&path));
        Ok(())
    }

    fn subscribe_value(
        &self,
        path: &str,
    ) -> (SubscriptionHandle, mpsc::UnboundedReceiver<Option<Value>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let active = Arc::new(AtomicBool::new(true));
        let mut inner = self.inner.lock().unwrap();
        let path = split_path(path);
        // Replay current state on attach.
        let _ = tx.send(get_node(&inner.root, &path).cloned());
        inner.value_subs.push(ValueSub {
            path,
            active: active.clone(),
            tx,
        });
        (SubscriptionHandle::new(active), rx)
    }

    fn subscribe_child_added(
        &self,
        path: &str,
    ) -> (SubscriptionHandle, mpsc::UnboundedReceiver<(String, Value)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let active = Arc::new(AtomicBool::new(true));
        let mut inner = self.inner.lock().unwrap();
        let path = split_path(path);
        let mut seen = HashSet::new();
        if let Some(children) = get_node(&inner.root, &path).and_then(Value::as_object) {
            for (key, value) in children {
                seen.insert(key.clone());
                let _ = tx.send((key.clone(), value.clone()));
            }
        }
        inner.child_subs.push(ChildSub {
            path,
            active: active.clone(),
            seen,
            tx,
        });
        (SubscriptionHandle::new(active), rx)
    }

    async fn on_disconnect_remove(&self, path: &str) -> Result<DisconnectGuard, CallError> {
        let armed = Arc::new(AtomicBool::new(true));
        let mut inner = self.inner.lock().unwrap();
        inner.disconnect_removes.push(DisconnectEntry {
            path: split_path(path),
            armed: armed.clone(),
        });
        Ok(DisconnectGuard::new(armed))
    }

    fn watch_online(&self) -> watch::Receiver<bool> {
        self.online_tx.subscribe()
    }
}

fn get_node<'a>(root: &'a Value, path: &[String]) -> Option<&'a Value> {
    let mut cur = root;
    for seg in path {
        cur = cur.as_object()?.get(seg)?;
    }
    Some(cur)
}

fn set_node(root: &mut Value, path: &[String], value: Value) {
    if path.is_empty() {
        *root = value;
        return;
    }
    if !root.is_object() {
        *root = Value::Object(Map::new());
    }
    if let Some(map) = root.as_object_mut() {
        if path.len() == 1 {
            map.insert(path[0].clone(), value);
        } else {
            let child = map
                .entry(path[0].clone())
                .or_insert_with(|| Value::Object(Map::new()));
            set_node(child, &path[1..], value);
        }
    }
}

fn remove_node(root: &mut Value, path: &[String]) {
    if path.is_empty() {
        *root = Value::Object(Map::new());
        return;
    }
    let Some(map) = root.as_object_mut() else {
        return;
    };
    if path.len() == 1 {
        map.remove(&path[0]);
    } else if let Some(child) = map.get_mut(&path[0]) {
        remove_node(child, &path[1..]);
    }
}

/// A write at M affects a subscription at P when either path is a prefix of
/// the other.
fn overlaps(a: &[String], b: &[String]) -> bool {
    a.iter().zip(b.iter()).all(|(x, y)| x == y)
}

fn notify(inner: &mut Inner, changed: &[Vec<String>]) {
    let Inner {
        root,
        value_subs,
        child_subs,
        ..
    } = inner;

    value_subs.retain(|sub| sub.active.load(Ordering::SeqCst) && !sub.tx.is_closed());
    for sub in value_subs.iter() {
        if changed.iter().any(|c| overlaps(&sub.path, c)) {
            let _ = sub.tx.send(get_node(root, &sub.path).cloned());
        }
    }

    child_subs.retain(|sub| sub.active.load(Ordering::SeqCst) && !sub.tx.is_closed());
    for sub in child_subs.iter_mut() {
        if changed.iter().any(|c| overlaps(&sub.path, c)) {
            if let Some(children) = get_node(root, &sub.path).and_then(Value::as_object) {
                for (key, value) in children {
                    if sub.seen.insert(key.clone()) {
                        let _ = sub.tx.send((key.clone(), value.clone()));
                    }
                }
            }
        }
    }
}
