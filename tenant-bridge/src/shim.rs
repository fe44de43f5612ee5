//! Synchronous key/value storage over the asynchronous bridge
//!
//! [`CachedStorage`] keeps an in-context mirror of the tenant's records so the
//! [`SyncStorage`] calls can answer immediately. Mutations are applied to the
//! mirror first and persisted in the background, in call order, by a single
//! persister task. A failed persist puts back the last value known to be
//! persisted, unless a later mutation has touched the same key since.
//!
//! ```text
//! set_item ──► mirror (immediate) ──► op queue ──► persister ──► TenantBridge
//!                  ▲                                   │
//!                  └──────────── rollback on error ◄───┘
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

use crate::bridge::TenantBridge;

/// Web-storage style container with synchronous semantics
pub trait SyncStorage {
    fn get_item(&self, key: &str) -> Option<String>;
    fn set_item(&self, key: &str, value: &str);
    fn remove_item(&self, key: &str);
    fn clear(&self);
    /// Key at position `index` in key order
    fn key(&self, index: usize) -> Option<String>;
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    fn keys(&self) -> Vec<String>;
}

/// Pending background operation. `seq` orders it against other mutations.
enum Op {
    Set { key: String, raw: String, seq: u64 },
    Remove { key: String, seq: u64 },
    Clear { seq: u64 },
    Flush(oneshot::Sender<()>),
}

#[derive(Default)]
struct CacheState {
    entries: BTreeMap<String, String>,
    /// What the host is known to hold: the initial snapshot plus confirmed ops
    persisted: BTreeMap<String, String>,
    loaded: bool,
    /// Sequence number of the last mutation per key
    touched: HashMap<String, u64>,
    /// Sequence number of the last clear
    last_clear: u64,
    seq: u64,
}

impl CacheState {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    /// Whether state from before mutation `seq` may be put back for `key`
    fn may_restore(&self, key: &str, seq: u64) -> bool {
        self.last_clear <= seq && self.touched.get(key).map_or(true, |t| *t <= seq)
    }

    /// Roll `key` back to its persisted value after mutation `seq` failed
    fn roll_back(&mut self, key: &str, seq: u64) {
        if !self.may_restore(key, seq) {
            return;
        }
        match self.persisted.get(key) {
            Some(value) => self.entries.insert(key.to_string(), value.clone()),
            None => self.entries.remove(key),
        };
    }
}

/// Cache-then-confirm [`SyncStorage`] backed by a [`TenantBridge`]
#[derive(Clone)]
pub struct CachedStorage {
    state: Arc<Mutex<CacheState>>,
    ops: mpsc::UnboundedSender<Op>,
    loaded: watch::Receiver<bool>,
}

impl CachedStorage {
    /// Start mirroring the bridge's tenant. The initial load runs in the
    /// background; see [`CachedStorage::ready`]. Must be called within a
    /// Tokio runtime.
    pub fn attach(bridge: TenantBridge) -> Self {
        let state = Arc::new(Mutex::new(CacheState::default()));
        let (ops, rx) = mpsc::unbounded_channel();
        let (loaded_tx, loaded) = watch::channel(false);

        let persister = Persister { bridge, state: state.clone() };
        tokio::spawn(persister.run(rx, loaded_tx));

        Self { state, ops, loaded }
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enqueue(&self, op: Op) {
        if self.ops.send(op).is_err() {
            warn!("storage persister stopped; change kept in cache only");
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.lock().loaded
    }

    /// Wait for the initial load to finish (successfully or not)
    pub async fn ready(&self) {
        let mut loaded = self.loaded.clone();
        let _ = loaded.wait_for(|done| *done).await;
    }

    /// Wait until every mutation issued so far has been persisted or rolled back
    pub async fn settle(&self) {
        let (tx, rx) = oneshot::channel();
        self.enqueue(Op::Flush(tx));
        let _ = rx.await;
    }
}

impl SyncStorage for CachedStorage {
    fn get_item(&self, key: &str) -> Option<String> {
        let state = self.lock();
        if !state.loaded {
            warn!("storage cache not loaded yet; get_item({}) returns nothing", key);
            return None;
        }
        state.entries.get(key).cloned()
    }

    fn set_item(&self, key: &str, value: &str) {
        let op = {
            let mut state = self.lock();
            let seq = state.next_seq();
            state.touched.insert(key.to_string(), seq);
            state.entries.insert(key.to_string(), value.to_string());
            Op::Set { key: key.to_string(), raw: value.to_string(), seq }
        };
        self.enqueue(op);
    }

    fn remove_item(&self, key: &str) {
        let op = {
            let mut state = self.lock();
            let seq = state.next_seq();
            state.touched.insert(key.to_string(), seq);
            state.entries.remove(key);
            Op::Remove { key: key.to_string(), seq }
        };
        self.enqueue(op);
    }

    fn clear(&self) {
        let op = {
            let mut state = self.lock();
            let seq = state.next_seq();
            for key in std::mem::take(&mut state.entries).into_keys() {
                state.touched.insert(key, seq);
            }
            state.last_clear = seq;
            Op::Clear { seq }
        };
        self.enqueue(op);
    }

    fn key(&self, index: usize) -> Option<String> {
        self.lock().entries.keys().nth(index).cloned()
    }

    fn len(&self) -> usize {
        self.lock().entries.len()
    }

    fn keys(&self) -> Vec<String> {
        self.lock().entries.keys().cloned().collect()
    }
}

struct Persister {
    bridge: TenantBridge,
    state: Arc<Mutex<CacheState>>,
}

impl Persister {
    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn run(self, mut rx: mpsc::UnboundedReceiver<Op>, loaded: watch::Sender<bool>) {
        self.load().await;
        loaded.send_replace(true);

        while let Some(op) = rx.recv().await {
            match op {
                Op::Set { key, raw, seq } => {
                    let result = self.bridge.set_item(&key, raw_to_value(&raw)).await;
                    let mut state = self.lock();
                    match result {
                        Ok(_) => {
                            state.persisted.insert(key, raw);
                        }
                        Err(e) => {
                            warn!("Failed to persist {}: {}; rolling back", key, e);
                            state.roll_back(&key, seq);
                        }
                    }
                }
                Op::Remove { key, seq } => {
                    let result = self.bridge.remove_item(&key).await;
                    let mut state = self.lock();
                    match result {
                        Ok(_) => {
                            state.persisted.remove(&key);
                        }
                        Err(e) => {
                            warn!("Failed to remove {}: {}; rolling back", key, e);
                            state.roll_back(&key, seq);
                        }
                    }
                }
                Op::Clear { seq } => {
                    let result = self.bridge.clear().await;
                    let mut state = self.lock();
                    match result {
                        Ok(_) => state.persisted.clear(),
                        Err(e) => {
                            warn!("Failed to clear storage: {}; rolling back", e);
                            let keys: Vec<String> = state.persisted.keys().cloned().collect();
                            for key in keys {
                                state.roll_back(&key, seq);
                            }
                        }
                    }
                }
                Op::Flush(done) => {
                    let _ = done.send(());
                }
            }
        }
    }

    /// Merge the persisted snapshot into keys not mutated since attach
    async fn load(&self) {
        let snapshot = self.bridge.get_all_data().await;
        let mut state = self.lock();
        match snapshot {
            Ok(data) => {
                let total = data.len();
                for (key, record) in data {
                    let raw = value_to_raw(record.value);
                    // Keys mutated or cleared since attach keep their local state
                    if !state.touched.contains_key(&key) && state.last_clear == 0 {
                        state.entries.insert(key.clone(), raw.clone());
                    }
                    state.persisted.insert(key, raw);
                }
                debug!("storage cache loaded with {} record(s)", total);
            }
            Err(e) => warn!("Failed to load storage cache: {}", e),
        }
        state.loaded = true;
    }
}

/// Map a stored string to the JSON value it is persisted as. Text that is the
/// canonical JSON encoding of a non-string value is stored as that value;
/// anything else is stored as a JSON string.
pub fn raw_to_value(raw: &str) -> serde_json::Value {
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(value) if !value.is_string() && value.to_string() == raw => value,
        _ => serde_json::Value::String(raw.to_string()),
    }
}

/// Inverse of [`raw_to_value`]
pub fn value_to_raw(value: serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s,
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_canonical_json_is_stored_as_value() {
        assert_eq!(raw_to_value("42"), json!(42));
        assert_eq!(raw_to_value("true"), json!(true));
        assert_eq!(raw_to_value("null"), json!(null));
        assert_eq!(raw_to_value(r#"{"a":1,"b":[1,2]}"#), json!({"a": 1, "b": [1, 2]}));
    }

    #[test]
    fn test_non_canonical_text_is_stored_as_string() {
        for raw in ["hello", "1e5", "{ \"a\": 1 }", r#"{"b":1,"a":2}"#, "\"quoted\"", "007", ""] {
            assert_eq!(raw_to_value(raw), json!(raw), "{:?}", raw);
        }
    }

    #[test]
    fn test_every_string_round_trips() {
        for raw in ["42", "hello", "1e5", "\"quoted\"", "[1,2]", "[1, 2]", "", "null", "-0"] {
            assert_eq!(value_to_raw(raw_to_value(raw)), raw);
        }
    }

    #[test]
    fn test_may_restore_respects_later_mutations() {
        let mut state = CacheState::default();
        let first = state.next_seq();
        state.touched.insert("k".into(), first);
        assert!(state.may_restore("k", first));

        let second = state.next_seq();
        state.touched.insert("k".into(), second);
        assert!(!state.may_restore("k", first));

        let clear = state.next_seq();
        state.last_clear = clear;
        assert!(!state.may_restore("other", second));
        assert!(state.may_restore("other", clear));
    }
}
