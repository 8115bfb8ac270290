//! Last-writer-wins key→value overlay.
//!
//! Entries `{key, val, ts, actor}` live as elements of one shared array;
//! element order carries no meaning. Per key, the entry with the largest
//! `(ts, actor)` pair wins. Local writes remove superseded entries inside
//! the writing transaction; competing entries arriving from peers are
//! cleaned up by a follow-up `merge` transaction, so every replica
//! converges to the same single live entry per key.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use yrs::{Any, Array, ArrayRef, ReadTxn, TransactionMut};

use crate::clock;
use crate::keys::ActorId;
use crate::substrate::{any_to_json, json_to_any, out_as_any, CommitOrigin, Substrate};

const FIELD_KEY: &str = "key";
const FIELD_VAL: &str = "val";
const FIELD_TS: &str = "ts";
const FIELD_ACTOR: &str = "actor";

/// One live entry as seen by readers.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryRecord {
    pub val: Value,
    pub ts: i64,
    pub actor: ActorId,
}

impl EntryRecord {
    /// LWW ordering rule: larger `(ts, actor)` pair wins.
    fn beats(&self, other: &EntryRecord) -> bool {
        (self.ts, self.actor.as_str()) > (other.ts, other.actor.as_str())
    }
}

/// Net effect on one key within one transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum KeyChange {
    Add { new: Value },
    Update { old: Value, new: Value },
    Delete { old: Value },
}

impl KeyChange {
    pub fn new_value(&self) -> Option<&Value> {
        match self {
            Self::Add { new } | Self::Update { new, .. } => Some(new),
            Self::Delete { .. } => None,
        }
    }
}

/// Keyed change set delivered to observers, one per transaction.
pub type ChangeSet = BTreeMap<String, KeyChange>;

type ObserverFn = Arc<dyn Fn(&ChangeSet, CommitOrigin) + Send + Sync>;

/// Identifier returned by [`YkvStore::observe`]; pass to `unobserve`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObserverId(u64);

struct YkvInner {
    substrate: Substrate,
    array: ArrayRef,
    array_name: String,
    shadow: Mutex<BTreeMap<String, EntryRecord>>,
    observers: Mutex<Vec<(u64, ObserverFn)>>,
    next_observer_id: AtomicU64,
    resolving: AtomicBool,
    hook_id: AtomicU64,
}

impl Drop for YkvInner {
    fn drop(&mut self) {
        self.substrate
            .remove_post_commit_hook(self.hook_id.load(Ordering::SeqCst));
    }
}

/// LWW map over one shared array. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct YkvStore {
    inner: Arc<YkvInner>,
}

impl YkvStore {
    /// Open (or create) the overlay for a named shared array. Besides
    /// backing tables and KV settings, this is usable directly as a
    /// bespoke flat store with caller-chosen keys.
    pub fn open(substrate: &Substrate, array_name: &str) -> Self {
        let array = substrate.array(array_name);
        let inner = Arc::new(YkvInner {
            substrate: substrate.clone(),
            array,
            array_name: array_name.to_string(),
            shadow: Mutex::new(BTreeMap::new()),
            observers: Mutex::new(Vec::new()),
            next_observer_id: AtomicU64::new(0),
            resolving: AtomicBool::new(false),
            hook_id: AtomicU64::new(0),
        });
        *inner.shadow.lock() = inner.read_map();

        let weak = Arc::downgrade(&inner);
        let hook_id = substrate.add_post_commit_hook(move |origin| {
            if let Some(inner) = weak.upgrade() {
                YkvInner::after_commit(&inner, origin);
            }
        });
        inner.hook_id.store(hook_id, Ordering::SeqCst);

        Self { inner }
    }

    pub(crate) fn substrate(&self) -> &Substrate {
        &self.inner.substrate
    }

    pub fn array_name(&self) -> &str {
        &self.inner.array_name
    }

    /// Write `key`. Removes every superseded entry and appends the new one
    /// in a single transaction.
    pub fn set(&self, key: &str, val: Value) {
        self.inner
            .substrate
            .transact(CommitOrigin::Local, |txn| self.set_tx(txn, key, val));
    }

    /// Remove every entry for `key`. The removal tombstones are all peers
    /// need to converge; no marker entry is appended.
    pub fn delete(&self, key: &str) {
        self.inner
            .substrate
            .transact(CommitOrigin::Local, |txn| {
                self.delete_tx(txn, key);
            });
    }

    /// Value of the live entry, if any.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.entry(key).map(|e| e.val)
    }

    /// Live entry with its LWW metadata, if any.
    pub fn entry(&self, key: &str) -> Option<EntryRecord> {
        self.inner.substrate.read(|txn| {
            let mut winner: Option<EntryRecord> = None;
            for (_, entry_key, entry) in self.inner.scan(txn) {
                if entry_key != key {
                    continue;
                }
                match &winner {
                    Some(current) if !entry.beats(current) => {}
                    _ => winner = Some(entry),
                }
            }
            winner
        })
    }

    pub fn has(&self, key: &str) -> bool {
        self.entry(key).is_some()
    }

    /// Snapshot of all live entries, keyed.
    pub fn map(&self) -> BTreeMap<String, EntryRecord> {
        self.inner.read_map()
    }

    /// Subscribe to per-transaction change sets. Changes are grouped by
    /// key and coalesced; the callback also receives the commit origin.
    pub fn observe<F>(&self, cb: F) -> ObserverId
    where
        F: Fn(&ChangeSet, CommitOrigin) + Send + Sync + 'static,
    {
        let id = self.inner.next_observer_id.fetch_add(1, Ordering::SeqCst);
        self.inner.observers.lock().push((id, Arc::new(cb)));
        ObserverId(id)
    }

    pub fn unobserve(&self, id: ObserverId) {
        self.inner.observers.lock().retain(|(i, _)| *i != id.0);
    }

    // Transaction-scoped operations for batching callers.

    pub(crate) fn set_tx(&self, txn: &mut TransactionMut, key: &str, val: Value) {
        self.set_entry_tx(txn, key, val, clock::now_millis());
    }

    pub(crate) fn set_entry_tx(&self, txn: &mut TransactionMut, key: &str, val: Value, ts: i64) {
        self.remove_key_tx(txn, key);
        let entry = encode_entry(key, &val, ts, self.inner.substrate.actor());
        self.inner.array.push_back(txn, entry);
    }

    pub(crate) fn delete_tx(&self, txn: &mut TransactionMut, key: &str) -> bool {
        self.remove_key_tx(txn, key)
    }

    /// Keys of every entry visible inside an active transaction.
    /// Callers mid-transaction must use this instead of [`Self::map`],
    /// which opens its own read transaction.
    pub(crate) fn keys_tx<T: ReadTxn>(&self, txn: &T) -> Vec<String> {
        self.inner
            .scan(txn)
            .into_iter()
            .map(|(_, key, _)| key)
            .collect()
    }

    /// Remove every element of the array. The array itself persists.
    pub(crate) fn clear_tx(&self, txn: &mut TransactionMut) {
        let len = self.inner.array.len(&*txn);
        if len > 0 {
            self.inner.array.remove_range(txn, 0, len);
        }
    }

    pub fn clear(&self) {
        self.inner
            .substrate
            .transact(CommitOrigin::Local, |txn| self.clear_tx(txn));
    }

    fn remove_key_tx(&self, txn: &mut TransactionMut, key: &str) -> bool {
        let mut indices: Vec<u32> = Vec::new();
        for (idx, entry_key, _) in self.inner.scan(&*txn) {
            if entry_key == key {
                indices.push(idx);
            }
        }
        let removed = !indices.is_empty();
        for idx in indices.into_iter().rev() {
            self.inner.array.remove(txn, idx);
        }
        removed
    }
}

impl YkvInner {
    /// Decode every array element, skipping anything that is not an entry.
    fn scan<T: ReadTxn>(&self, txn: &T) -> Vec<(u32, String, EntryRecord)> {
        let mut entries = Vec::with_capacity(self.array.len(txn) as usize);
        for (idx, out) in self.array.iter(txn).enumerate() {
            match out_as_any(&out).and_then(decode_entry) {
                Some((key, entry)) => entries.push((idx as u32, key, entry)),
                None => {
                    tracing::debug!(
                        "skipping malformed entry array={} index={}",
                        self.array_name,
                        idx
                    );
                }
            }
        }
        entries
    }

    fn read_map(&self) -> BTreeMap<String, EntryRecord> {
        self.substrate.read(|txn| {
            let mut map: BTreeMap<String, EntryRecord> = BTreeMap::new();
            for (_, key, entry) in self.scan(txn) {
                match map.get(&key) {
                    Some(current) if !entry.beats(current) => {}
                    _ => {
                        map.insert(key, entry);
                    }
                }
            }
            map
        })
    }

    fn after_commit(inner: &Arc<Self>, origin: CommitOrigin) {
        if inner.resolving.load(Ordering::SeqCst) {
            return;
        }
        Self::resolve_conflicts(inner);

        let new_map = inner.read_map();
        let changes = {
            let mut shadow = inner.shadow.lock();
            let changes = diff(&shadow, &new_map);
            *shadow = new_map;
            changes
        };
        if changes.is_empty() {
            return;
        }

        let observers: Vec<ObserverFn> = inner
            .observers
            .lock()
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();
        for cb in observers {
            cb(&changes, origin);
        }
    }

    /// Remove losing duplicates per key in one `merge` transaction.
    ///
    /// The resolution transaction inserts nothing, so it cannot create
    /// new conflicts; the `resolving` flag keeps its own commit from
    /// re-entering this pass.
    fn resolve_conflicts(inner: &Arc<Self>) {
        let losers: Vec<u32> = inner.substrate.read(|txn| {
            let entries = inner.scan(txn);
            let mut winners: BTreeMap<&str, (u32, &EntryRecord)> = BTreeMap::new();
            for (idx, key, entry) in &entries {
                match winners.get(key.as_str()) {
                    Some((_, winner)) if !entry.beats(winner) => {}
                    _ => {
                        winners.insert(key.as_str(), (*idx, entry));
                    }
                }
            }
            entries
                .iter()
                .filter(|(idx, key, _)| winners[key.as_str()].0 != *idx)
                .map(|(idx, _, _)| *idx)
                .collect()
        });
        if losers.is_empty() {
            return;
        }

        tracing::debug!(
            "resolving lww conflicts array={} losers={}",
            inner.array_name,
            losers.len()
        );
        inner.resolving.store(true, Ordering::SeqCst);
        inner.substrate.transact(CommitOrigin::Merge, |txn| {
            let mut sorted = losers;
            sorted.sort_unstable();
            for idx in sorted.into_iter().rev() {
                inner.array.remove(txn, idx);
            }
        });
        inner.resolving.store(false, Ordering::SeqCst);
    }
}

fn encode_entry(key: &str, val: &Value, ts: i64, actor: &ActorId) -> Any {
    let mut map = std::collections::HashMap::with_capacity(4);
    map.insert(FIELD_KEY.to_string(), Any::String(key.into()));
    map.insert(FIELD_VAL.to_string(), json_to_any(val));
    map.insert(FIELD_TS.to_string(), Any::BigInt(ts));
    map.insert(FIELD_ACTOR.to_string(), Any::String(actor.as_str().into()));
    Any::Map(Arc::new(map))
}

fn decode_entry(any: &Any) -> Option<(String, EntryRecord)> {
    let Any::Map(map) = any else {
        return None;
    };
    let key = match map.get(FIELD_KEY)? {
        Any::String(s) => s.to_string(),
        _ => return None,
    };
    let ts = match map.get(FIELD_TS)? {
        Any::BigInt(i) => *i,
        Any::Number(f) => *f as i64,
        _ => return None,
    };
    let actor = match map.get(FIELD_ACTOR)? {
        Any::String(s) => ActorId::new(s.to_string()).ok()?,
        _ => return None,
    };
    let val = map.get(FIELD_VAL).map(any_to_json).unwrap_or(Value::Null);
    Some((key, EntryRecord { val, ts, actor }))
}

fn diff(old: &BTreeMap<String, EntryRecord>, new: &BTreeMap<String, EntryRecord>) -> ChangeSet {
    let mut changes = ChangeSet::new();
    for (key, entry) in new {
        match old.get(key) {
            None => {
                changes.insert(key.clone(), KeyChange::Add { new: entry.val.clone() });
            }
            Some(prev) if prev != entry => {
                changes.insert(
                    key.clone(),
                    KeyChange::Update { old: prev.val.clone(), new: entry.val.clone() },
                );
            }
            Some(_) => {}
        }
    }
    for (key, entry) in old {
        if !new.contains_key(key) {
            changes.insert(key.clone(), KeyChange::Delete { old: entry.val.clone() });
        }
    }
    changes
}
