//! Typed KV settings helper.
//!
//! A single shared array named `kv` holds flat entries; each key is
//! declared by a [`KvEntryDef`] giving the value its type, default and
//! (for object values) an optional version chain applied on read.
//! Invalid stored values are reported with their issues, never silently
//! swallowed or coerced.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use yrs::TransactionMut;

use crate::error::{Error, Result};
use crate::keys::KEY_SEPARATOR;
use crate::schema::{validate_value, ChainRead, Issue, KvEntryDef};
use crate::substrate::{CommitOrigin, Substrate};
use crate::ykv::{KeyChange, YkvStore};

/// Name of the shared array backing the KV store.
pub(crate) const KV_ARRAY_NAME: &str = "kv";

/// Result of reading one setting.
#[derive(Debug, Clone, PartialEq)]
pub enum KvRead {
    Valid(Value),
    /// The stored value does not satisfy the key's definition.
    Invalid { issues: Vec<Issue>, raw: Value },
    NotFound,
}

impl KvRead {
    pub fn into_valid(self) -> Option<Value> {
        match self {
            Self::Valid(value) => Some(value),
            _ => None,
        }
    }
}

type KvObserverFn = Arc<dyn Fn(&KeyChange, CommitOrigin) + Send + Sync>;

/// Identifier returned by [`KvHelper::observe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KvObserverId(u64);

struct KvInner {
    store: YkvStore,
    entries: HashMap<String, KvEntryDef>,
    observers: Mutex<Vec<(u64, String, KvObserverFn)>>,
    next_observer_id: AtomicU64,
}

/// Typed get/set/delete/observe over the `kv` array.
#[derive(Clone)]
pub struct KvHelper {
    inner: Arc<KvInner>,
}

impl KvHelper {
    pub(crate) fn open(substrate: &Substrate, entries: Vec<KvEntryDef>) -> Self {
        let store = YkvStore::open(substrate, KV_ARRAY_NAME);
        let inner = Arc::new(KvInner {
            store,
            entries: entries
                .into_iter()
                .map(|entry| (entry.key.as_str().to_string(), entry))
                .collect(),
            observers: Mutex::new(Vec::new()),
            next_observer_id: AtomicU64::new(0),
        });

        let weak = Arc::downgrade(&inner);
        inner.store.observe(move |changes, origin| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let observers: Vec<(String, KvObserverFn)> = inner
                .observers
                .lock()
                .iter()
                .map(|(_, key, cb)| (key.clone(), Arc::clone(cb)))
                .collect();
            for (key, change) in changes {
                for (observed_key, cb) in &observers {
                    if observed_key == key {
                        cb(change, origin);
                    }
                }
            }
        });

        Self { inner }
    }

    /// Write one setting. Rejects keys containing the reserved separator.
    pub fn set(&self, key: &str, value: Value) -> Result<()> {
        validate_kv_key(key)?;
        self.inner.store.set(key, value);
        Ok(())
    }

    /// Read one setting, validated (and migrated, for versioned object
    /// values) against its definition. Undeclared keys pass through as
    /// valid. Declared keys with no stored value fall back to their
    /// default before reporting `NotFound`.
    pub fn get(&self, key: &str) -> KvRead {
        let stored = self.inner.store.get(key);
        let definition = self.inner.entries.get(key);

        let Some(value) = stored else {
            if let Some(default) = definition.and_then(|d| d.field.default.clone()) {
                return KvRead::Valid(default);
            }
            return KvRead::NotFound;
        };

        let Some(definition) = definition else {
            return KvRead::Valid(value);
        };

        if let Some(chain) = definition.chain() {
            let Value::Object(raw) = value else {
                return KvRead::Invalid {
                    issues: vec![Issue {
                        path: key.to_string(),
                        message: "expected an object for a versioned setting".to_string(),
                        expected: "object".to_string(),
                    }],
                    raw: value,
                };
            };
            return match chain.read(raw.clone()) {
                ChainRead::Valid(row) => KvRead::Valid(Value::Object(row)),
                ChainRead::Invalid { issues } => {
                    KvRead::Invalid { issues, raw: Value::Object(raw) }
                }
            };
        }

        match validate_value(&definition.field, &value) {
            None => KvRead::Valid(value),
            Some(issue) => KvRead::Invalid { issues: vec![issue], raw: value },
        }
    }

    pub fn delete(&self, key: &str) {
        self.inner.store.delete(key);
    }

    /// Whether a live entry exists for `key` (defaults do not count).
    pub fn has(&self, key: &str) -> bool {
        self.inner.store.has(key)
    }

    /// Per-key subscription; fires once per transaction touching `key`.
    pub fn observe<F>(&self, key: &str, cb: F) -> KvObserverId
    where
        F: Fn(&KeyChange, CommitOrigin) + Send + Sync + 'static,
    {
        let id = self.inner.next_observer_id.fetch_add(1, Ordering::SeqCst);
        self.inner
            .observers
            .lock()
            .push((id, key.to_string(), Arc::new(cb)));
        KvObserverId(id)
    }

    pub fn unobserve(&self, id: KvObserverId) {
        self.inner.observers.lock().retain(|(i, _, _)| *i != id.0);
    }

    /// Run several writes in one transaction; observers fire once.
    pub fn batch<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut KvBatch<'_, '_>) -> R,
    {
        self.inner.store.substrate().transact(CommitOrigin::Local, |txn| {
            let mut batch = KvBatch { kv: self, txn };
            f(&mut batch)
        })
    }
}

/// Write surface available inside [`KvHelper::batch`].
pub struct KvBatch<'a, 'doc> {
    kv: &'a KvHelper,
    txn: &'a mut TransactionMut<'doc>,
}

impl KvBatch<'_, '_> {
    pub fn set(&mut self, key: &str, value: Value) -> Result<()> {
        validate_kv_key(key)?;
        self.kv.inner.store.set_tx(self.txn, key, value);
        Ok(())
    }

    pub fn delete(&mut self, key: &str) {
        self.kv.inner.store.delete_tx(self.txn, key);
    }
}

fn validate_kv_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(Error::invalid_key(key, "must not be empty"));
    }
    if key.contains(KEY_SEPARATOR) {
        return Err(Error::invalid_key(key, "must not contain `:`"));
    }
    Ok(())
}
