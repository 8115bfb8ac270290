//! CRDT document substrate.
//!
//! Thin wrapper around a `yrs` document: named shared arrays, transactions
//! tagged with a commit origin, v1 binary update exchange and observer
//! plumbing. Overlay stores register post-commit hooks here so they can
//! react to a transaction (including opening follow-up transactions)
//! after the commit borrow is released; array observers in the
//! underlying library fire while the transaction is still committing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Any, ArrayRef, Doc, Origin, Out, ReadTxn, StateVector, Transact, TransactionMut, Update};

use crate::keys::ActorId;

const ORIGIN_LOCAL: &str = "local";
const ORIGIN_MERGE: &str = "merge";
const ORIGIN_REMOTE: &str = "remote";
const ORIGIN_LOAD: &str = "load";

/// Why a transaction was committed.
///
/// `Remote` and `Load` updates originate outside this process and are the
/// only ones excluded from local-version counting by the sync provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOrigin {
    /// A helper write on this client.
    Local,
    /// An LWW conflict-resolution transaction.
    Merge,
    /// An update applied from a sync peer.
    Remote,
    /// An update applied from a persistence adapter at startup.
    Load,
}

impl CommitOrigin {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => ORIGIN_LOCAL,
            Self::Merge => ORIGIN_MERGE,
            Self::Remote => ORIGIN_REMOTE,
            Self::Load => ORIGIN_LOAD,
        }
    }

    /// Whether updates committed under this origin were produced by this
    /// process (and must count towards the local sync version).
    pub fn is_local(self) -> bool {
        !matches!(self, Self::Remote | Self::Load)
    }

    fn from_origin(origin: Option<&Origin>) -> Self {
        match origin {
            Some(o) if *o == Origin::from(ORIGIN_REMOTE) => Self::Remote,
            Some(o) if *o == Origin::from(ORIGIN_LOAD) => Self::Load,
            Some(o) if *o == Origin::from(ORIGIN_MERGE) => Self::Merge,
            _ => Self::Local,
        }
    }
}

impl std::fmt::Display for CommitOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

type PostCommitHook = Arc<dyn Fn(CommitOrigin) + Send + Sync>;

struct SubstrateInner {
    doc: Doc,
    actor: ActorId,
    hooks: RwLock<Vec<(u64, PostCommitHook)>>,
    next_hook_id: AtomicU64,
}

/// Handle to one CRDT document. Cheap to clone; all clones share state.
///
/// Garbage collection of removed entries is left enabled, so superseded
/// LWW entries compact into tombstones instead of accumulating payloads.
#[derive(Clone)]
pub struct Substrate {
    inner: Arc<SubstrateInner>,
}

impl Substrate {
    /// Create a fresh document owned by the given actor.
    pub fn new(actor: ActorId) -> Self {
        Self {
            inner: Arc::new(SubstrateInner {
                doc: Doc::new(),
                actor,
                hooks: RwLock::new(Vec::new()),
                next_hook_id: AtomicU64::new(0),
            }),
        }
    }

    pub fn actor(&self) -> &ActorId {
        &self.inner.actor
    }

    /// Named shared array. Repeat calls with the same name return handles
    /// to the same logical array; arrays are never deleted for the
    /// document's lifetime.
    pub(crate) fn array(&self, name: &str) -> ArrayRef {
        self.inner.doc.get_or_insert_array(name)
    }

    /// Run `f` inside one transaction tagged with `origin`. Substrate
    /// observers fire at commit; post-commit hooks run after the
    /// transaction borrow is released, in registration order.
    ///
    /// Must not be nested from within `f`.
    pub(crate) fn transact<F, R>(&self, origin: CommitOrigin, f: F) -> R
    where
        F: FnOnce(&mut TransactionMut) -> R,
    {
        let result = {
            let mut txn = self
                .inner
                .doc
                .transact_mut_with(Origin::from(origin.as_str()));
            f(&mut txn)
        };
        self.run_post_commit(origin);
        result
    }

    /// Read-only access to the document.
    pub(crate) fn read<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&yrs::Transaction<'_>) -> R,
    {
        let txn = self.inner.doc.transact();
        f(&txn)
    }

    /// Current state vector, v1-encoded.
    pub fn state_vector(&self) -> Vec<u8> {
        self.inner.doc.transact().state_vector().encode_v1()
    }

    /// Full document state as one v1 update blob.
    pub fn encode_state(&self) -> Vec<u8> {
        self.inner
            .doc
            .transact()
            .encode_state_as_update_v1(&StateVector::default())
    }

    /// Difference between this document and a peer's state vector.
    pub fn encode_diff(&self, state_vector: &[u8]) -> anyhow::Result<Vec<u8>> {
        let sv = StateVector::decode_v1(state_vector)
            .map_err(|e| anyhow::anyhow!("invalid state vector: {e}"))?;
        Ok(self.inner.doc.transact().encode_state_as_update_v1(&sv))
    }

    /// Apply a v1-encoded update under the given origin.
    pub fn apply_update(&self, bytes: &[u8], origin: CommitOrigin) -> anyhow::Result<()> {
        let update =
            Update::decode_v1(bytes).map_err(|e| anyhow::anyhow!("invalid update: {e}"))?;
        {
            let mut txn = self
                .inner
                .doc
                .transact_mut_with(Origin::from(origin.as_str()));
            txn.apply_update(update)
                .map_err(|e| anyhow::anyhow!("failed to apply update: {e}"))?;
        }
        self.run_post_commit(origin);
        Ok(())
    }

    /// Subscribe to the stream of outgoing v1 updates. The returned guard
    /// must be kept alive for the subscription to stay active.
    pub fn on_update<F>(&self, f: F) -> UpdateSubscription
    where
        F: Fn(&[u8], CommitOrigin) + Send + Sync + 'static,
    {
        let sub = self
            .inner
            .doc
            .observe_update_v1(move |txn, event| {
                let origin = CommitOrigin::from_origin(txn.origin());
                f(&event.update, origin);
            })
            .expect("register update observer");
        UpdateSubscription(sub)
    }

    pub(crate) fn add_post_commit_hook<F>(&self, f: F) -> u64
    where
        F: Fn(CommitOrigin) + Send + Sync + 'static,
    {
        let id = self.inner.next_hook_id.fetch_add(1, Ordering::SeqCst);
        self.inner.hooks.write().push((id, Arc::new(f)));
        id
    }

    pub(crate) fn remove_post_commit_hook(&self, id: u64) {
        self.inner.hooks.write().retain(|(hook_id, _)| *hook_id != id);
    }

    fn run_post_commit(&self, origin: CommitOrigin) {
        let hooks: Vec<PostCommitHook> = self
            .inner
            .hooks
            .read()
            .iter()
            .map(|(_, hook)| Arc::clone(hook))
            .collect();
        for hook in hooks {
            hook(origin);
        }
    }
}

/// Guard keeping a substrate update subscription alive.
pub struct UpdateSubscription(#[allow(dead_code)] yrs::Subscription);

/// Convert a JSON value into the substrate's `Any` representation.
///
/// Integers that fit in `i64` are carried as bigints so they survive the
/// round trip exactly; everything else maps structurally.
pub(crate) fn json_to_any(value: &Value) -> Any {
    match value {
        Value::Null => Any::Null,
        Value::Bool(b) => Any::Bool(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Any::BigInt(i)
            } else {
                Any::Number(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        Value::String(s) => Any::String(s.as_str().into()),
        Value::Array(items) => {
            let converted: Vec<Any> = items.iter().map(json_to_any).collect();
            Any::Array(converted.into())
        }
        Value::Object(map) => {
            let converted: HashMap<String, Any> = map
                .iter()
                .map(|(k, v)| (k.clone(), json_to_any(v)))
                .collect();
            Any::Map(Arc::new(converted))
        }
    }
}

/// Convert an `Any` back into JSON. `Undefined` and binary buffers (which
/// the engine never writes) collapse to `null`.
pub(crate) fn any_to_json(value: &Any) -> Value {
    match value {
        Any::Null | Any::Undefined => Value::Null,
        Any::Bool(b) => Value::Bool(*b),
        Any::Number(f) => serde_json::Number::from_f64(*f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        Any::BigInt(i) => Value::Number((*i).into()),
        Any::String(s) => Value::String(s.to_string()),
        Any::Buffer(_) => Value::Null,
        Any::Array(items) => Value::Array(items.iter().map(any_to_json).collect()),
        Any::Map(map) => {
            let mut object = serde_json::Map::with_capacity(map.len());
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for key in keys {
                object.insert(key.clone(), any_to_json(&map[key]));
            }
            Value::Object(object)
        }
    }
}

/// Extract the `Any` payload from an array element, if it is one.
pub(crate) fn out_as_any(out: &Out) -> Option<&Any> {
    match out {
        Out::Any(any) => Some(any),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use yrs::Array;

    fn substrate() -> Substrate {
        Substrate::new(ActorId::generate())
    }

    #[test]
    fn test_json_any_round_trip() {
        let value = json!({
            "title": "Hello",
            "views": 42,
            "ratio": 0.5,
            "flag": true,
            "tags": ["a", "b"],
            "nested": {"x": null},
        });
        let round_tripped = any_to_json(&json_to_any(&value));
        assert_eq!(round_tripped, value);
    }

    #[test]
    fn test_large_integers_survive_round_trip() {
        let value = json!(i64::MAX);
        assert_eq!(any_to_json(&json_to_any(&value)), value);
    }

    #[test]
    fn test_update_exchange_converges() {
        let a = substrate();
        let b = substrate();

        let array_a = a.array("table:posts");
        a.transact(CommitOrigin::Local, |txn| {
            array_a.push_back(txn, json_to_any(&json!({"key": "p1:title"})));
        });

        b.apply_update(&a.encode_state(), CommitOrigin::Remote)
            .unwrap();

        let array_b = b.array("table:posts");
        let len = b.read(|txn| array_b.len(txn));
        assert_eq!(len, 1);
        assert_eq!(a.encode_state(), b.encode_state());
    }

    #[test]
    fn test_diff_only_carries_missing_state() {
        let a = substrate();
        let b = substrate();

        let array = a.array("kv");
        a.transact(CommitOrigin::Local, |txn| {
            array.push_back(txn, json_to_any(&json!({"key": "theme"})));
        });
        b.apply_update(&a.encode_state(), CommitOrigin::Remote)
            .unwrap();

        // Nothing new on either side: the diff applies cleanly as a no-op.
        let diff = a.encode_diff(&b.state_vector()).unwrap();
        b.apply_update(&diff, CommitOrigin::Remote).unwrap();
        assert_eq!(a.encode_state(), b.encode_state());
    }

    #[test]
    fn test_on_update_reports_origin() {
        use std::sync::Mutex;

        let s = substrate();
        let seen: Arc<Mutex<Vec<CommitOrigin>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_in_cb = Arc::clone(&seen);
        let _sub = s.on_update(move |_bytes, origin| {
            seen_in_cb.lock().unwrap().push(origin);
        });

        let array = s.array("kv");
        s.transact(CommitOrigin::Local, |txn| {
            array.push_back(txn, json_to_any(&json!({"key": "a"})));
        });

        let other = substrate();
        let other_array = other.array("kv");
        other.transact(CommitOrigin::Local, |txn| {
            other_array.push_back(txn, json_to_any(&json!({"key": "b"})));
        });
        s.apply_update(&other.encode_state(), CommitOrigin::Remote)
            .unwrap();

        let origins = seen.lock().unwrap().clone();
        assert_eq!(origins, vec![CommitOrigin::Local, CommitOrigin::Remote]);
    }

    #[test]
    fn test_post_commit_hook_runs_after_transaction() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let s = substrate();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_in_hook = Arc::clone(&calls);
        // The hook opens its own transaction, which would deadlock if it
        // ran inside the committing one.
        let s_in_hook = s.clone();
        s.add_post_commit_hook(move |origin| {
            if origin == CommitOrigin::Local {
                let _ = s_in_hook.state_vector();
                calls_in_hook.fetch_add(1, Ordering::SeqCst);
            }
        });

        let array = s.array("kv");
        s.transact(CommitOrigin::Local, |txn| {
            array.push_back(txn, json_to_any(&json!({"key": "a"})));
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
