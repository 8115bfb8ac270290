//! Typed table helper.
//!
//! A table is a named shared array whose entries are cells keyed
//! `{row_id}:{field_id}`. Rows are views, not entities: they exist
//! exactly while at least one live cell bears their prefix, and are
//! reconstructed on demand by a prefix scan over the LWW overlay.
//! Writes go cell by cell so concurrent edits to different fields of the
//! same row merge cleanly.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::Value;
use yrs::TransactionMut;

use crate::error::{Error, Result};
use crate::keys::{row_prefix, CellKey, FieldId, RowId};
use crate::schema::{ChainRead, Issue, RowDiagnostics, RowMap, TableDefinition, ROW_ID_FIELD};
use crate::substrate::{CommitOrigin, Substrate};
use crate::ykv::YkvStore;

/// Prefix of the shared-array name holding a table's cells.
pub(crate) const TABLE_ARRAY_PREFIX: &str = "table:";

/// Result of reading one row.
#[derive(Debug, Clone, PartialEq)]
pub enum RowRead {
    /// The row matched a schema version and has the latest shape.
    Valid { row: RowMap },
    /// The row's cells do not satisfy any declared version.
    Invalid { id: RowId, issues: Vec<Issue>, raw: RowMap },
    /// No live cell bears the row's prefix.
    NotFound { id: RowId },
}

impl RowRead {
    pub fn into_valid(self) -> Option<RowMap> {
        match self {
            Self::Valid { row } => Some(row),
            _ => None,
        }
    }
}

/// A row that failed validation, with the raw cells for inspection.
#[derive(Debug, Clone, PartialEq)]
pub struct InvalidRow {
    pub id: RowId,
    pub issues: Vec<Issue>,
    pub raw: RowMap,
}

/// Outcome of a partial update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Applied,
    /// No local cell existed for the row; nothing was written. Peers may
    /// still create the row via merge without local synthesis.
    NotFoundLocally,
}

/// Outcome of a row deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    NotFoundLocally,
}

type RowObserverFn = Arc<dyn Fn(&BTreeSet<RowId>, CommitOrigin) + Send + Sync>;

/// Identifier returned by [`TableHelper::observe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableObserverId(u64);

struct TableInner {
    definition: TableDefinition,
    store: YkvStore,
    observers: Mutex<Vec<(u64, RowObserverFn)>>,
    next_observer_id: AtomicU64,
}

/// Typed CRUD over one table. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct TableHelper {
    inner: Arc<TableInner>,
}

impl TableHelper {
    pub(crate) fn open(substrate: &Substrate, definition: TableDefinition) -> Self {
        let array_name = format!("{TABLE_ARRAY_PREFIX}{}", definition.id);
        let store = YkvStore::open(substrate, &array_name);
        let inner = Arc::new(TableInner {
            definition,
            store,
            observers: Mutex::new(Vec::new()),
            next_observer_id: AtomicU64::new(0),
        });

        // Translate keyed overlay changes into a deduplicated set of
        // changed row ids, one callback per transaction.
        let weak: Weak<TableInner> = Arc::downgrade(&inner);
        inner.store.observe(move |changes, origin| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let mut rows: BTreeSet<RowId> = BTreeSet::new();
            for key in changes.keys() {
                match CellKey::parse(key) {
                    Ok(cell) => {
                        rows.insert(cell.row);
                    }
                    Err(_) => {
                        tracing::debug!("ignoring non-cell key `{key}` in table change");
                    }
                }
            }
            if rows.is_empty() {
                return;
            }
            let observers: Vec<RowObserverFn> = inner
                .observers
                .lock()
                .iter()
                .map(|(_, cb)| Arc::clone(cb))
                .collect();
            for cb in observers {
                cb(&rows, origin);
            }
        });

        Self { inner }
    }

    pub fn definition(&self) -> &TableDefinition {
        &self.inner.definition
    }

    /// Raw LWW overlay beneath this table. Keys are flat cell keys;
    /// writing through it bypasses identifier validation.
    pub fn store(&self) -> &YkvStore {
        &self.inner.store
    }

    /// Write the supplied fields of one row in a single transaction.
    /// Cells for fields not supplied are left alone.
    pub fn upsert(&self, row: RowMap) -> Result<RowId> {
        self.inner
            .store
            .substrate()
            .transact(CommitOrigin::Local, |txn| self.upsert_tx(txn, row))
    }

    /// Identical write semantics to [`upsert`](Self::upsert): fields
    /// present locally but absent from `row` are kept, preserving
    /// cell-level convergence. Full replacement is `delete` + `upsert`.
    pub fn set(&self, row: RowMap) -> Result<RowId> {
        self.upsert(row)
    }

    /// Partial update. Writes nothing and reports `NotFoundLocally` when
    /// no local cell bears the row's prefix, so an update can never race
    /// a peer's upsert into a phantom row.
    pub fn update(&self, id: &RowId, partial: RowMap) -> Result<WriteOutcome> {
        if !self.has(id) {
            return Ok(WriteOutcome::NotFoundLocally);
        }
        self.inner.store.substrate().transact(CommitOrigin::Local, |txn| {
            self.write_fields_tx(txn, id, partial)
        })?;
        Ok(WriteOutcome::Applied)
    }

    /// Reconstruct, migrate and validate one row.
    pub fn get(&self, id: &RowId) -> RowRead {
        let raw = self.raw_row(id);
        if raw.is_empty() {
            return RowRead::NotFound { id: id.clone() };
        }
        self.read_raw(id.clone(), raw)
    }

    /// Every row in the table, valid or not, sorted by row id.
    pub fn get_all(&self) -> Vec<RowRead> {
        self.raw_rows()
            .into_iter()
            .map(|(id, raw)| self.read_raw(id, raw))
            .collect()
    }

    /// Valid rows only, migrated to the latest shape, sorted by row id.
    pub fn get_all_valid(&self) -> Vec<RowMap> {
        self.get_all()
            .into_iter()
            .filter_map(RowRead::into_valid)
            .collect()
    }

    /// Rows that fail validation, with their issues and raw cells.
    pub fn get_all_invalid(&self) -> Vec<InvalidRow> {
        self.get_all()
            .into_iter()
            .filter_map(|read| match read {
                RowRead::Invalid { id, issues, raw } => Some(InvalidRow { id, issues, raw }),
                _ => None,
            })
            .collect()
    }

    /// Extra/missing-field view of one row against the latest schema.
    pub fn diagnostics(&self, id: &RowId) -> Option<RowDiagnostics> {
        let raw = self.raw_row(id);
        if raw.is_empty() {
            return None;
        }
        Some(self.inner.definition.chain().latest_validator().diagnostics(&raw))
    }

    /// Remove every cell of the row.
    pub fn delete(&self, id: &RowId) -> DeleteOutcome {
        self.inner.store.substrate().transact(CommitOrigin::Local, |txn| {
            self.delete_tx(txn, id)
        })
    }

    /// Remove every cell in the table. The shared array itself persists;
    /// a table's identity is permanent.
    pub fn clear(&self) {
        self.inner.store.clear();
    }

    /// Run several writes in one transaction; observers fire once.
    pub fn batch<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut TableBatch<'_, '_>) -> R,
    {
        self.inner.store.substrate().transact(CommitOrigin::Local, |txn| {
            let mut batch = TableBatch { table: self, txn };
            f(&mut batch)
        })
    }

    /// Number of distinct rows in the current snapshot.
    pub fn count(&self) -> usize {
        self.raw_rows().len()
    }

    /// Whether at least one live cell bears the row's prefix.
    pub fn has(&self, id: &RowId) -> bool {
        let prefix = row_prefix(id);
        self.inner
            .store
            .map()
            .keys()
            .any(|key| key.starts_with(&prefix))
    }

    /// Subscribe to changed-row-id sets. The callback does not
    /// distinguish add/update/delete; callers diff against their own
    /// prior state via [`get`](Self::get).
    pub fn observe<F>(&self, cb: F) -> TableObserverId
    where
        F: Fn(&BTreeSet<RowId>, CommitOrigin) + Send + Sync + 'static,
    {
        let id = self.inner.next_observer_id.fetch_add(1, Ordering::SeqCst);
        self.inner.observers.lock().push((id, Arc::new(cb)));
        TableObserverId(id)
    }

    pub fn unobserve(&self, id: TableObserverId) {
        self.inner.observers.lock().retain(|(i, _)| *i != id.0);
    }

    fn read_raw(&self, id: RowId, raw: RowMap) -> RowRead {
        match self.inner.definition.chain().read(raw.clone()) {
            ChainRead::Valid(mut row) => {
                row.insert(ROW_ID_FIELD.to_string(), Value::String(id.to_string()));
                RowRead::Valid { row }
            }
            ChainRead::Invalid { issues } => {
                let mut raw = raw;
                raw.insert(ROW_ID_FIELD.to_string(), Value::String(id.to_string()));
                RowRead::Invalid { id, issues, raw }
            }
        }
    }

    /// Cells of one row, grouped by field id.
    fn raw_row(&self, id: &RowId) -> RowMap {
        let prefix = row_prefix(id);
        let mut raw = RowMap::new();
        for (key, entry) in self.inner.store.map() {
            if let Some(field) = key.strip_prefix(&prefix) {
                raw.insert(field.to_string(), entry.val);
            }
        }
        raw
    }

    /// One pass over the overlay snapshot, grouped by row id.
    fn raw_rows(&self) -> BTreeMap<RowId, RowMap> {
        let mut rows: BTreeMap<RowId, RowMap> = BTreeMap::new();
        for (key, entry) in self.inner.store.map() {
            match CellKey::parse(&key) {
                Ok(cell) => {
                    rows.entry(cell.row)
                        .or_default()
                        .insert(cell.field.to_string(), entry.val);
                }
                Err(_) => {
                    tracing::debug!(
                        "ignoring non-cell key `{key}` in table `{}`",
                        self.inner.definition.id
                    );
                }
            }
        }
        rows
    }

    fn upsert_tx(&self, txn: &mut TransactionMut<'_>, mut row: RowMap) -> Result<RowId> {
        let id = match row.remove(ROW_ID_FIELD) {
            Some(Value::String(s)) => RowId::new(s)?,
            Some(other) => {
                return Err(Error::invalid_key(other.to_string(), "row `id` must be a string"))
            }
            None => return Err(Error::invalid_key("", "row is missing `id`")),
        };
        self.write_fields_tx(txn, &id, row)?;
        Ok(id)
    }

    fn write_fields_tx(
        &self,
        txn: &mut TransactionMut<'_>,
        id: &RowId,
        fields: RowMap,
    ) -> Result<()> {
        // Validate every field id before touching the store so a bad key
        // cannot leave a half-written row behind.
        let mut cells = Vec::with_capacity(fields.len());
        for (field, value) in fields {
            let field = FieldId::new(field)?;
            cells.push((CellKey::new(id.clone(), field).encode(), value));
        }
        for (key, value) in cells {
            self.inner.store.set_tx(txn, &key, value);
        }
        Ok(())
    }

    fn delete_tx(&self, txn: &mut TransactionMut<'_>, id: &RowId) -> DeleteOutcome {
        let prefix = row_prefix(id);
        let keys: Vec<String> = self
            .inner
            .store
            .keys_tx(&*txn)
            .into_iter()
            .filter(|key| key.starts_with(&prefix))
            .collect();
        if keys.is_empty() {
            return DeleteOutcome::NotFoundLocally;
        }
        for key in keys {
            self.inner.store.delete_tx(txn, &key);
        }
        DeleteOutcome::Deleted
    }
}

/// Write surface available inside [`TableHelper::batch`].
pub struct TableBatch<'a, 'doc> {
    table: &'a TableHelper,
    txn: &'a mut TransactionMut<'doc>,
}

impl TableBatch<'_, '_> {
    pub fn upsert(&mut self, row: RowMap) -> Result<RowId> {
        self.table.upsert_tx(self.txn, row)
    }

    pub fn set(&mut self, row: RowMap) -> Result<RowId> {
        self.table.upsert_tx(self.txn, row)
    }

    pub fn update(&mut self, id: &RowId, partial: RowMap) -> Result<WriteOutcome> {
        let prefix = row_prefix(id);
        let exists = self
            .table
            .inner
            .store
            .keys_tx(&*self.txn)
            .iter()
            .any(|key| key.starts_with(&prefix));
        if !exists {
            return Ok(WriteOutcome::NotFoundLocally);
        }
        self.table.write_fields_tx(self.txn, id, partial)?;
        Ok(WriteOutcome::Applied)
    }

    pub fn delete(&mut self, id: &RowId) -> DeleteOutcome {
        self.table.delete_tx(self.txn, id)
    }
}
