//! Tabula Library
//!
//! Embeddable local-first workspace engine: a schema-aware, LWW
//! CRDT-backed store of tables and KV settings, with a WebSocket sync
//! supervisor and a per-workspace room server.

pub mod clock;
pub mod config;
pub mod error;
pub mod extension;
pub mod keys;
pub mod kv;
pub mod persistence;
pub mod schema;
pub mod server;
pub mod substrate;
pub mod sync;
pub mod table;
pub mod workspace;
pub mod ykv;

// Re-export commonly used types
pub use config::load_config;
pub use error::Error;
pub use extension::Extension;
pub use keys::{ActorId, CellKey, FieldId, RowId};
pub use kv::{KvHelper, KvRead};
pub use persistence::{persistence, FilePersistence, PersistenceAdapter};
pub use schema::{FieldDef, FieldType, KvEntryDef, TableDefinition, WorkspaceDefinition};
pub use substrate::{CommitOrigin, Substrate};
pub use sync::{SyncProvider, SyncStatus};
pub use table::{DeleteOutcome, RowRead, TableHelper, WriteOutcome};
pub use workspace::{Action, ActionMap, Workspace};
pub use ykv::{KeyChange, YkvStore};
