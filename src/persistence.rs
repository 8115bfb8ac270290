//! Persistence adapters and the persistence extension.
//!
//! The engine serializes a workspace to a single binary update blob.
//! Adapters store that blob atomically and hand it back on startup; the
//! extension loads before reporting ready, then saves with a short
//! debounce whenever the document changes.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

use crate::extension::Extension;
use crate::substrate::{CommitOrigin, Substrate, UpdateSubscription};
use crate::workspace::Workspace;

/// How long after the last change a save is scheduled.
const SAVE_DEBOUNCE: Duration = Duration::from_millis(300);

/// Storage contract for one workspace blob.
#[async_trait]
pub trait PersistenceAdapter: Send + Sync + 'static {
    /// Previously saved blob, or `None` on first run.
    async fn load(&self) -> anyhow::Result<Option<Vec<u8>>>;

    /// Store the blob. Must be atomic: a crashed save leaves the old
    /// blob intact.
    async fn save(&self, bytes: &[u8]) -> anyhow::Result<()>;
}

/// Filesystem adapter: one blob per workspace, written to a temp file
/// and renamed into place.
pub struct FilePersistence {
    path: PathBuf,
}

impl FilePersistence {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

#[async_trait]
impl PersistenceAdapter for FilePersistence {
    async fn load(&self) -> anyhow::Result<Option<Vec<u8>>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, bytes: &[u8]) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

/// Extension keeping a workspace's substrate on an adapter.
///
/// Created via [`persistence`]; must be registered from within a tokio
/// runtime.
pub struct PersistenceExtension {
    substrate: Substrate,
    adapter: Arc<dyn PersistenceAdapter>,
    ready_rx: watch::Receiver<Option<Result<(), String>>>,
    dirty: Arc<Notify>,
    stopped: Arc<AtomicBool>,
    saver: Mutex<Option<JoinHandle<()>>>,
    _subscription: UpdateSubscription,
}

/// Factory for the builder: `workspace.with_extension("persistence",
/// persistence(adapter))`.
pub fn persistence<A: PersistenceAdapter>(
    adapter: A,
) -> impl FnOnce(&Workspace) -> PersistenceExtension {
    move |workspace: &Workspace| PersistenceExtension::start(workspace, Arc::new(adapter))
}

impl PersistenceExtension {
    fn start(workspace: &Workspace, adapter: Arc<dyn PersistenceAdapter>) -> Self {
        let substrate = workspace.substrate().clone();
        let workspace_id = workspace.id().to_string();
        let (ready_tx, ready_rx) = watch::channel::<Option<Result<(), String>>>(None);
        let dirty = Arc::new(Notify::new());
        let stopped = Arc::new(AtomicBool::new(false));

        // Every committed change marks the blob dirty, including
        // remote-applied updates.
        let dirty_from_updates = Arc::clone(&dirty);
        let subscription = substrate.on_update(move |_bytes, origin| {
            if origin != CommitOrigin::Load {
                dirty_from_updates.notify_one();
            }
        });

        let saver = tokio::spawn({
            let substrate = substrate.clone();
            let adapter = Arc::clone(&adapter);
            let dirty = Arc::clone(&dirty);
            let stopped = Arc::clone(&stopped);
            async move {
                match adapter.load().await {
                    Ok(Some(bytes)) => {
                        if let Err(e) = substrate.apply_update(&bytes, CommitOrigin::Load) {
                            tracing::warn!(
                                "failed to apply persisted state workspace={workspace_id}: {e:#}"
                            );
                            let _ = ready_tx.send(Some(Err(format!("{e:#}"))));
                            return;
                        }
                        tracing::debug!(
                            "loaded persisted state workspace={workspace_id} bytes={}",
                            bytes.len()
                        );
                    }
                    Ok(None) => {
                        tracing::debug!("no persisted state workspace={workspace_id}");
                    }
                    Err(e) => {
                        tracing::warn!("failed to load workspace={workspace_id}: {e:#}");
                        let _ = ready_tx.send(Some(Err(format!("{e:#}"))));
                        return;
                    }
                }
                let _ = ready_tx.send(Some(Ok(())));

                while !stopped.load(Ordering::SeqCst) {
                    dirty.notified().await;
                    if stopped.load(Ordering::SeqCst) {
                        break;
                    }
                    tokio::time::sleep(SAVE_DEBOUNCE).await;
                    let bytes = substrate.encode_state();
                    if let Err(e) = adapter.save(&bytes).await {
                        tracing::warn!("failed to save workspace={workspace_id}: {e:#}");
                    }
                }
            }
        });

        Self {
            substrate,
            adapter,
            ready_rx,
            dirty,
            stopped,
            saver: Mutex::new(Some(saver)),
            _subscription: subscription,
        }
    }

    /// Persist the current state immediately, bypassing the debounce.
    pub async fn flush(&self) -> anyhow::Result<()> {
        let bytes = self.substrate.encode_state();
        self.adapter.save(&bytes).await
    }
}

#[async_trait]
impl Extension for PersistenceExtension {
    async fn when_ready(&self) -> anyhow::Result<()> {
        let mut rx = self.ready_rx.clone();
        let outcome = rx
            .wait_for(|state| state.is_some())
            .await
            .map_err(|_| anyhow::anyhow!("persistence task stopped before load completed"))?;
        match outcome.as_ref().expect("checked above") {
            Ok(()) => Ok(()),
            Err(message) => anyhow::bail!("persistence load failed: {message}"),
        }
    }

    async fn destroy(&self) -> anyhow::Result<()> {
        self.stopped.store(true, Ordering::SeqCst);
        self.dirty.notify_one();
        let saver = self.saver.lock().take();
        if let Some(handle) = saver {
            let _ = handle.await;
        }
        // Final save so nothing after the last debounce window is lost.
        self.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldDef, TableDefinition, WorkspaceDefinition};
    use crate::table::RowRead;
    use serde_json::json;

    fn definition() -> WorkspaceDefinition {
        WorkspaceDefinition::new("notes").with_table(
            TableDefinition::new("posts", vec![FieldDef::text("title")]).unwrap(),
        )
    }

    fn blob_path(dir: &tempfile::TempDir) -> PathBuf {
        dir.path().join("notes.tabula")
    }

    #[tokio::test]
    async fn test_file_adapter_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = FilePersistence::new(blob_path(&dir));
        assert_eq!(adapter.load().await.unwrap(), None);
        adapter.save(b"hello").await.unwrap();
        assert_eq!(adapter.load().await.unwrap(), Some(b"hello".to_vec()));
    }

    #[tokio::test]
    async fn test_state_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = blob_path(&dir);

        let workspace = Workspace::create(definition())
            .unwrap()
            .with_extension("persistence", persistence(FilePersistence::new(&path)))
            .unwrap();
        workspace.when_ready().await.unwrap();
        workspace
            .table("posts")
            .unwrap()
            .upsert(json!({"id": "p1", "title": "kept"}).as_object().unwrap().clone())
            .unwrap();
        workspace.destroy().await.unwrap();

        // A second workspace over the same blob sees the row.
        let restarted = Workspace::create(definition())
            .unwrap()
            .with_extension("persistence", persistence(FilePersistence::new(&path)))
            .unwrap();
        restarted.when_ready().await.unwrap();
        let read = restarted
            .table("posts")
            .unwrap()
            .get(&crate::keys::RowId::new("p1").unwrap());
        let RowRead::Valid { row } = read else {
            panic!("expected persisted row, got {read:?}");
        };
        assert_eq!(row["title"], json!("kept"));
        restarted.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_ready_resolves_with_no_prior_state() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = Workspace::create(definition())
            .unwrap()
            .with_extension(
                "persistence",
                persistence(FilePersistence::new(blob_path(&dir))),
            )
            .unwrap();
        workspace.when_ready().await.unwrap();
        workspace.destroy().await.unwrap();
    }
}
