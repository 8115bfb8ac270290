//! WebSocket synchronization: wire protocol, reconnect primitives, the
//! provider supervisor and its workspace extension.

pub mod backoff;
pub mod protocol;
mod provider;

pub use backoff::{Backoff, Sleeper, WakeHandle};
pub use protocol::Frame;
pub use provider::{
    StatusObserverId, SyncOptions, SyncProvider, SyncStatus, SyncTarget,
};

use async_trait::async_trait;

use crate::extension::Extension;
use crate::workspace::Workspace;

/// Extension wiring a [`SyncProvider`] into the builder chain.
///
/// The provider is the stable export: reconnects swap sockets inside it,
/// so references handed out here keep working across connection cycles.
pub struct SyncExtension {
    provider: SyncProvider,
}

/// Factory for the builder: `workspace.with_extension("sync",
/// sync(auth))`. Connects immediately.
pub fn sync<F, Fut>(auth: F) -> impl FnOnce(&Workspace) -> SyncExtension
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = anyhow::Result<SyncTarget>> + Send + 'static,
{
    sync_with_options(auth, SyncOptions::default())
}

pub fn sync_with_options<F, Fut>(
    auth: F,
    options: SyncOptions,
) -> impl FnOnce(&Workspace) -> SyncExtension
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = anyhow::Result<SyncTarget>> + Send + 'static,
{
    move |workspace: &Workspace| {
        let provider =
            SyncProvider::with_options(workspace.id(), workspace.substrate(), auth, options);
        provider.connect();
        SyncExtension { provider }
    }
}

impl SyncExtension {
    pub fn provider(&self) -> &SyncProvider {
        &self.provider
    }

    pub fn status(&self) -> SyncStatus {
        self.provider.status()
    }

    pub fn has_local_changes(&self) -> bool {
        self.provider.has_local_changes()
    }
}

#[async_trait]
impl Extension for SyncExtension {
    /// Resolves on the first `Connected` transition.
    async fn when_ready(&self) -> anyhow::Result<()> {
        let mut rx = self.provider.subscribe_status();
        rx.wait_for(|status| *status == SyncStatus::Connected)
            .await
            .map_err(|_| anyhow::anyhow!("sync provider destroyed before first connection"))?;
        Ok(())
    }

    async fn destroy(&self) -> anyhow::Result<()> {
        self.provider.destroy().await;
        Ok(())
    }
}
