//! Extension lifecycle protocol.
//!
//! Extensions are produced by synchronous factories during workspace
//! assembly and expose side-effectful capabilities (persistence, sync)
//! plus typed exports. The workspace aggregates their readiness and
//! destroys them in reverse registration order.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;

/// Lifecycle every extension conforms to. Exports are whatever public
/// surface the concrete type carries; the workspace hands them back via
/// a typed downcast accessor.
#[async_trait]
pub trait Extension: Any + Send + Sync {
    /// Resolves once the extension is operational (e.g. persisted state
    /// loaded, first sync established). Defaults to immediately ready.
    async fn when_ready(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Release resources. Called once, in reverse registration order;
    /// failures are aggregated by the workspace and do not stop the
    /// remaining destructors.
    async fn destroy(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// One registered extension: insertion order is destruction order,
/// reversed.
#[derive(Clone)]
pub(crate) struct ExtensionRecord {
    pub(crate) name: String,
    pub(crate) lifecycle: Arc<dyn Extension>,
    pub(crate) exports: Arc<dyn Any + Send + Sync>,
}

impl ExtensionRecord {
    pub(crate) fn new<E: Extension>(name: String, extension: Arc<E>) -> Self {
        Self {
            name,
            lifecycle: extension.clone(),
            exports: extension,
        }
    }
}
