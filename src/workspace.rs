//! Workspace client and builder.
//!
//! A workspace owns one substrate and exposes typed helpers for every
//! declared table plus the KV store. The client is usable as soon as it
//! is created and stays extendable: each `with_extension` call runs a
//! synchronous factory against the client built so far and returns the
//! client carrying the new extension. A terminal `with_actions` call
//! attaches the action registry and freezes the builder.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::future::{try_join_all, BoxFuture};
use parking_lot::RwLock;
use serde_json::Value;

use crate::error::Error;
use crate::extension::{Extension, ExtensionRecord};
use crate::keys::ActorId;
use crate::kv::KvHelper;
use crate::schema::{SchemaError, WorkspaceDefinition};
use crate::substrate::Substrate;
use crate::table::TableHelper;

/// Whether an action reads or mutates workspace state. Carried so outer
/// surfaces can derive their verbs; the engine treats both alike.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Query,
    Mutation,
}

type ActionHandler = Arc<dyn Fn(Value) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

/// Named async handler attached via [`Workspace::with_actions`].
#[derive(Clone)]
pub struct Action {
    pub kind: ActionKind,
    handler: ActionHandler,
}

impl Action {
    pub fn query<F, Fut>(f: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Self { kind: ActionKind::Query, handler: Arc::new(move |input| Box::pin(f(input))) }
    }

    pub fn mutation<F, Fut>(f: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Self { kind: ActionKind::Mutation, handler: Arc::new(move |input| Box::pin(f(input))) }
    }
}

/// Map of action name to handler, as returned by the actions factory.
pub type ActionMap = HashMap<String, Action>;

struct WorkspaceInner {
    id: String,
    definition: WorkspaceDefinition,
    substrate: Substrate,
    tables: HashMap<String, TableHelper>,
    kv: KvHelper,
    extensions: RwLock<Vec<ExtensionRecord>>,
    actions: RwLock<Option<ActionMap>>,
    destroyed: AtomicBool,
}

/// Workspace client. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Workspace {
    inner: Arc<WorkspaceInner>,
}

impl Workspace {
    /// Assemble a workspace over a freshly constructed substrate.
    pub fn create(definition: WorkspaceDefinition) -> Result<Self, SchemaError> {
        Self::create_with_substrate(definition, Substrate::new(ActorId::generate()))
    }

    /// Assemble a workspace over a supplied substrate (shared documents,
    /// tests, server rooms).
    pub fn create_with_substrate(
        definition: WorkspaceDefinition,
        substrate: Substrate,
    ) -> Result<Self, SchemaError> {
        definition.validate()?;
        let tables = definition
            .tables
            .iter()
            .map(|table| {
                (
                    table.id.clone(),
                    TableHelper::open(&substrate, table.clone()),
                )
            })
            .collect();
        let kv = KvHelper::open(&substrate, definition.kv.clone());
        Ok(Self {
            inner: Arc::new(WorkspaceInner {
                id: definition.id.clone(),
                definition,
                substrate,
                tables,
                kv,
                extensions: RwLock::new(Vec::new()),
                actions: RwLock::new(None),
                destroyed: AtomicBool::new(false),
            }),
        })
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn definition(&self) -> &WorkspaceDefinition {
        &self.inner.definition
    }

    pub fn substrate(&self) -> &Substrate {
        &self.inner.substrate
    }

    pub fn table(&self, id: &str) -> Option<&TableHelper> {
        self.inner.tables.get(id)
    }

    pub fn tables(&self) -> impl Iterator<Item = (&str, &TableHelper)> {
        self.inner
            .tables
            .iter()
            .map(|(id, helper)| (id.as_str(), helper))
    }

    pub fn kv(&self) -> &KvHelper {
        &self.inner.kv
    }

    /// Register an extension. The factory runs synchronously against the
    /// client built so far, so it sees every earlier extension's exports.
    pub fn with_extension<E, F>(self, name: &str, factory: F) -> Result<Self, Error>
    where
        E: Extension,
        F: FnOnce(&Workspace) -> E,
    {
        self.ensure_alive()?;
        if self.inner.actions.read().is_some() {
            return Err(Error::ActionsAlreadyAttached { workspace_id: self.inner.id.clone() });
        }
        if self
            .inner
            .extensions
            .read()
            .iter()
            .any(|record| record.name == name)
        {
            return Err(Error::DuplicateExtension { name: name.to_string() });
        }

        let extension = Arc::new(factory(&self));
        self.inner
            .extensions
            .write()
            .push(ExtensionRecord::new(name.to_string(), extension));
        tracing::debug!("registered extension `{name}` on workspace `{}`", self.inner.id);
        Ok(self)
    }

    /// Terminal builder stage: attach the action registry. No further
    /// builder calls are accepted afterwards.
    pub fn with_actions<F>(self, factory: F) -> Result<Self, Error>
    where
        F: FnOnce(&Workspace) -> ActionMap,
    {
        self.ensure_alive()?;
        {
            let mut actions = self.inner.actions.write();
            if actions.is_some() {
                return Err(Error::ActionsAlreadyAttached {
                    workspace_id: self.inner.id.clone(),
                });
            }
            *actions = Some(ActionMap::new());
        }
        let map = factory(&self);
        *self.inner.actions.write() = Some(map);
        Ok(self)
    }

    /// Typed accessor for an extension's exports.
    pub fn extension<E: Extension>(&self, name: &str) -> Option<Arc<E>> {
        let records = self.inner.extensions.read();
        let record = records.iter().find(|record| record.name == name)?;
        record.exports.clone().downcast::<E>().ok()
    }

    pub fn extension_names(&self) -> Vec<String> {
        self.inner
            .extensions
            .read()
            .iter()
            .map(|record| record.name.clone())
            .collect()
    }

    pub fn action_names(&self) -> Vec<String> {
        self.inner
            .actions
            .read()
            .as_ref()
            .map(|map| {
                let mut names: Vec<String> = map.keys().cloned().collect();
                names.sort();
                names
            })
            .unwrap_or_default()
    }

    pub fn action_kind(&self, name: &str) -> Option<ActionKind> {
        self.inner
            .actions
            .read()
            .as_ref()
            .and_then(|map| map.get(name))
            .map(|action| action.kind)
    }

    /// Invoke a named action with a JSON input.
    pub async fn invoke_action(&self, name: &str, input: Value) -> anyhow::Result<Value> {
        self.ensure_alive()?;
        let handler = {
            let actions = self.inner.actions.read();
            let action = actions
                .as_ref()
                .and_then(|map| map.get(name))
                .ok_or_else(|| Error::UnknownAction { name: name.to_string() })?;
            Arc::clone(&action.handler)
        };
        handler(input).await
    }

    /// Resolves once every extension reports ready; the first failure
    /// rejects the aggregate.
    pub async fn when_ready(&self) -> anyhow::Result<()> {
        let extensions: Vec<(String, Arc<dyn Extension>)> = self
            .inner
            .extensions
            .read()
            .iter()
            .map(|record| (record.name.clone(), Arc::clone(&record.lifecycle)))
            .collect();
        try_join_all(extensions.into_iter().map(|(name, extension)| async move {
            extension
                .when_ready()
                .await
                .map_err(|e| e.context(format!("extension `{name}` failed to become ready")))
        }))
        .await?;
        Ok(())
    }

    /// Destroy every extension in reverse registration order. A failing
    /// destructor does not stop the rest; failures are aggregated.
    /// Idempotent: repeat calls are no-ops.
    pub async fn destroy(&self) -> anyhow::Result<()> {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let records: Vec<ExtensionRecord> = {
            let extensions = self.inner.extensions.read();
            extensions.iter().rev().cloned().collect()
        };
        let mut failures: Vec<String> = Vec::new();
        for record in records {
            if let Err(e) = record.lifecycle.destroy().await {
                tracing::warn!("extension `{}` failed to destroy: {e:#}", record.name);
                failures.push(format!("{}: {e:#}", record.name));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            anyhow::bail!("destroy failures: {}", failures.join("; "))
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::SeqCst)
    }

    fn ensure_alive(&self) -> Result<(), Error> {
        if self.is_destroyed() {
            return Err(Error::Destroyed { workspace_id: self.inner.id.clone() });
        }
        Ok(())
    }
}
