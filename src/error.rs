//! Engine error kinds.
//!
//! Domain conditions on the hot path (missing rows, invalid values) are
//! expressed as result enums on the helpers, never as errors. The variants
//! here cover programming mistakes and lifecycle misuse only.

/// Errors surfaced by the engine's typed API.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// An identifier or KV key contains a reserved character or is empty.
    ///
    /// This is a programming bug in the caller, not a runtime condition.
    #[error("invalid key `{value}`: {reason}")]
    InvalidKey { value: String, reason: &'static str },

    /// The workspace was already destroyed.
    #[error("workspace `{workspace_id}` is destroyed")]
    Destroyed { workspace_id: String },

    /// An extension name was registered twice on the same workspace.
    #[error("duplicate extension name `{name}`")]
    DuplicateExtension { name: String },

    /// `with_actions` was called more than once.
    #[error("actions already attached to workspace `{workspace_id}`")]
    ActionsAlreadyAttached { workspace_id: String },

    /// An action was invoked that the registry does not contain.
    #[error("unknown action `{name}`")]
    UnknownAction { name: String },
}

impl Error {
    pub(crate) fn invalid_key(value: impl Into<String>, reason: &'static str) -> Self {
        Self::InvalidKey { value: value.into(), reason }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
