//! Error taxonomy shared across the control plane.
//!
//! These are kinds, not transport details: the registry returns them upward
//! unchanged, controllers recover locally from `NotFound` and `Conflict`,
//! retry `Transport`, and surface `Invalid`/`Platform` as a `Degraded`
//! condition on the object's status.

/// Typed failure kinds for registry, store, and platform operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Object absent. Controllers treat this as success; the CLI as a user error.
    #[error("not found: {0}")]
    NotFound(String),

    /// Create of an existing `(namespace, name)`.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Optimistic-concurrency failure: the supplied resourceVersion is stale.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Validation rejected the object; carries per-field reasons.
    #[error("invalid object {name}: {field_errors:?}")]
    Invalid {
        name: String,
        field_errors: Vec<String>,
    },

    /// Serialization or I/O failure inside the store.
    #[error("internal: {0}")]
    Internal(String),

    /// Platform network/HTTP failure; presumed transient.
    #[error("transport: {0}")]
    Transport(String),

    /// The platform rejected the operation with a terminal error.
    #[error("platform: {0}")]
    Platform(String),
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::AlreadyExists(_))
    }

    /// Whether a controller should hand this error back to the rate-limited
    /// queue. Terminal kinds (`Invalid`, `Platform`) are not retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::Internal(_))
    }
}
