//! Error kinds shared by the repository, store and reconcilers.

/// Result alias using [`PorchError`].
pub type PorchResult<T> = Result<T, PorchError>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PorchError {
    /// Intent object malformed; surfaced as `Stalled`, never retried.
    #[error("validation: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    /// Optimistic-concurrency collision; retried internally.
    #[error("conflict: {0}")]
    Conflict(String),
    /// Attempt to mutate a revision that is not a draft.
    #[error("immutable: {0}")]
    Immutable(String),
    /// Storage or cluster I/O failure.
    #[error("backend: {0}")]
    Backend(String),
    #[error("injection: {0}")]
    Injection(String),
    /// PackageVariantSet template evaluation failure.
    #[error("expansion: {0}")]
    Expansion(String),
    #[error("render failed: {0}")]
    Render(String),
}

impl PorchError {
    #[must_use]
    pub fn validation(msg: impl Into<String>) -> Self { Self::Validation(msg.into()) }
    #[must_use]
    pub fn not_found(msg: impl Into<String>) -> Self { Self::NotFound(msg.into()) }
    #[must_use]
    pub fn conflict(msg: impl Into<String>) -> Self { Self::Conflict(msg.into()) }
    #[must_use]
    pub fn backend(msg: impl Into<String>) -> Self { Self::Backend(msg.into()) }
    #[must_use]
    pub fn expansion(msg: impl Into<String>) -> Self { Self::Expansion(msg.into()) }

    /// Transient kinds that a reconcile should retry with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict(_) | Self::Backend(_))
    }

    /// Short machine-readable kind, used as a condition reason and metric label.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "Validation",
            Self::NotFound(_) => "NotFound",
            Self::AlreadyExists(_) => "AlreadyExists",
            Self::Conflict(_) => "Conflict",
            Self::Immutable(_) => "Immutable",
            Self::Backend(_) => "Backend",
            Self::Injection(_) => "Injection",
            Self::Expansion(_) => "Expansion",
            Self::Render(_) => "RenderFailure",
        }
    }
}

impl From<serde_json::Error> for PorchError {
    fn from(e: serde_json::Error) -> Self { Self::Backend(format!("serialization: {e}")) }
}
