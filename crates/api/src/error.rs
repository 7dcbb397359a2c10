use porch_core::PorchError;
use serde::{Deserialize, Serialize};

/// API errors suitable for transport over RPC later.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "reason", content = "message", rename_all = "snake_case")]
pub enum ApiError {
    #[error("validation: {0}")]
    Validation(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("already_exists: {0}")]
    AlreadyExists(String),
    #[error("immutable: {0}")]
    Immutable(String),
    #[error("internal: {0}")]
    Internal(String),
}

pub type ApiResult<T> = Result<T, ApiError>;

impl From<PorchError> for ApiError {
    fn from(e: PorchError) -> Self {
        match e {
            PorchError::Validation(m) => Self::Validation(m),
            PorchError::Render(m) => Self::Validation(format!("render failed: {m}")),
            PorchError::NotFound(m) => Self::NotFound(m),
            PorchError::AlreadyExists(m) => Self::AlreadyExists(m),
            PorchError::Conflict(m) => Self::Conflict(m),
            PorchError::Immutable(m) => Self::Immutable(m),
            e @ (PorchError::Backend(_) | PorchError::Injection(_) | PorchError::Expansion(_)) => Self::Internal(e.to_string()),
        }
    }
}
