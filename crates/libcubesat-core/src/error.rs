use thiserror::Error;

use crate::types::ids::{short_hash, EntryHash};

/// Main error type for cubesat operations
#[derive(Debug, Error)]
pub enum CubeError {
    #[error("not ready: {0}")]
    NotReady(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("could not fetch entry {}", short_hash(.hash))]
    Fetch { hash: EntryHash },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid arguments: {0}")]
    InvalidArgs(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("ID parse error: {0}")]
    IdParse(#[from] crate::types::ids::IdParseError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl CubeError {
    /// Stable machine-readable error code
    pub fn error_code(&self) -> &'static str {
        match self {
            CubeError::NotReady(_) => "not_ready",
            CubeError::NotFound(_) => "not_found",
            CubeError::Fetch { .. } => "fetch_error",
            CubeError::Validation(_) => "validation_error",
            CubeError::Conflict(_) => "conflict",
            CubeError::InvalidArgs(_) => "invalid_args",
            CubeError::Codec(_) => "validation_error",
            CubeError::Store(_) => "store_error",
            CubeError::Io(_) => "io_error",
            CubeError::Json(_) => "internal_error",
            CubeError::TomlParse(_) => "invalid_args",
            CubeError::TomlSerialize(_) => "internal_error",
            CubeError::IdParse(_) => "invalid_args",
            CubeError::Internal(_) => "internal_error",
        }
    }

    /// Whether retrying the same call later could succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, CubeError::Fetch { .. } | CubeError::Store(_) | CubeError::Io(_))
    }

    /// Create a NotFound error for a document id
    pub fn doc_not_found(doc_id: &str) -> Self {
        CubeError::NotFound(format!("document '{}' not found", doc_id))
    }

    /// Create a NotFound error for an entry hash
    pub fn entry_not_found(hash: &EntryHash) -> Self {
        CubeError::NotFound(format!("entry {} not found", short_hash(hash)))
    }
}
