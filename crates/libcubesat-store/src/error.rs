use libcubesat_core::CubeError;
use thiserror::Error;

/// Errors raised by the sled-backed storage layer
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Sled(#[from] sled::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database busy: {0}")]
    DbBusy(String),

    #[error("Corrupt record: {0}")]
    Corrupt(String),

    #[error(transparent)]
    Core(#[from] CubeError),
}

impl From<StoreError> for CubeError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Core(inner) => inner,
            StoreError::Io(io) => CubeError::Io(io),
            other => CubeError::Store(other.to_string()),
        }
    }
}
