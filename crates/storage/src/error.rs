use layeredit_core::FeatureId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("store cannot address temporary feature {0}")]
    InvalidId(FeatureId),

    #[error("attribute count mismatch: expected {expected}, got {actual}")]
    SchemaMismatch { expected: usize, actual: usize },

    #[error("operation rejected: {0}")]
    Rejected(String),

    #[error("core error: {0}")]
    Core(#[from] layeredit_core::CoreError),
}
