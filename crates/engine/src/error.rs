use layeredit_core::{CoreError, FeatureId, LayerId};
use layeredit_storage::StorageError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EditError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("core error: {0}")]
    Core(#[from] CoreError),

    #[error("layer is not in editing mode")]
    NotEditing,

    #[error("feature not found: {0}")]
    NotFound(FeatureId),

    #[error("feature is pending deletion: {0}")]
    Deleted(FeatureId),

    #[error("attribute count mismatch: expected {expected}, got {actual}")]
    SchemaMismatch { expected: usize, actual: usize },

    #[error("invalid field index: {0}")]
    InvalidField(usize),

    #[error("field not found: {0}")]
    FieldNotFound(String),

    #[error("duplicate field name: {0}")]
    DuplicateName(String),

    #[error("field name must not be empty")]
    EmptyFieldName,

    #[error("an edit command is already open: {0}")]
    EditCommandOpen(String),

    #[error("no edit command is open")]
    NoEditCommand,

    #[error("layer not found: {0}")]
    LayerNotFound(LayerId),

    #[error("operation requires a layer without pending edits")]
    PendingEdits,

    #[error("aggregate {0} is not supported for this field")]
    UnsupportedAggregate(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("document error: {0}")]
    Document(#[from] serde_json::Error),
}

impl EditError {
    /// Maps schema-level core errors onto the edit taxonomy.
    pub(crate) fn from_schema(err: CoreError) -> Self {
        match err {
            CoreError::DuplicateName(name) => EditError::DuplicateName(name),
            CoreError::IndexOutOfRange(index) => EditError::InvalidField(index),
            other => EditError::Core(other),
        }
    }
}
