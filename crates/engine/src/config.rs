use serde::{Deserialize, Serialize};

use crate::error::EditError;

pub const DEFAULT_UNDO_DEPTH: usize = 100;

/// Per-layer editing configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EditConfig {
    /// Oldest undo units are dropped beyond this many.
    pub undo_depth: usize,
    /// Check that persisted ids exist in the store before editing them.
    pub validate_persisted_ids: bool,
    /// End the editing session after a fully successful commit.
    pub end_session_on_commit: bool,
}

impl Default for EditConfig {
    fn default() -> Self {
        Self {
            undo_depth: DEFAULT_UNDO_DEPTH,
            validate_persisted_ids: true,
            end_session_on_commit: true,
        }
    }
}

impl EditConfig {
    pub fn from_json(json: &str) -> Result<Self, EditError> {
        let config: EditConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), EditError> {
        if self.undo_depth == 0 {
            return Err(EditError::InvalidConfig("undo_depth must be at least 1".into()));
        }
        Ok(())
    }
}
