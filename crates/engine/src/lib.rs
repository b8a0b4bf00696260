pub mod aggregate;
pub mod buffer;
pub mod commit;
pub mod config;
pub mod document;
pub mod error;
pub mod events;
pub mod join;
pub mod layer;
pub mod overlay;
pub mod project;
pub mod query;
pub mod selection;
pub mod undo;

pub use aggregate::{Aggregate, AggregateParameters};
pub use buffer::EditBuffer;
pub use commit::{CommitError, CommitOutcome, CommitStage, CommitTarget};
pub use config::{DEFAULT_UNDO_DEPTH, EditConfig};
pub use document::{ConstraintDocument, ExpressionFieldDocument, FieldMetadata, LayerDocument};
pub use error::EditError;
pub use events::{EventBus, LayerEvent, ListenerId};
pub use join::JoinInfo;
pub use layer::VectorLayer;
pub use overlay::FeatureIterator;
pub use project::Project;
pub use query::{ConstraintViolation, LayerLookup, LayerQuery, NoJoinedLayers};
pub use selection::{SelectBehavior, Selection};
pub use undo::{EditCommand, UndoEntry, UndoStack};

/// Outcome of an undo or redo request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UndoResult {
    /// A unit was reverted or reapplied; carries its label.
    Applied(String),
    /// Nothing to do: no session, an empty history, or an open command group.
    Empty,
}
