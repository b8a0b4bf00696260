use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::{debug, info, warn};

use layeredit_core::{
    ConstraintKind, ConstraintOrigin, ConstraintStrength, ContextScope, ExpressionEvaluator,
    Feature, FeatureId, FeatureRequest, FieldConstraints, FieldDef, FieldOrigin, FieldSchema,
    FieldValue, Geometry, LayerId, NoEvaluator, Rect, SessionId,
};
use layeredit_storage::FeatureStore;

use crate::buffer::EditBuffer;
use crate::commit::{CommitError, CommitOutcome, commit_buffer};
use crate::config::EditConfig;
use crate::document::{
    DOCUMENT_VERSION, ExpressionFieldDocument, FieldMetadata, LayerDocument, clear_metadata,
};
use crate::error::EditError;
use crate::events::{EventBus, LayerEvent, ListenerId};
use crate::join::{JoinInfo, JoinResolver, RegisteredJoin};
use crate::overlay::FeatureIterator;
use crate::query::{ConstraintViolation, LayerQuery, NoJoinedLayers};
use crate::selection::{SelectBehavior, Selection};
use crate::undo::{EditCommand, EditTarget, UndoStack};
use crate::UndoResult;

/// An open editing session: the pending edits and their history.
#[derive(Debug)]
struct EditSession {
    id: SessionId,
    buffer: EditBuffer,
    undo: UndoStack,
    /// Schema as it was when editing started; restored by rollback.
    fields_at_start: FieldSchema,
}

/// A feature layer over a persistent store, with an optional editing session.
pub struct VectorLayer {
    id: LayerId,
    name: String,
    store: Box<dyn FeatureStore>,
    fields: FieldSchema,
    session: Option<EditSession>,
    expressions: Vec<String>,
    joins: JoinResolver,
    evaluator: Arc<dyn ExpressionEvaluator>,
    variables: BTreeMap<String, FieldValue>,
    selection: Selection,
    events: EventBus,
    config: EditConfig,
    revision: u64,
    commit_errors: Vec<CommitError>,
}

impl VectorLayer {
    pub fn new(name: impl Into<String>, store: impl FeatureStore + 'static) -> Result<Self, EditError> {
        Self::from_boxed(name, Box::new(store))
    }

    pub fn from_boxed(name: impl Into<String>, store: Box<dyn FeatureStore>) -> Result<Self, EditError> {
        let fields = FieldSchema::new(store.fields()?).map_err(EditError::from_schema)?;
        Ok(Self {
            id: LayerId::new(),
            name: name.into(),
            store,
            fields,
            session: None,
            expressions: Vec::new(),
            joins: JoinResolver::default(),
            evaluator: Arc::new(NoEvaluator),
            variables: BTreeMap::new(),
            selection: Selection::default(),
            events: EventBus::new(),
            config: EditConfig::default(),
            revision: 0,
            commit_errors: Vec::new(),
        })
    }

    pub fn with_evaluator(mut self, evaluator: Arc<dyn ExpressionEvaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    pub fn with_config(mut self, config: EditConfig) -> Result<Self, EditError> {
        config.validate()?;
        self.config = config;
        Ok(self)
    }

    pub fn id(&self) -> LayerId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fields(&self) -> &FieldSchema {
        &self.fields
    }

    pub fn config(&self) -> &EditConfig {
        &self.config
    }

    /// Increases on every change visible through the overlay.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn store(&self) -> &dyn FeatureStore {
        self.store.as_ref()
    }

    /// Direct store access. Bypasses the edit buffer; counts as a change.
    pub fn store_mut(&mut self) -> &mut dyn FeatureStore {
        self.revision += 1;
        self.store.as_mut()
    }

    pub fn evaluator(&self) -> Arc<dyn ExpressionEvaluator> {
        Arc::clone(&self.evaluator)
    }

    pub fn edit_buffer(&self) -> Option<&EditBuffer> {
        self.session.as_ref().map(|s| &s.buffer)
    }

    pub fn undo_stack(&self) -> Option<&UndoStack> {
        self.session.as_ref().map(|s| &s.undo)
    }

    /// Failures reported by the last commit.
    pub fn commit_errors(&self) -> &[CommitError] {
        &self.commit_errors
    }

    pub(crate) fn expressions(&self) -> &[String] {
        &self.expressions
    }

    pub(crate) fn join_resolver(&self) -> &JoinResolver {
        &self.joins
    }

    pub(crate) fn layer_scope(&self) -> ContextScope {
        let mut scope = ContextScope::new("layer")
            .with_variable("layer_name", self.name.as_str())
            .with_variable("layer_id", self.id.to_string());
        for (name, value) in &self.variables {
            scope = scope.with_variable(name.as_str(), value.clone());
        }
        scope
    }

    /// Re-reads the store schema. Metadata of fields that keep their name is
    /// preserved.
    pub fn reload_fields(&mut self) -> Result<(), EditError> {
        if self.is_modified() {
            return Err(EditError::PendingEdits);
        }
        let mut rebuilt = FieldSchema::default();
        for mut field in self.store.fields()? {
            if let Some(current) = self.fields.index_of(&field.name).and_then(|i| self.fields.get(i)) {
                field.alias = current.alias.clone();
                field.default_expression = current.default_expression.clone();
                field.constraints = current.constraints.clone();
            }
            rebuilt.push(field).map_err(EditError::from_schema)?;
        }
        append_derived_fields(&mut rebuilt, &self.fields);
        self.fields = rebuilt;
        if let Some(session) = self.session.as_mut() {
            session.fields_at_start = self.fields.clone();
        }
        self.joins.invalidate();
        self.changed(vec![LayerEvent::FieldsChanged]);
        Ok(())
    }

    // ========================================================================
    // Editing session
    // ========================================================================

    /// Opens an editing session. Returns false if one is already open.
    pub fn start_editing(&mut self) -> Result<bool, EditError> {
        if self.session.is_some() {
            return Ok(false);
        }
        let id = SessionId::new();
        info!("layer {}: editing started ({})", self.name, id);
        self.session = Some(EditSession {
            id,
            buffer: EditBuffer::new(),
            undo: UndoStack::new(self.config.undo_depth),
            fields_at_start: self.fields.clone(),
        });
        self.events.emit(&LayerEvent::EditingStarted);
        Ok(true)
    }

    pub fn is_editing(&self) -> bool {
        self.session.is_some()
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.session.as_ref().map(|s| s.id)
    }

    /// True when the session holds uncommitted edits.
    pub fn is_modified(&self) -> bool {
        // Added attributes live only in the schema until commit.
        self.session.as_ref().is_some_and(|s| {
            !s.buffer.is_empty()
                || (0..self.fields.data_field_count())
                    .any(|p| self.fields.origin(p) == Some(FieldOrigin::Edit))
        })
    }

    fn session(&self) -> Result<&EditSession, EditError> {
        self.session.as_ref().ok_or(EditError::NotEditing)
    }

    /// Applies a command to the session and records it for undo.
    fn execute(&mut self, mut command: EditCommand) -> Result<(), EditError> {
        let session = self.session.as_mut().ok_or(EditError::NotEditing)?;
        let event = command.apply(&mut EditTarget {
            buffer: &mut session.buffer,
            fields: &mut self.fields,
        })?;
        debug!("layer {}: {}", self.name, command.label());
        session.undo.push_command(command);
        self.changed(vec![event]);
        Ok(())
    }

    /// Bumps the revision and publishes `events` followed by a repaint.
    fn changed(&mut self, events: Vec<LayerEvent>) {
        self.revision += 1;
        let mut selection_changed = false;
        for event in &events {
            if let LayerEvent::FeatureDeleted(fid) = event {
                selection_changed |= self.selection.remove(*fid);
            }
        }
        for event in &events {
            self.events.emit(event);
        }
        if selection_changed {
            self.events.emit(&LayerEvent::SelectionChanged);
        }
        self.events.emit(&LayerEvent::RepaintRequested);
    }

    fn require_live_feature(&self, fid: FeatureId) -> Result<(), EditError> {
        let session = self.session()?;
        match fid {
            FeatureId::Temporary(_) => {
                if session.buffer.is_feature_added(fid) {
                    Ok(())
                } else {
                    Err(EditError::NotFound(fid))
                }
            }
            FeatureId::Persisted(_) => {
                if session.buffer.is_feature_deleted(fid) {
                    return Err(EditError::Deleted(fid));
                }
                if self.config.validate_persisted_ids && self.store.get_feature(fid)?.is_none() {
                    return Err(EditError::NotFound(fid));
                }
                Ok(())
            }
        }
    }

    fn require_data_field(&self, index: usize) -> Result<(), EditError> {
        match self.fields.origin(index) {
            Some(origin) if origin.is_data() => Ok(()),
            _ => Err(EditError::InvalidField(index)),
        }
    }

    // ========================================================================
    // Feature edits
    // ========================================================================

    /// Adds a feature with a full-schema attribute vector and returns its
    /// temporary id.
    pub fn add_feature(&mut self, feature: Feature) -> Result<FeatureId, EditError> {
        self.session()?;
        self.check_attribute_count(&feature)?;
        self.add_checked(feature)
    }

    /// Adds every feature or none.
    pub fn add_features(&mut self, features: Vec<Feature>) -> Result<Vec<FeatureId>, EditError> {
        self.session()?;
        for feature in &features {
            self.check_attribute_count(feature)?;
        }
        self.in_own_group("add features", |layer| {
            features.into_iter().map(|f| layer.add_checked(f)).collect()
        })
    }

    fn check_attribute_count(&self, feature: &Feature) -> Result<(), EditError> {
        if feature.attributes.len() != self.fields.len() {
            return Err(EditError::SchemaMismatch {
                expected: self.fields.len(),
                actual: feature.attributes.len(),
            });
        }
        Ok(())
    }

    fn add_checked(&mut self, mut feature: Feature) -> Result<FeatureId, EditError> {
        let session = self.session.as_mut().ok_or(EditError::NotEditing)?;
        let fid = session.buffer.allocate_temporary_id();
        feature.id = fid;
        // Joined and expression values are derived on read.
        feature.attributes.truncate(self.fields.data_field_count());
        self.execute(EditCommand::AddFeature { feature })?;
        Ok(fid)
    }

    pub fn delete_feature(&mut self, fid: FeatureId) -> Result<(), EditError> {
        self.require_visible(fid)?;
        self.execute(EditCommand::DeleteFeature { fid, removed: None })
    }

    /// Deletes every feature or none.
    pub fn delete_features(&mut self, fids: &[FeatureId]) -> Result<(), EditError> {
        let unique: BTreeSet<FeatureId> = fids.iter().copied().collect();
        for fid in &unique {
            self.require_visible(*fid)?;
        }
        self.in_own_group("delete features", |layer| {
            for fid in unique {
                layer.execute(EditCommand::DeleteFeature { fid, removed: None })?;
            }
            Ok(())
        })
    }

    fn require_visible(&self, fid: FeatureId) -> Result<(), EditError> {
        match self.require_live_feature(fid) {
            Err(EditError::Deleted(fid)) => Err(EditError::NotFound(fid)),
            other => other,
        }
    }

    pub fn change_attribute_value(
        &mut self,
        fid: FeatureId,
        index: usize,
        value: impl Into<FieldValue>,
    ) -> Result<(), EditError> {
        self.session()?;
        self.require_data_field(index)?;
        self.require_live_feature(fid)?;
        self.execute(EditCommand::ChangeAttributeValue {
            fid,
            index,
            value: value.into(),
            previous: None,
        })
    }

    /// Changes several attributes of one feature as a single undo unit.
    pub fn change_attribute_values(
        &mut self,
        fid: FeatureId,
        values: BTreeMap<usize, FieldValue>,
    ) -> Result<(), EditError> {
        self.session()?;
        for index in values.keys() {
            self.require_data_field(*index)?;
        }
        self.require_live_feature(fid)?;
        self.in_own_group("change attribute values", |layer| {
            for (index, value) in values {
                layer.change_attribute_value(fid, index, value)?;
            }
            Ok(())
        })
    }

    /// Runs `edits` as one undo unit. Inside a caller's open group the edits
    /// simply join it.
    fn in_own_group<T>(
        &mut self,
        label: &str,
        edits: impl FnOnce(&mut Self) -> Result<T, EditError>,
    ) -> Result<T, EditError> {
        if self.session()?.undo.is_group_open() {
            return edits(self);
        }
        self.begin_edit_command(label)?;
        match edits(self) {
            Ok(value) => {
                self.end_edit_command()?;
                Ok(value)
            }
            Err(e) => {
                self.destroy_edit_command()?;
                Err(e)
            }
        }
    }

    pub fn change_geometry(&mut self, fid: FeatureId, geometry: Geometry) -> Result<(), EditError> {
        self.require_live_feature(fid)?;
        self.execute(EditCommand::ChangeGeometry {
            fid,
            geometry,
            previous: None,
        })
    }

    // ========================================================================
    // Schema edits
    // ========================================================================

    /// Appends a field to the data fields and returns its index.
    pub fn add_attribute(&mut self, field: FieldDef) -> Result<usize, EditError> {
        self.session()?;
        if field.name.is_empty() {
            return Err(EditError::EmptyFieldName);
        }
        if self.fields.contains(&field.name) {
            return Err(EditError::DuplicateName(field.name));
        }
        let index = self.fields.data_field_count();
        self.execute(EditCommand::AddAttribute { index, field })?;
        Ok(index)
    }

    /// Deletes a data field, or removes an expression field outright.
    pub fn delete_attribute(&mut self, index: usize) -> Result<(), EditError> {
        match self.fields.origin(index) {
            None | Some(FieldOrigin::Join { .. }) => Err(EditError::InvalidField(index)),
            Some(FieldOrigin::Expression { expression_index }) => {
                self.remove_expression_field(expression_index)
            }
            Some(_) => {
                self.session()?;
                self.execute(EditCommand::DeleteAttribute {
                    index,
                    removed: None,
                })
            }
        }
    }

    /// Deletes data fields, highest index first so the rest stay valid.
    pub fn delete_attributes(&mut self, indices: &[usize]) -> Result<(), EditError> {
        self.session()?;
        let unique: BTreeSet<usize> = indices.iter().copied().collect();
        for index in &unique {
            self.require_data_field(*index)?;
        }
        self.in_own_group("delete attributes", |layer| {
            for index in unique.into_iter().rev() {
                layer.execute(EditCommand::DeleteAttribute {
                    index,
                    removed: None,
                })?;
            }
            Ok(())
        })
    }

    /// Renames a field. Expression fields are renamed immediately, outside
    /// the undo history.
    pub fn rename_attribute(&mut self, index: usize, name: &str) -> Result<(), EditError> {
        let origin = self.fields.origin(index).ok_or(EditError::InvalidField(index))?;
        if name.is_empty() {
            return Err(EditError::EmptyFieldName);
        }
        if self.fields.index_of(name).is_some_and(|i| i != index) {
            return Err(EditError::DuplicateName(name.to_string()));
        }
        match origin {
            FieldOrigin::Join { .. } => Err(EditError::InvalidField(index)),
            FieldOrigin::Expression { .. } => {
                self.fields.rename(index, name).map_err(EditError::from_schema)?;
                self.changed(vec![LayerEvent::AttributeRenamed {
                    index,
                    name: name.to_string(),
                }]);
                Ok(())
            }
            _ => {
                self.session()?;
                self.execute(EditCommand::RenameAttribute {
                    index,
                    name: name.to_string(),
                    previous: None,
                })
            }
        }
    }

    // ========================================================================
    // Undo / redo
    // ========================================================================

    /// Opens a command group; edits until `end_edit_command` undo as one unit.
    pub fn begin_edit_command(&mut self, label: &str) -> Result<(), EditError> {
        let session = self.session.as_mut().ok_or(EditError::NotEditing)?;
        session.undo.begin_group(label)
    }

    /// Closes the open group. Returns false if it recorded nothing.
    pub fn end_edit_command(&mut self) -> Result<bool, EditError> {
        let session = self.session.as_mut().ok_or(EditError::NotEditing)?;
        session.undo.end_group()
    }

    /// Reverts and discards the open command group.
    pub fn destroy_edit_command(&mut self) -> Result<(), EditError> {
        let session = self.session.as_mut().ok_or(EditError::NotEditing)?;
        let mut entry = session.undo.take_open().ok_or(EditError::NoEditCommand)?;
        let mut target = EditTarget {
            buffer: &mut session.buffer,
            fields: &mut self.fields,
        };
        let events = match entry.revert_all(&mut target) {
            Ok(events) => events,
            Err(e) => {
                session.undo.reopen(entry);
                return Err(e);
            }
        };
        debug!("layer {}: discarded command '{}'", self.name, entry.label);
        self.changed(events);
        Ok(())
    }

    pub fn undo(&mut self) -> Result<UndoResult, EditError> {
        let Some(session) = self.session.as_mut() else {
            return Ok(UndoResult::Empty);
        };
        if session.undo.is_group_open() {
            return Ok(UndoResult::Empty);
        }
        let Some(mut entry) = session.undo.pop_undo() else {
            return Ok(UndoResult::Empty);
        };
        let mut target = EditTarget {
            buffer: &mut session.buffer,
            fields: &mut self.fields,
        };
        let events = match entry.revert_all(&mut target) {
            Ok(events) => events,
            Err(e) => {
                session.undo.push_undo(entry);
                return Err(e);
            }
        };
        let label = entry.label.clone();
        session.undo.push_redo(entry);
        debug!("layer {}: undo '{}'", self.name, label);
        self.changed(events);
        Ok(UndoResult::Applied(label))
    }

    pub fn redo(&mut self) -> Result<UndoResult, EditError> {
        let Some(session) = self.session.as_mut() else {
            return Ok(UndoResult::Empty);
        };
        if session.undo.is_group_open() {
            return Ok(UndoResult::Empty);
        }
        let Some(mut entry) = session.undo.pop_redo() else {
            return Ok(UndoResult::Empty);
        };
        let mut target = EditTarget {
            buffer: &mut session.buffer,
            fields: &mut self.fields,
        };
        let events = match entry.apply_all(&mut target) {
            Ok(events) => events,
            Err(e) => {
                session.undo.push_redo(entry);
                return Err(e);
            }
        };
        let label = entry.label.clone();
        session.undo.push_undo(entry);
        debug!("layer {}: redo '{}'", self.name, label);
        self.changed(events);
        Ok(UndoResult::Applied(label))
    }

    // ========================================================================
    // Commit / rollback
    // ========================================================================

    /// Writes pending edits to the store.
    ///
    /// Item failures are reported in the outcome and stay pending; the undo
    /// history is cleared either way. A fully successful commit ends the
    /// session when `end_session_on_commit` is set.
    pub fn commit_changes(&mut self) -> Result<CommitOutcome, EditError> {
        let session = self.session.as_mut().ok_or(EditError::NotEditing)?;
        if session.undo.is_group_open() {
            let label = session.undo.open_label().unwrap_or_default().to_string();
            return Err(EditError::EditCommandOpen(label));
        }
        info!("layer {}: committing session {}", self.name, session.id);
        let outcome = commit_buffer(self.store.as_mut(), &mut self.fields, &mut session.buffer);
        session.undo.clear();
        session.fields_at_start = self.fields.clone();

        let success = outcome.is_success();
        if success && self.config.end_session_on_commit {
            self.session = None;
        }
        self.commit_errors = outcome.errors.clone();
        self.selection.remap(&outcome.assigned_ids);

        let mut events = Vec::new();
        if !outcome.assigned_ids.is_empty() {
            events.push(LayerEvent::CommittedFeaturesAdded(outcome.assigned_ids.clone()));
        }
        events.push(LayerEvent::AfterCommit { success });
        self.changed(events);
        Ok(outcome)
    }

    /// Discards the session and its edits. Returns false if not editing.
    pub fn rollback(&mut self) -> bool {
        let Some(session) = self.session.take() else {
            return false;
        };
        info!("layer {}: rolled back session {}", self.name, session.id);
        self.fields = restore_data_fields(&session.fields_at_start, &self.fields);
        let temporary: BTreeSet<FeatureId> = self
            .selection
            .ids()
            .iter()
            .copied()
            .filter(FeatureId::is_temporary)
            .collect();
        let mut events = vec![LayerEvent::AfterRollback];
        if self.selection.apply(temporary, SelectBehavior::RemoveFrom) {
            events.push(LayerEvent::SelectionChanged);
        }
        self.revision += 1;
        for event in &events {
            self.events.emit(event);
        }
        self.events.emit(&LayerEvent::RepaintRequested);
        true
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Reads this layer on its own; join blocks read as null.
    pub fn query(&self) -> LayerQuery<'_> {
        LayerQuery::new(self, &NoJoinedLayers)
    }

    pub fn get_features(&self, request: &FeatureRequest) -> Result<FeatureIterator, EditError> {
        self.query().get_features(request)
    }

    pub fn get_feature(&self, fid: FeatureId) -> Result<Feature, EditError> {
        self.query().get_feature(fid)
    }

    /// Store count adjusted by pending deletions and additions.
    pub fn feature_count(&self) -> Result<u64, EditError> {
        let stored = self.store.feature_count()?;
        Ok(match self.edit_buffer() {
            Some(buffer) => {
                stored.saturating_sub(buffer.deleted_feature_ids().len() as u64)
                    + buffer.added_features().len() as u64
            }
            None => stored,
        })
    }

    // ========================================================================
    // Expression fields
    // ========================================================================

    /// Appends a computed field and returns its index.
    pub fn add_expression_field(&mut self, expression: &str, field: FieldDef) -> Result<usize, EditError> {
        if field.name.is_empty() {
            return Err(EditError::EmptyFieldName);
        }
        let expression_index = self.expressions.len();
        let index = self
            .fields
            .push(field.with_origin(FieldOrigin::Expression { expression_index }))
            .map_err(EditError::from_schema)?;
        self.expressions.push(expression.to_string());
        self.changed(vec![LayerEvent::FieldsChanged]);
        Ok(index)
    }

    pub fn update_expression_field(&mut self, expression_index: usize, expression: &str) -> Result<(), EditError> {
        let slot = self
            .expressions
            .get_mut(expression_index)
            .ok_or(EditError::InvalidField(expression_index))?;
        *slot = expression.to_string();
        self.changed(vec![LayerEvent::FieldsChanged]);
        Ok(())
    }

    pub fn remove_expression_field(&mut self, expression_index: usize) -> Result<(), EditError> {
        let position = self
            .fields
            .expression_position(expression_index)
            .ok_or(EditError::InvalidField(expression_index))?;
        self.fields.remove(position).map_err(EditError::from_schema)?;
        self.expressions.remove(expression_index);
        for position in 0..self.fields.len() {
            if let Some(field) = self.fields.get_mut(position)
                && let FieldOrigin::Expression { expression_index: e } = field.origin
                && e > expression_index
            {
                field.origin = FieldOrigin::Expression { expression_index: e - 1 };
            }
        }
        self.changed(vec![LayerEvent::FieldsChanged]);
        Ok(())
    }

    /// Expression text of the field at `index`, if it is an expression field.
    pub fn expression_field(&self, index: usize) -> Option<&str> {
        match self.fields.origin(index)? {
            FieldOrigin::Expression { expression_index } => {
                self.expressions.get(expression_index).map(String::as_str)
            }
            _ => None,
        }
    }

    // ========================================================================
    // Joins
    // ========================================================================

    pub fn joins(&self) -> Vec<&JoinInfo> {
        self.joins.joins().iter().map(|j| &j.info).collect()
    }

    pub(crate) fn register_join(
        &mut self,
        info: JoinInfo,
        joined_name: &str,
        joined_fields: &FieldSchema,
    ) -> Result<(), EditError> {
        if !self.fields.contains(&info.target_field) {
            return Err(EditError::FieldNotFound(info.target_field));
        }
        let join_index = self.joins.len();
        let (defs, source_fields) =
            JoinResolver::block_fields(&info, join_index, joined_name, joined_fields, &self.fields);
        let mut position = self.fields.join_insert_position();
        for def in defs {
            self.fields.insert(position, def).map_err(EditError::from_schema)?;
            position += 1;
        }
        info!(
            "layer {}: joined {} fields from {}",
            self.name,
            source_fields.len(),
            joined_name
        );
        self.joins.push(RegisteredJoin { info, source_fields });
        self.changed(vec![LayerEvent::FieldsChanged]);
        Ok(())
    }

    pub(crate) fn unregister_join(&mut self, join_layer: LayerId) -> Option<JoinInfo> {
        let join_index = self.joins.position_of(join_layer)?;
        for position in self.fields.join_positions(join_index).into_iter().rev() {
            if let Err(e) = self.fields.remove(position) {
                warn!("cannot remove joined field at {}: {}", position, e);
            }
        }
        for position in 0..self.fields.len() {
            if let Some(field) = self.fields.get_mut(position)
                && let FieldOrigin::Join { join_index: j, source_index } = field.origin
                && j > join_index
            {
                field.origin = FieldOrigin::Join {
                    join_index: j - 1,
                    source_index,
                };
            }
        }
        let removed = self.joins.remove(join_index);
        self.changed(vec![LayerEvent::FieldsChanged]);
        Some(removed.info)
    }

    // ========================================================================
    // Field metadata
    // ========================================================================

    fn field_mut(&mut self, index: usize) -> Result<&mut FieldDef, EditError> {
        self.fields.get_mut(index).ok_or(EditError::InvalidField(index))
    }

    /// Sets the alias; `None` or an empty alias clears it.
    pub fn set_field_alias(&mut self, index: usize, alias: Option<&str>) -> Result<(), EditError> {
        self.field_mut(index)?.alias = alias.filter(|a| !a.is_empty()).map(str::to_string);
        Ok(())
    }

    pub fn remove_field_alias(&mut self, index: usize) -> Result<(), EditError> {
        self.set_field_alias(index, None)
    }

    pub fn attribute_alias(&self, index: usize) -> Option<&str> {
        self.fields.get(index)?.alias.as_deref()
    }

    pub fn attribute_display_name(&self, index: usize) -> Option<&str> {
        self.fields.get(index).map(FieldDef::display_name)
    }

    pub fn set_default_value_expression(&mut self, index: usize, expression: Option<&str>) -> Result<(), EditError> {
        self.field_mut(index)?.default_expression =
            expression.filter(|e| !e.is_empty()).map(str::to_string);
        Ok(())
    }

    pub fn default_value_expression(&self, index: usize) -> Option<&str> {
        self.fields.get(index)?.default_expression.as_deref()
    }

    pub fn default_value(&self, index: usize, feature: Option<&Feature>) -> FieldValue {
        self.query().default_value(index, feature, None)
    }

    pub fn check_constraints(&self, feature: &Feature) -> Result<Vec<ConstraintViolation>, EditError> {
        self.query().check_constraints(feature)
    }

    /// Adds or replaces a layer-origin constraint.
    pub fn set_field_constraint(
        &mut self,
        index: usize,
        kind: ConstraintKind,
        strength: ConstraintStrength,
    ) -> Result<(), EditError> {
        self.field_mut(index)?
            .constraints
            .set(kind, ConstraintOrigin::Layer, strength);
        Ok(())
    }

    pub fn remove_field_constraint(&mut self, index: usize, kind: ConstraintKind) -> Result<(), EditError> {
        self.field_mut(index)?.constraints.remove(kind);
        Ok(())
    }

    pub fn field_constraints(&self, index: usize) -> Option<&FieldConstraints> {
        self.fields.get(index).map(|f| &f.constraints)
    }

    pub fn set_constraint_expression(
        &mut self,
        index: usize,
        expression: Option<&str>,
        description: Option<&str>,
    ) -> Result<(), EditError> {
        self.field_mut(index)?.constraints.set_expression(
            expression.map(str::to_string),
            description.map(str::to_string),
        );
        Ok(())
    }

    pub fn constraint_expression(&self, index: usize) -> Option<&str> {
        self.fields.get(index)?.constraints.expression()
    }

    pub fn constraint_description(&self, index: usize) -> Option<&str> {
        self.fields.get(index)?.constraints.description()
    }

    /// Serializes field metadata and expression fields.
    pub fn write_document(&self) -> LayerDocument {
        let mut fields = Vec::new();
        let mut expression_fields = Vec::new();
        for field in &self.fields {
            match field.origin {
                FieldOrigin::Join { .. } => continue,
                FieldOrigin::Expression { expression_index } => {
                    if let Some(expression) = self.expressions.get(expression_index) {
                        expression_fields.push(ExpressionFieldDocument {
                            name: field.name.clone(),
                            field_type: field.field_type,
                            expression: expression.clone(),
                        });
                    }
                }
                _ => {}
            }
            let meta = FieldMetadata::from_field(field);
            if !meta.is_empty() {
                fields.push(meta);
            }
        }
        LayerDocument {
            version: DOCUMENT_VERSION,
            name: self.name.clone(),
            fields,
            expression_fields,
            variables: self.variables.clone(),
        }
    }

    pub fn write_document_json(&self) -> Result<String, EditError> {
        Ok(serde_json::to_string_pretty(&self.write_document())?)
    }

    /// Applies a document: missing expression fields are added, and every
    /// field takes the metadata recorded under its name (or none).
    pub fn read_document(&mut self, document: &LayerDocument) -> Result<(), EditError> {
        for expression_field in &document.expression_fields {
            if !self.fields.contains(&expression_field.name) {
                self.add_expression_field(
                    &expression_field.expression,
                    FieldDef::new(expression_field.name.clone(), expression_field.field_type),
                )?;
            }
        }
        for position in 0..self.fields.len() {
            let Some(field) = self.fields.get_mut(position) else {
                continue;
            };
            if matches!(field.origin, FieldOrigin::Join { .. }) {
                continue;
            }
            match document.fields.iter().find(|m| m.name == field.name) {
                Some(meta) => meta.apply_to(field),
                None => clear_metadata(field),
            }
        }
        self.variables = document.variables.clone();
        Ok(())
    }

    pub fn read_document_json(&mut self, json: &str) -> Result<(), EditError> {
        let document: LayerDocument = serde_json::from_str(json)?;
        self.read_document(&document)
    }

    // ========================================================================
    // Variables
    // ========================================================================

    pub fn set_variable(&mut self, name: impl Into<String>, value: impl Into<FieldValue>) {
        self.variables.insert(name.into(), value.into());
        self.revision += 1;
    }

    pub fn remove_variable(&mut self, name: &str) -> Option<FieldValue> {
        let removed = self.variables.remove(name);
        if removed.is_some() {
            self.revision += 1;
        }
        removed
    }

    pub fn variables(&self) -> &BTreeMap<String, FieldValue> {
        &self.variables
    }

    // ========================================================================
    // Selection
    // ========================================================================

    pub fn selection(&self) -> &Selection {
        &self.selection
    }

    pub fn selected_feature_ids(&self) -> &BTreeSet<FeatureId> {
        self.selection.ids()
    }

    pub fn selected_feature_count(&self) -> usize {
        self.selection.len()
    }

    pub fn selected_features(&self) -> Result<Vec<Feature>, EditError> {
        if self.selection.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self
            .get_features(&FeatureRequest::fids(self.selection.ids().iter().copied()))?
            .collect())
    }

    pub fn select_by_ids(&mut self, ids: impl IntoIterator<Item = FeatureId>, behavior: SelectBehavior) {
        let ids = ids.into_iter().collect();
        if self.selection.apply(ids, behavior) {
            self.events.emit(&LayerEvent::SelectionChanged);
        }
    }

    /// Selects features matching a filter expression; returns how many matched.
    pub fn select_by_expression(&mut self, expression: &str, behavior: SelectBehavior) -> Result<usize, EditError> {
        let ids: BTreeSet<FeatureId> = self
            .get_features(&FeatureRequest::expression(expression))?
            .map(|f| f.id)
            .collect();
        let matched = ids.len();
        self.select_by_ids(ids, behavior);
        Ok(matched)
    }

    pub fn select_by_rect(&mut self, rect: Rect, behavior: SelectBehavior) -> Result<usize, EditError> {
        let ids: BTreeSet<FeatureId> = self
            .get_features(&FeatureRequest::rect(rect))?
            .map(|f| f.id)
            .collect();
        let matched = ids.len();
        self.select_by_ids(ids, behavior);
        Ok(matched)
    }

    pub fn remove_selection(&mut self) {
        if self.selection.clear() {
            self.events.emit(&LayerEvent::SelectionChanged);
        }
    }

    // ========================================================================
    // Events
    // ========================================================================

    pub fn subscribe(&mut self, listener: impl FnMut(&LayerEvent) + 'static) -> ListenerId {
        self.events.subscribe(listener)
    }

    pub fn unsubscribe(&mut self, id: ListenerId) -> bool {
        self.events.unsubscribe(id)
    }

    pub fn trigger_repaint(&mut self) {
        self.events.emit(&LayerEvent::RepaintRequested);
    }
}

impl std::fmt::Debug for VectorLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VectorLayer")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("fields", &self.fields.names())
            .field("editing", &self.session.is_some())
            .field("revision", &self.revision)
            .finish()
    }
}

/// The data prefix of `start` followed by the derived fields of `current`.
/// Metadata set during the session on surviving store fields is kept.
fn restore_data_fields(start: &FieldSchema, current: &FieldSchema) -> FieldSchema {
    let mut restored = FieldSchema::default();
    for field in start.iter().take_while(|f| f.origin.is_data()) {
        let mut field = field.clone();
        if let Some(live) = current.iter().find(|c| c.origin == field.origin) {
            field.alias = live.alias.clone();
            field.default_expression = live.default_expression.clone();
            field.constraints = live.constraints.clone();
        }
        if let Err(e) = restored.push(field) {
            warn!("cannot restore field: {}", e);
        }
    }
    append_derived_fields(&mut restored, current);
    restored
}

fn append_derived_fields(target: &mut FieldSchema, source: &FieldSchema) {
    for field in source.iter().filter(|f| !f.origin.is_data()) {
        if let Err(e) = target.push(field.clone()) {
            warn!("dropping derived field '{}': {}", field.name, e);
        }
    }
}
