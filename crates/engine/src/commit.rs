use std::collections::{BTreeMap, BTreeSet};

use tracing::{info, warn};

use layeredit_core::{Feature, FeatureId, FieldOrigin, FieldSchema, FieldValue};
use layeredit_storage::{FeatureStore, StorageError};

use crate::buffer::EditBuffer;

/// Commit phases, in the order they run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CommitStage {
    DeleteAttributes,
    AddAttributes,
    RenameAttributes,
    ChangeGeometries,
    ChangeAttributeValues,
    DeleteFeatures,
    AddFeatures,
}

impl CommitStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DeleteAttributes => "delete attributes",
            Self::AddAttributes => "add attributes",
            Self::RenameAttributes => "rename attributes",
            Self::ChangeGeometries => "change geometries",
            Self::ChangeAttributeValues => "change attribute values",
            Self::DeleteFeatures => "delete features",
            Self::AddFeatures => "add features",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitTarget {
    Layer,
    Field(String),
    /// A committed field addressed by its store index.
    StoreField(usize),
    Feature(FeatureId),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommitError {
    pub stage: CommitStage,
    pub target: CommitTarget,
    pub message: String,
}

/// Result of a commit: per-item failures plus the ids the store assigned to
/// features added during the session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommitOutcome {
    pub errors: Vec<CommitError>,
    pub assigned_ids: BTreeMap<FeatureId, FeatureId>,
}

impl CommitOutcome {
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }

    fn record(&mut self, stage: CommitStage, target: CommitTarget, err: impl std::fmt::Display) {
        let message = err.to_string();
        warn!("commit {} failed for {:?}: {}", stage.as_str(), target, message);
        self.errors.push(CommitError {
            stage,
            target,
            message,
        });
    }
}

/// Writes the buffer to the store item by item.
///
/// Items the store accepts leave the buffer; failed items stay pending.
/// `fields` is kept in step with the store: deletions shift store origins and
/// accepted additions become store fields.
pub(crate) fn commit_buffer(
    store: &mut dyn FeatureStore,
    fields: &mut FieldSchema,
    buffer: &mut EditBuffer,
) -> CommitOutcome {
    let mut outcome = CommitOutcome::default();

    delete_attributes(store, fields, buffer, &mut outcome);
    add_attributes(store, fields, &mut outcome);
    rename_attributes(store, buffer, &mut outcome);
    change_geometries(store, buffer, &mut outcome);
    change_attribute_values(store, fields, buffer, &mut outcome);
    delete_features(store, buffer, &mut outcome);
    add_features(store, fields, buffer, &mut outcome);

    info!(
        "commit finished: {} errors, {} features added",
        outcome.errors.len(),
        outcome.assigned_ids.len()
    );
    outcome
}

fn delete_attributes(
    store: &mut dyn FeatureStore,
    fields: &mut FieldSchema,
    buffer: &mut EditBuffer,
    outcome: &mut CommitOutcome,
) {
    let deleted = buffer.take_deleted_attribute_ids();
    // Highest index first so lower pending indices stay valid.
    for store_index in deleted.into_iter().rev() {
        match store.delete_attributes(&BTreeSet::from([store_index])) {
            Ok(()) => {
                shift_store_origins(fields, store_index);
                buffer.shift_renames_after_store_delete(store_index);
            }
            Err(e) => {
                buffer.restore_deleted_attribute_id(store_index);
                outcome.record(CommitStage::DeleteAttributes, CommitTarget::StoreField(store_index), e);
            }
        }
    }
}

fn shift_store_origins(fields: &mut FieldSchema, removed: usize) {
    for position in 0..fields.data_field_count() {
        if let Some(field) = fields.get_mut(position)
            && let FieldOrigin::Store { store_index } = field.origin
            && store_index > removed
        {
            field.origin = FieldOrigin::Store {
                store_index: store_index - 1,
            };
        }
    }
}

fn add_attributes(store: &mut dyn FeatureStore, fields: &mut FieldSchema, outcome: &mut CommitOutcome) {
    let pending: Vec<usize> = (0..fields.data_field_count())
        .filter(|p| fields.origin(*p) == Some(FieldOrigin::Edit))
        .collect();
    if pending.is_empty() {
        return;
    }
    let mut store_len = match store.fields() {
        Ok(current) => current.len(),
        Err(e) => {
            outcome.record(CommitStage::AddAttributes, CommitTarget::Layer, e);
            return;
        }
    };
    for position in pending {
        let Some(field) = fields.get_mut(position) else {
            continue;
        };
        let mut def = field.clone();
        def.origin = FieldOrigin::Store {
            store_index: store_len,
        };
        match store.add_attributes(&[def]) {
            Ok(()) => {
                field.origin = FieldOrigin::Store {
                    store_index: store_len,
                };
                store_len += 1;
            }
            Err(e) => {
                let name = field.name.clone();
                outcome.record(CommitStage::AddAttributes, CommitTarget::Field(name), e);
            }
        }
    }
}

fn rename_attributes(store: &mut dyn FeatureStore, buffer: &mut EditBuffer, outcome: &mut CommitOutcome) {
    let renames = buffer.renamed_attributes().clone();
    if renames.is_empty() {
        return;
    }
    // Names are unique only as a set, so swaps must reach the store together.
    match store.rename_attributes(&renames) {
        Ok(()) => {
            for store_index in renames.keys() {
                buffer.clear_rename(*store_index);
            }
            return;
        }
        Err(e) => warn!("batched rename rejected, retrying per field: {}", e),
    }
    for (store_index, name) in renames {
        match store.rename_attributes(&BTreeMap::from([(store_index, name.clone())])) {
            Ok(()) => buffer.clear_rename(store_index),
            Err(e) => outcome.record(CommitStage::RenameAttributes, CommitTarget::Field(name), e),
        }
    }
}

fn change_geometries(store: &mut dyn FeatureStore, buffer: &mut EditBuffer, outcome: &mut CommitOutcome) {
    let changes = buffer.changed_geometries().clone();
    for (fid, geometry) in changes {
        match store.change_geometries(&BTreeMap::from([(fid, geometry)])) {
            Ok(()) => buffer.clear_changed_geometry(fid),
            Err(e) => outcome.record(CommitStage::ChangeGeometries, CommitTarget::Feature(fid), e),
        }
    }
}

fn change_attribute_values(
    store: &mut dyn FeatureStore,
    fields: &FieldSchema,
    buffer: &mut EditBuffer,
    outcome: &mut CommitOutcome,
) {
    let changes = buffer.changed_attribute_values().clone();
    for (fid, values) in changes {
        let mut translated = BTreeMap::new();
        let mut positions = BTreeSet::new();
        for (position, value) in values {
            match fields.origin(position) {
                Some(FieldOrigin::Store { store_index }) => {
                    translated.insert(store_index, value);
                    positions.insert(position);
                }
                _ => {
                    let name = fields
                        .get(position)
                        .map(|f| f.name.clone())
                        .unwrap_or_default();
                    outcome.record(
                        CommitStage::ChangeAttributeValues,
                        CommitTarget::Field(name),
                        StorageError::NotFound(format!("field at {} is not in the store", position)),
                    );
                }
            }
        }
        if translated.is_empty() {
            continue;
        }
        match store.change_attribute_values(&BTreeMap::from([(fid, translated)])) {
            Ok(()) => buffer.clear_changed_values(fid, &positions),
            Err(e) => outcome.record(CommitStage::ChangeAttributeValues, CommitTarget::Feature(fid), e),
        }
    }
}

fn delete_features(store: &mut dyn FeatureStore, buffer: &mut EditBuffer, outcome: &mut CommitOutcome) {
    let deleted = buffer.deleted_feature_ids().clone();
    for fid in deleted {
        match store.delete_features(&[fid]) {
            Ok(()) => buffer.clear_deleted(fid),
            Err(e) => outcome.record(CommitStage::DeleteFeatures, CommitTarget::Feature(fid), e),
        }
    }
}

fn add_features(
    store: &mut dyn FeatureStore,
    fields: &FieldSchema,
    buffer: &mut EditBuffer,
    outcome: &mut CommitOutcome,
) {
    if buffer.added_features().is_empty() {
        return;
    }
    let store_len = match store.fields() {
        Ok(current) => current.len(),
        Err(e) => {
            outcome.record(CommitStage::AddFeatures, CommitTarget::Layer, e);
            return;
        }
    };
    let added = buffer.added_features().clone();
    for (temporary, feature) in added {
        let mut attributes = vec![FieldValue::Null; store_len];
        for (position, value) in feature.attributes.iter().enumerate() {
            if let Some(FieldOrigin::Store { store_index }) = fields.origin(position)
                && store_index < store_len
            {
                attributes[store_index] = value.clone();
            }
        }
        let mut row = Feature::new(attributes);
        row.geometry = feature.geometry.clone();
        let mut rows = [row];
        match store.add_features(&mut rows) {
            Ok(()) => {
                outcome.assigned_ids.insert(temporary, rows[0].id);
                buffer.remove_added(temporary);
            }
            Err(e) => outcome.record(CommitStage::AddFeatures, CommitTarget::Feature(temporary), e),
        }
    }
}
