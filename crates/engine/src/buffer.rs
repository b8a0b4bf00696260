use std::collections::{BTreeMap, BTreeSet};

use layeredit_core::{Feature, FeatureId, FieldValue, Geometry};

/// Values removed together with an attribute slot, kept so the slot can be restored.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemovedSlot {
    pub added_values: BTreeMap<FeatureId, FieldValue>,
    pub changed_values: BTreeMap<FeatureId, FieldValue>,
}

/// Pending, uncommitted edits layered over a store.
///
/// Attribute indices used here are layer data-field positions (the
/// store/pending-added prefix of the schema). Attribute vectors of added
/// features cover exactly that prefix. Deleted and renamed attributes are
/// keyed by store index since they only concern committed fields.
#[derive(Debug, Clone, PartialEq)]
pub struct EditBuffer {
    added_features: BTreeMap<FeatureId, Feature>,
    deleted_feature_ids: BTreeSet<FeatureId>,
    changed_attributes: BTreeMap<FeatureId, BTreeMap<usize, FieldValue>>,
    changed_geometries: BTreeMap<FeatureId, Geometry>,
    deleted_attribute_ids: BTreeSet<usize>,
    renamed_attributes: BTreeMap<usize, String>,
    next_temporary: u64,
}

impl Default for EditBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl EditBuffer {
    pub fn new() -> Self {
        Self {
            added_features: BTreeMap::new(),
            deleted_feature_ids: BTreeSet::new(),
            changed_attributes: BTreeMap::new(),
            changed_geometries: BTreeMap::new(),
            deleted_attribute_ids: BTreeSet::new(),
            renamed_attributes: BTreeMap::new(),
            next_temporary: 1,
        }
    }

    pub fn added_features(&self) -> &BTreeMap<FeatureId, Feature> {
        &self.added_features
    }

    pub fn deleted_feature_ids(&self) -> &BTreeSet<FeatureId> {
        &self.deleted_feature_ids
    }

    pub fn changed_attribute_values(&self) -> &BTreeMap<FeatureId, BTreeMap<usize, FieldValue>> {
        &self.changed_attributes
    }

    pub fn changed_geometries(&self) -> &BTreeMap<FeatureId, Geometry> {
        &self.changed_geometries
    }

    /// Store indices of committed fields pending deletion.
    pub fn deleted_attribute_ids(&self) -> &BTreeSet<usize> {
        &self.deleted_attribute_ids
    }

    /// Pending renames of committed fields, by store index.
    pub fn renamed_attributes(&self) -> &BTreeMap<usize, String> {
        &self.renamed_attributes
    }

    pub fn is_feature_added(&self, fid: FeatureId) -> bool {
        self.added_features.contains_key(&fid)
    }

    pub fn is_feature_deleted(&self, fid: FeatureId) -> bool {
        self.deleted_feature_ids.contains(&fid)
    }

    /// True if committing would change nothing in the store.
    pub fn is_empty(&self) -> bool {
        self.added_features.is_empty()
            && self.deleted_feature_ids.is_empty()
            && self.changed_attributes.is_empty()
            && self.changed_geometries.is_empty()
            && self.deleted_attribute_ids.is_empty()
            && self.renamed_attributes.is_empty()
    }

    /// Applies pending attribute and geometry overrides to a store-sourced
    /// feature whose attributes are already in data-field positions.
    pub fn apply_overrides(&self, feature: &mut Feature) {
        if let Some(changes) = self.changed_attributes.get(&feature.id) {
            for (index, value) in changes {
                feature.set_attribute(*index, value.clone());
            }
        }
        if let Some(geometry) = self.changed_geometries.get(&feature.id) {
            feature.geometry = Some(geometry.clone());
        }
    }

    // ------------------------------------------------------------------
    // Primitive mutations, driven by edit commands
    // ------------------------------------------------------------------

    pub(crate) fn allocate_temporary_id(&mut self) -> FeatureId {
        let id = FeatureId::Temporary(self.next_temporary);
        self.next_temporary += 1;
        id
    }

    pub(crate) fn insert_added(&mut self, feature: Feature) {
        self.added_features.insert(feature.id, feature);
    }

    pub(crate) fn remove_added(&mut self, fid: FeatureId) -> Option<Feature> {
        self.added_features.remove(&fid)
    }

    pub(crate) fn added_mut(&mut self, fid: FeatureId) -> Option<&mut Feature> {
        self.added_features.get_mut(&fid)
    }

    /// Records a tombstone and purges pending edits for the id, returning them.
    pub(crate) fn mark_deleted(
        &mut self,
        fid: FeatureId,
    ) -> (Option<BTreeMap<usize, FieldValue>>, Option<Geometry>) {
        self.deleted_feature_ids.insert(fid);
        (
            self.changed_attributes.remove(&fid),
            self.changed_geometries.remove(&fid),
        )
    }

    pub(crate) fn unmark_deleted(
        &mut self,
        fid: FeatureId,
        attributes: Option<BTreeMap<usize, FieldValue>>,
        geometry: Option<Geometry>,
    ) {
        self.deleted_feature_ids.remove(&fid);
        if let Some(attributes) = attributes {
            self.changed_attributes.insert(fid, attributes);
        }
        if let Some(geometry) = geometry {
            self.changed_geometries.insert(fid, geometry);
        }
    }

    pub(crate) fn set_changed_value(
        &mut self,
        fid: FeatureId,
        index: usize,
        value: FieldValue,
    ) -> Option<FieldValue> {
        self.changed_attributes
            .entry(fid)
            .or_default()
            .insert(index, value)
    }

    /// Puts back the pending value held before a change; `None` means there was none.
    pub(crate) fn restore_changed_value(
        &mut self,
        fid: FeatureId,
        index: usize,
        previous: Option<FieldValue>,
    ) {
        match previous {
            Some(value) => {
                self.changed_attributes
                    .entry(fid)
                    .or_default()
                    .insert(index, value);
            }
            None => {
                if let Some(changes) = self.changed_attributes.get_mut(&fid) {
                    changes.remove(&index);
                    if changes.is_empty() {
                        self.changed_attributes.remove(&fid);
                    }
                }
            }
        }
    }

    pub(crate) fn set_changed_geometry(&mut self, fid: FeatureId, geometry: Geometry) -> Option<Geometry> {
        self.changed_geometries.insert(fid, geometry)
    }

    pub(crate) fn restore_changed_geometry(&mut self, fid: FeatureId, previous: Option<Geometry>) {
        match previous {
            Some(geometry) => {
                self.changed_geometries.insert(fid, geometry);
            }
            None => {
                self.changed_geometries.remove(&fid);
            }
        }
    }

    /// Opens a null slot at `index` in every added feature and shifts pending
    /// changes at or above `index` up by one.
    pub(crate) fn insert_attribute_slot(&mut self, index: usize) {
        for feature in self.added_features.values_mut() {
            let at = index.min(feature.attributes.len());
            feature.attributes.insert(at, FieldValue::Null);
        }
        for changes in self.changed_attributes.values_mut() {
            let shifted: BTreeMap<usize, FieldValue> = std::mem::take(changes)
                .into_iter()
                .map(|(i, v)| if i >= index { (i + 1, v) } else { (i, v) })
                .collect();
            *changes = shifted;
        }
    }

    /// Removes the slot at `index` everywhere and shifts higher pending
    /// changes down by one. Returns what was removed.
    pub(crate) fn remove_attribute_slot(&mut self, index: usize) -> RemovedSlot {
        let mut removed = RemovedSlot::default();
        for (fid, feature) in self.added_features.iter_mut() {
            if index < feature.attributes.len() {
                removed.added_values.insert(*fid, feature.attributes.remove(index));
            }
        }
        for (fid, changes) in self.changed_attributes.iter_mut() {
            let mut shifted = BTreeMap::new();
            for (i, v) in std::mem::take(changes) {
                match i.cmp(&index) {
                    std::cmp::Ordering::Less => {
                        shifted.insert(i, v);
                    }
                    std::cmp::Ordering::Equal => {
                        removed.changed_values.insert(*fid, v);
                    }
                    std::cmp::Ordering::Greater => {
                        shifted.insert(i - 1, v);
                    }
                }
            }
            *changes = shifted;
        }
        self.changed_attributes.retain(|_, changes| !changes.is_empty());
        removed
    }

    pub(crate) fn restore_attribute_slot(&mut self, index: usize, removed: RemovedSlot) {
        self.insert_attribute_slot(index);
        for (fid, value) in removed.added_values {
            if let Some(feature) = self.added_features.get_mut(&fid) {
                feature.set_attribute(index, value);
            }
        }
        for (fid, value) in removed.changed_values {
            self.changed_attributes.entry(fid).or_default().insert(index, value);
        }
    }

    pub(crate) fn mark_attribute_deleted(&mut self, store_index: usize) -> Option<String> {
        self.deleted_attribute_ids.insert(store_index);
        self.renamed_attributes.remove(&store_index)
    }

    pub(crate) fn unmark_attribute_deleted(&mut self, store_index: usize, rename: Option<String>) {
        self.deleted_attribute_ids.remove(&store_index);
        if let Some(name) = rename {
            self.renamed_attributes.insert(store_index, name);
        }
    }

    pub(crate) fn set_rename(&mut self, store_index: usize, name: Option<String>) -> Option<String> {
        match name {
            Some(name) => self.renamed_attributes.insert(store_index, name),
            None => self.renamed_attributes.remove(&store_index),
        }
    }

    // ------------------------------------------------------------------
    // Commit bookkeeping
    // ------------------------------------------------------------------

    pub(crate) fn take_deleted_attribute_ids(&mut self) -> BTreeSet<usize> {
        std::mem::take(&mut self.deleted_attribute_ids)
    }

    pub(crate) fn restore_deleted_attribute_id(&mut self, store_index: usize) {
        self.deleted_attribute_ids.insert(store_index);
    }

    /// Re-keys renames after a committed store-side deletion at `store_index`.
    pub(crate) fn shift_renames_after_store_delete(&mut self, store_index: usize) {
        let renames = std::mem::take(&mut self.renamed_attributes);
        self.renamed_attributes = renames
            .into_iter()
            .filter(|(i, _)| *i != store_index)
            .map(|(i, name)| if i > store_index { (i - 1, name) } else { (i, name) })
            .collect();
        let deleted = std::mem::take(&mut self.deleted_attribute_ids);
        self.deleted_attribute_ids = deleted
            .into_iter()
            .map(|i| if i > store_index { i - 1 } else { i })
            .collect();
    }

    pub(crate) fn clear_rename(&mut self, store_index: usize) {
        self.renamed_attributes.remove(&store_index);
    }

    pub(crate) fn clear_changed_geometry(&mut self, fid: FeatureId) {
        self.changed_geometries.remove(&fid);
    }

    pub(crate) fn clear_changed_values(&mut self, fid: FeatureId, indices: &BTreeSet<usize>) {
        if let Some(changes) = self.changed_attributes.get_mut(&fid) {
            changes.retain(|i, _| !indices.contains(i));
            if changes.is_empty() {
                self.changed_attributes.remove(&fid);
            }
        }
    }

    pub(crate) fn clear_deleted(&mut self, fid: FeatureId) {
        self.deleted_feature_ids.remove(&fid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temporary_ids_are_never_reused() {
        let mut buffer = EditBuffer::new();
        let a = buffer.allocate_temporary_id();
        let b = buffer.allocate_temporary_id();
        assert_ne!(a, b);
        assert!(a.is_temporary());
    }

    #[test]
    fn delete_purges_pending_edits() {
        let mut buffer = EditBuffer::new();
        let fid = FeatureId::Persisted(1);
        buffer.set_changed_value(fid, 0, "x".into());
        buffer.set_changed_geometry(fid, Geometry::point(1.0, 1.0));
        let (attrs, geom) = buffer.mark_deleted(fid);
        assert!(buffer.changed_attribute_values().is_empty());
        assert!(buffer.changed_geometries().is_empty());

        buffer.unmark_deleted(fid, attrs, geom);
        assert!(!buffer.is_feature_deleted(fid));
        assert_eq!(buffer.changed_attribute_values()[&fid][&0], FieldValue::from("x"));
    }

    #[test]
    fn slot_removal_shifts_and_restores() {
        let mut buffer = EditBuffer::new();
        let added = buffer.allocate_temporary_id();
        buffer.insert_added(Feature::new(vec![1.into(), 2.into(), 3.into()]).with_id(added));
        let fid = FeatureId::Persisted(4);
        buffer.set_changed_value(fid, 0, "a".into());
        buffer.set_changed_value(fid, 1, "b".into());
        buffer.set_changed_value(fid, 2, "c".into());

        let removed = buffer.remove_attribute_slot(1);
        assert_eq!(
            buffer.added_features()[&added].attributes,
            vec![FieldValue::from(1), FieldValue::from(3)]
        );
        let changes = &buffer.changed_attribute_values()[&fid];
        assert_eq!(changes.get(&1), Some(&FieldValue::from("c")));
        assert_eq!(changes.len(), 2);

        buffer.restore_attribute_slot(1, removed);
        assert_eq!(
            buffer.added_features()[&added].attributes,
            vec![FieldValue::from(1), FieldValue::from(2), FieldValue::from(3)]
        );
        assert_eq!(buffer.changed_attribute_values()[&fid][&1], FieldValue::from("b"));
        assert_eq!(buffer.changed_attribute_values()[&fid][&2], FieldValue::from("c"));
    }

    #[test]
    fn restoring_absent_value_drops_empty_maps() {
        let mut buffer = EditBuffer::new();
        let fid = FeatureId::Persisted(1);
        let previous = buffer.set_changed_value(fid, 3, 9.into());
        buffer.restore_changed_value(fid, 3, previous);
        assert!(buffer.changed_attribute_values().is_empty());
        assert!(buffer.is_empty());
    }
}
