use std::collections::{BTreeMap, VecDeque};

use tracing::warn;

use layeredit_core::{Feature, FeatureId, FieldDef, FieldOrigin, FieldSchema, FieldValue, Geometry};

use crate::buffer::{EditBuffer, RemovedSlot};
use crate::error::EditError;
use crate::events::LayerEvent;

/// The state a command operates on: the session buffer and the layer schema.
pub(crate) struct EditTarget<'a> {
    pub buffer: &'a mut EditBuffer,
    pub fields: &'a mut FieldSchema,
}

/// State displaced by deleting a feature.
#[derive(Debug, Clone, PartialEq)]
pub enum RemovedFeature {
    /// The feature only existed in the session.
    Added(Feature),
    /// A committed feature; holds the pending edits that the tombstone purged.
    Persisted {
        attributes: Option<BTreeMap<usize, FieldValue>>,
        geometry: Option<Geometry>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum PreviousValue {
    /// Value stored directly in an added feature.
    Added(FieldValue),
    /// Pending override held before the change, if any.
    Pending(Option<FieldValue>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum PreviousGeometry {
    Added(Option<Geometry>),
    Pending(Option<Geometry>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemovedAttribute {
    pub field: FieldDef,
    pub slot: RemovedSlot,
    pub rename: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PreviousName {
    pub name: String,
    pub rename: Option<String>,
}

/// A primitive, invertible edit. Each variant records what it displaced
/// when applied so that reverting restores the exact prior state.
#[derive(Debug, Clone, PartialEq)]
pub enum EditCommand {
    AddFeature {
        feature: Feature,
    },
    DeleteFeature {
        fid: FeatureId,
        removed: Option<RemovedFeature>,
    },
    ChangeAttributeValue {
        fid: FeatureId,
        index: usize,
        value: FieldValue,
        previous: Option<PreviousValue>,
    },
    ChangeGeometry {
        fid: FeatureId,
        geometry: Geometry,
        previous: Option<PreviousGeometry>,
    },
    AddAttribute {
        index: usize,
        field: FieldDef,
    },
    DeleteAttribute {
        index: usize,
        removed: Option<RemovedAttribute>,
    },
    RenameAttribute {
        index: usize,
        name: String,
        previous: Option<PreviousName>,
    },
}

impl EditCommand {
    pub fn label(&self) -> &'static str {
        match self {
            EditCommand::AddFeature { .. } => "add feature",
            EditCommand::DeleteFeature { .. } => "delete feature",
            EditCommand::ChangeAttributeValue { .. } => "change attribute value",
            EditCommand::ChangeGeometry { .. } => "change geometry",
            EditCommand::AddAttribute { .. } => "add attribute",
            EditCommand::DeleteAttribute { .. } => "delete attribute",
            EditCommand::RenameAttribute { .. } => "rename attribute",
        }
    }

    pub(crate) fn apply(&mut self, target: &mut EditTarget<'_>) -> Result<LayerEvent, EditError> {
        match self {
            EditCommand::AddFeature { feature } => {
                target.buffer.insert_added(feature.clone());
                Ok(LayerEvent::FeatureAdded(feature.id))
            }
            EditCommand::DeleteFeature { fid, removed } => {
                *removed = Some(match target.buffer.remove_added(*fid) {
                    Some(feature) => RemovedFeature::Added(feature),
                    None => {
                        let (attributes, geometry) = target.buffer.mark_deleted(*fid);
                        RemovedFeature::Persisted { attributes, geometry }
                    }
                });
                Ok(LayerEvent::FeatureDeleted(*fid))
            }
            EditCommand::ChangeAttributeValue {
                fid,
                index,
                value,
                previous,
            } => {
                *previous = Some(match target.buffer.added_mut(*fid) {
                    Some(feature) => {
                        let old = feature.attribute(*index).cloned().unwrap_or(FieldValue::Null);
                        feature.set_attribute(*index, value.clone());
                        PreviousValue::Added(old)
                    }
                    None => PreviousValue::Pending(target.buffer.set_changed_value(
                        *fid,
                        *index,
                        value.clone(),
                    )),
                });
                Ok(LayerEvent::AttributeValueChanged {
                    fid: *fid,
                    index: *index,
                })
            }
            EditCommand::ChangeGeometry {
                fid,
                geometry,
                previous,
            } => {
                *previous = Some(match target.buffer.added_mut(*fid) {
                    Some(feature) => {
                        PreviousGeometry::Added(feature.geometry.replace(geometry.clone()))
                    }
                    None => PreviousGeometry::Pending(
                        target.buffer.set_changed_geometry(*fid, geometry.clone()),
                    ),
                });
                Ok(LayerEvent::GeometryChanged(*fid))
            }
            EditCommand::AddAttribute { index, field } => {
                field.origin = FieldOrigin::Edit;
                target
                    .fields
                    .insert(*index, field.clone())
                    .map_err(EditError::from_schema)?;
                target.buffer.insert_attribute_slot(*index);
                Ok(LayerEvent::AttributeAdded(*index))
            }
            EditCommand::DeleteAttribute { index, removed } => {
                let field = target.fields.remove(*index).map_err(EditError::from_schema)?;
                let slot = target.buffer.remove_attribute_slot(*index);
                let rename = match field.origin {
                    FieldOrigin::Store { store_index } => {
                        target.buffer.mark_attribute_deleted(store_index)
                    }
                    _ => None,
                };
                *removed = Some(RemovedAttribute { field, slot, rename });
                Ok(LayerEvent::AttributeDeleted(*index))
            }
            EditCommand::RenameAttribute {
                index,
                name,
                previous,
            } => {
                let old = target.fields.rename(*index, name).map_err(EditError::from_schema)?;
                let rename = match target.fields.origin(*index) {
                    Some(FieldOrigin::Store { store_index }) => {
                        target.buffer.set_rename(store_index, Some(name.clone()))
                    }
                    _ => None,
                };
                *previous = Some(PreviousName { name: old, rename });
                Ok(LayerEvent::AttributeRenamed {
                    index: *index,
                    name: name.clone(),
                })
            }
        }
    }

    pub(crate) fn revert(&mut self, target: &mut EditTarget<'_>) -> Result<LayerEvent, EditError> {
        match self {
            EditCommand::AddFeature { feature } => {
                target.buffer.remove_added(feature.id);
                Ok(LayerEvent::FeatureDeleted(feature.id))
            }
            EditCommand::DeleteFeature { fid, removed } => {
                match removed.take() {
                    Some(RemovedFeature::Added(feature)) => target.buffer.insert_added(feature),
                    Some(RemovedFeature::Persisted { attributes, geometry }) => {
                        target.buffer.unmark_deleted(*fid, attributes, geometry)
                    }
                    None => {}
                }
                Ok(LayerEvent::FeatureAdded(*fid))
            }
            EditCommand::ChangeAttributeValue {
                fid,
                index,
                previous,
                ..
            } => {
                match previous.take() {
                    Some(PreviousValue::Added(old)) => {
                        if let Some(feature) = target.buffer.added_mut(*fid) {
                            feature.set_attribute(*index, old);
                        }
                    }
                    Some(PreviousValue::Pending(old)) => {
                        target.buffer.restore_changed_value(*fid, *index, old)
                    }
                    None => {}
                }
                Ok(LayerEvent::AttributeValueChanged {
                    fid: *fid,
                    index: *index,
                })
            }
            EditCommand::ChangeGeometry { fid, previous, .. } => {
                match previous.take() {
                    Some(PreviousGeometry::Added(old)) => {
                        if let Some(feature) = target.buffer.added_mut(*fid) {
                            feature.geometry = old;
                        }
                    }
                    Some(PreviousGeometry::Pending(old)) => {
                        target.buffer.restore_changed_geometry(*fid, old)
                    }
                    None => {}
                }
                Ok(LayerEvent::GeometryChanged(*fid))
            }
            EditCommand::AddAttribute { index, .. } => {
                target.fields.remove(*index).map_err(EditError::from_schema)?;
                target.buffer.remove_attribute_slot(*index);
                Ok(LayerEvent::AttributeDeleted(*index))
            }
            EditCommand::DeleteAttribute { index, removed } => {
                // Recorded state is only consumed once the schema accepts the field back.
                if let Some(attribute) = removed.as_ref() {
                    target
                        .fields
                        .insert(*index, attribute.field.clone())
                        .map_err(EditError::from_schema)?;
                }
                if let Some(RemovedAttribute { field, slot, rename }) = removed.take() {
                    target.buffer.restore_attribute_slot(*index, slot);
                    if let FieldOrigin::Store { store_index } = field.origin {
                        target.buffer.unmark_attribute_deleted(store_index, rename);
                    }
                }
                Ok(LayerEvent::AttributeAdded(*index))
            }
            EditCommand::RenameAttribute { index, previous, .. } => {
                let mut restored = String::new();
                if let Some(old) = previous.as_ref() {
                    target.fields.rename(*index, &old.name).map_err(EditError::from_schema)?;
                }
                if let Some(PreviousName { name, rename }) = previous.take() {
                    if let Some(FieldOrigin::Store { store_index }) = target.fields.origin(*index) {
                        target.buffer.set_rename(store_index, rename);
                    }
                    restored = name;
                }
                Ok(LayerEvent::AttributeRenamed {
                    index: *index,
                    name: restored,
                })
            }
        }
    }
}

/// A group of commands undone and redone as one unit.
#[derive(Debug, Clone, PartialEq)]
pub struct UndoEntry {
    pub label: String,
    pub commands: Vec<EditCommand>,
}

impl UndoEntry {
    /// Reverts the commands last to first. If one fails, the commands already
    /// reverted are applied again so the entry still matches the state.
    pub(crate) fn revert_all(&mut self, target: &mut EditTarget<'_>) -> Result<Vec<LayerEvent>, EditError> {
        let mut events = Vec::with_capacity(self.commands.len());
        for position in (0..self.commands.len()).rev() {
            match self.commands[position].revert(target) {
                Ok(event) => events.push(event),
                Err(e) => {
                    for command in &mut self.commands[position + 1..] {
                        if let Err(restore) = command.apply(target) {
                            warn!("could not restore '{}' after failed undo: {}", command.label(), restore);
                        }
                    }
                    return Err(e);
                }
            }
        }
        Ok(events)
    }

    /// Applies the commands first to last, backing out on failure.
    pub(crate) fn apply_all(&mut self, target: &mut EditTarget<'_>) -> Result<Vec<LayerEvent>, EditError> {
        let mut events = Vec::with_capacity(self.commands.len());
        for position in 0..self.commands.len() {
            match self.commands[position].apply(target) {
                Ok(event) => events.push(event),
                Err(e) => {
                    for command in self.commands[..position].iter_mut().rev() {
                        if let Err(restore) = command.revert(target) {
                            warn!("could not back out '{}' after failed redo: {}", command.label(), restore);
                        }
                    }
                    return Err(e);
                }
            }
        }
        Ok(events)
    }
}

/// Linear undo/redo history of one editing session.
///
/// Units are reverted strictly in reverse order of application, command by
/// command, so later commands in a group always see the state they were
/// applied against.
#[derive(Debug, Clone)]
pub struct UndoStack {
    undo_stack: VecDeque<UndoEntry>,
    redo_stack: VecDeque<UndoEntry>,
    open: Option<UndoEntry>,
    max_depth: usize,
}

impl UndoStack {
    pub fn new(max_depth: usize) -> Self {
        Self {
            undo_stack: VecDeque::new(),
            redo_stack: VecDeque::new(),
            open: None,
            max_depth,
        }
    }

    /// Records an applied command, either into the open group or as its own unit.
    pub(crate) fn push_command(&mut self, command: EditCommand) {
        self.clear_redo();
        match &mut self.open {
            Some(group) => group.commands.push(command),
            None => {
                let label = command.label().to_string();
                self.push_undo(UndoEntry {
                    label,
                    commands: vec![command],
                });
            }
        }
    }

    pub(crate) fn begin_group(&mut self, label: &str) -> Result<(), EditError> {
        if let Some(open) = &self.open {
            return Err(EditError::EditCommandOpen(open.label.clone()));
        }
        self.open = Some(UndoEntry {
            label: label.to_string(),
            commands: Vec::new(),
        });
        Ok(())
    }

    /// Closes the open group. Empty groups are dropped; returns whether one was recorded.
    pub(crate) fn end_group(&mut self) -> Result<bool, EditError> {
        let group = self.open.take().ok_or(EditError::NoEditCommand)?;
        if group.commands.is_empty() {
            return Ok(false);
        }
        self.push_undo(group);
        Ok(true)
    }

    pub(crate) fn take_open(&mut self) -> Option<UndoEntry> {
        self.open.take()
    }

    /// Puts back a group taken with `take_open`.
    pub(crate) fn reopen(&mut self, entry: UndoEntry) {
        self.open = Some(entry);
    }

    pub fn is_group_open(&self) -> bool {
        self.open.is_some()
    }

    pub fn open_label(&self) -> Option<&str> {
        self.open.as_ref().map(|e| e.label.as_str())
    }

    pub(crate) fn push_undo(&mut self, entry: UndoEntry) {
        self.undo_stack.push_back(entry);
        // Enforce depth limit by dropping oldest entry
        if self.undo_stack.len() > self.max_depth {
            self.undo_stack.pop_front();
        }
    }

    pub(crate) fn pop_undo(&mut self) -> Option<UndoEntry> {
        self.undo_stack.pop_back()
    }

    pub(crate) fn push_redo(&mut self, entry: UndoEntry) {
        self.redo_stack.push_back(entry);
    }

    pub(crate) fn pop_redo(&mut self) -> Option<UndoEntry> {
        self.redo_stack.pop_back()
    }

    pub(crate) fn clear_redo(&mut self) {
        self.redo_stack.clear();
    }

    pub(crate) fn clear(&mut self) {
        self.undo_stack.clear();
        self.redo_stack.clear();
        self.open = None;
    }

    pub fn undo_depth(&self) -> usize {
        self.undo_stack.len()
    }

    pub fn redo_depth(&self) -> usize {
        self.redo_stack.len()
    }

    pub fn undo_label(&self) -> Option<&str> {
        self.undo_stack.back().map(|e| e.label.as_str())
    }

    pub fn redo_label(&self) -> Option<&str> {
        self.redo_stack.back().map(|e| e.label.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use layeredit_core::FieldType;

    fn schema() -> FieldSchema {
        FieldSchema::new(vec![
            FieldDef::new("a", FieldType::Text).with_origin(FieldOrigin::Store { store_index: 0 }),
            FieldDef::new("b", FieldType::Integer).with_origin(FieldOrigin::Store { store_index: 1 }),
            FieldDef::new("c", FieldType::Integer).with_origin(FieldOrigin::Store { store_index: 2 }),
        ])
        .unwrap()
    }

    #[test]
    fn depth_limit_drops_oldest() {
        let mut stack = UndoStack::new(2);
        for i in 0..3 {
            stack.push_command(EditCommand::DeleteFeature {
                fid: FeatureId::Persisted(i),
                removed: None,
            });
        }
        assert_eq!(stack.undo_depth(), 2);
        let oldest = stack.undo_stack.front().map(|e| e.commands[0].clone());
        assert_eq!(
            oldest,
            Some(EditCommand::DeleteFeature {
                fid: FeatureId::Persisted(1),
                removed: None
            })
        );
    }

    #[test]
    fn nested_groups_are_rejected() {
        let mut stack = UndoStack::new(10);
        stack.begin_group("outer").unwrap();
        assert!(matches!(stack.begin_group("inner"), Err(EditError::EditCommandOpen(_))));
        assert_eq!(stack.end_group().unwrap(), false);
        assert!(matches!(stack.end_group(), Err(EditError::NoEditCommand)));
    }

    #[test]
    fn delete_then_rename_reverts_in_reverse_order() {
        let mut fields = schema();
        let mut buffer = EditBuffer::new();
        let mut target = EditTarget {
            buffer: &mut buffer,
            fields: &mut fields,
        };

        // rename "c" (index 2) then delete "a": rename's recorded index refers
        // to the schema it was applied on
        let mut rename = EditCommand::RenameAttribute {
            index: 2,
            name: "renamed".into(),
            previous: None,
        };
        let mut delete = EditCommand::DeleteAttribute { index: 0, removed: None };
        rename.apply(&mut target).unwrap();
        delete.apply(&mut target).unwrap();
        assert_eq!(target.fields.names(), vec!["b", "renamed"]);
        assert_eq!(target.buffer.renamed_attributes().get(&2).map(String::as_str), Some("renamed"));

        delete.revert(&mut target).unwrap();
        rename.revert(&mut target).unwrap();
        assert_eq!(target.fields.names(), vec!["a", "b", "c"]);
        assert!(target.buffer.is_empty());
    }

    #[test]
    fn change_on_added_feature_edits_in_place() {
        let mut fields = schema();
        let mut buffer = EditBuffer::new();
        let fid = buffer.allocate_temporary_id();
        let mut target = EditTarget {
            buffer: &mut buffer,
            fields: &mut fields,
        };
        let mut add = EditCommand::AddFeature {
            feature: Feature::new(vec!["x".into(), 1.into(), 2.into()]).with_id(fid),
        };
        add.apply(&mut target).unwrap();
        let mut change = EditCommand::ChangeAttributeValue {
            fid,
            index: 1,
            value: 5.into(),
            previous: None,
        };
        change.apply(&mut target).unwrap();
        assert!(target.buffer.changed_attribute_values().is_empty());
        assert_eq!(target.buffer.added_features()[&fid].attributes[1], FieldValue::Integer(5));

        change.revert(&mut target).unwrap();
        assert_eq!(target.buffer.added_features()[&fid].attributes[1], FieldValue::Integer(1));
    }
}
