use layeredit_core::{Feature, FeatureId, FeatureRequest, FieldDef, FieldType, FieldValue, Geometry};
use layeredit_engine::{EditConfig, EditError, UndoResult, VectorLayer};
use layeredit_harness::{init_tracing, layer_with_one_point, layer_with_two_points, point};

fn overlay(layer: &VectorLayer) -> Result<Vec<Feature>, EditError> {
    Ok(layer.get_features(&FeatureRequest::new())?.collect())
}

#[test]
fn undo_and_redo_walk_the_history() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let mut layer = layer_with_one_point()?;
    layer.start_editing()?;
    let initial = overlay(&layer)?;

    let fid = layer.add_feature(point("a", 1, 0.0, 0.0))?;
    layer.change_attribute_value(FeatureId::Persisted(1), 1, 9)?;
    let edited = overlay(&layer)?;

    assert_eq!(layer.undo()?, UndoResult::Applied("change attribute value".into()));
    assert_eq!(layer.undo()?, UndoResult::Applied("add feature".into()));
    assert_eq!(layer.undo()?, UndoResult::Empty);
    assert_eq!(overlay(&layer)?, initial);
    assert!(!layer.is_modified());

    assert_eq!(layer.redo()?, UndoResult::Applied("add feature".into()));
    assert_eq!(layer.redo()?, UndoResult::Applied("change attribute value".into()));
    assert_eq!(layer.redo()?, UndoResult::Empty);
    assert_eq!(overlay(&layer)?, edited);
    assert!(layer.get_feature(fid)?.is_valid());
    Ok(())
}

#[test]
fn a_new_edit_clears_the_redo_history() -> Result<(), Box<dyn std::error::Error>> {
    let mut layer = layer_with_one_point()?;
    layer.start_editing()?;

    layer.change_attribute_value(FeatureId::Persisted(1), 0, "x")?;
    layer.undo()?;
    assert_eq!(layer.undo_stack().ok_or("no session")?.redo_depth(), 1);

    layer.change_attribute_value(FeatureId::Persisted(1), 0, "y")?;
    assert_eq!(layer.undo_stack().ok_or("no session")?.redo_depth(), 0);
    assert_eq!(layer.redo()?, UndoResult::Empty);
    Ok(())
}

#[test]
fn undo_restores_overwritten_pending_values() -> Result<(), Box<dyn std::error::Error>> {
    let mut layer = layer_with_one_point()?;
    layer.start_editing()?;

    layer.change_attribute_value(FeatureId::Persisted(1), 1, 10)?;
    layer.change_attribute_value(FeatureId::Persisted(1), 1, 20)?;
    layer.undo()?;
    assert_eq!(layer.get_feature(FeatureId::Persisted(1))?.attributes[1], FieldValue::from(10));
    layer.undo()?;
    assert_eq!(layer.get_feature(FeatureId::Persisted(1))?.attributes[1], FieldValue::from(123));
    assert!(layer.edit_buffer().ok_or("no buffer")?.changed_attribute_values().is_empty());
    Ok(())
}

#[test]
fn undoing_a_delete_restores_purged_edits() -> Result<(), Box<dyn std::error::Error>> {
    let mut layer = layer_with_one_point()?;
    layer.start_editing()?;

    layer.change_attribute_value(FeatureId::Persisted(1), 0, "edited")?;
    layer.change_geometry(FeatureId::Persisted(1), Geometry::point(1.0, 2.0))?;
    layer.delete_feature(FeatureId::Persisted(1))?;
    assert!(layer.edit_buffer().ok_or("no buffer")?.changed_attribute_values().is_empty());

    layer.undo()?;
    let feature = layer.get_feature(FeatureId::Persisted(1))?;
    assert_eq!(feature.attributes[0], FieldValue::from("edited"));
    assert_eq!(feature.geometry, Some(Geometry::point(1.0, 2.0)));
    Ok(())
}

#[test]
fn undoing_a_delete_of_an_added_feature_restores_it() -> Result<(), Box<dyn std::error::Error>> {
    let mut layer = layer_with_one_point()?;
    layer.start_editing()?;

    let fid = layer.add_feature(point("temp", 3, 0.0, 0.0))?;
    layer.change_attribute_value(fid, 1, 4)?;
    layer.delete_feature(fid)?;
    layer.undo()?;

    let feature = layer.get_feature(fid)?;
    assert_eq!(feature.attributes, vec![FieldValue::from("temp"), FieldValue::from(4)]);
    Ok(())
}

#[test]
fn schema_edits_undo_in_reverse_order() -> Result<(), Box<dyn std::error::Error>> {
    let mut layer = layer_with_one_point()?;
    layer.start_editing()?;

    layer.add_attribute(FieldDef::new("extra", FieldType::Integer))?;
    layer.rename_attribute(1, "count")?;
    layer.delete_attribute(0)?;
    assert_eq!(layer.fields().names(), vec!["count", "extra"]);

    layer.undo()?;
    assert_eq!(layer.fields().names(), vec!["fldtxt", "count", "extra"]);
    layer.undo()?;
    assert_eq!(layer.fields().names(), vec!["fldtxt", "fldint", "extra"]);
    layer.undo()?;
    assert_eq!(layer.fields().names(), vec!["fldtxt", "fldint"]);
    assert!(!layer.is_modified());

    layer.redo()?;
    layer.redo()?;
    layer.redo()?;
    assert_eq!(layer.fields().names(), vec!["count", "extra"]);
    let buffer = layer.edit_buffer().ok_or("no buffer")?;
    assert!(buffer.deleted_attribute_ids().contains(&0));
    assert_eq!(buffer.renamed_attributes().get(&1).map(String::as_str), Some("count"));
    Ok(())
}

// ============================================================================
// Command groups
// ============================================================================

#[test]
fn a_command_group_undoes_as_one_unit() -> Result<(), Box<dyn std::error::Error>> {
    let mut layer = layer_with_two_points()?;
    layer.start_editing()?;

    layer.begin_edit_command("move both")?;
    layer.change_geometry(FeatureId::Persisted(1), Geometry::point(0.0, 0.0))?;
    layer.change_geometry(FeatureId::Persisted(2), Geometry::point(1.0, 1.0))?;
    assert!(layer.end_edit_command()?);

    assert_eq!(layer.undo()?, UndoResult::Applied("move both".into()));
    assert!(layer.edit_buffer().ok_or("no buffer")?.changed_geometries().is_empty());
    assert_eq!(layer.redo()?, UndoResult::Applied("move both".into()));
    assert_eq!(layer.edit_buffer().ok_or("no buffer")?.changed_geometries().len(), 2);
    Ok(())
}

#[test]
fn groups_cannot_nest_and_must_be_open_to_end() -> Result<(), Box<dyn std::error::Error>> {
    let mut layer = layer_with_one_point()?;
    layer.start_editing()?;

    assert!(matches!(layer.end_edit_command(), Err(EditError::NoEditCommand)));
    layer.begin_edit_command("outer")?;
    assert!(matches!(
        layer.begin_edit_command("inner"),
        Err(EditError::EditCommandOpen(_))
    ));
    // An empty group records nothing.
    assert!(!layer.end_edit_command()?);
    assert_eq!(layer.undo_stack().ok_or("no session")?.undo_depth(), 0);
    Ok(())
}

#[test]
fn destroying_a_group_reverts_its_edits() -> Result<(), Box<dyn std::error::Error>> {
    let mut layer = layer_with_one_point()?;
    layer.start_editing()?;
    layer.change_attribute_value(FeatureId::Persisted(1), 0, "kept")?;

    layer.begin_edit_command("scratch")?;
    layer.add_feature(point("a", 1, 0.0, 0.0))?;
    layer.change_attribute_value(FeatureId::Persisted(1), 0, "dropped")?;
    layer.destroy_edit_command()?;

    assert_eq!(layer.feature_count()?, 1);
    assert_eq!(layer.get_feature(FeatureId::Persisted(1))?.attributes[0], FieldValue::from("kept"));
    assert_eq!(layer.undo_stack().ok_or("no session")?.undo_depth(), 1);
    assert!(matches!(layer.destroy_edit_command(), Err(EditError::NoEditCommand)));
    Ok(())
}

#[test]
fn undo_waits_while_a_group_is_open() -> Result<(), Box<dyn std::error::Error>> {
    let mut layer = layer_with_one_point()?;
    layer.start_editing()?;
    layer.change_attribute_value(FeatureId::Persisted(1), 0, "a")?;

    layer.begin_edit_command("open")?;
    layer.change_attribute_value(FeatureId::Persisted(1), 0, "b")?;
    assert_eq!(layer.undo()?, UndoResult::Empty);
    assert!(matches!(layer.commit_changes(), Err(EditError::EditCommandOpen(label)) if label == "open"));

    layer.end_edit_command()?;
    assert_eq!(layer.undo()?, UndoResult::Applied("open".into()));
    assert_eq!(layer.get_feature(FeatureId::Persisted(1))?.attributes[0], FieldValue::from("a"));
    Ok(())
}

#[test]
fn history_depth_is_bounded() -> Result<(), Box<dyn std::error::Error>> {
    let config = EditConfig {
        undo_depth: 2,
        ..EditConfig::default()
    };
    let mut layer = layer_with_one_point()?.with_config(config)?;
    layer.start_editing()?;

    for value in 0..5 {
        layer.change_attribute_value(FeatureId::Persisted(1), 1, value)?;
    }
    assert_eq!(layer.undo_stack().ok_or("no session")?.undo_depth(), 2);
    layer.undo()?;
    layer.undo()?;
    assert_eq!(layer.undo()?, UndoResult::Empty);
    // The oldest edits stay applied.
    assert_eq!(layer.get_feature(FeatureId::Persisted(1))?.attributes[1], FieldValue::from(2));
    Ok(())
}

#[test]
fn undo_without_a_session_is_a_no_op() -> Result<(), Box<dyn std::error::Error>> {
    let mut layer = layer_with_one_point()?;
    assert_eq!(layer.undo()?, UndoResult::Empty);
    assert_eq!(layer.redo()?, UndoResult::Empty);
    assert!(matches!(layer.begin_edit_command("x"), Err(EditError::NotEditing)));
    Ok(())
}

// ============================================================================
// Failed steps keep the history
// ============================================================================

#[test]
fn blocked_undo_keeps_the_entry() -> Result<(), Box<dyn std::error::Error>> {
    let mut layer = layer_with_one_point()?;
    layer.start_editing()?;
    layer.delete_attribute(0)?;
    // An expression field now holds the deleted field's name.
    layer.add_expression_field("1", FieldDef::new("fldtxt", FieldType::Integer))?;

    assert!(matches!(layer.undo(), Err(EditError::DuplicateName(name)) if name == "fldtxt"));
    assert_eq!(layer.undo_stack().ok_or("no session")?.undo_depth(), 1);
    assert_eq!(layer.fields().names(), vec!["fldint", "fldtxt"]);

    layer.remove_expression_field(0)?;
    assert_eq!(layer.undo()?, UndoResult::Applied("delete attribute".into()));
    assert_eq!(layer.fields().names(), vec!["fldtxt", "fldint"]);
    let feature = layer.get_feature(FeatureId::Persisted(1))?;
    assert_eq!(feature.attributes, vec![FieldValue::from("test"), FieldValue::from(123)]);
    Ok(())
}

#[test]
fn blocked_group_undo_reapplies_what_it_reverted() -> Result<(), Box<dyn std::error::Error>> {
    let mut layer = layer_with_one_point()?;
    layer.start_editing()?;
    layer.begin_edit_command("drop text")?;
    layer.delete_attribute(0)?;
    layer.change_attribute_value(FeatureId::Persisted(1), 0, 42)?;
    layer.end_edit_command()?;
    layer.add_expression_field("1", FieldDef::new("fldtxt", FieldType::Integer))?;

    assert!(layer.undo().is_err());
    let feature = layer.get_feature(FeatureId::Persisted(1))?;
    assert_eq!(feature.attributes[0], FieldValue::from(42));
    assert_eq!(layer.undo_stack().ok_or("no session")?.undo_label(), Some("drop text"));

    layer.remove_expression_field(0)?;
    assert_eq!(layer.undo()?, UndoResult::Applied("drop text".into()));
    let feature = layer.get_feature(FeatureId::Persisted(1))?;
    assert_eq!(feature.attributes, vec![FieldValue::from("test"), FieldValue::from(123)]);
    assert!(!layer.is_modified());
    Ok(())
}

#[test]
fn blocked_redo_keeps_the_entry() -> Result<(), Box<dyn std::error::Error>> {
    let mut layer = layer_with_one_point()?;
    layer.start_editing()?;
    layer.add_attribute(FieldDef::new("extra", FieldType::Text))?;
    layer.undo()?;
    layer.add_expression_field("1", FieldDef::new("extra", FieldType::Integer))?;

    assert!(matches!(layer.redo(), Err(EditError::DuplicateName(_))));
    assert_eq!(layer.undo_stack().ok_or("no session")?.redo_depth(), 1);

    layer.remove_expression_field(0)?;
    assert_eq!(layer.redo()?, UndoResult::Applied("add attribute".into()));
    assert_eq!(layer.fields().names(), vec!["fldtxt", "fldint", "extra"]);
    Ok(())
}
