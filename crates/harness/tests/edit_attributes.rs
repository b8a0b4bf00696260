use layeredit_core::{FeatureId, FieldDef, FieldOrigin, FieldType, FieldValue};
use layeredit_engine::EditError;
use layeredit_harness::{init_tracing, layer_with_one_point, point};

fn names(layer: &layeredit_engine::VectorLayer) -> Vec<String> {
    layer.fields().names()
}

#[test]
fn added_attribute_reads_null_until_set() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let mut layer = layer_with_one_point()?;
    layer.start_editing()?;

    let index = layer.add_attribute(FieldDef::new("fldflt", FieldType::Float))?;
    assert_eq!(index, 2);
    assert_eq!(names(&layer), vec!["fldtxt", "fldint", "fldflt"]);
    assert_eq!(layer.fields().origin(2), Some(FieldOrigin::Edit));

    let feature = layer.get_feature(FeatureId::Persisted(1))?;
    assert_eq!(feature.attributes.len(), 3);
    assert_eq!(feature.attributes[2], FieldValue::Null);

    layer.change_attribute_value(FeatureId::Persisted(1), 2, 1.5)?;
    let feature = layer.get_feature(FeatureId::Persisted(1))?;
    assert_eq!(feature.attributes[2], FieldValue::Float(1.5));
    Ok(())
}

#[test]
fn attribute_names_must_be_unique_and_non_empty() -> Result<(), Box<dyn std::error::Error>> {
    let mut layer = layer_with_one_point()?;
    layer.start_editing()?;

    assert!(matches!(
        layer.add_attribute(FieldDef::new("fldtxt", FieldType::Text)),
        Err(EditError::DuplicateName(_))
    ));
    assert!(matches!(
        layer.add_attribute(FieldDef::new("", FieldType::Text)),
        Err(EditError::EmptyFieldName)
    ));
    assert!(matches!(layer.rename_attribute(0, "fldint"), Err(EditError::DuplicateName(_))));
    assert!(matches!(layer.rename_attribute(0, ""), Err(EditError::EmptyFieldName)));
    assert!(!layer.is_modified());
    Ok(())
}

#[test]
fn deleted_attribute_vanishes_from_features() -> Result<(), Box<dyn std::error::Error>> {
    let mut layer = layer_with_one_point()?;
    layer.start_editing()?;

    layer.delete_attribute(0)?;
    assert_eq!(names(&layer), vec!["fldint"]);
    let feature = layer.get_feature(FeatureId::Persisted(1))?;
    assert_eq!(feature.attributes, vec![FieldValue::from(123)]);

    let buffer = layer.edit_buffer().ok_or("no buffer")?;
    assert!(buffer.deleted_attribute_ids().contains(&0));
    Ok(())
}

#[test]
fn deleting_an_attribute_drops_its_pending_values() -> Result<(), Box<dyn std::error::Error>> {
    let mut layer = layer_with_one_point()?;
    layer.start_editing()?;

    layer.change_attribute_value(FeatureId::Persisted(1), 0, "gone")?;
    layer.change_attribute_value(FeatureId::Persisted(1), 1, 5)?;
    layer.delete_attribute(0)?;

    let feature = layer.get_feature(FeatureId::Persisted(1))?;
    assert_eq!(feature.attributes, vec![FieldValue::from(5)]);

    // Undo brings the field back with its pending value.
    layer.undo()?;
    let feature = layer.get_feature(FeatureId::Persisted(1))?;
    assert_eq!(feature.attributes, vec![FieldValue::from("gone"), FieldValue::from(5)]);
    Ok(())
}

#[test]
fn added_features_follow_schema_edits() -> Result<(), Box<dyn std::error::Error>> {
    let mut layer = layer_with_one_point()?;
    layer.start_editing()?;

    let fid = layer.add_feature(point("new", 9, 0.0, 0.0))?;
    layer.add_attribute(FieldDef::new("extra", FieldType::Integer))?;
    layer.change_attribute_value(fid, 2, 3)?;
    layer.delete_attribute(0)?;

    let feature = layer.get_feature(fid)?;
    assert_eq!(feature.attributes, vec![FieldValue::from(9), FieldValue::from(3)]);
    Ok(())
}

#[test]
fn delete_attributes_removes_several_at_once() -> Result<(), Box<dyn std::error::Error>> {
    let mut layer = layer_with_one_point()?;
    layer.start_editing()?;
    layer.add_attribute(FieldDef::new("extra", FieldType::Integer))?;

    layer.delete_attributes(&[0, 2])?;
    assert_eq!(names(&layer), vec!["fldint"]);
    assert!(matches!(layer.delete_attributes(&[4]), Err(EditError::InvalidField(4))));
    Ok(())
}

#[test]
fn renamed_attribute_is_pending_until_commit() -> Result<(), Box<dyn std::error::Error>> {
    let mut layer = layer_with_one_point()?;
    layer.start_editing()?;

    layer.rename_attribute(0, "name")?;
    assert_eq!(names(&layer), vec!["name", "fldint"]);
    let buffer = layer.edit_buffer().ok_or("no buffer")?;
    assert_eq!(buffer.renamed_attributes().get(&0).map(String::as_str), Some("name"));
    assert_eq!(layer.store().fields()?[0].name, "fldtxt");

    let outcome = layer.commit_changes()?;
    assert!(outcome.is_success());
    assert_eq!(layer.store().fields()?[0].name, "name");
    Ok(())
}

#[test]
fn schema_edits_reach_the_store_on_commit() -> Result<(), Box<dyn std::error::Error>> {
    let mut layer = layer_with_one_point()?;
    layer.start_editing()?;

    let index = layer.add_attribute(FieldDef::new("extra", FieldType::Integer))?;
    layer.change_attribute_value(FeatureId::Persisted(1), index, 77)?;
    layer.delete_attribute(0)?;

    let outcome = layer.commit_changes()?;
    assert!(outcome.is_success());
    assert!(!layer.is_editing());

    let store_names: Vec<String> = layer.store().fields()?.into_iter().map(|f| f.name).collect();
    assert_eq!(store_names, vec!["fldint", "extra"]);
    assert_eq!(
        layer.fields().origin(1),
        Some(FieldOrigin::Store { store_index: 1 })
    );
    let feature = layer.get_feature(FeatureId::Persisted(1))?;
    assert_eq!(feature.attributes, vec![FieldValue::from(123), FieldValue::from(77)]);
    Ok(())
}

#[test]
fn rollback_restores_the_schema() -> Result<(), Box<dyn std::error::Error>> {
    let mut layer = layer_with_one_point()?;
    layer.start_editing()?;

    layer.add_attribute(FieldDef::new("extra", FieldType::Integer))?;
    layer.delete_attribute(0)?;
    layer.rename_attribute(0, "count")?;
    assert!(layer.rollback());

    assert_eq!(names(&layer), vec!["fldtxt", "fldint"]);
    let feature = layer.get_feature(FeatureId::Persisted(1))?;
    assert_eq!(feature.attributes, vec![FieldValue::from("test"), FieldValue::from(123)]);
    assert!(!layer.rollback());
    Ok(())
}

#[test]
fn expression_fields_are_removed_and_renamed_directly() -> Result<(), Box<dyn std::error::Error>> {
    let mut layer = layer_with_one_point()?;
    let index = layer.add_expression_field("fldint * 2", FieldDef::new("double", FieldType::Integer))?;
    assert_eq!(index, 2);

    // No session needed for derived fields.
    layer.rename_attribute(index, "twice")?;
    assert_eq!(names(&layer), vec!["fldtxt", "fldint", "twice"]);

    layer.start_editing()?;
    layer.delete_attribute(index)?;
    assert_eq!(names(&layer), vec!["fldtxt", "fldint"]);
    // Nothing entered the undo history.
    assert_eq!(layer.undo_stack().ok_or("no session")?.undo_depth(), 0);
    Ok(())
}

#[test]
fn added_attribute_lands_before_derived_fields() -> Result<(), Box<dyn std::error::Error>> {
    let mut layer = layer_with_one_point()?;
    layer.add_expression_field("5", FieldDef::new("five", FieldType::Integer))?;
    layer.start_editing()?;

    let index = layer.add_attribute(FieldDef::new("extra", FieldType::Text))?;
    assert_eq!(index, 2);
    assert_eq!(names(&layer), vec!["fldtxt", "fldint", "extra", "five"]);

    let feature = layer.get_feature(FeatureId::Persisted(1))?;
    assert_eq!(feature.attributes[2], FieldValue::Null);
    assert_eq!(feature.attributes[3], FieldValue::from(5));
    Ok(())
}

#[test]
fn added_attribute_alone_marks_the_session_modified() -> Result<(), Box<dyn std::error::Error>> {
    let mut layer = layer_with_one_point()?;
    layer.start_editing()?;
    assert!(!layer.is_modified());

    layer.add_attribute(FieldDef::new("extra", FieldType::Text))?;
    assert!(layer.is_modified());
    assert!(matches!(layer.reload_fields(), Err(EditError::PendingEdits)));
    assert_eq!(names(&layer), vec!["fldtxt", "fldint", "extra"]);

    layer.undo()?;
    assert!(!layer.is_modified());
    layer.reload_fields()?;
    assert_eq!(names(&layer), vec!["fldtxt", "fldint"]);
    Ok(())
}
