use layeredit_core::{FeatureId, FeatureRequest, FieldDef, FieldType, FieldValue, Geometry, Rect};
use layeredit_engine::VectorLayer;
use layeredit_harness::{init_tracing, layer_with_five_points, layer_with_one_point, point, seed};

/// One-point layer plus three stored features `("test", 3)`: id 2 at
/// (300, 200), ids 3 and 4 at (100, 200).
fn layer_with_four_points() -> Result<VectorLayer, Box<dyn std::error::Error>> {
    let mut layer = layer_with_one_point()?;
    seed(
        layer.store_mut(),
        vec![
            point("test", 3, 300.0, 200.0),
            point("test", 3, 100.0, 200.0),
            point("test", 3, 100.0, 200.0),
        ],
    )?;
    Ok(layer)
}

fn count(layer: &VectorLayer, request: &FeatureRequest) -> Result<usize, Box<dyn std::error::Error>> {
    Ok(layer.get_features(request)?.count())
}

// ============================================================================
// Limits with pending edits
// ============================================================================

#[test]
fn limit_holds_with_pending_deletion() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let mut layer = layer_with_four_points()?;
    let limited = FeatureRequest::new().with_limit(2);
    assert_eq!(count(&layer, &limited)?, 2);

    layer.start_editing()?;
    layer.delete_feature(FeatureId::Persisted(2))?;
    assert_eq!(count(&layer, &limited)?, 2);
    layer.rollback();
    Ok(())
}

#[test]
fn limit_holds_when_an_edit_breaks_the_filter() -> Result<(), Box<dyn std::error::Error>> {
    let mut layer = layer_with_four_points()?;
    layer.start_editing()?;

    let request = FeatureRequest::expression("fldint=3").with_limit(2);
    layer.change_attribute_value(FeatureId::Persisted(3), 1, 4)?;
    let ids: Vec<FeatureId> = layer.get_features(&request)?.map(|f| f.id).collect();
    assert_eq!(ids, vec![FeatureId::Persisted(2), FeatureId::Persisted(4)]);
    Ok(())
}

#[test]
fn limit_holds_when_geometry_leaves_the_rect() -> Result<(), Box<dyn std::error::Error>> {
    let mut layer = layer_with_four_points()?;
    layer.start_editing()?;

    let request = FeatureRequest::rect(Rect::new(50.0, 100.0, 150.0, 300.0)).with_limit(2);
    layer.change_geometry(FeatureId::Persisted(3), Geometry::point(500.0, 600.0))?;
    let ids: Vec<FeatureId> = layer.get_features(&request)?.map(|f| f.id).collect();
    assert_eq!(ids, vec![FeatureId::Persisted(1), FeatureId::Persisted(4)]);
    Ok(())
}

#[test]
fn limit_counts_added_features() -> Result<(), Box<dyn std::error::Error>> {
    let mut layer = layer_with_one_point()?;
    layer.start_editing()?;
    layer.add_feature(point("a", 1, 0.0, 0.0))?;
    layer.add_feature(point("b", 2, 0.0, 0.0))?;

    assert_eq!(count(&layer, &FeatureRequest::new().with_limit(2))?, 2);
    assert_eq!(count(&layer, &FeatureRequest::new().with_limit(10))?, 3);
    assert_eq!(count(&layer, &FeatureRequest::new().with_limit(0))?, 0);
    Ok(())
}

// ============================================================================
// Rectangle filters
// ============================================================================

#[test]
fn geometry_moved_into_the_rect_is_returned() -> Result<(), Box<dyn std::error::Error>> {
    let mut layer = layer_with_five_points()?;
    let rect = Rect::new(-10.0, -10.0, 10.0, 10.0);
    let before: Vec<FeatureId> = layer.get_features(&FeatureRequest::rect(rect))?.map(|f| f.id).collect();
    assert_eq!(before, vec![FeatureId::Persisted(5)]);

    layer.start_editing()?;
    layer.change_geometry(FeatureId::Persisted(2), Geometry::point(1.0, 1.0))?;
    layer.change_geometry(FeatureId::Persisted(5), Geometry::point(900.0, 900.0))?;
    let after: Vec<FeatureId> = layer.get_features(&FeatureRequest::rect(rect))?.map(|f| f.id).collect();
    assert_eq!(after, vec![FeatureId::Persisted(2)]);
    Ok(())
}

#[test]
fn added_features_are_rect_filtered() -> Result<(), Box<dyn std::error::Error>> {
    let mut layer = layer_with_one_point()?;
    layer.start_editing()?;
    let inside = layer.add_feature(point("in", 1, 101.0, 201.0))?;
    layer.add_feature(point("out", 2, -50.0, -50.0))?;

    let ids: Vec<FeatureId> = layer
        .get_features(&FeatureRequest::rect(Rect::new(90.0, 190.0, 110.0, 210.0)))?
        .map(|f| f.id)
        .collect();
    assert_eq!(ids, vec![FeatureId::Persisted(1), inside]);
    Ok(())
}

// ============================================================================
// Id and attribute filters
// ============================================================================

#[test]
fn fid_requests_mix_stored_and_added_features() -> Result<(), Box<dyn std::error::Error>> {
    let mut layer = layer_with_five_points()?;
    layer.start_editing()?;
    let added = layer.add_feature(point("new", 5, 0.0, 0.0))?;
    layer.delete_feature(FeatureId::Persisted(3))?;

    let ids: Vec<FeatureId> = layer
        .get_features(&FeatureRequest::fids([
            FeatureId::Persisted(1),
            FeatureId::Persisted(3),
            added,
        ]))?
        .map(|f| f.id)
        .collect();
    assert_eq!(ids, vec![FeatureId::Persisted(1), added]);
    Ok(())
}

#[test]
fn attribute_equals_sees_pending_values() -> Result<(), Box<dyn std::error::Error>> {
    let mut layer = layer_with_five_points()?;
    let request = FeatureRequest::attribute_equals("fldtxt", "test2");
    assert_eq!(count(&layer, &request)?, 2);

    layer.start_editing()?;
    layer.change_attribute_value(FeatureId::Persisted(1), 0, "test2")?;
    layer.change_attribute_value(FeatureId::Persisted(2), 0, FieldValue::Null)?;
    let ids: Vec<FeatureId> = layer.get_features(&request)?.map(|f| f.id).collect();
    assert_eq!(ids, vec![FeatureId::Persisted(1), FeatureId::Persisted(3)]);

    let nulls = FeatureRequest::attribute_equals("fldtxt", FieldValue::Null);
    assert_eq!(count(&layer, &nulls)?, 1);
    Ok(())
}

#[test]
fn expression_filter_uses_overlay_values() -> Result<(), Box<dyn std::error::Error>> {
    let mut layer = layer_with_five_points()?;
    assert_eq!(count(&layer, &FeatureRequest::expression("fldint > 100"))?, 3);

    layer.start_editing()?;
    layer.change_attribute_value(FeatureId::Persisted(4), 1, 500)?;
    layer.add_feature(point("new", 1000, 0.0, 0.0))?;
    assert_eq!(count(&layer, &FeatureRequest::expression("fldint > 100"))?, 5);
    assert_eq!(count(&layer, &FeatureRequest::expression("fldtxt = 'new' AND fldint >= 1000"))?, 1);
    Ok(())
}

#[test]
fn failing_filter_expression_matches_nothing() -> Result<(), Box<dyn std::error::Error>> {
    let layer = layer_with_five_points()?;
    assert_eq!(count(&layer, &FeatureRequest::expression("fldint >"))?, 0);
    assert_eq!(count(&layer, &FeatureRequest::expression("missing_field = 1"))?, 0);
    Ok(())
}

// ============================================================================
// Expression fields
// ============================================================================

#[test]
fn expression_field_lifecycle() -> Result<(), Box<dyn std::error::Error>> {
    let mut layer = layer_with_one_point()?;
    let before = layer.fields().len();

    let index = layer.add_expression_field("5", FieldDef::new("test", FieldType::Integer))?;
    assert_eq!(layer.fields().len(), before + 1);
    assert_eq!(layer.expression_field(index), Some("5"));

    let mut iter = layer.get_features(&FeatureRequest::new())?;
    assert_eq!(iter.fields(), layer.fields());
    let feature = iter.next().ok_or("no feature")?;
    assert_eq!(feature.attributes[index], FieldValue::from(5));

    let single = layer.get_feature(FeatureId::Persisted(1))?;
    assert_eq!(single.attributes.len(), layer.fields().len());

    layer.update_expression_field(0, "9")?;
    assert_eq!(layer.get_feature(FeatureId::Persisted(1))?.attributes[index], FieldValue::from(9));

    layer.remove_expression_field(0)?;
    assert_eq!(layer.fields().len(), before);
    assert!(layer.remove_expression_field(0).is_err());
    Ok(())
}

#[test]
fn expression_field_can_be_filtered_on() -> Result<(), Box<dyn std::error::Error>> {
    let mut layer = layer_with_one_point()?;
    layer.add_expression_field("5", FieldDef::new("test", FieldType::Integer))?;

    assert_eq!(count(&layer, &FeatureRequest::expression("\"test\" = 6"))?, 0);
    assert_eq!(count(&layer, &FeatureRequest::expression("\"test\" = 5"))?, 1);
    Ok(())
}

#[test]
fn expression_fields_see_pending_edits_and_variables() -> Result<(), Box<dyn std::error::Error>> {
    let mut layer = layer_with_one_point()?;
    layer.set_variable("factor", 10);
    let index = layer.add_expression_field("fldint * @factor", FieldDef::new("scaled", FieldType::Integer))?;
    let label = layer.add_expression_field("@layer_name || ':' || fldtxt", FieldDef::new("label", FieldType::Text))?;

    layer.start_editing()?;
    layer.change_attribute_value(FeatureId::Persisted(1), 1, 2)?;
    let fid = layer.add_feature(point("new", 3, 0.0, 0.0))?;

    assert_eq!(layer.get_feature(FeatureId::Persisted(1))?.attributes[index], FieldValue::from(20));
    let added = layer.get_feature(fid)?;
    assert_eq!(added.attributes[index], FieldValue::from(30));
    assert_eq!(added.attributes[label], FieldValue::from("addfeat:new"));
    Ok(())
}

#[test]
fn broken_expression_field_reads_null() -> Result<(), Box<dyn std::error::Error>> {
    let mut layer = layer_with_one_point()?;
    let index = layer.add_expression_field("fldint +", FieldDef::new("broken", FieldType::Integer))?;
    assert_eq!(layer.get_feature(FeatureId::Persisted(1))?.attributes[index], FieldValue::Null);
    Ok(())
}

// ============================================================================
// Snapshots
// ============================================================================

#[test]
fn iterators_are_unaffected_by_later_edits() -> Result<(), Box<dyn std::error::Error>> {
    let mut layer = layer_with_five_points()?;
    layer.start_editing()?;

    let mut iter = layer.get_features(&FeatureRequest::new())?;
    let first = iter.next().ok_or("empty")?;
    layer.delete_feature(FeatureId::Persisted(2))?;
    layer.change_attribute_value(FeatureId::Persisted(3), 1, 0)?;

    let rest: Vec<_> = iter.collect();
    assert_eq!(first.id, FeatureId::Persisted(1));
    assert_eq!(rest.len(), 4);
    assert_eq!(rest[0].id, FeatureId::Persisted(2));
    assert_eq!(rest[1].attributes[1], FieldValue::from(888));
    Ok(())
}

#[test]
fn iterators_survive_a_commit_that_empties_the_store() -> Result<(), Box<dyn std::error::Error>> {
    let mut layer = layer_with_five_points()?;
    let iter = layer.get_features(&FeatureRequest::new())?;

    layer.start_editing()?;
    let all: Vec<FeatureId> = (1..=5).map(FeatureId::Persisted).collect();
    layer.delete_features(&all)?;
    assert!(layer.commit_changes()?.is_success());
    assert_eq!(layer.store().feature_count()?, 0);

    let ids: Vec<FeatureId> = iter.map(|f| f.id).collect();
    assert_eq!(ids, all);
    Ok(())
}

#[test]
fn missing_feature_reads_as_invalid() -> Result<(), Box<dyn std::error::Error>> {
    let layer = layer_with_one_point()?;
    let feature = layer.get_feature(FeatureId::Persisted(77))?;
    assert!(!feature.is_valid());
    assert!(layer.get_feature(FeatureId::Persisted(1))?.is_valid());
    Ok(())
}
