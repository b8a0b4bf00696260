use std::sync::Arc;

use layeredit_core::{Feature, FieldDef, FieldType, FieldValue, Geometry};
use layeredit_engine::{EditError, VectorLayer};
use layeredit_storage::{FeatureStore, MemoryStore, SqliteStore, StorageError};

use crate::evaluator::SimpleEvaluator;

/// Name shared by the point layers below.
pub const POINT_LAYER: &str = "addfeat";

pub const JOIN_LAYER: &str = "joinlayer";

/// Text field `fldtxt` and integer field `fldint`.
pub fn point_fields() -> Vec<FieldDef> {
    vec![
        FieldDef::new("fldtxt", FieldType::Text),
        FieldDef::new("fldint", FieldType::Integer),
    ]
}

pub fn point(text: &str, value: i64, x: f64, y: f64) -> Feature {
    Feature::new(vec![FieldValue::from(text), FieldValue::from(value)]).with_geometry(Geometry::point(x, y))
}

/// Seeds a store directly, bypassing any edit session.
pub fn seed(store: &mut dyn FeatureStore, rows: Vec<Feature>) -> Result<(), StorageError> {
    let mut rows = rows;
    store.add_features(&mut rows)
}

pub fn layer_over(name: &str, store: impl FeatureStore + 'static) -> Result<VectorLayer, EditError> {
    Ok(VectorLayer::new(name, store)?.with_evaluator(Arc::new(SimpleEvaluator)))
}

pub fn empty_layer() -> Result<VectorLayer, EditError> {
    layer_over(POINT_LAYER, MemoryStore::new(point_fields())?)
}

/// One stored feature `("test", 123)` at (100, 200) with id 1.
pub fn layer_with_one_point() -> Result<VectorLayer, EditError> {
    let mut store = MemoryStore::new(point_fields())?;
    seed(&mut store, vec![point("test", 123, 100.0, 200.0)])?;
    layer_over(POINT_LAYER, store)
}

pub fn layer_with_two_points() -> Result<VectorLayer, EditError> {
    let mut store = MemoryStore::new(point_fields())?;
    seed(
        &mut store,
        vec![point("test", 123, 100.0, 200.0), point("test2", 457, 100.0, 200.0)],
    )?;
    layer_over(POINT_LAYER, store)
}

pub fn layer_with_five_points() -> Result<VectorLayer, EditError> {
    let mut store = MemoryStore::new(point_fields())?;
    seed(&mut store, five_points())?;
    layer_over(POINT_LAYER, store)
}

/// The five-point layer backed by an in-memory SQLite database.
pub fn sqlite_layer_with_five_points() -> Result<VectorLayer, EditError> {
    let mut store = SqliteStore::open_in_memory()?;
    store.add_attributes(&point_fields())?;
    seed(&mut store, five_points())?;
    layer_over(POINT_LAYER, store)
}

fn five_points() -> Vec<Feature> {
    vec![
        point("test", 123, 100.0, 200.0),
        point("test2", 457, 200.0, 200.0),
        point("test2", 888, 300.0, 200.0),
        point("test3", -1, 400.0, 300.0),
        point("test4", 0, 0.0, 0.0),
    ]
}

/// Layer `joinlayer` with fields `x` (text), `y`, `z` (integers). Key `y`
/// values 123 and 457 match the point fixtures.
pub fn join_layer() -> Result<VectorLayer, EditError> {
    let mut store = MemoryStore::new(vec![
        FieldDef::new("x", FieldType::Text),
        FieldDef::new("y", FieldType::Integer),
        FieldDef::new("z", FieldType::Integer),
    ])?;
    let row = |x: &str, y: i64, z: i64, at: f64| {
        Feature::new(vec![FieldValue::from(x), FieldValue::from(y), FieldValue::from(z)])
            .with_geometry(Geometry::point(at, at))
    };
    seed(
        &mut store,
        vec![
            row("foo", 123, 321, 1.0),
            row("bar", 456, 654, 2.0),
            row("qar", 457, 111, 2.0),
            row("a", 458, 19, 2.0),
        ],
    )?;
    layer_over(JOIN_LAYER, store)
}

/// Layer with a single integer field `fldint` holding `values`.
pub fn integer_layer(values: &[Option<i64>]) -> Result<VectorLayer, EditError> {
    let mut store = MemoryStore::new(vec![FieldDef::new("fldint", FieldType::Integer)])?;
    seed(
        &mut store,
        values.iter().map(|v| Feature::new(vec![FieldValue::from(*v)])).collect(),
    )?;
    layer_over("layer", store)
}

/// Layer with a single text field `fldtxt` holding `values`.
pub fn text_layer(values: &[&str]) -> Result<VectorLayer, EditError> {
    let mut store = MemoryStore::new(vec![FieldDef::new("fldtxt", FieldType::Text)])?;
    seed(
        &mut store,
        values.iter().map(|v| Feature::new(vec![FieldValue::from(*v)])).collect(),
    )?;
    layer_over("layer", store)
}
