pub mod constraints;
pub mod error;
pub mod expression;
pub mod feature;
pub mod field_value;
pub mod fields;
pub mod geometry;
pub mod ids;
pub mod request;

pub use constraints::{
    ConstraintEntry, ConstraintKind, ConstraintOrigin, ConstraintStrength, FieldConstraints,
};
pub use error::CoreError;
pub use expression::{ContextScope, EvalError, ExpressionContext, ExpressionEvaluator, NoEvaluator};
pub use feature::Feature;
pub use field_value::FieldValue;
pub use fields::{FieldDef, FieldOrigin, FieldSchema, FieldType};
pub use geometry::{Geometry, Point, Rect};
pub use ids::*;
pub use request::{FeatureFilter, FeatureRequest};
