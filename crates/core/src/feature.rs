use serde::{Deserialize, Serialize};

use crate::field_value::FieldValue;
use crate::geometry::Geometry;
use crate::ids::FeatureId;

/// A value snapshot of one feature. Attributes are positional and aligned
/// with the schema of whoever produced the feature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    pub id: FeatureId,
    pub attributes: Vec<FieldValue>,
    pub geometry: Option<Geometry>,
    valid: bool,
}

impl Feature {
    /// New feature with a placeholder id; layers and stores assign the real one.
    pub fn new(attributes: Vec<FieldValue>) -> Self {
        Self {
            id: FeatureId::Temporary(0),
            attributes,
            geometry: None,
            valid: true,
        }
    }

    pub fn with_id(mut self, id: FeatureId) -> Self {
        self.id = id;
        self
    }

    pub fn with_geometry(mut self, geometry: Geometry) -> Self {
        self.geometry = Some(geometry);
        self
    }

    /// Sentinel returned by lookups that find nothing.
    pub fn invalid() -> Self {
        Self {
            id: FeatureId::Temporary(0),
            attributes: Vec::new(),
            geometry: None,
            valid: false,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn attribute(&self, index: usize) -> Option<&FieldValue> {
        self.attributes.get(index)
    }

    /// Returns false if `index` is past the end.
    pub fn set_attribute(&mut self, index: usize, value: FieldValue) -> bool {
        match self.attributes.get_mut(index) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }
}
