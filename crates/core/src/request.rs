use std::collections::BTreeSet;

use crate::field_value::FieldValue;
use crate::geometry::Rect;
use crate::ids::FeatureId;

#[derive(Debug, Clone, PartialEq)]
pub enum FeatureFilter {
    All,
    Fids(BTreeSet<FeatureId>),
    Expression(String),
    /// Field is matched by name so the same request works against any schema.
    AttributeEquals { field: String, value: FieldValue },
}

/// What to fetch. The rectangle is orthogonal to `filter`; `limit` caps the
/// total number of features produced.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureRequest {
    pub filter: FeatureFilter,
    pub rect: Option<Rect>,
    pub limit: Option<usize>,
}

impl Default for FeatureRequest {
    fn default() -> Self {
        Self::new()
    }
}

impl FeatureRequest {
    pub fn new() -> Self {
        Self {
            filter: FeatureFilter::All,
            rect: None,
            limit: None,
        }
    }

    pub fn fid(id: FeatureId) -> Self {
        Self::fids([id])
    }

    pub fn fids(ids: impl IntoIterator<Item = FeatureId>) -> Self {
        Self {
            filter: FeatureFilter::Fids(ids.into_iter().collect()),
            ..Self::new()
        }
    }

    pub fn expression(expression: impl Into<String>) -> Self {
        Self {
            filter: FeatureFilter::Expression(expression.into()),
            ..Self::new()
        }
    }

    pub fn attribute_equals(field: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        Self {
            filter: FeatureFilter::AttributeEquals {
                field: field.into(),
                value: value.into(),
            },
            ..Self::new()
        }
    }

    pub fn rect(rect: Rect) -> Self {
        Self::new().with_rect(rect)
    }

    pub fn with_rect(mut self, rect: Rect) -> Self {
        self.rect = Some(rect);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn fid_filter(&self) -> Option<&BTreeSet<FeatureId>> {
        match &self.filter {
            FeatureFilter::Fids(ids) => Some(ids),
            _ => None,
        }
    }

    /// True if the filter can only be decided after attributes are known.
    pub fn has_attribute_filter(&self) -> bool {
        matches!(
            self.filter,
            FeatureFilter::Expression(_) | FeatureFilter::AttributeEquals { .. }
        )
    }
}
