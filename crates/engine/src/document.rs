use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use layeredit_core::{
    ConstraintKind, ConstraintOrigin, ConstraintStrength, FieldConstraints, FieldDef, FieldType,
    FieldValue,
};

pub const DOCUMENT_VERSION: u32 = 1;

/// Per-layer metadata that outlives a session: field aliases, defaults,
/// constraints and expression fields. Fields are matched by name on load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerDocument {
    pub version: u32,
    pub name: String,
    #[serde(default)]
    pub fields: Vec<FieldMetadata>,
    #[serde(default)]
    pub expression_fields: Vec<ExpressionFieldDocument>,
    #[serde(default)]
    pub variables: BTreeMap<String, FieldValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldMetadata {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_expression: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub constraints: Vec<ConstraintDocument>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constraint_expression: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constraint_description: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstraintDocument {
    pub kind: ConstraintKind,
    pub origin: ConstraintOrigin,
    pub strength: ConstraintStrength,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpressionFieldDocument {
    pub name: String,
    pub field_type: FieldType,
    pub expression: String,
}

impl FieldMetadata {
    pub(crate) fn from_field(field: &FieldDef) -> Self {
        Self {
            name: field.name.clone(),
            alias: field.alias.clone(),
            default_expression: field.default_expression.clone(),
            constraints: field
                .constraints
                .entries()
                .map(|(kind, entry)| ConstraintDocument {
                    kind,
                    origin: entry.origin,
                    strength: entry.strength,
                })
                .collect(),
            constraint_expression: field.constraints.expression().map(str::to_string),
            constraint_description: field.constraints.description().map(str::to_string),
        }
    }

    /// Overwrites the metadata of `field` with this record.
    pub(crate) fn apply_to(&self, field: &mut FieldDef) {
        field.alias = self.alias.clone().filter(|a| !a.is_empty());
        field.default_expression = self.default_expression.clone();
        let mut constraints = FieldConstraints::new();
        for c in &self.constraints {
            constraints.set(c.kind, c.origin, c.strength);
        }
        if self.constraint_expression.is_some() {
            constraints.set_expression(
                self.constraint_expression.clone(),
                self.constraint_description.clone(),
            );
        }
        field.constraints = constraints;
    }

    /// Metadata-free fields are left out of written documents.
    pub(crate) fn is_empty(&self) -> bool {
        self.alias.is_none()
            && self.default_expression.is_none()
            && self.constraints.is_empty()
            && self.constraint_expression.is_none()
    }
}

/// Clears every metadata attribute of a field absent from a loaded document.
pub(crate) fn clear_metadata(field: &mut FieldDef) {
    field.alias = None;
    field.default_expression = None;
    field.constraints = FieldConstraints::new();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_survives_json() {
        let mut field = FieldDef::new("fldint", FieldType::Integer);
        field.alias = Some("Number".into());
        field.constraints.set(ConstraintKind::Unique, ConstraintOrigin::Layer, ConstraintStrength::Soft);
        field
            .constraints
            .set_expression(Some("fldint > 0".into()), Some("positive".into()));

        let meta = FieldMetadata::from_field(&field);
        let json = serde_json::to_string(&meta).unwrap();
        let back: FieldMetadata = serde_json::from_str(&json).unwrap();

        let mut restored = FieldDef::new("fldint", FieldType::Integer);
        back.apply_to(&mut restored);
        assert_eq!(restored, field);
    }

    #[test]
    fn empty_alias_reads_as_none() {
        let meta = FieldMetadata {
            name: "a".into(),
            alias: Some(String::new()),
            default_expression: None,
            constraints: Vec::new(),
            constraint_expression: None,
            constraint_description: None,
        };
        let mut field = FieldDef::new("a", FieldType::Text);
        meta.apply_to(&mut field);
        assert_eq!(field.alias, None);
    }
}
