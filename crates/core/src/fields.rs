use serde::{Deserialize, Serialize};

use crate::constraints::FieldConstraints;
use crate::error::CoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldType {
    Text,
    Integer,
    Float,
    Boolean,
    Date,
    DateTime,
    Bytes,
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::Text => "text",
            FieldType::Integer => "integer",
            FieldType::Float => "float",
            FieldType::Boolean => "boolean",
            FieldType::Date => "date",
            FieldType::DateTime => "datetime",
            FieldType::Bytes => "bytes",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "text" => Ok(FieldType::Text),
            "integer" => Ok(FieldType::Integer),
            "float" => Ok(FieldType::Float),
            "boolean" => Ok(FieldType::Boolean),
            "date" => Ok(FieldType::Date),
            "datetime" => Ok(FieldType::DateTime),
            "bytes" => Ok(FieldType::Bytes),
            other => Err(CoreError::InvalidData(format!("unknown field type: {}", other))),
        }
    }
}

/// Provenance of a field in a layer schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldOrigin {
    /// Committed field; `store_index` is its position in the store schema.
    Store { store_index: usize },
    /// Added in the current edit session, not yet committed.
    Edit,
    /// Pulled from a joined layer. `source_index` is the field's index in
    /// the joined layer at registration time.
    Join { join_index: usize, source_index: usize },
    /// Computed per feature from `expression_index` in the layer's expression list.
    Expression { expression_index: usize },
}

impl FieldOrigin {
    /// Store and Edit fields hold real attribute data.
    pub fn is_data(&self) -> bool {
        matches!(self, FieldOrigin::Store { .. } | FieldOrigin::Edit)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    pub field_type: FieldType,
    pub origin: FieldOrigin,
    pub alias: Option<String>,
    pub default_expression: Option<String>,
    pub constraints: FieldConstraints,
}

impl FieldDef {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            origin: FieldOrigin::Edit,
            alias: None,
            default_expression: None,
            constraints: FieldConstraints::default(),
        }
    }

    pub fn with_origin(mut self, origin: FieldOrigin) -> Self {
        self.origin = origin;
        self
    }

    /// Alias if set, otherwise the field name.
    pub fn display_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }
}

/// Ordered field list with case-sensitive unique names.
///
/// Data fields (store and pending-added) always form a prefix; joined blocks
/// follow, then expression fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldSchema {
    fields: Vec<FieldDef>,
}

impl FieldSchema {
    pub fn new(fields: Vec<FieldDef>) -> Result<Self, CoreError> {
        let mut schema = Self::default();
        for field in fields {
            schema.push(field)?;
        }
        Ok(schema)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&FieldDef> {
        self.fields.get(index)
    }

    /// Mutable access for metadata. Renames must go through [`FieldSchema::rename`].
    pub fn get_mut(&mut self, index: usize) -> Option<&mut FieldDef> {
        self.fields.get_mut(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, FieldDef> {
        self.fields.iter()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index_of(name).is_some()
    }

    pub fn names(&self) -> Vec<String> {
        self.fields.iter().map(|f| f.name.clone()).collect()
    }

    pub fn origin(&self, index: usize) -> Option<FieldOrigin> {
        self.fields.get(index).map(|f| f.origin)
    }

    /// Index within the field's own origin space.
    pub fn origin_index(&self, index: usize) -> Option<usize> {
        let field = self.fields.get(index)?;
        match field.origin {
            FieldOrigin::Store { store_index } => Some(store_index),
            FieldOrigin::Edit => Some(
                self.fields[..index]
                    .iter()
                    .filter(|f| f.origin == FieldOrigin::Edit)
                    .count(),
            ),
            FieldOrigin::Join { source_index, .. } => Some(source_index),
            FieldOrigin::Expression { expression_index } => Some(expression_index),
        }
    }

    pub fn data_field_count(&self) -> usize {
        self.fields.iter().take_while(|f| f.origin.is_data()).count()
    }

    pub fn push(&mut self, field: FieldDef) -> Result<usize, CoreError> {
        let index = self.fields.len();
        self.insert(index, field)?;
        Ok(index)
    }

    pub fn insert(&mut self, index: usize, field: FieldDef) -> Result<(), CoreError> {
        if index > self.fields.len() {
            return Err(CoreError::IndexOutOfRange(index));
        }
        if self.contains(&field.name) {
            return Err(CoreError::DuplicateName(field.name));
        }
        self.fields.insert(index, field);
        Ok(())
    }

    pub fn remove(&mut self, index: usize) -> Result<FieldDef, CoreError> {
        if index >= self.fields.len() {
            return Err(CoreError::IndexOutOfRange(index));
        }
        Ok(self.fields.remove(index))
    }

    pub fn rename(&mut self, index: usize, name: &str) -> Result<String, CoreError> {
        if index >= self.fields.len() {
            return Err(CoreError::IndexOutOfRange(index));
        }
        if self.fields[index].name == name {
            return Ok(name.to_string());
        }
        if self.contains(name) {
            return Err(CoreError::DuplicateName(name.to_string()));
        }
        Ok(std::mem::replace(&mut self.fields[index].name, name.to_string()))
    }

    /// Schema position of the expression field with `expression_index`.
    pub fn expression_position(&self, expression_index: usize) -> Option<usize> {
        self.fields.iter().position(|f| {
            f.origin == FieldOrigin::Expression { expression_index }
        })
    }

    /// Schema positions of the fields contributed by join `join_index`.
    pub fn join_positions(&self, join_index: usize) -> Vec<usize> {
        self.fields
            .iter()
            .enumerate()
            .filter(|(_, f)| matches!(f.origin, FieldOrigin::Join { join_index: j, .. } if j == join_index))
            .map(|(i, _)| i)
            .collect()
    }

    /// Position right after the last joined field, where the next join block goes.
    pub fn join_insert_position(&self) -> usize {
        self.fields
            .iter()
            .rposition(|f| f.origin.is_data() || matches!(f.origin, FieldOrigin::Join { .. }))
            .map(|i| i + 1)
            .unwrap_or(0)
    }
}

impl<'a> IntoIterator for &'a FieldSchema {
    type Item = &'a FieldDef;
    type IntoIter = std::slice::Iter<'a, FieldDef>;

    fn into_iter(self) -> Self::IntoIter {
        self.fields.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> FieldSchema {
        FieldSchema::new(vec![
            FieldDef::new("fldtxt", FieldType::Text).with_origin(FieldOrigin::Store { store_index: 0 }),
            FieldDef::new("fldint", FieldType::Integer).with_origin(FieldOrigin::Store { store_index: 1 }),
            FieldDef::new("added", FieldType::Integer),
            FieldDef::new("joinlayer_x", FieldType::Text)
                .with_origin(FieldOrigin::Join { join_index: 0, source_index: 0 }),
            FieldDef::new("expr", FieldType::Integer)
                .with_origin(FieldOrigin::Expression { expression_index: 0 }),
        ])
        .unwrap()
    }

    #[test]
    fn rejects_duplicate_names() {
        let mut s = schema();
        let err = s.push(FieldDef::new("fldint", FieldType::Text));
        assert!(matches!(err, Err(CoreError::DuplicateName(_))));
        // case-sensitive
        assert!(s.push(FieldDef::new("FLDINT", FieldType::Text)).is_ok());
    }

    #[test]
    fn data_prefix_and_positions() {
        let s = schema();
        assert_eq!(s.data_field_count(), 3);
        assert_eq!(s.join_positions(0), vec![3]);
        assert_eq!(s.join_insert_position(), 4);
        assert_eq!(s.expression_position(0), Some(4));
        assert_eq!(s.origin_index(2), Some(0));
        assert_eq!(s.origin_index(3), Some(0));
    }

    #[test]
    fn rename_checks_collisions() {
        let mut s = schema();
        assert!(s.rename(0, "fldint").is_err());
        assert_eq!(s.rename(0, "renamed").unwrap(), "fldtxt");
        assert_eq!(s.index_of("renamed"), Some(0));
        assert!(s.rename(10, "x").is_err());
    }
}
