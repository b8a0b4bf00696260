use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ConstraintKind {
    NotNull,
    Unique,
    Expression,
}

/// Where a constraint was declared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConstraintOrigin {
    NotSet,
    /// Enforced by the underlying store.
    Provider,
    /// Declared on the layer.
    Layer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConstraintStrength {
    NotSet,
    /// Violations block the edit.
    Hard,
    /// Violations are reported as warnings.
    Soft,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstraintEntry {
    pub origin: ConstraintOrigin,
    pub strength: ConstraintStrength,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldConstraints {
    entries: BTreeMap<ConstraintKind, ConstraintEntry>,
    expression: Option<String>,
    description: Option<String>,
}

impl FieldConstraints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.expression.is_none()
    }

    pub fn kinds(&self) -> impl Iterator<Item = ConstraintKind> + '_ {
        self.entries.keys().copied()
    }

    pub fn contains(&self, kind: ConstraintKind) -> bool {
        self.entries.contains_key(&kind)
    }

    /// Strength of `kind`, or `NotSet` if the constraint is absent.
    pub fn strength(&self, kind: ConstraintKind) -> ConstraintStrength {
        self.entries
            .get(&kind)
            .map(|e| e.strength)
            .unwrap_or(ConstraintStrength::NotSet)
    }

    pub fn origin(&self, kind: ConstraintKind) -> ConstraintOrigin {
        self.entries
            .get(&kind)
            .map(|e| e.origin)
            .unwrap_or(ConstraintOrigin::NotSet)
    }

    /// Sets or replaces a constraint. A `NotSet` strength removes it.
    pub fn set(&mut self, kind: ConstraintKind, origin: ConstraintOrigin, strength: ConstraintStrength) {
        if strength == ConstraintStrength::NotSet {
            self.entries.remove(&kind);
        } else {
            self.entries.insert(kind, ConstraintEntry { origin, strength });
        }
    }

    pub fn remove(&mut self, kind: ConstraintKind) -> bool {
        if kind == ConstraintKind::Expression {
            self.expression = None;
            self.description = None;
        }
        self.entries.remove(&kind).is_some()
    }

    pub fn expression(&self) -> Option<&str> {
        self.expression.as_deref()
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Sets the constraint expression. `None` clears the expression constraint.
    pub fn set_expression(&mut self, expression: Option<String>, description: Option<String>) {
        match expression {
            Some(expr) if !expr.is_empty() => {
                self.expression = Some(expr);
                self.description = description;
                if !self.contains(ConstraintKind::Expression) {
                    self.set(
                        ConstraintKind::Expression,
                        ConstraintOrigin::Layer,
                        ConstraintStrength::Hard,
                    );
                }
            }
            _ => {
                self.remove(ConstraintKind::Expression);
            }
        }
    }

    pub fn entries(&self) -> impl Iterator<Item = (ConstraintKind, ConstraintEntry)> + '_ {
        self.entries.iter().map(|(k, e)| (*k, *e))
    }
}
