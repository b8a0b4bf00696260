use std::collections::BTreeMap;

use thiserror::Error;

use crate::feature::Feature;
use crate::field_value::FieldValue;

#[derive(Debug, Clone, Error, PartialEq)]
#[error("expression error: {0}")]
pub struct EvalError(pub String);

/// Named set of variables, e.g. the project or layer scope.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContextScope {
    pub name: String,
    pub variables: BTreeMap<String, FieldValue>,
}

impl ContextScope {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            variables: BTreeMap::new(),
        }
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.variables.insert(name.into(), value.into());
        self
    }
}

/// Evaluation context: a stack of scopes (later scopes shadow earlier ones)
/// plus the field names that attribute references resolve against.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExpressionContext {
    scopes: Vec<ContextScope>,
    fields: Vec<String>,
}

impl ExpressionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append_scope(&mut self, scope: ContextScope) {
        self.scopes.push(scope);
    }

    pub fn with_scope(mut self, scope: ContextScope) -> Self {
        self.append_scope(scope);
        self
    }

    /// Appends every scope of `other`, keeping this context's fields.
    pub fn extend(&mut self, other: &ExpressionContext) {
        self.scopes.extend(other.scopes.iter().cloned());
    }

    pub fn scopes(&self) -> &[ContextScope] {
        &self.scopes
    }

    pub fn variable(&self, name: &str) -> Option<&FieldValue> {
        self.scopes.iter().rev().find_map(|s| s.variables.get(name))
    }

    pub fn set_fields(&mut self, fields: Vec<String>) {
        self.fields = fields;
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f == name)
    }
}

/// Expression language collaborator.
///
/// The edit engine treats evaluation as a pure function of the expression,
/// the feature and the context.
pub trait ExpressionEvaluator {
    fn evaluate(
        &self,
        expression: &str,
        feature: Option<&Feature>,
        context: &ExpressionContext,
    ) -> Result<FieldValue, EvalError>;
}

/// Evaluator used when none is configured; every evaluation fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoEvaluator;

impl ExpressionEvaluator for NoEvaluator {
    fn evaluate(
        &self,
        expression: &str,
        _feature: Option<&Feature>,
        _context: &ExpressionContext,
    ) -> Result<FieldValue, EvalError> {
        Err(EvalError(format!("no evaluator configured for '{}'", expression)))
    }
}
