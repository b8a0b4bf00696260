use tracing::warn;

use layeredit_core::{
    ConstraintKind, ConstraintStrength, ContextScope, ExpressionContext, Feature, FeatureId,
    FeatureRequest, FieldValue, LayerId,
};

use crate::error::EditError;
use crate::layer::VectorLayer;
use crate::overlay::{FeatureIterator, OverlayInputs};

/// Resolves the layers a query may need besides its own, and the scope
/// enclosing them.
pub trait LayerLookup {
    fn layer(&self, id: LayerId) -> Option<&VectorLayer>;

    fn scope(&self) -> Option<ContextScope> {
        None
    }
}

/// Lookup for a layer read on its own: joined layers are unavailable and
/// join blocks read as null.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoJoinedLayers;

impl LayerLookup for NoJoinedLayers {
    fn layer(&self, _id: LayerId) -> Option<&VectorLayer> {
        None
    }
}

/// Read access to a layer's overlay within some set of other layers.
#[derive(Clone, Copy)]
pub struct LayerQuery<'a> {
    layer: &'a VectorLayer,
    lookup: &'a dyn LayerLookup,
}

impl<'a> LayerQuery<'a> {
    pub fn new(layer: &'a VectorLayer, lookup: &'a dyn LayerLookup) -> Self {
        Self { layer, lookup }
    }

    pub fn layer(&self) -> &'a VectorLayer {
        self.layer
    }

    /// Project scope, then layer scope, then field names.
    pub fn expression_context(&self) -> ExpressionContext {
        let mut context = ExpressionContext::new();
        if let Some(scope) = self.lookup.scope() {
            context.append_scope(scope);
        }
        context.append_scope(self.layer.layer_scope());
        context.set_fields(self.layer.fields().names());
        context
    }

    pub fn get_features(&self, request: &FeatureRequest) -> Result<FeatureIterator, EditError> {
        let layer = self.layer;
        let inputs = OverlayInputs {
            store: layer.store(),
            fields: layer.fields(),
            buffer: layer.edit_buffer(),
            expressions: layer.expressions(),
            evaluator: layer.evaluator(),
            context: self.expression_context(),
            joins: layer.join_resolver().snapshot(layer.fields(), self.lookup),
        };
        FeatureIterator::new(inputs, request)
    }

    /// The feature as it would be after commit, or `Feature::invalid()`.
    pub fn get_feature(&self, fid: FeatureId) -> Result<Feature, EditError> {
        Ok(self
            .get_features(&FeatureRequest::fid(fid))?
            .next()
            .unwrap_or_else(Feature::invalid))
    }
}

/// A constraint a feature fails.
#[derive(Debug, Clone, PartialEq)]
pub struct ConstraintViolation {
    pub index: usize,
    pub kind: ConstraintKind,
    pub strength: ConstraintStrength,
    pub message: String,
}

impl LayerQuery<'_> {
    /// Evaluates the default-value expression of a field; null if there is
    /// none or it fails.
    pub fn default_value(
        &self,
        index: usize,
        feature: Option<&Feature>,
        extra: Option<&ExpressionContext>,
    ) -> FieldValue {
        let Some(expression) = self.layer.default_value_expression(index) else {
            return FieldValue::Null;
        };
        let mut context = self.expression_context();
        if let Some(extra) = extra {
            context.extend(extra);
        }
        match self.layer.evaluator().evaluate(expression, feature, &context) {
            Ok(value) => value,
            Err(e) => {
                warn!("default value '{}' failed: {}", expression, e);
                FieldValue::Null
            }
        }
    }

    /// Checks every field constraint against `feature`. Uniqueness is checked
    /// against the overlay, ignoring the feature itself.
    pub fn check_constraints(&self, feature: &Feature) -> Result<Vec<ConstraintViolation>, EditError> {
        let context = self.expression_context();
        let mut violations = Vec::new();
        for (index, field) in self.layer.fields().iter().enumerate() {
            let value = feature.attribute(index).cloned().unwrap_or(FieldValue::Null);
            for (kind, entry) in field.constraints.entries() {
                let message = match kind {
                    ConstraintKind::NotNull if value.is_null() => Some("value is null".to_string()),
                    ConstraintKind::NotNull => None,
                    ConstraintKind::Unique => {
                        if value.is_null() {
                            None
                        } else {
                            let mut others = self.get_features(&FeatureRequest::new())?;
                            others
                                .any(|other| {
                                    other.id != feature.id
                                        && other.attribute(index).is_some_and(|v| v.loose_eq(&value))
                                })
                                .then(|| format!("value {} is not unique", value))
                        }
                    }
                    ConstraintKind::Expression => {
                        let Some(expression) = field.constraints.expression() else {
                            continue;
                        };
                        match self.layer.evaluator().evaluate(expression, Some(feature), &context) {
                            Ok(result) if result.is_truthy() => None,
                            Ok(_) => Some(
                                field
                                    .constraints
                                    .description()
                                    .unwrap_or(expression)
                                    .to_string(),
                            ),
                            Err(e) => Some(e.to_string()),
                        }
                    }
                };
                if let Some(message) = message {
                    violations.push(ConstraintViolation {
                        index,
                        kind,
                        strength: entry.strength,
                        message,
                    });
                }
            }
        }
        Ok(violations)
    }
}

impl std::fmt::Debug for LayerQuery<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayerQuery")
            .field("layer", &self.layer.name())
            .finish()
    }
}
