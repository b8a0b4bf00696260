use std::collections::BTreeMap;

use tracing::info;

use layeredit_core::{ContextScope, Feature, FieldValue, LayerId};

use crate::error::EditError;
use crate::join::JoinInfo;
use crate::layer::VectorLayer;
use crate::query::{LayerLookup, LayerQuery};

/// Registry of layers sharing one project scope. Joins between layers are
/// resolved through it.
#[derive(Debug, Default)]
pub struct Project {
    layers: BTreeMap<LayerId, VectorLayer>,
    variables: BTreeMap<String, FieldValue>,
}

impl Project {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_layer(&mut self, layer: VectorLayer) -> LayerId {
        let id = layer.id();
        info!("project: added layer {} ({})", layer.name(), id);
        self.layers.insert(id, layer);
        id
    }

    /// Removes a layer and every join that reads from it.
    pub fn remove_layer(&mut self, id: LayerId) -> Option<VectorLayer> {
        let layer = self.layers.remove(&id)?;
        for other in self.layers.values_mut() {
            other.unregister_join(id);
        }
        Some(layer)
    }

    pub fn layer(&self, id: LayerId) -> Option<&VectorLayer> {
        self.layers.get(&id)
    }

    pub fn layer_mut(&mut self, id: LayerId) -> Option<&mut VectorLayer> {
        self.layers.get_mut(&id)
    }

    pub fn layer_by_name(&self, name: &str) -> Option<&VectorLayer> {
        self.layers.values().find(|l| l.name() == name)
    }

    pub fn layer_ids(&self) -> Vec<LayerId> {
        self.layers.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn set_variable(&mut self, name: impl Into<String>, value: impl Into<FieldValue>) {
        self.variables.insert(name.into(), value.into());
    }

    pub fn variables(&self) -> &BTreeMap<String, FieldValue> {
        &self.variables
    }

    /// Reads a layer with its joins resolved against this project.
    pub fn query(&self, id: LayerId) -> Result<LayerQuery<'_>, EditError> {
        let layer = self.layers.get(&id).ok_or(EditError::LayerNotFound(id))?;
        Ok(LayerQuery::new(layer, self))
    }

    /// Registers a join on `target`, inserting its block of joined fields.
    pub fn add_join(&mut self, target: LayerId, info: JoinInfo) -> Result<(), EditError> {
        let joined = self
            .layers
            .get(&info.join_layer)
            .ok_or(EditError::LayerNotFound(info.join_layer))?;
        let joined_name = joined.name().to_string();
        let joined_fields = joined.fields().clone();
        let layer = self
            .layers
            .get_mut(&target)
            .ok_or(EditError::LayerNotFound(target))?;
        layer.register_join(info, &joined_name, &joined_fields)
    }

    /// Removes the join of `target` reading from `join_layer`. Returns false
    /// if there was none.
    pub fn remove_join(&mut self, target: LayerId, join_layer: LayerId) -> Result<bool, EditError> {
        let layer = self
            .layers
            .get_mut(&target)
            .ok_or(EditError::LayerNotFound(target))?;
        Ok(layer.unregister_join(join_layer).is_some())
    }

    /// Rebuilds the joined field blocks of `target` from the current schemas
    /// of the joined layers.
    pub fn refresh_joins(&mut self, target: LayerId) -> Result<(), EditError> {
        let infos: Vec<JoinInfo> = self
            .layers
            .get(&target)
            .ok_or(EditError::LayerNotFound(target))?
            .joins()
            .into_iter()
            .cloned()
            .collect();
        for info in &infos {
            self.remove_join(target, info.join_layer)?;
        }
        for info in infos {
            self.add_join(target, info)?;
        }
        Ok(())
    }

    /// Default value of a field, evaluated with the project scope.
    pub fn default_value(&self, id: LayerId, index: usize, feature: Option<&Feature>) -> Result<FieldValue, EditError> {
        Ok(self.query(id)?.default_value(index, feature, None))
    }
}

impl LayerLookup for Project {
    fn layer(&self, id: LayerId) -> Option<&VectorLayer> {
        self.layers.get(&id)
    }

    fn scope(&self) -> Option<ContextScope> {
        let mut scope = ContextScope::new("project").with_variable("layer_count", self.layers.len() as i64);
        for (name, value) in &self.variables {
            scope = scope.with_variable(name.as_str(), value.clone());
        }
        Some(scope)
    }
}
