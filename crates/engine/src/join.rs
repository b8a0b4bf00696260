use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use layeredit_core::{
    Feature, FeatureRequest, FieldDef, FieldOrigin, FieldSchema, FieldValue, LayerId,
};

use crate::query::LayerLookup;

/// Left outer join of another layer's attributes onto this layer's features.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinInfo {
    /// Field of this layer holding the key.
    pub target_field: String,
    pub join_layer: LayerId,
    /// Key field of the joined layer.
    pub join_field: String,
    /// Prefix for joined field names; defaults to `<joined layer name>_`.
    pub prefix: Option<String>,
    /// Precompute a key map instead of scanning per request.
    pub cached: bool,
    /// Restrict the joined block to these joined-layer field names.
    pub field_subset: Option<Vec<String>>,
}

impl JoinInfo {
    pub fn new(target_field: impl Into<String>, join_layer: LayerId, join_field: impl Into<String>) -> Self {
        Self {
            target_field: target_field.into(),
            join_layer,
            join_field: join_field.into(),
            prefix: None,
            cached: false,
            field_subset: None,
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    pub fn with_cache(mut self, cached: bool) -> Self {
        self.cached = cached;
        self
    }

    pub fn with_field_subset(mut self, fields: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.field_subset = Some(fields.into_iter().map(Into::into).collect());
        self
    }
}

/// Hashable join key. Integral floats collapse onto integers so that
/// `123` and `123.0` join.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum JoinKey {
    Integer(i64),
    Float(u64),
    Text(String),
    Boolean(bool),
    Date(i32),
    DateTime(i64),
    Bytes(Vec<u8>),
}

impl JoinKey {
    pub(crate) fn from_value(value: &FieldValue) -> Option<JoinKey> {
        match value {
            FieldValue::Null => None,
            FieldValue::Integer(n) => Some(JoinKey::Integer(*n)),
            FieldValue::Float(f) => {
                if f.fract() == 0.0 && f.abs() < i64::MAX as f64 {
                    Some(JoinKey::Integer(*f as i64))
                } else {
                    Some(JoinKey::Float(f.to_bits()))
                }
            }
            FieldValue::Text(s) => Some(JoinKey::Text(s.clone())),
            FieldValue::Boolean(b) => Some(JoinKey::Boolean(*b)),
            FieldValue::Date(d) => Some(JoinKey::Date(*d)),
            FieldValue::DateTime(t) => Some(JoinKey::DateTime(*t)),
            FieldValue::Bytes(b) => Some(JoinKey::Bytes(b.clone())),
        }
    }
}

/// A registered join plus the joined-layer field names its block carries,
/// aligned with the block's schema positions.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct RegisteredJoin {
    pub info: JoinInfo,
    pub source_fields: Vec<String>,
}

type JoinMap = HashMap<JoinKey, Vec<FieldValue>>;

#[derive(Debug)]
struct CachedJoin {
    layer_revision: u64,
    map: Arc<JoinMap>,
}

/// How one join block is resolved for the lifetime of an iterator.
#[derive(Debug, Clone)]
pub(crate) enum JoinLookup {
    /// Joined layer or key field missing; every row is unmatched.
    Unavailable,
    Cached(Arc<JoinMap>),
    Scan {
        features: Arc<Vec<Feature>>,
        key_index: usize,
        source_indices: Vec<Option<usize>>,
    },
}

#[derive(Debug, Clone)]
pub(crate) struct JoinSnapshot {
    positions: Vec<usize>,
    target_index: Option<usize>,
    lookup: JoinLookup,
}

impl JoinSnapshot {
    /// Fills the join block of `feature`; returns whether a joined row matched.
    pub(crate) fn resolve(&self, feature: &mut Feature) -> bool {
        let key = self
            .target_index
            .and_then(|i| feature.attribute(i))
            .and_then(JoinKey::from_value);
        let Some(key) = key else {
            return false;
        };
        let values: Option<Vec<FieldValue>> = match &self.lookup {
            JoinLookup::Unavailable => None,
            JoinLookup::Cached(map) => map.get(&key).cloned(),
            JoinLookup::Scan {
                features,
                key_index,
                source_indices,
            } => features
                .iter()
                .find(|f| {
                    f.attribute(*key_index).and_then(JoinKey::from_value).as_ref() == Some(&key)
                })
                .map(|f| block_values(f, source_indices)),
        };
        match values {
            Some(values) => {
                for (position, value) in self.positions.iter().zip(values) {
                    feature.set_attribute(*position, value);
                }
                true
            }
            None => false,
        }
    }
}

fn block_values(feature: &Feature, source_indices: &[Option<usize>]) -> Vec<FieldValue> {
    source_indices
        .iter()
        .map(|i| {
            i.and_then(|i| feature.attribute(i).cloned())
                .unwrap_or(FieldValue::Null)
        })
        .collect()
}

/// Joins registered on a layer, with the per-join key maps of cached joins.
#[derive(Debug, Default)]
pub(crate) struct JoinResolver {
    joins: Vec<RegisteredJoin>,
    cache: RefCell<BTreeMap<usize, CachedJoin>>,
}

impl JoinResolver {
    pub(crate) fn joins(&self) -> &[RegisteredJoin] {
        &self.joins
    }

    pub(crate) fn len(&self) -> usize {
        self.joins.len()
    }

    pub(crate) fn position_of(&self, join_layer: LayerId) -> Option<usize> {
        self.joins.iter().position(|j| j.info.join_layer == join_layer)
    }

    pub(crate) fn push(&mut self, join: RegisteredJoin) {
        self.joins.push(join);
        self.invalidate();
    }

    pub(crate) fn remove(&mut self, index: usize) -> RegisteredJoin {
        self.invalidate();
        self.joins.remove(index)
    }

    pub(crate) fn invalidate(&self) {
        self.cache.borrow_mut().clear();
    }

    /// Builds the join block definitions for a join about to be registered.
    ///
    /// The join key field and the joined layer's own joined fields are
    /// excluded; names colliding with `fields` are skipped.
    pub(crate) fn block_fields(
        info: &JoinInfo,
        join_index: usize,
        joined_name: &str,
        joined_fields: &FieldSchema,
        fields: &FieldSchema,
    ) -> (Vec<FieldDef>, Vec<String>) {
        let prefix = info
            .prefix
            .clone()
            .unwrap_or_else(|| format!("{}_", joined_name));
        let mut defs = Vec::new();
        let mut sources = Vec::new();
        for (source_index, source) in joined_fields.iter().enumerate() {
            if source.name == info.join_field || matches!(source.origin, FieldOrigin::Join { .. }) {
                continue;
            }
            if let Some(subset) = &info.field_subset
                && !subset.contains(&source.name)
            {
                continue;
            }
            let name = format!("{}{}", prefix, source.name);
            if fields.contains(&name) || defs.iter().any(|d: &FieldDef| d.name == name) {
                warn!("join field '{}' collides with an existing field, skipped", name);
                continue;
            }
            defs.push(
                FieldDef::new(name, source.field_type)
                    .with_origin(FieldOrigin::Join { join_index, source_index }),
            );
            sources.push(source.name.clone());
        }
        (defs, sources)
    }

    /// Freezes every join for one iterator.
    pub(crate) fn snapshot(&self, fields: &FieldSchema, lookup: &dyn LayerLookup) -> Vec<JoinSnapshot> {
        self.joins
            .iter()
            .enumerate()
            .map(|(join_index, join)| JoinSnapshot {
                positions: fields.join_positions(join_index),
                target_index: fields.index_of(&join.info.target_field),
                lookup: self.lookup_for(join_index, join, lookup),
            })
            .collect()
    }

    fn lookup_for(&self, join_index: usize, join: &RegisteredJoin, lookup: &dyn LayerLookup) -> JoinLookup {
        let Some(joined) = lookup.layer(join.info.join_layer) else {
            return JoinLookup::Unavailable;
        };
        let joined_fields = joined.fields();
        let Some(key_index) = joined_fields.index_of(&join.info.join_field) else {
            warn!("join field '{}' missing from joined layer", join.info.join_field);
            return JoinLookup::Unavailable;
        };
        let source_indices: Vec<Option<usize>> = join
            .source_fields
            .iter()
            .map(|name| joined_fields.index_of(name))
            .collect();

        if join.info.cached
            && let Some(cached) = self.cache.borrow().get(&join_index)
            && cached.layer_revision == joined.revision()
        {
            return JoinLookup::Cached(Arc::clone(&cached.map));
        }

        let features: Vec<Feature> = match joined.get_features(&FeatureRequest::new()) {
            Ok(iter) => iter.collect(),
            Err(e) => {
                warn!("cannot read joined layer {}: {}", joined.name(), e);
                return JoinLookup::Unavailable;
            }
        };

        if join.info.cached {
            let mut map = JoinMap::new();
            for feature in &features {
                if let Some(key) = feature.attribute(key_index).and_then(JoinKey::from_value) {
                    map.entry(key)
                        .or_insert_with(|| block_values(feature, &source_indices));
                }
            }
            debug!(
                "rebuilt join cache for {} ({} keys)",
                joined.name(),
                map.len()
            );
            let map = Arc::new(map);
            self.cache.borrow_mut().insert(
                join_index,
                CachedJoin {
                    layer_revision: joined.revision(),
                    map: Arc::clone(&map),
                },
            );
            JoinLookup::Cached(map)
        } else {
            JoinLookup::Scan {
                features: Arc::new(features),
                key_index,
                source_indices,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use layeredit_core::{FieldType, Geometry};

    #[test]
    fn integral_floats_join_integers() {
        assert_eq!(
            JoinKey::from_value(&FieldValue::Float(123.0)),
            JoinKey::from_value(&FieldValue::Integer(123))
        );
        assert_eq!(JoinKey::from_value(&FieldValue::Null), None);
    }

    #[test]
    fn block_excludes_join_field_and_prefixes() {
        let joined = FieldSchema::new(vec![
            FieldDef::new("x", FieldType::Text),
            FieldDef::new("y", FieldType::Integer),
            FieldDef::new("z", FieldType::Integer),
        ])
        .unwrap();
        let info = JoinInfo::new("fldint", LayerId::new(), "y");
        let (defs, sources) =
            JoinResolver::block_fields(&info, 0, "joinlayer", &joined, &FieldSchema::default());
        let names: Vec<_> = defs.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["joinlayer_x", "joinlayer_z"]);
        assert_eq!(sources, vec!["x", "z"]);
        assert_eq!(defs[1].origin, FieldOrigin::Join { join_index: 0, source_index: 2 });
    }

    #[test]
    fn scan_resolves_first_match() {
        let rows = vec![
            Feature::new(vec!["first".into(), 5.into()]).with_geometry(Geometry::point(0.0, 0.0)),
            Feature::new(vec!["second".into(), 5.into()]),
        ];
        let snapshot = JoinSnapshot {
            positions: vec![1],
            target_index: Some(0),
            lookup: JoinLookup::Scan {
                features: Arc::new(rows),
                key_index: 1,
                source_indices: vec![Some(0)],
            },
        };
        let mut feature = Feature::new(vec![FieldValue::Float(5.0), FieldValue::Null]);
        assert!(snapshot.resolve(&mut feature));
        assert_eq!(feature.attributes[1], FieldValue::from("first"));

        let mut unmatched = Feature::new(vec![FieldValue::Integer(6), FieldValue::Null]);
        assert!(!snapshot.resolve(&mut unmatched));
        assert!(unmatched.attributes[1].is_null());
    }
}
