use std::collections::{BTreeMap, BTreeSet};

use layeredit_core::{Feature, FeatureId, FeatureRequest, FieldDef, FieldOrigin, FieldValue, Geometry};

use crate::error::StorageError;
use crate::traits::{persisted, AttributeChanges, FeatureStore, GeometryChanges};

#[derive(Debug, Clone)]
struct StoredFeature {
    attributes: Vec<FieldValue>,
    geometry: Option<Geometry>,
}

/// In-process store. Ids are assigned sequentially from 1.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    fields: Vec<FieldDef>,
    features: BTreeMap<u64, StoredFeature>,
    next_id: u64,
}

impl MemoryStore {
    pub fn new(fields: Vec<FieldDef>) -> Result<Self, StorageError> {
        let mut store = Self {
            fields: Vec::new(),
            features: BTreeMap::new(),
            next_id: 1,
        };
        store.add_attributes(&fields)?;
        Ok(store)
    }

    fn reindex_fields(&mut self) {
        for (i, field) in self.fields.iter_mut().enumerate() {
            field.origin = FieldOrigin::Store { store_index: i };
        }
    }

    fn require(&self, fid: FeatureId) -> Result<u64, StorageError> {
        let id = persisted(fid)?;
        if self.features.contains_key(&id) {
            Ok(id)
        } else {
            Err(StorageError::NotFound(format!("feature {}", fid)))
        }
    }

    fn to_feature(id: u64, stored: &StoredFeature) -> Feature {
        let mut feature = Feature::new(stored.attributes.clone()).with_id(FeatureId::Persisted(id));
        feature.geometry = stored.geometry.clone();
        feature
    }
}

impl FeatureStore for MemoryStore {
    fn fields(&self) -> Result<Vec<FieldDef>, StorageError> {
        Ok(self.fields.clone())
    }

    fn feature_count(&self) -> Result<u64, StorageError> {
        Ok(self.features.len() as u64)
    }

    fn get_features(&self, request: &FeatureRequest) -> Result<Vec<Feature>, StorageError> {
        let ids: Box<dyn Iterator<Item = (&u64, &StoredFeature)>> = match request.fid_filter() {
            Some(fids) => Box::new(
                fids.iter()
                    .filter_map(|fid| fid.as_persisted())
                    .filter_map(|id| self.features.get_key_value(&id)),
            ),
            None => Box::new(self.features.iter()),
        };
        let limit = request.limit.unwrap_or(usize::MAX);
        Ok(ids
            .filter(|(_, stored)| match (&request.rect, &stored.geometry) {
                (None, _) => true,
                (Some(rect), Some(geometry)) => geometry.intersects_rect(rect),
                (Some(_), None) => false,
            })
            .take(limit)
            .map(|(id, stored)| Self::to_feature(*id, stored))
            .collect())
    }

    fn add_features(&mut self, features: &mut [Feature]) -> Result<(), StorageError> {
        for feature in features.iter() {
            if feature.attributes.len() != self.fields.len() {
                return Err(StorageError::SchemaMismatch {
                    expected: self.fields.len(),
                    actual: feature.attributes.len(),
                });
            }
        }
        for feature in features.iter_mut() {
            let id = self.next_id;
            self.next_id += 1;
            self.features.insert(
                id,
                StoredFeature {
                    attributes: feature.attributes.clone(),
                    geometry: feature.geometry.clone(),
                },
            );
            feature.id = FeatureId::Persisted(id);
        }
        Ok(())
    }

    fn delete_features(&mut self, fids: &[FeatureId]) -> Result<(), StorageError> {
        let ids = fids
            .iter()
            .map(|fid| self.require(*fid))
            .collect::<Result<Vec<_>, _>>()?;
        for id in ids {
            self.features.remove(&id);
        }
        Ok(())
    }

    fn change_attribute_values(&mut self, changes: &AttributeChanges) -> Result<(), StorageError> {
        for (fid, values) in changes {
            self.require(*fid)?;
            if let Some(index) = values.keys().find(|i| **i >= self.fields.len()) {
                return Err(StorageError::NotFound(format!("field {}", index)));
            }
        }
        for (fid, values) in changes {
            let id = self.require(*fid)?;
            if let Some(stored) = self.features.get_mut(&id) {
                for (index, value) in values {
                    stored.attributes[*index] = value.clone();
                }
            }
        }
        Ok(())
    }

    fn change_geometries(&mut self, changes: &GeometryChanges) -> Result<(), StorageError> {
        for fid in changes.keys() {
            self.require(*fid)?;
        }
        for (fid, geometry) in changes {
            let id = self.require(*fid)?;
            if let Some(stored) = self.features.get_mut(&id) {
                stored.geometry = Some(geometry.clone());
            }
        }
        Ok(())
    }

    fn add_attributes(&mut self, fields: &[FieldDef]) -> Result<(), StorageError> {
        let mut names: BTreeSet<&str> = self.fields.iter().map(|f| f.name.as_str()).collect();
        for field in fields {
            if field.name.is_empty() || !names.insert(field.name.as_str()) {
                return Err(StorageError::ConstraintViolation(format!(
                    "invalid or duplicate field name '{}'",
                    field.name
                )));
            }
        }
        self.fields.extend(fields.iter().cloned());
        self.reindex_fields();
        for stored in self.features.values_mut() {
            stored.attributes.resize(self.fields.len(), FieldValue::Null);
        }
        Ok(())
    }

    fn delete_attributes(&mut self, indices: &BTreeSet<usize>) -> Result<(), StorageError> {
        if let Some(index) = indices.iter().find(|i| **i >= self.fields.len()) {
            return Err(StorageError::NotFound(format!("field {}", index)));
        }
        for index in indices.iter().rev() {
            self.fields.remove(*index);
            for stored in self.features.values_mut() {
                stored.attributes.remove(*index);
            }
        }
        self.reindex_fields();
        Ok(())
    }

    fn rename_attributes(&mut self, renames: &BTreeMap<usize, String>) -> Result<(), StorageError> {
        let mut names: Vec<String> = self.fields.iter().map(|f| f.name.clone()).collect();
        for (index, name) in renames {
            if *index >= names.len() {
                return Err(StorageError::NotFound(format!("field {}", index)));
            }
            names[*index] = name.clone();
        }
        let unique: BTreeSet<&String> = names.iter().collect();
        if unique.len() != names.len() {
            return Err(StorageError::ConstraintViolation("rename produces duplicate field names".into()));
        }
        for (field, name) in self.fields.iter_mut().zip(names) {
            field.name = name;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use layeredit_core::{FieldType, Rect};

    fn store() -> MemoryStore {
        let mut store = MemoryStore::new(vec![
            FieldDef::new("fldtxt", FieldType::Text),
            FieldDef::new("fldint", FieldType::Integer),
        ])
        .unwrap();
        let mut features = vec![
            Feature::new(vec!["a".into(), 1.into()]).with_geometry(Geometry::point(1.0, 1.0)),
            Feature::new(vec!["b".into(), 2.into()]).with_geometry(Geometry::point(5.0, 5.0)),
        ];
        store.add_features(&mut features).unwrap();
        store
    }

    #[test]
    fn assigns_sequential_ids() {
        let s = store();
        let ids: Vec<_> = s
            .get_features(&FeatureRequest::new())
            .unwrap()
            .into_iter()
            .map(|f| f.id)
            .collect();
        assert_eq!(ids, vec![FeatureId::Persisted(1), FeatureId::Persisted(2)]);
    }

    #[test]
    fn rejects_wrong_attribute_count() {
        let mut s = store();
        let mut bad = vec![Feature::new(vec!["x".into()])];
        assert!(matches!(
            s.add_features(&mut bad),
            Err(StorageError::SchemaMismatch { expected: 2, actual: 1 })
        ));
        assert_eq!(s.feature_count().unwrap(), 2);
    }

    #[test]
    fn rect_and_limit() {
        let s = store();
        let hits = s.get_features(&FeatureRequest::rect(Rect::new(0.0, 0.0, 2.0, 2.0))).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(s.get_features(&FeatureRequest::new().with_limit(1)).unwrap().len(), 1);
    }

    #[test]
    fn delete_attribute_shifts_values() {
        let mut s = store();
        s.delete_attributes(&BTreeSet::from([0])).unwrap();
        let fields = s.fields().unwrap();
        assert_eq!(fields.len(), 1);
        assert_eq!(fields[0].origin, FieldOrigin::Store { store_index: 0 });
        let f = s.get_feature(FeatureId::Persisted(1)).unwrap().unwrap();
        assert_eq!(f.attributes, vec![FieldValue::Integer(1)]);
    }

    #[test]
    fn missing_and_temporary_ids_fail() {
        let mut s = store();
        assert!(s.delete_features(&[FeatureId::Persisted(9)]).is_err());
        assert!(matches!(
            s.delete_features(&[FeatureId::Temporary(1)]),
            Err(StorageError::InvalidId(_))
        ));
    }
}
