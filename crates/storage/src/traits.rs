use std::collections::{BTreeMap, BTreeSet};

use layeredit_core::{CoreError, Feature, FeatureId, FeatureRequest, FieldDef, FieldValue, Geometry};

use crate::error::StorageError;

/// Pending attribute writes, keyed by feature then by store field index.
pub type AttributeChanges = BTreeMap<FeatureId, BTreeMap<usize, FieldValue>>;

pub type GeometryChanges = BTreeMap<FeatureId, Geometry>;

/// Durable feature container behind a layer.
///
/// Stores address features by `FeatureId::Persisted` only and report their
/// fields with `FieldOrigin::Store` origins. `get_features` must honor id
/// sets, rectangles and limits; it may ignore attribute-level filters, which
/// the layer overlay applies itself.
pub trait FeatureStore {
    fn fields(&self) -> Result<Vec<FieldDef>, StorageError>;

    fn feature_count(&self) -> Result<u64, StorageError>;

    fn get_features(&self, request: &FeatureRequest) -> Result<Vec<Feature>, StorageError>;

    fn get_feature(&self, fid: FeatureId) -> Result<Option<Feature>, StorageError> {
        if fid.is_temporary() {
            return Ok(None);
        }
        Ok(self.get_features(&FeatureRequest::fid(fid))?.into_iter().next())
    }

    /// Inserts features and writes the store-assigned ids back into them.
    fn add_features(&mut self, features: &mut [Feature]) -> Result<(), StorageError>;

    fn delete_features(&mut self, fids: &[FeatureId]) -> Result<(), StorageError>;

    fn change_attribute_values(&mut self, changes: &AttributeChanges) -> Result<(), StorageError>;

    fn change_geometries(&mut self, changes: &GeometryChanges) -> Result<(), StorageError>;

    /// Appends fields; existing features gain nulls.
    fn add_attributes(&mut self, fields: &[FieldDef]) -> Result<(), StorageError>;

    /// Removes fields by store index; higher indices shift down.
    fn delete_attributes(&mut self, indices: &BTreeSet<usize>) -> Result<(), StorageError>;

    fn rename_attributes(&mut self, renames: &BTreeMap<usize, String>) -> Result<(), StorageError>;
}

pub(crate) fn persisted(fid: FeatureId) -> Result<u64, StorageError> {
    fid.as_persisted().ok_or(StorageError::InvalidId(fid))
}

/// Rowid form of a persisted id. Ids past `i64::MAX` cannot be stored.
pub(crate) fn rowid(fid: FeatureId) -> Result<i64, StorageError> {
    let id = persisted(fid)?;
    i64::try_from(id).map_err(|_| CoreError::IdOutOfRange(id).into())
}
