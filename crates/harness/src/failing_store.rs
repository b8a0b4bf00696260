use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use layeredit_core::{Feature, FeatureId, FeatureRequest, FieldDef};
use layeredit_storage::{AttributeChanges, FeatureStore, GeometryChanges, StorageError};

/// Write operations a `FailingStore` can be told to reject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StoreOperation {
    AddFeatures,
    DeleteFeatures,
    ChangeAttributeValues,
    ChangeGeometries,
    AddAttributes,
    DeleteAttributes,
    RenameAttributes,
}

/// Store wrapper that rejects chosen operations, or any write touching a
/// chosen feature id, with `StorageError::Rejected`. Reads pass through.
#[derive(Debug)]
pub struct FailingStore<S> {
    inner: S,
    operations: BTreeSet<StoreOperation>,
    features: BTreeSet<FeatureId>,
    /// Rejects additions whose first attribute renders as this text.
    added_text: Option<String>,
}

impl<S: FeatureStore> FailingStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            operations: BTreeSet::new(),
            features: BTreeSet::new(),
            added_text: None,
        }
    }

    pub fn reject_operation(mut self, operation: StoreOperation) -> Self {
        self.operations.insert(operation);
        self
    }

    pub fn reject_feature(mut self, fid: FeatureId) -> Self {
        self.features.insert(fid);
        self
    }

    pub fn reject_added_text(mut self, text: impl Into<String>) -> Self {
        self.added_text = Some(text.into());
        self
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    fn check(&self, operation: StoreOperation) -> Result<(), StorageError> {
        if self.operations.contains(&operation) {
            debug!("rejecting {:?}", operation);
            return Err(StorageError::Rejected(format!("{:?} disabled", operation)));
        }
        Ok(())
    }

    fn check_features<'a>(&self, fids: impl IntoIterator<Item = &'a FeatureId>) -> Result<(), StorageError> {
        for fid in fids {
            if self.features.contains(fid) {
                return Err(StorageError::Rejected(format!("feature {} is locked", fid)));
            }
        }
        Ok(())
    }
}

impl<S: FeatureStore> FeatureStore for FailingStore<S> {
    fn fields(&self) -> Result<Vec<FieldDef>, StorageError> {
        self.inner.fields()
    }

    fn feature_count(&self) -> Result<u64, StorageError> {
        self.inner.feature_count()
    }

    fn get_features(&self, request: &FeatureRequest) -> Result<Vec<Feature>, StorageError> {
        self.inner.get_features(request)
    }

    fn add_features(&mut self, features: &mut [Feature]) -> Result<(), StorageError> {
        self.check(StoreOperation::AddFeatures)?;
        if let Some(text) = &self.added_text
            && features
                .iter()
                .any(|f| f.attribute(0).and_then(|v| v.as_text()) == Some(text.as_str()))
        {
            return Err(StorageError::Rejected(format!("value '{}' refused", text)));
        }
        self.inner.add_features(features)
    }

    fn delete_features(&mut self, fids: &[FeatureId]) -> Result<(), StorageError> {
        self.check(StoreOperation::DeleteFeatures)?;
        self.check_features(fids)?;
        self.inner.delete_features(fids)
    }

    fn change_attribute_values(&mut self, changes: &AttributeChanges) -> Result<(), StorageError> {
        self.check(StoreOperation::ChangeAttributeValues)?;
        self.check_features(changes.keys())?;
        self.inner.change_attribute_values(changes)
    }

    fn change_geometries(&mut self, changes: &GeometryChanges) -> Result<(), StorageError> {
        self.check(StoreOperation::ChangeGeometries)?;
        self.check_features(changes.keys())?;
        self.inner.change_geometries(changes)
    }

    fn add_attributes(&mut self, fields: &[FieldDef]) -> Result<(), StorageError> {
        self.check(StoreOperation::AddAttributes)?;
        self.inner.add_attributes(fields)
    }

    fn delete_attributes(&mut self, indices: &BTreeSet<usize>) -> Result<(), StorageError> {
        self.check(StoreOperation::DeleteAttributes)?;
        self.inner.delete_attributes(indices)
    }

    fn rename_attributes(&mut self, renames: &BTreeMap<usize, String>) -> Result<(), StorageError> {
        self.check(StoreOperation::RenameAttributes)?;
        self.inner.rename_attributes(renames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use layeredit_core::FieldType;
    use layeredit_storage::MemoryStore;

    #[test]
    fn rejected_operations_leave_the_inner_store_untouched() {
        let inner = MemoryStore::new(vec![FieldDef::new("name", FieldType::Text)]).unwrap();
        let mut store = FailingStore::new(inner).reject_operation(StoreOperation::AddFeatures);

        let mut rows = [Feature::new(vec!["a".into()])];
        assert!(matches!(store.add_features(&mut rows), Err(StorageError::Rejected(_))));
        assert_eq!(store.feature_count().unwrap(), 0);
        assert!(store.add_attributes(&[FieldDef::new("other", FieldType::Integer)]).is_ok());
    }
}
