use std::collections::{BTreeMap, BTreeSet};

use layeredit_core::FeatureId;

/// How a new set of ids combines with the current selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectBehavior {
    Set,
    AddTo,
    Intersect,
    RemoveFrom,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Selection {
    ids: BTreeSet<FeatureId>,
}

impl Selection {
    pub fn ids(&self) -> &BTreeSet<FeatureId> {
        &self.ids
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn contains(&self, fid: FeatureId) -> bool {
        self.ids.contains(&fid)
    }

    /// Returns true if the selection changed.
    pub fn apply(&mut self, ids: BTreeSet<FeatureId>, behavior: SelectBehavior) -> bool {
        let next: BTreeSet<FeatureId> = match behavior {
            SelectBehavior::Set => ids,
            SelectBehavior::AddTo => self.ids.union(&ids).copied().collect(),
            SelectBehavior::Intersect => self.ids.intersection(&ids).copied().collect(),
            SelectBehavior::RemoveFrom => self.ids.difference(&ids).copied().collect(),
        };
        let changed = next != self.ids;
        self.ids = next;
        changed
    }

    pub fn clear(&mut self) -> bool {
        let changed = !self.ids.is_empty();
        self.ids.clear();
        changed
    }

    pub(crate) fn remove(&mut self, fid: FeatureId) -> bool {
        self.ids.remove(&fid)
    }

    pub(crate) fn remap(&mut self, assigned: &BTreeMap<FeatureId, FeatureId>) {
        self.ids = self
            .ids
            .iter()
            .map(|fid| assigned.get(fid).copied().unwrap_or(*fid))
            .collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(raw: &[u64]) -> BTreeSet<FeatureId> {
        raw.iter().map(|n| FeatureId::Persisted(*n)).collect()
    }

    #[test]
    fn behaviors_combine() {
        let mut selection = Selection::default();
        selection.apply(ids(&[1, 3]), SelectBehavior::Set);
        selection.apply(ids(&[2, 3]), SelectBehavior::AddTo);
        assert_eq!(selection.ids(), &ids(&[1, 2, 3]));
        selection.apply(ids(&[2, 3, 4]), SelectBehavior::Intersect);
        assert_eq!(selection.ids(), &ids(&[2, 3]));
        selection.apply(ids(&[3]), SelectBehavior::RemoveFrom);
        assert_eq!(selection.ids(), &ids(&[2]));
        assert!(!selection.apply(ids(&[2]), SelectBehavior::Set));
    }

    #[test]
    fn remap_replaces_temporary_ids() {
        let mut selection = Selection::default();
        selection.apply(BTreeSet::from([FeatureId::Temporary(1)]), SelectBehavior::Set);
        selection.remap(&BTreeMap::from([(FeatureId::Temporary(1), FeatureId::Persisted(5))]));
        assert!(selection.contains(FeatureId::Persisted(5)));
    }
}
