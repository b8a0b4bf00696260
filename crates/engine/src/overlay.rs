use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::debug;

use layeredit_core::{
    ExpressionContext, ExpressionEvaluator, Feature, FeatureFilter, FeatureId, FeatureRequest,
    FieldOrigin, FieldSchema, FieldValue, Rect,
};
use layeredit_storage::FeatureStore;

use crate::buffer::EditBuffer;
use crate::error::EditError;
use crate::join::JoinSnapshot;

/// Everything a layer contributes to one overlay read.
pub(crate) struct OverlayInputs<'a> {
    pub store: &'a dyn FeatureStore,
    pub fields: &'a FieldSchema,
    pub buffer: Option<&'a EditBuffer>,
    pub expressions: &'a [String],
    pub evaluator: Arc<dyn ExpressionEvaluator>,
    pub context: ExpressionContext,
    pub joins: Vec<JoinSnapshot>,
}

/// Features as they would be after commit: store rows with pending edits
/// applied, followed by pending additions.
///
/// The iterator owns a snapshot taken when it was created; later edits to
/// the layer do not affect features it has not yet produced. It holds no
/// borrow of the layer, so the matching store rows are read up front (cut
/// down by the store-side rect and, when exact, the limit). Overrides,
/// expression fields, join lookups and filters still run per `next()`.
pub struct FeatureIterator {
    store_rows: std::vec::IntoIter<Feature>,
    added: std::vec::IntoIter<Feature>,
    buffer: EditBuffer,
    fields: FieldSchema,
    /// Store index per data field; `None` for fields added in this session.
    data_sources: Vec<Option<usize>>,
    expressions: Vec<String>,
    evaluator: Arc<dyn ExpressionEvaluator>,
    context: ExpressionContext,
    joins: Vec<JoinSnapshot>,
    filter: FeatureFilter,
    rect: Option<Rect>,
    remaining: Option<usize>,
}

impl FeatureIterator {
    pub(crate) fn new(inputs: OverlayInputs<'_>, request: &FeatureRequest) -> Result<Self, EditError> {
        let buffer = inputs.buffer.cloned().unwrap_or_default();
        let data_sources = inputs
            .fields
            .iter()
            .take_while(|f| f.origin.is_data())
            .map(|f| match f.origin {
                FieldOrigin::Store { store_index } => Some(store_index),
                _ => None,
            })
            .collect();

        let (store_rows, added) = match request.fid_filter() {
            Some(fids) => fetch_by_ids(inputs.store, &buffer, fids)?,
            None => fetch_all(inputs.store, &buffer, request)?,
        };
        debug!(
            "overlay read: {} store rows, {} added",
            store_rows.len(),
            added.len()
        );

        let mut context = inputs.context;
        context.set_fields(inputs.fields.names());

        Ok(Self {
            store_rows: store_rows.into_iter(),
            added: added.into_iter(),
            buffer,
            fields: inputs.fields.clone(),
            data_sources,
            expressions: inputs.expressions.to_vec(),
            evaluator: inputs.evaluator,
            context,
            joins: inputs.joins,
            filter: request.filter.clone(),
            rect: request.rect,
            remaining: request.limit,
        })
    }

    pub fn fields(&self) -> &FieldSchema {
        &self.fields
    }

    /// Next feature plus, per registered join, whether a joined row matched.
    pub(crate) fn next_with_join_status(&mut self) -> Option<(Feature, Vec<bool>)> {
        loop {
            if self.remaining == Some(0) {
                return None;
            }
            let (raw, from_store) = if let Some(f) = self.store_rows.next() {
                (f, true)
            } else if let Some(f) = self.added.next() {
                (f, false)
            } else {
                return None;
            };
            if from_store && self.buffer.is_feature_deleted(raw.id) {
                continue;
            }
            let (feature, matched) = self.materialize(raw, from_store);
            if !self.accepts(&feature) {
                continue;
            }
            if let Some(n) = self.remaining.as_mut() {
                *n -= 1;
            }
            return Some((feature, matched));
        }
    }

    fn materialize(&self, raw: Feature, from_store: bool) -> (Feature, Vec<bool>) {
        let mut attributes = vec![FieldValue::Null; self.fields.len()];
        if from_store {
            for (position, source) in self.data_sources.iter().enumerate() {
                if let Some(value) = source.and_then(|i| raw.attribute(i)) {
                    attributes[position] = value.clone();
                }
            }
        } else {
            for (position, value) in raw.attributes.iter().enumerate().take(self.data_sources.len()) {
                attributes[position] = value.clone();
            }
        }

        let mut feature = Feature::new(attributes).with_id(raw.id);
        feature.geometry = raw.geometry;
        if from_store {
            self.buffer.apply_overrides(&mut feature);
        }

        let matched = self
            .joins
            .iter()
            .map(|join| join.resolve(&mut feature))
            .collect();

        for (position, field) in self.fields.iter().enumerate() {
            if let FieldOrigin::Expression { expression_index } = field.origin {
                let value = self.evaluate_field(expression_index, &feature);
                feature.set_attribute(position, value);
            }
        }
        (feature, matched)
    }

    fn evaluate_field(&self, expression_index: usize, feature: &Feature) -> FieldValue {
        let Some(expression) = self.expressions.get(expression_index) else {
            return FieldValue::Null;
        };
        match self.evaluator.evaluate(expression, Some(feature), &self.context) {
            Ok(value) => value,
            Err(e) => {
                debug!("expression field '{}' failed: {}", expression, e);
                FieldValue::Null
            }
        }
    }

    fn accepts(&self, feature: &Feature) -> bool {
        if let Some(rect) = &self.rect {
            match &feature.geometry {
                Some(geometry) if geometry.intersects_rect(rect) => {}
                _ => return false,
            }
        }
        match &self.filter {
            FeatureFilter::All => true,
            FeatureFilter::Fids(fids) => fids.contains(&feature.id),
            FeatureFilter::Expression(expression) => {
                match self.evaluator.evaluate(expression, Some(feature), &self.context) {
                    Ok(value) => value.is_truthy(),
                    Err(e) => {
                        debug!("filter '{}' failed: {}", expression, e);
                        false
                    }
                }
            }
            FeatureFilter::AttributeEquals { field, value } => self
                .fields
                .index_of(field)
                .and_then(|i| feature.attribute(i))
                .is_some_and(|v| if value.is_null() { v.is_null() } else { v.loose_eq(value) }),
        }
    }
}

impl Iterator for FeatureIterator {
    type Item = Feature;

    fn next(&mut self) -> Option<Feature> {
        self.next_with_join_status().map(|(feature, _)| feature)
    }
}

impl std::fmt::Debug for FeatureIterator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeatureIterator")
            .field("store_rows", &self.store_rows.len())
            .field("added", &self.added.len())
            .field("filter", &self.filter)
            .field("remaining", &self.remaining)
            .finish()
    }
}

fn fetch_by_ids(
    store: &dyn FeatureStore,
    buffer: &EditBuffer,
    fids: &BTreeSet<FeatureId>,
) -> Result<(Vec<Feature>, Vec<Feature>), EditError> {
    let persisted: Vec<FeatureId> = fids
        .iter()
        .copied()
        .filter(|fid| fid.is_persisted() && !buffer.is_feature_deleted(*fid))
        .collect();
    let store_rows = if persisted.is_empty() {
        Vec::new()
    } else {
        store.get_features(&FeatureRequest::fids(persisted))?
    };
    let added = fids
        .iter()
        .filter_map(|fid| buffer.added_features().get(fid).cloned())
        .collect();
    Ok((store_rows, added))
}

fn fetch_all(
    store: &dyn FeatureStore,
    buffer: &EditBuffer,
    request: &FeatureRequest,
) -> Result<(Vec<Feature>, Vec<Feature>), EditError> {
    // The store limit is exact only when nothing can hide or add rows.
    let limit = if buffer.is_empty() && !request.has_attribute_filter() {
        request.limit
    } else {
        None
    };
    let store_request = FeatureRequest {
        filter: FeatureFilter::All,
        rect: request.rect,
        limit,
    };
    let mut store_rows = store.get_features(&store_request)?;

    // Rows whose pending geometry moves them into the rectangle.
    if let Some(rect) = &request.rect {
        let returned: BTreeSet<FeatureId> = store_rows.iter().map(|f| f.id).collect();
        let moved_in: Vec<FeatureId> = buffer
            .changed_geometries()
            .iter()
            .filter(|(fid, geometry)| {
                fid.is_persisted()
                    && !returned.contains(fid)
                    && !buffer.is_feature_deleted(**fid)
                    && geometry.intersects_rect(rect)
            })
            .map(|(fid, _)| *fid)
            .collect();
        if !moved_in.is_empty() {
            store_rows.extend(store.get_features(&FeatureRequest::fids(moved_in))?);
        }
    }

    let added = buffer.added_features().values().cloned().collect();
    Ok((store_rows, added))
}
