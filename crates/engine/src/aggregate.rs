use std::cmp::Ordering;
use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use layeredit_core::{FeatureRequest, FieldOrigin, FieldValue};

use crate::error::EditError;
use crate::query::LayerQuery;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Aggregate {
    Count,
    CountDistinct,
    CountMissing,
    Sum,
    Mean,
    Median,
    StDev,
    StDevSample,
    Min,
    Max,
    Range,
    FirstQuartile,
    ThirdQuartile,
    InterQuartileRange,
    StringConcatenate,
}

impl Aggregate {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Count => "count",
            Self::CountDistinct => "count_distinct",
            Self::CountMissing => "count_missing",
            Self::Sum => "sum",
            Self::Mean => "mean",
            Self::Median => "median",
            Self::StDev => "stdev",
            Self::StDevSample => "stdev_sample",
            Self::Min => "min",
            Self::Max => "max",
            Self::Range => "range",
            Self::FirstQuartile => "q1",
            Self::ThirdQuartile => "q3",
            Self::InterQuartileRange => "iqr",
            Self::StringConcatenate => "concatenate",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateParameters {
    /// Separator for `StringConcatenate`.
    pub delimiter: String,
    /// Optional filter expression restricting the aggregated rows.
    pub filter: Option<String>,
}

impl Default for AggregateParameters {
    fn default() -> Self {
        Self {
            delimiter: ",".to_string(),
            filter: None,
        }
    }
}

impl AggregateParameters {
    pub fn with_delimiter(mut self, delimiter: impl Into<String>) -> Self {
        self.delimiter = delimiter.into();
        self
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }
}

impl LayerQuery<'_> {
    /// Overlay values of one field. For joined fields only rows that found a
    /// joined feature contribute.
    fn field_values(&self, index: usize, filter: Option<&str>) -> Result<Vec<FieldValue>, EditError> {
        let origin = self
            .layer()
            .fields()
            .origin(index)
            .ok_or(EditError::InvalidField(index))?;
        let request = match filter {
            Some(expression) => FeatureRequest::expression(expression),
            None => FeatureRequest::new(),
        };
        let join_index = match origin {
            FieldOrigin::Join { join_index, .. } => Some(join_index),
            _ => None,
        };

        let mut iter = self.get_features(&request)?;
        let mut values = Vec::new();
        while let Some((mut feature, matched)) = iter.next_with_join_status() {
            if let Some(j) = join_index
                && !matched.get(j).copied().unwrap_or(false)
            {
                continue;
            }
            if index < feature.attributes.len() {
                values.push(feature.attributes.swap_remove(index));
            }
        }
        Ok(values)
    }

    pub fn minimum_value(&self, index: usize) -> Result<FieldValue, EditError> {
        let values = self.field_values(index, None)?;
        Ok(extreme(&values, Ordering::Less))
    }

    pub fn maximum_value(&self, index: usize) -> Result<FieldValue, EditError> {
        let values = self.field_values(index, None)?;
        Ok(extreme(&values, Ordering::Greater))
    }

    /// Distinct overlay values in `sort_cmp` order, including null when a
    /// feature holds it.
    pub fn unique_values(&self, index: usize, limit: Option<usize>) -> Result<Vec<FieldValue>, EditError> {
        let values = self.field_values(index, None)?;
        let mut seen = HashSet::new();
        let mut unique: Vec<FieldValue> = values.into_iter().filter(|v| seen.insert(v.clone())).collect();
        unique.sort_by(FieldValue::sort_cmp);
        if let Some(limit) = limit {
            unique.truncate(limit);
        }
        Ok(unique)
    }

    /// Distinct non-null values whose text contains `substring`, ignoring case.
    pub fn unique_strings_matching(
        &self,
        index: usize,
        substring: &str,
        limit: Option<usize>,
    ) -> Result<Vec<String>, EditError> {
        let needle = substring.to_lowercase();
        let values = self.field_values(index, None)?;
        let mut matches: Vec<String> = values
            .iter()
            .filter(|v| !v.is_null())
            .map(|v| v.to_string())
            .filter(|s| s.to_lowercase().contains(&needle))
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        matches.sort();
        if let Some(limit) = limit {
            matches.truncate(limit);
        }
        Ok(matches)
    }

    pub fn aggregate(
        &self,
        kind: Aggregate,
        index: usize,
        parameters: &AggregateParameters,
    ) -> Result<FieldValue, EditError> {
        let values = self.field_values(index, parameters.filter.as_deref())?;
        compute(kind, values, parameters)
    }
}

fn extreme(values: &[FieldValue], wanted: Ordering) -> FieldValue {
    values
        .iter()
        .filter(|v| !v.is_null())
        .reduce(|best, v| if v.sort_cmp(best) == wanted { v } else { best })
        .cloned()
        .unwrap_or(FieldValue::Null)
}

pub(crate) fn compute(
    kind: Aggregate,
    values: Vec<FieldValue>,
    parameters: &AggregateParameters,
) -> Result<FieldValue, EditError> {
    let present = || values.iter().filter(|v| !v.is_null());
    match kind {
        Aggregate::Count => return Ok(FieldValue::Integer(present().count() as i64)),
        Aggregate::CountMissing => {
            return Ok(FieldValue::Integer(values.iter().filter(|v| v.is_null()).count() as i64));
        }
        Aggregate::CountDistinct => {
            let distinct: HashSet<&FieldValue> = present().collect();
            return Ok(FieldValue::Integer(distinct.len() as i64));
        }
        Aggregate::Min => return Ok(extreme(&values, Ordering::Less)),
        Aggregate::Max => return Ok(extreme(&values, Ordering::Greater)),
        Aggregate::StringConcatenate => {
            let parts: Vec<String> = present().map(|v| v.to_string()).collect();
            return Ok(FieldValue::Text(parts.join(&parameters.delimiter)));
        }
        _ => {}
    }

    let mut numbers = Vec::new();
    for value in present() {
        numbers.push(
            value
                .to_f64()
                .ok_or_else(|| EditError::UnsupportedAggregate(kind.as_str().to_string()))?,
        );
    }
    if numbers.is_empty() {
        return Ok(FieldValue::Null);
    }
    numbers.sort_by(f64::total_cmp);

    let n = numbers.len() as f64;
    let sum: f64 = numbers.iter().sum();
    let mean = sum / n;
    let squared: f64 = numbers.iter().map(|x| (x - mean).powi(2)).sum();

    let result = match kind {
        Aggregate::Sum => sum,
        Aggregate::Mean => mean,
        Aggregate::Median => median(&numbers),
        Aggregate::StDev => (squared / n).sqrt(),
        Aggregate::StDevSample => {
            if numbers.len() < 2 {
                return Ok(FieldValue::Null);
            }
            (squared / (n - 1.0)).sqrt()
        }
        Aggregate::Range => numbers[numbers.len() - 1] - numbers[0],
        Aggregate::FirstQuartile => median(lower_half(&numbers)),
        Aggregate::ThirdQuartile => median(upper_half(&numbers)),
        Aggregate::InterQuartileRange => median(upper_half(&numbers)) - median(lower_half(&numbers)),
        _ => return Err(EditError::UnsupportedAggregate(kind.as_str().to_string())),
    };
    Ok(FieldValue::Float(result))
}

fn median(sorted: &[f64]) -> f64 {
    let n = sorted.len();
    if n == 0 {
        return f64::NAN;
    }
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    }
}

// Halves exclude the middle element for odd counts.
fn lower_half(sorted: &[f64]) -> &[f64] {
    if sorted.len() == 1 { sorted } else { &sorted[..sorted.len() / 2] }
}

fn upper_half(sorted: &[f64]) -> &[f64] {
    if sorted.len() == 1 {
        sorted
    } else {
        &sorted[sorted.len().div_ceil(2)..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<FieldValue> {
        vec![4.into(), 2.into(), 3.into(), 2.into(), 5.into(), FieldValue::Null, 8.into()]
    }

    fn float(kind: Aggregate) -> f64 {
        compute(kind, sample(), &AggregateParameters::default())
            .unwrap()
            .to_f64()
            .unwrap()
    }

    #[test]
    fn counts_are_integers() {
        let params = AggregateParameters::default();
        assert_eq!(compute(Aggregate::Count, sample(), &params).unwrap(), FieldValue::Integer(6));
        assert_eq!(compute(Aggregate::CountDistinct, sample(), &params).unwrap(), FieldValue::Integer(5));
        assert_eq!(compute(Aggregate::CountMissing, sample(), &params).unwrap(), FieldValue::Integer(1));
    }

    #[test]
    fn numeric_statistics() {
        assert_eq!(float(Aggregate::Sum), 24.0);
        assert_eq!(float(Aggregate::Mean), 4.0);
        assert_eq!(float(Aggregate::Median), 3.5);
        assert!((float(Aggregate::StDev) - 2.0817).abs() < 1e-4);
        assert!((float(Aggregate::StDevSample) - 2.2803).abs() < 1e-4);
        assert_eq!(float(Aggregate::Range), 6.0);
        assert_eq!(float(Aggregate::FirstQuartile), 2.0);
        assert_eq!(float(Aggregate::ThirdQuartile), 5.0);
        assert_eq!(float(Aggregate::InterQuartileRange), 3.0);
    }

    #[test]
    fn odd_count_quartiles_skip_median() {
        let values: Vec<FieldValue> = [1, 2, 3, 4, 5].into_iter().map(FieldValue::from).collect();
        let params = AggregateParameters::default();
        assert_eq!(compute(Aggregate::FirstQuartile, values.clone(), &params).unwrap(), FieldValue::Float(1.5));
        assert_eq!(compute(Aggregate::ThirdQuartile, values, &params).unwrap(), FieldValue::Float(4.5));
    }

    #[test]
    fn min_max_keep_original_values() {
        let params = AggregateParameters::default();
        assert_eq!(compute(Aggregate::Min, sample(), &params).unwrap(), FieldValue::Integer(2));
        assert_eq!(compute(Aggregate::Max, sample(), &params).unwrap(), FieldValue::Integer(8));
    }

    #[test]
    fn concatenate_and_unsupported() {
        let words: Vec<FieldValue> = ["this", "is", "a", "test"].into_iter().map(FieldValue::from).collect();
        let params = AggregateParameters::default().with_delimiter(" ");
        assert_eq!(
            compute(Aggregate::StringConcatenate, words.clone(), &params).unwrap(),
            FieldValue::from("this is a test")
        );
        assert!(matches!(
            compute(Aggregate::Sum, words, &params),
            Err(EditError::UnsupportedAggregate(_))
        ));
    }
}
