use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

/// A single attribute value.
///
/// `==` is structural: `Integer(1)` and `Float(1.0)` are different values.
/// Value-level comparisons used by filters, joins and statistics go through
/// [`FieldValue::compare`] and [`FieldValue::sort_cmp`], which promote
/// integers to floats.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FieldValue {
    Null,
    Text(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    /// Days since 1970-01-01.
    Date(i32),
    /// Milliseconds since the Unix epoch.
    DateTime(i64),
    Bytes(Vec<u8>),
}

impl PartialEq for FieldValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Text(a), Self::Text(b)) => a == b,
            (Self::Integer(a), Self::Integer(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a.total_cmp(b).is_eq(),
            (Self::Boolean(a), Self::Boolean(b)) => a == b,
            (Self::Date(a), Self::Date(b)) => a == b,
            (Self::DateTime(a), Self::DateTime(b)) => a == b,
            (Self::Bytes(a), Self::Bytes(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for FieldValue {}

impl Hash for FieldValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Self::Null => {}
            Self::Text(s) => s.hash(state),
            Self::Integer(n) => n.hash(state),
            Self::Float(f) => f.to_bits().hash(state),
            Self::Boolean(b) => b.hash(state),
            Self::Date(d) => d.hash(state),
            Self::DateTime(t) => t.hash(state),
            Self::Bytes(b) => b.hash(state),
        }
    }
}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            FieldValue::Integer(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_boolean(&self) -> Option<bool> {
        match self {
            FieldValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Numeric view of the value, promoting integers.
    pub fn to_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Integer(n) => Some(*n as f64),
            FieldValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, FieldValue::Integer(_) | FieldValue::Float(_))
    }

    /// Compares two values of compatible kinds.
    ///
    /// Integers and floats compare numerically. Null never compares, nor do
    /// values of unrelated kinds.
    pub fn compare(&self, other: &FieldValue) -> Option<Ordering> {
        match (self, other) {
            (Self::Null, _) | (_, Self::Null) => None,
            (Self::Integer(a), Self::Integer(b)) => Some(a.cmp(b)),
            (a, b) if a.is_numeric() && b.is_numeric() => {
                let (a, b) = (a.to_f64()?, b.to_f64()?);
                Some(a.total_cmp(&b))
            }
            (Self::Text(a), Self::Text(b)) => Some(a.cmp(b)),
            (Self::Boolean(a), Self::Boolean(b)) => Some(a.cmp(b)),
            (Self::Date(a), Self::Date(b)) => Some(a.cmp(b)),
            (Self::DateTime(a), Self::DateTime(b)) => Some(a.cmp(b)),
            (Self::Bytes(a), Self::Bytes(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    /// Equality under promotion: `Integer(2)` equals `Float(2.0)`. Null equals nothing.
    pub fn loose_eq(&self, other: &FieldValue) -> bool {
        self.compare(other) == Some(Ordering::Equal)
    }

    /// Total order used when sorting or de-duplicating values: Null first,
    /// then numerics compared by value, then the remaining kinds.
    pub fn sort_cmp(&self, other: &FieldValue) -> Ordering {
        match self.compare(other) {
            Some(ordering) => ordering,
            None => self.kind_rank().cmp(&other.kind_rank()),
        }
    }

    fn kind_rank(&self) -> u8 {
        match self {
            Self::Null => 0,
            Self::Boolean(_) => 1,
            Self::Integer(_) | Self::Float(_) => 2,
            Self::Date(_) => 3,
            Self::DateTime(_) => 4,
            Self::Text(_) => 5,
            Self::Bytes(_) => 6,
        }
    }

    /// Boolean interpretation used by filter expressions.
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::Null => false,
            Self::Boolean(b) => *b,
            Self::Integer(n) => *n != 0,
            Self::Float(f) => *f != 0.0,
            Self::Text(s) => !s.is_empty(),
            Self::Date(_) | Self::DateTime(_) => true,
            Self::Bytes(b) => !b.is_empty(),
        }
    }

    pub fn to_msgpack(&self) -> Result<Vec<u8>, rmp_serde::encode::Error> {
        rmp_serde::to_vec(self)
    }

    pub fn from_msgpack(bytes: &[u8]) -> Result<Self, rmp_serde::decode::Error> {
        rmp_serde::from_slice(bytes)
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "NULL"),
            Self::Text(s) => write!(f, "{}", s),
            Self::Integer(n) => write!(f, "{}", n),
            Self::Float(v) => write!(f, "{}", v),
            Self::Boolean(b) => write!(f, "{}", b),
            Self::Date(d) => write!(f, "date({})", d),
            Self::DateTime(t) => write!(f, "datetime({})", t),
            Self::Bytes(b) => write!(f, "<{} bytes>", b.len()),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Integer(value)
    }
}

impl From<i32> for FieldValue {
    fn from(value: i32) -> Self {
        FieldValue::Integer(value as i64)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Float(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Boolean(value)
    }
}

impl<T: Into<FieldValue>> From<Option<T>> for FieldValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(FieldValue::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structural_equality_is_exact() {
        assert_ne!(FieldValue::Integer(1), FieldValue::Float(1.0));
        assert_eq!(FieldValue::Float(f64::NAN), FieldValue::Float(f64::NAN));
    }

    #[test]
    fn compare_promotes_numbers() {
        assert!(FieldValue::Integer(2).loose_eq(&FieldValue::Float(2.0)));
        assert_eq!(
            FieldValue::Integer(3).compare(&FieldValue::Float(2.5)),
            Some(Ordering::Greater)
        );
        assert_eq!(FieldValue::Null.compare(&FieldValue::Null), None);
        assert_eq!(FieldValue::from("a").compare(&FieldValue::Integer(1)), None);
    }

    #[test]
    fn sort_cmp_is_total() {
        let mut values = vec![
            FieldValue::from("b"),
            FieldValue::Integer(5),
            FieldValue::Null,
            FieldValue::Float(1.5),
            FieldValue::from("a"),
        ];
        values.sort_by(|a, b| a.sort_cmp(b));
        assert_eq!(
            values,
            vec![
                FieldValue::Null,
                FieldValue::Float(1.5),
                FieldValue::Integer(5),
                FieldValue::from("a"),
                FieldValue::from("b"),
            ]
        );
    }

    #[test]
    fn truthiness() {
        assert!(FieldValue::Boolean(true).is_truthy());
        assert!(!FieldValue::Integer(0).is_truthy());
        assert!(FieldValue::Float(0.5).is_truthy());
        assert!(!FieldValue::Null.is_truthy());
        assert!(!FieldValue::from("").is_truthy());
    }

    #[test]
    fn msgpack_preserves_kind() -> Result<(), Box<dyn std::error::Error>> {
        let value = FieldValue::DateTime(1_700_000_000_000);
        let decoded = FieldValue::from_msgpack(&value.to_msgpack()?)?;
        assert_eq!(decoded, value);
        Ok(())
    }
}
