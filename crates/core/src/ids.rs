use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::CoreError;

macro_rules! uuid_id {
    ($name:ident) => {
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), &self.0.to_string()[..8])
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(LayerId);
uuid_id!(SessionId);

/// Identifier of a feature as seen through a layer.
///
/// `Persisted` ids come from the store's own id space. `Temporary` ids are
/// handed out by an editing session for features that have not been committed
/// yet; they are unique within that session only and never reach the store.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum FeatureId {
    Persisted(u64),
    Temporary(u64),
}

impl FeatureId {
    pub fn is_temporary(&self) -> bool {
        matches!(self, FeatureId::Temporary(_))
    }

    pub fn is_persisted(&self) -> bool {
        matches!(self, FeatureId::Persisted(_))
    }

    pub fn as_persisted(&self) -> Option<u64> {
        match self {
            FeatureId::Persisted(n) => Some(*n),
            FeatureId::Temporary(_) => None,
        }
    }

    /// Signed rendering used by expressions (`$id`): temporary ids are negative.
    pub fn to_signed(&self) -> Result<i64, CoreError> {
        match self {
            FeatureId::Persisted(n) => i64::try_from(*n).map_err(|_| CoreError::IdOutOfRange(*n)),
            FeatureId::Temporary(n) => i64::try_from(*n)
                .map(|v| -v)
                .map_err(|_| CoreError::IdOutOfRange(*n)),
        }
    }
}

impl fmt::Debug for FeatureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeatureId::Persisted(n) => write!(f, "fid:{}", n),
            FeatureId::Temporary(n) => write!(f, "tmp:{}", n),
        }
    }
}

impl fmt::Display for FeatureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
