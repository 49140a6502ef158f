use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::{Result, ValidationError};

/// Prefix that marks a client-generated identifier.
pub const PROVISIONAL_PREFIX: &str = "temp_";

/// Identity of a task.
///
/// A task created on this device carries a `Provisional` id until the remote
/// authority assigns it a `Confirmed` one. Serialized as a JSON number for
/// confirmed ids and a JSON string for provisional ones.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TaskId {
    Confirmed(i64),
    Provisional(String),
}

impl TaskId {
    pub fn new_provisional() -> Self {
        Self::Provisional(format!("{PROVISIONAL_PREFIX}{}", Uuid::new_v4().simple()))
    }

    pub fn confirmed(id: i64) -> Result<Self> {
        if id <= 0 {
            return Err(ValidationError::NonNumericId(id.to_string()));
        }
        Ok(Self::Confirmed(id))
    }

    pub fn is_provisional(&self) -> bool {
        matches!(self, Self::Provisional(_))
    }

    pub fn as_confirmed(&self) -> Option<i64> {
        match self {
            Self::Confirmed(id) => Some(*id),
            Self::Provisional(_) => None,
        }
    }

    pub fn as_provisional(&self) -> Option<&str> {
        match self {
            Self::Confirmed(_) => None,
            Self::Provisional(id) => Some(id),
        }
    }

    /// String form used as a storage key and in log fields.
    pub fn key(&self) -> String {
        self.to_string()
    }

    /// Parses a raw identifier.
    ///
    /// `temp_`-prefixed strings are provisional, digit strings are normalized
    /// to confirmed ids, anything else is rejected instead of coerced.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if let Some(rest) = raw.strip_prefix(PROVISIONAL_PREFIX) {
            if rest.is_empty() {
                return Err(ValidationError::Malformed {
                    field: "id",
                    reason: "provisional id has no suffix".to_string(),
                });
            }
            return Ok(Self::Provisional(raw.to_string()));
        }
        match raw.parse::<i64>() {
            Ok(id) => Self::confirmed(id),
            Err(_) => Err(ValidationError::NonNumericId(raw.to_string())),
        }
    }

    pub fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Null => Err(ValidationError::MissingField("id")),
            Value::Number(n) => match n.as_i64() {
                Some(id) => Self::confirmed(id),
                None => Err(ValidationError::NonNumericId(n.to_string())),
            },
            Value::String(s) => Self::parse(s),
            other => Err(ValidationError::NonNumericId(other.to_string())),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Self::Confirmed(id) => Value::from(*id),
            Self::Provisional(id) => Value::from(id.as_str()),
        }
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Confirmed(id) => write!(f, "{id}"),
            Self::Provisional(id) => f.write_str(id),
        }
    }
}

impl FromStr for TaskId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for TaskId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Self::Confirmed(id) => serializer.serialize_i64(*id),
            Self::Provisional(id) => serializer.serialize_str(id),
        }
    }
}

impl<'de> Deserialize<'de> for TaskId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::from_value(&value).map_err(D::Error::custom)
    }
}
