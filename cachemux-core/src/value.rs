//! Dynamic value model stored by the cache.
//!
//! [`CacheValue`] can hold everything the serialization pipeline knows how to carry
//! across the adapter boundary without losing its type: dates, regular expressions,
//! errors, sets, maps with arbitrary keys, binary buffers, `undefined`, and the
//! non-finite numbers that plain JSON cannot express.
//!
//! Typed application data crosses into and out of `CacheValue` through serde:
//!
//! ```
//! use cachemux_core::CacheValue;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, PartialEq, Serialize, Deserialize)]
//! struct User {
//!     id: u64,
//!     name: String,
//! }
//!
//! let user = User { id: 7, name: "ada".into() };
//! let value = CacheValue::from_serialize(&user).unwrap();
//! let back: User = value.deserialize_into().unwrap();
//! assert_eq!(user, back);
//! ```

use crate::error::{CacheError, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map as JsonMap, Number, Value as JsonValue};
use std::collections::BTreeMap;

/// A value held by the cache.
#[derive(Debug, Clone)]
pub enum CacheValue {
    /// Absent value that is still distinct from `Null`.
    Undefined,
    Null,
    Bool(bool),
    /// Exact integer.
    Integer(i64),
    /// Floating point number, including NaN and the infinities.
    Number(f64),
    String(String),
    Array(Vec<CacheValue>),
    /// String-keyed object.
    Object(BTreeMap<String, CacheValue>),
    /// Point in time in UTC. Sub-second precision survives the pipeline.
    Date(DateTime<Utc>),
    /// Regular expression source and flags.
    RegExp { source: String, flags: String },
    /// Error name and message.
    Error { name: String, message: String },
    /// Ordered set members.
    Set(Vec<CacheValue>),
    /// Ordered entries with arbitrary keys.
    Map(Vec<(CacheValue, CacheValue)>),
    /// Binary buffer.
    Bytes(Vec<u8>),
}

impl CacheValue {
    /// Converts any serde-serializable value into a `CacheValue`.
    ///
    /// Structs and maps become `Object`, sequences become `Array`.
    pub fn from_serialize<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        let json = serde_json::to_value(value)
            .map_err(|e| CacheError::Serialization(e.to_string()))?;
        Ok(Self::from_json(json))
    }

    /// Converts this value into a serde-deserializable type.
    ///
    /// Dates become RFC 3339 strings, sets become sequences, maps with string keys
    /// become objects (other maps become sequences of pairs), and `Undefined` and
    /// non-finite numbers become `null`.
    pub fn deserialize_into<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.to_plain_json())
            .map_err(|e| CacheError::Deserialization(e.to_string()))
    }

    /// Builds a value from plain JSON, without interpreting type markers.
    pub fn from_json(json: JsonValue) -> Self {
        match json {
            JsonValue::Null => CacheValue::Null,
            JsonValue::Bool(b) => CacheValue::Bool(b),
            JsonValue::Number(n) => number_to_value(&n),
            JsonValue::String(s) => CacheValue::String(s),
            JsonValue::Array(items) => {
                CacheValue::Array(items.into_iter().map(Self::from_json).collect())
            }
            JsonValue::Object(map) => CacheValue::Object(
                map.into_iter()
                    .map(|(k, v)| (k, Self::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Lossy projection onto plain JSON.
    pub fn to_plain_json(&self) -> JsonValue {
        match self {
            CacheValue::Undefined | CacheValue::Null => JsonValue::Null,
            CacheValue::Bool(b) => JsonValue::Bool(*b),
            CacheValue::Integer(i) => JsonValue::Number((*i).into()),
            CacheValue::Number(n) => Number::from_f64(*n)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            CacheValue::String(s) => JsonValue::String(s.clone()),
            CacheValue::Array(items) | CacheValue::Set(items) => {
                JsonValue::Array(items.iter().map(Self::to_plain_json).collect())
            }
            CacheValue::Object(map) => JsonValue::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_plain_json()))
                    .collect(),
            ),
            CacheValue::Date(d) => JsonValue::String(format_date(d)),
            CacheValue::RegExp { source, flags } => {
                JsonValue::String(format!("/{source}/{flags}"))
            }
            CacheValue::Error { name, message } => {
                let mut map = JsonMap::new();
                map.insert("name".into(), JsonValue::String(name.clone()));
                map.insert("message".into(), JsonValue::String(message.clone()));
                JsonValue::Object(map)
            }
            CacheValue::Map(entries) => {
                if entries.iter().all(|(k, _)| matches!(k, CacheValue::String(_))) {
                    JsonValue::Object(
                        entries
                            .iter()
                            .filter_map(|(k, v)| match k {
                                CacheValue::String(k) => Some((k.clone(), v.to_plain_json())),
                                _ => None,
                            })
                            .collect(),
                    )
                } else {
                    JsonValue::Array(
                        entries
                            .iter()
                            .map(|(k, v)| JsonValue::Array(vec![k.to_plain_json(), v.to_plain_json()]))
                            .collect(),
                    )
                }
            }
            CacheValue::Bytes(bytes) => {
                JsonValue::Array(bytes.iter().map(|b| JsonValue::from(*b)).collect())
            }
        }
    }

    /// Returns a short name of the variant, used in logs.
    pub fn type_name(&self) -> &'static str {
        match self {
            CacheValue::Undefined => "undefined",
            CacheValue::Null => "null",
            CacheValue::Bool(_) => "bool",
            CacheValue::Integer(_) => "integer",
            CacheValue::Number(_) => "number",
            CacheValue::String(_) => "string",
            CacheValue::Array(_) => "array",
            CacheValue::Object(_) => "object",
            CacheValue::Date(_) => "date",
            CacheValue::RegExp { .. } => "regexp",
            CacheValue::Error { .. } => "error",
            CacheValue::Set(_) => "set",
            CacheValue::Map(_) => "map",
            CacheValue::Bytes(_) => "bytes",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            CacheValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            CacheValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            CacheValue::Number(n) => Some(*n),
            CacheValue::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }
}

/// Formats a date the way the pipeline stores it, with as many fractional digits
/// as the value needs (none, 3, 6 or 9).
pub(crate) fn format_date(date: &DateTime<Utc>) -> String {
    date.to_rfc3339_opts(chrono::SecondsFormat::AutoSi, true)
}

pub(crate) fn number_to_value(n: &Number) -> CacheValue {
    if let Some(i) = n.as_i64() {
        CacheValue::Integer(i)
    } else {
        CacheValue::Number(n.as_f64().unwrap_or(f64::NAN))
    }
}

// Structural equality where NaN equals NaN, so a round trip through the pipeline
// compares equal to its input.
impl PartialEq for CacheValue {
    fn eq(&self, other: &Self) -> bool {
        use CacheValue::*;
        match (self, other) {
            (Undefined, Undefined) | (Null, Null) => true,
            (Bool(a), Bool(b)) => a == b,
            (Integer(a), Integer(b)) => a == b,
            (Number(a), Number(b)) => a == b || (a.is_nan() && b.is_nan()),
            (String(a), String(b)) => a == b,
            (Array(a), Array(b)) | (Set(a), Set(b)) => a == b,
            (Object(a), Object(b)) => a == b,
            (Date(a), Date(b)) => a == b,
            (
                RegExp { source: s1, flags: f1 },
                RegExp { source: s2, flags: f2 },
            ) => s1 == s2 && f1 == f2,
            (
                Error { name: n1, message: m1 },
                Error { name: n2, message: m2 },
            ) => n1 == n2 && m1 == m2,
            (Map(a), Map(b)) => a == b,
            (Bytes(a), Bytes(b)) => a == b,
            _ => false,
        }
    }
}

impl From<bool> for CacheValue {
    fn from(v: bool) -> Self {
        CacheValue::Bool(v)
    }
}

impl From<i32> for CacheValue {
    fn from(v: i32) -> Self {
        CacheValue::Integer(v.into())
    }
}

impl From<i64> for CacheValue {
    fn from(v: i64) -> Self {
        CacheValue::Integer(v)
    }
}

impl From<u32> for CacheValue {
    fn from(v: u32) -> Self {
        CacheValue::Integer(v.into())
    }
}

impl From<f64> for CacheValue {
    fn from(v: f64) -> Self {
        CacheValue::Number(v)
    }
}

impl From<&str> for CacheValue {
    fn from(v: &str) -> Self {
        CacheValue::String(v.to_string())
    }
}

impl From<String> for CacheValue {
    fn from(v: String) -> Self {
        CacheValue::String(v)
    }
}

impl From<Vec<u8>> for CacheValue {
    fn from(v: Vec<u8>) -> Self {
        CacheValue::Bytes(v)
    }
}

impl From<DateTime<Utc>> for CacheValue {
    fn from(v: DateTime<Utc>) -> Self {
        CacheValue::Date(v)
    }
}

impl<T: Into<CacheValue>> From<Option<T>> for CacheValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(CacheValue::Null)
    }
}

impl From<JsonValue> for CacheValue {
    fn from(v: JsonValue) -> Self {
        CacheValue::from_json(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Profile {
        id: u64,
        tags: Vec<String>,
        score: f64,
    }

    #[test]
    fn test_from_serialize_struct() {
        let profile = Profile {
            id: 42,
            tags: vec!["a".into(), "b".into()],
            score: 0.5,
        };
        let value = CacheValue::from_serialize(&profile).unwrap();
        match &value {
            CacheValue::Object(map) => {
                assert_eq!(map.get("id"), Some(&CacheValue::Integer(42)));
                assert_eq!(map.get("score"), Some(&CacheValue::Number(0.5)));
            }
            other => panic!("expected object, got {other:?}"),
        }
        let back: Profile = value.deserialize_into().unwrap();
        assert_eq!(back, profile);
    }

    #[test]
    fn test_nan_equals_nan() {
        assert_eq!(CacheValue::Number(f64::NAN), CacheValue::Number(f64::NAN));
        assert_ne!(CacheValue::Number(1.0), CacheValue::Integer(1));
        assert_ne!(CacheValue::Undefined, CacheValue::Null);
    }

    #[test]
    fn test_set_and_array_are_distinct() {
        let items = vec![CacheValue::from(1)];
        assert_ne!(CacheValue::Set(items.clone()), CacheValue::Array(items));
    }

    #[test]
    fn test_plain_json_projection() {
        let map = CacheValue::Map(vec![(CacheValue::from("k"), CacheValue::from(1))]);
        assert_eq!(map.to_plain_json(), serde_json::json!({"k": 1}));

        let mixed = CacheValue::Map(vec![(CacheValue::from(1), CacheValue::from("v"))]);
        assert_eq!(mixed.to_plain_json(), serde_json::json!([[1, "v"]]));

        assert_eq!(CacheValue::Number(f64::INFINITY).to_plain_json(), JsonValue::Null);
    }

    #[test]
    fn test_option_conversion() {
        assert_eq!(CacheValue::from(None::<i32>), CacheValue::Null);
        assert_eq!(CacheValue::from(Some("x")), CacheValue::from("x"));
    }
}
