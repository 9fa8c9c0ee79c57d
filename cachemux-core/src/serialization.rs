//! # Serialization Pipeline
//!
//! Converts [`CacheValue`]s into bytes that any storage adapter can hold, and back.
//!
//! The pipeline runs in three stages:
//!
//! 1. **Encoding**: the value becomes UTF-8 JSON. Types JSON cannot represent are
//!    written as marker objects `{"__cachemux_type": <tag>, "value": <payload>}`.
//! 2. **Integrity**: a CRC-32 of the encoded bytes is recorded in the metadata.
//! 3. **Compression**: large payloads are compressed when that saves enough space
//!    (see [`crate::compression`]).
//!
//! Deserialization reverses the stages, verifying the checksum before decoding.
//!
//! # Examples
//!
//! ```
//! use cachemux_core::{CacheValue, Serializer};
//!
//! let serializer = Serializer::default();
//! let value = CacheValue::Set(vec![CacheValue::from(1), CacheValue::Number(f64::NAN)]);
//!
//! let payload = serializer.serialize(&value).unwrap();
//! assert!(payload.metadata.checksum.is_some());
//! assert_eq!(serializer.deserialize(&payload).unwrap(), value);
//! ```

use crate::compression::{CompressionAlgorithm, CompressionConfig, Compressor};
use crate::error::{CacheError, Result};
use crate::value::{format_date, number_to_value, CacheValue};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Number, Value as JsonValue};

/// Object key that marks a type-tagged value.
pub const TYPE_MARKER: &str = "__cachemux_type";

const VALUE_FIELD: &str = "value";

/// Pipeline settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerializerConfig {
    pub compression: CompressionConfig,
    /// Record and verify a checksum of the encoded bytes.
    pub checksum: bool,
    /// Largest encoded payload accepted, in bytes.
    pub max_size: Option<usize>,
}

impl Default for SerializerConfig {
    fn default() -> Self {
        Self {
            compression: CompressionConfig::default(),
            checksum: true,
            max_size: None,
        }
    }
}

impl SerializerConfig {
    #[must_use]
    pub fn with_compression(mut self, compression: CompressionConfig) -> Self {
        self.compression = compression;
        self
    }

    #[must_use]
    pub fn with_checksum(mut self, enabled: bool) -> Self {
        self.checksum = enabled;
        self
    }

    #[must_use]
    pub fn with_max_size(mut self, bytes: usize) -> Self {
        self.max_size = Some(bytes);
        self
    }
}

/// Describes how a [`Payload`] was produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadMetadata {
    /// CRC-32 of the encoded (pre-compression) bytes, as 8 hex digits.
    pub checksum: Option<String>,
    pub is_compressed: bool,
    pub algorithm: Option<CompressionAlgorithm>,
    /// Stored size in bytes.
    pub size: usize,
    /// Encoded size before compression.
    pub original_size: usize,
}

/// Encoded value ready for an adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    pub data: Vec<u8>,
    pub metadata: PayloadMetadata,
}

/// Runs values through encoding, checksum, and compression.
#[derive(Debug, Clone, Default)]
pub struct Serializer {
    config: SerializerConfig,
    compressor: Compressor,
}

impl Serializer {
    pub fn new(config: SerializerConfig) -> Self {
        let compressor = Compressor::new(config.compression.clone());
        Self { config, compressor }
    }

    pub fn config(&self) -> &SerializerConfig {
        &self.config
    }

    /// Encodes a value into a storable payload.
    ///
    /// # Errors
    ///
    /// `SERIALIZATION_ERROR` when encoding fails or the encoded size exceeds
    /// `max_size`.
    pub fn serialize(&self, value: &CacheValue) -> Result<Payload> {
        let encoded = encode(value)?;
        if let Some(max) = self.config.max_size {
            if encoded.len() > max {
                return Err(CacheError::Serialization(format!(
                    "encoded value is {} bytes, maximum is {max}",
                    encoded.len()
                )));
            }
        }

        let checksum = self.config.checksum.then(|| checksum(&encoded));
        let compressed = self.compressor.compress_if_needed(encoded);

        Ok(Payload {
            metadata: PayloadMetadata {
                checksum,
                is_compressed: compressed.is_compressed(),
                algorithm: compressed.algorithm,
                size: compressed.data.len(),
                original_size: compressed.original_size,
            },
            data: compressed.data,
        })
    }

    /// Decodes a payload produced by [`serialize`](Self::serialize).
    ///
    /// A payload that carries a checksum is always verified, whatever the local
    /// `checksum` setting.
    ///
    /// # Errors
    ///
    /// `DATA_INTEGRITY_ERROR` on checksum mismatch, `DESERIALIZATION_ERROR` when the
    /// bytes cannot be decompressed or decoded.
    pub fn deserialize(&self, payload: &Payload) -> Result<CacheValue> {
        let meta = &payload.metadata;
        if meta.is_compressed && meta.algorithm.is_none() {
            return Err(CacheError::Deserialization(
                "payload is marked compressed but names no algorithm".into(),
            ));
        }

        let algorithm = if meta.is_compressed { meta.algorithm } else { None };
        let encoded = self
            .compressor
            .decompress_if_needed(&payload.data, algorithm)?;

        if let Some(expected) = &meta.checksum {
            let actual = checksum(&encoded);
            if &actual != expected {
                return Err(CacheError::DataIntegrity {
                    expected: expected.clone(),
                    actual,
                });
            }
        }

        decode(&encoded)
    }
}

/// CRC-32 of `data` as 8 lowercase hex digits.
pub fn checksum(data: &[u8]) -> String {
    format!("{:08x}", crc32fast::hash(data))
}

/// Encodes a value as tagged JSON bytes.
pub fn encode(value: &CacheValue) -> Result<Vec<u8>> {
    serde_json::to_vec(&to_tagged_json(value)).map_err(|e| CacheError::Serialization(e.to_string()))
}

/// Decodes tagged JSON bytes.
pub fn decode(bytes: &[u8]) -> Result<CacheValue> {
    let json: JsonValue =
        serde_json::from_slice(bytes).map_err(|e| CacheError::Deserialization(e.to_string()))?;
    from_tagged_json(json)
}

fn marker(tag: &str, value: JsonValue) -> JsonValue {
    let mut map = JsonMap::with_capacity(2);
    map.insert(TYPE_MARKER.to_string(), JsonValue::String(tag.to_string()));
    map.insert(VALUE_FIELD.to_string(), value);
    JsonValue::Object(map)
}

fn to_tagged_json(value: &CacheValue) -> JsonValue {
    match value {
        CacheValue::Undefined => marker("Undefined", JsonValue::Null),
        CacheValue::Null => JsonValue::Null,
        CacheValue::Bool(b) => JsonValue::Bool(*b),
        CacheValue::Integer(i) => JsonValue::Number((*i).into()),
        CacheValue::Number(n) => match Number::from_f64(*n) {
            Some(num) => JsonValue::Number(num),
            None => {
                let repr = if n.is_nan() {
                    "NaN"
                } else if n.is_sign_positive() {
                    "Infinity"
                } else {
                    "-Infinity"
                };
                marker("Number", JsonValue::String(repr.into()))
            }
        },
        CacheValue::String(s) => JsonValue::String(s.clone()),
        CacheValue::Array(items) => JsonValue::Array(items.iter().map(to_tagged_json).collect()),
        CacheValue::Object(map) => {
            let object: JsonMap<String, JsonValue> = map
                .iter()
                .map(|(k, v)| (k.clone(), to_tagged_json(v)))
                .collect();
            // Wrap objects that would otherwise read back as a marker.
            if map.contains_key(TYPE_MARKER) {
                marker("Object", JsonValue::Object(object))
            } else {
                JsonValue::Object(object)
            }
        }
        CacheValue::Date(d) => marker("Date", JsonValue::String(format_date(d))),
        CacheValue::RegExp { source, flags } => {
            let mut inner = JsonMap::new();
            inner.insert("source".into(), JsonValue::String(source.clone()));
            inner.insert("flags".into(), JsonValue::String(flags.clone()));
            marker("RegExp", JsonValue::Object(inner))
        }
        CacheValue::Error { name, message } => {
            let mut inner = JsonMap::new();
            inner.insert("name".into(), JsonValue::String(name.clone()));
            inner.insert("message".into(), JsonValue::String(message.clone()));
            marker("Error", JsonValue::Object(inner))
        }
        CacheValue::Set(items) => marker(
            "Set",
            JsonValue::Array(items.iter().map(to_tagged_json).collect()),
        ),
        CacheValue::Map(entries) => marker(
            "Map",
            JsonValue::Array(
                entries
                    .iter()
                    .map(|(k, v)| JsonValue::Array(vec![to_tagged_json(k), to_tagged_json(v)]))
                    .collect(),
            ),
        ),
        CacheValue::Bytes(bytes) => marker("Bytes", JsonValue::String(BASE64.encode(bytes))),
    }
}

fn from_tagged_json(json: JsonValue) -> Result<CacheValue> {
    match json {
        JsonValue::Null => Ok(CacheValue::Null),
        JsonValue::Bool(b) => Ok(CacheValue::Bool(b)),
        JsonValue::Number(n) => Ok(number_to_value(&n)),
        JsonValue::String(s) => Ok(CacheValue::String(s)),
        JsonValue::Array(items) => items
            .into_iter()
            .map(from_tagged_json)
            .collect::<Result<Vec<_>>>()
            .map(CacheValue::Array),
        JsonValue::Object(mut map) => match map.remove(TYPE_MARKER) {
            None => decode_object(map),
            Some(JsonValue::String(tag)) => {
                let inner = map.remove(VALUE_FIELD).unwrap_or(JsonValue::Null);
                decode_marker(&tag, inner)
            }
            Some(other) => Err(CacheError::Deserialization(format!(
                "type marker must be a string, got {other}"
            ))),
        },
    }
}

fn decode_object(map: JsonMap<String, JsonValue>) -> Result<CacheValue> {
    map.into_iter()
        .map(|(k, v)| from_tagged_json(v).map(|v| (k, v)))
        .collect::<Result<_>>()
        .map(CacheValue::Object)
}

fn decode_marker(tag: &str, inner: JsonValue) -> Result<CacheValue> {
    match (tag, inner) {
        ("Undefined", _) => Ok(CacheValue::Undefined),
        ("Number", JsonValue::String(repr)) => match repr.as_str() {
            "NaN" => Ok(CacheValue::Number(f64::NAN)),
            "Infinity" => Ok(CacheValue::Number(f64::INFINITY)),
            "-Infinity" => Ok(CacheValue::Number(f64::NEG_INFINITY)),
            other => Err(CacheError::Deserialization(format!(
                "unknown number representation '{other}'"
            ))),
        },
        ("Object", JsonValue::Object(map)) => decode_object(map),
        ("Date", JsonValue::String(s)) => DateTime::parse_from_rfc3339(&s)
            .map(|d| CacheValue::Date(d.with_timezone(&Utc)))
            .map_err(|e| CacheError::Deserialization(format!("invalid date '{s}': {e}"))),
        ("RegExp", JsonValue::Object(map)) => Ok(CacheValue::RegExp {
            source: string_field(&map, "source")?,
            flags: string_field(&map, "flags")?,
        }),
        ("Error", JsonValue::Object(map)) => Ok(CacheValue::Error {
            name: string_field(&map, "name")?,
            message: string_field(&map, "message")?,
        }),
        ("Set", JsonValue::Array(items)) => items
            .into_iter()
            .map(from_tagged_json)
            .collect::<Result<Vec<_>>>()
            .map(CacheValue::Set),
        ("Map", JsonValue::Array(entries)) => entries
            .into_iter()
            .map(|entry| match entry {
                JsonValue::Array(mut pair) if pair.len() == 2 => {
                    let v = pair.pop().unwrap_or(JsonValue::Null);
                    let k = pair.pop().unwrap_or(JsonValue::Null);
                    Ok((from_tagged_json(k)?, from_tagged_json(v)?))
                }
                other => Err(CacheError::Deserialization(format!(
                    "map entry must be a [key, value] pair, got {other}"
                ))),
            })
            .collect::<Result<Vec<_>>>()
            .map(CacheValue::Map),
        ("Bytes", JsonValue::String(s)) => BASE64
            .decode(s.as_bytes())
            .map(CacheValue::Bytes)
            .map_err(|e| CacheError::Deserialization(format!("invalid base64 buffer: {e}"))),
        (tag, inner) => Err(CacheError::Deserialization(format!(
            "unsupported type marker '{tag}' with payload {inner}"
        ))),
    }
}

fn string_field(map: &JsonMap<String, JsonValue>, field: &str) -> Result<String> {
    map.get(field)
        .and_then(JsonValue::as_str)
        .map(str::to_string)
        .ok_or_else(|| CacheError::Deserialization(format!("missing string field '{field}'")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::AlgorithmChoice;
    use crate::ErrorCode;
    use chrono::TimeZone;
    use std::collections::BTreeMap;

    fn round_trip(value: &CacheValue) -> CacheValue {
        let serializer = Serializer::default();
        let payload = serializer.serialize(value).unwrap();
        serializer.deserialize(&payload).unwrap()
    }

    #[test]
    fn test_special_types_survive() {
        let date = Utc.with_ymd_and_hms(2024, 2, 29, 12, 30, 0).unwrap();
        let values = vec![
            CacheValue::Undefined,
            CacheValue::Number(f64::NAN),
            CacheValue::Number(f64::INFINITY),
            CacheValue::Number(f64::NEG_INFINITY),
            CacheValue::Date(date),
            CacheValue::RegExp {
                source: "^a+b$".into(),
                flags: "gi".into(),
            },
            CacheValue::Error {
                name: "TypeError".into(),
                message: "boom".into(),
            },
            CacheValue::Set(vec![CacheValue::from("x"), CacheValue::from(2)]),
            CacheValue::Map(vec![
                (CacheValue::from(1), CacheValue::from("one")),
                (CacheValue::Date(date), CacheValue::Undefined),
            ]),
            CacheValue::Bytes(vec![0, 159, 255, 10]),
        ];
        for value in values {
            assert_eq!(round_trip(&value), value, "{}", value.type_name());
        }
    }

    #[test]
    fn test_sub_millisecond_dates_survive() {
        for nanos in [1_700_000_000_123_456_789, 1_700_000_000_000_000_001, -1_234_567] {
            let value = CacheValue::from(Utc.timestamp_nanos(nanos));
            assert_eq!(round_trip(&value), value, "{nanos}");
        }
    }

    #[test]
    fn test_floats_survive_bit_for_bit() {
        let values = [
            1.0715660391465826e-75,
            0.1 + 0.2,
            f64::MIN_POSITIVE,
            f64::from_bits(1),
            f64::MAX,
            -2.5e-308,
            1e300,
        ];
        for n in values {
            match round_trip(&CacheValue::Number(n)) {
                CacheValue::Number(back) => assert_eq!(back.to_bits(), n.to_bits(), "{n:e}"),
                other => panic!("{n:e} decoded as {other:?}"),
            }
        }
    }

    #[test]
    fn test_nested_structures() {
        let mut inner = BTreeMap::new();
        inner.insert("when".to_string(), CacheValue::Date(Utc.timestamp_millis_opt(1_700_000_000_123).unwrap()));
        inner.insert("missing".to_string(), CacheValue::Undefined);
        let value = CacheValue::Array(vec![
            CacheValue::Object(inner),
            CacheValue::Integer(i64::MIN),
            CacheValue::Number(1.0),
            CacheValue::Null,
        ]);
        assert_eq!(round_trip(&value), value);
    }

    #[test]
    fn test_integer_and_float_stay_distinct() {
        assert_eq!(round_trip(&CacheValue::Number(3.0)), CacheValue::Number(3.0));
        assert_eq!(round_trip(&CacheValue::Integer(3)), CacheValue::Integer(3));
    }

    #[test]
    fn test_object_with_marker_key_is_not_misread() {
        let mut map = BTreeMap::new();
        map.insert(TYPE_MARKER.to_string(), CacheValue::from("Date"));
        map.insert("value".to_string(), CacheValue::from("not a date"));
        let value = CacheValue::Object(map);
        assert_eq!(round_trip(&value), value);
    }

    #[test]
    fn test_large_payload_is_compressed() {
        let serializer = Serializer::default();
        let value = CacheValue::String("abc".repeat(2000));
        let payload = serializer.serialize(&value).unwrap();
        assert!(payload.metadata.is_compressed);
        assert!(payload.metadata.size < payload.metadata.original_size);
        assert_eq!(serializer.deserialize(&payload).unwrap(), value);
    }

    #[test]
    fn test_small_payload_not_compressed() {
        let serializer = Serializer::default();
        let payload = serializer.serialize(&CacheValue::from("tiny")).unwrap();
        assert!(!payload.metadata.is_compressed);
        assert_eq!(payload.metadata.size, payload.metadata.original_size);
    }

    #[test]
    fn test_tampered_payload_fails_integrity() {
        let serializer = Serializer::new(
            SerializerConfig::default().with_compression(CompressionConfig::disabled()),
        );
        let mut payload = serializer.serialize(&CacheValue::from("hello")).unwrap();
        let last = payload.data.len() - 2;
        payload.data[last] = b'j';
        let err = serializer.deserialize(&payload).unwrap_err();
        assert_eq!(err.code(), ErrorCode::DataIntegrityError);
    }

    #[test]
    fn test_tampered_compressed_payload_fails() {
        let serializer = Serializer::new(SerializerConfig::default().with_compression(
            CompressionConfig::default().with_algorithm(AlgorithmChoice::Gzip),
        ));
        let mut payload = serializer
            .serialize(&CacheValue::String("z".repeat(5000)))
            .unwrap();
        assert!(payload.metadata.is_compressed);
        payload.metadata.checksum = Some("00000000".into());
        let err = serializer.deserialize(&payload).unwrap_err();
        assert_eq!(err.code(), ErrorCode::DataIntegrityError);
    }

    #[test]
    fn test_checksum_disabled() {
        let serializer = Serializer::new(SerializerConfig::default().with_checksum(false));
        let payload = serializer.serialize(&CacheValue::from(1)).unwrap();
        assert!(payload.metadata.checksum.is_none());
    }

    #[test]
    fn test_max_size_rejects() {
        let serializer = Serializer::new(SerializerConfig::default().with_max_size(8));
        let err = serializer
            .serialize(&CacheValue::from("longer than eight bytes"))
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::SerializationError);
    }

    #[test]
    fn test_unknown_marker_is_rejected() {
        let err = decode(br#"{"__cachemux_type":"Symbol","value":"x"}"#).unwrap_err();
        assert_eq!(err.code(), ErrorCode::DeserializationError);
    }

    #[test]
    fn test_plain_json_decodes() {
        let value = decode(br#"{"a":[1,2.5,"x",null,true]}"#).unwrap();
        let expected = CacheValue::from_json(serde_json::json!({"a": [1, 2.5, "x", null, true]}));
        assert_eq!(value, expected);
    }
}
