// Copyright 2024-2025 Golem Cloud
//
// Licensed under the Golem Source License v1.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://license.golem.cloud/LICENSE
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The single serializer for every value crossing a process boundary
//! (worker/supervisor, client/state daemon).
//!
//! Primitives pass through as plain JSON; byte buffers, timestamps and error
//! records are wrapped in `{"__type": ...}` markers so that
//! `decode(encode(x))` reconstructs a semantically equal value.

use crate::SafeDisplay;
use crate::model::ErrorCode;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::Error as _;
use serde::ser::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;

/// Maximum nesting depth accepted by both directions. Owned value trees
/// cannot alias, so a reference cycle is unrepresentable; unbounded depth is
/// the form in which one would appear, and it is rejected here.
pub const MAX_DEPTH: usize = 128;

const TYPE_KEY: &str = "__type";
const TYPE_BUFFER: &str = "Buffer";
const TYPE_DATE: &str = "Date";
const TYPE_ERROR: &str = "Error";

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Number(serde_json::Number),
    Text(String),
    Bytes(Vec<u8>),
    Timestamp(DateTime<Utc>),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Error(ErrorRecord),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("value exceeds the maximum nesting depth of {limit}")]
    DepthLimit { limit: usize },
    #[error("number is not finite")]
    NonFiniteNumber,
    #[error("map key {key:?} is reserved")]
    ReservedKey { key: String },
    #[error("unknown {TYPE_KEY} marker: {marker}")]
    UnknownMarker { marker: String },
    #[error("invalid {marker} payload: {reason}")]
    InvalidMarker { marker: String, reason: String },
}

impl CodecError {
    /// Which side of the boundary failed, for the result taxonomy.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            CodecError::DepthLimit { .. }
            | CodecError::NonFiniteNumber
            | CodecError::ReservedKey { .. } => ErrorCode::SerializationError,
            CodecError::UnknownMarker { .. } | CodecError::InvalidMarker { .. } => {
                ErrorCode::DeserializationError
            }
        }
    }
}

impl SafeDisplay for CodecError {
    fn to_safe_string(&self) -> String {
        self.to_string()
    }
}

impl Value {
    pub fn text(value: impl Into<String>) -> Self {
        Value::Text(value.into())
    }

    pub fn bytes(value: impl Into<Vec<u8>>) -> Self {
        Value::Bytes(value.into())
    }

    pub fn int(value: i64) -> Self {
        Value::Number(serde_json::Number::from(value))
    }

    /// Fails on NaN and infinities; the wire format has no representation
    /// for them.
    pub fn float(value: f64) -> Result<Self, CodecError> {
        serde_json::Number::from_f64(value)
            .map(Value::Number)
            .ok_or(CodecError::NonFiniteNumber)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Number(n) => n.as_i64(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => n.as_f64(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::int(value)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(value: DateTime<Utc>) -> Self {
        Value::Timestamp(value)
    }
}

/// Encodes a value into its JSON wire form.
pub fn encode(value: &Value) -> Result<serde_json::Value, CodecError> {
    encode_at(value, 0)
}

fn encode_at(value: &Value, depth: usize) -> Result<serde_json::Value, CodecError> {
    if depth > MAX_DEPTH {
        return Err(CodecError::DepthLimit { limit: MAX_DEPTH });
    }
    match value {
        Value::Null => Ok(serde_json::Value::Null),
        Value::Bool(b) => Ok(serde_json::Value::Bool(*b)),
        Value::Number(n) => Ok(serde_json::Value::Number(n.clone())),
        Value::Text(s) => Ok(serde_json::Value::String(s.clone())),
        Value::Bytes(bytes) => Ok(serde_json::json!({
            TYPE_KEY: TYPE_BUFFER,
            "data": B64.encode(bytes),
        })),
        Value::Timestamp(ts) => Ok(serde_json::json!({
            TYPE_KEY: TYPE_DATE,
            "iso": ts.to_rfc3339_opts(SecondsFormat::AutoSi, true),
        })),
        Value::Error(record) => {
            let mut object = serde_json::Map::new();
            object.insert(
                TYPE_KEY.to_string(),
                serde_json::Value::String(TYPE_ERROR.to_string()),
            );
            object.insert(
                "name".to_string(),
                serde_json::Value::String(record.name.clone()),
            );
            object.insert(
                "message".to_string(),
                serde_json::Value::String(record.message.clone()),
            );
            if let Some(stack) = &record.stack {
                object.insert(
                    "stack".to_string(),
                    serde_json::Value::String(stack.clone()),
                );
            }
            if let Some(code) = &record.code {
                object.insert("code".to_string(), serde_json::Value::String(code.clone()));
            }
            Ok(serde_json::Value::Object(object))
        }
        Value::List(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(encode_at(item, depth + 1)?);
            }
            Ok(serde_json::Value::Array(out))
        }
        Value::Map(entries) => {
            let mut object = serde_json::Map::with_capacity(entries.len());
            for (key, entry) in entries {
                if key == TYPE_KEY {
                    return Err(CodecError::ReservedKey { key: key.clone() });
                }
                object.insert(key.clone(), encode_at(entry, depth + 1)?);
            }
            Ok(serde_json::Value::Object(object))
        }
    }
}

/// Decodes a JSON wire form back into a value, interpreting the `__type`
/// markers produced by [`encode`].
pub fn decode(json: &serde_json::Value) -> Result<Value, CodecError> {
    decode_at(json, 0)
}

fn decode_at(json: &serde_json::Value, depth: usize) -> Result<Value, CodecError> {
    if depth > MAX_DEPTH {
        return Err(CodecError::DepthLimit { limit: MAX_DEPTH });
    }
    match json {
        serde_json::Value::Null => Ok(Value::Null),
        serde_json::Value::Bool(b) => Ok(Value::Bool(*b)),
        serde_json::Value::Number(n) => {
            if n.as_f64().is_some_and(|f| !f.is_finite()) {
                return Err(CodecError::NonFiniteNumber);
            }
            Ok(Value::Number(n.clone()))
        }
        serde_json::Value::String(s) => Ok(Value::Text(s.clone())),
        serde_json::Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(decode_at(item, depth + 1)?);
            }
            Ok(Value::List(out))
        }
        serde_json::Value::Object(object) => match object.get(TYPE_KEY) {
            None => {
                let mut map = BTreeMap::new();
                for (key, entry) in object {
                    map.insert(key.clone(), decode_at(entry, depth + 1)?);
                }
                Ok(Value::Map(map))
            }
            Some(serde_json::Value::String(marker)) => match marker.as_str() {
                TYPE_BUFFER => {
                    let data = object.get("data").and_then(|d| d.as_str()).ok_or_else(|| {
                        CodecError::InvalidMarker {
                            marker: TYPE_BUFFER.to_string(),
                            reason: "missing data field".to_string(),
                        }
                    })?;
                    let bytes = B64
                        .decode(data)
                        .map_err(|err| CodecError::InvalidMarker {
                            marker: TYPE_BUFFER.to_string(),
                            reason: err.to_string(),
                        })?;
                    Ok(Value::Bytes(bytes))
                }
                TYPE_DATE => {
                    let iso = object.get("iso").and_then(|d| d.as_str()).ok_or_else(|| {
                        CodecError::InvalidMarker {
                            marker: TYPE_DATE.to_string(),
                            reason: "missing iso field".to_string(),
                        }
                    })?;
                    let ts = DateTime::parse_from_rfc3339(iso)
                        .map_err(|err| CodecError::InvalidMarker {
                            marker: TYPE_DATE.to_string(),
                            reason: err.to_string(),
                        })?
                        .with_timezone(&Utc);
                    Ok(Value::Timestamp(ts))
                }
                TYPE_ERROR => {
                    let field = |name: &str| {
                        object
                            .get(name)
                            .and_then(|v| v.as_str())
                            .map(|s| s.to_string())
                    };
                    Ok(Value::Error(ErrorRecord {
                        name: field("name").ok_or_else(|| CodecError::InvalidMarker {
                            marker: TYPE_ERROR.to_string(),
                            reason: "missing name field".to_string(),
                        })?,
                        message: field("message").unwrap_or_default(),
                        stack: field("stack"),
                        code: field("code"),
                    }))
                }
                other => Err(CodecError::UnknownMarker {
                    marker: other.to_string(),
                }),
            },
            Some(_) => Err(CodecError::InvalidMarker {
                marker: TYPE_KEY.to_string(),
                reason: "marker is not a string".to_string(),
            }),
        },
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        encode(self)
            .map_err(S::Error::custom)?
            .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let json = serde_json::Value::deserialize(deserializer)?;
        decode(&json).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use std::time::Instant;

    fn sample() -> Value {
        let mut map = BTreeMap::new();
        map.insert("name".to_string(), Value::text("checkout"));
        map.insert("count".to_string(), Value::int(42));
        map.insert("ratio".to_string(), Value::float(0.25).unwrap());
        map.insert("ok".to_string(), Value::Bool(true));
        map.insert("nothing".to_string(), Value::Null);
        map.insert("payload".to_string(), Value::bytes(vec![0u8, 1, 2, 250]));
        map.insert("at".to_string(), Value::Timestamp(Utc::now()));
        map.insert(
            "failure".to_string(),
            Value::Error(ErrorRecord {
                name: "TypeError".to_string(),
                message: "x is not a function".to_string(),
                stack: Some("at main (index:1:1)".to_string()),
                code: Some("E_TYPE".to_string()),
            }),
        );
        map.insert(
            "items".to_string(),
            Value::List(vec![Value::int(1), Value::text("two")]),
        );
        Value::Map(map)
    }

    #[test]
    fn round_trip_preserves_all_supported_values() {
        let value = sample();
        let encoded = encode(&value).unwrap();
        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn buffers_use_base64_marker() {
        let encoded = encode(&Value::bytes(vec![1u8, 2, 3])).unwrap();
        assert_eq!(encoded["__type"], "Buffer");
        assert_eq!(encoded["data"], "AQID");
    }

    #[test]
    fn timestamps_round_trip_to_the_same_instant() {
        let ts = Utc::now();
        let decoded = decode(&encode(&Value::Timestamp(ts)).unwrap()).unwrap();
        assert_eq!(decoded, Value::Timestamp(ts));
    }

    #[test]
    fn non_finite_floats_are_rejected() {
        assert!(matches!(
            Value::float(f64::NAN),
            Err(CodecError::NonFiniteNumber)
        ));
        assert!(matches!(
            Value::float(f64::INFINITY),
            Err(CodecError::NonFiniteNumber)
        ));
    }

    #[test]
    fn depth_limit_is_enforced() {
        let mut value = Value::Null;
        for _ in 0..(MAX_DEPTH + 2) {
            value = Value::List(vec![value]);
        }
        let err = encode(&value).unwrap_err();
        assert!(matches!(err, CodecError::DepthLimit { .. }));
        assert_eq!(err.error_code(), ErrorCode::SerializationError);
    }

    #[test]
    fn unknown_marker_is_refused() {
        let json = serde_json::json!({"__type": "Map", "entries": []});
        let err = decode(&json).unwrap_err();
        assert!(matches!(err, CodecError::UnknownMarker { .. }));
        assert_eq!(err.error_code(), ErrorCode::DeserializationError);
    }

    #[test]
    fn reserved_key_in_user_map_is_refused() {
        let mut map = BTreeMap::new();
        map.insert("__type".to_string(), Value::text("sneaky"));
        assert!(matches!(
            encode(&Value::Map(map)),
            Err(CodecError::ReservedKey { .. })
        ));
    }

    #[test]
    fn error_fields_survive_including_stack() {
        let record = ErrorRecord {
            name: "RangeError".to_string(),
            message: "out of range".to_string(),
            stack: Some("at f (x:3:7)".to_string()),
            code: None,
        };
        let decoded = decode(&encode(&Value::Error(record.clone())).unwrap()).unwrap();
        assert_eq!(decoded, Value::Error(record));
    }

    #[test]
    fn encodes_ten_thousand_small_objects_quickly() {
        let value = sample();
        let start = Instant::now();
        for _ in 0..10_000 {
            let encoded = encode(&value).unwrap();
            std::hint::black_box(&encoded);
        }
        // Loose bound so a loaded CI machine does not flake.
        assert!(start.elapsed().as_millis() < 1000);
    }
}
