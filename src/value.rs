//! The value a caller hands to or receives from a codec (§4.1).
//!
//! Unlike the ClickHouse ancestor, there is no static row schema here — the
//! servers this crate targets store opaque byte strings, so `Value` is a
//! small, dynamically-tagged union rather than a `Serialize`/`Deserialize`
//! struct mapping. `table` records (§4.5) get their own `Map` variant since
//! TabMap specifically encodes a map of byte strings, not arbitrary JSON.

use std::collections::BTreeMap;

/// A value flowing through a [`crate::codec::Codec`].
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Raw bytes, passed through unchanged by `binary`/`none`.
    Bytes(Vec<u8>),
    /// Text, UTF-8 encoded by `binary`/`none`/`json`.
    Text(String),
    /// An arbitrary structured value, used by `json`/`msgpack`/`pickle`.
    Json(serde_json::Value),
    /// A flat string-to-string map, used by the `table` codec.
    Map(BTreeMap<String, String>),
}

impl Value {
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn into_bytes(self) -> Option<Vec<u8>> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn into_map(self) -> Option<BTreeMap<String, String>> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }
}

impl From<Vec<u8>> for Value {
    fn from(bytes: Vec<u8>) -> Self {
        Value::Bytes(bytes)
    }
}

impl From<&[u8]> for Value {
    fn from(bytes: &[u8]) -> Self {
        Value::Bytes(bytes.to_vec())
    }
}

impl From<String> for Value {
    fn from(text: String) -> Self {
        Value::Text(text)
    }
}

impl From<&str> for Value {
    fn from(text: &str) -> Self {
        Value::Text(text.to_string())
    }
}

impl From<BTreeMap<String, String>> for Value {
    fn from(map: BTreeMap<String, String>) -> Self {
        Value::Map(map)
    }
}
