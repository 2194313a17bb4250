//! Value serializers (§4.1).
//!
//! Selection happens once, at [`crate::ClientConfig`] construction, so a
//! `Codec` is a plain sum type rather than a trait object the way the
//! ClickHouse ancestor dispatched row conversion through `FromSql`/`ToSql` —
//! there's no per-call generic here, just one of six fixed strategies
//! chosen up front.

use crate::error::{ClientError, Result};
use crate::tabmap;
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    Binary,
    Json,
    MsgPack,
    Pickle,
    None,
    Table,
}

impl Codec {
    /// Validates that this codec's optional backend is actually compiled in.
    /// Mirrors the source's `ImproperlyConfigured` check at construction
    /// time rather than failing lazily on first use.
    pub fn validate(self) -> Result<Self> {
        if self == Codec::MsgPack && !cfg!(feature = "msgpack") {
            return Err(ClientError::Configuration(
                "msgpack serializer requested but the `msgpack` feature is not enabled"
                    .to_string(),
            ));
        }
        Ok(self)
    }

    pub fn encode(self, value: Value) -> Result<Vec<u8>> {
        match self {
            Codec::Binary | Codec::None => Ok(match value {
                Value::Bytes(b) => b,
                Value::Text(s) => s.into_bytes(),
                Value::Json(serde_json::Value::Null) => Vec::new(),
                Value::Json(other) => {
                    return Err(ClientError::Configuration(format!(
                        "{self:?} codec cannot encode structured value {other}"
                    )))
                }
                Value::Map(_) => {
                    return Err(ClientError::Configuration(format!(
                        "{self:?} codec cannot encode a table map; use Codec::Table"
                    )))
                }
            }),
            Codec::Json => {
                let json = to_json_value(&value)?;
                serde_json::to_vec(&json)
                    .map_err(|e| ClientError::Protocol(format!("json encode: {e}")))
            }
            Codec::MsgPack => encode_msgpack(&value),
            Codec::Pickle => {
                let json = to_json_value(&value)?;
                serde_cbor::to_vec(&json)
                    .map_err(|e| ClientError::Protocol(format!("cbor encode: {e}")))
            }
            Codec::Table => match value {
                Value::Map(map) => Ok(tabmap::serialize_map(map)),
                other => Err(ClientError::Configuration(format!(
                    "table codec requires a Value::Map, got {other:?}"
                ))),
            },
        }
    }

    pub fn decode(self, bytes: Vec<u8>) -> Result<Value> {
        match self {
            Codec::Binary => match String::from_utf8(bytes) {
                Ok(text) => Ok(Value::Text(text)),
                Err(err) => Ok(Value::Bytes(err.into_bytes())),
            },
            Codec::None => Ok(Value::Bytes(bytes)),
            Codec::Json => {
                let json: serde_json::Value = serde_json::from_slice(&bytes)
                    .map_err(|e| ClientError::Protocol(format!("json decode: {e}")))?;
                Ok(Value::Json(json))
            }
            Codec::MsgPack => decode_msgpack(&bytes),
            Codec::Pickle => {
                let json: serde_json::Value = serde_cbor::from_slice(&bytes)
                    .map_err(|e| ClientError::Protocol(format!("cbor decode: {e}")))?;
                Ok(Value::Json(json))
            }
            Codec::Table => {
                let mut map = std::collections::BTreeMap::new();
                for (k, v) in tabmap::deserialize_map(&bytes)? {
                    let k = String::from_utf8(k)
                        .map_err(|e| ClientError::Protocol(format!("table key: {e}")))?;
                    let v = String::from_utf8(v)
                        .map_err(|e| ClientError::Protocol(format!("table value: {e}")))?;
                    map.insert(k, v);
                }
                Ok(Value::Map(map))
            }
        }
    }
}

fn to_json_value(value: &Value) -> Result<serde_json::Value> {
    Ok(match value {
        Value::Json(j) => j.clone(),
        Value::Text(s) => serde_json::Value::String(s.clone()),
        Value::Bytes(b) if b.is_empty() => serde_json::Value::Null,
        Value::Bytes(_) => {
            return Err(ClientError::Configuration(
                "structured codecs require Value::Text or Value::Json, not raw bytes".to_string(),
            ))
        }
        Value::Map(m) => serde_json::to_value(m)
            .map_err(|e| ClientError::Protocol(format!("map to json: {e}")))?,
    })
}

#[cfg(feature = "msgpack")]
fn encode_msgpack(value: &Value) -> Result<Vec<u8>> {
    let json = to_json_value(value)?;
    rmp_serde::to_vec_named(&json).map_err(|e| ClientError::Protocol(format!("msgpack encode: {e}")))
}

#[cfg(not(feature = "msgpack"))]
fn encode_msgpack(_value: &Value) -> Result<Vec<u8>> {
    Err(ClientError::Configuration(
        "msgpack serializer requested but the `msgpack` feature is not enabled".to_string(),
    ))
}

#[cfg(feature = "msgpack")]
fn decode_msgpack(bytes: &[u8]) -> Result<Value> {
    let json: serde_json::Value = rmp_serde::from_slice(bytes)
        .map_err(|e| ClientError::Protocol(format!("msgpack decode: {e}")))?;
    Ok(Value::Json(json))
}

#[cfg(not(feature = "msgpack"))]
fn decode_msgpack(_bytes: &[u8]) -> Result<Value> {
    Err(ClientError::Configuration(
        "msgpack serializer requested but the `msgpack` feature is not enabled".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_roundtrip_text() {
        let encoded = Codec::Binary.encode(Value::Text("hello".into())).unwrap();
        assert_eq!(encoded, b"hello");
        assert_eq!(
            Codec::Binary.decode(encoded).unwrap(),
            Value::Text("hello".into())
        );
    }

    #[test]
    fn binary_decode_falls_back_to_bytes() {
        let raw = vec![0xff, 0xfe, 0x00];
        let decoded = Codec::Binary.decode(raw.clone()).unwrap();
        assert_eq!(decoded, Value::Bytes(raw));
    }

    #[test]
    fn binary_none_value_encodes_empty() {
        let encoded = Codec::Binary
            .encode(Value::Json(serde_json::Value::Null))
            .unwrap();
        assert!(encoded.is_empty());
    }

    #[test]
    fn json_roundtrip() {
        let value = Value::Json(serde_json::json!({"a": 1, "b": [1,2,3]}));
        let encoded = Codec::Json.encode(value.clone()).unwrap();
        assert_eq!(Codec::Json.decode(encoded).unwrap(), value);
    }

    #[test]
    fn table_roundtrip() {
        let mut map = std::collections::BTreeMap::new();
        map.insert("name".to_string(), "huey".to_string());
        map.insert("type".to_string(), "cat".to_string());
        let value = Value::Map(map);
        let encoded = Codec::Table.encode(value.clone()).unwrap();
        assert_eq!(Codec::Table.decode(encoded).unwrap(), value);
    }

    #[cfg(feature = "msgpack")]
    #[test]
    fn msgpack_roundtrip() {
        let value = Value::Json(serde_json::json!({"x": "y"}));
        let encoded = Codec::MsgPack.encode(value.clone()).unwrap();
        assert_eq!(Codec::MsgPack.decode(encoded).unwrap(), value);
    }

    #[test]
    fn pickle_roundtrip() {
        let value = Value::Json(serde_json::json!(["a", "b", 3]));
        let encoded = Codec::Pickle.encode(value.clone()).unwrap();
        assert_eq!(Codec::Pickle.decode(encoded).unwrap(), value);
    }
}
