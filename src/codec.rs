//! JSON codec for session documents that embed raw byte sequences.
//!
//! The wire format tags binary data as `{"type":"Buffer","data":[...]}`.
//! Documents written by older deployments may carry the base64 string form
//! (`{"type":"Buffer","data":"<b64>"}`); both decode to the same bytes and
//! every document is canonicalized to the array form before it is stored.

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

const BUFFER_TAG: &str = "Buffer";

/// A byte sequence that round-trips through the tagged JSON form.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WaBuffer(pub Vec<u8>);

impl WaBuffer {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for WaBuffer {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl Serialize for WaBuffer {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        to_buffer_value(&self.0).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for WaBuffer {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        from_buffer_value(&value)
            .map(WaBuffer)
            .ok_or_else(|| D::Error::custom("expected a tagged Buffer object"))
    }
}

/// Encode raw bytes as the canonical tagged object.
pub fn to_buffer_value(bytes: &[u8]) -> Value {
    let mut map = Map::with_capacity(2);
    map.insert("type".to_string(), Value::String(BUFFER_TAG.to_string()));
    map.insert(
        "data".to_string(),
        Value::Array(bytes.iter().map(|b| Value::from(*b)).collect()),
    );
    Value::Object(map)
}

/// Decode a tagged object back into bytes. Accepts both the array form and
/// the base64 string form; returns `None` for anything that is not a tagged
/// buffer.
pub fn from_buffer_value(value: &Value) -> Option<Vec<u8>> {
    let obj = value.as_object()?;
    if obj.get("type")?.as_str()? != BUFFER_TAG {
        return None;
    }
    match obj.get("data")? {
        Value::Array(items) => {
            let mut bytes = Vec::with_capacity(items.len());
            for item in items {
                let n = item.as_u64()?;
                if n > u8::MAX as u64 {
                    return None;
                }
                bytes.push(n as u8);
            }
            Some(bytes)
        }
        Value::String(encoded) => BASE64_STANDARD.decode(encoded).ok(),
        _ => None,
    }
}

/// Walk a document and rewrite every tagged buffer to the canonical array
/// form. Applied on every read so that documents written in either form
/// compare and round-trip identically.
pub fn normalize_buffers(value: Value) -> Value {
    if let Some(bytes) = from_buffer_value(&value) {
        return to_buffer_value(&bytes);
    }
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, normalize_buffers(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(normalize_buffers).collect()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;
    use serde_json::json;

    #[test]
    fn buffer_round_trips_through_tagged_json() {
        let mut rng = rand::thread_rng();
        for len in [0usize, 1, 32, 257, 4096] {
            let mut bytes = vec![0u8; len];
            rng.fill_bytes(&mut bytes);
            let encoded = serde_json::to_value(WaBuffer(bytes.clone())).unwrap();
            let decoded: WaBuffer = serde_json::from_value(encoded).unwrap();
            assert_eq!(decoded.0, bytes);
        }
    }

    #[test]
    fn base64_form_decodes_to_same_bytes() {
        let bytes = b"\x00\x01\xfe\xff binary".to_vec();
        let legacy = json!({
            "type": "Buffer",
            "data": BASE64_STANDARD.encode(&bytes),
        });
        assert_eq!(from_buffer_value(&legacy), Some(bytes.clone()));
        assert_eq!(normalize_buffers(legacy), to_buffer_value(&bytes));
    }

    #[test]
    fn normalize_rewrites_nested_buffers_only() {
        let doc = json!({
            "noiseKey": { "type": "Buffer", "data": BASE64_STANDARD.encode([9u8, 8, 7]) },
            "nested": {
                "list": [{ "type": "Buffer", "data": [1, 2, 3] }, "plain"],
                "registrationId": 4321,
            },
            "notABuffer": { "type": "Other", "data": [1] },
        });
        let normalized = normalize_buffers(doc);
        assert_eq!(normalized["noiseKey"], to_buffer_value(&[9, 8, 7]));
        assert_eq!(normalized["nested"]["list"][0], to_buffer_value(&[1, 2, 3]));
        assert_eq!(normalized["nested"]["list"][1], json!("plain"));
        assert_eq!(normalized["nested"]["registrationId"], json!(4321));
        assert_eq!(normalized["notABuffer"], json!({ "type": "Other", "data": [1] }));
    }

    #[test]
    fn malformed_buffers_are_rejected() {
        assert_eq!(from_buffer_value(&json!({ "type": "Buffer", "data": [256] })), None);
        assert_eq!(from_buffer_value(&json!({ "type": "Buffer" })), None);
        assert_eq!(from_buffer_value(&json!([1, 2, 3])), None);
    }
}
