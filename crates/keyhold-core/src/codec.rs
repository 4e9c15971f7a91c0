#![forbid(unsafe_code)]

//! Value ⇄ string serialization boundary.
//!
//! A [`Codec`] is replaceable as a whole pair: any implementation whose
//! `decode` inverts its `encode` can stand in for the default [`JsonCodec`].
//! Decode failures must come back as [`CodecError`] values, never panics, so
//! the engine can repair a corrupt persisted entry by falling back.

use crate::Value;
use crate::error::CodecError;

/// Serialization capability for stored values.
pub trait Codec {
    /// Turn a value into the string form kept in durable storage.
    fn encode(&self, value: &Value) -> Result<String, CodecError>;

    /// Parse a persisted string back into a value.
    fn decode(&self, raw: &str) -> Result<Value, CodecError>;
}

/// The default codec: compact JSON via `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode(&self, value: &Value) -> Result<String, CodecError> {
        serde_json::to_string(value).map_err(|err| CodecError::Encode {
            detail: err.to_string(),
        })
    }

    fn decode(&self, raw: &str) -> Result<Value, CodecError> {
        serde_json::from_str(raw).map_err(|err| CodecError::Decode {
            detail: err.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn encodes_compact_json() {
        let codec = JsonCodec;
        let encoded = codec.encode(&json!({"a": 1, "b": [true, null]})).unwrap();
        assert_eq!(encoded, r#"{"a":1,"b":[true,null]}"#);
    }

    #[test]
    fn decode_failure_is_an_error_not_a_panic() {
        let codec = JsonCodec;
        let err = codec.decode("{not json").unwrap_err();
        assert!(matches!(err, CodecError::Decode { .. }));
    }

    #[test]
    fn decodes_what_it_encodes() {
        let codec = JsonCodec;
        let value = json!({"nested": {"list": [1, 2, 3], "s": "text"}});
        let round = codec.decode(&codec.encode(&value).unwrap()).unwrap();
        assert_eq!(round, value);
    }

    /// Strategy for arbitrary JSON trees. Numbers are restricted to integers
    /// so equality after a round trip is exact.
    fn json_value() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(|n| Value::Number(n.into())),
            ".*".prop_map(Value::String),
        ];
        leaf.prop_recursive(4, 64, 8, |inner| {
            prop_oneof![
                proptest::collection::vec(inner.clone(), 0..8).prop_map(Value::Array),
                proptest::collection::btree_map(".*", inner, 0..8)
                    .prop_map(|m| Value::Object(m.into_iter().collect())),
            ]
        })
    }

    proptest! {
        #[test]
        fn round_trip(value in json_value()) {
            let codec = JsonCodec;
            let encoded = codec.encode(&value).unwrap();
            let decoded = codec.decode(&encoded).unwrap();
            prop_assert_eq!(decoded, value);
        }
    }
}
