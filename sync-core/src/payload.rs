//! Structural, complexity, and size validation of operation payloads.
//!
//! Payloads are opaque to the engine; this module only checks that they are
//! cheap enough to store and replay, never what they mean.

use serde_json::Value;
use sync_types::OpKind;
use thiserror::Error;

/// Maximum object/array nesting depth for non-full-state payloads.
pub const MAX_PAYLOAD_DEPTH: usize = 20;

/// Maximum total key/element count for non-full-state payloads.
pub const MAX_PAYLOAD_KEYS: usize = 20_000;

/// Default serialized-size ceiling (20 MiB, sized for full backups).
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 20 * 1024 * 1024;

/// Why a payload was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PayloadError {
    /// Payload shape does not match what the operation kind allows.
    #[error("payload shape invalid for {kind}: {reason}")]
    WrongShape {
        /// The operation kind being validated.
        kind: OpKind,
        /// What was wrong.
        reason: &'static str,
    },
    /// Payload nesting or key count exceeds the complexity caps.
    #[error("payload too complex (max depth {MAX_PAYLOAD_DEPTH}, max keys {MAX_PAYLOAD_KEYS})")]
    TooComplex,
    /// Serialized payload exceeds the size ceiling.
    #[error("payload too large: {size} bytes (limit {limit})")]
    TooLarge {
        /// Serialized size in bytes.
        size: usize,
        /// Configured ceiling.
        limit: usize,
    },
}

/// Check that the payload's shape is acceptable for the operation kind.
///
/// Full-state operations accept anything (they carry entire application
/// exports, possibly encrypted). Deletes accept null, an object, or a
/// string. Everything else requires an object or a string (an encrypted
/// blob). Batch payloads that carry an `entities` key must keep it an
/// object, since replay merges it per entity id.
pub fn validate_shape(kind: OpKind, payload: &Value) -> Result<(), PayloadError> {
    if kind.is_full_state() {
        return Ok(());
    }

    match (kind, payload) {
        (OpKind::Delete, Value::Null | Value::Object(_) | Value::String(_)) => Ok(()),
        (OpKind::Delete, _) => Err(PayloadError::WrongShape {
            kind,
            reason: "expected null, object, or string",
        }),
        (OpKind::Batch, Value::Object(map)) => match map.get("entities") {
            None | Some(Value::Object(_)) => Ok(()),
            Some(_) => Err(PayloadError::WrongShape {
                kind,
                reason: "entities key must be an object",
            }),
        },
        (_, Value::Object(_) | Value::String(_)) => Ok(()),
        _ => Err(PayloadError::WrongShape {
            kind,
            reason: "expected object or string",
        }),
    }
}

/// Check nesting depth and total key count for non-full-state payloads.
///
/// Full-state operations are exempt: legitimate exports of a whole
/// application routinely blow past these caps.
pub fn validate_complexity(kind: OpKind, payload: &Value) -> Result<(), PayloadError> {
    if kind.is_full_state() {
        return Ok(());
    }

    let mut total_keys = 0usize;
    if within_limits(payload, 0, &mut total_keys) {
        Ok(())
    } else {
        Err(PayloadError::TooComplex)
    }
}

fn within_limits(value: &Value, depth: usize, total_keys: &mut usize) -> bool {
    if depth > MAX_PAYLOAD_DEPTH {
        return false;
    }
    match value {
        Value::Array(items) => {
            *total_keys += items.len();
            if *total_keys > MAX_PAYLOAD_KEYS {
                return false;
            }
            items.iter().all(|item| within_limits(item, depth + 1, total_keys))
        }
        Value::Object(map) => {
            *total_keys += map.len();
            if *total_keys > MAX_PAYLOAD_KEYS {
                return false;
            }
            map.values().all(|v| within_limits(v, depth + 1, total_keys))
        }
        _ => true,
    }
}

/// Check the serialized size of the payload against a ceiling.
pub fn validate_size(payload: &Value, max_bytes: usize) -> Result<(), PayloadError> {
    let size = serialized_size(payload);
    if size > max_bytes {
        return Err(PayloadError::TooLarge {
            size,
            limit: max_bytes,
        });
    }
    Ok(())
}

/// Serialized JSON length without materializing the string.
pub fn serialized_size(value: &Value) -> usize {
    struct ByteCounter(usize);

    impl std::io::Write for ByteCounter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0 += buf.len();
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    let mut counter = ByteCounter(0);
    // Serializing a Value to a writer cannot fail.
    serde_json::to_writer(&mut counter, value).expect("counting JSON bytes");
    counter.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn full_state_accepts_anything() {
        for payload in [json!(null), json!([1, 2]), json!(42), json!("blob")] {
            assert!(validate_shape(OpKind::SyncImport, &payload).is_ok());
            assert!(validate_shape(OpKind::BackupImport, &payload).is_ok());
            assert!(validate_shape(OpKind::Repair, &payload).is_ok());
        }
    }

    #[test]
    fn delete_accepts_null_object_string() {
        assert!(validate_shape(OpKind::Delete, &json!(null)).is_ok());
        assert!(validate_shape(OpKind::Delete, &json!({})).is_ok());
        assert!(validate_shape(OpKind::Delete, &json!("enc")).is_ok());
        assert!(validate_shape(OpKind::Delete, &json!([1])).is_err());
        assert!(validate_shape(OpKind::Delete, &json!(5)).is_err());
    }

    #[test]
    fn create_requires_object_or_string() {
        assert!(validate_shape(OpKind::Create, &json!({"title": "x"})).is_ok());
        assert!(validate_shape(OpKind::Create, &json!("encrypted")).is_ok());
        assert!(validate_shape(OpKind::Create, &json!(null)).is_err());
        assert!(validate_shape(OpKind::Create, &json!([1, 2])).is_err());
        assert!(validate_shape(OpKind::Create, &json!(true)).is_err());
    }

    #[test]
    fn batch_entities_must_be_object() {
        assert!(validate_shape(OpKind::Batch, &json!({"entities": {"a": {}}})).is_ok());
        assert!(validate_shape(OpKind::Batch, &json!({"other": 1})).is_ok());
        assert!(validate_shape(OpKind::Batch, &json!({"entities": [1]})).is_err());
        assert!(validate_shape(OpKind::Batch, &json!({"entities": "x"})).is_err());
    }

    #[test]
    fn complexity_rejects_deep_nesting() {
        let mut value = json!(1);
        for _ in 0..(MAX_PAYLOAD_DEPTH + 2) {
            value = json!({ "inner": value });
        }
        assert_eq!(
            validate_complexity(OpKind::Update, &value),
            Err(PayloadError::TooComplex)
        );
        // Full-state ops are exempt
        assert!(validate_complexity(OpKind::SyncImport, &value).is_ok());
    }

    #[test]
    fn complexity_accepts_reasonable_payload() {
        let value = json!({"a": {"b": [1, 2, 3]}, "c": "d"});
        assert!(validate_complexity(OpKind::Update, &value).is_ok());
    }

    #[test]
    fn complexity_rejects_too_many_keys() {
        let items: Vec<Value> = (0..(MAX_PAYLOAD_KEYS + 1)).map(|i| json!(i)).collect();
        let value = json!({ "items": items });
        assert_eq!(
            validate_complexity(OpKind::Batch, &value),
            Err(PayloadError::TooComplex)
        );
    }

    #[test]
    fn size_ceiling_enforced() {
        let value = json!({"data": "x".repeat(100)});
        assert!(validate_size(&value, 1024).is_ok());
        assert!(matches!(
            validate_size(&value, 10),
            Err(PayloadError::TooLarge { .. })
        ));
    }

    #[test]
    fn serialized_size_matches_to_string() {
        let value = json!({"a": [1, 2, 3], "b": {"c": "text"}});
        assert_eq!(
            serialized_size(&value),
            serde_json::to_string(&value).unwrap().len()
        );
    }
}
