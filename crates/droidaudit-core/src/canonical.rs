//! Canonical JSON encoding and the digests computed over it.
//!
//! Canonical form: compact serde_json encoding with every object's keys sorted by
//! byte order, recursively. Arrays keep their order. Strings are not Unicode
//! normalized. A digest is the lowercase hex SHA-256 of the canonical bytes.

use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::error::{AuditError, AuditResult};

pub fn canonical_json(v: &impl Serialize) -> AuditResult<Vec<u8>> {
    let value = serde_json::to_value(v)
        .map_err(|e| AuditError::Internal(format!("canonical json: {e}")))?;
    let sorted = sort_json(value);
    serde_json::to_vec(&sorted).map_err(|e| AuditError::Internal(format!("canonical json: {e}")))
}

pub fn canonical_json_string(v: &impl Serialize) -> AuditResult<String> {
    let bytes = canonical_json(v)?;
    String::from_utf8(bytes).map_err(|e| AuditError::Internal(format!("canonical json: {e}")))
}

pub fn sort_json(v: Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let mut sorted = Map::new();
            for (k, val) in entries {
                sorted.insert(k, sort_json(val));
            }
            Value::Object(sorted)
        }
        Value::Array(arr) => Value::Array(arr.into_iter().map(sort_json).collect()),
        other => other,
    }
}

pub fn sha256_hex(data: &[u8]) -> String {
    let mut h = Sha256::new();
    h.update(data);
    hex::encode(h.finalize())
}

/// Digest of the canonical encoding of `v`.
pub fn digest_hex(v: &impl Serialize) -> AuditResult<String> {
    Ok(sha256_hex(&canonical_json(v)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_json_stable_regardless_of_insertion_order() {
        let a = json!({"z":1,"a":{"y":[3,{"k":1,"b":2}],"c":null},"m":"x"});
        let b = json!({"m":"x","a":{"c":null,"y":[3,{"b":2,"k":1}]},"z":1});
        assert_eq!(canonical_json(&a).unwrap(), canonical_json(&b).unwrap());
        assert_eq!(
            canonical_json_string(&a).unwrap(),
            r#"{"a":{"c":null,"y":[3,{"b":2,"k":1}]},"m":"x","z":1}"#
        );
    }

    #[test]
    fn digest_is_pinned() {
        // sha256 of the two bytes "{}"
        assert_eq!(
            digest_hex(&json!({})).unwrap(),
            "44136fa355b3678a1146ad16f7e8649e94fb4fc21fe77e8310c060f61caaff8a"
        );
    }

    #[test]
    fn array_order_is_significant() {
        assert_ne!(
            digest_hex(&json!([1, 2])).unwrap(),
            digest_hex(&json!([2, 1])).unwrap()
        );
    }
}
