//! Canonical byte encoding of signed payloads.
//!
//! Rules: object keys sorted lexicographically ascending, strings UTF-8 with
//! JSON escaping, decimals as canonical strings (the `Amount` serializer
//! already guarantees this), booleans and nulls spelled literally, no
//! insignificant whitespace. The same payload yields the same bytes on every
//! implementation, which is what the detached signatures are computed over.

use serde::Serialize;
use serde_json::Value;

use crate::error::GeoError;

/// Encode any serializable payload into its canonical bytes.
pub fn canonical_payload<T: Serialize>(payload: &T) -> Result<Vec<u8>, GeoError> {
    let value = serde_json::to_value(payload)
        .map_err(|e| GeoError::Validation(format!("payload is not JSON-serializable: {e}")))?;
    Ok(canonical_bytes(&value))
}

/// Encode a JSON value into its canonical bytes.
pub fn canonical_bytes(value: &Value) -> Vec<u8> {
    let mut out = String::new();
    write_value(&mut out, value);
    out.into_bytes()
}

fn write_value(out: &mut String, value: &Value) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(true) => out.push_str("true"),
        Value::Bool(false) => out.push_str("false"),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => write_string(out, s),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(out, item);
            }
            out.push(']');
        }
        Value::Object(map) => {
            // serde_json map preserves insertion order by default; canonical
            // form requires sorted keys regardless of how the map was built.
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(out, key);
                out.push(':');
                write_value(out, &map[*key]);
            }
            out.push('}');
        }
    }
}

fn write_string(out: &mut String, s: &str) {
    // serde_json's escaping is deterministic, reuse it.
    out.push_str(&serde_json::to_string(s).expect("string serialization is infallible"));
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_keys_are_sorted() {
        let v = json!({"b": 1, "a": 2, "c": {"z": null, "y": true}});
        let bytes = canonical_bytes(&v);
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            r#"{"a":2,"b":1,"c":{"y":true,"z":null}}"#
        );
    }

    #[test]
    fn test_no_insignificant_whitespace() {
        let v = json!({"list": [1, "two", false], "n": null});
        let s = String::from_utf8(canonical_bytes(&v)).unwrap();
        assert_eq!(s, r#"{"list":[1,"two",false],"n":null}"#);
    }

    #[test]
    fn test_key_order_does_not_change_bytes() {
        let a: Value = serde_json::from_str(r#"{"x": "1", "y": "2"}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"y": "2", "x": "1"}"#).unwrap();
        assert_eq!(canonical_bytes(&a), canonical_bytes(&b));
    }

    #[test]
    fn test_string_escaping() {
        let v = json!({"msg": "line\nbreak \"quoted\""});
        let s = String::from_utf8(canonical_bytes(&v)).unwrap();
        assert_eq!(s, r#"{"msg":"line\nbreak \"quoted\""}"#);
    }

    proptest! {
        #[test]
        fn prop_semantically_equal_payloads_encode_identically(
            keys in proptest::collection::btree_set("[a-z]{1,8}", 1..8),
            seed in any::<u64>(),
        ) {
            // Build the same object twice with different insertion orders.
            let entries: Vec<(String, u64)> = keys
                .iter()
                .enumerate()
                .map(|(i, k)| (k.clone(), seed.wrapping_add(i as u64)))
                .collect();

            let mut forward = serde_json::Map::new();
            for (k, n) in &entries {
                forward.insert(k.clone(), json!(n));
            }
            let mut backward = serde_json::Map::new();
            for (k, n) in entries.iter().rev() {
                backward.insert(k.clone(), json!(n));
            }

            prop_assert_eq!(
                canonical_bytes(&Value::Object(forward)),
                canonical_bytes(&Value::Object(backward))
            );
        }

        #[test]
        fn prop_different_values_encode_differently(a in any::<u32>(), b in any::<u32>()) {
            prop_assume!(a != b);
            let va = json!({"v": a});
            let vb = json!({"v": b});
            prop_assert_ne!(canonical_bytes(&va), canonical_bytes(&vb));
        }
    }
}
