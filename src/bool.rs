//! # Permissive Boolean
//!
//! Field type for response shapes that have historically been encoded by
//! `ubusd`/firmware as `0`/`1`, `"0"`/`"1"`, `true`/`false`,
//! `"true"`/`"false"`, or `null`. A plain `bool` target fails on real
//! devices; this type absorbs the inconsistency.

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A boolean decoded permissively from any of the historical wire shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PermissiveBool(pub bool);

impl PermissiveBool {
    pub fn get(self) -> bool {
        self.0
    }
}

impl From<PermissiveBool> for bool {
    fn from(b: PermissiveBool) -> bool {
        b.0
    }
}

impl From<bool> for PermissiveBool {
    fn from(b: bool) -> PermissiveBool {
        PermissiveBool(b)
    }
}

/// Decode a [`serde_json::Value`] permissively:
///
/// 1. `null` or an empty string decodes to `false`.
/// 2. A JSON bool decodes to itself.
/// 3. A JSON string is trimmed and lowercased; `""`, `"0"`, `"false"`,
///    `"no"`, `"off"` decode to `false`, `"1"`, `"true"`, `"yes"`, `"on"`
///    decode to `true`, anything else is parsed as a number and compared
///    against zero.
/// 4. A JSON number decodes to `value != 0`.
pub fn decode_bool(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => false,
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::String(s) => {
            let s = s.trim().to_lowercase();
            match s.as_str() {
                "" | "0" | "false" | "no" | "off" => false,
                "1" | "true" | "yes" | "on" => true,
                other => other.parse::<f64>().map(|n| n != 0.0).unwrap_or(false),
            }
        }
        serde_json::Value::Number(n) => n.as_f64().map(|v| v != 0.0).unwrap_or(false),
        serde_json::Value::Array(_) | serde_json::Value::Object(_) => false,
    }
}

impl<'de> Deserialize<'de> for PermissiveBool {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = serde_json::Value::deserialize(deserializer)?;
        Ok(PermissiveBool(decode_bool(&value)))
    }
}

impl Serialize for PermissiveBool {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bool(self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn truthy_values() {
        for v in [json!(1), json!("1"), json!(true), json!("true"), json!("yes"), json!("on"), json!("TRUE"), json!(" On ")] {
            assert!(decode_bool(&v), "expected {v:?} to decode true");
        }
    }

    #[test]
    fn falsy_values() {
        for v in [json!(0), json!("0"), json!(false), json!("false"), json!("no"), json!("off"), json!(""), serde_json::Value::Null] {
            assert!(!decode_bool(&v), "expected {v:?} to decode false");
        }
    }

    #[test]
    fn non_zero_numeric_string_is_truthy() {
        assert!(decode_bool(&json!("42")));
        assert!(!decode_bool(&json!("0.0")));
    }

    #[test]
    fn deserializes_from_any_historical_shape() {
        let v: PermissiveBool = serde_json::from_value(json!("yes")).unwrap();
        assert!(v.get());
    }
}
