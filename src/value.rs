//! # Wire Value Tree
//!
//! The blobmsg payload cannot be represented by one fixed struct: it is a
//! typed, named tree (scalar / array / table) with 64-bit-wide integer
//! variants. [`Value`] is the tagged-variant type the codec reads and
//! writes; it never leaks into a caller's target type. [`crate::result`]
//! round-trips it through [`serde_json::Value`] so callers keep using plain
//! `#[derive(Deserialize)]` structs.

use std::collections::BTreeMap;

use crate::error::ErrorKind;

/// One node of the blobmsg value tree, tagged by wire type.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// `UNSPEC`: an empty record (also used for `null`).
    Unspec,
    /// `ARRAY`: an ordered, unnamed sequence.
    Array(Vec<Value>),
    /// `TABLE`: a named, key-sorted sequence. `BTreeMap` gives us
    /// ascending key order for free, which is exactly the deterministic
    /// encoding requires.
    Table(BTreeMap<String, Value>),
    /// `STRING`: NUL-terminated on the wire, not here.
    String(String),
    Int64(i64),
    Int32(i32),
    Int16(i16),
    Int8(i8),
    Double(f64),
}

impl Value {
    /// An empty table, the wire shape of a `null`/absent argument object.
    pub fn empty_table() -> Value {
        Value::Table(BTreeMap::new())
    }

    pub fn as_table(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Table(t) => Some(t),
            _ => None,
        }
    }

    pub fn is_empty_container(&self) -> bool {
        match self {
            Value::Unspec => true,
            Value::Table(t) => t.is_empty(),
            Value::Array(a) => a.is_empty(),
            _ => false,
        }
    }

    /// Map a caller-provided JSON tree onto the blobmsg type system,
    /// per "Encoding of caller arguments".
    pub fn from_json(json: &serde_json::Value) -> Result<Value, ErrorKind> {
        Ok(match json {
            serde_json::Value::Null => Value::Unspec,
            serde_json::Value::Bool(b) => Value::Int8(if *b { 1 } else { 0 }),
            serde_json::Value::Number(n) => {
                if let Some(f) = n.as_f64() {
                    if n.is_f64() {
                        Value::Double(f)
                    } else if let Some(i) = n.as_i64() {
                        encode_signed(i)
                    } else if let Some(u) = n.as_u64() {
                        encode_unsigned(u)
                    } else {
                        Value::Double(f)
                    }
                } else {
                    return Err(ErrorKind::UnsupportedAttributeType);
                }
            }
            serde_json::Value::String(s) => Value::String(s.clone()),
            serde_json::Value::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(Value::from_json(item)?);
                }
                Value::Array(out)
            }
            serde_json::Value::Object(map) => {
                let mut out = BTreeMap::new();
                for (k, v) in map {
                    out.insert(k.clone(), Value::from_json(v)?);
                }
                Value::Table(out)
            }
        })
    }

    /// Convert the decoded wire tree back into a JSON value, driving a
    /// caller's `serde::Deserialize` target. Integers that fit `i64` come
    /// back as JSON numbers; there is no boolean wire type, so a
    /// round-tripped `Int8` decodes as a number, not `true`/`false`, use
    /// [`crate::bool::decode_bool`] on the target field instead.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Unspec => serde_json::Value::Null,
            Value::Array(items) => serde_json::Value::Array(items.iter().map(Value::to_json).collect()),
            Value::Table(map) => {
                let mut obj = serde_json::Map::with_capacity(map.len());
                for (k, v) in map {
                    obj.insert(k.clone(), v.to_json());
                }
                serde_json::Value::Object(obj)
            }
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Int64(i) => serde_json::Value::from(*i),
            Value::Int32(i) => serde_json::Value::from(*i),
            Value::Int16(i) => serde_json::Value::from(*i),
            Value::Int8(i) => serde_json::Value::from(*i),
            Value::Double(d) => serde_json::Number::from_f64(*d)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
        }
    }

    /// Merge `other`'s top-level table entries into `self`, per the socket
    /// transport's "accumulate DATA messages" invoke semantics.
    /// Non-table values are replaced wholesale; this only matters for the
    /// socket transport's own merge loop, which always operates on tables.
    pub fn merge_table(&mut self, other: Value) {
        match (self, other) {
            (Value::Table(into), Value::Table(from)) => into.extend(from),
            (slot, other) => *slot = other,
        }
    }
}

fn encode_signed(i: i64) -> Value {
    if i >= i32::MIN as i64 && i <= i32::MAX as i64 {
        Value::Int32(i as i32)
    } else {
        Value::Int64(i)
    }
}

fn encode_unsigned(u: u64) -> Value {
    if u <= i32::MAX as u64 {
        Value::Int32(u as i32)
    } else if u <= i64::MAX as u64 {
        Value::Int64(u as i64)
    } else {
        // Full 64-bit unsigned magnitudes are vanishingly rare on ubus
        // (counters that large don't occur in practice); re-interpret the
        // bit pattern rather than fail the whole encode.
        Value::Int64(u as i64)
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::Unspec
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn null_becomes_unspec() {
        assert_eq!(Value::from_json(&serde_json::Value::Null).unwrap(), Value::Unspec);
    }

    #[test]
    fn bool_becomes_int8() {
        assert_eq!(Value::from_json(&json!(true)).unwrap(), Value::Int8(1));
        assert_eq!(Value::from_json(&json!(false)).unwrap(), Value::Int8(0));
    }

    #[test]
    fn small_signed_uses_int32_large_uses_int64() {
        assert_eq!(Value::from_json(&json!(42)).unwrap(), Value::Int32(42));
        assert_eq!(Value::from_json(&json!(-42)).unwrap(), Value::Int32(-42));
        assert_eq!(Value::from_json(&json!(5_000_000_000i64)).unwrap(), Value::Int64(5_000_000_000));
    }

    #[test]
    fn large_unsigned_uses_int64() {
        assert_eq!(Value::from_json(&json!(4_000_000_000u64)).unwrap(), Value::Int64(4_000_000_000));
    }

    #[test]
    fn float_becomes_double() {
        assert_eq!(Value::from_json(&json!(1.5)).unwrap(), Value::Double(1.5));
    }

    #[test]
    fn table_keys_are_sorted_on_the_wire_by_construction() {
        let v = Value::from_json(&json!({"b": 1, "a": 2})).unwrap();
        let table = v.as_table().unwrap();
        let keys: Vec<_> = table.keys().collect();
        assert_eq!(keys, vec!["a", "b"]);
    }

    #[test]
    fn bool_round_trip_normalises_to_number() {
        let v = Value::from_json(&json!(true)).unwrap();
        assert_eq!(v.to_json(), json!(1));
    }

    #[test]
    fn merge_table_combines_top_level_keys() {
        let mut a = Value::from_json(&json!({"x": 1})).unwrap();
        let b = Value::from_json(&json!({"y": 2})).unwrap();
        a.merge_table(b);
        assert_eq!(a.to_json(), json!({"x": 1, "y": 2}));
    }
}
