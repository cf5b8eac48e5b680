//! Inner blobmsg layer: the named, typed value tree carried inside the
//! `data`/`signature` control attributes.

use std::collections::BTreeMap;

use crate::error::ErrorKind;
use crate::value::Value;

use super::{align4, RecordHeader};

const TYPE_UNSPEC: u8 = 0;
const TYPE_ARRAY: u8 = 1;
const TYPE_TABLE: u8 = 2;
const TYPE_STRING: u8 = 3;
const TYPE_INT64: u8 = 4;
const TYPE_INT32: u8 = 5;
const TYPE_INT16: u8 = 6;
const TYPE_INT8: u8 = 7;
const TYPE_DOUBLE: u8 = 8;

#[derive(Debug, Clone, Copy)]
enum Container {
    Array,
    Table,
}

impl Container {
    fn not_extended_error(self) -> ErrorKind {
        match self {
            Container::Array => ErrorKind::ArrayEntryNotExtended,
            Container::Table => ErrorKind::TableEntryNotExtended,
        }
    }
}

/// Encode one named blobmsg entry (header + name field + value), including
/// its own trailing alignment padding.
fn encode_entry(name: &str, value: &Value) -> Vec<u8> {
    let name_bytes = name.as_bytes();
    let mut name_field = Vec::with_capacity(align4(2 + name_bytes.len() + 1));
    name_field.extend_from_slice(&(name_bytes.len() as u16).to_be_bytes());
    name_field.extend_from_slice(name_bytes);
    name_field.push(0);
    name_field.resize(align4(name_field.len()), 0);

    let (type_id, value_bytes) = encode_value_payload(value);
    let length = 4 + name_field.len() + value_bytes.len();
    let header = RecordHeader { extended: true, id: type_id, length: length as u32 }.pack();

    let mut buf = Vec::with_capacity(align4(length));
    buf.extend_from_slice(&header);
    buf.extend_from_slice(&name_field);
    buf.extend_from_slice(&value_bytes);
    buf.resize(align4(buf.len()), 0);
    buf
}

fn encode_value_payload(value: &Value) -> (u8, Vec<u8>) {
    match value {
        Value::Unspec => (TYPE_UNSPEC, Vec::new()),
        Value::Array(items) => (TYPE_ARRAY, encode_array_body(items)),
        Value::Table(map) => (TYPE_TABLE, encode_table_body(map)),
        Value::String(s) => {
            let mut bytes = s.as_bytes().to_vec();
            bytes.push(0);
            (TYPE_STRING, bytes)
        }
        Value::Int64(i) => (TYPE_INT64, i.to_be_bytes().to_vec()),
        Value::Int32(i) => (TYPE_INT32, i.to_be_bytes().to_vec()),
        Value::Int16(i) => (TYPE_INT16, i.to_be_bytes().to_vec()),
        Value::Int8(i) => (TYPE_INT8, vec![*i as u8]),
        Value::Double(d) => (TYPE_DOUBLE, d.to_be_bytes().to_vec()),
    }
}

/// Encode a table's members, in ascending key order (free, since `Value`
/// stores tables in a `BTreeMap`), back-to-back with each member's own
/// trailing padding intact. This is exactly the "body of a blobmsg table"
/// the socket transport's `data` attribute carries.
pub fn encode_table_body(map: &BTreeMap<String, Value>) -> Vec<u8> {
    let mut body = Vec::new();
    for (k, v) in map {
        body.extend(encode_entry(k, v));
    }
    body
}

pub fn encode_array_body(items: &[Value]) -> Vec<u8> {
    let mut body = Vec::new();
    for item in items {
        body.extend(encode_entry("", item));
    }
    body
}

pub fn decode_table_body(buf: &[u8]) -> Result<BTreeMap<String, Value>, ErrorKind> {
    Ok(decode_container(buf, Container::Table)?.into_iter().collect())
}

pub fn decode_array_body(buf: &[u8]) -> Result<Vec<Value>, ErrorKind> {
    Ok(decode_container(buf, Container::Array)?.into_iter().map(|(_, v)| v).collect())
}

fn skip_leading_zero_words(buf: &[u8]) -> usize {
    let mut offset = 0;
    while offset + 4 <= buf.len() && buf[offset..offset + 4] == [0, 0, 0, 0] {
        offset += 4;
    }
    offset
}

fn decode_container(buf: &[u8], kind: Container) -> Result<Vec<(String, Value)>, ErrorKind> {
    let mut offset = skip_leading_zero_words(buf);
    let mut out = Vec::new();
    while offset < buf.len() {
        if offset + 4 > buf.len() {
            return Err(ErrorKind::InvalidBlobLength);
        }
        let header = RecordHeader::unpack(buf[offset..offset + 4].try_into().unwrap());
        if header.length < 4 {
            return Err(ErrorKind::InvalidBlobLength);
        }
        let end = offset.checked_add(header.length as usize).ok_or(ErrorKind::InvalidBlobLength)?;
        if end > buf.len() {
            return Err(ErrorKind::InvalidBlobLength);
        }
        if !header.extended {
            return Err(kind.not_extended_error());
        }
        let (name, value) = decode_entry_payload(header.id, &buf[offset + 4..end])?;
        out.push((name, value));
        offset += align4(header.length as usize);
    }
    Ok(out)
}

fn decode_entry_payload(type_id: u8, payload: &[u8]) -> Result<(String, Value), ErrorKind> {
    if payload.len() < 3 {
        return Err(ErrorKind::BlobmsgPayloadTooShort);
    }
    let name_len = u16::from_be_bytes([payload[0], payload[1]]) as usize;
    let name_end = 2 + name_len;
    if payload.len() < name_end + 1 {
        return Err(ErrorKind::BlobmsgPayloadTooShort);
    }
    let name = String::from_utf8_lossy(&payload[2..name_end]).into_owned();
    let name_field_len = align4(name_end + 1);
    if payload.len() < name_field_len {
        return Err(ErrorKind::BlobmsgPayloadTooShort);
    }
    let value = decode_value(type_id, &payload[name_field_len..])?;
    Ok((name, value))
}

fn decode_value(type_id: u8, bytes: &[u8]) -> Result<Value, ErrorKind> {
    match type_id {
        TYPE_UNSPEC => Ok(Value::Unspec),
        TYPE_ARRAY => Ok(Value::Array(decode_array_body(bytes)?)),
        TYPE_TABLE => Ok(Value::Table(decode_table_body(bytes)?)),
        TYPE_STRING => {
            if bytes.is_empty() {
                return Err(ErrorKind::BlobmsgPayloadTooShort);
            }
            Ok(Value::String(String::from_utf8_lossy(&bytes[..bytes.len() - 1]).into_owned()))
        }
        TYPE_INT64 => Ok(Value::Int64(i64::from_be_bytes(read_trailing(bytes, 8)?.try_into().unwrap()))),
        TYPE_INT32 => Ok(Value::Int32(i32::from_be_bytes(read_trailing(bytes, 4)?.try_into().unwrap()))),
        TYPE_INT16 => Ok(Value::Int16(i16::from_be_bytes(read_trailing(bytes, 2)?.try_into().unwrap()))),
        TYPE_INT8 => Ok(Value::Int8(read_trailing(bytes, 1)?[0] as i8)),
        TYPE_DOUBLE => Ok(Value::Double(f64::from_be_bytes(read_trailing(bytes, 8)?.try_into().unwrap()))),
        _ => Err(ErrorKind::UnsupportedAttributeType),
    }
}

/// Some firmware pads INT8/INT16/INT32 payloads to 8 bytes. Read the
/// integer from the trailing `width` bytes rather than assuming the
/// natural, unpadded size.
fn read_trailing(bytes: &[u8], width: usize) -> Result<&[u8], ErrorKind> {
    if bytes.len() < width {
        return Err(ErrorKind::BlobmsgPayloadTooShort);
    }
    Ok(&bytes[bytes.len() - width..])
}
