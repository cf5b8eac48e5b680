//! Outer blob-attribute layer: the ubus message header, the raw control
//! attributes (objid, method, status, objpath, objtype, signature, data),
//! and the framing that ties them together.

use std::collections::BTreeMap;

use crate::error::ErrorKind;

use super::{align4, RecordHeader};

pub const ATTR_STATUS: u8 = 1;
pub const ATTR_OBJPATH: u8 = 2;
pub const ATTR_OBJID: u8 = 3;
pub const ATTR_METHOD: u8 = 4;
pub const ATTR_OBJTYPE: u8 = 5;
pub const ATTR_SIGNATURE: u8 = 6;
pub const ATTR_DATA: u8 = 7;

pub const MSG_HELLO: u8 = 0;
pub const MSG_STATUS: u8 = 1;
pub const MSG_DATA: u8 = 2;
pub const MSG_LOOKUP: u8 = 4;
pub const MSG_INVOKE: u8 = 5;

/// The 8-byte message header that precedes every ubus unit on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgHeader {
    pub version: u8,
    pub msg_type: u8,
    pub seq: u16,
    pub peer: u32,
}

impl MsgHeader {
    pub const LEN: usize = 8;

    pub fn to_bytes(self) -> [u8; 8] {
        let mut buf = [0u8; 8];
        buf[0] = self.version;
        buf[1] = self.msg_type;
        buf[2..4].copy_from_slice(&self.seq.to_be_bytes());
        buf[4..8].copy_from_slice(&self.peer.to_be_bytes());
        buf
    }

    pub fn from_bytes(buf: [u8; 8]) -> Self {
        Self {
            version: buf[0],
            msg_type: buf[1],
            seq: u16::from_be_bytes([buf[2], buf[3]]),
            peer: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
        }
    }
}

/// The control-attribute table carried by every ubus message body.
#[derive(Debug, Clone, Default)]
pub struct RawAttrs(BTreeMap<u8, Vec<u8>>);

impl RawAttrs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_u32(&mut self, id: u8, value: u32) {
        self.0.insert(id, value.to_be_bytes().to_vec());
    }

    pub fn insert_cstr(&mut self, id: u8, value: &str) {
        let mut bytes = value.as_bytes().to_vec();
        bytes.push(0);
        self.0.insert(id, bytes);
    }

    pub fn insert_raw(&mut self, id: u8, bytes: Vec<u8>) {
        self.0.insert(id, bytes);
    }

    pub fn get_u32(&self, id: u8) -> Option<u32> {
        let bytes = self.0.get(&id)?;
        if bytes.len() < 4 {
            return None;
        }
        Some(u32::from_be_bytes(bytes[bytes.len() - 4..].try_into().unwrap()))
    }

    pub fn get_cstr(&self, id: u8) -> Option<String> {
        let bytes = self.0.get(&id)?;
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        Some(String::from_utf8_lossy(&bytes[..end]).into_owned())
    }

    pub fn get_raw(&self, id: u8) -> Option<&[u8]> {
        self.0.get(&id).map(|v| v.as_slice())
    }

    pub fn contains(&self, id: u8) -> bool {
        self.0.contains_key(&id)
    }
}

fn encode_raw_attr(id: u8, payload: &[u8]) -> Vec<u8> {
    let length = 4 + payload.len() as u32;
    let header = RecordHeader { extended: false, id, length }.pack();
    let mut buf = Vec::with_capacity(align4(length as usize));
    buf.extend_from_slice(&header);
    buf.extend_from_slice(payload);
    buf.resize(align4(buf.len()), 0);
    buf
}

fn decode_raw_attrs(buf: &[u8]) -> Result<RawAttrs, ErrorKind> {
    let mut attrs = RawAttrs::new();
    let mut offset = 0usize;
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
        attrs.0.insert(header.id, buf[offset + 4..end].to_vec());
        offset += align4(header.length as usize);
    }
    Ok(attrs)
}

/// Encode a full ubus message: 8-byte header plus one outer blob attribute
/// record wrapping the concatenated child attributes.
pub fn encode_message(header: MsgHeader, attrs: &RawAttrs) -> Vec<u8> {
    let mut children = Vec::new();
    for (id, payload) in &attrs.0 {
        children.extend(encode_raw_attr(*id, payload));
    }
    let outer = encode_raw_attr(0, &children);
    let mut out = Vec::with_capacity(MsgHeader::LEN + outer.len());
    out.extend_from_slice(&header.to_bytes());
    out.extend(outer);
    out
}

/// The number of additional bytes a reader must pull off the wire once it
/// has seen the first 4 bytes of the outer attribute record (i.e. the
/// record's total padded length minus the 4 header bytes already read).
pub fn outer_record_remaining_len(first_four: [u8; 4]) -> Result<usize, ErrorKind> {
    let header = RecordHeader::unpack(first_four);
    if header.length < 4 {
        return Err(ErrorKind::InvalidBlobLength);
    }
    Ok(align4(header.length as usize) - 4)
}

/// Decode a message body: `buf` is the outer record's header (4 bytes)
/// followed by its payload (children + optional padding), i.e. everything
/// read after the 8-byte [`MsgHeader`].
pub fn decode_message_body(buf: &[u8]) -> Result<RawAttrs, ErrorKind> {
    if buf.len() < 4 {
        return Err(ErrorKind::InvalidBlobLength);
    }
    let header = RecordHeader::unpack(buf[0..4].try_into().unwrap());
    if header.length < 4 {
        return Err(ErrorKind::InvalidBlobLength);
    }
    let end = header.length as usize;
    if end > buf.len() {
        return Err(ErrorKind::InvalidBlobLength);
    }
    decode_raw_attrs(&buf[4..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn msg_header_round_trips() {
        let h = MsgHeader { version: 0, msg_type: MSG_HELLO, seq: 7, peer: 99 };
        assert_eq!(MsgHeader::from_bytes(h.to_bytes()), h);
    }

    #[test]
    fn message_with_objid_and_method_round_trips() {
        let mut attrs = RawAttrs::new();
        attrs.insert_u32(ATTR_OBJID, 0x1234);
        attrs.insert_cstr(ATTR_METHOD, "info");

        let header = MsgHeader { version: 0, msg_type: MSG_INVOKE, seq: 1, peer: 1 };
        let wire = encode_message(header, &attrs);

        let got_header = MsgHeader::from_bytes(wire[0..8].try_into().unwrap());
        assert_eq!(got_header, header);

        let decoded = decode_message_body(&wire[8..]).unwrap();
        assert_eq!(decoded.get_u32(ATTR_OBJID), Some(0x1234));
        assert_eq!(decoded.get_cstr(ATTR_METHOD).as_deref(), Some("info"));
    }

    #[test]
    fn short_record_is_rejected() {
        let bytes = RecordHeader { extended: false, id: 1, length: 3 }.pack();
        assert_eq!(decode_raw_attrs(&bytes).unwrap_err(), ErrorKind::InvalidBlobLength);
    }

    #[test]
    fn record_longer_than_buffer_is_rejected() {
        let bytes = RecordHeader { extended: false, id: 1, length: 100 }.pack();
        assert_eq!(decode_raw_attrs(&bytes).unwrap_err(), ErrorKind::InvalidBlobLength);
    }
}
