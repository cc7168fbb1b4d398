//! ubus wire format
//!
//! ubusd speaks a binary protocol on its unix socket. Every message is an
//! 8-byte header followed by one root blob attribute:
//!
//! ```text
//! +---------+------+---------+----------+-------------------------+
//! | version | type | seq     | peer     | root blob (id 0)        |
//! | u8      | u8   | u16 BE  | u32 BE   | u32 BE id/len + attrs   |
//! +---------+------+---------+----------+-------------------------+
//! ```
//!
//! A blob attribute header packs an extended flag (bit 31), a 7-bit id and
//! a 24-bit length that includes the header itself. Attributes are padded
//! to 4 bytes. Message-level attributes ([`UbusAttr`]) are plain blobs;
//! call arguments and replies travel as blobmsg tables, which are extended
//! blobs named by a length-prefixed string and typed by their id. This
//! module maps blobmsg tables to and from JSON objects.

use std::fmt;

use bytes::{BufMut, BytesMut};
use serde_json::{Map, Number, Value};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtocolError;

/// Size of the message header in bytes
pub const UBUS_HEADER_SIZE: usize = 8;

/// Largest message ubusd accepts (1 MiB)
pub const UBUS_MAX_MSGLEN: usize = 1024 * 1024;

/// Protocol version carried in every header
const UBUS_VERSION: u8 = 0;

const BLOB_HEADER_SIZE: usize = 4;
const BLOB_ATTR_EXTENDED: u32 = 0x8000_0000;
const BLOB_ID_SHIFT: u32 = 24;
const BLOB_ID_MASK: u32 = 0x7f;
const BLOB_LEN_MASK: u32 = 0x00ff_ffff;

// Message attribute ids
const ATTR_STATUS: u8 = 1;
const ATTR_OBJPATH: u8 = 2;
const ATTR_OBJID: u8 = 3;
const ATTR_METHOD: u8 = 4;
const ATTR_OBJTYPE: u8 = 5;
const ATTR_DATA: u8 = 7;
const ATTR_NO_REPLY: u8 = 10;

// blobmsg value types
const BLOBMSG_UNSPEC: u8 = 0;
const BLOBMSG_ARRAY: u8 = 1;
const BLOBMSG_TABLE: u8 = 2;
const BLOBMSG_STRING: u8 = 3;
const BLOBMSG_INT64: u8 = 4;
const BLOBMSG_INT32: u8 = 5;
const BLOBMSG_INT16: u8 = 6;
const BLOBMSG_BOOL: u8 = 7;
const BLOBMSG_DOUBLE: u8 = 8;

fn malformed(reason: impl Into<String>) -> ProtocolError {
    ProtocolError::MalformedUbus(reason.into())
}

fn pad(len: usize) -> usize {
    (len + 3) & !3
}

/// Message types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum UbusMsgType {
    Hello = 0,
    Status = 1,
    Data = 2,
    Ping = 3,
    Lookup = 4,
    Invoke = 5,
    AddObject = 6,
    RemoveObject = 7,
    Subscribe = 8,
    Unsubscribe = 9,
    Notify = 10,
    Monitor = 11,
}

impl TryFrom<u8> for UbusMsgType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Self::Hello,
            1 => Self::Status,
            2 => Self::Data,
            3 => Self::Ping,
            4 => Self::Lookup,
            5 => Self::Invoke,
            6 => Self::AddObject,
            7 => Self::RemoveObject,
            8 => Self::Subscribe,
            9 => Self::Unsubscribe,
            10 => Self::Notify,
            11 => Self::Monitor,
            other => return Err(malformed(format!("unknown message type {}", other))),
        })
    }
}

/// Status code closing every request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UbusStatus {
    Ok,
    InvalidCommand,
    InvalidArgument,
    MethodNotFound,
    NotFound,
    NoData,
    PermissionDenied,
    Timeout,
    NotSupported,
    UnknownError,
    ConnectionFailed,
    Other(i32),
}

impl UbusStatus {
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => Self::Ok,
            1 => Self::InvalidCommand,
            2 => Self::InvalidArgument,
            3 => Self::MethodNotFound,
            4 => Self::NotFound,
            5 => Self::NoData,
            6 => Self::PermissionDenied,
            7 => Self::Timeout,
            8 => Self::NotSupported,
            9 => Self::UnknownError,
            10 => Self::ConnectionFailed,
            other => Self::Other(other),
        }
    }

    pub fn code(self) -> i32 {
        match self {
            Self::Ok => 0,
            Self::InvalidCommand => 1,
            Self::InvalidArgument => 2,
            Self::MethodNotFound => 3,
            Self::NotFound => 4,
            Self::NoData => 5,
            Self::PermissionDenied => 6,
            Self::Timeout => 7,
            Self::NotSupported => 8,
            Self::UnknownError => 9,
            Self::ConnectionFailed => 10,
            Self::Other(code) => code,
        }
    }
}

impl fmt::Display for UbusStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => f.write_str("Success"),
            Self::InvalidCommand => f.write_str("Invalid command"),
            Self::InvalidArgument => f.write_str("Invalid argument"),
            Self::MethodNotFound => f.write_str("Method not found"),
            Self::NotFound => f.write_str("Not found"),
            Self::NoData => f.write_str("No response"),
            Self::PermissionDenied => f.write_str("Permission denied"),
            Self::Timeout => f.write_str("Request timed out"),
            Self::NotSupported => f.write_str("Operation not supported"),
            Self::UnknownError => f.write_str("Unknown error"),
            Self::ConnectionFailed => f.write_str("Connection failed"),
            Self::Other(code) => write!(f, "Status {}", code),
        }
    }
}

/// Message-level attribute
#[derive(Debug, Clone, PartialEq)]
pub enum UbusAttr {
    Status(UbusStatus),
    ObjPath(String),
    ObjId(u32),
    Method(String),
    ObjType(u32),
    /// blobmsg table of call arguments, replies and event payloads
    Data(Map<String, Value>),
    NoReply(bool),
    /// Attribute this client does not interpret
    Other { id: u8, payload: Vec<u8> },
}

impl UbusAttr {
    fn encode(&self, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        match self {
            Self::Status(status) => put_blob(dst, ATTR_STATUS, false, &status.code().to_be_bytes()),
            Self::ObjPath(path) => put_blob(dst, ATTR_OBJPATH, false, &c_string(path)),
            Self::ObjId(id) => put_blob(dst, ATTR_OBJID, false, &id.to_be_bytes()),
            Self::Method(method) => put_blob(dst, ATTR_METHOD, false, &c_string(method)),
            Self::ObjType(id) => put_blob(dst, ATTR_OBJTYPE, false, &id.to_be_bytes()),
            Self::Data(table) => {
                let mut payload = BytesMut::new();
                for (name, value) in table {
                    put_field(&mut payload, name, value)?;
                }
                put_blob(dst, ATTR_DATA, false, &payload);
            }
            Self::NoReply(no_reply) => put_blob(dst, ATTR_NO_REPLY, false, &[u8::from(*no_reply)]),
            Self::Other { id, payload } => put_blob(dst, *id, false, payload),
        }
        Ok(())
    }

    fn decode(id: u8, payload: &[u8]) -> Result<Self, ProtocolError> {
        Ok(match id {
            ATTR_STATUS => Self::Status(UbusStatus::from_code(be_i32(payload)?)),
            ATTR_OBJPATH => Self::ObjPath(read_c_string(payload)?),
            ATTR_OBJID => Self::ObjId(be_i32(payload)? as u32),
            ATTR_METHOD => Self::Method(read_c_string(payload)?),
            ATTR_OBJTYPE => Self::ObjType(be_i32(payload)? as u32),
            ATTR_DATA => Self::Data(decode_table(payload)?),
            ATTR_NO_REPLY => Self::NoReply(payload.first().is_some_and(|b| *b != 0)),
            id => Self::Other {
                id,
                payload: payload.to_vec(),
            },
        })
    }
}

/// One ubus message
#[derive(Debug, Clone, PartialEq)]
pub struct UbusMessage {
    pub msg_type: UbusMsgType,
    pub seq: u16,
    pub peer: u32,
    pub attrs: Vec<UbusAttr>,
}

impl UbusMessage {
    pub fn new(msg_type: UbusMsgType, seq: u16, peer: u32) -> Self {
        Self {
            msg_type,
            seq,
            peer,
            attrs: Vec::new(),
        }
    }

    pub fn with(mut self, attr: UbusAttr) -> Self {
        self.attrs.push(attr);
        self
    }

    pub fn status(&self) -> Option<UbusStatus> {
        self.attrs.iter().find_map(|a| match a {
            UbusAttr::Status(status) => Some(*status),
            _ => None,
        })
    }

    pub fn obj_id(&self) -> Option<u32> {
        self.attrs.iter().find_map(|a| match a {
            UbusAttr::ObjId(id) => Some(*id),
            _ => None,
        })
    }

    pub fn method(&self) -> Option<&str> {
        self.attrs.iter().find_map(|a| match a {
            UbusAttr::Method(method) => Some(method.as_str()),
            _ => None,
        })
    }

    pub fn data(&self) -> Option<&Map<String, Value>> {
        self.attrs.iter().find_map(|a| match a {
            UbusAttr::Data(table) => Some(table),
            _ => None,
        })
    }

    pub fn no_reply(&self) -> bool {
        self.attrs
            .iter()
            .any(|a| matches!(a, UbusAttr::NoReply(true)))
    }
}

fn c_string(s: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(s.len() + 1);
    bytes.extend_from_slice(s.as_bytes());
    bytes.push(0);
    bytes
}

fn read_c_string(payload: &[u8]) -> Result<String, ProtocolError> {
    let end = payload.iter().position(|b| *b == 0).unwrap_or(payload.len());
    String::from_utf8(payload[..end].to_vec()).map_err(|_| malformed("string is not UTF-8"))
}

fn be_bytes<const N: usize>(payload: &[u8]) -> Result<[u8; N], ProtocolError> {
    payload
        .get(..N)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| malformed(format!("expected {} byte integer", N)))
}

fn be_i32(payload: &[u8]) -> Result<i32, ProtocolError> {
    Ok(i32::from_be_bytes(be_bytes(payload)?))
}

fn put_blob(dst: &mut BytesMut, id: u8, extended: bool, payload: &[u8]) {
    let len = BLOB_HEADER_SIZE + payload.len();
    let mut id_len = ((u32::from(id) & BLOB_ID_MASK) << BLOB_ID_SHIFT) | (len as u32 & BLOB_LEN_MASK);
    if extended {
        id_len |= BLOB_ATTR_EXTENDED;
    }
    dst.put_u32(id_len);
    dst.extend_from_slice(payload);
    dst.put_bytes(0, pad(len) - len);
}

struct RawBlob<'a> {
    id: u8,
    extended: bool,
    payload: &'a [u8],
}

/// Split a buffer of consecutive padded attributes
fn blobs(mut buf: &[u8]) -> Result<Vec<RawBlob<'_>>, ProtocolError> {
    let mut out = Vec::new();
    while !buf.is_empty() {
        let id_len = u32::from_be_bytes(
            be_bytes(buf).map_err(|_| malformed("truncated attribute header"))?,
        );
        let len = (id_len & BLOB_LEN_MASK) as usize;
        if len < BLOB_HEADER_SIZE || len > buf.len() {
            return Err(malformed(format!(
                "attribute length {} out of bounds ({} left)",
                len,
                buf.len()
            )));
        }
        out.push(RawBlob {
            id: ((id_len >> BLOB_ID_SHIFT) & BLOB_ID_MASK) as u8,
            extended: id_len & BLOB_ATTR_EXTENDED != 0,
            payload: &buf[BLOB_HEADER_SIZE..len],
        });
        buf = &buf[pad(len).min(buf.len())..];
    }
    Ok(out)
}

/// Append one named blobmsg field
fn put_field(dst: &mut BytesMut, name: &str, value: &Value) -> Result<(), ProtocolError> {
    let name_len = u16::try_from(name.len())
        .map_err(|_| malformed(format!("field name of {} bytes", name.len())))?;
    let mut payload = BytesMut::new();
    payload.put_u16(name_len);
    payload.extend_from_slice(name.as_bytes());
    payload.put_u8(0);
    let header = 2 + name.len() + 1;
    payload.put_bytes(0, pad(header) - header);

    let kind = match value {
        Value::Null => BLOBMSG_UNSPEC,
        Value::Bool(b) => {
            payload.put_u8(u8::from(*b));
            BLOBMSG_BOOL
        }
        Value::Number(n) => match n.as_i64() {
            Some(i) => match i32::try_from(i) {
                Ok(i) => {
                    payload.put_i32(i);
                    BLOBMSG_INT32
                }
                Err(_) => {
                    payload.put_i64(i);
                    BLOBMSG_INT64
                }
            },
            None => {
                payload.put_f64(n.as_f64().unwrap_or_default());
                BLOBMSG_DOUBLE
            }
        },
        Value::String(s) => {
            payload.extend_from_slice(&c_string(s));
            BLOBMSG_STRING
        }
        Value::Array(items) => {
            for item in items {
                put_field(&mut payload, "", item)?;
            }
            BLOBMSG_ARRAY
        }
        Value::Object(table) => {
            for (name, value) in table {
                put_field(&mut payload, name, value)?;
            }
            BLOBMSG_TABLE
        }
    };
    put_blob(dst, kind, true, &payload);
    Ok(())
}

/// Decode consecutive blobmsg fields into (name, value) pairs
fn decode_fields(buf: &[u8]) -> Result<Vec<(String, Value)>, ProtocolError> {
    blobs(buf)?
        .into_iter()
        .map(|blob| {
            if !blob.extended {
                return Err(malformed("blobmsg field without a name header"));
            }
            let name_len = u16::from_be_bytes(be_bytes(blob.payload)?) as usize;
            let header = pad(2 + name_len + 1);
            if header > blob.payload.len() {
                return Err(malformed("blobmsg name overruns its field"));
            }
            let name = String::from_utf8(blob.payload[2..2 + name_len].to_vec())
                .map_err(|_| malformed("field name is not UTF-8"))?;
            let value = decode_value(blob.id, &blob.payload[header..])?;
            Ok((name, value))
        })
        .collect()
}

fn decode_table(buf: &[u8]) -> Result<Map<String, Value>, ProtocolError> {
    Ok(decode_fields(buf)?.into_iter().collect())
}

fn decode_value(kind: u8, data: &[u8]) -> Result<Value, ProtocolError> {
    Ok(match kind {
        BLOBMSG_UNSPEC => Value::Null,
        BLOBMSG_ARRAY => Value::Array(decode_fields(data)?.into_iter().map(|(_, v)| v).collect()),
        BLOBMSG_TABLE => Value::Object(decode_table(data)?),
        BLOBMSG_STRING => Value::String(read_c_string(data)?),
        BLOBMSG_INT64 => Value::from(i64::from_be_bytes(be_bytes(data)?)),
        BLOBMSG_INT32 => Value::from(i32::from_be_bytes(be_bytes(data)?)),
        BLOBMSG_INT16 => Value::from(i16::from_be_bytes(be_bytes(data)?)),
        BLOBMSG_BOOL => Value::Bool(data.first().is_some_and(|b| *b != 0)),
        BLOBMSG_DOUBLE => {
            let value = f64::from_bits(u64::from_be_bytes(be_bytes(data)?));
            Number::from_f64(value).map_or(Value::Null, Value::Number)
        }
        other => return Err(malformed(format!("unknown blobmsg type {}", other))),
    })
}

/// Tokio codec for ubus messages
#[derive(Debug, Default)]
pub struct UbusCodec;

impl UbusCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for UbusCodec {
    type Item = UbusMessage;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < UBUS_HEADER_SIZE + BLOB_HEADER_SIZE {
            return Ok(None);
        }

        let root = u32::from_be_bytes(be_bytes(&src[UBUS_HEADER_SIZE..])?);
        let root_len = (root & BLOB_LEN_MASK) as usize;
        if root_len < BLOB_HEADER_SIZE {
            return Err(malformed(format!("root attribute length {}", root_len)));
        }
        if root_len > UBUS_MAX_MSGLEN {
            return Err(ProtocolError::FrameTooLarge {
                size: root_len,
                max: UBUS_MAX_MSGLEN,
            });
        }

        let total = UBUS_HEADER_SIZE + root_len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }
        let frame = src.split_to(total);

        if frame[0] != UBUS_VERSION {
            return Err(malformed(format!("unsupported version {}", frame[0])));
        }
        let msg_type = UbusMsgType::try_from(frame[1])?;
        let seq = u16::from_be_bytes([frame[2], frame[3]]);
        let peer = u32::from_be_bytes([frame[4], frame[5], frame[6], frame[7]]);

        let attrs = blobs(&frame[UBUS_HEADER_SIZE + BLOB_HEADER_SIZE..])?
            .into_iter()
            .map(|blob| UbusAttr::decode(blob.id, blob.payload))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Some(UbusMessage {
            msg_type,
            seq,
            peer,
            attrs,
        }))
    }
}

impl Encoder<UbusMessage> for UbusCodec {
    type Error = ProtocolError;

    fn encode(&mut self, message: UbusMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mut body = BytesMut::new();
        for attr in &message.attrs {
            attr.encode(&mut body)?;
        }

        let root_len = BLOB_HEADER_SIZE + body.len();
        if root_len > UBUS_MAX_MSGLEN {
            return Err(ProtocolError::FrameTooLarge {
                size: root_len,
                max: UBUS_MAX_MSGLEN,
            });
        }

        dst.reserve(UBUS_HEADER_SIZE + root_len);
        dst.put_u8(UBUS_VERSION);
        dst.put_u8(message.msg_type as u8);
        dst.put_u16(message.seq);
        dst.put_u32(message.peer);
        dst.put_u32(root_len as u32);
        dst.extend_from_slice(&body);
        Ok(())
    }
}
