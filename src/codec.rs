//! Wire framing: length-delimited PDUs in two encodings.
//!
//! A JSON PDU is a single serde_json document terminated by a newline. A
//! binary PDU opens with a `0x00` magic byte (which can never begin a JSON
//! document), a u32-LE payload length, and a compact tagged encoding of the
//! value. The first byte of a session's first request selects the format,
//! and every reply on that session mirrors it.
//!
//! In the binary encoding, an array whose elements are all objects is
//! template-compressed: the field names are written once, followed by
//! positional rows. File-record fields appear in their contractual order
//! (`files::FILE_FIELDS`); other keys follow in first-seen order. A field
//! absent from a row is written as an explicit skip tag, so every row
//! carries exactly the template's field count.

use serde_json::{Map, Number, Value};

pub const BINARY_MAGIC: u8 = 0x00;

const T_NULL: u8 = 0x01;
const T_TRUE: u8 = 0x02;
const T_FALSE: u8 = 0x03;
const T_INT: u8 = 0x04;
const T_FLOAT: u8 = 0x05;
const T_STRING: u8 = 0x06;
const T_ARRAY: u8 = 0x07;
const T_OBJECT: u8 = 0x08;
const T_TEMPLATE: u8 = 0x09;
const T_SKIP: u8 = 0x0a;
const T_UINT: u8 = 0x0b;

/// The wire encoding of one session, fixed by its first decoded request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PduFormat {
    Json,
    Binary,
}

/// A framing-level failure. Terminal for the session that hit it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeError {
    /// Byte (binary) or column (JSON) position within the offending PDU.
    pub position: usize,
    pub message: String,
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid pdu at position {}: {}", self.position, self.message)
    }
}

impl std::error::Error for DecodeError {}

/// Incremental request decoder: feed raw socket bytes, take complete PDUs.
#[derive(Debug, Default)]
pub struct Decoder {
    buf: Vec<u8>,
}

impl Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Returns the next complete PDU, `None` if more bytes are needed.
    pub fn next_pdu(&mut self) -> Result<Option<(PduFormat, Value)>, DecodeError> {
        // Inter-PDU whitespace is insignificant in the JSON framing.
        while self
            .buf
            .first()
            .is_some_and(|&b| matches!(b, b'\n' | b'\r' | b' ' | b'\t'))
        {
            self.buf.remove(0);
        }

        let Some(&first) = self.buf.first() else {
            return Ok(None);
        };

        if first == BINARY_MAGIC {
            if self.buf.len() < 5 {
                return Ok(None);
            }
            let len = u32::from_le_bytes(self.buf[1..5].try_into().unwrap()) as usize;
            if self.buf.len() < 5 + len {
                return Ok(None);
            }
            let payload: Vec<u8> = self.buf.drain(..5 + len).skip(5).collect();
            let mut cursor = ByteCursor { buf: &payload, pos: 0 };
            let value = decode_value(&mut cursor)?;
            if cursor.pos != payload.len() {
                return Err(DecodeError {
                    position: cursor.pos,
                    message: "trailing bytes after value".into(),
                });
            }
            return Ok(Some((PduFormat::Binary, value)));
        }

        let Some(end) = self.buf.iter().position(|&b| b == b'\n') else {
            return Ok(None);
        };
        let line: Vec<u8> = self.buf.drain(..=end).collect();
        let value = serde_json::from_slice(&line[..line.len() - 1]).map_err(|e| DecodeError {
            position: e.column(),
            message: e.to_string(),
        })?;
        Ok(Some((PduFormat::Json, value)))
    }
}

/// Encodes one response PDU in the given format.
pub fn encode_pdu(format: PduFormat, value: &Value) -> Vec<u8> {
    match format {
        PduFormat::Json => {
            let mut out = serde_json::to_vec(value).expect("response values are valid json");
            out.push(b'\n');
            out
        }
        PduFormat::Binary => {
            let mut payload = Vec::new();
            encode_value(value, &mut payload);
            let mut out = Vec::with_capacity(payload.len() + 5);
            out.push(BINARY_MAGIC);
            out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
            out.extend_from_slice(&payload);
            out
        }
    }
}

fn encode_string(s: &str, out: &mut Vec<u8>) {
    out.extend_from_slice(&(s.len() as u32).to_le_bytes());
    out.extend_from_slice(s.as_bytes());
}

fn encode_number(n: &Number, out: &mut Vec<u8>) {
    // Stat fields (size, ino, dev, nlink) are u64 and may exceed i64; they
    // must survive the wire exactly, never as a float approximation.
    if let Some(i) = n.as_i64() {
        out.push(T_INT);
        out.extend_from_slice(&i.to_le_bytes());
    } else if let Some(u) = n.as_u64() {
        out.push(T_UINT);
        out.extend_from_slice(&u.to_le_bytes());
    } else {
        out.push(T_FLOAT);
        out.extend_from_slice(&n.as_f64().unwrap_or(0.0).to_le_bytes());
    }
}

fn encode_value(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Null => out.push(T_NULL),
        Value::Bool(true) => out.push(T_TRUE),
        Value::Bool(false) => out.push(T_FALSE),
        Value::Number(n) => encode_number(n, out),
        Value::String(s) => {
            out.push(T_STRING);
            encode_string(s, out);
        }
        Value::Array(items) => {
            if !items.is_empty() && items.iter().all(Value::is_object) {
                encode_template(items, out);
            } else {
                out.push(T_ARRAY);
                out.extend_from_slice(&(items.len() as u32).to_le_bytes());
                for item in items {
                    encode_value(item, out);
                }
            }
        }
        Value::Object(obj) => {
            out.push(T_OBJECT);
            out.extend_from_slice(&(obj.len() as u32).to_le_bytes());
            for (key, val) in obj {
                encode_string(key, out);
                encode_value(val, out);
            }
        }
    }
}

fn encode_template(rows: &[Value], out: &mut Vec<u8>) {
    let mut present: Vec<&str> = Vec::new();
    for row in rows {
        for key in row.as_object().expect("template rows are objects").keys() {
            if !present.iter().any(|f| f == key) {
                present.push(key);
            }
        }
    }
    // File-record fields keep their contractual wire order regardless of
    // which row happened to come first (a deleted record carries only a
    // subset of the fields); any other keys follow in first-seen order.
    let mut fields: Vec<&str> = crate::files::FILE_FIELDS
        .iter()
        .copied()
        .filter(|f| present.contains(f))
        .collect();
    for key in &present {
        if !crate::files::FILE_FIELDS.contains(key) {
            fields.push(*key);
        }
    }

    out.push(T_TEMPLATE);
    out.extend_from_slice(&(fields.len() as u32).to_le_bytes());
    for field in &fields {
        encode_string(field, out);
    }
    out.extend_from_slice(&(rows.len() as u32).to_le_bytes());
    for row in rows {
        let obj = row.as_object().expect("template rows are objects");
        for field in &fields {
            match obj.get(*field) {
                Some(v) => encode_value(v, out),
                None => out.push(T_SKIP),
            }
        }
    }
}

struct ByteCursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteCursor<'a> {
    fn error(&self, message: impl Into<String>) -> DecodeError {
        DecodeError { position: self.pos, message: message.into() }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.buf.len() - self.pos < n {
            return Err(self.error("truncated value"));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn peek(&self) -> Option<u8> {
        self.buf.get(self.pos).copied()
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn string(&mut self) -> Result<String, DecodeError> {
        let len = self.u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| self.error("string is not utf-8"))
    }
}

fn decode_value(cursor: &mut ByteCursor<'_>) -> Result<Value, DecodeError> {
    let tag = cursor.u8()?;
    match tag {
        T_NULL => Ok(Value::Null),
        T_TRUE => Ok(Value::Bool(true)),
        T_FALSE => Ok(Value::Bool(false)),
        T_INT => {
            let i = i64::from_le_bytes(cursor.take(8)?.try_into().unwrap());
            Ok(Value::Number(i.into()))
        }
        T_UINT => {
            let u = u64::from_le_bytes(cursor.take(8)?.try_into().unwrap());
            Ok(Value::Number(u.into()))
        }
        T_FLOAT => {
            let f = f64::from_le_bytes(cursor.take(8)?.try_into().unwrap());
            Number::from_f64(f)
                .map(Value::Number)
                .ok_or_else(|| cursor.error("non-finite float"))
        }
        T_STRING => Ok(Value::String(cursor.string()?)),
        T_ARRAY => {
            let count = cursor.u32()? as usize;
            let mut items = Vec::with_capacity(count.min(4096));
            for _ in 0..count {
                items.push(decode_value(cursor)?);
            }
            Ok(Value::Array(items))
        }
        T_OBJECT => {
            let count = cursor.u32()? as usize;
            let mut obj = Map::new();
            for _ in 0..count {
                let key = cursor.string()?;
                obj.insert(key, decode_value(cursor)?);
            }
            Ok(Value::Object(obj))
        }
        T_TEMPLATE => {
            let field_count = cursor.u32()? as usize;
            let mut fields = Vec::with_capacity(field_count.min(4096));
            for _ in 0..field_count {
                fields.push(cursor.string()?);
            }
            let row_count = cursor.u32()? as usize;
            let mut rows = Vec::with_capacity(row_count.min(4096));
            for _ in 0..row_count {
                let mut obj = Map::new();
                for field in &fields {
                    if cursor.peek() == Some(T_SKIP) {
                        cursor.u8()?;
                        continue;
                    }
                    obj.insert(field.clone(), decode_value(cursor)?);
                }
                rows.push(Value::Object(obj));
            }
            Ok(Value::Array(rows))
        }
        other => Err(cursor.error(format!("unknown tag 0x{:02x}", other))),
    }
}
