//! Variable-length binary codec shared by every wire and channel.
//!
//! Byte-compatible with the lib0 encoding used by Yjs peers:
//!
//! ```text
//! varuint   7 bits per byte, little-endian, high bit = "more follows"
//! varint    first byte: [more | sign | 6 bits], then varuint-style bytes
//! varstring varuint(byte length) . utf-8 bytes
//! varbytes  varuint(length) . raw bytes
//! any       tag byte (116..=127) . tag-specific body
//! ```
//!
//! Integers are limited to the 53-bit "safe" range so that values round-trip
//! through JavaScript peers. Anything larger is a decode error.

use std::collections::BTreeMap;

use crate::error::CodecError;

/// Largest integer representable without loss in an IEEE-754 double.
pub const MAX_SAFE_INTEGER: u64 = (1 << 53) - 1;

/// Deepest object/array nesting `read_any` accepts.
pub const MAX_ANY_DEPTH: usize = 128;

const BIT7: u8 = 0b0100_0000;
const BIT8: u8 = 0b1000_0000;
const BITS6: u8 = 0b0011_1111;
const BITS7: u8 = 0b0111_1111;

// `any` type tags, allocated downward from the top of the byte range.
const TAG_UNDEFINED: u8 = 127;
const TAG_NULL: u8 = 126;
const TAG_INTEGER: u8 = 125;
const TAG_FLOAT32: u8 = 124;
const TAG_FLOAT64: u8 = 123;
const TAG_BIGINT: u8 = 122;
const TAG_FALSE: u8 = 121;
const TAG_TRUE: u8 = 120;
const TAG_STRING: u8 = 119;
const TAG_OBJECT: u8 = 118;
const TAG_ARRAY: u8 = 117;
const TAG_BYTES: u8 = 116;

/// Untyped value carried by `write_any` / `read_any`.
///
/// Also the representation of awareness states, which travel as JSON.
#[derive(Debug, Clone, PartialEq)]
pub enum Any {
    Undefined,
    Null,
    /// Integer within the 53-bit safe range. Larger magnitudes are written
    /// as [`Any::BigInt`].
    Integer(i64),
    Float32(f32),
    Float64(f64),
    BigInt(i64),
    Bool(bool),
    String(String),
    Object(BTreeMap<String, Any>),
    Array(Vec<Any>),
    Bytes(Vec<u8>),
}

impl Any {
    pub fn is_null(&self) -> bool {
        matches!(self, Any::Null | Any::Undefined)
    }

    /// Field lookup on an object value.
    pub fn get(&self, key: &str) -> Option<&Any> {
        match self {
            Any::Object(map) => map.get(key),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Any::String(s) => Some(s),
            _ => None,
        }
    }

    /// Serialize as a JSON string. Non-finite floats become `null`.
    pub fn to_json_string(&self) -> String {
        serde_json::Value::from(self).to_string()
    }

    /// Parse a JSON string.
    pub fn from_json_str(s: &str) -> Result<Any, serde_json::Error> {
        serde_json::from_str::<serde_json::Value>(s).map(Any::from)
    }

    /// Build an object from key/value pairs.
    pub fn object<K, I>(entries: I) -> Any
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Any)>,
    {
        Any::Object(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

impl From<&str> for Any {
    fn from(s: &str) -> Self {
        Any::String(s.to_string())
    }
}

impl From<String> for Any {
    fn from(s: String) -> Self {
        Any::String(s)
    }
}

impl From<bool> for Any {
    fn from(b: bool) -> Self {
        Any::Bool(b)
    }
}

impl From<i64> for Any {
    fn from(n: i64) -> Self {
        Any::Integer(n)
    }
}

impl From<f64> for Any {
    fn from(n: f64) -> Self {
        Any::Float64(n)
    }
}

impl From<serde_json::Value> for Any {
    fn from(value: serde_json::Value) -> Self {
        use serde_json::Value;
        match value {
            Value::Null => Any::Null,
            Value::Bool(b) => Any::Bool(b),
            Value::Number(n) => match n.as_i64() {
                Some(i) if i.unsigned_abs() <= MAX_SAFE_INTEGER => Any::Integer(i),
                _ => Any::Float64(n.as_f64().unwrap_or(f64::NAN)),
            },
            Value::String(s) => Any::String(s),
            Value::Array(items) => Any::Array(items.into_iter().map(Any::from).collect()),
            Value::Object(map) => Any::Object(map.into_iter().map(|(k, v)| (k, Any::from(v))).collect()),
        }
    }
}

impl From<&Any> for serde_json::Value {
    fn from(any: &Any) -> Self {
        use serde_json::Value;
        match any {
            Any::Undefined | Any::Null => Value::Null,
            Any::Integer(n) | Any::BigInt(n) => Value::from(*n),
            Any::Float32(f) => serde_json::Number::from_f64(f64::from(*f))
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Any::Float64(f) => serde_json::Number::from_f64(*f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Any::Bool(b) => Value::Bool(*b),
            Any::String(s) => Value::String(s.clone()),
            Any::Object(map) => Value::Object(
                map.iter().map(|(k, v)| (k.clone(), Value::from(v))).collect(),
            ),
            Any::Array(items) => Value::Array(items.iter().map(Value::from).collect()),
            Any::Bytes(bytes) => Value::Array(bytes.iter().map(|b| Value::from(*b)).collect()),
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Encoder
// ───────────────────────────────────────────────────────────────────

/// Growable write buffer.
#[derive(Debug, Default, Clone)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self { buf: Vec::with_capacity(capacity) }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn write_u8(&mut self, byte: u8) {
        self.buf.push(byte);
    }

    /// Append raw bytes without a length prefix.
    pub fn write_raw(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn write_var_uint(&mut self, mut num: u64) {
        while num > u64::from(BITS7) {
            self.buf.push(BIT8 | (num as u8 & BITS7));
            num >>= 7;
        }
        self.buf.push(num as u8 & BITS7);
    }

    /// Signed varint: the second-highest bit of the first byte is the sign.
    pub fn write_var_int(&mut self, num: i64) {
        let negative = num < 0;
        let mut rest = num.unsigned_abs();
        let first = (if rest > u64::from(BITS6) { BIT8 } else { 0 })
            | (if negative { BIT7 } else { 0 })
            | (rest as u8 & BITS6);
        self.buf.push(first);
        rest >>= 6;
        while rest > 0 {
            let more = if rest > u64::from(BITS7) { BIT8 } else { 0 };
            self.buf.push(more | (rest as u8 & BITS7));
            rest >>= 7;
        }
    }

    pub fn write_var_string(&mut self, s: &str) {
        self.write_var_bytes(s.as_bytes());
    }

    pub fn write_var_bytes(&mut self, bytes: &[u8]) {
        self.write_var_uint(bytes.len() as u64);
        self.buf.extend_from_slice(bytes);
    }

    pub fn write_f32(&mut self, f: f32) {
        self.buf.extend_from_slice(&f.to_be_bytes());
    }

    pub fn write_f64(&mut self, f: f64) {
        self.buf.extend_from_slice(&f.to_be_bytes());
    }

    pub fn write_i64(&mut self, n: i64) {
        self.buf.extend_from_slice(&n.to_be_bytes());
    }

    pub fn write_any(&mut self, value: &Any) {
        match value {
            Any::Undefined => self.write_u8(TAG_UNDEFINED),
            Any::Null => self.write_u8(TAG_NULL),
            Any::Integer(n) if n.unsigned_abs() <= MAX_SAFE_INTEGER => {
                self.write_u8(TAG_INTEGER);
                self.write_var_int(*n);
            }
            Any::Integer(n) | Any::BigInt(n) => {
                self.write_u8(TAG_BIGINT);
                self.write_i64(*n);
            }
            Any::Float32(f) => {
                self.write_u8(TAG_FLOAT32);
                self.write_f32(*f);
            }
            Any::Float64(f) => {
                self.write_u8(TAG_FLOAT64);
                self.write_f64(*f);
            }
            Any::Bool(true) => self.write_u8(TAG_TRUE),
            Any::Bool(false) => self.write_u8(TAG_FALSE),
            Any::String(s) => {
                self.write_u8(TAG_STRING);
                self.write_var_string(s);
            }
            Any::Object(map) => {
                self.write_u8(TAG_OBJECT);
                self.write_var_uint(map.len() as u64);
                for (key, v) in map {
                    self.write_var_string(key);
                    self.write_any(v);
                }
            }
            Any::Array(items) => {
                self.write_u8(TAG_ARRAY);
                self.write_var_uint(items.len() as u64);
                for item in items {
                    self.write_any(item);
                }
            }
            Any::Bytes(bytes) => {
                self.write_u8(TAG_BYTES);
                self.write_var_bytes(bytes);
            }
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Decoder
// ───────────────────────────────────────────────────────────────────

/// Cursor over a borrowed byte slice.
#[derive(Debug, Clone)]
pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Whether unread bytes remain.
    pub fn has_content(&self) -> bool {
        self.pos < self.buf.len()
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Everything not yet consumed.
    pub fn rest(&mut self) -> &'a [u8] {
        let rest = &self.buf[self.pos..];
        self.pos = self.buf.len();
        rest
    }

    pub fn read_u8(&mut self) -> Result<u8, CodecError> {
        let byte = *self.buf.get(self.pos).ok_or(CodecError::UnexpectedEndOfInput)?;
        self.pos += 1;
        Ok(byte)
    }

    pub fn read_raw(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        let end = self.pos.checked_add(len).ok_or(CodecError::UnexpectedEndOfInput)?;
        let slice = self.buf.get(self.pos..end).ok_or(CodecError::UnexpectedEndOfInput)?;
        self.pos = end;
        Ok(slice)
    }

    pub fn read_var_uint(&mut self) -> Result<u64, CodecError> {
        let mut num: u64 = 0;
        let mut mult: u64 = 1;
        loop {
            let r = self.read_u8()?;
            let part = u64::from(r & BITS7)
                .checked_mul(mult)
                .ok_or(CodecError::IntegerOutOfRange)?;
            num = num.checked_add(part).ok_or(CodecError::IntegerOutOfRange)?;
            if num > MAX_SAFE_INTEGER {
                return Err(CodecError::IntegerOutOfRange);
            }
            if r < BIT8 {
                return Ok(num);
            }
            mult = mult.checked_mul(128).ok_or(CodecError::IntegerOutOfRange)?;
        }
    }

    /// Varuint narrowed to `u32` (client ids, clocks).
    pub fn read_var_u32(&mut self) -> Result<u32, CodecError> {
        u32::try_from(self.read_var_uint()?).map_err(|_| CodecError::IntegerOutOfRange)
    }

    pub fn read_var_int(&mut self) -> Result<i64, CodecError> {
        let first = self.read_u8()?;
        let negative = first & BIT7 != 0;
        let mut num = u64::from(first & BITS6);
        if first & BIT8 != 0 {
            let mut mult: u64 = 64;
            loop {
                let r = self.read_u8()?;
                let part = u64::from(r & BITS7)
                    .checked_mul(mult)
                    .ok_or(CodecError::IntegerOutOfRange)?;
                num = num.checked_add(part).ok_or(CodecError::IntegerOutOfRange)?;
                if num > MAX_SAFE_INTEGER {
                    return Err(CodecError::IntegerOutOfRange);
                }
                if r < BIT8 {
                    break;
                }
                mult = mult.checked_mul(128).ok_or(CodecError::IntegerOutOfRange)?;
            }
        }
        // num <= MAX_SAFE_INTEGER, so the cast is lossless
        let signed = num as i64;
        Ok(if negative { -signed } else { signed })
    }

    pub fn read_var_bytes(&mut self) -> Result<&'a [u8], CodecError> {
        let len = self.read_var_uint()?;
        let len = usize::try_from(len).map_err(|_| CodecError::IntegerOutOfRange)?;
        self.read_raw(len)
    }

    pub fn read_var_string(&mut self) -> Result<String, CodecError> {
        let bytes = self.read_var_bytes()?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| CodecError::InvalidUtf8)
    }

    pub fn read_f32(&mut self) -> Result<f32, CodecError> {
        let bytes = self.read_raw(4)?;
        let mut arr = [0u8; 4];
        arr.copy_from_slice(bytes);
        Ok(f32::from_be_bytes(arr))
    }

    pub fn read_f64(&mut self) -> Result<f64, CodecError> {
        let bytes = self.read_raw(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(bytes);
        Ok(f64::from_be_bytes(arr))
    }

    pub fn read_i64(&mut self) -> Result<i64, CodecError> {
        let bytes = self.read_raw(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(bytes);
        Ok(i64::from_be_bytes(arr))
    }

    pub fn read_any(&mut self) -> Result<Any, CodecError> {
        self.read_any_at(0)
    }

    fn read_any_at(&mut self, depth: usize) -> Result<Any, CodecError> {
        if depth > MAX_ANY_DEPTH {
            return Err(CodecError::NestingTooDeep);
        }
        let tag = self.read_u8()?;
        Ok(match tag {
            TAG_UNDEFINED => Any::Undefined,
            TAG_NULL => Any::Null,
            TAG_INTEGER => Any::Integer(self.read_var_int()?),
            TAG_FLOAT32 => Any::Float32(self.read_f32()?),
            TAG_FLOAT64 => Any::Float64(self.read_f64()?),
            TAG_BIGINT => Any::BigInt(self.read_i64()?),
            TAG_FALSE => Any::Bool(false),
            TAG_TRUE => Any::Bool(true),
            TAG_STRING => Any::String(self.read_var_string()?),
            TAG_OBJECT => {
                let len = self.read_var_uint()?;
                let mut map = BTreeMap::new();
                for _ in 0..len {
                    let key = self.read_var_string()?;
                    let value = self.read_any_at(depth + 1)?;
                    map.insert(key, value);
                }
                Any::Object(map)
            }
            TAG_ARRAY => {
                let len = self.read_var_uint()?;
                // Cap the preallocation; a bogus length must not trigger a huge alloc.
                let mut items = Vec::with_capacity((len as usize).min(self.remaining()));
                for _ in 0..len {
                    items.push(self.read_any_at(depth + 1)?);
                }
                Any::Array(items)
            }
            TAG_BYTES => Any::Bytes(self.read_var_bytes()?.to_vec()),
            other => return Err(CodecError::UnknownAnyTag(other)),
        })
    }
}
