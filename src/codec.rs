//! Buffer codec: the encoder and decoder that read and write any D-Bus
//! value with correct alignment and endianness (§4.3).
//!
//! Both sides operate over a single contiguous buffer spanning a whole
//! message (header and body together) so that alignment, which is always
//! relative to the start of the buffer and never to a container's own
//! start, falls out of simply tracking one running offset.

use byteorder::{BigEndian, ByteOrder, LittleEndian};

use crate::error::{Error, Result};
use crate::signature::{self, Type};
use crate::value::Value;

/// Array bodies larger than this are rejected outright (§4.3).
pub const MAX_ARRAY_BODY_SIZE: u32 = 67_108_864;

/// Messages (header + body) larger than this are rejected (§4.3, §4.4).
pub const MAX_MESSAGE_SIZE: usize = 134_217_728;

/// The wire byte order, tagged by the single endianness byte that opens
/// every D-Bus message header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Endianness {
    Little,
    Big,
}

impl Endianness {
    pub fn tag(self) -> u8 {
        match self {
            Endianness::Little => b'l',
            Endianness::Big => b'B',
        }
    }

    pub fn from_tag(tag: u8) -> Result<Endianness> {
        match tag {
            b'l' => Ok(Endianness::Little),
            b'B' => Ok(Endianness::Big),
            other => Err(Error::read_buffer(
                0,
                format!("unknown endianness tag '{}'", other as char),
            )),
        }
    }

    /// The endianness this host's native integers should be encoded as,
    /// matching the convention of writing messages in the sender's own
    /// byte order.
    pub fn native() -> Endianness {
        if cfg!(target_endian = "big") {
            Endianness::Big
        } else {
            Endianness::Little
        }
    }
}

fn align_up(offset: usize, alignment: usize) -> usize {
    (offset + alignment - 1) / alignment * alignment
}

/// A valid D-Bus object path is `/` or a sequence of `/name` segments where
/// each segment is one or more `[A-Za-z0-9_]` characters. Shared by the
/// codec (decoding header PATH fields and body values) and by local-object
/// registration.
pub fn validate_object_path(s: &str) -> std::result::Result<(), String> {
    if s == "/" {
        return Ok(());
    }
    if !s.starts_with('/') {
        return Err("object path must be \"/\" or start with '/'".to_string());
    }
    for segment in s[1..].split('/') {
        if segment.is_empty() {
            return Err("object path must not contain an empty segment".to_string());
        }
        if !segment
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_')
        {
            return Err(format!("invalid object path segment `{}`", segment));
        }
    }
    Ok(())
}

/// Growable byte buffer plus a write cursor and configured endianness.
pub struct Encoder {
    buf: Vec<u8>,
    endian: Endianness,
}

impl Encoder {
    pub fn new(endian: Endianness) -> Self {
        Encoder {
            buf: Vec::new(),
            endian,
        }
    }

    pub fn offset(&self) -> usize {
        self.buf.len()
    }

    pub fn endian(&self) -> Endianness {
        self.endian
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn align_to(&mut self, alignment: usize) {
        let target = align_up(self.buf.len(), alignment);
        self.buf.resize(target, 0);
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn write_i16(&mut self, v: i16) {
        self.write_u16(v as u16);
    }

    pub fn write_u16(&mut self, v: u16) {
        self.align_to(2);
        let start = self.buf.len();
        self.buf.resize(start + 2, 0);
        match self.endian {
            Endianness::Little => LittleEndian::write_u16(&mut self.buf[start..], v),
            Endianness::Big => BigEndian::write_u16(&mut self.buf[start..], v),
        }
    }

    pub fn write_i32(&mut self, v: i32) {
        self.write_u32(v as u32);
    }

    pub fn write_u32(&mut self, v: u32) {
        self.align_to(4);
        let start = self.buf.len();
        self.buf.resize(start + 4, 0);
        match self.endian {
            Endianness::Little => LittleEndian::write_u32(&mut self.buf[start..], v),
            Endianness::Big => BigEndian::write_u32(&mut self.buf[start..], v),
        }
    }

    pub fn write_i64(&mut self, v: i64) {
        self.write_u64(v as u64);
    }

    pub fn write_u64(&mut self, v: u64) {
        self.align_to(8);
        let start = self.buf.len();
        self.buf.resize(start + 8, 0);
        match self.endian {
            Endianness::Little => LittleEndian::write_u64(&mut self.buf[start..], v),
            Endianness::Big => BigEndian::write_u64(&mut self.buf[start..], v),
        }
    }

    pub fn write_f64(&mut self, v: f64) {
        self.write_u64(v.to_bits());
    }

    fn write_bool(&mut self, v: bool) {
        self.write_u32(v as u32);
    }

    /// STRING/OBJECT_PATH body: u32 length, bytes, NUL (§4.3).
    fn write_counted_str(&mut self, s: &str) -> Result<()> {
        if s.contains('\0') {
            return Err(Error::read_buffer(
                self.offset(),
                "string must not contain an interior NUL byte",
            ));
        }
        self.write_u32(s.len() as u32);
        self.buf.extend_from_slice(s.as_bytes());
        self.buf.push(0);
        Ok(())
    }

    fn write_string(&mut self, s: &str) -> Result<()> {
        self.write_counted_str(s)
    }

    fn write_object_path(&mut self, s: &str) -> Result<()> {
        validate_object_path(s).map_err(|reason| Error::read_buffer(self.offset(), reason))?;
        self.write_counted_str(s)
    }

    /// SIGNATURE body: u8 length, ASCII bytes, NUL (§4.3).
    fn write_signature_str(&mut self, s: &str) -> Result<()> {
        if !s.is_ascii() {
            return Err(Error::signature(s, "signature must be ASCII"));
        }
        if s.len() > signature::MAX_SIGNATURE_LENGTH {
            return Err(Error::signature(s, "exceeds maximum length of 255 bytes"));
        }
        self.write_u8(s.len() as u8);
        self.buf.extend_from_slice(s.as_bytes());
        self.buf.push(0);
        Ok(())
    }

    /// Encode a single typed value, recursing into containers.
    pub fn write_value(&mut self, value: &Value) -> Result<()> {
        match value {
            Value::Byte(v) => {
                self.write_u8(*v);
                Ok(())
            }
            Value::Boolean(v) => {
                self.write_bool(*v);
                Ok(())
            }
            Value::Int16(v) => {
                self.write_i16(*v);
                Ok(())
            }
            Value::Uint16(v) => {
                self.write_u16(*v);
                Ok(())
            }
            Value::Int32(v) => {
                self.write_i32(*v);
                Ok(())
            }
            Value::Uint32(v) => {
                self.write_u32(*v);
                Ok(())
            }
            Value::Int64(v) => {
                self.write_i64(*v);
                Ok(())
            }
            Value::Uint64(v) => {
                self.write_u64(*v);
                Ok(())
            }
            Value::Double(v) => {
                self.write_f64(*v);
                Ok(())
            }
            Value::String(s) => self.write_string(s),
            Value::ObjectPath(s) => self.write_object_path(s),
            Value::Signature(s) => self.write_signature_str(s),
            Value::UnixFd(v) => {
                self.write_u32(*v);
                Ok(())
            }
            Value::Array(elem_ty, items) => self.write_array(elem_ty, items),
            Value::Struct(fields) => self.write_struct(fields),
            Value::DictEntry(key, value) => self.write_dict_entry(key, value),
            Value::Variant(ty, inner) => self.write_variant(ty, inner),
        }
    }

    fn write_array(&mut self, elem_ty: &Type, items: &[Value]) -> Result<()> {
        self.align_to(4);
        let len_pos = self.buf.len();
        self.buf.extend_from_slice(&[0, 0, 0, 0]);
        // The first element's alignment padding is part of the declared
        // body length; padding up front, before measuring `start`, is how
        // that's excluded while still landing elements on the right
        // boundary (§4.3).
        self.align_to(elem_ty.alignment());
        let start = self.buf.len();
        for item in items {
            self.write_value(item)?;
        }
        let body_len = self.buf.len() - start;
        if body_len as u64 > MAX_ARRAY_BODY_SIZE as u64 {
            return Err(Error::alignment(
                start,
                format!(
                    "array body of {} bytes exceeds maximum of {}",
                    body_len, MAX_ARRAY_BODY_SIZE
                ),
            ));
        }
        match self.endian {
            Endianness::Little => LittleEndian::write_u32(&mut self.buf[len_pos..], body_len as u32),
            Endianness::Big => BigEndian::write_u32(&mut self.buf[len_pos..], body_len as u32),
        }
        Ok(())
    }

    fn write_struct(&mut self, fields: &[Value]) -> Result<()> {
        self.align_to(8);
        for field in fields {
            self.write_value(field)?;
        }
        Ok(())
    }

    fn write_dict_entry(&mut self, key: &Value, value: &Value) -> Result<()> {
        self.align_to(8);
        self.write_value(key)?;
        self.write_value(value)
    }

    fn write_variant(&mut self, ty: &Type, inner: &Value) -> Result<()> {
        let sig = ty.render();
        self.write_signature_str(&sig)?;
        self.write_value(inner)
    }
}

/// An immutable byte slice plus a read cursor and configured endianness.
pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
    endian: Endianness,
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8], endian: Endianness) -> Self {
        Decoder { buf, pos: 0, endian }
    }

    pub fn offset(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn at_end(&self) -> bool {
        self.pos >= self.buf.len()
    }

    pub fn align_to(&mut self, alignment: usize) -> Result<()> {
        let target = align_up(self.pos, alignment);
        if target > self.buf.len() {
            return Err(Error::alignment(
                self.pos,
                "padding would read past the end of the buffer",
            ));
        }
        for &b in &self.buf[self.pos..target] {
            if b != 0 {
                return Err(Error::alignment(self.pos, "non-zero alignment padding"));
            }
        }
        self.pos = target;
        Ok(())
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(Error::read_buffer(self.pos, "short read"));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_i16(&mut self) -> Result<i16> {
        Ok(self.read_u16()? as i16)
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        self.align_to(2)?;
        let b = self.take(2)?;
        Ok(match self.endian {
            Endianness::Little => LittleEndian::read_u16(b),
            Endianness::Big => BigEndian::read_u16(b),
        })
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(self.read_u32()? as i32)
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        self.align_to(4)?;
        let b = self.take(4)?;
        Ok(match self.endian {
            Endianness::Little => LittleEndian::read_u32(b),
            Endianness::Big => BigEndian::read_u32(b),
        })
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        Ok(self.read_u64()? as i64)
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        self.align_to(8)?;
        let b = self.take(8)?;
        Ok(match self.endian {
            Endianness::Little => LittleEndian::read_u64(b),
            Endianness::Big => BigEndian::read_u64(b),
        })
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        Ok(f64::from_bits(self.read_u64()?))
    }

    fn read_bool(&mut self) -> Result<bool> {
        let offset = self.pos;
        match self.read_u32()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(Error::invalid_value(
                offset,
                format!("boolean must be 0 or 1, got {}", other),
            )),
        }
    }

    /// STRING/OBJECT_PATH body: u32 length, bytes, NUL.
    fn read_counted_str(&mut self) -> Result<String> {
        let offset = self.pos;
        let len = self.read_u32()? as usize;
        let bytes = self.take(len)?;
        let text = std::str::from_utf8(bytes)
            .map_err(|_| Error::read_buffer(offset, "invalid UTF-8"))?
            .to_string();
        if text.contains('\0') {
            return Err(Error::read_buffer(offset, "interior NUL byte in string"));
        }
        let nul = self.read_u8()?;
        if nul != 0 {
            return Err(Error::read_buffer(offset, "missing NUL terminator"));
        }
        Ok(text)
    }

    /// SIGNATURE body: u8 length, ASCII bytes, NUL.
    fn read_signature_str(&mut self) -> Result<String> {
        let offset = self.pos;
        let len = self.read_u8()? as usize;
        let bytes = self.take(len)?;
        if !bytes.is_ascii() {
            return Err(Error::read_buffer(offset, "signature must be ASCII"));
        }
        let text = String::from_utf8_lossy(bytes).into_owned();
        let nul = self.read_u8()?;
        if nul != 0 {
            return Err(Error::read_buffer(offset, "missing NUL terminator"));
        }
        Ok(text)
    }

    /// Decode a single typed value, recursing into containers.
    pub fn read_value(&mut self, ty: &Type) -> Result<Value> {
        match ty {
            Type::Byte => Ok(Value::Byte(self.read_u8()?)),
            Type::Boolean => Ok(Value::Boolean(self.read_bool()?)),
            Type::Int16 => Ok(Value::Int16(self.read_i16()?)),
            Type::Uint16 => Ok(Value::Uint16(self.read_u16()?)),
            Type::Int32 => Ok(Value::Int32(self.read_i32()?)),
            Type::Uint32 => Ok(Value::Uint32(self.read_u32()?)),
            Type::Int64 => Ok(Value::Int64(self.read_i64()?)),
            Type::Uint64 => Ok(Value::Uint64(self.read_u64()?)),
            Type::Double => Ok(Value::Double(self.read_f64()?)),
            Type::String => Ok(Value::String(self.read_counted_str()?)),
            Type::ObjectPath => {
                let offset = self.pos;
                let s = self.read_counted_str()?;
                validate_object_path(&s).map_err(|reason| Error::read_buffer(offset, reason))?;
                Ok(Value::ObjectPath(s))
            }
            Type::Signature => {
                let s = self.read_signature_str()?;
                signature::parse(&s)?;
                Ok(Value::Signature(s))
            }
            Type::UnixFd => Ok(Value::UnixFd(self.read_u32()?)),
            Type::Array(elem_ty) => self.read_array(elem_ty),
            Type::Struct(field_tys) => self.read_struct(field_tys),
            Type::DictEntry(key_ty, value_ty) => self.read_dict_entry(key_ty, value_ty),
            Type::Variant => self.read_variant(),
        }
    }

    fn read_array(&mut self, elem_ty: &Type) -> Result<Value> {
        let offset = self.pos;
        let declared_len = self.read_u32()?;
        if declared_len > MAX_ARRAY_BODY_SIZE {
            return Err(Error::read_buffer(
                offset,
                format!(
                    "array body of {} bytes exceeds maximum of {}",
                    declared_len, MAX_ARRAY_BODY_SIZE
                ),
            ));
        }
        self.align_to(elem_ty.alignment())?;
        let start = self.pos;
        let end = start
            .checked_add(declared_len as usize)
            .ok_or_else(|| Error::read_buffer(offset, "array length overflow"))?;
        if end > self.buf.len() {
            return Err(Error::read_buffer(
                offset,
                "array declared length overruns buffer",
            ));
        }
        let mut items = Vec::new();
        while self.pos < end {
            items.push(self.read_value(elem_ty)?);
        }
        if self.pos != end {
            return Err(Error::read_buffer(
                offset,
                "array body length does not match declared length",
            ));
        }
        Ok(Value::Array(elem_ty.clone(), items))
    }

    fn read_struct(&mut self, field_tys: &[Type]) -> Result<Value> {
        self.align_to(8)?;
        let mut fields = Vec::with_capacity(field_tys.len());
        for ty in field_tys {
            fields.push(self.read_value(ty)?);
        }
        Ok(Value::Struct(fields))
    }

    fn read_dict_entry(&mut self, key_ty: &Type, value_ty: &Type) -> Result<Value> {
        self.align_to(8)?;
        let key = self.read_value(key_ty)?;
        let value = self.read_value(value_ty)?;
        Ok(Value::DictEntry(Box::new(key), Box::new(value)))
    }

    fn read_variant(&mut self) -> Result<Value> {
        let sig = self.read_signature_str()?;
        let ty = signature::parse_single(&sig)?;
        let inner = self.read_value(&ty)?;
        Ok(Value::Variant(ty, Box::new(inner)))
    }
}
