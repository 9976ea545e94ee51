//! Tagged binary record format carried by structured envelope payloads.
//!
//! A record is an ordered list of named fields. Field names are
//! protocol-stable; both ends look fields up by name, never by position.

use bytes::{Buf as _, BufMut as _, Bytes, BytesMut};
use smol_str::SmolStr;

use crate::Error;

/// Nested records deeper than this are rejected on decode.
const MAX_NESTING_DEPTH: usize = 16;

const TAG_STR: u8 = 1;
const TAG_U64: u8 = 2;
const TAG_I64: u8 = 3;
const TAG_BOOL: u8 = 4;
const TAG_BYTES: u8 = 5;
const TAG_RECORD: u8 = 6;

#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Value {
    Str(SmolStr),
    U64(u64),
    I64(i64),
    Bool(bool),
    Bytes(Bytes),
    Record(Record),
}

impl Value {
    fn tag(&self) -> u8 {
        match self {
            Value::Str(_) => TAG_STR,
            Value::U64(_) => TAG_U64,
            Value::I64(_) => TAG_I64,
            Value::Bool(_) => TAG_BOOL,
            Value::Bytes(_) => TAG_BYTES,
            Value::Record(_) => TAG_RECORD,
        }
    }

    pub fn size(&self) -> usize {
        1 /* tag */ + match self {
            Value::Str(s) => 4 + s.len(),
            Value::U64(_) | Value::I64(_) => 8,
            Value::Bool(_) => 1,
            Value::Bytes(b) => 4 + b.len(),
            Value::Record(r) => r.size(),
        }
    }

    fn encode(&self, buf: &mut BytesMut) -> Result<(), Error> {
        buf.put_u8(self.tag());
        match self {
            Value::Str(s) => {
                let len = u32::try_from(s.len()).map_err(|_| Error::EncodeTooLarge {
                    size: s.len(),
                    max: u32::MAX as usize,
                })?;
                buf.put_u32(len);
                buf.put(s.as_bytes());
            }
            Value::U64(v) => buf.put_u64(*v),
            Value::I64(v) => buf.put_i64(*v),
            Value::Bool(v) => buf.put_u8(u8::from(*v)),
            Value::Bytes(b) => {
                let len = u32::try_from(b.len()).map_err(|_| Error::EncodeTooLarge {
                    size: b.len(),
                    max: u32::MAX as usize,
                })?;
                buf.put_u32(len);
                buf.put(b.slice(..));
            }
            Value::Record(r) => r.encode(buf)?,
        }
        Ok(())
    }

    fn decode(buf: &mut Bytes, depth: usize) -> Result<Self, Error> {
        ensure_remaining(buf, 1, "VALUE tag")?;
        let tag = buf.get_u8();

        let value = match tag {
            TAG_STR => Value::Str(SmolStr::new(decode_str(buf)?)),
            TAG_U64 => {
                ensure_remaining(buf, 8, "VALUE u64")?;
                Value::U64(buf.get_u64())
            }
            TAG_I64 => {
                ensure_remaining(buf, 8, "VALUE i64")?;
                Value::I64(buf.get_i64())
            }
            TAG_BOOL => {
                ensure_remaining(buf, 1, "VALUE bool")?;
                match buf.get_u8() {
                    0 => Value::Bool(false),
                    1 => Value::Bool(true),
                    _ => {
                        return Err(Error::Malformed {
                            name: "VALUE",
                            field: "bool",
                            reason: "not 0 or 1",
                        })
                    }
                }
            }
            TAG_BYTES => {
                let len = decode_len(buf, "VALUE bytes")?;
                ensure_remaining(buf, len, "VALUE bytes")?;
                Value::Bytes(buf.split_to(len))
            }
            TAG_RECORD => Value::Record(Record::decode_at_depth(buf, depth + 1)?),
            _ => {
                return Err(Error::Malformed {
                    name: "VALUE",
                    field: "tag",
                    reason: "unknown value",
                })
            }
        };

        Ok(value)
    }
}

/// Ordered collection of named values.
///
/// Field order is preserved on the wire, but consumers must address fields
/// by name. Duplicate names are a decode error.
#[derive(Debug, PartialEq, Eq, Clone, Default)]
pub struct Record {
    fields: Vec<(SmolStr, Value)>,
}

impl Record {
    pub const NAME: &'static str = "RECORD";

    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insertion.
    #[must_use]
    pub fn with(mut self, name: impl Into<SmolStr>, value: Value) -> Self {
        self.insert(name, value);
        self
    }

    /// Inserts a field, replacing any existing field of the same name.
    pub fn insert(&mut self, name: impl Into<SmolStr>, value: Value) {
        let name = name.into();
        if let Some(existing) = self.fields.iter_mut().find(|(n, _)| *n == name) {
            existing.1 = value;
        } else {
            self.fields.push((name, value));
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        match self.get(name) {
            Some(Value::Str(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn get_u64(&self, name: &str) -> Option<u64> {
        match self.get(name) {
            Some(Value::U64(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_i64(&self, name: &str) -> Option<i64> {
        match self.get(name) {
            Some(Value::I64(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_bool(&self, name: &str) -> Option<bool> {
        match self.get(name) {
            Some(Value::Bool(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_bytes(&self, name: &str) -> Option<&Bytes> {
        match self.get(name) {
            Some(Value::Bytes(b)) => Some(b),
            _ => None,
        }
    }

    pub fn get_record(&self, name: &str) -> Option<&Record> {
        match self.get(name) {
            Some(Value::Record(r)) => Some(r),
            _ => None,
        }
    }

    pub fn size(&self) -> usize {
        2 /* field count */
            + self
                .fields
                .iter()
                .map(|(name, value)| 2 + name.len() + value.size())
                .sum::<usize>()
    }

    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), Error> {
        let count = u16::try_from(self.fields.len()).map_err(|_| Error::EncodeTooLarge {
            size: self.fields.len(),
            max: u16::MAX as usize,
        })?;
        buf.put_u16(count);

        for (name, value) in &self.fields {
            let name_len = u16::try_from(name.len()).map_err(|_| Error::EncodeTooLarge {
                size: name.len(),
                max: u16::MAX as usize,
            })?;
            buf.put_u16(name_len);
            buf.put(name.as_bytes());
            value.encode(buf)?;
        }

        Ok(())
    }

    /// Decodes a record, consuming from `buf`.
    pub fn decode(buf: &mut Bytes) -> Result<Self, Error> {
        Self::decode_at_depth(buf, 0)
    }

    fn decode_at_depth(buf: &mut Bytes, depth: usize) -> Result<Self, Error> {
        if depth > MAX_NESTING_DEPTH {
            return Err(Error::Malformed {
                name: Self::NAME,
                field: "nesting",
                reason: "too deep",
            });
        }

        ensure_remaining(buf, 2, "RECORD field count")?;
        let count = usize::from(buf.get_u16());

        let mut fields = Vec::with_capacity(count.min(64));

        for _ in 0..count {
            ensure_remaining(buf, 2, "RECORD field name length")?;
            let name_len = usize::from(buf.get_u16());
            ensure_remaining(buf, name_len, "RECORD field name")?;
            let name_bytes = buf.split_to(name_len);
            let name = core::str::from_utf8(&name_bytes).map_err(|_| Error::Malformed {
                name: Self::NAME,
                field: "field name",
                reason: "not valid UTF-8",
            })?;
            let name = SmolStr::new(name);

            if fields.iter().any(|(n, _): &(SmolStr, Value)| *n == name) {
                return Err(Error::Malformed {
                    name: Self::NAME,
                    field: "field name",
                    reason: "duplicate",
                });
            }

            let value = Value::decode(buf, depth)?;
            fields.push((name, value));
        }

        Ok(Self { fields })
    }
}

impl FromIterator<(SmolStr, Value)> for Record {
    fn from_iter<I: IntoIterator<Item = (SmolStr, Value)>>(iter: I) -> Self {
        let mut record = Record::new();
        for (name, value) in iter {
            record.insert(name, value);
        }
        record
    }
}

fn decode_str(buf: &mut Bytes) -> Result<String, Error> {
    let len = decode_len(buf, "VALUE string")?;
    ensure_remaining(buf, len, "VALUE string")?;
    let raw = buf.split_to(len);
    let s = core::str::from_utf8(&raw).map_err(|_| Error::Malformed {
        name: "VALUE",
        field: "string",
        reason: "not valid UTF-8",
    })?;
    Ok(s.to_owned())
}

fn decode_len(buf: &mut Bytes, name: &'static str) -> Result<usize, Error> {
    ensure_remaining(buf, 4, name)?;
    Ok(buf.get_u32() as usize)
}

fn ensure_remaining(buf: &Bytes, expected: usize, name: &'static str) -> Result<(), Error> {
    if buf.len() < expected {
        Err(Error::ShortRead {
            name,
            received: buf.len(),
            expected,
        })
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, reason = "test code can panic on errors")]

    use bytes::BufMut as _;

    use super::*;

    #[test]
    fn insert_replaces_existing_field() {
        let mut rec = Record::new();
        rec.insert("a", Value::U64(1));
        rec.insert("a", Value::U64(2));
        assert_eq!(rec.len(), 1);
        assert_eq!(rec.get_u64("a"), Some(2));
    }

    #[test]
    fn duplicate_field_rejected_on_decode() {
        // Hand-built record with field "x" twice.
        let mut buf = BytesMut::new();
        buf.put_u16(2);
        for _ in 0..2 {
            buf.put_u16(1);
            buf.put_u8(b'x');
            buf.put_u8(TAG_BOOL);
            buf.put_u8(1);
        }

        let err = Record::decode(&mut buf.freeze()).unwrap_err();
        assert!(matches!(err, Error::Malformed { reason: "duplicate", .. }));
    }

    #[test]
    fn truncated_value_is_short_read() {
        let rec = Record::new().with("blob", Value::Bytes(Bytes::from_static(&[0; 32])));
        let mut buf = BytesMut::new();
        rec.encode(&mut buf).unwrap();

        let mut truncated = buf.freeze();
        truncated.truncate(truncated.len() - 1);
        let err = Record::decode(&mut truncated).unwrap_err();
        assert!(matches!(err, Error::ShortRead { .. }));
    }

    #[test]
    fn nesting_depth_is_bounded() {
        let mut inner = Record::new().with("leaf", Value::Bool(true));
        for _ in 0..MAX_NESTING_DEPTH + 1 {
            inner = Record::new().with("next", Value::Record(inner));
        }

        let mut buf = BytesMut::new();
        inner.encode(&mut buf).unwrap();

        let err = Record::decode(&mut buf.freeze()).unwrap_err();
        assert!(matches!(err, Error::Malformed { reason: "too deep", .. }));
    }
}
