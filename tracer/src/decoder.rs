//! Record decoding
//!
//! Turns the fixed byte layout of a [`RawRecord`] into a typed
//! [`DecodedEvent`] following the probe's [`RecordSchema`].

use crate::{
    channel::RawRecord,
    descriptor::{FieldType, RecordSchema},
};
use byteorder::{ByteOrder, NativeEndian};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("record {sequence} is {actual} bytes, schema expects {expected}")]
    Malformed {
        sequence: u64,
        expected: usize,
        actual: usize,
    },
}

/// Value of one decoded field
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Unsigned(u64),
    Signed(i64),
    Text(String),
    Bytes(Vec<u8>),
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unsigned(v) => write!(f, "{}", v),
            Self::Signed(v) => write!(f, "{}", v),
            Self::Text(s) => f.write_str(s),
            Self::Bytes(bytes) => {
                for byte in bytes {
                    write!(f, "{:02x}", byte)?;
                }
                Ok(())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DecodedField {
    pub name: String,
    pub value: FieldValue,
}

/// A validated probe record
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DecodedEvent {
    pub sequence: u64,
    pub captured_at: DateTime<Utc>,
    pub fields: Vec<DecodedField>,
}

impl DecodedEvent {
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields
            .iter()
            .find(|field| field.name == name)
            .map(|field| &field.value)
    }
}

/// Decode one record against `schema`
///
/// Fields are read in declaration order at their declared widths; integers
/// are host byte order, text stops at the first NUL.
pub fn decode(raw: &RawRecord, schema: &RecordSchema) -> Result<DecodedEvent, DecodeError> {
    let expected = schema.total_width();
    if raw.bytes.len() != expected {
        return Err(DecodeError::Malformed {
            sequence: raw.sequence,
            expected,
            actual: raw.bytes.len(),
        });
    }

    let mut offset = 0;
    let fields = schema
        .fields()
        .iter()
        .map(|spec| {
            let width = spec.width();
            let bytes = &raw.bytes[offset..offset + width];
            offset += width;
            DecodedField {
                name: spec.name.clone(),
                value: decode_value(spec.ty, bytes),
            }
        })
        .collect();

    Ok(DecodedEvent {
        sequence: raw.sequence,
        captured_at: raw.captured_at,
        fields,
    })
}

fn decode_value(ty: FieldType, bytes: &[u8]) -> FieldValue {
    match ty {
        FieldType::U8 => FieldValue::Unsigned(bytes[0] as u64),
        FieldType::U16 => FieldValue::Unsigned(NativeEndian::read_u16(bytes) as u64),
        FieldType::U32 => FieldValue::Unsigned(NativeEndian::read_u32(bytes) as u64),
        FieldType::U64 => FieldValue::Unsigned(NativeEndian::read_u64(bytes)),
        FieldType::I8 => FieldValue::Signed(bytes[0] as i8 as i64),
        FieldType::I16 => FieldValue::Signed(NativeEndian::read_i16(bytes) as i64),
        FieldType::I32 => FieldValue::Signed(NativeEndian::read_i32(bytes) as i64),
        FieldType::I64 => FieldValue::Signed(NativeEndian::read_i64(bytes)),
        FieldType::Str(_) => {
            let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
            FieldValue::Text(String::from_utf8_lossy(&bytes[..end]).into_owned())
        }
        FieldType::Bytes(_) => FieldValue::Bytes(bytes.to_vec()),
    }
}
