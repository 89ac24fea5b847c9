//! Probe descriptors
//!
//! A [`ProbeDescriptor`] names the kernel function to instrument and the
//! fixed record layout the instrumentation emits on every hit.

use serde::Deserialize;
use std::{collections::HashSet, fmt, str::FromStr};
use thiserror::Error;

/// Errors raised while building a descriptor from configuration
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DescriptorError {
    #[error("target symbol must not be empty")]
    EmptySymbol,

    #[error("record schema must declare at least one field")]
    EmptySchema,

    #[error("invalid field declaration '{0}', expected name:type")]
    InvalidField(String),

    #[error("unknown field type '{0}'")]
    UnknownType(String),

    #[error("field '{0}' has zero width")]
    ZeroWidth(String),

    #[error("duplicate field name '{0}'")]
    DuplicateField(String),

    #[error("record of {width} bytes exceeds the {max} byte limit")]
    RecordTooWide { width: usize, max: usize },
}

/// Primitive type of one record field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum FieldType {
    U8,
    U16,
    U32,
    U64,
    I8,
    I16,
    I32,
    I64,
    /// Fixed-length text, NUL padded
    Str(usize),
    /// Fixed-length opaque bytes
    Bytes(usize),
}

impl FieldType {
    /// Number of bytes the field occupies in a record
    pub fn width(&self) -> usize {
        match self {
            Self::U8 | Self::I8 => 1,
            Self::U16 | Self::I16 => 2,
            Self::U32 | Self::I32 => 4,
            Self::U64 | Self::I64 => 8,
            Self::Str(len) | Self::Bytes(len) => *len,
        }
    }
}

impl FromStr for FieldType {
    type Err = DescriptorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ty = s.trim().to_ascii_lowercase();
        let parsed = match ty.as_str() {
            "u8" => Self::U8,
            "u16" => Self::U16,
            "u32" => Self::U32,
            "u64" => Self::U64,
            "i8" => Self::I8,
            "i16" => Self::I16,
            "i32" => Self::I32,
            "i64" => Self::I64,
            other => {
                let sized = |prefix: &str| {
                    other
                        .strip_prefix(prefix)
                        .and_then(|len| len.parse::<usize>().ok())
                };
                if let Some(len) = sized("str") {
                    Self::Str(len)
                } else if let Some(len) = sized("bytes") {
                    Self::Bytes(len)
                } else {
                    return Err(DescriptorError::UnknownType(s.trim().to_string()));
                }
            }
        };
        Ok(parsed)
    }
}

impl TryFrom<String> for FieldType {
    type Error = DescriptorError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::U8 => f.write_str("u8"),
            Self::U16 => f.write_str("u16"),
            Self::U32 => f.write_str("u32"),
            Self::U64 => f.write_str("u64"),
            Self::I8 => f.write_str("i8"),
            Self::I16 => f.write_str("i16"),
            Self::I32 => f.write_str("i32"),
            Self::I64 => f.write_str("i64"),
            Self::Str(len) => write!(f, "str{}", len),
            Self::Bytes(len) => write!(f, "bytes{}", len),
        }
    }
}

/// One named field of a record
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: FieldType,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, ty: FieldType) -> Self {
        Self {
            name: name.into(),
            ty,
        }
    }

    pub fn width(&self) -> usize {
        self.ty.width()
    }
}

/// Ordered field layout of every record a probe emits
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordSchema {
    fields: Vec<FieldSpec>,
}

impl RecordSchema {
    /// Validate and build a schema
    ///
    /// Fields must be non-empty, uniquely named and have a non-zero width.
    /// The whole record must fit in one channel slot.
    pub fn new(fields: Vec<FieldSpec>) -> Result<Self, DescriptorError> {
        if fields.is_empty() {
            return Err(DescriptorError::EmptySchema);
        }

        let max = kprobe_common::MAX_SLOT_SIZE;
        let mut seen = HashSet::new();
        let mut width = 0usize;
        for field in &fields {
            if field.width() == 0 {
                return Err(DescriptorError::ZeroWidth(field.name.clone()));
            }
            if !seen.insert(field.name.as_str()) {
                return Err(DescriptorError::DuplicateField(field.name.clone()));
            }
            width = width
                .checked_add(field.width())
                .filter(|total| *total <= max)
                .ok_or(DescriptorError::RecordTooWide {
                    width: width.saturating_add(field.width()),
                    max,
                })?;
        }

        Ok(Self { fields })
    }

    /// Parse `name:type` pairs separated by commas, e.g. `pid:u32,comm:str16`
    pub fn parse(spec: &str) -> Result<Self, DescriptorError> {
        let fields = spec
            .split(',')
            .map(str::trim)
            .filter(|decl| !decl.is_empty())
            .map(|decl| {
                let (name, ty) = decl
                    .split_once(':')
                    .ok_or_else(|| DescriptorError::InvalidField(decl.to_string()))?;
                let name = name.trim();
                if name.is_empty() {
                    return Err(DescriptorError::InvalidField(decl.to_string()));
                }
                Ok(FieldSpec::new(name, ty.parse()?))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Self::new(fields)
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    /// Sum of all field widths; a well-formed record has exactly this length
    ///
    /// Never more than `MAX_SLOT_SIZE`.
    pub fn total_width(&self) -> usize {
        self.fields.iter().map(FieldSpec::width).sum()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.iter().any(|field| field.name == name)
    }
}

impl fmt::Display for RecordSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, field) in self.fields.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}:{}", field.name, field.ty)?;
        }
        Ok(())
    }
}

/// What to instrument and how its records are laid out
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeDescriptor {
    target_symbol: String,
    schema: RecordSchema,
}

impl ProbeDescriptor {
    pub fn new(
        target_symbol: impl Into<String>,
        schema: RecordSchema,
    ) -> Result<Self, DescriptorError> {
        let target_symbol = target_symbol.into().trim().to_string();
        if target_symbol.is_empty() {
            return Err(DescriptorError::EmptySymbol);
        }

        Ok(Self {
            target_symbol,
            schema,
        })
    }

    pub fn target_symbol(&self) -> &str {
        &self.target_symbol
    }

    pub fn schema(&self) -> &RecordSchema {
        &self.schema
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_schema() {
        let schema = RecordSchema::parse("pid:u32, tgid:u32, ts_ns:u64, comm:str16").unwrap();

        assert_eq!(schema.fields().len(), 4);
        assert_eq!(schema.fields()[3], FieldSpec::new("comm", FieldType::Str(16)));
        assert_eq!(schema.total_width(), 32);
        assert_eq!(schema.to_string(), "pid:u32,tgid:u32,ts_ns:u64,comm:str16");
    }

    #[test]
    fn test_schema_matches_open_event_layout() {
        let schema = RecordSchema::parse(kprobe_common::OpenEvent::SCHEMA).unwrap();
        assert_eq!(schema.total_width(), kprobe_common::OpenEvent::SIZE);
    }

    #[test]
    fn test_rejects_invalid_schemas() {
        assert_eq!(RecordSchema::parse(""), Err(DescriptorError::EmptySchema));
        assert_eq!(
            RecordSchema::parse("pid"),
            Err(DescriptorError::InvalidField("pid".to_string()))
        );
        assert_eq!(
            RecordSchema::parse("pid:f32"),
            Err(DescriptorError::UnknownType("f32".to_string()))
        );
        assert_eq!(
            RecordSchema::parse("comm:str0"),
            Err(DescriptorError::ZeroWidth("comm".to_string()))
        );
        assert_eq!(
            RecordSchema::parse("pid:u32,pid:u64"),
            Err(DescriptorError::DuplicateField("pid".to_string()))
        );
    }

    #[test]
    fn test_descriptor_requires_symbol() {
        let schema = RecordSchema::parse("pid:u32").unwrap();
        assert_eq!(
            ProbeDescriptor::new("  ", schema.clone()),
            Err(DescriptorError::EmptySymbol)
        );

        let descriptor = ProbeDescriptor::new("do_sys_openat2", schema).unwrap();
        assert_eq!(descriptor.target_symbol(), "do_sys_openat2");
    }

    #[test]
    fn test_field_spec_from_json() {
        let fields: Vec<FieldSpec> =
            serde_json::from_str(r#"[{"name":"pid","type":"u32"},{"name":"raw","type":"bytes8"}]"#)
                .unwrap();

        assert_eq!(fields[0].ty, FieldType::U32);
        assert_eq!(fields[1].ty, FieldType::Bytes(8));
    }

    #[test]
    fn test_rejects_records_wider_than_a_slot() {
        assert_eq!(
            RecordSchema::parse("a:str18446744073709551615,b:str2"),
            Err(DescriptorError::RecordTooWide {
                width: usize::MAX,
                max: kprobe_common::MAX_SLOT_SIZE,
            })
        );
        assert_eq!(
            RecordSchema::parse("msg:str4096,pid:u8"),
            Err(DescriptorError::RecordTooWide {
                width: 4097,
                max: 4096,
            })
        );

        let widest = RecordSchema::parse("msg:str4088,ts_ns:u64").unwrap();
        assert_eq!(widest.total_width(), kprobe_common::MAX_SLOT_SIZE);
    }
}
