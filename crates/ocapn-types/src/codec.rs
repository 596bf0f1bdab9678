//! Codec interface shared by Syrup and CBOR, plus the generic value walk.
//!
//! A [`ValueWriter`] emits atoms and brackets composites with `enter_*` /
//! `exit_*` calls. A [`ValueReader`] mirrors that and adds
//! [`ValueReader::peek_type_hint`] so a decoder can dispatch on the next
//! value without backtracking. [`read_value`] and [`write_value`] walk a
//! whole [`Value`] through either codec and enforce dictionary key order.

use crate::cbor::{CborReader, CborWriter};
use crate::error::{CodecError, CodecResult};
use crate::integer::{Integer, MAX_MAGNITUDE_BYTES};
use crate::syrup::{SyrupReader, SyrupWriter};
use crate::value::{Label, Record, Value};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// A composite kind tracked on codec stacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Structure {
    List,
    Set,
    Dictionary,
    Record,
}

impl fmt::Display for Structure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::List => "list",
            Self::Set => "set",
            Self::Dictionary => "dictionary",
            Self::Record => "record",
        };
        f.write_str(name)
    }
}

/// Coarse category of the next value in the input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeHint {
    /// An atom that must be read with `read_type_and_maybe_value`
    /// (integer, string, bytestring or selector).
    NumberPrefix,
    Boolean,
    Float64,
    List,
    Set,
    Dictionary,
    Record,
}

/// Result of [`ValueReader::read_type_and_maybe_value`].
///
/// Atoms carry their value. Composites carry only their kind and the reader
/// is left in front of the opener, ready for the matching `enter_*` call.
#[derive(Debug, Clone, PartialEq)]
pub enum TypeAndValue {
    Boolean(bool),
    Integer(Integer),
    Float64(f64),
    String(String),
    Bytes(Vec<u8>),
    Selector(String),
    Composite(Structure),
}

impl TypeAndValue {
    pub fn type_name(&self) -> String {
        match self {
            Self::Boolean(_) => "boolean".into(),
            Self::Integer(_) => "integer".into(),
            Self::Float64(_) => "float64".into(),
            Self::String(_) => "string".into(),
            Self::Bytes(_) => "bytestring".into(),
            Self::Selector(_) => "selector".into(),
            Self::Composite(s) => s.to_string(),
        }
    }
}

/// Streaming encoder.
///
/// Element counts passed to `enter_*` are required by CBOR (definite-length
/// heads) and ignored by Syrup.
pub trait ValueWriter {
    /// Codec name used in errors.
    fn name(&self) -> &'static str;
    fn index(&self) -> usize;

    fn write_boolean(&mut self, value: bool) -> CodecResult<()>;
    fn write_integer(&mut self, value: &Integer) -> CodecResult<()>;
    fn write_float64(&mut self, value: f64) -> CodecResult<()>;
    fn write_string(&mut self, value: &str) -> CodecResult<()>;
    fn write_bytestring(&mut self, value: &[u8]) -> CodecResult<()>;
    fn write_selector_from_string(&mut self, value: &str) -> CodecResult<()>;
    /// Write the label of the record just entered.
    fn write_record_label(&mut self, label: &Label) -> CodecResult<()>;

    /// Open a composite of `len` elements: items, key/value pairs, or
    /// record fields excluding the label.
    fn enter_structure(&mut self, kind: Structure, len: usize) -> CodecResult<()>;
    fn exit_structure(&mut self, kind: Structure) -> CodecResult<()>;

    /// Canonical standalone encoding of a dictionary key in this codec.
    fn key_bytes(&self, key: &Value) -> CodecResult<Vec<u8>>;

    fn enter_list(&mut self, len: usize) -> CodecResult<()> {
        self.enter_structure(Structure::List, len)
    }
    fn exit_list(&mut self) -> CodecResult<()> {
        self.exit_structure(Structure::List)
    }
    fn enter_set(&mut self, len: usize) -> CodecResult<()> {
        self.enter_structure(Structure::Set, len)
    }
    fn exit_set(&mut self) -> CodecResult<()> {
        self.exit_structure(Structure::Set)
    }
    fn enter_dictionary(&mut self, pairs: usize) -> CodecResult<()> {
        self.enter_structure(Structure::Dictionary, pairs)
    }
    fn exit_dictionary(&mut self) -> CodecResult<()> {
        self.exit_structure(Structure::Dictionary)
    }
    fn enter_record(&mut self, fields: usize) -> CodecResult<()> {
        self.enter_structure(Structure::Record, fields)
    }
    fn exit_record(&mut self) -> CodecResult<()> {
        self.exit_structure(Structure::Record)
    }
}

/// Streaming decoder.
pub trait ValueReader {
    fn name(&self) -> &'static str;
    fn index(&self) -> usize;
    fn is_at_end(&self) -> bool;
    /// Raw input between two offsets already read.
    fn slice(&self, start: usize, end: usize) -> &[u8];

    fn peek_type_hint(&self) -> CodecResult<TypeHint>;
    fn read_type_and_maybe_value(&mut self) -> CodecResult<TypeAndValue>;
    fn read_record_label(&mut self) -> CodecResult<Label>;

    fn enter_structure(&mut self, kind: Structure) -> CodecResult<()>;
    fn exit_structure(&mut self, kind: Structure) -> CodecResult<()>;
    /// True when the innermost open `kind` has no elements left.
    fn peek_structure_end(&self, kind: Structure) -> CodecResult<bool>;

    /// Read the next atom, failing unless `pick` accepts it.
    fn read_expected<T>(
        &mut self,
        expected: &str,
        pick: impl FnOnce(TypeAndValue) -> Result<T, TypeAndValue>,
    ) -> CodecResult<T>
    where
        Self: Sized,
    {
        let start = self.index();
        let found = self.read_type_and_maybe_value()?;
        pick(found).map_err(|found| CodecError::UnexpectedType {
            offset: start,
            codec: self.name(),
            found: found.type_name(),
            expected: expected.to_string(),
        })
    }

    fn read_boolean(&mut self) -> CodecResult<bool>
    where
        Self: Sized,
    {
        self.read_expected("boolean", |t| match t {
            TypeAndValue::Boolean(b) => Ok(b),
            other => Err(other),
        })
    }

    fn read_integer(&mut self) -> CodecResult<Integer>
    where
        Self: Sized,
    {
        self.read_expected("integer", |t| match t {
            TypeAndValue::Integer(i) => Ok(i),
            other => Err(other),
        })
    }

    fn read_float64(&mut self) -> CodecResult<f64>
    where
        Self: Sized,
    {
        self.read_expected("float64", |t| match t {
            TypeAndValue::Float64(f) => Ok(f),
            other => Err(other),
        })
    }

    fn read_string(&mut self) -> CodecResult<String>
    where
        Self: Sized,
    {
        self.read_expected("string", |t| match t {
            TypeAndValue::String(s) => Ok(s),
            other => Err(other),
        })
    }

    fn read_bytestring(&mut self) -> CodecResult<Vec<u8>>
    where
        Self: Sized,
    {
        self.read_expected("bytestring", |t| match t {
            TypeAndValue::Bytes(b) => Ok(b),
            other => Err(other),
        })
    }

    fn read_selector_as_string(&mut self) -> CodecResult<String>
    where
        Self: Sized,
    {
        self.read_expected("selector", |t| match t {
            TypeAndValue::Selector(s) => Ok(s),
            other => Err(other),
        })
    }

    fn enter_list(&mut self) -> CodecResult<()> {
        self.enter_structure(Structure::List)
    }
    fn exit_list(&mut self) -> CodecResult<()> {
        self.exit_structure(Structure::List)
    }
    fn peek_list_end(&self) -> CodecResult<bool> {
        self.peek_structure_end(Structure::List)
    }
    fn enter_set(&mut self) -> CodecResult<()> {
        self.enter_structure(Structure::Set)
    }
    fn exit_set(&mut self) -> CodecResult<()> {
        self.exit_structure(Structure::Set)
    }
    fn peek_set_end(&self) -> CodecResult<bool> {
        self.peek_structure_end(Structure::Set)
    }
    fn enter_dictionary(&mut self) -> CodecResult<()> {
        self.enter_structure(Structure::Dictionary)
    }
    fn exit_dictionary(&mut self) -> CodecResult<()> {
        self.exit_structure(Structure::Dictionary)
    }
    fn peek_dictionary_end(&self) -> CodecResult<bool> {
        self.peek_structure_end(Structure::Dictionary)
    }
    fn enter_record(&mut self) -> CodecResult<()> {
        self.enter_structure(Structure::Record)
    }
    fn exit_record(&mut self) -> CodecResult<()> {
        self.exit_structure(Structure::Record)
    }
    fn peek_record_end(&self) -> CodecResult<bool> {
        self.peek_structure_end(Structure::Record)
    }
}

/// Deepest composite nesting either codec will encode or decode.
pub const MAX_DEPTH: usize = 128;

/// Bytewise lexicographic comparison, shorter prefix first.
pub fn compare_bytes(a: &[u8], b: &[u8]) -> Ordering {
    a.cmp(b)
}

fn write_key<W: ValueWriter + ?Sized>(writer: &mut W, key: &Value) -> CodecResult<()> {
    match key {
        Value::String(s) => writer.write_string(s),
        Value::Symbol(s) => writer.write_selector_from_string(s),
        other => Err(CodecError::Encode {
            codec: writer.name(),
            message: format!(
                "dictionary keys must be strings or selectors, got {}",
                other.type_name()
            ),
        }),
    }
}

/// Encode one value, sorting and de-duplicating dictionary keys.
pub fn write_value<W: ValueWriter + ?Sized>(writer: &mut W, value: &Value) -> CodecResult<()> {
    write_nested(writer, value, 0)
}

fn write_nested<W: ValueWriter + ?Sized>(
    writer: &mut W,
    value: &Value,
    depth: usize,
) -> CodecResult<()> {
    let inner = depth + 1;
    if inner > MAX_DEPTH && value.is_composite() {
        return Err(CodecError::Encode {
            codec: writer.name(),
            message: format!("nesting deeper than {MAX_DEPTH}"),
        });
    }
    match value {
        Value::Boolean(b) => writer.write_boolean(*b),
        Value::Integer(i) if i.magnitude().len() > MAX_MAGNITUDE_BYTES => Err(CodecError::Encode {
            codec: writer.name(),
            message: format!("integer larger than {MAX_MAGNITUDE_BYTES} bytes"),
        }),
        Value::Integer(i) => writer.write_integer(i),
        Value::Float64(f) => writer.write_float64(*f),
        Value::String(s) => writer.write_string(s),
        Value::Bytes(b) => writer.write_bytestring(b),
        Value::Symbol(s) => writer.write_selector_from_string(s),
        Value::List(items) => {
            writer.enter_list(items.len())?;
            for item in items {
                write_nested(writer, item, inner)?;
            }
            writer.exit_list()
        }
        Value::Set(items) => {
            writer.enter_set(items.len())?;
            for item in items {
                write_nested(writer, item, inner)?;
            }
            writer.exit_set()
        }
        Value::Dictionary(entries) => {
            let mut keyed = Vec::with_capacity(entries.len());
            for (key, entry) in entries {
                keyed.push((writer.key_bytes(key)?, key, entry));
            }
            // Stable sort, then keep the last of each run of equal keys.
            keyed.sort_by(|a, b| compare_bytes(&a.0, &b.0));
            let mut unique: Vec<(Vec<u8>, &Value, &Value)> = Vec::with_capacity(keyed.len());
            for item in keyed {
                match unique.last_mut() {
                    Some(last) if last.0 == item.0 => *last = item,
                    _ => unique.push(item),
                }
            }
            writer.enter_dictionary(unique.len())?;
            for (_, key, entry) in unique {
                write_key(writer, key)?;
                write_nested(writer, entry, inner)?;
            }
            writer.exit_dictionary()
        }
        Value::Record(record) => {
            writer.enter_record(record.fields.len())?;
            writer.write_record_label(&record.label)?;
            for field in &record.fields {
                write_nested(writer, field, inner)?;
            }
            writer.exit_record()
        }
    }
}

/// Encode a dictionary key on its own, for use by [`ValueWriter::key_bytes`].
pub(crate) fn standalone_key<W: ValueWriter>(mut writer: W, key: &Value) -> CodecResult<W> {
    write_key(&mut writer, key)?;
    Ok(writer)
}

fn read_key<R: ValueReader + ?Sized>(reader: &mut R) -> CodecResult<Value> {
    let start = reader.index();
    match reader.read_type_and_maybe_value()? {
        TypeAndValue::String(s) => Ok(Value::String(s)),
        TypeAndValue::Selector(s) => Ok(Value::Symbol(s)),
        other => Err(CodecError::UnexpectedType {
            offset: start,
            codec: reader.name(),
            found: other.type_name(),
            expected: "a string or selector dictionary key".into(),
        }),
    }
}

/// Decode one value. Rejects unsorted or repeated dictionary keys, and
/// composites nested deeper than [`MAX_DEPTH`].
pub fn read_value<R: ValueReader + ?Sized>(reader: &mut R) -> CodecResult<Value> {
    read_nested(reader, 0)
}

fn read_nested<R: ValueReader + ?Sized>(reader: &mut R, depth: usize) -> CodecResult<Value> {
    let hint = reader.peek_type_hint()?;
    let inner = depth + 1;
    let composite = matches!(
        hint,
        TypeHint::List | TypeHint::Set | TypeHint::Dictionary | TypeHint::Record
    );
    if composite && inner > MAX_DEPTH {
        return Err(CodecError::Structure {
            offset: reader.index(),
            codec: reader.name(),
            message: format!("nesting deeper than {MAX_DEPTH}"),
        });
    }
    match hint {
        TypeHint::List => {
            reader.enter_list()?;
            let mut items = Vec::new();
            while !reader.peek_list_end()? {
                items.push(read_nested(reader, inner)?);
            }
            reader.exit_list()?;
            Ok(Value::List(items))
        }
        TypeHint::Set => {
            reader.enter_set()?;
            let mut items = Vec::new();
            while !reader.peek_set_end()? {
                items.push(read_nested(reader, inner)?);
            }
            reader.exit_set()?;
            Ok(Value::Set(items))
        }
        TypeHint::Dictionary => {
            reader.enter_dictionary()?;
            let mut entries = Vec::new();
            let mut prior: Option<Vec<u8>> = None;
            while !reader.peek_dictionary_end()? {
                let start = reader.index();
                let key = read_key(reader)?;
                let key_bytes = reader.slice(start, reader.index()).to_vec();
                if let Some(prior) = &prior {
                    match compare_bytes(prior, &key_bytes) {
                        Ordering::Equal => {
                            return Err(CodecError::NonCanonical {
                                offset: start,
                                codec: reader.name(),
                                what: format!("dictionary, repeated key {key}"),
                            })
                        }
                        Ordering::Greater => {
                            return Err(CodecError::NonCanonical {
                                offset: start,
                                codec: reader.name(),
                                what: format!("dictionary, key {key} out of order"),
                            })
                        }
                        Ordering::Less => {}
                    }
                }
                prior = Some(key_bytes);
                let entry = read_nested(reader, inner)?;
                entries.push((key, entry));
            }
            reader.exit_dictionary()?;
            Ok(Value::Dictionary(entries))
        }
        TypeHint::Record => {
            reader.enter_record()?;
            let label = reader.read_record_label()?;
            let mut fields = Vec::new();
            while !reader.peek_record_end()? {
                fields.push(read_nested(reader, inner)?);
            }
            reader.exit_record()?;
            Ok(Value::Record(Record { label, fields }))
        }
        TypeHint::NumberPrefix | TypeHint::Boolean | TypeHint::Float64 => {
            let start = reader.index();
            match reader.read_type_and_maybe_value()? {
                TypeAndValue::Boolean(b) => Ok(Value::Boolean(b)),
                TypeAndValue::Integer(i) => Ok(Value::Integer(i)),
                TypeAndValue::Float64(f) => Ok(Value::Float64(f)),
                TypeAndValue::String(s) => Ok(Value::String(s)),
                TypeAndValue::Bytes(b) => Ok(Value::Bytes(b)),
                TypeAndValue::Selector(s) => Ok(Value::Symbol(s)),
                TypeAndValue::Composite(kind) => Err(CodecError::Structure {
                    offset: start,
                    codec: reader.name(),
                    message: format!("type hint disagrees with {kind} opener"),
                }),
            }
        }
    }
}

/// Which canonical encoding a session speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    #[default]
    Syrup,
    Cbor,
}

impl Encoding {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Syrup => "syrup",
            Self::Cbor => "cbor",
        }
    }

    pub fn encode(&self, value: &Value) -> CodecResult<Vec<u8>> {
        match self {
            Self::Syrup => {
                let mut writer = SyrupWriter::new();
                write_value(&mut writer, value)?;
                writer.into_bytes()
            }
            Self::Cbor => {
                let mut writer = CborWriter::new();
                write_value(&mut writer, value)?;
                writer.into_bytes()
            }
        }
    }

    /// Decode exactly one value spanning all of `bytes`.
    pub fn decode(&self, bytes: &[u8]) -> CodecResult<Value> {
        let (value, used) = self.decode_prefix(bytes)?;
        if used != bytes.len() {
            return Err(CodecError::Malformed {
                offset: used,
                codec: self.name(),
                message: format!("{} trailing bytes after value", bytes.len() - used),
            });
        }
        Ok(value)
    }

    /// Decode the first value in `bytes`, returning it and the bytes consumed.
    ///
    /// A truncated value yields an error for which
    /// [`CodecError::is_truncated`] is true.
    pub fn decode_prefix(&self, bytes: &[u8]) -> CodecResult<(Value, usize)> {
        match self {
            Self::Syrup => {
                let mut reader = SyrupReader::new(bytes);
                let value = read_value(&mut reader)?;
                Ok((value, reader.index()))
            }
            Self::Cbor => {
                let mut reader = CborReader::new(bytes);
                let value = read_value(&mut reader)?;
                Ok((value, reader.index()))
            }
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
