//! CBOR: the binary canonical encoding.
//!
//! A deterministic subset of RFC 8949:
//! - heads always use the shortest argument form, indefinite lengths are rejected
//! - integers are always bignums: tag 2 (non-negative) or tag 3 (`-1 - n`)
//!   wrapping a minimal big-endian byte string
//! - floats are always 64-bit (`0xFB`)
//! - selectors are tag 280 around a text string
//! - records are tag 27 around a definite array whose first element is the label
//! - sets are plain arrays
//!
//! Composite heads carry their element count, so the writer needs counts up
//! front and both sides track the remaining elements of every open structure.

use crate::buffer::{BufferReader, BufferWriter};
use crate::codec::{standalone_key, Structure, TypeAndValue, TypeHint, ValueReader, ValueWriter};
use crate::error::{CodecError, CodecResult};
use crate::frame::Token;
use crate::integer::{decrement, increment, Integer, MAX_MAGNITUDE_BYTES};
use crate::value::{canonical_f64, Label, Value, CANONICAL_NAN_BITS};

const NAME: &str = "cbor";

const MAJOR_UNSIGNED: u8 = 0;
const MAJOR_NEGATIVE: u8 = 1;
const MAJOR_BYTES: u8 = 2;
const MAJOR_TEXT: u8 = 3;
const MAJOR_ARRAY: u8 = 4;
const MAJOR_MAP: u8 = 5;
const MAJOR_TAG: u8 = 6;
const MAJOR_SIMPLE: u8 = 7;

const TAG_RECORD: u64 = 27;
const TAG_POSITIVE_BIGNUM: u64 = 2;
const TAG_NEGATIVE_BIGNUM: u64 = 3;
const TAG_SYMBOL: u64 = 280;

const FALSE: u8 = 0xf4;
const TRUE: u8 = 0xf5;
const NULL: u8 = 0xf6;
const UNDEFINED: u8 = 0xf7;
const FLOAT16: u8 = 0xf9;
const FLOAT32: u8 = 0xfa;
const FLOAT64: u8 = 0xfb;

fn write_head(buffer: &mut BufferWriter, major: u8, arg: u64) {
    let m = major << 5;
    if arg < 24 {
        buffer.write_byte(m | arg as u8);
    } else if arg <= 0xff {
        buffer.write_byte(m | 24);
        buffer.write_byte(arg as u8);
    } else if arg <= 0xffff {
        buffer.write_byte(m | 25);
        buffer.write(&(arg as u16).to_be_bytes());
    } else if arg <= 0xffff_ffff {
        buffer.write_byte(m | 26);
        buffer.write(&(arg as u32).to_be_bytes());
    } else {
        buffer.write_byte(m | 27);
        buffer.write(&arg.to_be_bytes());
    }
}

#[derive(Debug, Clone, Copy)]
struct Frame {
    kind: Structure,
    remaining: u64,
    start: usize,
}

/// CBOR encoder.
#[derive(Debug, Default)]
pub struct CborWriter {
    buffer: BufferWriter,
    stack: Vec<Frame>,
}

impl CborWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Finish, failing if a structure was left open.
    pub fn into_bytes(self) -> CodecResult<Vec<u8>> {
        if let Some(open) = self.stack.last() {
            return Err(self.encode_error(format!(
                "{} opened at {} left open with {} elements missing",
                open.kind, open.start, open.remaining
            )));
        }
        Ok(self.buffer.into_bytes())
    }

    fn encode_error(&self, message: String) -> CodecError {
        CodecError::Encode {
            codec: NAME,
            message,
        }
    }

    /// Account for one element in the enclosing structure.
    fn count_element(&mut self) -> CodecResult<()> {
        if let Some(frame) = self.stack.last_mut() {
            if frame.remaining == 0 {
                let kind = frame.kind;
                return Err(self.encode_error(format!(
                    "more elements written to {kind} than declared"
                )));
            }
            frame.remaining -= 1;
        }
        Ok(())
    }

    fn open(&mut self, kind: Structure, major: u8, len: u64, elements: u64) -> CodecResult<()> {
        self.count_element()?;
        let start = self.buffer.index();
        write_head(&mut self.buffer, major, len);
        self.stack.push(Frame {
            kind,
            remaining: elements,
            start,
        });
        Ok(())
    }

    fn write_text(&mut self, value: &str) {
        write_head(&mut self.buffer, MAJOR_TEXT, value.len() as u64);
        self.buffer.write(value.as_bytes());
    }

    fn write_bytes(&mut self, value: &[u8]) {
        write_head(&mut self.buffer, MAJOR_BYTES, value.len() as u64);
        self.buffer.write(value);
    }
}

impl ValueWriter for CborWriter {
    fn name(&self) -> &'static str {
        NAME
    }

    fn index(&self) -> usize {
        self.buffer.index()
    }

    fn write_boolean(&mut self, value: bool) -> CodecResult<()> {
        self.count_element()?;
        self.buffer.write_byte(if value { TRUE } else { FALSE });
        Ok(())
    }

    fn write_integer(&mut self, value: &Integer) -> CodecResult<()> {
        self.count_element()?;
        if value.is_negative() {
            write_head(&mut self.buffer, MAJOR_TAG, TAG_NEGATIVE_BIGNUM);
            self.write_bytes(&decrement(value.magnitude()));
        } else {
            write_head(&mut self.buffer, MAJOR_TAG, TAG_POSITIVE_BIGNUM);
            self.write_bytes(value.magnitude());
        }
        Ok(())
    }

    fn write_float64(&mut self, value: f64) -> CodecResult<()> {
        self.count_element()?;
        self.buffer.write_byte(FLOAT64);
        self.buffer.write_f64_be(canonical_f64(value));
        Ok(())
    }

    fn write_string(&mut self, value: &str) -> CodecResult<()> {
        self.count_element()?;
        self.write_text(value);
        Ok(())
    }

    fn write_bytestring(&mut self, value: &[u8]) -> CodecResult<()> {
        self.count_element()?;
        self.write_bytes(value);
        Ok(())
    }

    fn write_selector_from_string(&mut self, value: &str) -> CodecResult<()> {
        self.count_element()?;
        write_head(&mut self.buffer, MAJOR_TAG, TAG_SYMBOL);
        self.write_text(value);
        Ok(())
    }

    /// Record labels are plain text strings in CBOR, whatever their kind.
    fn write_record_label(&mut self, label: &Label) -> CodecResult<()> {
        match label {
            Label::Symbol(s) | Label::String(s) => self.write_string(s),
            Label::Bytes(b) => self.write_bytestring(b),
        }
    }

    fn enter_structure(&mut self, kind: Structure, len: usize) -> CodecResult<()> {
        let len = len as u64;
        match kind {
            Structure::List | Structure::Set => self.open(kind, MAJOR_ARRAY, len, len),
            Structure::Dictionary => self.open(kind, MAJOR_MAP, len, len * 2),
            Structure::Record => {
                // Tag 27 wraps an array of the label then the fields.
                self.count_element()?;
                let start = self.buffer.index();
                write_head(&mut self.buffer, MAJOR_TAG, TAG_RECORD);
                write_head(&mut self.buffer, MAJOR_ARRAY, len + 1);
                self.stack.push(Frame {
                    kind,
                    remaining: len + 1,
                    start,
                });
                Ok(())
            }
        }
    }

    fn exit_structure(&mut self, kind: Structure) -> CodecResult<()> {
        match self.stack.last() {
            Some(frame) if frame.kind == kind && frame.remaining == 0 => {
                self.stack.pop();
                Ok(())
            }
            Some(frame) if frame.kind == kind => Err(self.encode_error(format!(
                "exiting {kind} with {} elements still declared",
                frame.remaining
            ))),
            Some(frame) => Err(self.encode_error(format!(
                "attempted to exit {kind} while in a {}",
                frame.kind
            ))),
            None => Err(self.encode_error(format!(
                "attempted to exit {kind} without entering it"
            ))),
        }
    }

    fn key_bytes(&self, key: &Value) -> CodecResult<Vec<u8>> {
        standalone_key(CborWriter::new(), key)?.into_bytes()
    }
}

/// Encode a value as CBOR.
pub fn encode_cbor(value: &Value) -> CodecResult<Vec<u8>> {
    let mut writer = CborWriter::new();
    crate::codec::write_value(&mut writer, value)?;
    writer.into_bytes()
}

/// Decode a single CBOR value spanning all of `bytes`.
pub fn decode_cbor(bytes: &[u8]) -> CodecResult<Value> {
    crate::codec::Encoding::Cbor.decode(bytes)
}

/// Size of the token at the front of `rest`, without validating it.
pub(crate) fn next_token(rest: &[u8]) -> Token {
    let Some(&byte) = rest.first() else {
        return Token::Need;
    };
    let info = byte & 0x1f;
    let head = match info {
        0..=23 => 1,
        24 => 2,
        25 => 3,
        26 => 5,
        27 => 9,
        _ => return Token::Bad,
    };
    if rest.len() < head {
        return Token::Need;
    }
    let arg = if info < 24 {
        u64::from(info)
    } else {
        rest[1..head].iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b))
    };
    match byte >> 5 {
        MAJOR_BYTES | MAJOR_TEXT => {
            match usize::try_from(arg).ok().and_then(|len| len.checked_add(head)) {
                Some(total) if rest.len() < total => Token::Need,
                Some(total) => Token::Atom(total),
                None => Token::Bad,
            }
        }
        MAJOR_ARRAY | MAJOR_MAP if arg == 0 => Token::Atom(head),
        MAJOR_ARRAY => Token::Open { len: head, owed: arg },
        MAJOR_MAP => Token::Open {
            len: head,
            owed: arg.saturating_mul(2),
        },
        MAJOR_TAG => Token::Prefix(head),
        _ => Token::Atom(head),
    }
}

/// CBOR decoder over a borrowed buffer.
#[derive(Debug)]
pub struct CborReader<'a> {
    buffer: BufferReader<'a>,
    stack: Vec<Frame>,
}

impl<'a> CborReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self {
            buffer: BufferReader::new(bytes, NAME),
            stack: Vec::new(),
        }
    }

    fn malformed(&self, offset: usize, message: impl Into<String>) -> CodecError {
        CodecError::Malformed {
            offset,
            codec: NAME,
            message: message.into(),
        }
    }

    fn non_canonical(&self, offset: usize, what: impl Into<String>) -> CodecError {
        CodecError::NonCanonical {
            offset,
            codec: NAME,
            what: what.into(),
        }
    }

    fn structure_error(&self, offset: usize, message: String) -> CodecError {
        CodecError::Structure {
            offset,
            codec: NAME,
            message,
        }
    }

    /// Read a head for majors 0..=6, enforcing the shortest form.
    fn read_head(&mut self) -> CodecResult<(u8, u64)> {
        let start = self.buffer.index();
        let byte = self.buffer.read_byte()?;
        let major = byte >> 5;
        let info = byte & 0x1f;
        let (arg, min) = match info {
            0..=23 => (u64::from(info), 0),
            24 => (self.buffer.read_u64_be(1)?, 24),
            25 => (self.buffer.read_u64_be(2)?, 0x100),
            26 => (self.buffer.read_u64_be(4)?, 0x1_0000),
            27 => (self.buffer.read_u64_be(8)?, 0x1_0000_0000),
            31 => return Err(self.malformed(start, "indefinite-length items are not supported")),
            _ => return Err(self.malformed(start, format!("reserved additional info {info}"))),
        };
        if arg < min {
            return Err(self.non_canonical(start, "head (not shortest form)"));
        }
        Ok((major, arg))
    }

    fn peek_head(&self) -> CodecResult<(u8, u64)> {
        let mut lookahead = CborReader {
            buffer: self.buffer.clone(),
            stack: Vec::new(),
        };
        lookahead.read_head()
    }

    fn read_expected_head(&mut self, major: u8, what: &str) -> CodecResult<u64> {
        let start = self.buffer.index();
        let (found, arg) = self.read_head()?;
        if found != major {
            return Err(CodecError::UnexpectedType {
                offset: start,
                codec: NAME,
                found: format!("major type {found}"),
                expected: what.to_string(),
            });
        }
        Ok(arg)
    }

    fn read_len(&mut self, major: u8, what: &str) -> CodecResult<usize> {
        let start = self.buffer.index();
        let arg = self.read_expected_head(major, what)?;
        usize::try_from(arg).map_err(|_| self.malformed(start, "length does not fit in memory"))
    }

    /// Count one element against the innermost open structure.
    fn take_element(&mut self) -> CodecResult<()> {
        let offset = self.buffer.index();
        if let Some(frame) = self.stack.last_mut() {
            if frame.remaining == 0 {
                let kind = frame.kind;
                return Err(self.structure_error(
                    offset,
                    format!("read past the declared end of {kind}"),
                ));
            }
            frame.remaining -= 1;
        }
        Ok(())
    }

    fn read_text_body(&mut self) -> CodecResult<String> {
        let len = self.read_len(MAJOR_TEXT, "text string")?;
        let start = self.buffer.index();
        let raw = self.buffer.read(len)?;
        std::str::from_utf8(raw)
            .map(str::to_string)
            .map_err(|_| CodecError::InvalidUtf8 {
                offset: start,
                codec: NAME,
            })
    }

    fn read_bignum_body(&mut self, tag: u64) -> CodecResult<Integer> {
        let len = self.read_len(MAJOR_BYTES, "bignum byte string")?;
        let start = self.buffer.index();
        if len > MAX_MAGNITUDE_BYTES {
            return Err(self.malformed(
                start,
                format!("integer larger than {MAX_MAGNITUDE_BYTES} bytes"),
            ));
        }
        let payload = self.buffer.read(len)?;
        if payload.first() == Some(&0) {
            return Err(self.non_canonical(start, "bignum with leading zero byte"));
        }
        let integer = if tag == TAG_NEGATIVE_BIGNUM {
            Integer::from_sign_magnitude(true, &increment(payload))
        } else {
            Integer::from_sign_magnitude(false, payload)
        };
        if integer.magnitude().len() > MAX_MAGNITUDE_BYTES {
            return Err(self.malformed(
                start,
                format!("integer larger than {MAX_MAGNITUDE_BYTES} bytes"),
            ));
        }
        Ok(integer)
    }

    fn read_float64_body(&mut self) -> CodecResult<f64> {
        let start = self.buffer.index();
        let value = self.buffer.read_f64_be()?;
        if value == 0.0 && value.to_bits() != 0 {
            return Err(self.non_canonical(start, "zero"));
        }
        if value.is_nan() && value.to_bits() != CANONICAL_NAN_BITS {
            return Err(self.non_canonical(start, "NaN"));
        }
        Ok(value)
    }

    fn enter_array(&mut self, kind: Structure) -> CodecResult<()> {
        self.take_element()?;
        let start = self.buffer.index();
        let len = self.read_expected_head(MAJOR_ARRAY, "array")?;
        self.stack.push(Frame {
            kind,
            remaining: len,
            start,
        });
        Ok(())
    }
}

impl ValueReader for CborReader<'_> {
    fn name(&self) -> &'static str {
        NAME
    }

    fn index(&self) -> usize {
        self.buffer.index()
    }

    fn is_at_end(&self) -> bool {
        self.buffer.is_at_end()
    }

    fn slice(&self, start: usize, end: usize) -> &[u8] {
        self.buffer
            .bytes_at(start, end.saturating_sub(start))
            .unwrap_or(&[])
    }

    fn peek_type_hint(&self) -> CodecResult<TypeHint> {
        let start = self.buffer.index();
        let byte = self.buffer.peek_byte()?;
        match byte >> 5 {
            MAJOR_UNSIGNED | MAJOR_NEGATIVE | MAJOR_BYTES | MAJOR_TEXT => {
                Ok(TypeHint::NumberPrefix)
            }
            MAJOR_ARRAY => Ok(TypeHint::List),
            MAJOR_MAP => Ok(TypeHint::Dictionary),
            MAJOR_TAG => match self.peek_head()?.1 {
                TAG_RECORD => Ok(TypeHint::Record),
                TAG_POSITIVE_BIGNUM | TAG_NEGATIVE_BIGNUM | TAG_SYMBOL => {
                    Ok(TypeHint::NumberPrefix)
                }
                tag => Err(self.malformed(start, format!("unsupported tag {tag}"))),
            },
            _ => match byte {
                TRUE | FALSE => Ok(TypeHint::Boolean),
                FLOAT64 => Ok(TypeHint::Float64),
                _ => Ok(TypeHint::NumberPrefix),
            },
        }
    }

    fn read_type_and_maybe_value(&mut self) -> CodecResult<TypeAndValue> {
        let start = self.buffer.index();
        let byte = self.buffer.peek_byte()?;
        match byte >> 5 {
            MAJOR_UNSIGNED | MAJOR_NEGATIVE => {
                Err(self.non_canonical(start, "integer (must be a bignum tag)"))
            }
            MAJOR_BYTES => {
                self.take_element()?;
                let len = self.read_len(MAJOR_BYTES, "byte string")?;
                Ok(TypeAndValue::Bytes(self.buffer.read(len)?.to_vec()))
            }
            MAJOR_TEXT => {
                self.take_element()?;
                self.read_text_body().map(TypeAndValue::String)
            }
            MAJOR_ARRAY => Ok(TypeAndValue::Composite(Structure::List)),
            MAJOR_MAP => Ok(TypeAndValue::Composite(Structure::Dictionary)),
            MAJOR_TAG => {
                let (_, tag) = self.peek_head()?;
                match tag {
                    TAG_RECORD => Ok(TypeAndValue::Composite(Structure::Record)),
                    TAG_POSITIVE_BIGNUM | TAG_NEGATIVE_BIGNUM => {
                        self.take_element()?;
                        self.read_head()?;
                        self.read_bignum_body(tag).map(TypeAndValue::Integer)
                    }
                    TAG_SYMBOL => {
                        self.take_element()?;
                        self.read_head()?;
                        self.read_text_body().map(TypeAndValue::Selector)
                    }
                    other => Err(self.malformed(start, format!("unsupported tag {other}"))),
                }
            }
            _ => match byte {
                TRUE | FALSE => {
                    self.take_element()?;
                    self.buffer.read_byte()?;
                    Ok(TypeAndValue::Boolean(byte == TRUE))
                }
                FLOAT64 => {
                    self.take_element()?;
                    self.buffer.read_byte()?;
                    self.read_float64_body().map(TypeAndValue::Float64)
                }
                FLOAT16 | FLOAT32 => Err(self.non_canonical(start, "float width")),
                NULL | UNDEFINED => Err(CodecError::UnexpectedType {
                    offset: start,
                    codec: NAME,
                    found: if byte == NULL { "null" } else { "undefined" }.into(),
                    expected: "a value with an OCapN representation".into(),
                }),
                other => Err(self.malformed(start, format!("unsupported simple value 0x{other:02x}"))),
            },
        }
    }

    /// Text and selector labels both read back as symbols.
    fn read_record_label(&mut self) -> CodecResult<Label> {
        self.read_expected("record label (selector, string or bytestring)", |t| match t {
            TypeAndValue::Selector(s) | TypeAndValue::String(s) => Ok(Label::Symbol(s)),
            TypeAndValue::Bytes(b) => Ok(Label::Bytes(b)),
            other => Err(other),
        })
    }

    fn enter_structure(&mut self, kind: Structure) -> CodecResult<()> {
        match kind {
            Structure::List | Structure::Set => self.enter_array(kind),
            Structure::Dictionary => {
                self.take_element()?;
                let start = self.buffer.index();
                let pairs = self.read_expected_head(MAJOR_MAP, "map")?;
                let remaining = pairs
                    .checked_mul(2)
                    .ok_or_else(|| self.malformed(start, "map length overflows"))?;
                self.stack.push(Frame {
                    kind: Structure::Dictionary,
                    remaining,
                    start,
                });
                Ok(())
            }
            Structure::Record => {
                self.take_element()?;
                let start = self.buffer.index();
                let tag = self.read_expected_head(MAJOR_TAG, "record tag")?;
                if tag != TAG_RECORD {
                    return Err(CodecError::UnexpectedType {
                        offset: start,
                        codec: NAME,
                        found: format!("tag {tag}"),
                        expected: format!("record tag {TAG_RECORD}"),
                    });
                }
                let elements = self.read_expected_head(MAJOR_ARRAY, "record array")?;
                if elements == 0 {
                    return Err(self.malformed(start, "record without a label"));
                }
                self.stack.push(Frame {
                    kind: Structure::Record,
                    remaining: elements,
                    start,
                });
                Ok(())
            }
        }
    }

    fn exit_structure(&mut self, kind: Structure) -> CodecResult<()> {
        let offset = self.buffer.index();
        match self.stack.last() {
            Some(frame) if frame.kind == kind && frame.remaining == 0 => {
                self.stack.pop();
                Ok(())
            }
            Some(frame) if frame.kind == kind => Err(self.structure_error(
                offset,
                format!("exiting {kind} with {} elements unread", frame.remaining),
            )),
            Some(frame) => Err(self.structure_error(
                offset,
                format!("attempted to exit {kind} while in a {}", frame.kind),
            )),
            None => Err(self.structure_error(
                offset,
                format!("attempted to exit {kind} without entering it"),
            )),
        }
    }

    fn peek_structure_end(&self, kind: Structure) -> CodecResult<bool> {
        match self.stack.last() {
            Some(frame) if frame.kind == kind => Ok(frame.remaining == 0),
            Some(frame) => Err(self.structure_error(
                self.buffer.index(),
                format!("looking for the end of {kind} while in a {}", frame.kind),
            )),
            None => Err(self.structure_error(
                self.buffer.index(),
                format!("looking for the end of {kind} outside any structure"),
            )),
        }
    }
}
