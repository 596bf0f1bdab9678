//! Syrup: the textual-prefix canonical encoding.
//!
//! | Value      | Encoding                              |
//! |------------|---------------------------------------|
//! | boolean    | `t` / `f`                             |
//! | integer    | decimal magnitude then `+` or `-`     |
//! | float64    | `D` + 8 bytes big-endian              |
//! | bytestring | `<len>:` + bytes                      |
//! | string     | `<len>"` + UTF-8                      |
//! | selector   | `<len>'` + UTF-8                      |
//! | list       | `[` ... `]`                           |
//! | set        | `#` ... `$`                           |
//! | dictionary | `{` key value ... `}`                 |
//! | record     | `<` label field ... `>`               |
//!
//! The reader accepts only canonical input: no leading zeros in number
//! prefixes, no negative zero, one NaN and one zero bit pattern.

use crate::buffer::{BufferReader, BufferWriter};
use crate::codec::{standalone_key, Structure, TypeAndValue, TypeHint, ValueReader, ValueWriter};
use crate::error::{CodecError, CodecResult};
use crate::frame::Token;
use crate::integer::{Integer, MAX_DECIMAL_DIGITS, MAX_MAGNITUDE_BYTES};
use crate::value::{canonical_f64, Label, Value, CANONICAL_NAN_BITS};

const NAME: &str = "syrup";

const PLUS: u8 = b'+';
const MINUS: u8 = b'-';
const LIST_START: u8 = b'[';
const LIST_END: u8 = b']';
const DICT_START: u8 = b'{';
const DICT_END: u8 = b'}';
const SET_START: u8 = b'#';
const SET_END: u8 = b'$';
const BYTES_START: u8 = b':';
const STRING_START: u8 = b'"';
const SELECTOR_START: u8 = b'\'';
const RECORD_START: u8 = b'<';
const RECORD_END: u8 = b'>';
const TRUE: u8 = b't';
const FALSE: u8 = b'f';
const FLOAT64: u8 = b'D';

fn brackets(kind: Structure) -> (u8, u8) {
    match kind {
        Structure::List => (LIST_START, LIST_END),
        Structure::Set => (SET_START, SET_END),
        Structure::Dictionary => (DICT_START, DICT_END),
        Structure::Record => (RECORD_START, RECORD_END),
    }
}

fn show(byte: u8) -> String {
    if byte.is_ascii_graphic() {
        format!("{:?}", char::from(byte))
    } else {
        format!("0x{byte:02x}")
    }
}

/// Syrup encoder.
#[derive(Debug, Default)]
pub struct SyrupWriter {
    buffer: BufferWriter,
    stack: Vec<Structure>,
}

impl SyrupWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Finish, failing if a structure was left open.
    pub fn into_bytes(self) -> CodecResult<Vec<u8>> {
        if let Some(open) = self.stack.last() {
            return Err(CodecError::Encode {
                codec: NAME,
                message: format!("{open} left open at end of output"),
            });
        }
        Ok(self.buffer.into_bytes())
    }

    fn write_prefixed(&mut self, data: &[u8], marker: u8) {
        self.buffer.write(data.len().to_string().as_bytes());
        self.buffer.write_byte(marker);
        self.buffer.write(data);
    }
}

impl ValueWriter for SyrupWriter {
    fn name(&self) -> &'static str {
        NAME
    }

    fn index(&self) -> usize {
        self.buffer.index()
    }

    fn write_boolean(&mut self, value: bool) -> CodecResult<()> {
        self.buffer.write_byte(if value { TRUE } else { FALSE });
        Ok(())
    }

    fn write_integer(&mut self, value: &Integer) -> CodecResult<()> {
        self.buffer.write(value.magnitude_decimal().as_bytes());
        self.buffer
            .write_byte(if value.is_negative() { MINUS } else { PLUS });
        Ok(())
    }

    fn write_float64(&mut self, value: f64) -> CodecResult<()> {
        self.buffer.write_byte(FLOAT64);
        self.buffer.write_f64_be(canonical_f64(value));
        Ok(())
    }

    fn write_string(&mut self, value: &str) -> CodecResult<()> {
        self.write_prefixed(value.as_bytes(), STRING_START);
        Ok(())
    }

    fn write_bytestring(&mut self, value: &[u8]) -> CodecResult<()> {
        self.write_prefixed(value, BYTES_START);
        Ok(())
    }

    fn write_selector_from_string(&mut self, value: &str) -> CodecResult<()> {
        self.write_prefixed(value.as_bytes(), SELECTOR_START);
        Ok(())
    }

    fn write_record_label(&mut self, label: &Label) -> CodecResult<()> {
        match label {
            Label::Symbol(s) => self.write_selector_from_string(s),
            Label::String(s) => self.write_string(s),
            Label::Bytes(b) => self.write_bytestring(b),
        }
    }

    fn enter_structure(&mut self, kind: Structure, _len: usize) -> CodecResult<()> {
        self.buffer.write_byte(brackets(kind).0);
        self.stack.push(kind);
        Ok(())
    }

    fn exit_structure(&mut self, kind: Structure) -> CodecResult<()> {
        match self.stack.pop() {
            Some(open) if open == kind => {
                self.buffer.write_byte(brackets(kind).1);
                Ok(())
            }
            Some(open) => Err(CodecError::Encode {
                codec: NAME,
                message: format!("attempted to exit {kind} while in a {open}"),
            }),
            None => Err(CodecError::Encode {
                codec: NAME,
                message: format!("attempted to exit {kind} without entering it"),
            }),
        }
    }

    fn key_bytes(&self, key: &Value) -> CodecResult<Vec<u8>> {
        standalone_key(SyrupWriter::new(), key)?.into_bytes()
    }
}

/// Encode a value as Syrup.
pub fn encode_syrup(value: &Value) -> CodecResult<Vec<u8>> {
    let mut writer = SyrupWriter::new();
    crate::codec::write_value(&mut writer, value)?;
    writer.into_bytes()
}

/// Decode a single Syrup value spanning all of `bytes`.
pub fn decode_syrup(bytes: &[u8]) -> CodecResult<Value> {
    crate::codec::Encoding::Syrup.decode(bytes)
}

/// Size of the token at the front of `rest`, without validating it.
pub(crate) fn next_token(rest: &[u8]) -> Token {
    let Some(&byte) = rest.first() else {
        return Token::Need;
    };
    match byte {
        LIST_START | SET_START | DICT_START | RECORD_START => Token::Open { len: 1, owed: 0 },
        LIST_END | SET_END | DICT_END | RECORD_END => Token::Close,
        TRUE | FALSE => Token::Atom(1),
        FLOAT64 if rest.len() < 9 => Token::Need,
        FLOAT64 => Token::Atom(9),
        b'0'..=b'9' => {
            let digits = rest
                .iter()
                .take(MAX_DECIMAL_DIGITS + 1)
                .take_while(|b| b.is_ascii_digit())
                .count();
            if digits > MAX_DECIMAL_DIGITS {
                return Token::Bad;
            }
            let Some(&marker) = rest.get(digits) else {
                return Token::Need;
            };
            match marker {
                PLUS | MINUS => Token::Atom(digits + 1),
                BYTES_START | STRING_START | SELECTOR_START => {
                    let total = std::str::from_utf8(&rest[..digits])
                        .ok()
                        .and_then(|d| d.parse::<usize>().ok())
                        .and_then(|len| len.checked_add(digits + 1));
                    match total {
                        Some(total) if rest.len() < total => Token::Need,
                        Some(total) => Token::Atom(total),
                        None => Token::Bad,
                    }
                }
                _ => Token::Bad,
            }
        }
        _ => Token::Bad,
    }
}

/// Syrup decoder over a borrowed buffer.
#[derive(Debug)]
pub struct SyrupReader<'a> {
    buffer: BufferReader<'a>,
    stack: Vec<Structure>,
}

impl<'a> SyrupReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self {
            buffer: BufferReader::new(bytes, NAME),
            stack: Vec::new(),
        }
    }

    fn malformed(&self, offset: usize, message: String) -> CodecError {
        CodecError::Malformed {
            offset,
            codec: NAME,
            message,
        }
    }

    fn expect_byte(&mut self, expected: u8) -> CodecResult<()> {
        let start = self.buffer.index();
        let found = self.buffer.read_byte()?;
        if found != expected {
            return Err(self.malformed(
                start,
                format!("unexpected {}, expected {}", show(found), show(expected)),
            ));
        }
        Ok(())
    }

    /// Read `digits` then the type byte that terminates them.
    fn read_number_prefix(&mut self) -> CodecResult<(&'a [u8], u8, usize)> {
        let start = self.buffer.index();
        loop {
            if self.buffer.index() - start > MAX_DECIMAL_DIGITS {
                return Err(self.malformed(
                    start,
                    format!("number prefix longer than {MAX_DECIMAL_DIGITS} digits"),
                ));
            }
            let byte = self.buffer.read_byte()?;
            if !byte.is_ascii_digit() {
                let end = self.buffer.index() - 1;
                let digits = self.buffer.bytes_at(start, end - start)?;
                return Ok((digits, byte, start));
            }
        }
    }

    fn parse_length(&self, digits: &[u8], start: usize) -> CodecResult<usize> {
        let mut len: usize = 0;
        for d in digits {
            len = len
                .checked_mul(10)
                .and_then(|l| l.checked_add(usize::from(d - b'0')))
                .ok_or_else(|| self.malformed(start, "length prefix overflows".into()))?;
        }
        Ok(len)
    }

    fn read_utf8(&mut self, len: usize) -> CodecResult<String> {
        let start = self.buffer.index();
        let raw = self.buffer.read(len)?;
        std::str::from_utf8(raw)
            .map(str::to_string)
            .map_err(|_| CodecError::InvalidUtf8 {
                offset: start,
                codec: NAME,
            })
    }

    fn read_float64_body(&mut self) -> CodecResult<f64> {
        let start = self.buffer.index();
        let value = self.buffer.read_f64_be()?;
        if value == 0.0 && value.to_bits() != 0 {
            return Err(CodecError::NonCanonical {
                offset: start,
                codec: NAME,
                what: "zero".into(),
            });
        }
        if value.is_nan() && value.to_bits() != CANONICAL_NAN_BITS {
            return Err(CodecError::NonCanonical {
                offset: start,
                codec: NAME,
                what: "NaN".into(),
            });
        }
        Ok(value)
    }
}

impl ValueReader for SyrupReader<'_> {
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
        let byte = self.buffer.peek_byte()?;
        match byte {
            b'0'..=b'9' => Ok(TypeHint::NumberPrefix),
            TRUE | FALSE => Ok(TypeHint::Boolean),
            FLOAT64 => Ok(TypeHint::Float64),
            LIST_START => Ok(TypeHint::List),
            SET_START => Ok(TypeHint::Set),
            DICT_START => Ok(TypeHint::Dictionary),
            RECORD_START => Ok(TypeHint::Record),
            other => Err(self.malformed(
                self.buffer.index(),
                format!("unexpected {}", show(other)),
            )),
        }
    }

    fn read_type_and_maybe_value(&mut self) -> CodecResult<TypeAndValue> {
        let start = self.buffer.index();
        let byte = self.buffer.peek_byte()?;
        let composite = match byte {
            LIST_START => Some(Structure::List),
            SET_START => Some(Structure::Set),
            DICT_START => Some(Structure::Dictionary),
            RECORD_START => Some(Structure::Record),
            _ => None,
        };
        if let Some(kind) = composite {
            return Ok(TypeAndValue::Composite(kind));
        }
        match byte {
            TRUE | FALSE => {
                self.buffer.read_byte()?;
                return Ok(TypeAndValue::Boolean(byte == TRUE));
            }
            FLOAT64 => {
                self.buffer.read_byte()?;
                return self.read_float64_body().map(TypeAndValue::Float64);
            }
            b'0'..=b'9' => {}
            other => return Err(self.malformed(start, format!("unexpected {}", show(other)))),
        }

        let (digits, type_byte, start) = self.read_number_prefix()?;
        if digits.len() > 1 && digits[0] == b'0' {
            return Err(CodecError::NonCanonical {
                offset: start,
                codec: NAME,
                what: "number prefix with leading zero".into(),
            });
        }
        match type_byte {
            PLUS | MINUS => {
                if type_byte == MINUS && digits == b"0" {
                    return Err(CodecError::NonCanonical {
                        offset: start,
                        codec: NAME,
                        what: "negative zero".into(),
                    });
                }
                let integer = Integer::from_decimal(type_byte == MINUS, digits)
                    .ok_or_else(|| self.malformed(start, "invalid integer digits".into()))?;
                if integer.magnitude().len() > MAX_MAGNITUDE_BYTES {
                    return Err(self.malformed(
                        start,
                        format!("integer larger than {MAX_MAGNITUDE_BYTES} bytes"),
                    ));
                }
                Ok(TypeAndValue::Integer(integer))
            }
            BYTES_START => {
                let len = self.parse_length(digits, start)?;
                Ok(TypeAndValue::Bytes(self.buffer.read(len)?.to_vec()))
            }
            STRING_START => {
                let len = self.parse_length(digits, start)?;
                Ok(TypeAndValue::String(self.read_utf8(len)?))
            }
            SELECTOR_START => {
                let len = self.parse_length(digits, start)?;
                Ok(TypeAndValue::Selector(self.read_utf8(len)?))
            }
            other => Err(self.malformed(
                self.buffer.index() - 1,
                format!("unexpected {} after number prefix", show(other)),
            )),
        }
    }

    fn read_record_label(&mut self) -> CodecResult<Label> {
        self.read_expected("record label (selector, string or bytestring)", |t| match t {
            TypeAndValue::Selector(s) => Ok(Label::Symbol(s)),
            TypeAndValue::String(s) => Ok(Label::String(s)),
            TypeAndValue::Bytes(b) => Ok(Label::Bytes(b)),
            other => Err(other),
        })
    }

    fn enter_structure(&mut self, kind: Structure) -> CodecResult<()> {
        self.expect_byte(brackets(kind).0)?;
        self.stack.push(kind);
        Ok(())
    }

    fn exit_structure(&mut self, kind: Structure) -> CodecResult<()> {
        let start = self.buffer.index();
        match self.stack.last() {
            None => {
                return Err(CodecError::Structure {
                    offset: start,
                    codec: NAME,
                    message: format!("attempted to exit {kind} without entering it"),
                })
            }
            Some(open) if *open != kind => {
                return Err(CodecError::Structure {
                    offset: start,
                    codec: NAME,
                    message: format!("attempted to exit {kind} while in a {open}"),
                })
            }
            Some(_) => {}
        }
        self.expect_byte(brackets(kind).1)?;
        self.stack.pop();
        Ok(())
    }

    fn peek_structure_end(&self, kind: Structure) -> CodecResult<bool> {
        Ok(self.buffer.peek_byte()? == brackets(kind).1)
    }
}
