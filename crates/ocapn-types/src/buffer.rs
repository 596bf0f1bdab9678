//! Growable byte writer and bounds-checked byte reader.
//!
//! Both keep an explicit cursor that can be moved with `seek`, which is how
//! the codecs peek ahead and patch already-written bytes.

use crate::error::{CodecError, CodecResult};

const INITIAL_CAPACITY: usize = 256;

/// Byte writer with a movable cursor. Writing past the end grows the buffer.
#[derive(Debug, Clone)]
pub struct BufferWriter {
    bytes: Vec<u8>,
    index: usize,
}

impl Default for BufferWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferWriter {
    pub fn new() -> Self {
        Self::with_capacity(INITIAL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            bytes: Vec::with_capacity(capacity),
            index: 0,
        }
    }

    /// Current cursor position.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Number of bytes written so far (the high-water mark, not the cursor).
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Move the cursor. Seeking beyond the written length is an error.
    pub fn seek(&mut self, index: usize, codec: &'static str) -> CodecResult<()> {
        if index > self.bytes.len() {
            return Err(CodecError::Encode {
                codec,
                message: format!(
                    "cannot seek to {index}, only {} bytes written",
                    self.bytes.len()
                ),
            });
        }
        self.index = index;
        Ok(())
    }

    pub fn write_byte(&mut self, byte: u8) {
        self.write(&[byte]);
    }

    /// Write at the cursor, overwriting existing bytes and growing as needed.
    pub fn write(&mut self, data: &[u8]) {
        let end = self.index + data.len();
        let overlap = self.bytes.len().min(end).saturating_sub(self.index);
        self.bytes[self.index..self.index + overlap].copy_from_slice(&data[..overlap]);
        self.bytes.extend_from_slice(&data[overlap..]);
        self.index = end;
    }

    pub fn write_f64_be(&mut self, value: f64) {
        self.write(&value.to_be_bytes());
    }

    /// Borrow everything written so far.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

/// Bounds-checked reader over a borrowed byte slice.
#[derive(Debug, Clone)]
pub struct BufferReader<'a> {
    bytes: &'a [u8],
    index: usize,
    codec: &'static str,
}

impl<'a> BufferReader<'a> {
    /// `codec` names the owning codec in error messages.
    pub fn new(bytes: &'a [u8], codec: &'static str) -> Self {
        Self {
            bytes,
            index: 0,
            codec,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.index
    }

    pub fn is_at_end(&self) -> bool {
        self.index >= self.bytes.len()
    }

    pub fn codec(&self) -> &'static str {
        self.codec
    }

    pub fn seek(&mut self, index: usize) -> CodecResult<()> {
        if index > self.bytes.len() {
            return Err(self.end_error(index, "a position inside the input"));
        }
        self.index = index;
        Ok(())
    }

    fn end_error(&self, offset: usize, expected: &str) -> CodecError {
        CodecError::UnexpectedEnd {
            offset,
            codec: self.codec,
            expected: expected.to_string(),
        }
    }

    pub fn peek_byte(&self) -> CodecResult<u8> {
        self.bytes
            .get(self.index)
            .copied()
            .ok_or_else(|| self.end_error(self.index, "another byte"))
    }

    pub fn read_byte(&mut self) -> CodecResult<u8> {
        let byte = self.peek_byte()?;
        self.index += 1;
        Ok(byte)
    }

    /// Read `len` bytes and advance.
    pub fn read(&mut self, len: usize) -> CodecResult<&'a [u8]> {
        let start = self.index;
        let bytes = self.bytes_at(start, len)?;
        self.index = start + len;
        Ok(bytes)
    }

    /// Borrow `len` bytes at `start` without moving the cursor.
    pub fn bytes_at(&self, start: usize, len: usize) -> CodecResult<&'a [u8]> {
        let end = start
            .checked_add(len)
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| self.end_error(start, &format!("{len} more bytes")))?;
        Ok(&self.bytes[start..end])
    }

    /// True if the bytes at `start` equal `expected`.
    pub fn match_at(&self, start: usize, expected: &[u8]) -> bool {
        self.bytes_at(start, expected.len())
            .map(|found| found == expected)
            .unwrap_or(false)
    }

    pub fn read_f64_be(&mut self) -> CodecResult<f64> {
        let raw = self.read(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(raw);
        Ok(f64::from_be_bytes(buf))
    }

    pub fn read_u64_be(&mut self, width: usize) -> CodecResult<u64> {
        let raw = self.read(width)?;
        Ok(raw.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b)))
    }
}
