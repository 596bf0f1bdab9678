//! Errors raised by the byte buffers and the wire codecs.

use thiserror::Error;

/// A codec failure. Decode errors carry the byte offset and the codec name.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Input ended before a complete value was read.
    #[error("Unexpected end of input at index {offset} of {codec}, expected {expected}")]
    UnexpectedEnd {
        offset: usize,
        codec: &'static str,
        expected: String,
    },

    /// Input is not well-formed for this codec.
    #[error("Malformed input at index {offset} of {codec}: {message}")]
    Malformed {
        offset: usize,
        codec: &'static str,
        message: String,
    },

    /// Input is well-formed but not in canonical form.
    #[error("Non-canonical {what} at index {offset} of {codec}")]
    NonCanonical {
        offset: usize,
        codec: &'static str,
        what: String,
    },

    #[error("Invalid UTF-8 at index {offset} of {codec}")]
    InvalidUtf8 { offset: usize, codec: &'static str },

    /// A value of one type was found where another was expected.
    #[error("Unexpected {found} at index {offset} of {codec}, expected {expected}")]
    UnexpectedType {
        offset: usize,
        codec: &'static str,
        found: String,
        expected: String,
    },

    /// Enter/exit calls that do not pair up with the input or with each other.
    #[error("Structure error at index {offset} of {codec}: {message}")]
    Structure {
        offset: usize,
        codec: &'static str,
        message: String,
    },

    /// A value the writer cannot encode.
    #[error("Encode error in {codec}: {message}")]
    Encode {
        codec: &'static str,
        message: String,
    },
}

impl CodecError {
    /// Byte offset of the failure, for decode errors.
    pub fn offset(&self) -> Option<usize> {
        match self {
            Self::UnexpectedEnd { offset, .. }
            | Self::Malformed { offset, .. }
            | Self::NonCanonical { offset, .. }
            | Self::InvalidUtf8 { offset, .. }
            | Self::UnexpectedType { offset, .. }
            | Self::Structure { offset, .. } => Some(*offset),
            Self::Encode { .. } => None,
        }
    }

    /// True when more input could turn this failure into a success.
    pub fn is_truncated(&self) -> bool {
        matches!(self, Self::UnexpectedEnd { .. })
    }
}

/// Result alias for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;
