//! Error types for the peer layer.

use ocapn_types::CodecError;
use thiserror::Error;

/// Errors from the OCapN wire layer.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },
    #[error("Protocol version mismatch: local={local}, remote={remote}")]
    VersionMismatch { local: String, remote: String },
    #[error("Invalid signature: {0}")]
    InvalidSignature(String),
    #[error("Invalid descriptor: {0}")]
    InvalidDescriptor(String),
    #[error("Unknown message type: {0}")]
    UnknownMessage(String),
    #[error("Active session already exists for {0}")]
    SessionExists(String),
    #[error("No session: {0}")]
    NoSession(String),
    #[error("Session disconnected: {0}")]
    Disconnected(String),
    #[error("Protocol violation: {0}")]
    Protocol(String),
    #[error("Configuration error: {0}")]
    Config(String),
}

pub type WireResult<T> = Result<T, WireError>;
