//! Value model and canonical codecs for OCapN.
//!
//! Two interchangeable encodings of the same abstract [`Value`]:
//!
//! - **Syrup** ([`syrup`]): textual length prefixes, the default on the wire
//! - **CBOR** ([`cbor`]): a deterministic RFC 8949 subset
//!
//! Both are canonical. Equal values encode to identical bytes, and the
//! readers reject any input that is not the canonical encoding of its value.
//! Signatures are computed over these bytes, so this is load-bearing.

pub mod buffer;
pub mod cbor;
pub mod codec;
pub mod error;
pub mod frame;
pub mod integer;
pub mod syrup;
pub mod value;

pub use codec::{
    read_value, write_value, Encoding, TypeAndValue, TypeHint, ValueReader, ValueWriter, MAX_DEPTH,
};
pub use error::{CodecError, CodecResult};
pub use frame::{Frame, FrameScanner};
pub use integer::{Integer, MAX_DECIMAL_DIGITS, MAX_MAGNITUDE_BYTES};
pub use syrup::{decode_syrup, encode_syrup};
pub use value::{Label, Record, Value};
