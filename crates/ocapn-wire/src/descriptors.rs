//! Reference and handoff descriptors carried inside CapTP messages.

use crate::crypto::{KeyPair, PublicKey, Signature};
use crate::error::{WireError, WireResult};
use crate::location::Location;
use ocapn_types::{encode_syrup, Value};

/// Match a record by label and arity, returning its fields.
pub(crate) fn expect_record<'a>(
    value: &'a Value,
    label: &str,
    arity: usize,
) -> WireResult<&'a [Value]> {
    match value.as_record() {
        Some(record) if record.is(label) && record.fields.len() == arity => Ok(&record.fields),
        Some(record) if record.is(label) => Err(WireError::InvalidDescriptor(format!(
            "{label} expects {arity} fields, got {}",
            record.fields.len()
        ))),
        _ => Err(WireError::InvalidDescriptor(format!(
            "expected <{label} ...>, got {value}"
        ))),
    }
}

pub(crate) fn is_record(value: &Value, label: &str) -> bool {
    value.as_record().is_some_and(|r| r.is(label))
}

pub(crate) fn field_u64(value: &Value, what: &str) -> WireResult<u64> {
    value
        .as_integer()
        .and_then(|i| i.to_u64())
        .ok_or_else(|| WireError::InvalidDescriptor(format!("{what} must be a non-negative integer")))
}

pub(crate) fn field_bytes<'a>(value: &'a Value, what: &str) -> WireResult<&'a [u8]> {
    value
        .as_bytes()
        .ok_or_else(|| WireError::InvalidDescriptor(format!("{what} must be a bytestring")))
}

pub(crate) fn field_str<'a>(value: &'a Value, what: &str) -> WireResult<&'a str> {
    value
        .as_str()
        .ok_or_else(|| WireError::InvalidDescriptor(format!("{what} must be a string")))
}

pub(crate) fn field_bool(value: &Value, what: &str) -> WireResult<bool> {
    value
        .as_bool()
        .ok_or_else(|| WireError::InvalidDescriptor(format!("{what} must be a boolean")))
}

/// A session-relative reference. Positions mean different objects on the
/// two ends of a session; the tag says whose table to look in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RefDesc {
    /// Sender's export, arriving as an object import.
    ImportObject(u64),
    /// Sender's export, arriving as a promise import.
    ImportPromise(u64),
    /// Receiver's own export.
    Export(u64),
    /// Receiver's own answer.
    Answer(u64),
}

impl RefDesc {
    pub fn label(&self) -> &'static str {
        match self {
            Self::ImportObject(_) => "desc:import-object",
            Self::ImportPromise(_) => "desc:import-promise",
            Self::Export(_) => "desc:export",
            Self::Answer(_) => "desc:answer",
        }
    }

    pub fn position(&self) -> u64 {
        match self {
            Self::ImportObject(p) | Self::ImportPromise(p) | Self::Export(p) | Self::Answer(p) => *p,
        }
    }

    pub fn to_value(&self) -> Value {
        Value::record(self.label(), vec![Value::int(self.position())])
    }

    /// `Ok(None)` when `value` is not a reference descriptor at all.
    pub fn parse(value: &Value) -> WireResult<Option<Self>> {
        let Some(record) = value.as_record() else {
            return Ok(None);
        };
        let make: fn(u64) -> Self = match record.label.as_str() {
            Some("desc:import-object") => Self::ImportObject,
            Some("desc:import-promise") => Self::ImportPromise,
            Some("desc:export") => Self::Export,
            Some("desc:answer") => Self::Answer,
            _ => return Ok(None),
        };
        match record.fields.as_slice() {
            [position] => Ok(Some(make(field_u64(position, "descriptor position")?))),
            _ => Err(WireError::InvalidDescriptor(format!(
                "{} expects 1 field",
                record.label.as_str().unwrap_or_default()
            ))),
        }
    }
}

/// `<desc:error message>`: the reason carried by a broken promise.
pub fn error_value(message: &str) -> Value {
    Value::record("desc:error", vec![Value::string(message)])
}

pub fn parse_error_value(value: &Value) -> Option<&str> {
    match value.as_record() {
        Some(record) if record.is("desc:error") => match record.fields.as_slice() {
            [message] => message.as_str(),
            _ => None,
        },
        _ => None,
    }
}

fn envelope(object: Value, signature: &Signature) -> Value {
    Value::record("desc:sig-envelope", vec![object, signature.to_value()])
}

fn open_envelope(value: &Value) -> WireResult<(&Value, Signature)> {
    let fields = expect_record(value, "desc:sig-envelope", 2)?;
    Ok((&fields[0], Signature::from_value(&fields[1])?))
}

/// Gifter's statement that `receiver_key` may withdraw `gift_id` from the
/// exporter at `exporter_location`.
#[derive(Debug, Clone, PartialEq)]
pub struct HandoffGive {
    pub receiver_key: PublicKey,
    pub exporter_location: Location,
    /// Session between gifter and exporter.
    pub exporter_session_id: Vec<u8>,
    /// Gifter's key ID on that session.
    pub gifter_side_id: Vec<u8>,
    pub gift_id: Vec<u8>,
}

impl HandoffGive {
    pub fn to_value(&self) -> Value {
        Value::record(
            "desc:handoff-give",
            vec![
                self.receiver_key.descriptor().clone(),
                self.exporter_location.to_value(),
                Value::bytes(self.exporter_session_id.clone()),
                Value::bytes(self.gifter_side_id.clone()),
                Value::bytes(self.gift_id.clone()),
            ],
        )
    }

    pub fn from_value(value: &Value) -> WireResult<Self> {
        let fields = expect_record(value, "desc:handoff-give", 5)?;
        Ok(Self {
            receiver_key: PublicKey::from_descriptor(&fields[0])?,
            exporter_location: Location::from_value(&fields[1])?,
            exporter_session_id: field_bytes(&fields[2], "exporter session")?.to_vec(),
            gifter_side_id: field_bytes(&fields[3], "gifter side")?.to_vec(),
            gift_id: field_bytes(&fields[4], "gift id")?.to_vec(),
        })
    }

    pub fn sign(self, keypair: &KeyPair) -> WireResult<SignedGive> {
        let signature = keypair.sign(&encode_syrup(&self.to_value())?);
        Ok(SignedGive {
            give: self,
            signature,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SignedGive {
    pub give: HandoffGive,
    pub signature: Signature,
}

impl SignedGive {
    pub fn to_value(&self) -> Value {
        envelope(self.give.to_value(), &self.signature)
    }

    pub fn from_value(value: &Value) -> WireResult<Self> {
        let (object, signature) = open_envelope(value)?;
        Ok(Self {
            give: HandoffGive::from_value(object)?,
            signature,
        })
    }

    /// True if `value` is an envelope around a handoff-give.
    pub fn matches(value: &Value) -> bool {
        match value.as_record() {
            Some(record) if record.is("desc:sig-envelope") => record
                .fields
                .first()
                .is_some_and(|object| is_record(object, "desc:handoff-give")),
            _ => false,
        }
    }

    pub fn verify(&self, gifter_key: &PublicKey) -> bool {
        encode_syrup(&self.give.to_value())
            .map(|bytes| gifter_key.verify(&bytes, &self.signature))
            .unwrap_or(false)
    }
}

/// Receiver's request to the exporter, countersigning a give.
#[derive(Debug, Clone, PartialEq)]
pub struct HandoffReceive {
    /// Session between receiver and exporter.
    pub receiving_session: Vec<u8>,
    /// Receiver's key ID on that session.
    pub receiving_side: Vec<u8>,
    pub handoff_count: u64,
    pub signed_give: SignedGive,
}

impl HandoffReceive {
    pub fn to_value(&self) -> Value {
        Value::record(
            "desc:handoff-receive",
            vec![
                Value::bytes(self.receiving_session.clone()),
                Value::bytes(self.receiving_side.clone()),
                Value::int(self.handoff_count),
                self.signed_give.to_value(),
            ],
        )
    }

    pub fn from_value(value: &Value) -> WireResult<Self> {
        let fields = expect_record(value, "desc:handoff-receive", 4)?;
        Ok(Self {
            receiving_session: field_bytes(&fields[0], "receiving session")?.to_vec(),
            receiving_side: field_bytes(&fields[1], "receiving side")?.to_vec(),
            handoff_count: field_u64(&fields[2], "handoff count")?,
            signed_give: SignedGive::from_value(&fields[3])?,
        })
    }

    pub fn sign(self, keypair: &KeyPair) -> WireResult<SignedReceive> {
        let signature = keypair.sign(&encode_syrup(&self.to_value())?);
        Ok(SignedReceive {
            receive: self,
            signature,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SignedReceive {
    pub receive: HandoffReceive,
    pub signature: Signature,
}

impl SignedReceive {
    pub fn to_value(&self) -> Value {
        envelope(self.receive.to_value(), &self.signature)
    }

    pub fn from_value(value: &Value) -> WireResult<Self> {
        let (object, signature) = open_envelope(value)?;
        Ok(Self {
            receive: HandoffReceive::from_value(object)?,
            signature,
        })
    }

    pub fn verify(&self, receiver_key: &PublicKey) -> bool {
        encode_syrup(&self.receive.to_value())
            .map(|bytes| receiver_key.verify(&bytes, &self.signature))
            .unwrap_or(false)
    }
}
