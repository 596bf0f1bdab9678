//! CapTP operation vocabulary.
//!
//! Each operation is a record whose label names it. Reference-bearing
//! fields are kept as raw [`Value`]s here; the engine turns them into
//! passables against its session tables.

use crate::crypto::{PublicKey, Signature};
use crate::descriptors::{expect_record, field_bool, field_str, field_u64};
use crate::error::{WireError, WireResult};
use crate::location::Location;
use ocapn_types::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    StartSession {
        captp_version: String,
        session_public_key: PublicKey,
        location: Location,
        location_signature: Signature,
    },
    Abort {
        reason: String,
    },
    /// Invoke `to` with `args` (selector first). The result settles the
    /// answer at `answer_position`, and is reported to `resolve_me_desc`.
    Deliver {
        to: Value,
        args: Vec<Value>,
        answer_position: Option<u64>,
        resolve_me_desc: Value,
    },
    DeliverOnly {
        to: Value,
        args: Vec<Value>,
    },
    Get {
        receiver: Value,
        field_name: String,
        answer_position: u64,
    },
    Index {
        receiver: Value,
        index: u64,
        answer_position: u64,
    },
    Listen {
        to: Value,
        resolve_me_desc: Value,
        wants_partial: bool,
    },
    GcExport {
        export_position: u64,
        wire_delta: u64,
    },
    GcAnswer {
        answer_position: u64,
    },
}

impl Message {
    pub fn label(&self) -> &'static str {
        match self {
            Self::StartSession { .. } => "op:start-session",
            Self::Abort { .. } => "op:abort",
            Self::Deliver { .. } => "op:deliver",
            Self::DeliverOnly { .. } => "op:deliver-only",
            Self::Get { .. } => "op:get",
            Self::Index { .. } => "op:index",
            Self::Listen { .. } => "op:listen",
            Self::GcExport { .. } => "op:gc-export",
            Self::GcAnswer { .. } => "op:gc-answer",
        }
    }

    pub fn to_value(&self) -> Value {
        let fields = match self {
            Self::StartSession {
                captp_version,
                session_public_key,
                location,
                location_signature,
            } => vec![
                Value::string(captp_version.clone()),
                session_public_key.descriptor().clone(),
                location.to_value(),
                location_signature.to_value(),
            ],
            Self::Abort { reason } => vec![Value::string(reason.clone())],
            Self::Deliver {
                to,
                args,
                answer_position,
                resolve_me_desc,
            } => vec![
                to.clone(),
                Value::List(args.clone()),
                answer_position.map_or(Value::Boolean(false), Value::int),
                resolve_me_desc.clone(),
            ],
            Self::DeliverOnly { to, args } => vec![to.clone(), Value::List(args.clone())],
            Self::Get {
                receiver,
                field_name,
                answer_position,
            } => vec![
                receiver.clone(),
                Value::string(field_name.clone()),
                Value::int(*answer_position),
            ],
            Self::Index {
                receiver,
                index,
                answer_position,
            } => vec![
                receiver.clone(),
                Value::int(*index),
                Value::int(*answer_position),
            ],
            Self::Listen {
                to,
                resolve_me_desc,
                wants_partial,
            } => vec![
                to.clone(),
                resolve_me_desc.clone(),
                Value::Boolean(*wants_partial),
            ],
            Self::GcExport {
                export_position,
                wire_delta,
            } => vec![Value::int(*export_position), Value::int(*wire_delta)],
            Self::GcAnswer { answer_position } => vec![Value::int(*answer_position)],
        };
        Value::record(self.label(), fields)
    }

    /// Parse an operation. Unknown labels are an error, never skipped.
    pub fn from_value(value: &Value) -> WireResult<Self> {
        let record = value
            .as_record()
            .ok_or_else(|| WireError::UnknownMessage(format!("not a record: {value}")))?;
        let label = record
            .label
            .as_str()
            .ok_or_else(|| WireError::UnknownMessage("non-text label".into()))?;

        let message = match label {
            "op:start-session" => {
                let f = expect_record(value, label, 4)?;
                Self::StartSession {
                    captp_version: field_str(&f[0], "captp version")?.to_string(),
                    session_public_key: PublicKey::from_descriptor(&f[1])?,
                    location: Location::from_value(&f[2])?,
                    location_signature: Signature::from_value(&f[3])?,
                }
            }
            "op:abort" => {
                let f = expect_record(value, label, 1)?;
                Self::Abort {
                    reason: field_str(&f[0], "abort reason")?.to_string(),
                }
            }
            "op:deliver" => {
                let f = expect_record(value, label, 4)?;
                let answer_position = match &f[2] {
                    Value::Boolean(false) => None,
                    other => Some(field_u64(other, "answer position")?),
                };
                Self::Deliver {
                    to: f[0].clone(),
                    args: args_list(&f[1])?,
                    answer_position,
                    resolve_me_desc: f[3].clone(),
                }
            }
            "op:deliver-only" => {
                let f = expect_record(value, label, 2)?;
                Self::DeliverOnly {
                    to: f[0].clone(),
                    args: args_list(&f[1])?,
                }
            }
            "op:get" => {
                let f = expect_record(value, label, 3)?;
                Self::Get {
                    receiver: f[0].clone(),
                    field_name: field_str(&f[1], "field name")?.to_string(),
                    answer_position: field_u64(&f[2], "answer position")?,
                }
            }
            "op:index" => {
                let f = expect_record(value, label, 3)?;
                Self::Index {
                    receiver: f[0].clone(),
                    index: field_u64(&f[1], "index")?,
                    answer_position: field_u64(&f[2], "answer position")?,
                }
            }
            "op:listen" => {
                let f = expect_record(value, label, 3)?;
                Self::Listen {
                    to: f[0].clone(),
                    resolve_me_desc: f[1].clone(),
                    wants_partial: field_bool(&f[2], "wants partial")?,
                }
            }
            "op:gc-export" => {
                let f = expect_record(value, label, 2)?;
                Self::GcExport {
                    export_position: field_u64(&f[0], "export position")?,
                    wire_delta: field_u64(&f[1], "wire delta")?,
                }
            }
            "op:gc-answer" => {
                let f = expect_record(value, label, 1)?;
                Self::GcAnswer {
                    answer_position: field_u64(&f[0], "answer position")?,
                }
            }
            other => return Err(WireError::UnknownMessage(other.to_string())),
        };
        Ok(message)
    }
}

fn args_list(value: &Value) -> WireResult<Vec<Value>> {
    value
        .as_list()
        .map(<[Value]>::to_vec)
        .ok_or_else(|| WireError::InvalidDescriptor("args must be a list".into()))
}
