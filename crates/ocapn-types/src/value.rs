//! Codec-neutral value model.

use crate::integer::Integer;
use std::fmt;

/// Canonical NaN bit pattern (`7F F8 00 00 00 00 00 00`).
pub const CANONICAL_NAN_BITS: u64 = 0x7ff8_0000_0000_0000;

/// Normalize a float to its canonical form: one NaN, one zero.
pub fn canonical_f64(value: f64) -> f64 {
    if value.is_nan() {
        f64::from_bits(CANONICAL_NAN_BITS)
    } else if value == 0.0 {
        0.0
    } else {
        value
    }
}

/// The label of a record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Label {
    Symbol(String),
    String(String),
    Bytes(Vec<u8>),
}

impl Label {
    /// Textual form of the label. Byte labels are returned if they are UTF-8.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Symbol(s) | Self::String(s) => Some(s),
            Self::Bytes(b) => std::str::from_utf8(b).ok(),
        }
    }
}

impl From<&str> for Label {
    fn from(s: &str) -> Self {
        Self::Symbol(s.to_string())
    }
}

/// A tagged composite: label followed by ordered fields.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub label: Label,
    pub fields: Vec<Value>,
}

impl Record {
    pub fn new(label: impl Into<Label>, fields: Vec<Value>) -> Self {
        Self {
            label: label.into(),
            fields,
        }
    }

    /// True if the label's text equals `name`, regardless of label kind.
    pub fn is(&self, name: &str) -> bool {
        self.label.as_str() == Some(name)
    }
}

/// Any value that can cross the wire.
#[derive(Debug, Clone)]
pub enum Value {
    Boolean(bool),
    Integer(Integer),
    Float64(f64),
    String(String),
    Bytes(Vec<u8>),
    Symbol(String),
    List(Vec<Value>),
    Set(Vec<Value>),
    /// Keys are strings or symbols. Encoders sort and de-duplicate them.
    Dictionary(Vec<(Value, Value)>),
    Record(Record),
}

impl Value {
    pub fn symbol(s: impl Into<String>) -> Self {
        Self::Symbol(s.into())
    }

    pub fn string(s: impl Into<String>) -> Self {
        Self::String(s.into())
    }

    pub fn bytes(b: impl Into<Vec<u8>>) -> Self {
        Self::Bytes(b.into())
    }

    pub fn int(i: impl Into<Integer>) -> Self {
        Self::Integer(i.into())
    }

    pub fn record(label: impl Into<Label>, fields: Vec<Value>) -> Self {
        Self::Record(Record::new(label, fields))
    }

    /// Short name of the value's type, used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Boolean(_) => "boolean",
            Self::Integer(_) => "integer",
            Self::Float64(_) => "float64",
            Self::String(_) => "string",
            Self::Bytes(_) => "bytestring",
            Self::Symbol(_) => "selector",
            Self::List(_) => "list",
            Self::Set(_) => "set",
            Self::Dictionary(_) => "dictionary",
            Self::Record(_) => "record",
        }
    }

    pub fn is_composite(&self) -> bool {
        matches!(
            self,
            Self::List(_) | Self::Set(_) | Self::Dictionary(_) | Self::Record(_)
        )
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<&Integer> {
        match self {
            Self::Integer(i) => Some(i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_symbol(&self) -> Option<&str> {
        match self {
            Self::Symbol(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_record(&self) -> Option<&Record> {
        match self {
            Self::Record(r) => Some(r),
            _ => None,
        }
    }

    /// Look up a dictionary entry by string or symbol key text.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Self::Dictionary(entries) => entries.iter().find_map(|(k, v)| {
                let matches = match k {
                    Self::String(s) | Self::Symbol(s) => s == key,
                    _ => false,
                };
                matches.then_some(v)
            }),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Boolean(a), Self::Boolean(b)) => a == b,
            (Self::Integer(a), Self::Integer(b)) => a == b,
            (Self::Float64(a), Self::Float64(b)) => {
                canonical_f64(*a).to_bits() == canonical_f64(*b).to_bits()
            }
            (Self::String(a), Self::String(b)) => a == b,
            (Self::Bytes(a), Self::Bytes(b)) => a == b,
            (Self::Symbol(a), Self::Symbol(b)) => a == b,
            (Self::List(a), Self::List(b)) => a == b,
            (Self::Set(a), Self::Set(b)) => a == b,
            (Self::Dictionary(a), Self::Dictionary(b)) => entries_match(a, b),
            (Self::Record(a), Self::Record(b)) => a == b,
            _ => false,
        }
    }
}

/// Entry order is not significant, but multiplicity is: each entry of `a`
/// pairs with a distinct entry of `b`.
fn entries_match(a: &[(Value, Value)], b: &[(Value, Value)]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut taken = vec![false; b.len()];
    a.iter().all(|(ka, va)| {
        let found = b
            .iter()
            .enumerate()
            .position(|(i, (kb, vb))| !taken[i] && ka == kb && va == vb);
        match found {
            Some(i) => {
                taken[i] = true;
                true
            }
            None => false,
        }
    })
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Boolean(b)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Self::Float64(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<Integer> for Value {
    fn from(i: Integer) -> Self {
        Self::Integer(i)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Integer(i.into())
    }
}

impl From<u64> for Value {
    fn from(i: u64) -> Self {
        Self::Integer(i.into())
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Boolean(b) => write!(f, "{b}"),
            Self::Integer(i) => write!(f, "{i}"),
            Self::Float64(x) => write!(f, "{x}"),
            Self::String(s) => write!(f, "{s:?}"),
            Self::Bytes(b) => write!(f, "0x{}", hex::encode(b)),
            Self::Symbol(s) => write!(f, "'{s}"),
            Self::List(items) | Self::Set(items) => {
                let (open, close) = if matches!(self, Self::List(_)) {
                    ("[", "]")
                } else {
                    ("#{", "}")
                };
                write!(f, "{open}")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "{close}")
            }
            Self::Dictionary(entries) => {
                write!(f, "{{")?;
                for (i, (k, v)) in entries.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                write!(f, "}}")
            }
            Self::Record(r) => {
                match &r.label {
                    Label::Symbol(s) => write!(f, "<{s}")?,
                    Label::String(s) => write!(f, "<{s:?}")?,
                    Label::Bytes(b) => write!(f, "<0x{}", hex::encode(b))?,
                }
                for field in &r.fields {
                    write!(f, " {field}")?;
                }
                write!(f, ">")
            }
        }
    }
}
