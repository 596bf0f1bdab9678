//! Values that may carry capabilities.
//!
//! A [`Passable`] is either plain data or a structure that contains object
//! references, promises or error reasons somewhere inside. Plain subtrees
//! collapse into [`Passable::Data`] so the common case stays a [`Value`].

use crate::captp::RemoteObject;
use crate::promise::Promise;
use ocapn_types::{Label, Value};
use std::fmt;
use std::sync::Arc;

/// A local object that can receive method calls.
///
/// `invoke` runs on the connection task that delivered the call, so it must
/// not block. Work that has to wait returns a [`Passable::Promise`].
pub trait Invocable: Send + Sync + 'static {
    fn invoke(&self, method: &str, args: Vec<Passable>) -> Result<Passable, Passable>;
}

impl<F> Invocable for F
where
    F: Fn(&str, Vec<Passable>) -> Result<Passable, Passable> + Send + Sync + 'static,
{
    fn invoke(&self, method: &str, args: Vec<Passable>) -> Result<Passable, Passable> {
        self(method, args)
    }
}

/// A remotable: hosted here, or imported over a session.
#[derive(Clone)]
pub enum ObjectRef {
    Local(Arc<dyn Invocable>),
    Remote(RemoteObject),
}

impl ObjectRef {
    pub fn same(&self, other: &ObjectRef) -> bool {
        match (self, other) {
            (Self::Local(a), Self::Local(b)) => local_identity(a) == local_identity(b),
            (Self::Remote(a), Self::Remote(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

pub(crate) fn local_identity(object: &Arc<dyn Invocable>) -> usize {
    Arc::as_ptr(object) as *const () as usize
}

#[derive(Clone)]
pub enum Passable {
    /// Reference-free data.
    Data(Value),
    List(Vec<Passable>),
    /// Keys are strings or selectors.
    Dictionary(Vec<(Value, Passable)>),
    Tagged {
        label: Label,
        fields: Vec<Passable>,
    },
    Object(ObjectRef),
    Promise(Promise),
    /// Reason carried by a broken promise.
    Error(String),
}

impl Passable {
    pub fn local(object: impl Invocable) -> Self {
        Self::Object(ObjectRef::Local(Arc::new(object)))
    }

    /// Wrap a closure as a local object.
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(&str, Vec<Passable>) -> Result<Passable, Passable> + Send + Sync + 'static,
    {
        Self::local(f)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error(message.into())
    }

    /// Result of a call that has nothing to return: an empty list.
    pub fn unit() -> Self {
        Self::Data(Value::List(Vec::new()))
    }

    /// Build a list, collapsing to [`Passable::Data`] when nothing in it
    /// is a reference.
    pub fn list(items: Vec<Passable>) -> Self {
        if items.iter().all(|i| matches!(i, Self::Data(_))) {
            Self::Data(Value::List(items.into_iter().filter_map(Self::into_data).collect()))
        } else {
            Self::List(items)
        }
    }

    pub fn dictionary(entries: Vec<(Value, Passable)>) -> Self {
        if entries.iter().all(|(_, v)| matches!(v, Self::Data(_))) {
            Self::Data(Value::Dictionary(
                entries
                    .into_iter()
                    .filter_map(|(k, v)| v.into_data().map(|v| (k, v)))
                    .collect(),
            ))
        } else {
            Self::Dictionary(entries)
        }
    }

    pub fn tagged(label: Label, fields: Vec<Passable>) -> Self {
        if fields.iter().all(|f| matches!(f, Self::Data(_))) {
            Self::Data(Value::Record(ocapn_types::Record {
                label,
                fields: fields.into_iter().filter_map(Self::into_data).collect(),
            }))
        } else {
            Self::Tagged { label, fields }
        }
    }

    fn into_data(self) -> Option<Value> {
        match self {
            Self::Data(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Self::Data(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        self.as_value().and_then(Value::as_str)
    }

    pub fn is_remotable(&self) -> bool {
        matches!(self, Self::Object(_))
    }

    /// Remotable and hosted in this process.
    pub fn is_local(&self) -> bool {
        matches!(self, Self::Object(ObjectRef::Local(_)))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Data(v) => v.type_name(),
            Self::List(_) => "list",
            Self::Dictionary(_) => "dictionary",
            Self::Tagged { .. } => "record",
            Self::Object(_) => "remotable",
            Self::Promise(_) => "promise",
            Self::Error(_) => "error",
        }
    }

    /// Field projection on a dictionary.
    pub fn get_field(&self, name: &str) -> Result<Passable, Passable> {
        let found = match self {
            Self::Data(value @ Value::Dictionary(_)) => value.get(name).cloned().map(Self::Data),
            Self::Dictionary(entries) => entries.iter().find_map(|(k, v)| {
                let key = k.as_str().or_else(|| k.as_symbol());
                (key == Some(name)).then(|| v.clone())
            }),
            other => {
                return Err(Self::error(format!(
                    "Cannot get field {name:?} of {}",
                    other.kind()
                )))
            }
        };
        found.ok_or_else(|| Self::error(format!("No such field: {name}")))
    }

    /// Index projection on a list.
    pub fn get_index(&self, index: u64) -> Result<Passable, Passable> {
        let slot = usize::try_from(index).ok();
        let found = match self {
            Self::Data(Value::List(items)) => slot
                .and_then(|i| items.get(i))
                .cloned()
                .map(Self::Data),
            Self::List(items) => slot.and_then(|i| items.get(i)).cloned(),
            other => {
                return Err(Self::error(format!(
                    "Cannot index into {}",
                    other.kind()
                )))
            }
        };
        found.ok_or_else(|| Self::error(format!("Index out of range: {index}")))
    }
}

impl From<Value> for Passable {
    fn from(value: Value) -> Self {
        Self::Data(value)
    }
}

impl From<&str> for Passable {
    fn from(s: &str) -> Self {
        Self::Data(Value::string(s))
    }
}

impl From<i64> for Passable {
    fn from(i: i64) -> Self {
        Self::Data(Value::int(i))
    }
}

impl From<Promise> for Passable {
    fn from(p: Promise) -> Self {
        Self::Promise(p)
    }
}

impl fmt::Debug for Passable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Data(v) => write!(f, "Data({v})"),
            Self::List(items) => f.debug_list().entries(items).finish(),
            Self::Dictionary(entries) => f
                .debug_map()
                .entries(entries.iter().map(|(k, v)| (k.to_string(), v)))
                .finish(),
            Self::Tagged { label, fields } => write!(f, "Tagged({label:?}, {fields:?})"),
            Self::Object(ObjectRef::Local(_)) => write!(f, "Object(local)"),
            Self::Object(ObjectRef::Remote(r)) => write!(f, "Object(remote #{})", r.position()),
            Self::Promise(p) => write!(f, "{p:?}"),
            Self::Error(reason) => write!(f, "Error({reason:?})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo() -> Passable {
        Passable::from_fn(|method, args| {
            Ok(Passable::list(
                std::iter::once(Passable::from(method)).chain(args).collect(),
            ))
        })
    }

    #[test]
    fn test_plain_structures_collapse_to_data() {
        let list = Passable::list(vec![Passable::from(1i64), Passable::from("a")]);
        match list {
            Passable::Data(Value::List(items)) => assert_eq!(items.len(), 2),
            other => panic!("Expected Data, got {other:?}"),
        }

        let mixed = Passable::list(vec![Passable::from(1i64), echo()]);
        assert!(matches!(mixed, Passable::List(_)));
    }

    #[test]
    fn test_remotable_and_local() {
        let object = echo();
        assert!(object.is_remotable());
        assert!(object.is_local());
        assert!(!Passable::from("x").is_remotable());
        assert!(!Passable::Promise(Promise::pending().0).is_remotable());
    }

    #[test]
    fn test_get_field() {
        let record = Passable::dictionary(vec![
            (Value::string("name"), Passable::from("alice")),
            (Value::string("friend"), echo()),
        ]);
        assert_eq!(record.get_field("name").unwrap().as_str(), Some("alice"));
        assert!(record.get_field("friend").unwrap().is_remotable());
        assert!(record.get_field("missing").is_err());
        assert!(Passable::from(3i64).get_field("x").is_err());
    }

    #[test]
    fn test_get_index() {
        let list = Passable::Data(Value::List(vec![Value::int(10), Value::int(20)]));
        assert!(matches!(list.get_index(1), Ok(Passable::Data(_))));
        assert!(list.get_index(2).is_err());
        assert!(echo().get_index(0).is_err());
    }

    #[test]
    fn test_object_identity() {
        let a = echo();
        let b = echo();
        let (Passable::Object(a), Passable::Object(b)) = (a, b) else {
            panic!("Expected objects");
        };
        assert!(a.same(&a.clone()));
        assert!(!a.same(&b));
    }

    #[test]
    fn test_closure_invocable() {
        let Passable::Object(ObjectRef::Local(object)) = echo() else {
            panic!("Expected local object");
        };
        let result = object.invoke("ping", vec![Passable::from(1i64)]).unwrap();
        assert_eq!(
            result.as_value(),
            Some(&Value::List(vec![Value::string("ping"), Value::int(1)]))
        );
    }
}
