//! Typed property values.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::state::id::{Name, NodeId};

/// The type of a property value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueKind {
    String,
    Long,
    Double,
    Boolean,
    Date,
    Name,
    Binary,
    Reference,
    WeakReference,
}

impl ValueKind {
    /// check if values of this kind point at another node
    pub fn is_reference(&self) -> bool {
        matches!(self, ValueKind::Reference | ValueKind::WeakReference)
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ValueKind::String => "STRING",
            ValueKind::Long => "LONG",
            ValueKind::Double => "DOUBLE",
            ValueKind::Boolean => "BOOLEAN",
            ValueKind::Date => "DATE",
            ValueKind::Name => "NAME",
            ValueKind::Binary => "BINARY",
            ValueKind::Reference => "REFERENCE",
            ValueKind::WeakReference => "WEAKREFERENCE",
        };
        write!(f, "{}", s)
    }
}

/// A single property value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum Value {
    String(String),
    Long(i64),
    Double(f64),
    Boolean(bool),
    Date(DateTime<Utc>),
    Name(Name),
    Binary(Vec<u8>),
    Reference(NodeId),
    WeakReference(NodeId),
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::String(_) => ValueKind::String,
            Value::Long(_) => ValueKind::Long,
            Value::Double(_) => ValueKind::Double,
            Value::Boolean(_) => ValueKind::Boolean,
            Value::Date(_) => ValueKind::Date,
            Value::Name(_) => ValueKind::Name,
            Value::Binary(_) => ValueKind::Binary,
            Value::Reference(_) => ValueKind::Reference,
            Value::WeakReference(_) => ValueKind::WeakReference,
        }
    }

    /// The referenced node, for reference-typed values.
    pub fn target(&self) -> Option<&NodeId> {
        match self {
            Value::Reference(id) | Value::WeakReference(id) => Some(id),
            _ => None,
        }
    }

    /// Rewrite a transient reference target to its permanent id.
    pub(crate) fn remap(&mut self, assigned: &HashMap<NodeId, NodeId>) {
        if let Value::Reference(id) | Value::WeakReference(id) = self {
            if let Some(permanent) = assigned.get(id) {
                *id = permanent.clone();
            }
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Long(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl From<f64> for Value {
    fn from(d: f64) -> Self {
        Value::Double(d)
    }
}

/// Input for creating or modifying a property.
#[derive(Debug, Clone, PartialEq)]
pub enum Values {
    /// Exactly one value.
    Single(Value),
    /// Zero or more values of one kind.
    Multiple { kind: ValueKind, values: Vec<Value> },
}

impl Values {
    pub fn single(value: impl Into<Value>) -> Self {
        Values::Single(value.into())
    }

    pub fn multiple(kind: ValueKind, values: Vec<Value>) -> Self {
        Values::Multiple { kind, values }
    }

    pub fn kind(&self) -> ValueKind {
        match self {
            Values::Single(v) => v.kind(),
            Values::Multiple { kind, .. } => *kind,
        }
    }

    pub fn is_multiple(&self) -> bool {
        matches!(self, Values::Multiple { .. })
    }

    pub fn into_vec(self) -> Vec<Value> {
        match self {
            Values::Single(v) => vec![v],
            Values::Multiple { values, .. } => values,
        }
    }
}
