//! Live runtime values.

use crate::id::{ClosureId, TableId};

/// A value held by the script runtime: a table entry, an upvalue, or a call
/// argument.
///
/// Tables and closures are handles into the [`ScriptHeap`](crate::heap::ScriptHeap);
/// equality on them is identity.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Nil,
    Bool(bool),
    Number(f64),
    Str(String),
    Table(TableId),
    Closure(ClosureId),
    /// Opaque host handle. Has no persisted form.
    Userdata(u64),
}

impl Value {
    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_table(&self) -> Option<TableId> {
        match self {
            Value::Table(id) => Some(*id),
            _ => None,
        }
    }

    pub fn as_closure(&self) -> Option<ClosureId> {
        match self {
            Value::Closure(id) => Some(*id),
            _ => None,
        }
    }

    /// True for values that carry no heap identity.
    pub fn is_primitive(&self) -> bool {
        matches!(
            self,
            Value::Nil | Value::Bool(_) | Value::Number(_) | Value::Str(_)
        )
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::Str(_) => "string",
            Value::Table(_) => "table",
            Value::Closure(_) => "function",
            Value::Userdata(_) => "userdata",
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<TableId> for Value {
    fn from(id: TableId) -> Self {
        Value::Table(id)
    }
}

impl From<ClosureId> for Value {
    fn from(id: ClosureId) -> Self {
        Value::Closure(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitive_classification() {
        assert!(Value::Nil.is_primitive());
        assert!(Value::from("x").is_primitive());
        assert!(Value::from(1.5).is_primitive());
        assert!(!Value::Userdata(3).is_primitive());
    }

    #[test]
    fn accessors_match_variant() {
        assert_eq!(Value::from("rex").as_str(), Some("rex"));
        assert_eq!(Value::from(4i64).as_number(), Some(4.0));
        assert_eq!(Value::from(true).as_bool(), Some(true));
        assert_eq!(Value::Nil.as_str(), None);
    }

    #[test]
    fn type_names() {
        assert_eq!(Value::Nil.type_name(), "nil");
        assert_eq!(Value::Userdata(0).type_name(), "userdata");
    }
}
