//! Serde data file structs for class manifests.
//!
//! A manifest declares the shape of each class: where it lives in the class
//! tree, its default fields and its creation hook. Native methods cannot be
//! expressed in data and are attached in Rust after loading.

use std::collections::BTreeMap;

use lotsave_core::value::Value;
use serde::Deserialize;

/// A class definition in a data file.
#[derive(Debug, Clone, Deserialize)]
pub struct ClassData {
    pub id: String,
    /// Namespace path, outermost first.
    #[serde(default)]
    pub namespace: Vec<String>,
    /// Default instance fields. Ordered by name.
    #[serde(default)]
    pub fields: BTreeMap<String, FieldValue>,
    /// Method run once after an instance is created.
    #[serde(default)]
    pub on_create: Option<String>,
}

/// A default field value. Only primitives can be declared in data.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Bool(bool),
    Number(f64),
    String(String),
}

impl From<FieldValue> for Value {
    fn from(v: FieldValue) -> Self {
        match v {
            FieldValue::Bool(b) => Value::Bool(b),
            FieldValue::Number(n) => Value::Number(n),
            FieldValue::String(s) => Value::Str(s),
        }
    }
}
