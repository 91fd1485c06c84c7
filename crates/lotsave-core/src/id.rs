use serde::{Deserialize, Serialize};
use slotmap::new_key_type;
use std::fmt;

new_key_type! {
    /// Identifies a table in the script heap.
    pub struct TableId;

    /// Identifies a closure in the script heap.
    pub struct ClosureId;
}

/// A discrete simulation tick.
pub type Tick = u64;

/// Identifies an entity. Unique within one engine.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cid(pub String);

impl Cid {
    pub fn new(cid: impl Into<String>) -> Self {
        Self(cid.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Cid {
    fn from(cid: &str) -> Self {
        Self(cid.to_string())
    }
}

/// Identifies a class in the class registry.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClassId(pub String);

impl ClassId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClassId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cid_equality() {
        assert_eq!(Cid::from("bb1"), Cid::new("bb1"));
        assert_ne!(Cid::from("bb1"), Cid::from("bb2"));
    }

    #[test]
    fn ids_display_without_quotes() {
        assert_eq!(Cid::from("bb1").to_string(), "bb1");
        assert_eq!(ClassId::from("Dog").to_string(), "Dog");
    }

    #[test]
    fn ids_serialize_transparently() {
        let json = serde_json::to_string(&ClassId::from("Dog")).unwrap();
        assert_eq!(json, "\"Dog\"");
        let cid: Cid = serde_json::from_str("\"bb7\"").unwrap();
        assert_eq!(cid.as_str(), "bb7");
    }

    #[test]
    fn ids_are_hashable() {
        use std::collections::HashMap;
        let mut map = HashMap::new();
        map.insert(Cid::from("bb1"), "dog");
        map.insert(Cid::from("bb2"), "timer");
        assert_eq!(map[&Cid::from("bb1")], "dog");
    }
}
