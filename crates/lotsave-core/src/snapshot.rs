//! Persisted world snapshot: the wire shapes shared by the serializer and the
//! graph builder.
//!
//! A snapshot is a JSON document holding a map of address token to graph
//! node plus the ordered list of entity records. Table entries, upvalues and
//! call arguments are all [`InferredValue`]s.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::id::{Cid, ClassId, Tick};

/// Current document version. Increment when the wire format breaks.
pub const FORMAT_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("json decoding failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported snapshot version: expected {}, got {}", FORMAT_VERSION, .0)]
    UnsupportedVersion(u32),
    #[error("snapshot from future version {0} (this build supports up to {FORMAT_VERSION})")]
    FutureVersion(u32),
}

// ---------------------------------------------------------------------------
// Address tokens
// ---------------------------------------------------------------------------

/// Pass-scoped identity of one serialized table or closure. Entity roots use
/// their cid; every other node is numbered in walk order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AddressToken(pub String);

impl AddressToken {
    pub fn for_root(cid: &Cid) -> Self {
        Self(cid.0.clone())
    }

    pub fn numbered(n: u64) -> Self {
        Self(format!("#{n}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True for walk-order tokens (`#<n>`), false for entity cids.
    pub fn is_numbered(&self) -> bool {
        self.0.starts_with('#')
    }

    /// The cid this token would name if it were an entity root.
    pub fn as_cid(&self) -> Cid {
        Cid(self.0.clone())
    }
}

impl fmt::Display for AddressToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AddressToken {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ---------------------------------------------------------------------------
// InferredValue
// ---------------------------------------------------------------------------

/// The two well-known namespace singletons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Environment {
    #[serde(rename = "engine-namespace")]
    Engine,
    #[serde(rename = "global-namespace")]
    Global,
}

/// Encoding of any value appearing as a table key or value, an upvalue, or a
/// scheduled call argument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "WireValue", into = "WireValue")]
pub enum InferredValue {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Reference(AddressToken),
    ClassReference(ClassId),
    EnvironmentReference(Environment),
    SerializedFunction {
        class: ClassId,
        method: String,
        context: Box<InferredValue>,
        args: Vec<InferredValue>,
    },
}

impl InferredValue {
    pub fn reference(token: &str) -> Self {
        InferredValue::Reference(AddressToken::from(token))
    }

    pub fn as_reference(&self) -> Option<&AddressToken> {
        match self {
            InferredValue::Reference(token) => Some(token),
            _ => None,
        }
    }
}

/// Primitives travel as plain JSON; everything else as a `type`-tagged object.
#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum WireValue {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Tagged(TaggedValue),
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum TaggedValue {
    Ref {
        ptr: AddressToken,
    },
    Class {
        id: ClassId,
    },
    Envref {
        object: Environment,
    },
    Sfunction {
        class: ClassId,
        method: String,
        context: Box<InferredValue>,
        #[serde(default)]
        args: Vec<InferredValue>,
    },
}

impl From<WireValue> for InferredValue {
    fn from(wire: WireValue) -> Self {
        match wire {
            WireValue::Null => InferredValue::Null,
            WireValue::Bool(b) => InferredValue::Bool(b),
            WireValue::Number(n) => InferredValue::Number(n),
            WireValue::String(s) => InferredValue::String(s),
            WireValue::Tagged(TaggedValue::Ref { ptr }) => InferredValue::Reference(ptr),
            WireValue::Tagged(TaggedValue::Class { id }) => InferredValue::ClassReference(id),
            WireValue::Tagged(TaggedValue::Envref { object }) => {
                InferredValue::EnvironmentReference(object)
            }
            WireValue::Tagged(TaggedValue::Sfunction {
                class,
                method,
                context,
                args,
            }) => InferredValue::SerializedFunction {
                class,
                method,
                context,
                args,
            },
        }
    }
}

impl From<InferredValue> for WireValue {
    fn from(value: InferredValue) -> Self {
        match value {
            InferredValue::Null => WireValue::Null,
            InferredValue::Bool(b) => WireValue::Bool(b),
            InferredValue::Number(n) => WireValue::Number(n),
            InferredValue::String(s) => WireValue::String(s),
            InferredValue::Reference(ptr) => WireValue::Tagged(TaggedValue::Ref { ptr }),
            InferredValue::ClassReference(id) => WireValue::Tagged(TaggedValue::Class { id }),
            InferredValue::EnvironmentReference(object) => {
                WireValue::Tagged(TaggedValue::Envref { object })
            }
            InferredValue::SerializedFunction {
                class,
                method,
                context,
                args,
            } => WireValue::Tagged(TaggedValue::Sfunction {
                class,
                method,
                context,
                args,
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Graph nodes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub key: InferredValue,
    pub value: InferredValue,
}

/// One serialized table or closure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum GraphNode {
    Table {
        entries: Vec<Entry>,
    },
    Function {
        /// Escaped code bytes.
        body: String,
        /// Raw code length, before escaping.
        len: usize,
        upvalues: Vec<Entry>,
    },
}

// ---------------------------------------------------------------------------
// Entity records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingCallRecord {
    pub method: String,
    #[serde(default)]
    pub arguments: Vec<InferredValue>,
}

/// Engine-owned per-entity state carried alongside the instance payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemState {
    /// Tick (as a decimal string) to calls scheduled for it.
    #[serde(rename = "_sched", default)]
    pub sched: BTreeMap<String, Vec<PendingCallRecord>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub cid: Cid,
    pub class: ClassId,
    #[serde(default = "default_healthy")]
    pub healthy: bool,
    #[serde(rename = "_sys", default)]
    pub sys: SystemState,
}

fn default_healthy() -> bool {
    true
}

impl EntityRecord {
    pub fn token(&self) -> AddressToken {
        AddressToken::for_root(&self.cid)
    }
}

/// Schedule key for a tick.
pub fn tick_key(tick: Tick) -> String {
    tick.to_string()
}

/// Parse a schedule key. Integer keys are exact; float-looking keys from older
/// saves are rounded. Returns `None` for anything else.
pub fn parse_tick_key(key: &str) -> Option<Tick> {
    if let Ok(tick) = key.parse::<Tick>() {
        return Some(tick);
    }
    let float: f64 = key.parse().ok()?;
    if float.is_finite() && float >= 0.0 {
        Some(float.round() as Tick)
    } else {
        None
    }
}

// ---------------------------------------------------------------------------
// WorldSnapshot
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotHeader {
    pub version: u32,
    /// Tick counter at the time of the save.
    pub tick: Tick,
}

impl SnapshotHeader {
    pub fn new(tick: Tick) -> Self {
        Self {
            version: FORMAT_VERSION,
            tick,
        }
    }

    pub fn validate(&self) -> Result<(), DecodeError> {
        if self.version > FORMAT_VERSION {
            return Err(DecodeError::FutureVersion(self.version));
        }
        if self.version < FORMAT_VERSION {
            return Err(DecodeError::UnsupportedVersion(self.version));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorldSnapshot {
    pub header: SnapshotHeader,
    #[serde(default)]
    pub nodes: BTreeMap<AddressToken, GraphNode>,
    #[serde(default)]
    pub entities: Vec<EntityRecord>,
}

impl WorldSnapshot {
    pub fn new(tick: Tick) -> Self {
        Self {
            header: SnapshotHeader::new(tick),
            nodes: BTreeMap::new(),
            entities: Vec::new(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Parse a document and validate its header.
    pub fn from_json(json: &str) -> Result<Self, DecodeError> {
        let snapshot: WorldSnapshot = serde_json::from_str(json)?;
        snapshot.header.validate()?;
        Ok(snapshot)
    }

    pub fn node(&self, token: &str) -> Option<&GraphNode> {
        self.nodes.get(&AddressToken::from(token))
    }

    pub fn entity(&self, cid: &str) -> Option<&EntityRecord> {
        self.entities.iter().find(|e| e.cid.as_str() == cid)
    }

    pub fn table_count(&self) -> usize {
        self.nodes
            .values()
            .filter(|n| matches!(n, GraphNode::Table { .. }))
            .count()
    }

    pub fn function_count(&self) -> usize {
        self.nodes
            .values()
            .filter(|n| matches!(n, GraphNode::Function { .. }))
            .count()
    }

    /// Every value in the document, depth first: node entries, upvalues and
    /// schedule arguments.
    pub fn values(&self) -> Vec<&InferredValue> {
        fn walk<'a>(value: &'a InferredValue, out: &mut Vec<&'a InferredValue>) {
            out.push(value);
            if let InferredValue::SerializedFunction { context, args, .. } = value {
                walk(context, out);
                for arg in args {
                    walk(arg, out);
                }
            }
        }

        let mut out = Vec::new();
        for node in self.nodes.values() {
            let entries = match node {
                GraphNode::Table { entries } => entries,
                GraphNode::Function { upvalues, .. } => upvalues,
            };
            for entry in entries {
                walk(&entry.key, &mut out);
                walk(&entry.value, &mut out);
            }
        }
        for record in &self.entities {
            for calls in record.sys.sched.values() {
                for call in calls {
                    for arg in &call.arguments {
                        walk(arg, &mut out);
                    }
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitives_are_plain_json() {
        let json = serde_json::to_string(&vec![
            InferredValue::Null,
            InferredValue::Bool(true),
            InferredValue::Number(2.5),
            InferredValue::String("rex".into()),
        ])
        .unwrap();
        assert_eq!(json, r#"[null,true,2.5,"rex"]"#);
    }

    #[test]
    fn tagged_shapes_match_document_format() {
        let v = serde_json::to_value(InferredValue::reference("#3")).unwrap();
        assert_eq!(v, serde_json::json!({"type": "ref", "ptr": "#3"}));

        let v = serde_json::to_value(InferredValue::ClassReference(ClassId::from("Dog"))).unwrap();
        assert_eq!(v, serde_json::json!({"type": "class", "id": "Dog"}));

        let v = serde_json::to_value(InferredValue::EnvironmentReference(Environment::Global))
            .unwrap();
        assert_eq!(
            v,
            serde_json::json!({"type": "envref", "object": "global-namespace"})
        );
    }

    #[test]
    fn sfunction_decodes_from_document() {
        let json = r#"{"type":"sfunction","class":"Dog","method":"bark",
                       "context":{"type":"ref","ptr":"bb1"},"args":[1]}"#;
        let v: InferredValue = serde_json::from_str(json).unwrap();
        assert_eq!(
            v,
            InferredValue::SerializedFunction {
                class: ClassId::from("Dog"),
                method: "bark".into(),
                context: Box::new(InferredValue::reference("bb1")),
                args: vec![InferredValue::Number(1.0)],
            }
        );
    }

    #[test]
    fn integer_json_reads_as_number() {
        let v: InferredValue = serde_json::from_str("100").unwrap();
        assert_eq!(v, InferredValue::Number(100.0));
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let result: Result<InferredValue, _> = serde_json::from_str(r#"{"type":"blob"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn graph_node_shapes() {
        let node = GraphNode::Function {
            body: "ab".into(),
            len: 2,
            upvalues: vec![Entry {
                key: InferredValue::String("self".into()),
                value: InferredValue::reference("bb1"),
            }],
        };
        let v = serde_json::to_value(&node).unwrap();
        assert_eq!(v["type"], "function");
        assert_eq!(v["len"], 2);
        assert_eq!(v["upvalues"][0]["value"]["ptr"], "bb1");
    }

    #[test]
    fn entity_record_embeds_sys_sched() {
        let mut record = EntityRecord {
            cid: Cid::from("bb1"),
            class: ClassId::from("Timer"),
            healthy: true,
            sys: SystemState::default(),
        };
        record.sys.sched.insert(
            tick_key(100),
            vec![PendingCallRecord {
                method: "on_timer".into(),
                arguments: vec![InferredValue::reference("bb2")],
            }],
        );
        let v = serde_json::to_value(&record).unwrap();
        assert_eq!(v["_sys"]["_sched"]["100"][0]["method"], "on_timer");
    }

    #[test]
    fn entity_record_defaults() {
        let record: EntityRecord =
            serde_json::from_str(r#"{"cid":"bb1","class":"Dog"}"#).unwrap();
        assert!(record.healthy);
        assert!(record.sys.sched.is_empty());
    }

    #[test]
    fn tick_keys_parse() {
        assert_eq!(parse_tick_key("100"), Some(100));
        assert_eq!(parse_tick_key("100.0"), Some(100));
        assert_eq!(parse_tick_key("99.6"), Some(100));
        assert_eq!(parse_tick_key("-3"), None);
        assert_eq!(parse_tick_key("soon"), None);
    }

    #[test]
    fn header_validation() {
        assert!(SnapshotHeader::new(0).validate().is_ok());

        let future = SnapshotHeader {
            version: FORMAT_VERSION + 1,
            tick: 0,
        };
        assert!(matches!(future.validate(), Err(DecodeError::FutureVersion(_))));

        let past = SnapshotHeader { version: 0, tick: 0 };
        assert!(matches!(past.validate(), Err(DecodeError::UnsupportedVersion(0))));
    }

    #[test]
    fn from_json_rejects_future_version() {
        let json = format!(
            r#"{{"header":{{"version":{},"tick":0}}}}"#,
            FORMAT_VERSION + 1
        );
        assert!(matches!(
            WorldSnapshot::from_json(&json),
            Err(DecodeError::FutureVersion(_))
        ));
    }

    #[test]
    fn from_json_garbage_is_decode_error() {
        assert!(matches!(
            WorldSnapshot::from_json("not json"),
            Err(DecodeError::Json(_))
        ));
    }

    #[test]
    fn document_round_trips() {
        let mut snap = WorldSnapshot::new(7);
        snap.nodes.insert(
            AddressToken::from("bb1"),
            GraphNode::Table {
                entries: vec![Entry {
                    key: InferredValue::String("pal".into()),
                    value: InferredValue::reference("#1"),
                }],
            },
        );
        snap.nodes.insert(
            AddressToken::numbered(1),
            GraphNode::Table { entries: vec![] },
        );
        snap.entities.push(EntityRecord {
            cid: Cid::from("bb1"),
            class: ClassId::from("Dog"),
            healthy: false,
            sys: SystemState::default(),
        });

        let back = WorldSnapshot::from_json(&snap.to_json().unwrap()).unwrap();
        assert_eq!(back, snap);
        assert_eq!(back.table_count(), 2);
        assert_eq!(back.values().len(), 2);
    }
}
