//! Graph walker that turns tracked entities into a [`WorldSnapshot`].
//!
//! The walk assigns one [`AddressToken`] per distinct reachable table or
//! closure. A token is reserved when the object is first seen and its
//! contents are emitted later from a work stack, so every later path to the
//! same object, including cycles back into it, becomes a `Reference` and the
//! walk depth does not grow with the graph depth. Class tables and the two
//! namespace tables are substituted by short references and never inlined.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};

use tracing::{debug, instrument, warn};

use crate::codec::escape_bytes;
use crate::heap::{Proto, Upvalue};
use crate::id::{Cid, ClassId, ClosureId, TableId, Tick};
use crate::runtime::{BOUND_CLASS_UPVALUE, BOUND_METHOD_UPVALUE, CLASS_MARKER, ScriptRuntime};
use crate::scheduler::TickScheduler;
use crate::snapshot::{
    AddressToken, EntityRecord, Entry, Environment, GraphNode, InferredValue, PendingCallRecord,
    SnapshotHeader, SystemState, WorldSnapshot, tick_key,
};
use crate::value::Value;

// ---------------------------------------------------------------------------
// Inputs and outputs
// ---------------------------------------------------------------------------

/// An entity handed to the serializer.
#[derive(Debug, Clone, Copy)]
pub struct TrackedEntity<'a> {
    pub cid: &'a Cid,
    pub class: &'a ClassId,
    pub root: TableId,
    pub schedule: &'a TickScheduler,
    pub healthy: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SaveOptions {
    /// Visit table entries in canonical key order (numbers, then strings,
    /// then everything else) instead of insertion order. Equal worlds then
    /// save to identical bytes.
    pub canonical_order: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SaveReport {
    /// Graph nodes emitted.
    pub nodes: usize,
    /// Values with no persisted form that were written as `null`.
    pub lossy_coercions: usize,
    /// Closures whose code could not be dumped. References to them dangle.
    pub dropped_closures: usize,
    /// Objects reclaimed by the collection that follows the walk.
    pub freed: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum SaveError {
    #[error("entity {0} is tracked more than once")]
    DuplicateEntity(Cid),
    #[error("root table of entity {0} is not live")]
    DeadRoot(Cid),
}

// ---------------------------------------------------------------------------
// save_world
// ---------------------------------------------------------------------------

/// Serialize the graphs and schedules of `tracked` at `tick`.
///
/// Automatic collection is suspended for the walk. Afterwards a collection is
/// forced with the tracked roots and their schedule arguments as the only
/// roots besides the runtime's permanent ones, so every live entity must be
/// passed in.
#[instrument(skip_all, name = "save_world", fields(entities = tracked.len(), tick = tick))]
pub fn save_world(
    runtime: &mut ScriptRuntime,
    tracked: &[TrackedEntity<'_>],
    tick: Tick,
    options: SaveOptions,
) -> Result<(WorldSnapshot, SaveReport), SaveError> {
    let result = runtime.with_gc_paused(|rt| {
        let mut walker = Walker::new(rt, options);
        walker.run(tracked, tick)
    });
    let (snapshot, mut report) = result?;

    let roots: Vec<Value> = tracked
        .iter()
        .flat_map(|t| std::iter::once(Value::Table(t.root)).chain(t.schedule.roots()))
        .collect();
    report.freed = runtime.collect(roots);

    debug!(
        nodes = report.nodes,
        lossy = report.lossy_coercions,
        dropped = report.dropped_closures,
        "world saved"
    );
    Ok((snapshot, report))
}

/// True when a closure's upvalues are exactly the bound-method pair, both
/// holding strings.
pub fn can_use_fast_path(upvalues: &[Upvalue]) -> bool {
    if upvalues.len() != 2 {
        return false;
    }
    let is_str = |name: &str| {
        upvalues
            .iter()
            .any(|u| u.name == name && u.value.as_str().is_some())
    };
    is_str(BOUND_CLASS_UPVALUE) && is_str(BOUND_METHOD_UPVALUE)
}

// ---------------------------------------------------------------------------
// Walker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum ObjectRef {
    Table(TableId),
    Closure(ClosureId),
}

struct Walker<'r> {
    runtime: &'r ScriptRuntime,
    options: SaveOptions,
    substitutions: HashMap<ObjectRef, InferredValue>,
    tokens: HashMap<ObjectRef, AddressToken>,
    /// Cid tokens. Numbered tokens skip any value in here.
    root_tokens: HashSet<AddressToken>,
    /// Objects with a reserved token whose node is not emitted yet.
    pending: Vec<(ObjectRef, AddressToken)>,
    nodes: BTreeMap<AddressToken, GraphNode>,
    next_token: u64,
    report: SaveReport,
}

impl<'r> Walker<'r> {
    fn new(runtime: &'r ScriptRuntime, options: SaveOptions) -> Self {
        let mut walker = Self {
            runtime,
            options,
            substitutions: HashMap::new(),
            tokens: HashMap::new(),
            root_tokens: HashSet::new(),
            pending: Vec::new(),
            nodes: BTreeMap::new(),
            next_token: 1,
            report: SaveReport::default(),
        };
        walker.build_substitutions();
        walker
    }

    /// Register the singleton rules: every registered class table found under
    /// the class root, plus the engine and global namespaces.
    fn build_substitutions(&mut self) {
        let runtime = self.runtime;
        for env in [Environment::Engine, Environment::Global] {
            self.substitutions.insert(
                ObjectRef::Table(runtime.environment(env)),
                InferredValue::EnvironmentReference(env),
            );
        }

        let mut visited = HashSet::new();
        let mut stack = vec![runtime.class_root()];
        while let Some(namespace) = stack.pop() {
            if !visited.insert(namespace) {
                continue;
            }
            let Some(table) = runtime.heap.table(namespace) else {
                continue;
            };
            for (_, value) in table.entries() {
                let Some(child) = value.as_table() else {
                    continue;
                };
                match runtime.heap.get_field(child, CLASS_MARKER) {
                    Some(Value::Str(id)) => {
                        let id = ClassId::from(id.as_str());
                        if runtime.classes().is_registered(&id) {
                            self.substitutions
                                .insert(ObjectRef::Table(child), InferredValue::ClassReference(id));
                        } else {
                            debug!(class = %id, "marked table is not a registered class");
                        }
                    }
                    _ => stack.push(child),
                }
            }
        }
        debug!(rules = self.substitutions.len(), "substitutions built");
    }

    fn run(
        &mut self,
        tracked: &[TrackedEntity<'_>],
        tick: Tick,
    ) -> Result<(WorldSnapshot, SaveReport), SaveError> {
        // Roots take their cid as token up front, so a path from one entity
        // into another emits a reference instead of inlining it.
        for entity in tracked {
            if self.runtime.heap.table(entity.root).is_none() {
                return Err(SaveError::DeadRoot(entity.cid.clone()));
            }
            let token = AddressToken::for_root(entity.cid);
            let object = ObjectRef::Table(entity.root);
            if self.root_tokens.contains(&token) || self.tokens.contains_key(&object) {
                return Err(SaveError::DuplicateEntity(entity.cid.clone()));
            }
            self.root_tokens.insert(token.clone());
            self.tokens.insert(object, token);
        }

        for entity in tracked {
            self.pending.push((
                ObjectRef::Table(entity.root),
                AddressToken::for_root(entity.cid),
            ));
            self.drain();
        }

        let mut entities = Vec::with_capacity(tracked.len());
        for entity in tracked {
            let sys = self.emit_schedule(entity.schedule);
            self.drain();
            entities.push(EntityRecord {
                cid: entity.cid.clone(),
                class: entity.class.clone(),
                healthy: entity.healthy,
                sys,
            });
        }

        self.report.nodes = self.nodes.len();
        let snapshot = WorldSnapshot {
            header: SnapshotHeader::new(tick),
            nodes: std::mem::take(&mut self.nodes),
            entities,
        };
        Ok((snapshot, std::mem::take(&mut self.report)))
    }

    fn emit_schedule(&mut self, schedule: &TickScheduler) -> SystemState {
        let mut sys = SystemState::default();
        for (at, calls) in schedule.buckets() {
            let records = calls
                .iter()
                .map(|call| PendingCallRecord {
                    method: call.method.clone(),
                    arguments: call.arguments.iter().map(|a| self.infer_type(a)).collect(),
                })
                .collect();
            sys.sched.insert(tick_key(at), records);
        }
        sys
    }

    /// Emit the node of every object reserved but not yet visited.
    fn drain(&mut self) {
        while let Some((object, token)) = self.pending.pop() {
            match object {
                ObjectRef::Table(id) => self.materialize_table(id, token),
                ObjectRef::Closure(id) => self.materialize_closure(id, token),
            }
        }
    }

    /// Give `object` the next free numbered token and queue it for emission.
    fn reserve_token(&mut self, object: ObjectRef) -> AddressToken {
        let token = loop {
            let candidate = AddressToken::numbered(self.next_token);
            self.next_token += 1;
            if !self.root_tokens.contains(&candidate) {
                break candidate;
            }
        };
        self.tokens.insert(object, token.clone());
        self.pending.push((object, token.clone()));
        token
    }

    fn infer_type(&mut self, value: &Value) -> InferredValue {
        match value {
            Value::Nil => InferredValue::Null,
            Value::Bool(b) => InferredValue::Bool(*b),
            Value::Number(n) if n.is_finite() => InferredValue::Number(*n),
            Value::Number(n) => {
                warn!(value = %n, "non-finite number saved as null");
                self.report.lossy_coercions += 1;
                InferredValue::Null
            }
            Value::Str(s) => InferredValue::String(s.clone()),
            Value::Userdata(handle) => {
                warn!(handle, "userdata has no persisted form, saved as null");
                self.report.lossy_coercions += 1;
                InferredValue::Null
            }
            Value::Table(id) => {
                let object = ObjectRef::Table(*id);
                if let Some(sub) = self.substitutions.get(&object) {
                    return sub.clone();
                }
                if let Some(token) = self.tokens.get(&object) {
                    return InferredValue::Reference(token.clone());
                }
                if self.runtime.heap.table(*id).is_none() {
                    warn!("reference to a reclaimed table saved as null");
                    self.report.lossy_coercions += 1;
                    return InferredValue::Null;
                }
                InferredValue::Reference(self.reserve_token(object))
            }
            Value::Closure(id) => self.infer_closure(*id),
        }
    }

    fn infer_closure(&mut self, id: ClosureId) -> InferredValue {
        let runtime = self.runtime;
        let Some(closure) = runtime.heap.closure(id) else {
            warn!("reference to a reclaimed closure saved as null");
            self.report.lossy_coercions += 1;
            return InferredValue::Null;
        };

        if can_use_fast_path(&closure.upvalues) {
            let class = closure.upvalue(BOUND_CLASS_UPVALUE).and_then(Value::as_str);
            let method = closure.upvalue(BOUND_METHOD_UPVALUE).and_then(Value::as_str);
            if let (Some(class), Some(method)) = (class, method) {
                let (context, args) = match &closure.proto {
                    Proto::Bound { context, args } => (
                        self.infer_type(context),
                        args.iter().map(|a| self.infer_type(a)).collect(),
                    ),
                    _ => {
                        debug!(class, method, "closure has bound-method upvalues but no binding");
                        (InferredValue::Null, Vec::new())
                    }
                };
                return InferredValue::SerializedFunction {
                    class: ClassId::from(class),
                    method: method.to_string(),
                    context: Box::new(context),
                    args,
                };
            }
        }

        let object = ObjectRef::Closure(id);
        if let Some(token) = self.tokens.get(&object) {
            return InferredValue::Reference(token.clone());
        }
        InferredValue::Reference(self.reserve_token(object))
    }

    fn materialize_table(&mut self, id: TableId, token: AddressToken) {
        if self.nodes.contains_key(&token) {
            return;
        }
        let runtime = self.runtime;
        let Some(table) = runtime.heap.table(id) else {
            return;
        };

        let mut pairs: Vec<&(Value, Value)> = table.entries().iter().collect();
        if self.options.canonical_order {
            pairs.sort_by(|a, b| canonical_key_cmp(&a.0, &b.0));
        }

        let mut entries = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let key = self.infer_type(key);
            let value = self.infer_type(value);
            entries.push(Entry { key, value });
        }
        self.nodes.insert(token, GraphNode::Table { entries });
    }

    fn materialize_closure(&mut self, id: ClosureId, token: AddressToken) {
        let runtime = self.runtime;
        let code = match runtime.dump_closure(id) {
            Ok(code) => code,
            Err(err) => {
                warn!(token = %token, error = %err, "closure dropped from snapshot");
                self.report.dropped_closures += 1;
                return;
            }
        };

        let mut upvalues = Vec::new();
        for upvalue in runtime.heap.upvalues(id) {
            let value = self.infer_type(&upvalue.value);
            upvalues.push(Entry {
                key: InferredValue::String(upvalue.name.clone()),
                value,
            });
        }
        self.nodes.insert(
            token,
            GraphNode::Function {
                body: escape_bytes(&code),
                len: code.len(),
                upvalues,
            },
        );
    }
}

fn canonical_key_cmp(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Number(_) => 0,
            Value::Str(_) => 1,
            _ => 2,
        }
    }
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.total_cmp(y),
        (Value::Str(x), Value::Str(y)) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}
