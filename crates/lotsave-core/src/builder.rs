//! Two-phase reconstruction of a [`WorldSnapshot`].
//!
//! Phase 1 materializes every entity graph. Entities whose graph reaches a
//! class the registry does not know are skipped before anything is built,
//! together with every other entity sharing the offending node. The surviving
//! roots are instantiated from their class, every other node gets an empty
//! shell up front so that references (forward, backward and cyclic) always
//! find their target, then payloads are decoded root by root. Phase 2 decodes the schedules, where every
//! reference must resolve to a known entity or object; a single unresolved
//! reference fails the whole load.
//!
//! The builder never installs anything. It returns the staged entities and
//! leaves installation to the caller, so a failed load leaves nothing behind
//! but unrooted objects for the collector.

use std::collections::{HashMap, HashSet};

use tracing::{debug, instrument, warn};

use crate::codec::unescape_body;
use crate::id::{Cid, ClassId, ClosureId, TableId, Tick};
use crate::runtime::{CLASS_LINK, ScriptRuntime};
use crate::scheduler::{PendingCall, TickScheduler};
use crate::snapshot::{
    AddressToken, DecodeError, EntityRecord, Entry, GraphNode, InferredValue, WorldSnapshot,
    parse_tick_key,
};
use crate::value::Value;

// ---------------------------------------------------------------------------
// Errors and reports
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("schedule of {cid} references {token}, which names no loaded entity or object")]
    MissingCrossReference { cid: Cid, token: AddressToken },
    #[error("schedule of {cid} references unknown class {class}")]
    UnknownScheduledClass { cid: Cid, class: ClassId },
    #[error("schedule of {cid} has invalid tick key {key:?}")]
    BadTickKey { cid: Cid, key: String },
}

/// Why an entity record was not staged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// The record names a class the registry does not know.
    UnknownClass(ClassId),
    /// The entity's graph references a class the registry does not know.
    UnknownClassReference(ClassId),
    /// Another record earlier in the snapshot has the same cid.
    DuplicateCid,
    /// An entity with this cid is already live.
    CidInUse,
    /// No table node is stored under the entity's cid.
    MissingRoot,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedEntity {
    pub cid: Cid,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub loaded: usize,
    pub skipped: Vec<SkippedEntity>,
    /// Graph values that could not be resolved and were set to nil.
    pub nulled_values: usize,
    /// Function nodes whose body could not be restored.
    pub broken_closures: usize,
    /// Schedule keys written as floats by older saves.
    pub legacy_tick_keys: usize,
    /// Tick recorded in the snapshot header.
    pub saved_tick: Tick,
}

/// An entity reconstructed but not yet installed.
#[derive(Debug)]
pub struct StagedEntity {
    pub cid: Cid,
    pub class: ClassId,
    pub root: TableId,
    pub schedule: TickScheduler,
    pub healthy: bool,
}

#[derive(Debug)]
pub struct LoadedWorld {
    pub entities: Vec<StagedEntity>,
    pub report: LoadReport,
}

// ---------------------------------------------------------------------------
// GraphBuilder
// ---------------------------------------------------------------------------

pub struct GraphBuilder<'r, 's> {
    runtime: &'r mut ScriptRuntime,
    snapshot: &'s WorldSnapshot,
    /// Token to reconstructed object.
    objects: HashMap<AddressToken, Value>,
    /// Cid tokens of every entity record, staged or not.
    root_tokens: HashSet<AddressToken>,
    report: LoadReport,
}

struct Staging<'s> {
    record: &'s EntityRecord,
    root: TableId,
}

impl<'r, 's> GraphBuilder<'r, 's> {
    /// Rebuild `snapshot` on `runtime`.
    ///
    /// `live` resolves cids of entities that already exist outside the
    /// snapshot. Records whose cid it knows are skipped, and schedule
    /// references to them resolve to the live root.
    #[instrument(skip_all, name = "load_world", fields(entities = snapshot.entities.len(), nodes = snapshot.nodes.len()))]
    pub fn load(
        runtime: &'r mut ScriptRuntime,
        snapshot: &'s WorldSnapshot,
        live: impl Fn(&Cid) -> Option<TableId>,
    ) -> Result<LoadedWorld, LoadError> {
        snapshot.header.validate()?;
        let mut builder = GraphBuilder {
            runtime,
            snapshot,
            objects: HashMap::new(),
            root_tokens: snapshot.entities.iter().map(EntityRecord::token).collect(),
            report: LoadReport {
                saved_tick: snapshot.header.tick,
                ..LoadReport::default()
            },
        };

        let was_collecting = builder.runtime.heap.gc_stop();
        let result = builder.run(&live);
        if was_collecting {
            builder.runtime.heap.gc_restart();
        }
        result
    }

    fn run(&mut self, live: &impl Fn(&Cid) -> Option<TableId>) -> Result<LoadedWorld, LoadError> {
        let admitted = self.admit_records(live);
        let taint = self.unknown_class_taint();
        let mut staging = Vec::with_capacity(admitted.len());
        for record in admitted {
            if let Some(class) = self.reached_unknown_class(record, &taint) {
                self.skip(&record.cid, SkipReason::UnknownClassReference(class));
                continue;
            }
            match self.instantiate_root(record) {
                Some(root) => staging.push(Staging { record, root }),
                None => self.skip(&record.cid, SkipReason::UnknownClass(record.class.clone())),
            }
        }
        self.allocate_shells();
        self.decode_graphs(&staging);

        // Phase 2.
        let staged_cids: HashMap<Cid, TableId> = staging
            .iter()
            .map(|staged| (staged.record.cid.clone(), staged.root))
            .collect();
        let mut entities = Vec::with_capacity(staging.len());
        for Staging { record, root } in staging {
            let schedule = self.decode_schedule(record, &staged_cids, live)?;
            entities.push(StagedEntity {
                cid: record.cid.clone(),
                class: record.class.clone(),
                root,
                schedule,
                healthy: record.healthy,
            });
        }

        self.report.loaded = entities.len();
        debug!(
            loaded = self.report.loaded,
            skipped = self.report.skipped.len(),
            nulled = self.report.nulled_values,
            "graph built"
        );
        Ok(LoadedWorld {
            entities,
            report: std::mem::take(&mut self.report),
        })
    }

    fn skip(&mut self, cid: &Cid, reason: SkipReason) {
        warn!(cid = %cid, reason = ?reason, "entity skipped on load");
        self.report.skipped.push(SkippedEntity {
            cid: cid.clone(),
            reason,
        });
    }

    // -- Phase 1 --

    /// Records that pass the structural checks, in snapshot order.
    fn admit_records(&mut self, live: &impl Fn(&Cid) -> Option<TableId>) -> Vec<&'s EntityRecord> {
        let snapshot = self.snapshot;
        let mut seen = HashSet::new();
        let mut admitted = Vec::new();

        for record in &snapshot.entities {
            if !seen.insert(&record.cid) {
                self.skip(&record.cid, SkipReason::DuplicateCid);
                continue;
            }
            if live(&record.cid).is_some() {
                self.skip(&record.cid, SkipReason::CidInUse);
                continue;
            }
            if !self.runtime.classes().is_registered(&record.class) {
                self.skip(&record.cid, SkipReason::UnknownClass(record.class.clone()));
                continue;
            }
            let token = record.token();
            if !matches!(snapshot.nodes.get(&token), Some(GraphNode::Table { .. })) {
                self.skip(&record.cid, SkipReason::MissingRoot);
                continue;
            }
            admitted.push(record);
        }
        admitted
    }

    /// Map every node that reaches a reference to an unregistered class to
    /// that class. Reachability does not pass through other entity roots:
    /// a reference to a root is resolved by identity, not by its contents.
    fn unknown_class_taint(&self) -> HashMap<&'s AddressToken, ClassId> {
        let snapshot = self.snapshot;
        let mut referrers: HashMap<AddressToken, Vec<&'s AddressToken>> = HashMap::new();
        let mut taint = HashMap::new();
        let mut stack = Vec::new();

        for (token, node) in &snapshot.nodes {
            let mut refs = Vec::new();
            let mut unknown = None;
            for value in node_values(node) {
                collect_references(value, &mut refs);
                if unknown.is_none() {
                    unknown = self.first_unknown_class(value);
                }
            }
            for target in refs {
                referrers.entry(target).or_default().push(token);
            }
            if let Some(class) = unknown {
                taint.insert(token, class);
                stack.push(token);
            }
        }

        while let Some(token) = stack.pop() {
            if self.root_tokens.contains(token) {
                continue;
            }
            let (Some(class), Some(parents)) = (taint.get(token).cloned(), referrers.get(token))
            else {
                continue;
            };
            for &parent in parents {
                if !taint.contains_key(parent) {
                    taint.insert(parent, class.clone());
                    stack.push(parent);
                }
            }
        }
        taint
    }

    /// The first unknown class reachable from the entity's root or from the
    /// graph nodes its schedule arguments name.
    fn reached_unknown_class(
        &self,
        record: &EntityRecord,
        taint: &HashMap<&AddressToken, ClassId>,
    ) -> Option<ClassId> {
        if let Some(class) = taint.get(&record.token()) {
            return Some(class.clone());
        }
        let mut refs = Vec::new();
        for call in record.sys.sched.values().flatten() {
            for arg in &call.arguments {
                collect_references(arg, &mut refs);
            }
        }
        refs.iter()
            .filter(|token| !self.root_tokens.contains(*token))
            .find_map(|token| taint.get(token).cloned())
    }

    fn first_unknown_class(&self, value: &InferredValue) -> Option<ClassId> {
        match value {
            InferredValue::ClassReference(id) if self.runtime.class_table(id).is_none() => {
                Some(id.clone())
            }
            InferredValue::SerializedFunction {
                class,
                context,
                args,
                ..
            } => {
                if !self.runtime.classes().is_registered(class) {
                    return Some(class.clone());
                }
                std::iter::once(&**context)
                    .chain(args)
                    .find_map(|v| self.first_unknown_class(v))
            }
            _ => None,
        }
    }

    fn instantiate_root(&mut self, record: &'s EntityRecord) -> Option<TableId> {
        let root = self.runtime.construct_instance(&record.class).ok()?;

        // Saved state replaces the class defaults wholesale.
        let class_link = self.runtime.heap.get_field(root, CLASS_LINK).cloned();
        if let Some(table) = self.runtime.heap.table_mut(root) {
            table.clear();
        }
        if let Some(link) = class_link {
            self.runtime.heap.set_field(root, CLASS_LINK, link);
        }

        self.objects.insert(record.token(), Value::Table(root));
        Some(root)
    }

    fn allocate_shells(&mut self) {
        let snapshot = self.snapshot;
        for (token, node) in &snapshot.nodes {
            if self.root_tokens.contains(token) {
                continue;
            }
            match node {
                GraphNode::Table { .. } => {
                    let table = self.runtime.heap.new_table();
                    self.objects.insert(token.clone(), Value::Table(table));
                }
                GraphNode::Function { body, len, .. } => {
                    let restored = unescape_body(body, *len)
                        .map_err(|e| e.to_string())
                        .and_then(|code| {
                            self.runtime
                                .load_closure(code, Vec::new())
                                .map_err(|e| e.to_string())
                        });
                    match restored {
                        Ok(closure) => {
                            self.objects.insert(token.clone(), Value::Closure(closure));
                        }
                        Err(err) => {
                            warn!(token = %token, error = %err, "function node not restored");
                            self.report.broken_closures += 1;
                        }
                    }
                }
            }
        }
    }

    /// Fill every node reachable from each staged root or from its schedule
    /// arguments. A node shared by several entities is filled by the first
    /// one to reach it.
    fn decode_graphs(&mut self, staging: &[Staging<'s>]) {
        let snapshot = self.snapshot;
        let mut filled: HashSet<&AddressToken> = HashSet::new();

        for staged in staging {
            let own = staged.record.token();
            let mut stack = vec![own.clone()];
            for calls in staged.record.sys.sched.values() {
                for call in calls {
                    for arg in &call.arguments {
                        collect_references(arg, &mut stack);
                    }
                }
            }
            stack.retain(|t| *t == own || !self.root_tokens.contains(t));
            while let Some(token) = stack.pop() {
                let Some((token, node)) = snapshot.nodes.get_key_value(&token) else {
                    continue;
                };
                if !filled.insert(token) {
                    continue;
                }
                let Some(target) = self.objects.get(token).cloned() else {
                    continue;
                };
                match (node, target) {
                    (GraphNode::Table { entries }, Value::Table(table)) => {
                        self.fill_table(table, entries, &mut stack);
                    }
                    (GraphNode::Function { upvalues, .. }, Value::Closure(closure)) => {
                        self.fill_closure(closure, upvalues, &mut stack);
                    }
                    _ => {}
                }
            }
        }
    }

    fn fill_table(
        &mut self,
        table: TableId,
        entries: &[Entry],
        stack: &mut Vec<AddressToken>,
    ) {
        for entry in entries {
            let key = self.decode_graph_value(&entry.key, stack);
            let value = self.decode_graph_value(&entry.value, stack);
            if key.is_nil() {
                debug!("entry with unresolved key dropped");
                continue;
            }
            self.runtime.heap.set(table, key, value);
        }
    }

    fn fill_closure(
        &mut self,
        closure: ClosureId,
        upvalues: &[Entry],
        stack: &mut Vec<AddressToken>,
    ) {
        for entry in upvalues {
            let InferredValue::String(name) = &entry.key else {
                warn!("upvalue without a string name dropped");
                self.report.nulled_values += 1;
                continue;
            };
            let value = self.decode_graph_value(&entry.value, stack);
            self.runtime.heap.set_upvalue(closure, name, value);
        }
    }

    /// Inverse of the serializer's value inference for graph payloads.
    /// Unresolvable references, including references to skipped entities,
    /// become nil. Unknown classes never get here: their entities are
    /// skipped before decoding.
    fn decode_graph_value(&mut self, value: &InferredValue, stack: &mut Vec<AddressToken>) -> Value {
        match value {
            InferredValue::Null => Value::Nil,
            InferredValue::Bool(b) => Value::Bool(*b),
            InferredValue::Number(n) => Value::Number(*n),
            InferredValue::String(s) => Value::Str(s.clone()),
            InferredValue::Reference(token) => match self.objects.get(token) {
                Some(object) => {
                    if !self.root_tokens.contains(token) {
                        stack.push(token.clone());
                    }
                    object.clone()
                }
                None => {
                    warn!(token = %token, "unresolved reference loaded as nil");
                    self.report.nulled_values += 1;
                    Value::Nil
                }
            },
            InferredValue::ClassReference(id) => match self.runtime.class_table(id) {
                Some(table) => Value::Table(table),
                None => self.null_unknown_class(id),
            },
            InferredValue::EnvironmentReference(env) => {
                Value::Table(self.runtime.environment(*env))
            }
            InferredValue::SerializedFunction {
                class,
                method,
                context,
                args,
            } => {
                if !self.runtime.classes().is_registered(class) {
                    return self.null_unknown_class(class);
                }
                let context = self.decode_graph_value(context, stack);
                let args = args
                    .iter()
                    .map(|a| self.decode_graph_value(a, stack))
                    .collect();
                Value::Closure(self.runtime.bind_method(class, method, context, args))
            }
        }
    }

    fn null_unknown_class(&mut self, class: &ClassId) -> Value {
        warn!(class = %class, "unknown class loaded as nil");
        self.report.nulled_values += 1;
        Value::Nil
    }

    // -- Phase 2 --

    fn decode_schedule(
        &mut self,
        record: &EntityRecord,
        staged: &HashMap<Cid, TableId>,
        live: &impl Fn(&Cid) -> Option<TableId>,
    ) -> Result<TickScheduler, LoadError> {
        let mut schedule = TickScheduler::new();
        for (key, calls) in &record.sys.sched {
            let at = parse_tick_key(key).ok_or_else(|| LoadError::BadTickKey {
                cid: record.cid.clone(),
                key: key.clone(),
            })?;
            if key.parse::<Tick>().is_err() {
                warn!(cid = %record.cid, key = %key, tick = at, "legacy tick key rounded");
                self.report.legacy_tick_keys += 1;
            }

            let mut bucket = schedule.pending_at(at).to_vec();
            for call in calls {
                let arguments = call
                    .arguments
                    .iter()
                    .map(|a| self.decode_scheduled_value(a, &record.cid, staged, live))
                    .collect::<Result<Vec<_>, _>>()?;
                bucket.push(PendingCall::new(call.method.as_str(), arguments));
            }
            schedule.insert_bucket(at, bucket);
        }
        Ok(schedule)
    }

    /// Strict decoding for schedule arguments: a reference resolves through
    /// the staged entities, then live entities, then numbered graph nodes. A
    /// cid token never falls through to a plain node.
    fn decode_scheduled_value(
        &mut self,
        value: &InferredValue,
        cid: &Cid,
        staged: &HashMap<Cid, TableId>,
        live: &impl Fn(&Cid) -> Option<TableId>,
    ) -> Result<Value, LoadError> {
        Ok(match value {
            InferredValue::Null => Value::Nil,
            InferredValue::Bool(b) => Value::Bool(*b),
            InferredValue::Number(n) => Value::Number(*n),
            InferredValue::String(s) => Value::Str(s.clone()),
            InferredValue::Reference(token) => {
                let target = token.as_cid();
                if let Some(root) = staged.get(&target) {
                    Value::Table(*root)
                } else if let Some(root) = live(&target) {
                    Value::Table(root)
                } else if let Some(object) = self.objects.get(token).filter(|_| token.is_numbered()) {
                    object.clone()
                } else {
                    return Err(LoadError::MissingCrossReference {
                        cid: cid.clone(),
                        token: token.clone(),
                    });
                }
            }
            InferredValue::ClassReference(id) => match self.runtime.class_table(id) {
                Some(table) => Value::Table(table),
                None => {
                    return Err(LoadError::UnknownScheduledClass {
                        cid: cid.clone(),
                        class: id.clone(),
                    });
                }
            },
            InferredValue::EnvironmentReference(env) => {
                Value::Table(self.runtime.environment(*env))
            }
            InferredValue::SerializedFunction {
                class,
                method,
                context,
                args,
            } => {
                if !self.runtime.classes().is_registered(class) {
                    return Err(LoadError::UnknownScheduledClass {
                        cid: cid.clone(),
                        class: class.clone(),
                    });
                }
                let context = self.decode_scheduled_value(context, cid, staged, live)?;
                let args = args
                    .iter()
                    .map(|a| self.decode_scheduled_value(a, cid, staged, live))
                    .collect::<Result<Vec<_>, _>>()?;
                Value::Closure(self.runtime.bind_method(class, method, context, args))
            }
        })
    }
}

fn node_values(node: &GraphNode) -> impl Iterator<Item = &InferredValue> {
    let entries = match node {
        GraphNode::Table { entries } => entries,
        GraphNode::Function { upvalues, .. } => upvalues,
    };
    entries.iter().flat_map(|e| [&e.key, &e.value])
}

fn collect_references(value: &InferredValue, out: &mut Vec<AddressToken>) {
    match value {
        InferredValue::Reference(token) => out.push(token.clone()),
        InferredValue::SerializedFunction { context, args, .. } => {
            collect_references(context, out);
            for arg in args {
                collect_references(arg, out);
            }
        }
        _ => {}
    }
}
