//! Arena storage for runtime tables and closures, with mark-and-sweep
//! reclamation.
//!
//! Object identity is a generation-checked [`slotmap`] key: a handle to a
//! reclaimed object never aliases a later allocation.

use std::collections::HashSet;
use std::fmt;
use std::rc::Rc;

use slotmap::SlotMap;
use tracing::debug;

use crate::id::{ClosureId, TableId};
use crate::runtime::{CallContext, RuntimeError};
use crate::value::Value;

/// Default number of allocations between automatic collections.
pub const DEFAULT_GC_THRESHOLD: usize = 4096;

/// A host-implemented function body.
pub type NativeFn = Rc<dyn Fn(&mut CallContext<'_>, &[Value]) -> Result<Value, RuntimeError>>;

// ---------------------------------------------------------------------------
// Table
// ---------------------------------------------------------------------------

/// An ordered key/value table. Iteration order is insertion order.
#[derive(Debug, Clone, Default)]
pub struct Table {
    entries: Vec<(Value, Value)>,
}

impl Table {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &Value) -> Option<&Value> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Set `key` to `value`. Assigning `Nil` removes the entry.
    pub fn set(&mut self, key: Value, value: Value) {
        let pos = self.entries.iter().position(|(k, _)| *k == key);
        match (pos, value.is_nil()) {
            (Some(i), true) => {
                self.entries.remove(i);
            }
            (Some(i), false) => self.entries[i].1 = value,
            (None, true) => {}
            (None, false) => self.entries.push((key, value)),
        }
    }

    pub fn entries(&self) -> &[(Value, Value)] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

// ---------------------------------------------------------------------------
// Closure
// ---------------------------------------------------------------------------

/// What a closure runs when called.
#[derive(Clone)]
pub enum Proto {
    /// Compiled code, executed by the runtime's interpreter. Dumpable.
    Compiled(Vec<u8>),
    /// Host function. Cannot be dumped.
    Native(NativeFn),
    /// Bound-method trampoline: calls the class method named by the
    /// closure's `class_id`/`method` upvalues on `context`, with `args`
    /// prepended to the call arguments.
    Bound { context: Value, args: Vec<Value> },
}

impl fmt::Debug for Proto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Proto::Compiled(code) => f.debug_tuple("Compiled").field(&code.len()).finish(),
            Proto::Native(_) => f.write_str("Native"),
            Proto::Bound { context, args } => f
                .debug_struct("Bound")
                .field("context", context)
                .field("args", args)
                .finish(),
        }
    }
}

/// A named captured variable.
#[derive(Debug, Clone, PartialEq)]
pub struct Upvalue {
    pub name: String,
    pub value: Value,
}

impl Upvalue {
    pub fn new(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Closure {
    pub proto: Proto,
    pub upvalues: Vec<Upvalue>,
}

impl Closure {
    pub fn upvalue(&self, name: &str) -> Option<&Value> {
        self.upvalues
            .iter()
            .find(|u| u.name == name)
            .map(|u| &u.value)
    }
}

// ---------------------------------------------------------------------------
// ScriptHeap
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct ScriptHeap {
    tables: SlotMap<TableId, Table>,
    closures: SlotMap<ClosureId, Closure>,
    /// Whether automatic collection is enabled.
    collecting: bool,
    /// Allocations since the last collection.
    allocated: usize,
    threshold: usize,
}

impl Default for ScriptHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptHeap {
    pub fn new() -> Self {
        Self::with_threshold(DEFAULT_GC_THRESHOLD)
    }

    pub fn with_threshold(threshold: usize) -> Self {
        Self {
            tables: SlotMap::with_key(),
            closures: SlotMap::with_key(),
            collecting: true,
            allocated: 0,
            threshold: threshold.max(1),
        }
    }

    // -- Tables --

    pub fn new_table(&mut self) -> TableId {
        self.allocated += 1;
        self.tables.insert(Table::new())
    }

    pub fn table(&self, id: TableId) -> Option<&Table> {
        self.tables.get(id)
    }

    pub fn table_mut(&mut self, id: TableId) -> Option<&mut Table> {
        self.tables.get_mut(id)
    }

    /// Read `table[key]`. Missing tables and keys both read as `None`.
    pub fn get(&self, id: TableId, key: &Value) -> Option<&Value> {
        self.tables.get(id).and_then(|t| t.get(key))
    }

    pub fn get_field(&self, id: TableId, name: &str) -> Option<&Value> {
        self.get(id, &Value::from(name))
    }

    /// Write `table[key] = value`. Returns false if the table is not live.
    pub fn set(&mut self, id: TableId, key: Value, value: Value) -> bool {
        match self.tables.get_mut(id) {
            Some(table) => {
                table.set(key, value);
                true
            }
            None => false,
        }
    }

    pub fn set_field(&mut self, id: TableId, name: &str, value: Value) -> bool {
        self.set(id, Value::from(name), value)
    }

    // -- Closures --

    pub fn new_closure(&mut self, proto: Proto, upvalues: Vec<Upvalue>) -> ClosureId {
        self.allocated += 1;
        self.closures.insert(Closure { proto, upvalues })
    }

    pub fn closure(&self, id: ClosureId) -> Option<&Closure> {
        self.closures.get(id)
    }

    pub fn upvalues(&self, id: ClosureId) -> &[Upvalue] {
        self.closures
            .get(id)
            .map(|c| c.upvalues.as_slice())
            .unwrap_or(&[])
    }

    /// Replace the upvalue called `name`, or append it.
    pub fn set_upvalue(&mut self, id: ClosureId, name: &str, value: Value) -> bool {
        let Some(closure) = self.closures.get_mut(id) else {
            return false;
        };
        match closure.upvalues.iter_mut().find(|u| u.name == name) {
            Some(slot) => slot.value = value,
            None => closure.upvalues.push(Upvalue::new(name, value)),
        }
        true
    }

    /// Whether the object behind a table or closure value is still live.
    pub fn contains(&self, value: &Value) -> bool {
        match value {
            Value::Table(id) => self.tables.contains_key(*id),
            Value::Closure(id) => self.closures.contains_key(*id),
            _ => true,
        }
    }

    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    pub fn closure_count(&self) -> usize {
        self.closures.len()
    }

    // -- Reclamation --

    /// Disable automatic collection. Returns whether it was enabled.
    pub fn gc_stop(&mut self) -> bool {
        std::mem::replace(&mut self.collecting, false)
    }

    pub fn gc_restart(&mut self) {
        self.collecting = true;
    }

    pub fn is_collecting(&self) -> bool {
        self.collecting
    }

    /// Whether an automatic collection is due.
    pub fn should_collect(&self) -> bool {
        self.collecting && self.allocated >= self.threshold
    }

    /// Mark everything reachable from `roots` and free the rest. Returns the
    /// number of objects freed.
    pub fn collect(&mut self, roots: impl IntoIterator<Item = Value>) -> usize {
        let mut live_tables: HashSet<TableId> = HashSet::new();
        let mut live_closures: HashSet<ClosureId> = HashSet::new();
        let mut stack: Vec<Value> = roots.into_iter().collect();

        while let Some(value) = stack.pop() {
            match value {
                Value::Table(id) => {
                    if let Some(table) = self.tables.get(id)
                        && live_tables.insert(id)
                    {
                        for (k, v) in table.entries() {
                            stack.push(k.clone());
                            stack.push(v.clone());
                        }
                    }
                }
                Value::Closure(id) => {
                    if let Some(closure) = self.closures.get(id)
                        && live_closures.insert(id)
                    {
                        stack.extend(closure.upvalues.iter().map(|u| u.value.clone()));
                        if let Proto::Bound { context, args } = &closure.proto {
                            stack.push(context.clone());
                            stack.extend(args.iter().cloned());
                        }
                    }
                }
                _ => {}
            }
        }

        let before = self.tables.len() + self.closures.len();
        self.tables.retain(|id, _| live_tables.contains(&id));
        self.closures.retain(|id, _| live_closures.contains(&id));
        let freed = before - (self.tables.len() + self.closures.len());
        self.allocated = 0;
        debug!(freed, live = before - freed, "heap collected");
        freed
    }
}
