//! The scripting runtime the persistence layer operates on.
//!
//! [`ScriptRuntime`] owns the object heap, the frozen class registry and the
//! live class tree, plus the two well-known namespace tables (engine and
//! global). It constructs instances, dispatches method calls, and dumps and
//! reloads closures.

use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use crate::class::ClassRegistry;
use crate::heap::{NativeFn, Proto, ScriptHeap, Upvalue};
use crate::id::{ClassId, ClosureId, TableId, Tick};
use crate::scheduler::TickScheduler;
use crate::snapshot::Environment;
use crate::value::Value;

/// Marker key identifying a class table; its value is the class id.
pub const CLASS_MARKER: &str = "__classid";

/// Instance field linking an object to its class table.
pub const CLASS_LINK: &str = "__class";

/// Upvalue names of a bound-method closure.
pub const BOUND_CLASS_UPVALUE: &str = "class_id";
pub const BOUND_METHOD_UPVALUE: &str = "method";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("unknown class: {0}")]
    UnknownClass(ClassId),
    #[error("method {method:?} not found on {target}")]
    MethodNotFound { target: String, method: String },
    #[error("object is no longer live")]
    DeadObject,
    #[error("closure cannot be dumped: it has no compiled code")]
    NotDumpable,
    #[error("no interpreter installed for compiled code")]
    NoInterpreter,
    #[error("invalid chunk: {0}")]
    InvalidChunk(String),
    #[error("bound method closure is missing its {0:?} upvalue")]
    MalformedBinding(&'static str),
    #[error("script error: {0}")]
    Script(String),
}

// ---------------------------------------------------------------------------
// Interpreter seam
// ---------------------------------------------------------------------------

/// Executes compiled closure bodies. The heap stores compiled code as opaque
/// bytes; an interpreter gives them meaning.
pub trait Interpreter {
    fn execute(
        &self,
        ctx: &mut CallContext<'_>,
        code: &[u8],
        upvalues: &[Upvalue],
        args: &[Value],
    ) -> Result<Value, RuntimeError>;

    /// Reject code this interpreter cannot run, before a closure is built.
    fn verify(&self, code: &[u8]) -> Result<(), RuntimeError> {
        let _ = code;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// CallContext
// ---------------------------------------------------------------------------

/// Passed to every native method and interpreter call.
pub struct CallContext<'a> {
    pub runtime: &'a mut ScriptRuntime,
    /// The receiver.
    pub this: Value,
    /// The tick the call runs on.
    pub tick: Tick,
    /// The receiver's scheduler, when the call runs on behalf of an entity.
    pub schedule: Option<&'a mut TickScheduler>,
}

impl CallContext<'_> {
    pub fn heap(&mut self) -> &mut ScriptHeap {
        &mut self.runtime.heap
    }

    pub fn this_table(&self) -> Result<TableId, RuntimeError> {
        self.this
            .as_table()
            .ok_or_else(|| RuntimeError::Script(format!("receiver is a {}", self.this.type_name())))
    }

    /// Read a field of the receiver. Missing fields read as `Nil`.
    pub fn get(&self, field: &str) -> Value {
        self.this
            .as_table()
            .and_then(|t| self.runtime.heap.get_field(t, field))
            .cloned()
            .unwrap_or(Value::Nil)
    }

    pub fn set(&mut self, field: &str, value: Value) -> Result<(), RuntimeError> {
        let table = self.this_table()?;
        if self.runtime.heap.set_field(table, field, value) {
            Ok(())
        } else {
            Err(RuntimeError::DeadObject)
        }
    }

    /// Schedule `method` on the receiver for `at`. Returns false when the
    /// call has no scheduler attached.
    pub fn schedule_at(&mut self, method: &str, args: Vec<Value>, at: Tick) -> bool {
        match self.schedule.as_deref_mut() {
            Some(schedule) => {
                schedule.register_callback(method, args, at);
                true
            }
            None => false,
        }
    }

    /// Schedule `method` on the receiver for the next tick.
    pub fn defer(&mut self, method: &str, args: Vec<Value>) -> Option<Tick> {
        let tick = self.tick;
        self.schedule
            .as_deref_mut()
            .map(|schedule| schedule.defer_callback(method, args, tick))
    }

    /// Call a method on another object. The receiver's scheduler is only
    /// passed along when `target` is the receiver itself.
    pub fn call(
        &mut self,
        target: TableId,
        method: &str,
        args: &[Value],
    ) -> Result<Value, RuntimeError> {
        let schedule = if self.this == Value::Table(target) {
            self.schedule.as_deref_mut()
        } else {
            None
        };
        self.runtime
            .call_method(target, method, args, self.tick, schedule)
    }
}

// ---------------------------------------------------------------------------
// ScriptRuntime
// ---------------------------------------------------------------------------

pub struct ScriptRuntime {
    pub heap: ScriptHeap,
    classes: ClassRegistry,
    class_tables: HashMap<ClassId, TableId>,
    class_root: TableId,
    engine_ns: TableId,
    global_ns: TableId,
    interpreter: Option<Rc<dyn Interpreter>>,
}

impl fmt::Debug for ScriptRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptRuntime")
            .field("classes", &self.classes.len())
            .field("tables", &self.heap.table_count())
            .field("closures", &self.heap.closure_count())
            .field("interpreter", &self.interpreter.is_some())
            .finish()
    }
}

impl ScriptRuntime {
    pub fn new(classes: ClassRegistry) -> Self {
        Self::with_heap(classes, ScriptHeap::new())
    }

    /// Build the runtime on a given heap and install the class tree:
    /// `Classes.<namespace...>.<id>`, each class table carrying
    /// [`CLASS_MARKER`].
    pub fn with_heap(classes: ClassRegistry, mut heap: ScriptHeap) -> Self {
        let global_ns = heap.new_table();
        let engine_ns = heap.new_table();
        let class_root = heap.new_table();
        heap.set_field(global_ns, "Engine", Value::Table(engine_ns));
        heap.set_field(global_ns, "Classes", Value::Table(class_root));

        let mut class_tables = HashMap::new();
        for class in classes.iter() {
            let mut parent = class_root;
            for segment in &class.namespace {
                let existing = heap.get_field(parent, segment).and_then(Value::as_table);
                parent = match existing {
                    Some(table) => table,
                    None => {
                        let table = heap.new_table();
                        heap.set_field(parent, segment, Value::Table(table));
                        table
                    }
                };
            }
            let table = heap.new_table();
            heap.set_field(table, CLASS_MARKER, Value::from(class.id.as_str()));
            heap.set_field(parent, class.id.as_str(), Value::Table(table));
            class_tables.insert(class.id.clone(), table);
        }

        Self {
            heap,
            classes,
            class_tables,
            class_root,
            engine_ns,
            global_ns,
            interpreter: None,
        }
    }

    pub fn set_interpreter(&mut self, interpreter: impl Interpreter + 'static) {
        self.interpreter = Some(Rc::new(interpreter));
    }

    pub fn classes(&self) -> &ClassRegistry {
        &self.classes
    }

    pub fn class_table(&self, id: &ClassId) -> Option<TableId> {
        self.class_tables.get(id).copied()
    }

    pub fn class_root(&self) -> TableId {
        self.class_root
    }

    pub fn environment(&self, env: Environment) -> TableId {
        match env {
            Environment::Engine => self.engine_ns,
            Environment::Global => self.global_ns,
        }
    }

    /// The class an instance belongs to, read through its class link.
    pub fn class_of(&self, object: TableId) -> Option<ClassId> {
        let class_table = self.heap.get_field(object, CLASS_LINK)?.as_table()?;
        let id = self.heap.get_field(class_table, CLASS_MARKER)?.as_str()?;
        Some(ClassId::from(id))
    }

    /// Create an instance: a table linked to its class table and seeded with
    /// the class's default fields.
    pub fn construct_instance(&mut self, class: &ClassId) -> Result<TableId, RuntimeError> {
        let def = self
            .classes
            .get(class)
            .ok_or_else(|| RuntimeError::UnknownClass(class.clone()))?;
        let class_table = self
            .class_tables
            .get(class)
            .copied()
            .ok_or_else(|| RuntimeError::UnknownClass(class.clone()))?;
        let fields = def.fields.clone();

        let instance = self.heap.new_table();
        self.heap
            .set_field(instance, CLASS_LINK, Value::Table(class_table));
        for (name, value) in fields {
            self.heap.set_field(instance, &name, value);
        }
        Ok(instance)
    }

    /// Invoke `method` on `this`. A closure stored in the object's own field
    /// wins over the class's native method.
    pub fn call_method(
        &mut self,
        this: TableId,
        method: &str,
        args: &[Value],
        tick: Tick,
        schedule: Option<&mut TickScheduler>,
    ) -> Result<Value, RuntimeError> {
        if self.heap.table(this).is_none() {
            return Err(RuntimeError::DeadObject);
        }
        if let Some(closure) = self.heap.get_field(this, method).and_then(Value::as_closure) {
            return self.call_closure(closure, Value::Table(this), args, tick, schedule);
        }
        let class = self
            .class_of(this)
            .ok_or_else(|| RuntimeError::MethodNotFound {
                target: "classless table".to_string(),
                method: method.to_string(),
            })?;
        self.call_class_method(&class, method, Value::Table(this), args, tick, schedule)
    }

    fn call_class_method(
        &mut self,
        class: &ClassId,
        method: &str,
        this: Value,
        args: &[Value],
        tick: Tick,
        schedule: Option<&mut TickScheduler>,
    ) -> Result<Value, RuntimeError> {
        let def = self
            .classes
            .get(class)
            .ok_or_else(|| RuntimeError::UnknownClass(class.clone()))?;
        let f: NativeFn = def
            .method(method)
            .cloned()
            .ok_or_else(|| RuntimeError::MethodNotFound {
                target: class.to_string(),
                method: method.to_string(),
            })?;
        let mut ctx = CallContext {
            runtime: self,
            this,
            tick,
            schedule,
        };
        f(&mut ctx, args)
    }

    pub fn call_closure(
        &mut self,
        id: ClosureId,
        this: Value,
        args: &[Value],
        tick: Tick,
        schedule: Option<&mut TickScheduler>,
    ) -> Result<Value, RuntimeError> {
        let closure = self.heap.closure(id).ok_or(RuntimeError::DeadObject)?.clone();
        match closure.proto {
            Proto::Native(f) => {
                let mut ctx = CallContext {
                    runtime: self,
                    this,
                    tick,
                    schedule,
                };
                f(&mut ctx, args)
            }
            Proto::Bound {
                context,
                args: bound,
            } => {
                let class = find_str_upvalue(&closure.upvalues, BOUND_CLASS_UPVALUE)
                    .ok_or(RuntimeError::MalformedBinding(BOUND_CLASS_UPVALUE))?;
                let method = find_str_upvalue(&closure.upvalues, BOUND_METHOD_UPVALUE)
                    .ok_or(RuntimeError::MalformedBinding(BOUND_METHOD_UPVALUE))?;
                let mut full = bound;
                full.extend_from_slice(args);
                self.call_class_method(&ClassId::from(class), method, context, &full, tick, schedule)
            }
            Proto::Compiled(code) => {
                let interpreter = self.interpreter.clone().ok_or(RuntimeError::NoInterpreter)?;
                let mut ctx = CallContext {
                    runtime: self,
                    this,
                    tick,
                    schedule,
                };
                interpreter.execute(&mut ctx, &code, &closure.upvalues, args)
            }
        }
    }

    /// Build a bound-method closure: calling it invokes `class.method` on
    /// `context` with `args` prepended.
    pub fn bind_method(
        &mut self,
        class: &ClassId,
        method: &str,
        context: Value,
        args: Vec<Value>,
    ) -> ClosureId {
        self.heap.new_closure(
            Proto::Bound { context, args },
            vec![
                Upvalue::new(BOUND_CLASS_UPVALUE, Value::from(class.as_str())),
                Upvalue::new(BOUND_METHOD_UPVALUE, Value::from(method)),
            ],
        )
    }

    pub fn new_native<F>(&mut self, f: F, upvalues: Vec<Upvalue>) -> ClosureId
    where
        F: Fn(&mut CallContext<'_>, &[Value]) -> Result<Value, RuntimeError> + 'static,
    {
        self.heap.new_closure(Proto::Native(Rc::new(f)), upvalues)
    }

    /// The compiled code of a closure. Native and bound closures have none.
    pub fn dump_closure(&self, id: ClosureId) -> Result<Vec<u8>, RuntimeError> {
        match &self.heap.closure(id).ok_or(RuntimeError::DeadObject)?.proto {
            Proto::Compiled(code) => Ok(code.clone()),
            Proto::Native(_) | Proto::Bound { .. } => Err(RuntimeError::NotDumpable),
        }
    }

    /// Rebuild a closure from dumped code. The installed interpreter, if any,
    /// verifies the code first.
    pub fn load_closure(
        &mut self,
        code: Vec<u8>,
        upvalues: Vec<Upvalue>,
    ) -> Result<ClosureId, RuntimeError> {
        if let Some(interpreter) = &self.interpreter {
            interpreter.verify(&code)?;
        }
        Ok(self.heap.new_closure(Proto::Compiled(code), upvalues))
    }

    /// Objects that live as long as the runtime.
    pub fn permanent_roots(&self) -> [Value; 3] {
        [
            Value::Table(self.global_ns),
            Value::Table(self.engine_ns),
            Value::Table(self.class_root),
        ]
    }

    /// Collect everything not reachable from the permanent roots or `extra`.
    pub fn collect(&mut self, extra: impl IntoIterator<Item = Value>) -> usize {
        let roots = self.permanent_roots();
        self.heap.collect(roots.into_iter().chain(extra))
    }

    /// Run `f` with automatic collection suspended, restoring the previous
    /// state afterwards.
    pub fn with_gc_paused<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        let was_collecting = self.heap.gc_stop();
        let result = f(self);
        if was_collecting {
            self.heap.gc_restart();
        }
        result
    }
}

fn find_str_upvalue<'a>(upvalues: &'a [Upvalue], name: &str) -> Option<&'a str> {
    upvalues
        .iter()
        .find(|u| u.name == name)
        .and_then(|u| u.value.as_str())
}
