//! Shared test helpers for unit tests, integration tests, and benchmarks.
//!
//! Gated behind `#[cfg(any(test, feature = "test-utils"))]` so these helpers
//! are available in unit tests, integration tests, and benchmarks (via the
//! `test-utils` feature).

use crate::class::{ClassDef, ClassRegistry, ClassRegistryBuilder};
use crate::engine::Engine;
use crate::heap::Upvalue;
use crate::runtime::{CallContext, Interpreter, RuntimeError, ScriptRuntime};
use crate::value::Value;

// ===========================================================================
// Native methods
// ===========================================================================

fn increment(ctx: &mut CallContext<'_>, field: &str) -> Result<(), RuntimeError> {
    let n = ctx.get(field).as_number().unwrap_or(0.0);
    ctx.set(field, Value::from(n + 1.0))
}

/// `barks += 1`
pub fn bark(ctx: &mut CallContext<'_>, _args: &[Value]) -> Result<Value, RuntimeError> {
    increment(ctx, "barks")?;
    Ok(Value::Nil)
}

/// `memory = args[0]`
pub fn remember(ctx: &mut CallContext<'_>, args: &[Value]) -> Result<Value, RuntimeError> {
    ctx.set("memory", args.first().cloned().unwrap_or(Value::Nil))?;
    Ok(Value::Nil)
}

/// Defers a `bark` to the next tick.
pub fn bark_later(ctx: &mut CallContext<'_>, _args: &[Value]) -> Result<Value, RuntimeError> {
    ctx.defer("bark", Vec::new())
        .ok_or_else(|| RuntimeError::Script("no scheduler attached".into()))?;
    Ok(Value::Nil)
}

/// Schedules a `bark` for the tick that is running.
pub fn bark_now(ctx: &mut CallContext<'_>, _args: &[Value]) -> Result<Value, RuntimeError> {
    let tick = ctx.tick;
    if !ctx.schedule_at("bark", Vec::new(), tick) {
        return Err(RuntimeError::Script("no scheduler attached".into()));
    }
    Ok(Value::Nil)
}

/// `timer_calls += 1; last_timer = args[0]`
pub fn on_timer(ctx: &mut CallContext<'_>, args: &[Value]) -> Result<Value, RuntimeError> {
    increment(ctx, "timer_calls")?;
    ctx.set("last_timer", args.first().cloned().unwrap_or(Value::Nil))?;
    Ok(Value::Nil)
}

/// `armed_at = tick`
pub fn arm(ctx: &mut CallContext<'_>, _args: &[Value]) -> Result<Value, RuntimeError> {
    let tick = ctx.tick as f64;
    ctx.set("armed_at", Value::from(tick))?;
    Ok(Value::Nil)
}

pub fn fail(_ctx: &mut CallContext<'_>, _args: &[Value]) -> Result<Value, RuntimeError> {
    Err(RuntimeError::Script("always fails".into()))
}

// ===========================================================================
// Classes
// ===========================================================================

/// `Animals.Dog`, `Gadgets.Timer` (armed on creation) and `Gadgets.Bomb`
/// (whose creation hook fails).
pub fn pet_classes() -> ClassRegistryBuilder {
    let mut b = ClassRegistryBuilder::new();
    b.register(
        ClassDef::new("Dog")
            .in_namespace(["Animals"])
            .with_field("name", "Rex")
            .with_method("bark", bark)
            .with_method("remember", remember)
            .with_method("bark_later", bark_later)
            .with_method("bark_now", bark_now)
            .with_method("on_timer", on_timer)
            .with_method("fail", fail),
    )
    .expect("Dog registers");
    b.register(
        ClassDef::new("Timer")
            .in_namespace(["Gadgets"])
            .with_field("interval", 10i64)
            .with_method("arm", arm)
            .with_method("on_timer", on_timer)
            .with_on_create("arm"),
    )
    .expect("Timer registers");
    b.register(
        ClassDef::new("Bomb")
            .in_namespace(["Gadgets"])
            .with_method("fail", fail)
            .with_on_create("fail"),
    )
    .expect("Bomb registers");
    b
}

pub fn pet_registry() -> ClassRegistry {
    pet_classes().build().expect("pet classes are valid")
}

pub fn pet_runtime() -> ScriptRuntime {
    ScriptRuntime::new(pet_registry())
}

pub fn pet_engine() -> Engine {
    Engine::new(pet_registry())
}

// ===========================================================================
// Interpreter
// ===========================================================================

/// Header every echo chunk starts with.
pub const ECHO_HEADER: [u8; 3] = [0x1b, b'L', 0x00];

/// A chunk that returns the upvalue called `name`.
pub fn echo_chunk(name: &str) -> Vec<u8> {
    let mut chunk = ECHO_HEADER.to_vec();
    chunk.extend_from_slice(name.as_bytes());
    chunk
}

/// Minimal interpreter: a chunk is [`ECHO_HEADER`] followed by an upvalue
/// name, and running it returns that upvalue's value.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoInterpreter;

impl Interpreter for EchoInterpreter {
    fn execute(
        &self,
        _ctx: &mut CallContext<'_>,
        code: &[u8],
        upvalues: &[Upvalue],
        _args: &[Value],
    ) -> Result<Value, RuntimeError> {
        self.verify(code)?;
        let name = std::str::from_utf8(&code[ECHO_HEADER.len()..])
            .map_err(|e| RuntimeError::InvalidChunk(e.to_string()))?;
        Ok(upvalues
            .iter()
            .find(|u| u.name == name)
            .map(|u| u.value.clone())
            .unwrap_or(Value::Nil))
    }

    fn verify(&self, code: &[u8]) -> Result<(), RuntimeError> {
        if code.starts_with(&ECHO_HEADER) {
            Ok(())
        } else {
            Err(RuntimeError::InvalidChunk("missing echo header".into()))
        }
    }
}
