//! Integration tests for save/load and scheduling.
//!
//! These tests drive the public engine API end to end: create entities,
//! wire graphs and schedules, save to JSON, load into a fresh engine, and
//! keep ticking.

use lotsave_core::builder::{LoadError, SkipReason};
use lotsave_core::engine::{Engine, EngineError};
use lotsave_core::heap::Upvalue;
use lotsave_core::id::*;
use lotsave_core::runtime::CLASS_LINK;
use lotsave_core::snapshot::{Environment, GraphNode, InferredValue, WorldSnapshot};
use lotsave_core::test_utils::*;
use lotsave_core::value::Value;

fn root(engine: &Engine, cid: &Cid) -> TableId {
    engine.get(cid).expect("entity exists").root()
}

fn field(engine: &Engine, cid: &Cid, name: &str) -> Value {
    engine
        .runtime
        .heap
        .get_field(root(engine, cid), name)
        .cloned()
        .unwrap_or(Value::Nil)
}

fn round_trip(engine: &mut Engine) -> Engine {
    let json = engine.save_lot_json().unwrap();
    let mut restored = pet_engine();
    restored.load_lot_json(&json).unwrap();
    restored
}

// ===========================================================================
// Scenario A: a scheduled call referencing another entity
// ===========================================================================

#[test]
fn scheduled_cross_entity_reference_survives_round_trip() {
    let mut engine = pet_engine();
    let bb1 = engine.create("Dog").unwrap();
    let bb2 = engine.create("Dog").unwrap();
    let target = Value::Table(root(&engine, &bb2));
    engine
        .register_callback(&bb1, "on_timer", vec![target], 100)
        .unwrap();

    let (snapshot, _) = engine.save_lot().unwrap();
    let json: serde_json::Value = serde_json::from_str(&snapshot.to_json().unwrap()).unwrap();
    assert_eq!(
        json["entities"][0]["_sys"]["_sched"]["100"][0],
        serde_json::json!({
            "method": "on_timer",
            "arguments": [{"type": "ref", "ptr": "bb2"}]
        })
    );

    let mut restored = pet_engine();
    restored.load_lot(&snapshot).unwrap();
    let live_bb2 = Value::Table(root(&restored, &bb2));
    let pending = restored.get(&bb1).unwrap().schedule.pending_at(100);
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].arguments, vec![live_bb2.clone()]);

    restored.set_tick(99);
    let result = restored.tick();
    assert_eq!(result.calls_run, 1);
    assert_eq!(field(&restored, &bb1, "timer_calls"), Value::Number(1.0));
    assert_eq!(field(&restored, &bb1, "last_timer"), live_bb2);

    // Tick 100 is drained; running it again changes nothing.
    restored.set_tick(99);
    assert_eq!(restored.tick().calls_run, 0);
    assert_eq!(field(&restored, &bb1, "timer_calls"), Value::Number(1.0));
}

// ===========================================================================
// Scenario B: class substitution
// ===========================================================================

#[test]
fn shared_class_is_referenced_never_inlined() {
    let mut engine = pet_engine();
    engine.create("Dog").unwrap();
    engine.create("Dog").unwrap();

    let (snapshot, _) = engine.save_lot().unwrap();
    let dog_refs = snapshot
        .values()
        .into_iter()
        .filter(|v| **v == InferredValue::ClassReference(ClassId::from("Dog")))
        .count();
    assert_eq!(dog_refs, 2);
    assert_eq!(snapshot.nodes.len(), 2);
    for node in snapshot.nodes.values() {
        let GraphNode::Table { entries } = node else {
            panic!("unexpected function node");
        };
        assert!(
            entries
                .iter()
                .all(|e| e.key != InferredValue::String("__classid".into()))
        );
    }
}

#[test]
fn class_link_is_restored_to_live_class_table() {
    let mut engine = pet_engine();
    let dog = engine.create("Dog").unwrap();
    let restored = round_trip(&mut engine);
    assert_eq!(
        field(&restored, &dog, CLASS_LINK),
        Value::Table(restored.runtime.class_table(&ClassId::from("Dog")).unwrap())
    );
}

// ===========================================================================
// Identity and cycles
// ===========================================================================

#[test]
fn aliasing_is_preserved() {
    let mut engine = pet_engine();
    let a = engine.create("Dog").unwrap();
    let b = engine.create("Dog").unwrap();
    let bowl = engine.runtime.heap.new_table();
    engine.runtime.heap.set_field(bowl, "kibble", Value::from(12.0));
    for cid in [&a, &b] {
        let r = root(&engine, cid);
        engine.runtime.heap.set_field(r, "bowl", Value::Table(bowl));
    }

    let (snapshot, _) = engine.save_lot().unwrap();
    assert_eq!(snapshot.table_count(), 3);

    let mut restored = pet_engine();
    restored.load_lot(&snapshot).unwrap();
    let bowl_a = field(&restored, &a, "bowl");
    assert_eq!(bowl_a, field(&restored, &b, "bowl"));
    let bowl_a = bowl_a.as_table().unwrap();
    assert_eq!(
        restored.runtime.heap.get_field(bowl_a, "kibble"),
        Some(&Value::Number(12.0))
    );
}

#[test]
fn mutual_entity_references_round_trip() {
    let mut engine = pet_engine();
    let a = engine.create("Dog").unwrap();
    let b = engine.create("Dog").unwrap();
    let (ra, rb) = (root(&engine, &a), root(&engine, &b));
    engine.runtime.heap.set_field(ra, "pal", Value::Table(rb));
    engine.runtime.heap.set_field(rb, "pal", Value::Table(ra));
    engine
        .register_callback(&a, "remember", vec![Value::Table(rb)], 5)
        .unwrap();
    engine
        .register_callback(&b, "remember", vec![Value::Table(ra)], 5)
        .unwrap();

    let mut restored = round_trip(&mut engine);
    let (ra, rb) = (root(&restored, &a), root(&restored, &b));
    assert_eq!(field(&restored, &a, "pal"), Value::Table(rb));
    assert_eq!(field(&restored, &b, "pal"), Value::Table(ra));

    restored.set_tick(4);
    restored.tick();
    assert_eq!(field(&restored, &a, "memory"), Value::Table(rb));
    assert_eq!(field(&restored, &b, "memory"), Value::Table(ra));
}

#[test]
fn closure_capturing_its_owner_round_trips() {
    let mut engine = pet_engine();
    engine.runtime.set_interpreter(EchoInterpreter);
    let dog = engine.create("Dog").unwrap();
    let r = root(&engine, &dog);
    let whoami = engine
        .runtime
        .load_closure(echo_chunk("owner"), vec![Upvalue::new("owner", Value::Table(r))])
        .unwrap();
    engine.runtime.heap.set_field(r, "whoami", Value::Closure(whoami));

    let json = engine.save_lot_json().unwrap();
    let mut restored = pet_engine();
    restored.runtime.set_interpreter(EchoInterpreter);
    restored.load_lot_json(&json).unwrap();

    let out = restored.call(&dog, "whoami", &[]).unwrap();
    assert_eq!(out, Value::Table(root(&restored, &dog)));
}

#[test]
fn bound_method_is_rebuilt_without_code() {
    let mut engine = pet_engine();
    let a = engine.create("Dog").unwrap();
    let b = engine.create("Dog").unwrap();
    let rb = root(&engine, &b);
    let callback = engine.runtime.bind_method(
        &ClassId::from("Dog"),
        "remember",
        Value::Table(rb),
        vec![Value::from("squirrel")],
    );
    let ra = root(&engine, &a);
    engine.runtime.heap.set_field(ra, "callback", Value::Closure(callback));

    let (snapshot, _) = engine.save_lot().unwrap();
    assert_eq!(snapshot.function_count(), 0);

    let mut restored = pet_engine();
    restored.load_lot(&snapshot).unwrap();
    let cb = field(&restored, &a, "callback").as_closure().unwrap();
    restored
        .runtime
        .call_closure(cb, Value::Nil, &[], 0, None)
        .unwrap();
    assert_eq!(field(&restored, &b, "memory"), Value::from("squirrel"));
}

#[test]
fn environment_tables_are_substituted() {
    let mut engine = pet_engine();
    let dog = engine.create("Dog").unwrap();
    let global = engine.runtime.environment(Environment::Global);
    let r = root(&engine, &dog);
    engine.runtime.heap.set_field(r, "world", Value::Table(global));

    let (snapshot, _) = engine.save_lot().unwrap();
    assert_eq!(snapshot.nodes.len(), 1);

    let mut restored = pet_engine();
    restored.load_lot(&snapshot).unwrap();
    assert_eq!(
        field(&restored, &dog, "world"),
        Value::Table(restored.runtime.environment(Environment::Global))
    );
}

#[test]
fn deep_chain_round_trips() {
    const DEPTH: usize = 100_000;
    let mut engine = pet_engine();
    let dog = engine.create("Dog").unwrap();
    let mut tail = root(&engine, &dog);
    for _ in 0..DEPTH {
        let next = engine.runtime.heap.new_table();
        engine.runtime.heap.set_field(tail, "next", Value::Table(next));
        tail = next;
    }
    engine.runtime.heap.set_field(tail, "end", Value::from(true));

    let (snapshot, report) = engine.save_lot().unwrap();
    assert_eq!(report.nodes, DEPTH + 1);

    let mut restored = pet_engine();
    restored.load_lot(&snapshot).unwrap();
    let mut cursor = root(&restored, &dog);
    let mut depth = 0;
    while let Some(next) = restored
        .runtime
        .heap
        .get_field(cursor, "next")
        .and_then(Value::as_table)
    {
        cursor = next;
        depth += 1;
    }
    assert_eq!(depth, DEPTH);
    assert_eq!(
        restored.runtime.heap.get_field(cursor, "end"),
        Some(&Value::Bool(true))
    );
}

#[test]
fn hash_prefixed_cids_keep_their_children_distinct() {
    let config = lotsave_core::config::EngineConfig {
        cid_prefix: "#".into(),
        ..Default::default()
    };
    let mut engine = Engine::with_config(pet_registry(), config.clone());
    let first = engine.create("Dog").unwrap();
    engine.create("Dog").unwrap();
    assert_eq!(first.as_str(), "#1");
    let toy = engine.runtime.heap.new_table();
    engine.runtime.heap.set_field(toy, "squeaks", Value::from(true));
    let r = root(&engine, &first);
    engine.runtime.heap.set_field(r, "toy", Value::Table(toy));

    let (snapshot, _) = engine.save_lot().unwrap();
    assert_eq!(snapshot.nodes.len(), 3);

    let mut restored = Engine::with_config(pet_registry(), config);
    restored.load_lot(&snapshot).unwrap();
    let toy = field(&restored, &first, "toy").as_table().unwrap();
    assert_ne!(toy, root(&restored, &first));
    assert_eq!(
        restored.runtime.heap.get_field(toy, "squeaks"),
        Some(&Value::Bool(true))
    );
}

// ===========================================================================
// Failure handling
// ===========================================================================

#[test]
fn missing_scheduled_reference_installs_nothing() {
    let mut engine = pet_engine();
    let a = engine.create("Dog").unwrap();
    let b = engine.create("Dog").unwrap();
    let target = Value::Table(root(&engine, &b));
    engine.register_callback(&a, "on_timer", vec![target], 100).unwrap();
    let (mut snapshot, _) = engine.save_lot().unwrap();
    snapshot.entities.retain(|r| r.cid != b);

    let mut restored = pet_engine();
    let err = restored.load_lot(&snapshot).unwrap_err();
    assert!(matches!(
        err,
        EngineError::Load(LoadError::MissingCrossReference { .. })
    ));
    assert!(restored.is_empty());
}

#[test]
fn unknown_class_skips_only_that_entity() {
    let mut engine = pet_engine();
    let dog = engine.create("Dog").unwrap();
    let timer = engine.create("Timer").unwrap();
    let (mut snapshot, _) = engine.save_lot().unwrap();
    for record in &mut snapshot.entities {
        if record.cid == timer {
            record.class = ClassId::from("Sundial");
        }
    }

    let mut restored = pet_engine();
    let report = restored.load_lot(&snapshot).unwrap();
    assert_eq!(report.loaded, 1);
    assert_eq!(
        report.skipped[0].reason,
        SkipReason::UnknownClass(ClassId::from("Sundial"))
    );
    assert!(restored.contains(&dog));
    assert!(!restored.contains(&timer));
}

#[test]
fn unserializable_closure_dangles_and_loads_as_nil() {
    let mut engine = pet_engine();
    let dog = engine.create("Dog").unwrap();
    let native = engine.runtime.new_native(|_, _| Ok(Value::Nil), vec![]);
    let r = root(&engine, &dog);
    engine.runtime.heap.set_field(r, "hook", Value::Closure(native));

    let (snapshot, save_report) = engine.save_lot().unwrap();
    assert_eq!(save_report.dropped_closures, 1);

    let mut restored = pet_engine();
    let report = restored.load_lot(&snapshot).unwrap();
    assert_eq!(report.nulled_values, 1);
    assert_eq!(field(&restored, &dog, "hook"), Value::Nil);
}

#[test]
fn future_snapshot_version_is_rejected() {
    let mut engine = pet_engine();
    engine.create("Dog").unwrap();
    let (mut snapshot, _) = engine.save_lot().unwrap();
    snapshot.header.version += 1;

    let mut restored = pet_engine();
    assert!(restored.load_lot(&snapshot).is_err());
    assert!(restored.is_empty());
}

// ===========================================================================
// Determinism
// ===========================================================================

#[test]
fn canonical_saves_are_byte_identical() {
    let config = lotsave_core::config::EngineConfig {
        canonical_order: true,
        ..Default::default()
    };
    let build = |keys: &[&str]| {
        let mut engine = Engine::with_config(pet_registry(), config.clone());
        let dog = engine.create("Dog").unwrap();
        let r = root(&engine, &dog);
        for k in keys {
            engine.runtime.heap.set_field(r, k, Value::from(*k));
        }
        engine.save_lot_json().unwrap()
    };
    assert_eq!(build(&["x", "b", "q"]), build(&["q", "x", "b"]));
}

#[test]
fn saving_twice_yields_the_same_document() {
    let mut engine = pet_engine();
    let a = engine.create("Dog").unwrap();
    let b = engine.create("Timer").unwrap();
    let rb = root(&engine, &b);
    engine.register_callback(&a, "on_timer", vec![Value::Table(rb)], 3).unwrap();

    let first = engine.save_lot_json().unwrap();
    let second = engine.save_lot_json().unwrap();
    assert_eq!(first, second);
    assert!(WorldSnapshot::from_json(&first).is_ok());
}
