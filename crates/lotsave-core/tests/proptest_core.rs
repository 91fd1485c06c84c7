//! Property-based tests for save/load.
//!
//! Uses proptest to generate random object graphs (sharing and cycles
//! included) hanging off an entity, then verifies that a save/load round
//! trip reconstructs an isomorphic graph and that each distinct table is
//! emitted exactly once.

use std::collections::{HashMap, HashSet};

use lotsave_core::engine::Engine;
use lotsave_core::heap::ScriptHeap;
use lotsave_core::id::*;
use lotsave_core::test_utils::*;
use lotsave_core::value::Value;
use proptest::prelude::*;

// ===========================================================================
// Generators
// ===========================================================================

#[derive(Debug, Clone)]
enum Slot {
    Num(i32),
    Text(String),
    Flag(bool),
    /// Index of another generated table.
    Link(usize),
}

/// Up to `max_tables` tables, each with up to four slots.
fn arb_graph(max_tables: usize) -> impl Strategy<Value = Vec<Vec<Slot>>> {
    (1..=max_tables).prop_flat_map(|n| {
        let slot = prop_oneof![
            any::<i32>().prop_map(Slot::Num),
            "[a-z]{0,8}".prop_map(Slot::Text),
            any::<bool>().prop_map(Slot::Flag),
            (0..n).prop_map(Slot::Link),
        ];
        proptest::collection::vec(proptest::collection::vec(slot, 0..5), n)
    })
}

fn build(engine: &mut Engine, graph: &[Vec<Slot>]) -> Cid {
    let cid = engine.create("Dog").unwrap();
    let tables: Vec<TableId> = graph.iter().map(|_| engine.runtime.heap.new_table()).collect();
    for (i, slots) in graph.iter().enumerate() {
        for (j, slot) in slots.iter().enumerate() {
            let value = match slot {
                Slot::Num(n) => Value::from(f64::from(*n)),
                Slot::Text(s) => Value::from(s.as_str()),
                Slot::Flag(b) => Value::from(*b),
                Slot::Link(t) => Value::Table(tables[*t]),
            };
            engine
                .runtime
                .heap
                .set_field(tables[i], &format!("k{j}"), value);
        }
    }
    let root = engine.get(&cid).unwrap().root();
    engine
        .runtime
        .heap
        .set_field(root, "data", Value::Table(tables[0]));
    cid
}

/// Tables reachable from table 0.
fn reachable(graph: &[Vec<Slot>]) -> usize {
    let mut seen = HashSet::new();
    let mut stack = vec![0];
    while let Some(i) = stack.pop() {
        if !seen.insert(i) {
            continue;
        }
        for slot in &graph[i] {
            if let Slot::Link(t) = slot {
                stack.push(*t);
            }
        }
    }
    seen.len()
}

/// Walk both graphs in lockstep, requiring a consistent one-to-one mapping
/// between tables and equal primitive values.
fn isomorphic(a: &ScriptHeap, ra: TableId, b: &ScriptHeap, rb: TableId) -> Result<(), TestCaseError> {
    let mut map: HashMap<TableId, TableId> = HashMap::new();
    let mut stack = vec![(ra, rb)];
    while let Some((x, y)) = stack.pop() {
        if let Some(prev) = map.get(&x) {
            prop_assert_eq!(*prev, y, "aliasing not preserved");
            continue;
        }
        map.insert(x, y);
        let (tx, ty) = (a.table(x).unwrap(), b.table(y).unwrap());
        prop_assert_eq!(tx.len(), ty.len());
        for (key, vx) in tx.entries() {
            let vy = ty.get(key);
            prop_assert!(vy.is_some(), "missing key {:?}", key);
            match (vx, vy.unwrap()) {
                (Value::Table(cx), Value::Table(cy)) => stack.push((*cx, *cy)),
                (vx, vy) => prop_assert_eq!(vx, vy),
            }
        }
    }
    let targets: HashSet<_> = map.values().collect();
    prop_assert_eq!(targets.len(), map.len(), "two tables merged into one");
    Ok(())
}

// ===========================================================================
// Properties
// ===========================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn round_trip_is_isomorphic(graph in arb_graph(6)) {
        let mut engine = pet_engine();
        let cid = build(&mut engine, &graph);
        let json = engine.save_lot_json().unwrap();

        let mut restored = pet_engine();
        restored.load_lot_json(&json).unwrap();

        let before = engine.get(&cid).unwrap().root();
        let after = restored.get(&cid).unwrap().root();
        isomorphic(&engine.runtime.heap, before, &restored.runtime.heap, after)?;
    }

    #[test]
    fn each_table_is_emitted_once(graph in arb_graph(8)) {
        let mut engine = pet_engine();
        build(&mut engine, &graph);
        let (snapshot, report) = engine.save_lot().unwrap();
        prop_assert_eq!(snapshot.table_count(), reachable(&graph) + 1);
        prop_assert_eq!(report.nodes, snapshot.nodes.len());
    }

    #[test]
    fn resaving_a_loaded_world_is_stable(graph in arb_graph(5)) {
        let mut engine = pet_engine();
        build(&mut engine, &graph);
        let first = engine.save_lot_json().unwrap();

        let mut restored = pet_engine();
        restored.load_lot_json(&first).unwrap();
        let second = restored.save_lot_json().unwrap();
        prop_assert_eq!(first, second);
    }

    #[test]
    fn drained_ticks_stay_drained(ticks in proptest::collection::vec(1u64..20, 1..10)) {
        let mut engine = pet_engine();
        let dog = engine.create("Dog").unwrap();
        for &t in &ticks {
            engine.register_callback(&dog, "bark", vec![], t).unwrap();
        }
        let mut total = 0;
        for _ in 0..20 {
            total += engine.tick().calls_run;
        }
        prop_assert_eq!(total, ticks.len());
        engine.set_tick(0);
        for _ in 0..20 {
            prop_assert_eq!(engine.tick().calls_run, 0);
        }
    }
}
