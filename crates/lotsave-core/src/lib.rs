//! Lotsave Core -- persistence for an embedded scripting runtime's object
//! graph, with per-entity tick scheduling.
//!
//! The crate saves and restores the full mutable state of gameplay entities:
//! tables referencing tables, closures capturing their own owners, entities
//! referencing each other. Object identity survives the round trip, framework
//! singletons (classes and the two namespace tables) are substituted instead
//! of inlined, and a load either installs a fully wired world or nothing.
//!
//! # Save / load pipeline
//!
//! 1. **Walk** -- [`serializer::save_world`] assigns each reachable table and
//!    closure an address token and emits one graph node per object.
//! 2. **Materialize** -- [`builder::GraphBuilder`] instantiates entity roots,
//!    allocates shells for every other node, then decodes payloads.
//! 3. **Patch** -- schedule arguments are resolved against the loaded and
//!    live entities; one unresolved reference fails the whole load.
//!
//! ```rust,ignore
//! let cid = engine.create("Dog")?;
//! engine.register_callback(&cid, "bark", vec![], 100)?;
//! let json = engine.save_lot_json()?;
//!
//! let mut restored = Engine::new(registry);
//! restored.load_lot_json(&json)?;
//! ```
//!
//! # Key Types
//!
//! - [`engine::Engine`] -- Entity registry, tick loop, save/load entry points.
//! - [`runtime::ScriptRuntime`] -- Object heap, class tree and method dispatch.
//! - [`class::ClassRegistry`] -- Immutable class registry (frozen at startup).
//! - [`scheduler::TickScheduler`] -- Per-entity tick to pending-call buckets.
//! - [`snapshot::WorldSnapshot`] -- The versioned JSON document.

pub mod builder;
pub mod class;
pub mod codec;
pub mod config;
pub mod engine;
pub mod entity;
pub mod heap;
pub mod id;
pub mod runtime;
pub mod scheduler;
pub mod serializer;
pub mod sim;
pub mod snapshot;
pub mod value;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
