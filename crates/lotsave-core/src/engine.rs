//! The engine: owns the script runtime and the tracked entities, and drives
//! ticks, saves and loads.

use std::collections::HashMap;

use tracing::{debug, error, info, instrument, warn};

use crate::builder::{GraphBuilder, LoadError, LoadReport};
use crate::class::ClassRegistry;
use crate::config::EngineConfig;
use crate::entity::Entity;
use crate::heap::ScriptHeap;
use crate::id::{Cid, ClassId, Tick};
use crate::runtime::{RuntimeError, ScriptRuntime};
use crate::serializer::{SaveError, SaveOptions, SaveReport, TrackedEntity, save_world};
use crate::sim::{AdvanceResult, EntityFailure, SimState, SimulationStrategy};
use crate::snapshot::WorldSnapshot;
use crate::value::Value;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("unknown class: {0}")]
    UnknownClass(ClassId),
    #[error("unknown entity: {0}")]
    UnknownEntity(Cid),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error("save failed: {0}")]
    Save(#[from] SaveError),
    #[error("failed to load: {0}")]
    Load(#[from] LoadError),
    #[error("snapshot encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Owns the script runtime, the tick counter and the cid to entity map, and
/// drives the scheduler, serializer and graph builder.
#[derive(Debug)]
pub struct Engine {
    pub runtime: ScriptRuntime,

    /// Simulation state (tick counter, accumulator).
    pub sim_state: SimState,

    pub(crate) strategy: SimulationStrategy,

    entities: HashMap<Cid, Entity>,
    config: EngineConfig,
    next_cid: u64,
}

impl Engine {
    /// Create an engine with the default configuration.
    pub fn new(classes: ClassRegistry) -> Self {
        Self::with_config(classes, EngineConfig::default())
    }

    pub fn with_config(classes: ClassRegistry, config: EngineConfig) -> Self {
        let heap = ScriptHeap::with_threshold(config.gc_threshold);
        Self {
            runtime: ScriptRuntime::with_heap(classes, heap),
            sim_state: SimState::new(),
            strategy: config.strategy.clone(),
            entities: HashMap::new(),
            config,
            next_cid: 0,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn tick_count(&self) -> Tick {
        self.sim_state.tick
    }

    /// Move the tick counter, e.g. to the tick a loaded snapshot was taken at.
    pub fn set_tick(&mut self, tick: Tick) {
        self.sim_state.tick = tick;
    }

    // -----------------------------------------------------------------------
    // Entity registry
    // -----------------------------------------------------------------------

    fn allocate_cid(&mut self) -> Cid {
        loop {
            self.next_cid += 1;
            let cid = Cid::new(format!("{}{}", self.config.cid_prefix, self.next_cid));
            if !self.entities.contains_key(&cid) {
                return cid;
            }
        }
    }

    /// Construct and track an instance of `class`, then run its creation
    /// hook. A failing hook leaves the entity tracked but unhealthy.
    pub fn create(&mut self, class: &str) -> Result<Cid, EngineError> {
        let class = ClassId::from(class);
        let hook = self
            .runtime
            .classes()
            .get(&class)
            .ok_or_else(|| EngineError::UnknownClass(class.clone()))?
            .on_create
            .clone();

        let root = self.runtime.construct_instance(&class)?;
        let cid = self.allocate_cid();
        let mut entity = Entity::new(cid.clone(), class, root);

        if let Some(hook) = hook {
            let tick = self.sim_state.tick;
            if let Err(err) =
                self.runtime
                    .call_method(root, &hook, &[], tick, Some(&mut entity.schedule))
            {
                error!(cid = %cid, hook = %hook, error = %err, "creation hook failed");
                entity.healthy = false;
            }
        }

        debug!(cid = %cid, class = %entity.class(), "entity created");
        self.entities.insert(cid.clone(), entity);
        Ok(cid)
    }

    /// Create one entity per class. Failures are logged and skipped.
    pub fn create_batch<'a>(&mut self, classes: impl IntoIterator<Item = &'a str>) -> Vec<Cid> {
        let mut created = Vec::new();
        for class in classes {
            match self.create(class) {
                Ok(cid) => created.push(cid),
                Err(err) => error!(class, error = %err, "entity construction failed"),
            }
        }
        created
    }

    /// Stop tracking an entity. Its objects are reclaimed by the next
    /// collection unless something else still references them.
    pub fn remove(&mut self, cid: &Cid) -> Option<Entity> {
        self.entities.remove(cid)
    }

    pub fn get(&self, cid: &Cid) -> Option<&Entity> {
        self.entities.get(cid)
    }

    pub fn get_mut(&mut self, cid: &Cid) -> Option<&mut Entity> {
        self.entities.get_mut(cid)
    }

    pub fn contains(&self, cid: &Cid) -> bool {
        self.entities.contains_key(cid)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Tracked cids, sorted.
    pub fn cids(&self) -> Vec<Cid> {
        let mut cids: Vec<Cid> = self.entities.keys().cloned().collect();
        cids.sort();
        cids
    }

    fn entity_mut(&mut self, cid: &Cid) -> Result<&mut Entity, EngineError> {
        self.entities
            .get_mut(cid)
            .ok_or_else(|| EngineError::UnknownEntity(cid.clone()))
    }

    // -----------------------------------------------------------------------
    // Scheduling
    // -----------------------------------------------------------------------

    pub fn register_callback(
        &mut self,
        cid: &Cid,
        method: &str,
        args: Vec<Value>,
        at: Tick,
    ) -> Result<(), EngineError> {
        self.entity_mut(cid)?
            .schedule
            .register_callback(method, args, at);
        Ok(())
    }

    /// Schedule a call for the next tick. Returns that tick.
    pub fn defer_callback(
        &mut self,
        cid: &Cid,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Tick, EngineError> {
        let tick = self.sim_state.tick;
        Ok(self.entity_mut(cid)?.schedule.defer_callback(method, args, tick))
    }

    /// Call a method on an entity immediately, with its scheduler attached.
    pub fn call(&mut self, cid: &Cid, method: &str, args: &[Value]) -> Result<Value, EngineError> {
        let tick = self.sim_state.tick;
        let entity = self
            .entities
            .get_mut(cid)
            .ok_or_else(|| EngineError::UnknownEntity(cid.clone()))?;
        let root = entity.root();
        Ok(self
            .runtime
            .call_method(root, method, args, tick, Some(&mut entity.schedule))?)
    }

    // -----------------------------------------------------------------------
    // Advance
    // -----------------------------------------------------------------------

    /// Advance the simulation according to the configured strategy.
    ///
    /// - **Tick mode**: `dt` is ignored; exactly one step runs.
    /// - **Delta mode**: `dt` is accumulated; as many fixed steps run as fit.
    pub fn advance(&mut self, dt: Tick) -> AdvanceResult {
        let mut result = AdvanceResult::default();

        match self.strategy.clone() {
            SimulationStrategy::Tick => {
                self.step_internal(&mut result);
            }
            SimulationStrategy::Delta { fixed_timestep } => {
                self.sim_state.accumulator += dt;
                let step_size = fixed_timestep.max(1);
                while self.sim_state.accumulator >= step_size {
                    self.sim_state.accumulator -= step_size;
                    self.step_internal(&mut result);
                }
            }
        }

        result
    }

    /// Run a single simulation step (convenience for tick mode).
    pub fn step(&mut self) -> AdvanceResult {
        self.advance(0)
    }

    /// Run exactly one step, whatever the strategy.
    pub fn tick(&mut self) -> AdvanceResult {
        let mut result = AdvanceResult::default();
        self.step_internal(&mut result);
        result
    }

    /// Advance the counter, drain every entity's bucket for the new tick in
    /// cid order, then collect if an automatic collection is due.
    #[instrument(skip_all, name = "tick", fields(tick = self.sim_state.tick + 1))]
    fn step_internal(&mut self, result: &mut AdvanceResult) {
        self.sim_state.tick += 1;
        let tick = self.sim_state.tick;

        for cid in self.cids() {
            let Some(entity) = self.entities.get_mut(&cid) else {
                continue;
            };
            let root = entity.root();
            let report = entity.schedule.execute(&mut self.runtime, root, tick);
            result.calls_run += report.invoked;
            if !report.is_clean() {
                warn!(cid = %cid, failed = report.failures.len(), "entity marked unhealthy");
                entity.healthy = false;
            }
            result
                .failures
                .extend(report.failures.into_iter().map(|failure| EntityFailure {
                    cid: cid.clone(),
                    tick,
                    failure,
                }));
        }

        if self.runtime.heap.should_collect() {
            result.freed += self.collect_garbage();
        }
        result.steps_run += 1;
    }

    /// Collect everything not reachable from the runtime's permanent roots,
    /// the entity tables, or scheduled call arguments.
    pub fn collect_garbage(&mut self) -> usize {
        let roots: Vec<Value> = self
            .entities
            .values()
            .flat_map(|e| std::iter::once(Value::Table(e.root())).chain(e.schedule.roots()))
            .collect();
        self.runtime.collect(roots)
    }

    // -----------------------------------------------------------------------
    // Save / load
    // -----------------------------------------------------------------------

    /// Snapshot every tracked entity, in cid order.
    #[instrument(skip(self), fields(tick = self.sim_state.tick))]
    pub fn save_lot(&mut self) -> Result<(WorldSnapshot, SaveReport), EngineError> {
        let mut entities: Vec<&Entity> = self.entities.values().collect();
        entities.sort_by(|a, b| a.cid().cmp(b.cid()));
        let tracked: Vec<TrackedEntity<'_>> = entities.iter().map(|e| e.tracked()).collect();
        let options = SaveOptions {
            canonical_order: self.config.canonical_order,
        };
        let saved = save_world(&mut self.runtime, &tracked, self.sim_state.tick, options)?;
        info!(entities = tracked.len(), nodes = saved.1.nodes, "lot saved");
        Ok(saved)
    }

    pub fn save_lot_json(&mut self) -> Result<String, EngineError> {
        let (snapshot, _) = self.save_lot()?;
        Ok(snapshot.to_json()?)
    }

    /// Rebuild a snapshot and install its entities alongside the tracked
    /// ones. All or nothing: on error no entity is installed and the staged
    /// objects are reclaimed. The tick counter is left untouched; the saved
    /// tick is reported in [`LoadReport::saved_tick`].
    #[instrument(skip_all, fields(tick = self.sim_state.tick))]
    pub fn load_lot(&mut self, snapshot: &WorldSnapshot) -> Result<LoadReport, EngineError> {
        let entities = &self.entities;
        let result = GraphBuilder::load(&mut self.runtime, snapshot, |cid| {
            entities.get(cid).map(Entity::root)
        });

        match result {
            Ok(world) => {
                for staged in world.entities {
                    self.entities.insert(staged.cid.clone(), Entity::from(staged));
                }
                info!(
                    loaded = world.report.loaded,
                    skipped = world.report.skipped.len(),
                    "lot loaded"
                );
                Ok(world.report)
            }
            Err(err) => {
                error!(error = %err, "failed to load lot");
                self.collect_garbage();
                Err(err.into())
            }
        }
    }

    pub fn load_lot_json(&mut self, json: &str) -> Result<LoadReport, EngineError> {
        let snapshot = WorldSnapshot::from_json(json).map_err(LoadError::from)?;
        self.load_lot(&snapshot)
    }
}
