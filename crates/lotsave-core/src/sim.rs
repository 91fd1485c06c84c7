//! Simulation strategy and state types.
//!
//! The engine is parameterized by a [`SimulationStrategy`] that determines how
//! time advances. Every strategy runs the same step (advance the tick counter,
//! drain each entity's bucket for the new tick, collect if due); they differ
//! only in how many steps one `advance()` call runs.

use serde::{Deserialize, Serialize};

use crate::id::{Cid, Tick};
use crate::scheduler::CallFailure;

// ---------------------------------------------------------------------------
// Simulation strategy
// ---------------------------------------------------------------------------

/// How the engine advances time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SimulationStrategy {
    /// One step per `advance()` call; `dt` is ignored.
    #[default]
    Tick,

    /// Real-time mode. `dt` is accumulated and as many fixed steps run as
    /// fit, carrying the remainder forward.
    Delta {
        /// Duration of one step, in the caller's time units.
        fixed_timestep: Tick,
    },
}

// ---------------------------------------------------------------------------
// Simulation state
// ---------------------------------------------------------------------------

/// Mutable simulation state tracked by the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimState {
    /// Current tick counter. Incremented by 1 for each step.
    pub tick: Tick,

    /// Accumulated time remainder for delta mode. Unused in tick mode.
    pub accumulator: Tick,
}

impl SimState {
    pub fn new() -> Self {
        Self::default()
    }
}

// ---------------------------------------------------------------------------
// Advance result
// ---------------------------------------------------------------------------

/// A scheduled call that failed during a step.
#[derive(Debug)]
pub struct EntityFailure {
    pub cid: Cid,
    pub tick: Tick,
    pub failure: CallFailure,
}

/// Result of an `Engine::advance()` call.
#[derive(Debug, Default)]
pub struct AdvanceResult {
    /// Number of steps executed.
    pub steps_run: u64,

    /// Scheduled calls invoked across all entities and steps.
    pub calls_run: usize,

    /// Calls that raised. Their entities are marked unhealthy.
    pub failures: Vec<EntityFailure>,

    /// Objects freed by automatic collections during these steps.
    pub freed: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sim_state_starts_at_zero() {
        let state = SimState::new();
        assert_eq!(state.tick, 0);
        assert_eq!(state.accumulator, 0);
    }

    #[test]
    fn strategy_serializes() {
        let json = serde_json::to_string(&SimulationStrategy::Delta { fixed_timestep: 3 }).unwrap();
        let back: SimulationStrategy = serde_json::from_str(&json).unwrap();
        assert_eq!(back, SimulationStrategy::Delta { fixed_timestep: 3 });
    }
}
