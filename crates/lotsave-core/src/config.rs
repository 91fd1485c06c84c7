//! Engine configuration.

use serde::{Deserialize, Serialize};

use crate::heap::DEFAULT_GC_THRESHOLD;
use crate::sim::SimulationStrategy;

/// Settings an [`Engine`](crate::engine::Engine) is built with. Every field
/// has a default, so partial config files deserialize.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub strategy: SimulationStrategy,
    /// Allocations between automatic collections.
    pub gc_threshold: usize,
    /// Save table entries in canonical key order.
    pub canonical_order: bool,
    /// Prefix for generated cids (`<prefix><n>`).
    pub cid_prefix: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            strategy: SimulationStrategy::Tick,
            gc_threshold: DEFAULT_GC_THRESHOLD,
            canonical_order: false,
            cid_prefix: "bb".to_string(),
        }
    }
}
