//! Data-driven class manifests and engine configuration for Lotsave.
//!
//! Reads RON, JSON or TOML files (detected by extension) into a
//! [`ClassRegistryBuilder`](lotsave_core::class::ClassRegistryBuilder) and an
//! [`EngineConfig`](lotsave_core::config::EngineConfig).

pub mod loader;
pub mod manifest;
pub mod schema;

pub use loader::DataLoadError;
pub use manifest::{LotData, load_class_manifest, load_engine_config, load_lot_data};
