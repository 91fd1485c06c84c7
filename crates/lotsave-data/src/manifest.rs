//! Loading pipeline: reads a data directory and produces a class registry
//! builder plus engine configuration.

use std::collections::HashMap;
use std::path::Path;

use lotsave_core::class::{ClassDef, ClassRegistryBuilder};
use lotsave_core::config::EngineConfig;
use tracing::{debug, info};

use crate::loader::{
    DataLoadError, check_duplicate, deserialize_file, deserialize_list, find_data_file,
    require_data_file,
};
use crate::schema::ClassData;

/// Everything a data directory describes.
#[derive(Debug)]
pub struct LotData {
    /// Classes are left unfrozen so native methods can be attached with
    /// [`ClassRegistryBuilder::mutate`] before `build()`.
    pub classes: ClassRegistryBuilder,
    pub config: EngineConfig,
}

/// Load a class manifest (`.ron`, `.json` or `.toml` with a `classes` array).
pub fn load_class_manifest(path: &Path) -> Result<ClassRegistryBuilder, DataLoadError> {
    let entries: Vec<ClassData> = deserialize_list(path, "classes")?;
    let mut builder = ClassRegistryBuilder::new();
    let mut seen: HashMap<String, usize> = HashMap::new();

    for (index, data) in entries.into_iter().enumerate() {
        check_duplicate(&seen, &data.id, path)?;
        seen.insert(data.id.clone(), index);

        let mut def = ClassDef::new(data.id).in_namespace(data.namespace);
        for (name, value) in data.fields {
            def = def.with_field(name, value);
        }
        if let Some(hook) = data.on_create {
            def = def.with_on_create(hook);
        }
        debug!(class = %def.id, fields = def.fields.len(), "class declared");
        builder.register(def).map_err(|source| DataLoadError::Class {
            file: path.to_path_buf(),
            source,
        })?;
    }

    Ok(builder)
}

/// Load an [`EngineConfig`]. Missing keys take their defaults.
pub fn load_engine_config(path: &Path) -> Result<EngineConfig, DataLoadError> {
    deserialize_file(path)
}

/// Load `classes.*` (required) and `engine.*` (optional) from `dir`.
pub fn load_lot_data(dir: &Path) -> Result<LotData, DataLoadError> {
    let classes = load_class_manifest(&require_data_file(dir, "classes")?)?;
    let config = match find_data_file(dir, "engine")? {
        Some(path) => load_engine_config(&path)?,
        None => EngineConfig::default(),
    };
    info!(dir = %dir.display(), classes = classes.len(), "lot data loaded");
    Ok(LotData { classes, config })
}
