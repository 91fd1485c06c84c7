//! Class definitions and the frozen class registry.
//!
//! Classes are registered on a [`ClassRegistryBuilder`], optionally amended
//! by id (e.g. to attach native methods to a class loaded from a data file),
//! and frozen into a [`ClassRegistry`] that the runtime installs as its class
//! tree.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::rc::Rc;

use crate::heap::NativeFn;
use crate::id::ClassId;
use crate::runtime::{CallContext, RuntimeError};
use crate::value::Value;

/// A class definition.
#[derive(Clone)]
pub struct ClassDef {
    pub id: ClassId,
    /// Namespace path under the class root, outermost first.
    pub namespace: Vec<String>,
    /// Default fields copied into every new instance. Primitives only.
    pub fields: Vec<(String, Value)>,
    pub methods: BTreeMap<String, NativeFn>,
    /// Method invoked once after the engine creates an instance.
    pub on_create: Option<String>,
}

impl ClassDef {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: ClassId::new(id),
            namespace: Vec::new(),
            fields: Vec::new(),
            methods: BTreeMap::new(),
            on_create: None,
        }
    }

    pub fn in_namespace<I, S>(mut self, path: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.namespace = path.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.push((name.into(), value.into()));
        self
    }

    pub fn with_method<F>(mut self, name: impl Into<String>, method: F) -> Self
    where
        F: Fn(&mut CallContext<'_>, &[Value]) -> Result<Value, RuntimeError> + 'static,
    {
        self.methods.insert(name.into(), Rc::new(method));
        self
    }

    pub fn with_on_create(mut self, method: impl Into<String>) -> Self {
        self.on_create = Some(method.into());
        self
    }

    pub fn method(&self, name: &str) -> Option<&NativeFn> {
        self.methods.get(name)
    }
}

impl fmt::Debug for ClassDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassDef")
            .field("id", &self.id)
            .field("namespace", &self.namespace)
            .field("fields", &self.fields)
            .field("methods", &self.methods.keys().collect::<Vec<_>>())
            .field("on_create", &self.on_create)
            .finish()
    }
}

/// Builder for constructing an immutable [`ClassRegistry`].
#[derive(Debug, Default)]
pub struct ClassRegistryBuilder {
    classes: Vec<ClassDef>,
    id_to_index: HashMap<ClassId, usize>,
}

impl ClassRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a class. Fails if the id is taken.
    pub fn register(&mut self, class: ClassDef) -> Result<(), ClassError> {
        if self.id_to_index.contains_key(&class.id) {
            return Err(ClassError::Duplicate(class.id));
        }
        self.id_to_index.insert(class.id.clone(), self.classes.len());
        self.classes.push(class);
        Ok(())
    }

    /// Amend a registered class by id.
    pub fn mutate<F>(&mut self, id: &str, f: F) -> Result<(), ClassError>
    where
        F: FnOnce(&mut ClassDef),
    {
        let index = *self
            .id_to_index
            .get(&ClassId::from(id))
            .ok_or_else(|| ClassError::NotFound(ClassId::from(id)))?;
        let class = &mut self.classes[index];
        f(class);
        // The id is the lookup key; a mutation may not change it.
        if class.id.as_str() != id {
            class.id = ClassId::from(id);
        }
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&ClassDef> {
        self.id_to_index
            .get(&ClassId::from(id))
            .map(|&i| &self.classes[i])
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// Validate and freeze.
    pub fn build(self) -> Result<ClassRegistry, ClassError> {
        self.validate()?;
        Ok(ClassRegistry {
            classes: self.classes,
            id_to_index: self.id_to_index,
        })
    }

    fn validate(&self) -> Result<(), ClassError> {
        let mut class_paths: HashSet<Vec<&str>> = HashSet::new();
        let mut namespace_paths: HashSet<Vec<&str>> = HashSet::new();

        for class in &self.classes {
            if let Some((name, value)) = class.fields.iter().find(|(_, v)| !v.is_primitive()) {
                return Err(ClassError::NonPrimitiveDefault {
                    class: class.id.clone(),
                    field: name.clone(),
                    kind: value.type_name(),
                });
            }
            if class.namespace.iter().any(|s| s.is_empty()) {
                return Err(ClassError::EmptyNamespaceSegment(class.id.clone()));
            }
            let mut path: Vec<&str> = class.namespace.iter().map(String::as_str).collect();
            for depth in 1..=path.len() {
                namespace_paths.insert(path[..depth].to_vec());
            }
            path.push(class.id.as_str());
            class_paths.insert(path);
        }

        match class_paths.iter().find(|p| namespace_paths.contains(*p)) {
            Some(path) => Err(ClassError::NamespaceCollision(path.join("."))),
            None => Ok(()),
        }
    }
}

/// Immutable class registry. Frozen after `build()`.
#[derive(Debug, Default)]
pub struct ClassRegistry {
    classes: Vec<ClassDef>,
    id_to_index: HashMap<ClassId, usize>,
}

impl ClassRegistry {
    pub fn get(&self, id: &ClassId) -> Option<&ClassDef> {
        self.id_to_index.get(id).map(|&i| &self.classes[i])
    }

    pub fn is_registered(&self, id: &ClassId) -> bool {
        self.id_to_index.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ClassDef> {
        self.classes.iter()
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClassError {
    #[error("class already registered: {0}")]
    Duplicate(ClassId),
    #[error("class not found: {0}")]
    NotFound(ClassId),
    #[error("class {class} field {field:?} defaults to a {kind}; only primitives are allowed")]
    NonPrimitiveDefault {
        class: ClassId,
        field: String,
        kind: &'static str,
    },
    #[error("class {0} has an empty namespace segment")]
    EmptyNamespaceSegment(ClassId),
    #[error("class path {0} is also used as a namespace")]
    NamespaceCollision(String),
}
