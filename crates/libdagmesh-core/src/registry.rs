//! Collection definitions
//!
//! The registry is handed to every node at start; there is no global
//! instance. Each collection declares the CRDT kind of each field and two
//! flags: `branchable` (collection-level commits are recorded) and
//! `encrypted` (field payloads are sealed with a per-document key).

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::MeshError;
use crate::types::commit::CrdtKind;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionDef {
    pub name: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub branchable: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub encrypted: bool,
    pub fields: BTreeMap<String, CrdtKind>,
}

impl CollectionDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            branchable: false,
            encrypted: false,
            fields: BTreeMap::new(),
        }
    }

    pub fn field(mut self, name: impl Into<String>, kind: CrdtKind) -> Self {
        self.fields.insert(name.into(), kind);
        self
    }

    pub fn branchable(mut self) -> Self {
        self.branchable = true;
        self
    }

    pub fn encrypted(mut self) -> Self {
        self.encrypted = true;
        self
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    collections: Vec<CollectionDef>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CollectionRegistry {
    collections: BTreeMap<String, CollectionDef>,
}

impl CollectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`register`](Self::register) for fixed setups
    pub fn with(mut self, def: CollectionDef) -> Result<Self, MeshError> {
        self.register(def)?;
        Ok(self)
    }

    pub fn register(&mut self, def: CollectionDef) -> Result<(), MeshError> {
        if def.name.is_empty() {
            return Err(MeshError::InvalidArgs("collection name is empty".to_string()));
        }
        if self.collections.contains_key(&def.name) {
            return Err(MeshError::InvalidArgs(format!(
                "collection '{}' registered twice",
                def.name
            )));
        }
        self.collections.insert(def.name.clone(), def);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<&CollectionDef, MeshError> {
        self.collections
            .get(name)
            .ok_or_else(|| MeshError::NotFound(format!("collection '{}'", name)))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.collections.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.collections.keys().cloned().collect()
    }

    /// CRDT kind of a field; unknown fields are `InvalidArgs`
    pub fn field_kind(&self, collection: &str, field: &str) -> Result<CrdtKind, MeshError> {
        let def = self.get(collection)?;
        def.fields.get(field).copied().ok_or_else(|| {
            MeshError::InvalidArgs(format!(
                "collection '{}' has no field '{}'",
                collection, field
            ))
        })
    }

    pub fn from_toml(content: &str) -> Result<Self, MeshError> {
        let file: RegistryFile = toml::from_str(content)?;
        Self::from_defs(file.collections)
    }

    pub fn from_defs(defs: impl IntoIterator<Item = CollectionDef>) -> Result<Self, MeshError> {
        let mut registry = Self::new();
        for def in defs {
            registry.register(def)?;
        }
        Ok(registry)
    }

    pub fn defs(&self) -> impl Iterator<Item = &CollectionDef> {
        self.collections.values()
    }

    pub fn to_toml(&self) -> Result<String, MeshError> {
        let file = RegistryFile {
            collections: self.collections.values().cloned().collect(),
        };
        Ok(toml::to_string_pretty(&file)?)
    }
}

/// Load a registry from a TOML file with `[[collections]]` tables
pub fn load_registry(path: &Path) -> Result<CollectionRegistry, MeshError> {
    let content = std::fs::read_to_string(path)?;
    CollectionRegistry::from_toml(&content)
}

pub fn save_registry(path: &Path, registry: &CollectionRegistry) -> Result<(), MeshError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, registry.to_toml()?)?;
    Ok(())
}
