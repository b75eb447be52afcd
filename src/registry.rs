//! Service registry — how services discover each other's allocated ports.
//!
//! The supervisor writes `.parley/registry.json` after resolving each
//! service's port; the `train` CLI and any supervised service can read it
//! back. Writes go through a temp file plus rename so readers never observe
//! a half-written registry.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const REGISTRY_DIR: &str = ".parley";
pub const REGISTRY_FILE: &str = "registry.json";

/// One registered service endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub port: u16,
    pub health_path: String,
    pub required: bool,
}

/// Mapping from service name to its resolved endpoint.
///
/// BTreeMap keeps the on-disk file stable across rewrites, which makes it
/// diffable when debugging a bring-up.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRegistry {
    #[serde(flatten)]
    entries: BTreeMap<String, RegistryEntry>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn default_path(base_dir: &Path) -> PathBuf {
        base_dir.join(REGISTRY_DIR).join(REGISTRY_FILE)
    }

    pub fn insert(&mut self, name: &str, entry: RegistryEntry) {
        self.entries.insert(name.to_string(), entry);
    }

    pub fn remove(&mut self, name: &str) -> Option<RegistryEntry> {
        self.entries.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&RegistryEntry> {
        self.entries.get(name)
    }

    pub fn port_of(&self, name: &str) -> Option<u16> {
        self.entries.get(name).map(|e| e.port)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &RegistryEntry)> {
        self.entries.iter()
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read service registry {}", path.display()))?;
        serde_json::from_str(&text).context("Failed to parse service registry")
    }

    /// Atomic write: serialize to `<path>.tmp`, then rename over `path`.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let json =
            serde_json::to_string_pretty(&self).context("Failed to serialize service registry")?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("Failed to move registry into place at {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(port: u16) -> RegistryEntry {
        RegistryEntry {
            port,
            health_path: "/".to_string(),
            required: true,
        }
    }

    #[test]
    fn round_trips_through_json() {
        let mut registry = ServiceRegistry::new();
        registry.insert("gateway", entry(8030));
        registry.insert(
            "bridge",
            RegistryEntry {
                port: 8082,
                health_path: "/health".to_string(),
                required: true,
            },
        );

        let json = serde_json::to_string(&registry).unwrap();
        // Flattened map: service names are top-level keys.
        assert!(json.contains(r#""gateway""#));
        assert!(json.contains(r#""health_path":"/health""#));

        let parsed: ServiceRegistry = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, registry);
        assert_eq!(parsed.port_of("gateway"), Some(8030));
    }

    #[test]
    fn save_and_load_via_tempdir() {
        let dir = tempfile::tempdir().unwrap();
        let path = ServiceRegistry::default_path(dir.path());

        let mut registry = ServiceRegistry::new();
        registry.insert("gateway", entry(8031));
        registry.save(&path).unwrap();

        let loaded = ServiceRegistry::load(&path).unwrap();
        assert_eq!(loaded.port_of("gateway"), Some(8031));

        // No stray temp file left behind.
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn rewrite_replaces_previous_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");

        let mut registry = ServiceRegistry::new();
        registry.insert("gateway", entry(8030));
        registry.save(&path).unwrap();

        registry.remove("gateway");
        registry.insert("bridge", entry(8082));
        registry.save(&path).unwrap();

        let loaded = ServiceRegistry::load(&path).unwrap();
        assert!(loaded.get("gateway").is_none());
        assert_eq!(loaded.port_of("bridge"), Some(8082));
    }
}
