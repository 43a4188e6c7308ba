//! Per-device persistent tuning store.
//!
//! A flat key → u32 map backed by one TOML document per device under the
//! state directory. Setters persist synchronously; device bring-up loads
//! each key and falls back to the documented default when it is missing.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::error::{CxError, Result};

pub struct TuningStore {
    path: Option<PathBuf>,
    values: BTreeMap<String, u32>,
}

impl TuningStore {
    /// Opens (or creates) the store for `device_name` under `dir`.
    pub fn open(dir: &Path, device_name: &str) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(format!("{device_name}.toml"));
        let values = match fs::read_to_string(&path) {
            Ok(text) => toml::from_str(&text)
                .map_err(|e| CxError::Config(format!("{}: {e}", path.display())))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path: Some(path),
            values,
        })
    }

    /// A store that never touches the filesystem.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            values: BTreeMap::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<u32> {
        self.values.get(key).copied()
    }

    /// Assigns and persists one key. The in-memory value is updated even
    /// if persistence fails, so the caller observes a consistent view.
    pub fn set(&mut self, key: &str, value: u32) -> Result<()> {
        self.values.insert(key.to_string(), value);
        if let Some(path) = &self.path {
            let text = toml::to_string(&self.values)
                .map_err(|e| CxError::Config(e.to_string()))?;
            if let Err(e) = fs::write(path, text) {
                warn!(key, value, error = %e, "failed to persist tuning value");
                return Err(e.into());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_keys_are_absent() {
        let store = TuningStore::in_memory();
        assert_eq!(store.get("vmux"), None);
    }

    #[test]
    fn values_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store = TuningStore::open(dir.path(), "cxadc0").unwrap();
            store.set("level", 20).unwrap();
            store.set("vmux", 1).unwrap();
        }
        let store = TuningStore::open(dir.path(), "cxadc0").unwrap();
        assert_eq!(store.get("level"), Some(20));
        assert_eq!(store.get("vmux"), Some(1));

        // A different device name is a different document.
        let other = TuningStore::open(dir.path(), "cxadc1").unwrap();
        assert_eq!(other.get("level"), None);
    }
}
