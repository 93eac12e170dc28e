// src/param_store.rs
//
// Key-value parameter store addressed by dotted `section.index:key` paths.
// Values are kept as strings; typed getters parse on read and fall back to
// the caller's default when the key is missing or unparsable.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::{debug, info, warn};

pub trait ParamStore: Send + Sync {
    fn get_raw(&self, key: &str) -> Option<String>;

    fn set_string(&self, key: &str, value: &str) -> Result<()>;

    /// Persist pending writes to durable storage.
    fn save(&self) -> Result<()>;

    fn get_string(&self, key: &str, default: &str) -> String {
        self.get_raw(key).unwrap_or_else(|| default.to_string())
    }

    fn get_int(&self, key: &str, default: i32) -> i32 {
        match self.get_raw(key) {
            Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
                warn!("Parameter {}={:?} is not an integer, using {}", key, raw, default);
                default
            }),
            None => default,
        }
    }

    fn get_float(&self, key: &str, default: f32) -> f32 {
        match self.get_raw(key) {
            Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
                warn!("Parameter {}={:?} is not a number, using {}", key, raw, default);
                default
            }),
            None => default,
        }
    }

    fn set_int(&self, key: &str, value: i32) -> Result<()> {
        self.set_string(key, &value.to_string())
    }
}

/// Parameter store persisted as a flat YAML mapping of key → scalar.
pub struct FileParamStore {
    path: PathBuf,
    values: RwLock<BTreeMap<String, String>>,
}

impl FileParamStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let values = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read parameter file {}", path.display()))?;
            parse_flat_yaml(&contents)
                .with_context(|| format!("Failed to parse parameter file {}", path.display()))?
        } else {
            warn!(
                "Parameter file {} not found, starting with an empty store",
                path.display()
            );
            BTreeMap::new()
        };

        info!("✓ Loaded {} parameters from {}", values.len(), path.display());

        Ok(Self {
            path,
            values: RwLock::new(values),
        })
    }
}

impl ParamStore for FileParamStore {
    fn get_raw(&self, key: &str) -> Option<String> {
        self.values
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    fn set_string(&self, key: &str, value: &str) -> Result<()> {
        self.values
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), value.to_string());
        debug!("Parameter {} = {:?}", key, value);
        Ok(())
    }

    fn save(&self) -> Result<()> {
        let serialized = {
            let values = self.values.read().unwrap_or_else(|e| e.into_inner());
            serde_yaml::to_string(&*values).context("Failed to serialize parameters")?
        };

        // Write-then-rename so a crash never leaves a truncated file behind.
        let tmp_path = self.path.with_extension("tmp");
        fs::write(&tmp_path, serialized)
            .with_context(|| format!("Failed to write {}", tmp_path.display()))?;
        fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;

        debug!("Parameters saved to {}", self.path.display());
        Ok(())
    }
}

fn parse_flat_yaml(contents: &str) -> Result<BTreeMap<String, String>> {
    if contents.trim().is_empty() {
        return Ok(BTreeMap::new());
    }

    let raw: BTreeMap<String, serde_yaml::Value> = serde_yaml::from_str(contents)?;
    let mut values = BTreeMap::new();
    for (key, value) in raw {
        let text = match value {
            serde_yaml::Value::String(s) => s,
            serde_yaml::Value::Number(n) => n.to_string(),
            serde_yaml::Value::Bool(b) => if b { "1" } else { "0" }.to_string(),
            serde_yaml::Value::Null => String::new(),
            other => {
                warn!("Parameter {} has a non-scalar value, skipped: {:?}", key, other);
                continue;
            }
        };
        values.insert(key, text);
    }
    Ok(values)
}

/// In-memory store used by unit tests; can be told to fail on save.
#[cfg(test)]
#[derive(Default)]
pub struct MemoryParamStore {
    values: RwLock<BTreeMap<String, String>>,
    pub saves: std::sync::atomic::AtomicUsize,
    pub fail_save: std::sync::atomic::AtomicBool,
}

#[cfg(test)]
impl MemoryParamStore {
    pub fn with(entries: &[(&str, &str)]) -> Self {
        let store = Self::default();
        for (k, v) in entries {
            store.set_string(k, v).unwrap();
        }
        store
    }

    pub fn remove(&self, key: &str) {
        self.values.write().unwrap().remove(key);
    }
}

#[cfg(test)]
impl ParamStore for MemoryParamStore {
    fn get_raw(&self, key: &str) -> Option<String> {
        self.values.read().unwrap().get(key).cloned()
    }

    fn set_string(&self, key: &str, value: &str) -> Result<()> {
        self.values
            .write()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn save(&self) -> Result<()> {
        use std::sync::atomic::Ordering;
        if self.fail_save.load(Ordering::SeqCst) {
            anyhow::bail!("simulated storage failure");
        }
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_getters_with_defaults() {
        let store = MemoryParamStore::with(&[
            ("ai.roi:count", "3"),
            ("ai.roi:detection_threshold", "0.55"),
            ("ai.roi.0:name", "gate"),
            ("ai.roi.1:x", "abc"),
        ]);
        assert_eq!(store.get_int("ai.roi:count", 0), 3);
        assert!((store.get_float("ai.roi:detection_threshold", 0.4) - 0.55).abs() < 1e-6);
        assert_eq!(store.get_string("ai.roi.0:name", ""), "gate");
        assert_eq!(store.get_int("ai.roi.1:x", 7), 7);
        assert_eq!(store.get_int("missing", 42), 42);
        assert_eq!(store.get_string("missing", "dflt"), "dflt");
    }

    #[test]
    fn test_file_store_round_trips_through_save() {
        let dir = std::env::temp_dir().join(format!("ipc_params_{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("params.yaml");

        let store = FileParamStore::open(&path).unwrap();
        store.set_int("ai.roi:enable", 1).unwrap();
        store.set_string("ai.roi.0:classes", "0,2").unwrap();
        store.save().unwrap();

        let reopened = FileParamStore::open(&path).unwrap();
        assert_eq!(reopened.get_int("ai.roi:enable", 0), 1);
        assert_eq!(reopened.get_string("ai.roi.0:classes", ""), "0,2");

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_yaml_scalars_are_stringified() {
        let values = parse_flat_yaml("\"ai.roi:enable\": true\n\"ai.roi:count\": 2\n\"ai.roi.0:name\": door\n").unwrap();
        assert_eq!(values.get("ai.roi:enable").unwrap(), "1");
        assert_eq!(values.get("ai.roi:count").unwrap(), "2");
        assert_eq!(values.get("ai.roi.0:name").unwrap(), "door");
    }
}
