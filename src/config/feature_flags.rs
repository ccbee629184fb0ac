//! Process-wide, reloadable feature flag map.
//!
//! Mirrors `infrastructure::settings_persistence`'s atomic-write JSON
//! persistence, but read-only from the engine's perspective: flags are
//! authored externally and the engine reloads them.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FlagEntry {
    pub enabled: bool,
    #[serde(default)]
    pub settings: HashMap<String, Value>,
    #[serde(default, rename = "shadowMode")]
    pub shadow_mode: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct FlagFile {
    features: HashMap<String, FlagEntry>,
}

/// Legacy flag names that still resolve, mapped to their current name.
fn legacy_aliases() -> &'static [(&'static str, &'static str)] {
    &[
        ("ADVANCED_INDICATORS", "ADVANCED_INDICATORS"),
        ("ML_SIGNALS", "ML_ENHANCED_SIGNALS"),
        ("VOLUME_ANALYSIS", "ML_VOLUME_ANALYSIS"),
        ("PATTERN_SIZING", "PATTERN_BASED_SIZING"),
    ]
}

pub struct FeatureFlags {
    path: Option<PathBuf>,
    map: RwLock<HashMap<String, FlagEntry>>,
}

impl FeatureFlags {
    /// Construct from a JSON file at boot. A missing file yields an empty,
    /// all-flags-disabled map rather than a startup error — unknown flags
    /// already return false, so an absent file is a safe default, not a
    /// `ConfigError`.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let map = Self::read_file(&path).unwrap_or_default();
        Ok(Self {
            path: Some(path),
            map: RwLock::new(map),
        })
    }

    pub fn empty() -> Self {
        Self {
            path: None,
            map: RwLock::new(HashMap::new()),
        }
    }

    fn read_file(path: &PathBuf) -> Result<HashMap<String, FlagEntry>> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading feature flag file at {path:?}"))?;
        let parsed: FlagFile =
            serde_json::from_str(&content).context("parsing feature flag JSON")?;
        Ok(parsed.features)
    }

    fn resolve(&self, name: &str) -> String {
        legacy_aliases()
            .iter()
            .find(|(alias, _)| *alias == name)
            .map(|(_, canonical)| canonical.to_string())
            .unwrap_or_else(|| name.to_string())
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        let canonical = self.resolve(name);
        self.map
            .read()
            .unwrap()
            .get(&canonical)
            .map(|e| e.enabled)
            .unwrap_or(false)
    }

    pub fn shadow_mode(&self, name: &str) -> bool {
        let canonical = self.resolve(name);
        self.map
            .read()
            .unwrap()
            .get(&canonical)
            .map(|e| e.shadow_mode)
            .unwrap_or(false)
    }

    pub fn setting(&self, name: &str, key: &str, default: Value) -> Value {
        let canonical = self.resolve(name);
        self.map
            .read()
            .unwrap()
            .get(&canonical)
            .and_then(|e| e.settings.get(key).cloned())
            .unwrap_or(default)
    }

    /// Re-read the file and atomically swap the map. On parse failure, the
    /// previous map is kept and the reload is reported as failed — a reload
    /// must never leave the process flagless (spec §4.1 / SPEC_FULL §4.1).
    pub fn reload(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        match Self::read_file(path) {
            Ok(new_map) => {
                *self.map.write().unwrap() = new_map;
                info!("feature flags reloaded from {:?}", path);
                Ok(())
            }
            Err(e) => {
                warn!("feature flag reload failed, keeping previous map: {e}");
                Err(e)
            }
        }
    }
}
