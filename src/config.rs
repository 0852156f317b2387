//! Runtime configuration for cluster-tier.
//!
//! Configuration can be loaded from a JSON file or constructed
//! programmatically. All store-related knobs (root path, aggregation
//! thresholds, progress batching) live here.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Disk store settings.
    pub store: StoreConfig,

    /// Feature/mask aggregation settings.
    pub feature_masks: FeatureMasksConfig,
}

/// Disk store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Root directory holding one sub-directory per dataset.
    pub root: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("cluster_store"),
        }
    }
}

/// Feature/mask aggregation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureMasksConfig {
    /// A channel counts as unmasked when its mean mask exceeds this.
    pub unmasked_threshold: f32,

    /// Spikes between progress reports during distribution passes.
    pub progress_batch: usize,
}

impl Default for FeatureMasksConfig {
    fn default() -> Self {
        Self {
            unmasked_threshold: 1e-3,
            progress_batch: 100,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults when the
    /// file does not exist.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&data)?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }
}
