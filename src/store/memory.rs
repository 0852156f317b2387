//! The memory tier: ephemeral per-cluster derived values.
//!
//! Never persisted; everything here is recomputable from the persistent tier
//! plus the live partition, and is rebuilt by the owning store item on
//! demand.

use std::collections::HashMap;

use crate::cluster::diff::ClusterId;

/// A derived value held in the memory tier.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheValue {
    Count(usize),
    /// Small f32 vector (per-channel aggregate, position, ...).
    Vector(Vec<f32>),
    /// Ordered list of channel indices.
    Channels(Vec<usize>),
}

impl CacheValue {
    pub fn as_count(&self) -> Option<usize> {
        match self {
            CacheValue::Count(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_vector(&self) -> Option<&[f32]> {
        match self {
            CacheValue::Vector(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_channels(&self) -> Option<&[usize]> {
        match self {
            CacheValue::Channels(v) => Some(v),
            _ => None,
        }
    }
}

/// Cluster-keyed map of named memory-tier values.
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: HashMap<ClusterId, HashMap<&'static str, CacheValue>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&mut self, cluster: ClusterId, field: &'static str, value: CacheValue) {
        self.values.entry(cluster).or_default().insert(field, value);
    }

    pub fn load(&self, cluster: ClusterId, field: &str) -> Option<&CacheValue> {
        self.values.get(&cluster)?.get(field)
    }

    /// Drop every value of a deleted cluster.
    pub fn remove_cluster(&mut self, cluster: ClusterId) {
        self.values.remove(&cluster);
    }

    /// Clusters currently holding at least one value.
    pub fn clusters(&self) -> Vec<ClusterId> {
        let mut ids: Vec<ClusterId> = self.values.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}
