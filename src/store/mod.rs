//! Tiered per-cluster cache.
//!
//! This module contains the two storage tiers and the store engine:
//! - [`memory`]: ephemeral per-cluster derived values
//! - [`disk`]: persistent flat binary arrays, probing, the writer pool
//! - [`cluster_store`]: the engine, field/tier declarations, StoreItem plugin contract
//! - [`feature_masks`]: the feature/mask aggregation store item

pub mod cluster_store;
pub mod disk;
pub mod feature_masks;
pub mod memory;
