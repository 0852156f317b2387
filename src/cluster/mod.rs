//! Manual clustering core.
//!
//! This module contains the partition engine and its supporting types:
//! - [`diff`]: DiffRecord, the immutable description of one mutation
//! - [`engine`]: Clustering, the spike → cluster partition and its mutations
//! - [`history`]: generic linear undo/redo stack over diff records
//! - [`metadata`]: per-cluster metadata with lineage propagation

pub mod diff;
pub mod engine;
pub mod history;
pub mod metadata;
