//! cluster-tier: incremental manual-clustering engine.
//!
//! Maintains an evolving partition of a fixed spike population into
//! clusters, with structured mutations (merge, split, assign), linear
//! undo/redo over immutable diff records, and a tiered (memory + disk)
//! per-cluster cache that stays consistent with every mutation while
//! touching only the clusters the mutation named. Designed for populations
//! of 10^5-10^7 spikes across 10^2-10^4 clusters.

pub mod cluster;
pub mod config;
pub mod model;
pub mod session;
pub mod store;

pub use cluster::diff::{ClusterId, DiffKind, DiffRecord, HistoryDirection, SpikeId};
pub use cluster::engine::{Clustering, PartitionError};
pub use cluster::history::{History, HistoryError};
pub use cluster::metadata::ClusterMetadata;
pub use config::Config;
pub use model::{FlatModel, SpikeModel};
pub use session::{ObserverId, Session, SessionError};
pub use store::cluster_store::{ClusterStore, FieldSpec, FieldTier, StoreItem};
pub use store::disk::{DiskStore, FlatArray, StoreError};
pub use store::feature_masks::FeatureMasks;
