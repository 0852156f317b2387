//! One opened dataset: partition, metadata, history, store and observers.
//!
//! [`Session`] wires the pieces together the way every caller must: a
//! mutation runs on the partition engine (or the metadata layer), the
//! resulting diff records are combined into one history entry, the tiered
//! store is updated incrementally, and every subscribed observer receives
//! the combined record. Undo/redo replay through the same path with the
//! inverse/forward record, without touching the history stack again.
//!
//! Sessions are plain per-dataset objects; nothing here is global.

use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use crate::cluster::diff::{combine_diffs, ClusterId, DiffRecord, SpikeId};
use crate::cluster::engine::{Clustering, PartitionError};
use crate::cluster::history::{History, HistoryError};
use crate::cluster::metadata::ClusterMetadata;
use crate::config::Config;
use crate::model::SpikeModel;
use crate::store::cluster_store::ClusterStore;
use crate::store::disk::{DiskStore, StoreError};
use crate::store::feature_masks::FeatureMasks;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Partition(#[from] PartitionError),

    #[error(transparent)]
    History(#[from] HistoryError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Handle returned by [`Session::subscribe`], used to unsubscribe.
pub type ObserverId = u64;

type Observer = Box<dyn FnMut(&DiffRecord)>;

/// A manual clustering session over one dataset.
pub struct Session {
    clustering: Clustering,
    metadata: ClusterMetadata,
    history: History<DiffRecord>,
    store: ClusterStore,
    observers: Vec<(ObserverId, Observer)>,
    next_observer: ObserverId,
}

impl Session {
    /// Open a session: build the partition from the model's initial
    /// assignment, open the disk store under the configured root, register
    /// the feature/mask item and run the initial (resumable) generate pass.
    pub fn open(model: Arc<dyn SpikeModel>, config: &Config) -> Result<Self, SessionError> {
        let clustering = Clustering::new(model.spike_clusters().to_vec());
        let disk = DiskStore::open(&config.store.root, model.name())?;
        let mut store = ClusterStore::new(Arc::clone(&model), disk);
        store.register_item(Box::new(FeatureMasks::new(&config.feature_masks)));
        store.generate(clustering.spikes_per_cluster())?;

        info!(
            dataset = model.name(),
            n_spikes = model.n_spikes(),
            n_clusters = clustering.cluster_ids().len(),
            "session opened"
        );

        Ok(Self {
            clustering,
            metadata: ClusterMetadata::new("group", "unsorted"),
            history: History::new(combine_diffs),
            store,
            observers: Vec::new(),
            next_observer: 0,
        })
    }

    pub fn clustering(&self) -> &Clustering {
        &self.clustering
    }

    pub fn metadata(&self) -> &ClusterMetadata {
        &self.metadata
    }

    pub fn store(&self) -> &ClusterStore {
        &self.store
    }

    pub fn history(&self) -> &History<DiffRecord> {
        &self.history
    }

    /// Attach a progress sink for store passes.
    pub fn set_progress(&mut self, sink: impl FnMut(usize, usize) + 'static) {
        self.store.set_progress(sink);
    }

    /// Register an observer called with every emitted diff record.
    pub fn subscribe(&mut self, observer: impl FnMut(&DiffRecord) + 'static) -> ObserverId {
        let id = self.next_observer;
        self.next_observer += 1;
        self.observers.push((id, Box::new(observer)));
        id
    }

    /// Remove an observer. Returns false if the id is unknown.
    pub fn unsubscribe(&mut self, id: ObserverId) -> bool {
        let before = self.observers.len();
        self.observers.retain(|(observer_id, _)| *observer_id != id);
        self.observers.len() < before
    }

    fn notify(&mut self, record: &DiffRecord) {
        for (_, observer) in &mut self.observers {
            observer(record);
        }
    }

    /// Record one user action's diffs, update the store, notify observers.
    fn commit(&mut self, parts: Vec<DiffRecord>) -> Result<DiffRecord, SessionError> {
        let record = combine_diffs(parts.clone());
        if record.is_empty() {
            return Ok(record);
        }
        self.history.record(parts);
        self.store
            .update(&record, self.clustering.spikes_per_cluster())?;
        self.notify(&record);
        Ok(record)
    }

    /// Merge two or more clusters into one.
    pub fn merge(&mut self, clusters: &[ClusterId]) -> Result<DiffRecord, SessionError> {
        let diff = self.clustering.merge(clusters)?;
        let propagated = self.metadata.on_partition(&diff);
        self.commit(vec![diff, propagated])
    }

    /// Carve a spike subset out of its clusters.
    pub fn split(&mut self, spikes: &[SpikeId]) -> Result<DiffRecord, SessionError> {
        let diff = self.clustering.split(spikes)?;
        let propagated = self.metadata.on_partition(&diff);
        self.commit(vec![diff, propagated])
    }

    /// Move spikes into an explicit target cluster.
    pub fn assign(
        &mut self,
        spikes: &[SpikeId],
        target: ClusterId,
    ) -> Result<DiffRecord, SessionError> {
        let diff = self.clustering.assign(spikes, target)?;
        let propagated = self.metadata.on_partition(&diff);
        self.commit(vec![diff, propagated])
    }

    /// Set the metadata value for the given clusters.
    pub fn move_clusters(
        &mut self,
        clusters: &[ClusterId],
        value: &str,
    ) -> Result<DiffRecord, SessionError> {
        for &cluster in clusters {
            if !self.clustering.spikes_per_cluster().contains_key(&cluster) {
                return Err(PartitionError::InvalidCluster(cluster).into());
            }
        }
        let diff = self.metadata.set(clusters, value);
        self.commit(vec![diff])
    }

    /// Undo the latest applied entry, returning the inverse record.
    pub fn undo(&mut self) -> Result<DiffRecord, SessionError> {
        let entry = self.history.undo()?.clone();
        let record = if entry.touches_partition() {
            self.clustering.revert(&entry)
        } else {
            entry.inverted()
        };
        self.metadata.revert(&entry);
        self.store
            .update(&record, self.clustering.spikes_per_cluster())?;
        self.notify(&record);
        Ok(record)
    }

    /// Re-apply the entry above the cursor, returning the forward record.
    pub fn redo(&mut self) -> Result<DiffRecord, SessionError> {
        let entry = self.history.redo()?.clone();
        let record = if entry.touches_partition() {
            self.clustering.reapply(&entry)
        } else {
            entry.as_redo()
        };
        self.metadata.reapply(&entry);
        self.store
            .update(&record, self.clustering.spikes_per_cluster())?;
        self.notify(&record);
        Ok(record)
    }
}
