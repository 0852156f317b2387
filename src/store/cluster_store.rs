//! The tiered cluster store engine.
//!
//! [`ClusterStore`] keeps, for every live cluster, a set of derived fields in
//! two tiers (memory, disk) and guarantees they stay correct across any
//! sequence of partition mutations. The work is done by registered
//! [`StoreItem`] plugins; the engine owns the tiers, fans `generate`/`update`
//! out to the items, and prunes the memory tier for deleted clusters.
//! Orphaned disk entries of deleted clusters are left in place so an update
//! touches only the clusters named by its diff.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info};

use crate::cluster::diff::{ClusterId, DiffRecord, SpikeId};
use crate::model::SpikeModel;
use crate::store::disk::{DiskStore, StoreError};
use crate::store::memory::MemoryStore;

/// Storage tier of one cache field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldTier {
    /// Ephemeral: rebuilt on demand, never persisted.
    Memory,
    /// Durable: flat binary array addressed by `(cluster, field)`.
    Disk,
}

/// A named field declared by a store item.
#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub name: &'static str,
    pub tier: FieldTier,
}

/// Optional progress sink: `(completed, total)` at batch boundaries.
pub type Progress = Box<dyn FnMut(usize, usize)>;

/// Everything a store item needs during a pass.
pub struct StoreContext<'a> {
    pub model: &'a dyn SpikeModel,
    pub memory: &'a mut MemoryStore,
    pub disk: &'a DiskStore,
    pub progress: &'a mut Option<Progress>,
}

impl StoreContext<'_> {
    /// Report progress if a sink is attached.
    pub fn report(&mut self, completed: usize, total: usize) {
        if let Some(sink) = self.progress.as_mut() {
            sink(completed, total);
        }
    }
}

/// A pluggable unit of derived, cluster-keyed data.
///
/// An item declares its fields and tiers and implements the two population
/// primitives. `generate` must be idempotent and resumable; `update` must
/// touch persistent entries only for the clusters its diff names.
pub trait StoreItem {
    fn name(&self) -> &'static str;

    fn fields(&self) -> &'static [FieldSpec];

    /// Full (re)population pass over the given partition.
    fn generate(
        &mut self,
        cx: &mut StoreContext<'_>,
        spikes_per_cluster: &BTreeMap<ClusterId, Arc<Vec<SpikeId>>>,
    ) -> Result<(), StoreError>;

    /// Incremental pass after one partition/metadata mutation.
    fn update(
        &mut self,
        cx: &mut StoreContext<'_>,
        record: &DiffRecord,
        spikes_per_cluster: &BTreeMap<ClusterId, Arc<Vec<SpikeId>>>,
    ) -> Result<(), StoreError>;
}

/// The tiered, cluster-keyed cache for one dataset.
pub struct ClusterStore {
    model: Arc<dyn SpikeModel>,
    memory: MemoryStore,
    disk: DiskStore,
    items: Vec<Box<dyn StoreItem>>,
    progress: Option<Progress>,
}

impl ClusterStore {
    pub fn new(model: Arc<dyn SpikeModel>, disk: DiskStore) -> Self {
        Self {
            model,
            memory: MemoryStore::new(),
            disk,
            items: Vec::new(),
            progress: None,
        }
    }

    /// Attach a progress sink. Its absence changes no behavior.
    pub fn set_progress(&mut self, sink: impl FnMut(usize, usize) + 'static) {
        self.progress = Some(Box::new(sink));
    }

    pub fn register_item(&mut self, item: Box<dyn StoreItem>) {
        debug!(item = item.name(), fields = item.fields().len(), "registered store item");
        self.items.push(item);
    }

    /// Full population pass for every registered item.
    ///
    /// Idempotent: intact entries are probed and skipped, so an interrupted
    /// earlier pass resumes instead of starting over.
    pub fn generate(
        &mut self,
        spikes_per_cluster: &BTreeMap<ClusterId, Arc<Vec<SpikeId>>>,
    ) -> Result<(), StoreError> {
        let model = Arc::clone(&self.model);
        let (items, memory, disk, progress) = (
            &mut self.items,
            &mut self.memory,
            &self.disk,
            &mut self.progress,
        );
        for item in items.iter_mut() {
            let mut cx = StoreContext {
                model: model.as_ref(),
                memory: &mut *memory,
                disk,
                progress: &mut *progress,
            };
            item.generate(&mut cx, spikes_per_cluster)?;
        }
        info!(
            n_clusters = spikes_per_cluster.len(),
            n_items = self.items.len(),
            "store generated"
        );
        Ok(())
    }

    /// Incremental pass after one mutation.
    ///
    /// Memory-tier values of deleted clusters are dropped; their disk entries
    /// stay behind as orphans. Every cluster absent from the diff keeps its
    /// stored bytes bit-identical.
    pub fn update(
        &mut self,
        record: &DiffRecord,
        spikes_per_cluster: &BTreeMap<ClusterId, Arc<Vec<SpikeId>>>,
    ) -> Result<(), StoreError> {
        for &cluster in &record.deleted {
            self.memory.remove_cluster(cluster);
        }

        let model = Arc::clone(&self.model);
        let (items, memory, disk, progress) = (
            &mut self.items,
            &mut self.memory,
            &self.disk,
            &mut self.progress,
        );
        for item in items.iter_mut() {
            let mut cx = StoreContext {
                model: model.as_ref(),
                memory: &mut *memory,
                disk,
                progress: &mut *progress,
            };
            item.update(&mut cx, record, spikes_per_cluster)?;
        }

        debug!(
            added = record.added.len(),
            deleted = record.deleted.len(),
            "store updated"
        );
        Ok(())
    }

    pub fn memory(&self) -> &MemoryStore {
        &self.memory
    }

    pub fn disk(&self) -> &DiskStore {
        &self.disk
    }
}
