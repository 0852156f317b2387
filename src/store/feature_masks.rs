//! The feature/mask store item.
//!
//! Streams the raw per-spike feature and mask rows from the source model
//! into per-cluster disk arrays, then derives the per-cluster mask
//! aggregates (mean masks, unmasked channels, probe position) into the
//! memory tier. Two passes, neither of which holds more than one cluster's
//! mask array in memory:
//!
//! 1. distribution: one walk over the spikes in ascending id order, each row
//!    appended to its cluster's file at a per-cluster write cursor -- rows
//!    land sorted by spike id without a separate sort;
//! 2. aggregation: per cluster, read the masks back and reduce.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use tracing::warn;

use crate::cluster::diff::{ClusterId, DiffKind, DiffRecord, SpikeId};
use crate::config::FeatureMasksConfig;
use crate::store::cluster_store::{FieldSpec, FieldTier, StoreContext, StoreItem};
use crate::store::disk::{FlatArray, ProbeResult, StoreError, WriterPool};

pub const FEATURES: &str = "features";
pub const MASKS: &str = "masks";
pub const SUM_MASKS: &str = "sum_masks";
pub const MEAN_MASKS: &str = "mean_masks";
pub const N_UNMASKED_CHANNELS: &str = "n_unmasked_channels";
pub const MAIN_CHANNELS: &str = "main_channels";
pub const MEAN_PROBE_POSITION: &str = "mean_probe_position";

const FIELDS: [FieldSpec; 7] = [
    FieldSpec { name: FEATURES, tier: FieldTier::Disk },
    FieldSpec { name: MASKS, tier: FieldTier::Disk },
    FieldSpec { name: SUM_MASKS, tier: FieldTier::Memory },
    FieldSpec { name: MEAN_MASKS, tier: FieldTier::Memory },
    FieldSpec { name: N_UNMASKED_CHANNELS, tier: FieldTier::Memory },
    FieldSpec { name: MAIN_CHANNELS, tier: FieldTier::Memory },
    FieldSpec { name: MEAN_PROBE_POSITION, tier: FieldTier::Memory },
];

pub struct FeatureMasks {
    /// A channel is unmasked when its mean mask exceeds this.
    threshold: f32,
    /// Spikes between progress reports in the distribution pass.
    progress_batch: usize,
}

impl FeatureMasks {
    pub fn new(config: &FeatureMasksConfig) -> Self {
        Self {
            threshold: config.unmasked_threshold,
            progress_batch: config.progress_batch.max(1),
        }
    }

    /// Expected disk shapes for a cluster of `n` spikes.
    fn shapes(cx: &StoreContext<'_>, n: usize) -> [(&'static str, Vec<usize>); 2] {
        let n_channels = cx.model.n_channels();
        let n_features = cx.model.n_features_per_channel();
        [
            (FEATURES, vec![n, n_channels, n_features]),
            (MASKS, vec![n, n_channels]),
        ]
    }

    /// Ensure a cluster's entry exists with the expected shape.
    ///
    /// Returns true when the entry was (re)created and must be populated.
    /// An intact entry whose first and last rows are all zero is used as-is
    /// but flagged: it is the signature of an interrupted write.
    fn prepare_entry(
        cx: &mut StoreContext<'_>,
        cluster: ClusterId,
        field: &'static str,
        shape: &[usize],
        force: bool,
    ) -> Result<bool, StoreError> {
        if !force {
            match cx.disk.probe(cluster, field, shape)? {
                ProbeResult::Intact { suspect: false } => return Ok(false),
                ProbeResult::Intact { suspect: true } => {
                    warn!(
                        cluster,
                        field, "entry has all-zero boundary rows, keeping it as-is"
                    );
                    return Ok(false);
                }
                ProbeResult::Missing | ProbeResult::Mismatch => {}
            }
        }
        let blank = FlatArray::zeros(shape.to_vec());
        cx.disk.save(cluster, field, &blank.shape, &blank.data)?;
        Ok(true)
    }

    /// Populate the given clusters: prepare entries, distribute rows,
    /// recompute aggregates. Clusters in `force` are rewritten even when an
    /// entry of the right shape exists.
    fn populate(
        &mut self,
        cx: &mut StoreContext<'_>,
        clusters: &BTreeSet<ClusterId>,
        force: &BTreeSet<ClusterId>,
        spikes_per_cluster: &BTreeMap<ClusterId, Arc<Vec<SpikeId>>>,
    ) -> Result<(), StoreError> {
        // Pass 0: make sure every entry exists with the right shape, noting
        // which ones need their rows written.
        let mut to_write: BTreeMap<ClusterId, [bool; 2]> = BTreeMap::new();
        for &cluster in clusters {
            let n = spikes_per_cluster[&cluster].len();
            let mut flags = [false; 2];
            for (i, (field, shape)) in Self::shapes(cx, n).into_iter().enumerate() {
                flags[i] =
                    Self::prepare_entry(cx, cluster, field, &shape, force.contains(&cluster))?;
            }
            if flags.iter().any(|&f| f) {
                to_write.insert(cluster, flags);
            }
        }

        // Pass 1: distribution. All spikes of the clusters to write, in
        // ascending spike order, appended at per-cluster cursors.
        let mut pairs: Vec<(SpikeId, ClusterId)> = to_write
            .keys()
            .flat_map(|&c| spikes_per_cluster[&c].iter().map(move |&s| (s, c)))
            .collect();
        pairs.sort_unstable();

        let total = pairs.len();
        let mut cursors: HashMap<ClusterId, usize> = HashMap::new();
        let mut pool = WriterPool::new(cx.disk);
        for (i, &(spike, cluster)) in pairs.iter().enumerate() {
            let row = *cursors.get(&cluster).unwrap_or(&0);
            let [write_features, write_masks] = to_write[&cluster];
            if write_features {
                pool.write_row(cluster, FEATURES, row, cx.model.features(spike))?;
            }
            if write_masks {
                pool.write_row(cluster, MASKS, row, cx.model.masks(spike))?;
            }
            cursors.insert(cluster, row + 1);
            if (i + 1) % self.progress_batch == 0 {
                cx.report(i + 1, total);
            }
        }
        pool.finish()?;
        if total > 0 {
            cx.report(total, total);
        }

        // Pass 2: aggregation over every requested cluster.
        let n_clusters = clusters.len();
        for (done, &cluster) in clusters.iter().enumerate() {
            self.aggregate(cx, cluster)?;
            cx.report(done + 1, n_clusters);
        }
        Ok(())
    }

    /// Reduce one cluster's mask array into the memory-tier aggregates.
    fn aggregate(&self, cx: &mut StoreContext<'_>, cluster: ClusterId) -> Result<(), StoreError> {
        use crate::store::memory::CacheValue;

        let masks = cx.disk.load_required(cluster, MASKS)?;
        let n_spikes = masks.n_rows();
        let n_channels = cx.model.n_channels();

        let mut sum_masks = vec![0.0f32; n_channels];
        for i in 0..n_spikes {
            for (channel, &value) in masks.row(i).iter().enumerate() {
                sum_masks[channel] += value;
            }
        }
        let mean_masks: Vec<f32> = sum_masks
            .iter()
            .map(|&s| s / n_spikes.max(1) as f32)
            .collect();

        let unmasked: Vec<usize> = (0..n_channels)
            .filter(|&c| mean_masks[c] > self.threshold)
            .collect();

        // Channel positions weighted by mean mask, averaged over channels.
        let positions = cx.model.channel_positions();
        let mut position = [0.0f32; 2];
        for channel in 0..n_channels {
            position[0] += positions[channel][0] * mean_masks[channel];
            position[1] += positions[channel][1] * mean_masks[channel];
        }
        position[0] /= n_channels.max(1) as f32;
        position[1] /= n_channels.max(1) as f32;

        // Unmasked channels ranked by descending mean mask.
        let mut main_channels = unmasked.clone();
        main_channels.sort_by(|&a, &b| {
            mean_masks[b]
                .partial_cmp(&mean_masks[a])
                .unwrap_or(Ordering::Equal)
                .then(a.cmp(&b))
        });

        cx.memory.store(cluster, SUM_MASKS, CacheValue::Vector(sum_masks));
        cx.memory.store(cluster, MEAN_MASKS, CacheValue::Vector(mean_masks));
        cx.memory
            .store(cluster, N_UNMASKED_CHANNELS, CacheValue::Count(unmasked.len()));
        cx.memory
            .store(cluster, MAIN_CHANNELS, CacheValue::Channels(main_channels));
        cx.memory.store(
            cluster,
            MEAN_PROBE_POSITION,
            CacheValue::Vector(position.to_vec()),
        );
        Ok(())
    }
}

impl StoreItem for FeatureMasks {
    fn name(&self) -> &'static str {
        "features and masks"
    }

    fn fields(&self) -> &'static [FieldSpec] {
        &FIELDS
    }

    fn generate(
        &mut self,
        cx: &mut StoreContext<'_>,
        spikes_per_cluster: &BTreeMap<ClusterId, Arc<Vec<SpikeId>>>,
    ) -> Result<(), StoreError> {
        let clusters: BTreeSet<ClusterId> = spikes_per_cluster.keys().copied().collect();
        self.populate(cx, &clusters, &BTreeSet::new(), spikes_per_cluster)
    }

    fn update(
        &mut self,
        cx: &mut StoreContext<'_>,
        record: &DiffRecord,
        spikes_per_cluster: &BTreeMap<ClusterId, Arc<Vec<SpikeId>>>,
    ) -> Result<(), StoreError> {
        let targets: BTreeSet<ClusterId> = record
            .clusters_to_refresh()
            .into_iter()
            .filter(|c| spikes_per_cluster.contains_key(c))
            .collect();
        if targets.is_empty() {
            return Ok(());
        }

        // Ids minted by merge/split are fresh, and ids brought back by
        // undo/redo still hold their exact old rows, so intact entries can be
        // trusted. An assign target is a caller-chosen label that may collide
        // with an orphaned entry: rewrite it unconditionally.
        let force: BTreeSet<ClusterId> =
            if record.kind == DiffKind::Assign && record.history.is_none() {
                record.added.intersection(&targets).copied().collect()
            } else {
                BTreeSet::new()
            };

        self.populate(cx, &targets, &force, spikes_per_cluster)
    }
}
