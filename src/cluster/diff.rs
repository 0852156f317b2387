//! Diff records: immutable descriptions of one clustering mutation.
//!
//! Every mutation of the partition (merge, split, assign) or of per-cluster
//! metadata produces exactly one [`DiffRecord`]. The record is the sole
//! currency between the partition engine, the undo history, the tiered
//! cluster store and any subscribed observer: it names the clusters that
//! appeared and disappeared, the lineage between them, and carries enough of
//! the before/after partition to invert the mutation exactly.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Index of a spike in the fixed, externally-owned population.
pub type SpikeId = usize;

/// Label of a cluster. Allocation is monotone: a freshly minted id is
/// strictly greater than every id ever used, even after deletions; only
/// undo rolls the allocator back.
pub type ClusterId = u64;

/// Which kind of mutation produced a diff record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DiffKind {
    /// Two or more clusters collapsed into one fresh cluster.
    Merge,
    /// A spike subset carved out of its clusters into fresh clusters.
    #[default]
    Split,
    /// Spikes moved into an explicit target cluster.
    Assign,
    /// Per-cluster metadata changed; the partition itself is untouched.
    Metadata,
}

/// Whether a record was emitted by a forward action or by history replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HistoryDirection {
    Undo,
    Redo,
}

/// Immutable description of one mutation's effect.
///
/// Fixed shape: all fields exist on every record, optionality is explicit
/// (empty sets / `None`), nothing is attached ad hoc. Partition slices hold
/// only the clusters touched by the mutation; member vectors are shared via
/// `Arc` with the live index, so an untouched cluster costs one pointer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiffRecord {
    /// What kind of mutation this describes.
    pub kind: DiffKind,

    /// `None` for a forward action, otherwise the replay direction.
    pub history: Option<HistoryDirection>,

    /// All spikes whose cluster label changed, ascending.
    pub affected_spikes: Vec<SpikeId>,

    /// Clusters that exist after the mutation but not before.
    pub added: BTreeSet<ClusterId>,

    /// Clusters that exist before the mutation but not after.
    pub deleted: BTreeSet<ClusterId>,

    /// Lineage edges `(old, new)`: old side is deleted, new side is added.
    pub descendants: Vec<(ClusterId, ClusterId)>,

    /// Id-allocator value before the mutation; revert restores it.
    pub next_id_before: ClusterId,

    /// Id-allocator value after the mutation; reapply restores it.
    pub next_id_after: ClusterId,

    /// Clusters whose metadata value changed.
    pub metadata_changed: BTreeSet<ClusterId>,

    /// The metadata value that was requested, for Metadata records.
    pub metadata_value: Option<String>,

    /// Per-cluster metadata values before the mutation.
    pub metadata_old: BTreeMap<ClusterId, String>,

    /// Per-cluster metadata values after the mutation.
    pub metadata_new: BTreeMap<ClusterId, String>,

    /// Members of every touched cluster before the mutation.
    pub old_spikes_per_cluster: BTreeMap<ClusterId, Arc<Vec<SpikeId>>>,

    /// Members of every touched cluster after the mutation.
    pub new_spikes_per_cluster: BTreeMap<ClusterId, Arc<Vec<SpikeId>>>,
}

impl DiffRecord {
    /// A record that describes no change at all (e.g. an empty split).
    pub fn empty(kind: DiffKind) -> Self {
        Self {
            kind,
            ..Default::default()
        }
    }

    /// Whether the record describes no change.
    pub fn is_empty(&self) -> bool {
        self.affected_spikes.is_empty()
            && self.added.is_empty()
            && self.deleted.is_empty()
            && self.metadata_changed.is_empty()
    }

    /// Whether the record touches the partition (as opposed to metadata only).
    pub fn touches_partition(&self) -> bool {
        !self.affected_spikes.is_empty() || !self.added.is_empty() || !self.deleted.is_empty()
    }

    /// Structural invariants: `added` and `deleted` are disjoint, and every
    /// descendant edge goes from a deleted cluster to an added one.
    pub fn is_consistent(&self) -> bool {
        if self.added.intersection(&self.deleted).next().is_some() {
            return false;
        }
        self.descendants
            .iter()
            .all(|(old, new)| self.deleted.contains(old) && self.added.contains(new))
    }

    /// The exact inverse record: applying it undoes this mutation.
    ///
    /// Added and deleted swap, descendant edges flip, the partition slices
    /// and metadata maps swap sides. `history` is set to [`HistoryDirection::Undo`].
    pub fn inverted(&self) -> DiffRecord {
        DiffRecord {
            kind: self.kind,
            history: Some(HistoryDirection::Undo),
            affected_spikes: self.affected_spikes.clone(),
            added: self.deleted.clone(),
            deleted: self.added.clone(),
            descendants: self.descendants.iter().map(|&(old, new)| (new, old)).collect(),
            next_id_before: self.next_id_after,
            next_id_after: self.next_id_before,
            metadata_changed: self.metadata_changed.clone(),
            metadata_value: None,
            metadata_old: self.metadata_new.clone(),
            metadata_new: self.metadata_old.clone(),
            old_spikes_per_cluster: self.new_spikes_per_cluster.clone(),
            new_spikes_per_cluster: self.old_spikes_per_cluster.clone(),
        }
    }

    /// A copy of this record tagged as a redo replay.
    pub fn as_redo(&self) -> DiffRecord {
        let mut record = self.clone();
        record.history = Some(HistoryDirection::Redo);
        record
    }

    /// Clusters the tiered store must (re)generate after this mutation:
    /// everything added plus every surviving cluster whose membership or
    /// metadata changed.
    pub fn clusters_to_refresh(&self) -> BTreeSet<ClusterId> {
        let mut out: BTreeSet<ClusterId> = self.added.clone();
        out.extend(self.metadata_changed.iter().copied());
        out.extend(self.new_spikes_per_cluster.keys().copied());
        out
    }
}

/// Merge the diff records produced by the independent mutable aspects of one
/// user action (partition + metadata) into a single history entry.
///
/// The first record is the base; a second record contributes its metadata
/// fields. More than two aspects per action do not exist in this crate.
pub fn combine_diffs(mut parts: Vec<DiffRecord>) -> DiffRecord {
    match parts.len() {
        0 => DiffRecord::default(),
        1 => parts.remove(0),
        _ => {
            let mut base = parts.remove(0);
            let extra = parts.remove(0);
            base.metadata_changed.extend(extra.metadata_changed);
            base.metadata_value = extra.metadata_value.or(base.metadata_value);
            base.metadata_old.extend(extra.metadata_old);
            base.metadata_new.extend(extra.metadata_new);
            base
        }
    }
}
