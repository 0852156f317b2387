//! The partition engine: spike → cluster assignment and its mutations.
//!
//! [`Clustering`] owns the only mutable copy of the assignment plus the
//! derived cluster → spikes index. Mutations (merge, split, assign) rebuild
//! the index only for the clusters they touch; every untouched cluster keeps
//! its `Arc`-shared member vector, so the cost of a mutation is proportional
//! to the number of spikes it moves, not to the population size.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::cluster::diff::{ClusterId, DiffKind, DiffRecord, SpikeId};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PartitionError {
    #[error("spike {0} is outside the population")]
    InvalidSpike(SpikeId),

    #[error("cluster {0} does not exist")]
    InvalidCluster(ClusterId),

    #[error("merge needs at least 2 distinct clusters, got {0}")]
    InsufficientClusters(usize),
}

/// The live partition of the spike population into clusters.
pub struct Clustering {
    /// Cluster label per spike, indexed by `SpikeId`.
    spike_clusters: Vec<ClusterId>,

    /// Inverse index: sorted members per cluster, shared by reference with
    /// history slices so untouched clusters are never copied.
    spikes_per_cluster: BTreeMap<ClusterId, Arc<Vec<SpikeId>>>,

    /// Id allocator. Strictly above every id ever used, so deleting a
    /// cluster never frees its id for reuse. Forward mutations only move it
    /// up; revert/reapply restore the value snapshotted in the diff record.
    next_id: ClusterId,
}

/// Group a set of spikes by label: stable sort by `(label, spike)`, then cut
/// at label boundaries. Each run comes out sorted by spike id.
fn partition_by_label(
    mut spikes: Vec<SpikeId>,
    labels: &[ClusterId],
) -> BTreeMap<ClusterId, Arc<Vec<SpikeId>>> {
    spikes.sort_unstable_by_key(|&s| (labels[s], s));

    let mut out = BTreeMap::new();
    let mut start = 0;
    for i in 1..=spikes.len() {
        if i == spikes.len() || labels[spikes[i]] != labels[spikes[start]] {
            let cluster = labels[spikes[start]];
            out.insert(cluster, Arc::new(spikes[start..i].to_vec()));
            start = i;
        }
    }
    out
}

/// Intersection and difference of two sorted spike lists in one pass.
fn split_members(members: &[SpikeId], selected: &[SpikeId]) -> (Vec<SpikeId>, Vec<SpikeId>) {
    let mut inside = Vec::new();
    let mut outside = Vec::new();
    let mut sel = selected.iter().peekable();
    for &spike in members {
        while sel.peek().is_some_and(|&&s| s < spike) {
            sel.next();
        }
        if sel.peek() == Some(&&spike) {
            inside.push(spike);
        } else {
            outside.push(spike);
        }
    }
    (inside, outside)
}

impl Clustering {
    /// Build the engine from an initial assignment (one label per spike).
    pub fn new(spike_clusters: Vec<ClusterId>) -> Self {
        let all: Vec<SpikeId> = (0..spike_clusters.len()).collect();
        let spikes_per_cluster = partition_by_label(all, &spike_clusters);
        let next_id = spike_clusters.iter().max().map_or(0, |&id| id + 1);
        Self {
            spike_clusters,
            spikes_per_cluster,
            next_id,
        }
    }

    /// Number of spikes in the population.
    pub fn n_spikes(&self) -> usize {
        self.spike_clusters.len()
    }

    /// Currently existing cluster ids, ascending.
    pub fn cluster_ids(&self) -> Vec<ClusterId> {
        self.spikes_per_cluster.keys().copied().collect()
    }

    /// The live assignment array.
    pub fn spike_clusters(&self) -> &[ClusterId] {
        &self.spike_clusters
    }

    /// The live cluster → sorted members index.
    pub fn spikes_per_cluster(&self) -> &BTreeMap<ClusterId, Arc<Vec<SpikeId>>> {
        &self.spikes_per_cluster
    }

    /// The next id to mint: strictly above every id ever used, even after
    /// deletions. Undoing a mutation rolls the allocator back with it.
    pub fn next_cluster_id(&self) -> ClusterId {
        self.next_id
    }

    fn check_spikes(&self, spikes: &[SpikeId]) -> Result<(), PartitionError> {
        match spikes.iter().find(|&&s| s >= self.spike_clusters.len()) {
            Some(&s) => Err(PartitionError::InvalidSpike(s)),
            None => Ok(()),
        }
    }

    /// Merge two or more clusters into one freshly minted cluster.
    pub fn merge(&mut self, clusters: &[ClusterId]) -> Result<DiffRecord, PartitionError> {
        let inputs: BTreeSet<ClusterId> = clusters.iter().copied().collect();
        if inputs.len() < 2 {
            return Err(PartitionError::InsufficientClusters(inputs.len()));
        }
        for &cluster in &inputs {
            if !self.spikes_per_cluster.contains_key(&cluster) {
                return Err(PartitionError::InvalidCluster(cluster));
            }
        }

        let new_id = self.next_id;

        // Concatenate the members of all inputs, sorted by spike id.
        let mut old_slice = BTreeMap::new();
        let mut merged: Vec<SpikeId> = Vec::new();
        for &cluster in &inputs {
            let members = Arc::clone(&self.spikes_per_cluster[&cluster]);
            merged.extend(members.iter().copied());
            old_slice.insert(cluster, members);
        }
        merged.sort_unstable();

        let merged = Arc::new(merged);
        for &spike in merged.iter() {
            self.spike_clusters[spike] = new_id;
        }
        for &cluster in &inputs {
            self.spikes_per_cluster.remove(&cluster);
        }
        self.spikes_per_cluster.insert(new_id, Arc::clone(&merged));
        self.next_id = new_id + 1;

        debug!(new_id, inputs = ?inputs, n_spikes = merged.len(), "merged clusters");

        Ok(DiffRecord {
            kind: DiffKind::Merge,
            affected_spikes: merged.to_vec(),
            added: BTreeSet::from([new_id]),
            deleted: inputs.clone(),
            descendants: inputs.iter().map(|&old| (old, new_id)).collect(),
            next_id_before: new_id,
            next_id_after: new_id + 1,
            old_spikes_per_cluster: old_slice,
            new_spikes_per_cluster: BTreeMap::from([(new_id, merged)]),
            ..Default::default()
        })
    }

    /// Carve an arbitrary spike subset out of its clusters.
    ///
    /// Every touched cluster is deleted. A cluster whose members are all
    /// selected is relabeled to one fresh id; a partially selected cluster is
    /// divided into two fresh ids, the selected part first, the remainder
    /// second. Both parts descend from the original.
    pub fn split(&mut self, spikes: &[SpikeId]) -> Result<DiffRecord, PartitionError> {
        self.check_spikes(spikes)?;
        if spikes.is_empty() {
            return Ok(DiffRecord::empty(DiffKind::Split));
        }

        let mut selected: Vec<SpikeId> = spikes.to_vec();
        selected.sort_unstable();
        selected.dedup();

        let touched: BTreeSet<ClusterId> =
            selected.iter().map(|&s| self.spike_clusters[s]).collect();

        let first_id = self.next_id;
        let mut next_id = self.next_id;
        let mut old_slice = BTreeMap::new();
        let mut new_slice: BTreeMap<ClusterId, Arc<Vec<SpikeId>>> = BTreeMap::new();
        let mut descendants = Vec::new();
        let mut affected: Vec<SpikeId> = Vec::new();

        for &cluster in &touched {
            let members = Arc::clone(&self.spikes_per_cluster[&cluster]);
            let (inside, outside) = split_members(&members, &selected);
            affected.extend(members.iter().copied());
            old_slice.insert(cluster, members);

            if outside.is_empty() {
                // Fully selected: plain relabel, one descendant.
                new_slice.insert(next_id, Arc::new(inside));
                descendants.push((cluster, next_id));
                next_id += 1;
            } else {
                new_slice.insert(next_id, Arc::new(inside));
                descendants.push((cluster, next_id));
                next_id += 1;
                new_slice.insert(next_id, Arc::new(outside));
                descendants.push((cluster, next_id));
                next_id += 1;
            }
        }

        // Apply: relabel, drop the originals, install the fresh clusters.
        for (&new_id, members) in &new_slice {
            for &spike in members.iter() {
                self.spike_clusters[spike] = new_id;
            }
        }
        for &cluster in &touched {
            self.spikes_per_cluster.remove(&cluster);
        }
        for (&new_id, members) in &new_slice {
            self.spikes_per_cluster.insert(new_id, Arc::clone(members));
        }
        self.next_id = next_id;

        affected.sort_unstable();

        debug!(
            touched = ?touched,
            added = new_slice.len(),
            n_selected = selected.len(),
            "split clusters"
        );

        Ok(DiffRecord {
            kind: DiffKind::Split,
            affected_spikes: affected,
            added: new_slice.keys().copied().collect(),
            deleted: touched,
            descendants,
            next_id_before: first_id,
            next_id_after: next_id,
            old_spikes_per_cluster: old_slice,
            new_spikes_per_cluster: new_slice,
            ..Default::default()
        })
    }

    /// Move the given spikes into `target`, creating it if absent.
    ///
    /// Donor clusters drained of all their members are deleted (and become
    /// ancestors of a freshly created target). Donors that keep members stay
    /// under their id; both partition slices list them so consumers see the
    /// membership change.
    pub fn assign(
        &mut self,
        spikes: &[SpikeId],
        target: ClusterId,
    ) -> Result<DiffRecord, PartitionError> {
        self.check_spikes(spikes)?;

        let mut selected: Vec<SpikeId> = spikes.to_vec();
        selected.sort_unstable();
        selected.dedup();
        // Spikes already in the target are not moves.
        selected.retain(|&s| self.spike_clusters[s] != target);
        if selected.is_empty() {
            return Ok(DiffRecord::empty(DiffKind::Assign));
        }

        let donors: BTreeSet<ClusterId> =
            selected.iter().map(|&s| self.spike_clusters[s]).collect();
        let target_is_new = !self.spikes_per_cluster.contains_key(&target);

        let mut old_slice = BTreeMap::new();
        let mut new_slice: BTreeMap<ClusterId, Arc<Vec<SpikeId>>> = BTreeMap::new();
        let mut deleted = BTreeSet::new();

        for &cluster in &donors {
            let members = Arc::clone(&self.spikes_per_cluster[&cluster]);
            let (_, remainder) = split_members(&members, &selected);
            old_slice.insert(cluster, members);
            if remainder.is_empty() {
                deleted.insert(cluster);
            } else {
                new_slice.insert(cluster, Arc::new(remainder));
            }
        }

        // New target membership: previous members (if any) plus the selection.
        let mut target_members: Vec<SpikeId> = match self.spikes_per_cluster.get(&target) {
            Some(members) => {
                old_slice.insert(target, Arc::clone(members));
                members.to_vec()
            }
            None => Vec::new(),
        };
        target_members.extend(selected.iter().copied());
        target_members.sort_unstable();
        new_slice.insert(target, Arc::new(target_members));

        // Apply.
        for &spike in &selected {
            self.spike_clusters[spike] = target;
        }
        for &cluster in &deleted {
            self.spikes_per_cluster.remove(&cluster);
        }
        for (&cluster, members) in &new_slice {
            self.spikes_per_cluster.insert(cluster, Arc::clone(members));
        }
        let next_id_before = self.next_id;
        if target_is_new {
            self.next_id = self.next_id.max(target + 1);
        }

        let added: BTreeSet<ClusterId> = if target_is_new {
            BTreeSet::from([target])
        } else {
            BTreeSet::new()
        };
        let descendants = if target_is_new {
            deleted.iter().map(|&old| (old, target)).collect()
        } else {
            Vec::new()
        };

        debug!(target, target_is_new, n_moved = selected.len(), "assigned spikes");

        Ok(DiffRecord {
            kind: DiffKind::Assign,
            affected_spikes: selected,
            added,
            deleted,
            descendants,
            next_id_before,
            next_id_after: self.next_id,
            old_spikes_per_cluster: old_slice,
            new_spikes_per_cluster: new_slice,
            ..Default::default()
        })
    }

    /// Apply the inverse of `record`, restoring the prior partition exactly,
    /// allocator included. Returns the inverse record for history replay
    /// consumers.
    pub fn revert(&mut self, record: &DiffRecord) -> DiffRecord {
        self.apply_slices(
            &record.new_spikes_per_cluster,
            &record.old_spikes_per_cluster,
        );
        self.next_id = record.next_id_before;
        record.inverted()
    }

    /// Re-apply a previously undone record. Returns a copy tagged as redo.
    pub fn reapply(&mut self, record: &DiffRecord) -> DiffRecord {
        self.apply_slices(
            &record.old_spikes_per_cluster,
            &record.new_spikes_per_cluster,
        );
        self.next_id = record.next_id_after;
        record.as_redo()
    }

    /// Replace the `from` side of a record's partition slice with its `to`
    /// side: relabel the spikes, drop clusters absent from `to`, install the
    /// `to` member vectors by reference.
    fn apply_slices(
        &mut self,
        from: &BTreeMap<ClusterId, Arc<Vec<SpikeId>>>,
        to: &BTreeMap<ClusterId, Arc<Vec<SpikeId>>>,
    ) {
        for &cluster in from.keys() {
            if !to.contains_key(&cluster) {
                self.spikes_per_cluster.remove(&cluster);
            }
        }
        for (&cluster, members) in to {
            for &spike in members.iter() {
                self.spike_clusters[spike] = cluster;
            }
            self.spikes_per_cluster.insert(cluster, Arc::clone(members));
        }
    }

    /// Debug check: every spike appears in exactly one cluster's member list,
    /// consistent with the assignment array, and every live id is below the
    /// allocator.
    #[doc(hidden)]
    pub fn check_invariants(&self) -> bool {
        let total: usize = self.spikes_per_cluster.values().map(|m| m.len()).sum();
        if total != self.spike_clusters.len() {
            return false;
        }
        if self.spikes_per_cluster.keys().any(|&id| id >= self.next_id) {
            return false;
        }
        self.spikes_per_cluster.iter().all(|(&cluster, members)| {
            members.windows(2).all(|w| w[0] < w[1])
                && members.iter().all(|&s| self.spike_clusters[s] == cluster)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::diff::HistoryDirection;

    /// {1: [0, 2, 4], 2: [1, 3]}
    fn two_clusters() -> Clustering {
        Clustering::new(vec![1, 2, 1, 2, 1])
    }

    #[test]
    fn test_initial_index() {
        let clustering = two_clusters();
        assert_eq!(clustering.cluster_ids(), vec![1, 2]);
        assert_eq!(
            clustering.spikes_per_cluster()[&1].as_slice(),
            &[0, 2, 4]
        );
        assert_eq!(clustering.spikes_per_cluster()[&2].as_slice(), &[1, 3]);
        assert!(clustering.check_invariants());
    }

    #[test]
    fn test_merge_concrete_scenario() {
        let mut clustering = two_clusters();
        let diff = clustering.merge(&[1, 2]).unwrap();

        assert_eq!(diff.added, BTreeSet::from([3]));
        assert_eq!(diff.deleted, BTreeSet::from([1, 2]));
        assert_eq!(diff.descendants, vec![(1, 3), (2, 3)]);
        assert_eq!(diff.affected_spikes, vec![0, 1, 2, 3, 4]);
        assert!(diff.is_consistent());

        assert_eq!(clustering.cluster_ids(), vec![3]);
        assert_eq!(
            clustering.spikes_per_cluster()[&3].as_slice(),
            &[0, 1, 2, 3, 4]
        );
        assert!(clustering.check_invariants());
    }

    #[test]
    fn test_merge_errors() {
        let mut clustering = two_clusters();
        assert_eq!(
            clustering.merge(&[1]),
            Err(PartitionError::InsufficientClusters(1))
        );
        // Duplicates collapse before the arity check.
        assert_eq!(
            clustering.merge(&[1, 1]),
            Err(PartitionError::InsufficientClusters(1))
        );
        assert_eq!(
            clustering.merge(&[1, 7]),
            Err(PartitionError::InvalidCluster(7))
        );
        // Failed calls left the partition untouched.
        assert_eq!(clustering.cluster_ids(), vec![1, 2]);
    }

    #[test]
    fn test_monotonic_ids_across_merges() {
        let mut clustering = Clustering::new(vec![0, 1, 2, 3]);
        let d1 = clustering.merge(&[0, 1]).unwrap();
        assert_eq!(d1.added, BTreeSet::from([4]));
        let d2 = clustering.merge(&[2, 3]).unwrap();
        assert_eq!(d2.added, BTreeSet::from([5]));
        let d3 = clustering.merge(&[4, 5]).unwrap();
        assert_eq!(d3.added, BTreeSet::from([6]));
    }

    #[test]
    fn test_split_concrete_scenario() {
        // {1: [0, 2], 2: [1, 3]}, split([0, 1]).
        let mut clustering = Clustering::new(vec![1, 2, 1, 2]);
        let diff = clustering.split(&[0, 1]).unwrap();

        assert_eq!(diff.deleted, BTreeSet::from([1, 2]));
        assert_eq!(diff.added.len(), 4);
        assert_eq!(diff.added, BTreeSet::from([3, 4, 5, 6]));
        // Each original has exactly two descendants.
        assert_eq!(diff.descendants, vec![(1, 3), (1, 4), (2, 5), (2, 6)]);
        assert!(diff.is_consistent());

        let spc = clustering.spikes_per_cluster();
        assert_eq!(spc[&3].as_slice(), &[0]);
        assert_eq!(spc[&4].as_slice(), &[2]);
        assert_eq!(spc[&5].as_slice(), &[1]);
        assert_eq!(spc[&6].as_slice(), &[3]);
        assert!(clustering.check_invariants());
    }

    #[test]
    fn test_split_full_cluster_relabels() {
        let mut clustering = two_clusters();
        // All of cluster 2 selected: single relabel, no remainder.
        let diff = clustering.split(&[1, 3]).unwrap();
        assert_eq!(diff.deleted, BTreeSet::from([2]));
        assert_eq!(diff.added, BTreeSet::from([3]));
        assert_eq!(diff.descendants, vec![(2, 3)]);
        assert_eq!(clustering.spikes_per_cluster()[&3].as_slice(), &[1, 3]);
        // Cluster 1 is untouched, still the same allocation.
        assert!(clustering.check_invariants());
    }

    #[test]
    fn test_split_empty_is_noop() {
        let mut clustering = two_clusters();
        let diff = clustering.split(&[]).unwrap();
        assert!(diff.is_empty());
        assert_eq!(clustering.cluster_ids(), vec![1, 2]);
    }

    #[test]
    fn test_split_invalid_spike() {
        let mut clustering = two_clusters();
        assert_eq!(
            clustering.split(&[0, 99]),
            Err(PartitionError::InvalidSpike(99))
        );
        assert_eq!(clustering.cluster_ids(), vec![1, 2]);
    }

    #[test]
    fn test_untouched_cluster_reused_by_reference() {
        let mut clustering = two_clusters();
        let before = Arc::clone(&clustering.spikes_per_cluster()[&2]);
        clustering.split(&[0]).unwrap();
        let after = &clustering.spikes_per_cluster()[&2];
        assert!(Arc::ptr_eq(&before, after));
    }

    #[test]
    fn test_assign_into_new_cluster() {
        let mut clustering = two_clusters();
        let diff = clustering.assign(&[1, 3], 10).unwrap();

        // Cluster 2 fully drained into a fresh target: lineage is recorded.
        assert_eq!(diff.added, BTreeSet::from([10]));
        assert_eq!(diff.deleted, BTreeSet::from([2]));
        assert_eq!(diff.descendants, vec![(2, 10)]);
        assert_eq!(clustering.spikes_per_cluster()[&10].as_slice(), &[1, 3]);
        assert!(clustering.check_invariants());
    }

    #[test]
    fn test_assign_into_existing_cluster() {
        let mut clustering = two_clusters();
        let diff = clustering.assign(&[1], 1).unwrap();

        // No cluster appears or disappears, but both touched clusters are in
        // the slices so the store refreshes them.
        assert!(diff.added.is_empty());
        assert!(diff.deleted.is_empty());
        assert_eq!(
            diff.new_spikes_per_cluster[&1].as_slice(),
            &[0, 1, 2, 4]
        );
        assert_eq!(diff.new_spikes_per_cluster[&2].as_slice(), &[3]);
        assert_eq!(diff.clusters_to_refresh(), BTreeSet::from([1, 2]));
        assert!(clustering.check_invariants());
    }

    #[test]
    fn test_ids_not_reused_after_forward_deletion() {
        // {1: [0, 1], 2: [2, 3]}: drain cluster 2 into 1.
        let mut clustering = Clustering::new(vec![1, 1, 2, 2]);
        let assign = clustering.assign(&[2, 3], 1).unwrap();
        assert_eq!(clustering.cluster_ids(), vec![1]);

        // The allocator does not fall back below the dead cluster's id: the
        // split mints ids never used before, not 2 again.
        assert_eq!(clustering.next_cluster_id(), 3);
        let diff = clustering.split(&[0, 1]).unwrap();
        assert_eq!(diff.added, BTreeSet::from([3, 4]));
        assert!(clustering.check_invariants());

        // Undo walks the allocator back through both snapshots.
        clustering.revert(&diff);
        assert_eq!(clustering.next_cluster_id(), 3);
        clustering.revert(&assign);
        assert_eq!(clustering.next_cluster_id(), 3);
        assert_eq!(clustering.cluster_ids(), vec![1, 2]);
    }

    #[test]
    fn test_assign_above_allocator_moves_it_past_target() {
        let mut clustering = two_clusters();
        clustering.assign(&[1, 3], 10).unwrap();
        assert_eq!(clustering.next_cluster_id(), 11);
        assert!(clustering.check_invariants());
    }

    #[test]
    fn test_assign_noop_when_already_in_target() {
        let mut clustering = two_clusters();
        let diff = clustering.assign(&[0, 2], 1).unwrap();
        assert!(diff.is_empty());
    }

    #[test]
    fn test_revert_restores_exact_partition_and_counter() {
        let mut clustering = two_clusters();
        let diff = clustering.merge(&[1, 2]).unwrap();

        let inverse = clustering.revert(&diff);
        assert_eq!(inverse.history, Some(HistoryDirection::Undo));
        assert_eq!(inverse.added, BTreeSet::from([1, 2]));
        assert_eq!(inverse.deleted, BTreeSet::from([3]));

        assert_eq!(clustering.cluster_ids(), vec![1, 2]);
        assert_eq!(clustering.spikes_per_cluster()[&1].as_slice(), &[0, 2, 4]);
        assert_eq!(clustering.spikes_per_cluster()[&2].as_slice(), &[1, 3]);
        // The counter rolled back: the next fresh id is 3 again.
        assert_eq!(clustering.next_cluster_id(), 3);
        assert!(clustering.check_invariants());
    }

    #[test]
    fn test_reapply_after_revert() {
        let mut clustering = two_clusters();
        let diff = clustering.merge(&[1, 2]).unwrap();
        clustering.revert(&diff);
        let redo = clustering.reapply(&diff);

        assert_eq!(redo.added, diff.added);
        assert_eq!(redo.deleted, diff.deleted);
        assert_eq!(redo.descendants, diff.descendants);
        assert_eq!(redo.history, Some(HistoryDirection::Redo));
        assert_eq!(clustering.cluster_ids(), vec![3]);
        assert!(clustering.check_invariants());
    }

    #[test]
    fn test_completeness_under_random_walk() {
        // A fixed pseudo-random walk of merges and splits; the partition must
        // stay complete and disjoint throughout.
        let n = 500;
        let mut clustering = Clustering::new((0..n as u64 % 7).cycle().take(n).collect());
        let mut seed = 0x2545_f491_4f6c_dd1du64;
        for _ in 0..50 {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let ids = clustering.cluster_ids();
            if seed % 2 == 0 && ids.len() >= 2 {
                let a = ids[(seed as usize / 2) % ids.len()];
                let b = ids[(seed as usize / 3) % ids.len()];
                if a != b {
                    clustering.merge(&[a, b]).unwrap();
                }
            } else {
                let start = (seed as usize) % n;
                let len = 1 + (seed as usize / 5) % 40;
                let spikes: Vec<SpikeId> = (start..(start + len).min(n)).collect();
                clustering.split(&spikes).unwrap();
            }
            assert!(clustering.check_invariants());
        }
    }
}
