//! Per-cluster metadata: one named string attribute with a default value.
//!
//! Used for the manual-sorting quality label ("unsorted", "good", "noise",
//! ...). Metadata mutations produce [`DiffRecord`]s like partition mutations
//! do, and values follow cluster lineage: a cluster created by a merge or
//! split inherits the value of its ancestor.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::cluster::diff::{ClusterId, DiffKind, DiffRecord};

pub struct ClusterMetadata {
    /// Attribute name, used as the diff description context.
    field: String,
    /// Value assumed for clusters with no explicit entry.
    default: String,
    values: BTreeMap<ClusterId, String>,
}

impl ClusterMetadata {
    pub fn new(field: impl Into<String>, default: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            default: default.into(),
            values: BTreeMap::new(),
        }
    }

    pub fn field(&self) -> &str {
        &self.field
    }

    /// Current value for a cluster, falling back to the default.
    pub fn get(&self, cluster: ClusterId) -> &str {
        self.values.get(&cluster).map_or(&self.default, String::as_str)
    }

    /// Set the value for the given clusters, returning the metadata diff.
    /// Clusters already holding the value are left out of the record.
    pub fn set(&mut self, clusters: &[ClusterId], value: &str) -> DiffRecord {
        let mut changed = BTreeSet::new();
        let mut old = BTreeMap::new();
        let mut new = BTreeMap::new();

        for &cluster in clusters {
            if self.get(cluster) == value {
                continue;
            }
            old.insert(cluster, self.get(cluster).to_string());
            new.insert(cluster, value.to_string());
            self.values.insert(cluster, value.to_string());
            changed.insert(cluster);
        }

        debug!(field = %self.field, value, n_changed = changed.len(), "set metadata");

        DiffRecord {
            kind: DiffKind::Metadata,
            metadata_changed: changed,
            metadata_value: Some(value.to_string()),
            metadata_old: old,
            metadata_new: new,
            ..Default::default()
        }
    }

    /// Propagate values along a partition diff: new clusters inherit the
    /// value of their lowest-id ancestor, deleted clusters' explicit values
    /// are pruned.
    ///
    /// Returns a metadata diff holding only the before/after values of the
    /// entries this touched, so the whole propagation inverts through
    /// [`ClusterMetadata::revert`] when the partition mutation is undone.
    pub fn on_partition(&mut self, record: &DiffRecord) -> DiffRecord {
        let mut old = BTreeMap::new();
        let mut new = BTreeMap::new();

        // descendants are emitted in ascending old-id order, so the first
        // edge seen for a new cluster is its lowest-id ancestor.
        let mut inherited: BTreeMap<ClusterId, String> = BTreeMap::new();
        for &(ancestor, descendant) in &record.descendants {
            inherited
                .entry(descendant)
                .or_insert_with(|| self.get(ancestor).to_string());
        }
        for (descendant, value) in inherited {
            if value != self.default {
                old.insert(descendant, self.default.clone());
                new.insert(descendant, value.clone());
                self.values.insert(descendant, value);
            }
        }
        for &cluster in &record.deleted {
            if let Some(value) = self.values.remove(&cluster) {
                old.insert(cluster, value);
                new.insert(cluster, self.default.clone());
            }
        }

        DiffRecord {
            kind: DiffKind::Metadata,
            metadata_old: old,
            metadata_new: new,
            ..Default::default()
        }
    }

    /// Restore the pre-mutation values recorded in a diff.
    pub fn revert(&mut self, record: &DiffRecord) {
        for (&cluster, value) in &record.metadata_old {
            if *value == self.default {
                self.values.remove(&cluster);
            } else {
                self.values.insert(cluster, value.clone());
            }
        }
    }

    /// Re-apply the post-mutation values recorded in a diff.
    pub fn reapply(&mut self, record: &DiffRecord) {
        for (&cluster, value) in &record.metadata_new {
            if *value == self.default {
                self.values.remove(&cluster);
            } else {
                self.values.insert(cluster, value.clone());
            }
        }
    }
}
