//! The source data model interface.
//!
//! The engine never owns raw recording data; it reads it through
//! [`SpikeModel`], which exposes the fixed spike population, the initial
//! assignment, per-spike feature/mask rows and the probe geometry.
//! [`FlatModel`] is the in-memory implementation backed by flat arrays,
//! used by the tests, the bench and the demo program.

use crate::cluster::diff::{ClusterId, SpikeId};

/// Read-only view of a dataset. All row accessors return borrowed slices;
/// implementations are expected to keep the arrays resident or memory-mapped.
pub trait SpikeModel {
    /// Dataset name; used (sanitized) as the on-disk store directory.
    fn name(&self) -> &str;

    /// Size of the fixed spike population.
    fn n_spikes(&self) -> usize;

    /// Number of probe channels.
    fn n_channels(&self) -> usize;

    /// Feature components per channel.
    fn n_features_per_channel(&self) -> usize;

    /// Initial spike → cluster assignment, one label per spike.
    fn spike_clusters(&self) -> &[ClusterId];

    /// Feature row for one spike: `n_channels * n_features_per_channel` values.
    fn features(&self, spike: SpikeId) -> &[f32];

    /// Mask row for one spike: `n_channels` values in `[0, 1]`.
    fn masks(&self, spike: SpikeId) -> &[f32];

    /// `(x, y)` position of each channel on the probe.
    fn channel_positions(&self) -> &[[f32; 2]];
}

/// A dataset held entirely in memory as flat row-major arrays.
pub struct FlatModel {
    name: String,
    n_channels: usize,
    n_features_per_channel: usize,
    spike_clusters: Vec<ClusterId>,
    /// `n_spikes * n_channels * n_features_per_channel`, row-major.
    features: Vec<f32>,
    /// `n_spikes * n_channels`, row-major.
    masks: Vec<f32>,
    channel_positions: Vec<[f32; 2]>,
}

impl FlatModel {
    pub fn new(
        name: impl Into<String>,
        spike_clusters: Vec<ClusterId>,
        features: Vec<f32>,
        masks: Vec<f32>,
        channel_positions: Vec<[f32; 2]>,
        n_features_per_channel: usize,
    ) -> Self {
        let n_spikes = spike_clusters.len();
        let n_channels = channel_positions.len();
        assert_eq!(features.len(), n_spikes * n_channels * n_features_per_channel);
        assert_eq!(masks.len(), n_spikes * n_channels);
        Self {
            name: name.into(),
            n_channels,
            n_features_per_channel,
            spike_clusters,
            features,
            masks,
            channel_positions,
        }
    }

    fn feature_row(&self) -> usize {
        self.n_channels * self.n_features_per_channel
    }
}

impl SpikeModel for FlatModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn n_spikes(&self) -> usize {
        self.spike_clusters.len()
    }

    fn n_channels(&self) -> usize {
        self.n_channels
    }

    fn n_features_per_channel(&self) -> usize {
        self.n_features_per_channel
    }

    fn spike_clusters(&self) -> &[ClusterId] {
        &self.spike_clusters
    }

    fn features(&self, spike: SpikeId) -> &[f32] {
        let row = self.feature_row();
        &self.features[spike * row..(spike + 1) * row]
    }

    fn masks(&self, spike: SpikeId) -> &[f32] {
        &self.masks[spike * self.n_channels..(spike + 1) * self.n_channels]
    }

    fn channel_positions(&self) -> &[[f32; 2]] {
        &self.channel_positions
    }
}
