//! Integration tests for the tiered cluster store and the feature/mask item.

use std::collections::BTreeSet;
use std::fs;
use std::sync::Arc;

use tempfile::TempDir;

use cluster_tier::cluster::diff::ClusterId;
use cluster_tier::config::FeatureMasksConfig;
use cluster_tier::store::feature_masks::{
    FeatureMasks, FEATURES, MAIN_CHANNELS, MASKS, MEAN_MASKS, MEAN_PROBE_POSITION,
    N_UNMASKED_CHANNELS, SUM_MASKS,
};
use cluster_tier::{Clustering, ClusterStore, DiskStore, FlatModel, SpikeModel};

const N_CHANNELS: usize = 2;
const N_FEATURES: usize = 2;

/// Deterministic synthetic dataset: feature[s][c][f] = s*100 + c*10 + f,
/// mask[s][c] in {0.25, 0.5, 0.75, 1.0}.
fn model(labels: Vec<ClusterId>) -> Arc<FlatModel> {
    let n = labels.len();
    let mut features = Vec::with_capacity(n * N_CHANNELS * N_FEATURES);
    let mut masks = Vec::with_capacity(n * N_CHANNELS);
    for s in 0..n {
        for c in 0..N_CHANNELS {
            for f in 0..N_FEATURES {
                features.push((s * 100 + c * 10 + f) as f32);
            }
        }
        for c in 0..N_CHANNELS {
            masks.push(0.25 * ((s + c) % 4 + 1) as f32);
        }
    }
    Arc::new(FlatModel::new(
        "store test",
        labels,
        features,
        masks,
        vec![[0.0, 0.0], [10.0, 20.0]],
        N_FEATURES,
    ))
}

fn open_store(tmp: &TempDir, model: &Arc<FlatModel>) -> ClusterStore {
    let disk = DiskStore::open(tmp.path(), model.name()).unwrap();
    let mut store = ClusterStore::new(
        Arc::clone(model) as Arc<dyn SpikeModel>,
        disk,
    );
    store.register_item(Box::new(FeatureMasks::new(&FeatureMasksConfig::default())));
    store
}

fn read_all_cluster_bytes(store: &ClusterStore, cluster: ClusterId) -> (Vec<u8>, Vec<u8>) {
    let features = fs::read(store.disk().bin_path(cluster, FEATURES)).unwrap();
    let masks = fs::read(store.disk().bin_path(cluster, MASKS)).unwrap();
    (features, masks)
}

#[test]
fn test_generate_round_trips_source_arrays() {
    let model = model(vec![1, 2, 1, 2, 1, 3]);
    let clustering = Clustering::new(model.spike_clusters().to_vec());
    let tmp = TempDir::new().unwrap();
    let mut store = open_store(&tmp, &model);
    store.generate(clustering.spikes_per_cluster()).unwrap();

    // Concatenating the per-cluster rows back by ascending spike id must
    // reproduce the source arrays exactly.
    let mut features = vec![0.0f32; model.n_spikes() * N_CHANNELS * N_FEATURES];
    let mut masks = vec![0.0f32; model.n_spikes() * N_CHANNELS];
    for (&cluster, members) in clustering.spikes_per_cluster() {
        let f = store.disk().load(cluster, FEATURES).unwrap().unwrap();
        let m = store.disk().load(cluster, MASKS).unwrap().unwrap();
        assert_eq!(f.shape, vec![members.len(), N_CHANNELS, N_FEATURES]);
        assert_eq!(m.shape, vec![members.len(), N_CHANNELS]);
        for (row, &spike) in members.iter().enumerate() {
            let fr = f.row(row);
            let mr = m.row(row);
            features[spike * fr.len()..(spike + 1) * fr.len()].copy_from_slice(fr);
            masks[spike * mr.len()..(spike + 1) * mr.len()].copy_from_slice(mr);
        }
    }
    for s in 0..model.n_spikes() {
        assert_eq!(&features[s * 4..(s + 1) * 4], model.features(s));
        assert_eq!(&masks[s * 2..(s + 1) * 2], model.masks(s));
    }
}

#[test]
fn test_aggregates_hand_computed() {
    // Cluster 1 holds spikes {0, 2}: mask rows [0.25, 0.5] and [0.75, 1.0].
    let model = model(vec![1, 2, 1, 2]);
    let clustering = Clustering::new(model.spike_clusters().to_vec());
    let tmp = TempDir::new().unwrap();
    let mut store = open_store(&tmp, &model);
    store.generate(clustering.spikes_per_cluster()).unwrap();

    let memory = store.memory();
    let sum = memory.load(1, SUM_MASKS).unwrap().as_vector().unwrap();
    assert_eq!(sum, &[1.0, 1.5]);
    let mean = memory.load(1, MEAN_MASKS).unwrap().as_vector().unwrap();
    assert_eq!(mean, &[0.5, 0.75]);
    assert_eq!(
        memory.load(1, N_UNMASKED_CHANNELS).unwrap().as_count(),
        Some(2)
    );
    // Channel 1 has the larger mean mask.
    assert_eq!(
        memory.load(1, MAIN_CHANNELS).unwrap().as_channels(),
        Some([1, 0].as_slice())
    );
    // positions [[0,0],[10,20]] weighted by mean, averaged over channels.
    let pos = memory.load(1, MEAN_PROBE_POSITION).unwrap().as_vector().unwrap();
    assert_eq!(pos, &[10.0 * 0.75 / 2.0, 20.0 * 0.75 / 2.0]);
}

#[test]
fn test_generate_is_resumable() {
    let model = model(vec![1, 2, 1, 2, 1, 2]);
    let clustering = Clustering::new(model.spike_clusters().to_vec());
    let tmp = TempDir::new().unwrap();
    let mut store = open_store(&tmp, &model);
    store.generate(clustering.spikes_per_cluster()).unwrap();

    // Plant a sentinel inside an intact entry: a second generate must probe,
    // trust the shape and skip the rewrite.
    let bin = store.disk().bin_path(1, MASKS);
    let mut bytes = fs::read(&bin).unwrap();
    bytes[0..4].copy_from_slice(&42.0f32.to_le_bytes());
    fs::write(&bin, &bytes).unwrap();

    store.generate(clustering.spikes_per_cluster()).unwrap();
    assert_eq!(fs::read(&bin).unwrap(), bytes);
}

#[test]
fn test_truncated_entry_is_repaired() {
    let model = model(vec![1, 2, 1, 2, 1, 2]);
    let clustering = Clustering::new(model.spike_clusters().to_vec());
    let tmp = TempDir::new().unwrap();
    let mut store = open_store(&tmp, &model);
    store.generate(clustering.spikes_per_cluster()).unwrap();

    // Simulate a crash mid-write: the data file is shorter than its sidecar
    // says. The next generate must detect the mismatch and rebuild.
    let bin = store.disk().bin_path(2, MASKS);
    let good = fs::read(&bin).unwrap();
    fs::write(&bin, &good[..good.len() / 2]).unwrap();

    store.generate(clustering.spikes_per_cluster()).unwrap();
    assert_eq!(fs::read(&bin).unwrap(), good);
}

#[test]
fn test_update_touches_only_diffed_clusters() {
    let model = model(vec![1, 2, 1, 2, 1, 3, 3, 3]);
    let mut clustering = Clustering::new(model.spike_clusters().to_vec());
    let tmp = TempDir::new().unwrap();
    let mut store = open_store(&tmp, &model);
    store.generate(clustering.spikes_per_cluster()).unwrap();

    let untouched_before = read_all_cluster_bytes(&store, 3);

    let diff = clustering.merge(&[1, 2]).unwrap();
    store.update(&diff, clustering.spikes_per_cluster()).unwrap();

    // The bystander cluster is byte-for-byte identical.
    assert_eq!(read_all_cluster_bytes(&store, 3), untouched_before);

    // The merged cluster exists with the right shape and aggregates.
    let features = store.disk().load(4, FEATURES).unwrap().unwrap();
    assert_eq!(features.shape, vec![5, N_CHANNELS, N_FEATURES]);
    assert!(store.memory().load(4, MEAN_MASKS).is_some());

    // Deleted clusters lost their memory tier but keep orphaned disk files.
    assert!(store.memory().load(1, MEAN_MASKS).is_none());
    assert!(store.disk().bin_path(1, MASKS).exists());
}

#[test]
fn test_update_after_undo_reuses_intact_entries() {
    let model = model(vec![1, 2, 1, 2, 1, 2]);
    let mut clustering = Clustering::new(model.spike_clusters().to_vec());
    let tmp = TempDir::new().unwrap();
    let mut store = open_store(&tmp, &model);
    store.generate(clustering.spikes_per_cluster()).unwrap();

    let before = read_all_cluster_bytes(&store, 1);

    let diff = clustering.merge(&[1, 2]).unwrap();
    store.update(&diff, clustering.spikes_per_cluster()).unwrap();

    let inverse = clustering.revert(&diff);
    store.update(&inverse, clustering.spikes_per_cluster()).unwrap();

    // Ids are never reused, so the restored cluster's old entry is still
    // valid and the update must have left it untouched.
    assert_eq!(read_all_cluster_bytes(&store, 1), before);
    // Its aggregates are back in the memory tier.
    assert!(store.memory().load(1, MEAN_MASKS).is_some());
    assert!(store.memory().load(3, MEAN_MASKS).is_none());
}

#[test]
fn test_fresh_ids_never_read_orphan_entries() {
    // {1: [0, 1], 2: [2, 3]}: draining cluster 2 orphans its disk entries.
    // The next split must mint ids with no entry to collide with, so no new
    // cluster can inherit the dead cluster's bytes on a shape coincidence.
    let model = model(vec![1, 1, 2, 2]);
    let mut clustering = Clustering::new(model.spike_clusters().to_vec());
    let tmp = TempDir::new().unwrap();
    let mut store = open_store(&tmp, &model);
    store.generate(clustering.spikes_per_cluster()).unwrap();

    let diff = clustering.assign(&[2, 3], 1).unwrap();
    store.update(&diff, clustering.spikes_per_cluster()).unwrap();

    let diff = clustering.split(&[0, 1]).unwrap();
    assert!(diff.added.iter().all(|&id| id > 2));
    store.update(&diff, clustering.spikes_per_cluster()).unwrap();

    // Every live cluster serves its own spikes' rows, never the orphan's.
    for (&cluster, members) in clustering.spikes_per_cluster() {
        let m = store.disk().load(cluster, MASKS).unwrap().unwrap();
        for (row, &spike) in members.iter().enumerate() {
            assert_eq!(m.row(row), model.masks(spike));
        }
    }
}

#[test]
fn test_assign_refreshes_surviving_donor() {
    let model = model(vec![1, 2, 1, 2, 1, 2]);
    let mut clustering = Clustering::new(model.spike_clusters().to_vec());
    let tmp = TempDir::new().unwrap();
    let mut store = open_store(&tmp, &model);
    store.generate(clustering.spikes_per_cluster()).unwrap();

    // Move one spike of cluster 2 into cluster 1: both keep their ids but
    // both must be regenerated.
    let diff = clustering.assign(&[1], 1).unwrap();
    store.update(&diff, clustering.spikes_per_cluster()).unwrap();

    let masks1 = store.disk().load(1, MASKS).unwrap().unwrap();
    assert_eq!(masks1.shape, vec![4, N_CHANNELS]);
    let masks2 = store.disk().load(2, MASKS).unwrap().unwrap();
    assert_eq!(masks2.shape, vec![2, N_CHANNELS]);

    // Round-trip still holds for the reshaped clusters.
    for (&cluster, members) in clustering.spikes_per_cluster() {
        let m = store.disk().load(cluster, MASKS).unwrap().unwrap();
        for (row, &spike) in members.iter().enumerate() {
            assert_eq!(m.row(row), model.masks(spike));
        }
    }
}

#[test]
fn test_progress_callback_batches() {
    use std::cell::RefCell;
    use std::rc::Rc;

    // 250 spikes in one cluster: distribution reports at 100, 200, 250.
    let model = model(vec![1; 250]);
    let clustering = Clustering::new(model.spike_clusters().to_vec());
    let tmp = TempDir::new().unwrap();
    let mut store = open_store(&tmp, &model);

    let calls: Rc<RefCell<Vec<(usize, usize)>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&calls);
    store.set_progress(move |done, total| sink.borrow_mut().push((done, total)));

    store.generate(clustering.spikes_per_cluster()).unwrap();

    let calls = calls.borrow();
    assert!(calls.contains(&(100, 250)));
    assert!(calls.contains(&(200, 250)));
    assert!(calls.contains(&(250, 250)));
    // One aggregation report for the single cluster.
    assert!(calls.contains(&(1, 1)));
}

#[test]
fn test_orphan_sweep_candidates_are_not_live() {
    let model = model(vec![1, 2, 1, 2]);
    let mut clustering = Clustering::new(model.spike_clusters().to_vec());
    let tmp = TempDir::new().unwrap();
    let mut store = open_store(&tmp, &model);
    store.generate(clustering.spikes_per_cluster()).unwrap();

    let diff = clustering.merge(&[1, 2]).unwrap();
    store.update(&diff, clustering.spikes_per_cluster()).unwrap();

    // Orphans 1 and 2 remain on disk but are no longer in the live set.
    let live: BTreeSet<ClusterId> = clustering.cluster_ids().into_iter().collect();
    for orphan in [1u64, 2] {
        assert!(!live.contains(&orphan));
        assert!(store.disk().bin_path(orphan, FEATURES).exists());
    }
}
