//! Demo: open a synthetic dataset, mutate it, and walk the history.
//!
//! Run with `cargo run --example demo_session`.

use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use cluster_tier::{Config, FlatModel, Session, SpikeModel};

fn synthetic_model(n_spikes: usize, n_clusters: u64, n_channels: usize) -> Arc<FlatModel> {
    let labels: Vec<u64> = (0..n_spikes as u64).map(|i| i % n_clusters).collect();
    let mut features = Vec::with_capacity(n_spikes * n_channels);
    let mut masks = Vec::with_capacity(n_spikes * n_channels);
    for s in 0..n_spikes {
        for c in 0..n_channels {
            features.push((s * n_channels + c) as f32 * 0.01);
            masks.push(0.05 + ((s + c) % 10) as f32 / 10.0);
        }
    }
    let positions: Vec<[f32; 2]> = (0..n_channels)
        .map(|c| [(c % 2) as f32 * 20.0, (c / 2) as f32 * 25.0])
        .collect();
    Arc::new(FlatModel::new(
        "demo dataset",
        labels,
        features,
        masks,
        positions,
        1,
    ))
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "cluster_tier=debug".into()),
        )
        .init();

    let mut config = Config::default();
    config.store.root = std::env::temp_dir().join("cluster-tier-demo");

    let model = synthetic_model(50_000, 40, 8);
    let mut session = Session::open(model as Arc<dyn SpikeModel>, &config)?;
    session.set_progress(|done, total| {
        if done == total {
            info!(done, total, "store pass finished");
        }
    });
    session.subscribe(|record| {
        info!(
            kind = ?record.kind,
            history = ?record.history,
            added = ?record.added,
            deleted = ?record.deleted,
            "clustering changed"
        );
    });

    let merged = session.merge(&[0, 1, 2])?;
    info!(new = ?merged.added, "merged three clusters");
    session.move_clusters(&merged.added.iter().copied().collect::<Vec<_>>(), "good")?;

    session.split(&(0..1_000).collect::<Vec<_>>())?;

    session.undo()?;
    session.undo()?;
    session.redo()?;

    info!(
        n_clusters = session.clustering().cluster_ids().len(),
        history = session.history().position(),
        "demo finished"
    );
    Ok(())
}
