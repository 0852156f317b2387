//! The persistent tier: flat binary per-cluster arrays on disk.
//!
//! Layout: one root directory per dataset (sanitized name), one
//! sub-directory per cluster, one little-endian `f32` `.bin` file per field
//! plus a `.meta.json` sidecar recording shape and element type. The store
//! never deletes entries; clusters removed from the partition leave orphaned
//! directories behind for an offline sweep.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::cluster::diff::ClusterId;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("metadata error: {0}")]
    Meta(#[from] serde_json::Error),

    #[error("shape mismatch for cluster {cluster} field '{field}': expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        cluster: ClusterId,
        field: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },

    #[error("no entry for cluster {cluster} field '{field}'")]
    MissingEntry { cluster: ClusterId, field: String },
}

/// Sidecar metadata for one persistent entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArrayMeta {
    pub shape: Vec<usize>,
    pub dtype: String,
}

/// A loaded persistent entry: flat row-major `f32` data plus its shape.
#[derive(Debug, Clone, PartialEq)]
pub struct FlatArray {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl FlatArray {
    pub fn zeros(shape: Vec<usize>) -> Self {
        let len = shape.iter().product();
        Self {
            shape,
            data: vec![0.0; len],
        }
    }

    /// Number of rows (first axis).
    pub fn n_rows(&self) -> usize {
        self.shape.first().copied().unwrap_or(0)
    }

    /// Values per row (product of the remaining axes).
    pub fn row_len(&self) -> usize {
        self.shape.iter().skip(1).product()
    }

    pub fn row(&self, i: usize) -> &[f32] {
        let len = self.row_len();
        &self.data[i * len..(i + 1) * len]
    }
}

/// Outcome of probing a persistent entry against its expected shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeResult {
    /// No entry on disk.
    Missing,
    /// Entry exists but its shape (or file length) disagrees: regenerate.
    Mismatch,
    /// Entry exists with the right shape. `suspect` is set when the first
    /// and last rows are all zero, the heuristic signature of an
    /// interrupted write.
    Intact { suspect: bool },
}

/// Turn a dataset name into a safe directory name.
fn slugify(name: &str) -> String {
    let slug: String = name
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    let parts: Vec<&str> = slug.split('-').filter(|s| !s.is_empty()).collect();
    if parts.is_empty() {
        "dataset".to_string()
    } else {
        parts.join("-")
    }
}

/// The on-disk store for one dataset.
pub struct DiskStore {
    root: PathBuf,
}

impl DiskStore {
    /// Open (creating if needed) the store for `dataset` under `root`.
    pub fn open(root: &Path, dataset: &str) -> Result<Self, StoreError> {
        let path = root.join(slugify(dataset));
        fs::create_dir_all(&path)?;
        debug!(path = %path.display(), "opened disk store");
        Ok(Self { root: path })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn cluster_dir(&self, cluster: ClusterId) -> PathBuf {
        self.root.join(cluster.to_string())
    }

    /// Path of a field's binary file.
    pub fn bin_path(&self, cluster: ClusterId, field: &str) -> PathBuf {
        self.cluster_dir(cluster).join(format!("{field}.bin"))
    }

    fn meta_path(&self, cluster: ClusterId, field: &str) -> PathBuf {
        self.cluster_dir(cluster).join(format!("{field}.meta.json"))
    }

    /// Write an entry: sidecar first, then the data file.
    pub fn save(
        &self,
        cluster: ClusterId,
        field: &str,
        shape: &[usize],
        data: &[f32],
    ) -> Result<(), StoreError> {
        debug_assert_eq!(shape.iter().product::<usize>(), data.len());
        fs::create_dir_all(self.cluster_dir(cluster))?;

        let meta = ArrayMeta {
            shape: shape.to_vec(),
            dtype: "f32".to_string(),
        };
        fs::write(self.meta_path(cluster, field), serde_json::to_vec(&meta)?)?;
        fs::write(self.bin_path(cluster, field), bytemuck::cast_slice(data))?;

        debug!(cluster, field, ?shape, "saved entry");
        Ok(())
    }

    /// Read the stored shape without touching the data file.
    pub fn shape(&self, cluster: ClusterId, field: &str) -> Result<Option<Vec<usize>>, StoreError> {
        let path = self.meta_path(cluster, field);
        if !path.exists() {
            return Ok(None);
        }
        let meta: ArrayMeta = serde_json::from_slice(&fs::read(path)?)?;
        Ok(Some(meta.shape))
    }

    /// Load an entry, or `None` if it does not exist. A data file whose
    /// length disagrees with its sidecar loads as a shape mismatch.
    pub fn load(&self, cluster: ClusterId, field: &str) -> Result<Option<FlatArray>, StoreError> {
        let shape = match self.shape(cluster, field)? {
            Some(shape) => shape,
            None => return Ok(None),
        };
        let bin = self.bin_path(cluster, field);
        if !bin.exists() {
            return Ok(None);
        }
        let bytes = fs::read(bin)?;
        let data: Vec<f32> = bytemuck::pod_collect_to_vec(&bytes);
        if data.len() != shape.iter().product::<usize>() {
            return Err(StoreError::ShapeMismatch {
                cluster,
                field: field.to_string(),
                expected: shape,
                found: vec![data.len()],
            });
        }
        Ok(Some(FlatArray { shape, data }))
    }

    /// Load an entry that must exist.
    pub fn load_required(&self, cluster: ClusterId, field: &str) -> Result<FlatArray, StoreError> {
        self.load(cluster, field)?.ok_or_else(|| StoreError::MissingEntry {
            cluster,
            field: field.to_string(),
        })
    }

    /// Probe an entry against an expected shape without loading all of it.
    ///
    /// Reads the sidecar, checks the data file length, and when both agree
    /// reads just the first and last rows for the all-zero corruption
    /// heuristic.
    pub fn probe(
        &self,
        cluster: ClusterId,
        field: &str,
        expected: &[usize],
    ) -> Result<ProbeResult, StoreError> {
        let shape = match self.shape(cluster, field)? {
            Some(shape) => shape,
            None => return Ok(ProbeResult::Missing),
        };
        if shape != expected {
            return Ok(ProbeResult::Mismatch);
        }

        let bin = self.bin_path(cluster, field);
        if !bin.exists() {
            return Ok(ProbeResult::Missing);
        }
        let n_rows = shape.first().copied().unwrap_or(0);
        let row_len: usize = shape.iter().skip(1).product();
        let row_bytes = row_len * std::mem::size_of::<f32>();
        let expected_len = (n_rows * row_bytes) as u64;
        let mut file = File::open(&bin)?;
        if file.metadata()?.len() != expected_len {
            return Ok(ProbeResult::Mismatch);
        }
        if n_rows == 0 || row_len == 0 {
            return Ok(ProbeResult::Intact { suspect: false });
        }

        let mut first = vec![0u8; row_bytes];
        file.read_exact(&mut first)?;
        let mut last = vec![0u8; row_bytes];
        file.seek(SeekFrom::End(-(row_bytes as i64)))?;
        file.read_exact(&mut last)?;
        let all_zero =
            |bytes: &[u8]| bytemuck::pod_collect_to_vec::<u8, f32>(bytes).iter().all(|&v| v == 0.0);
        Ok(ProbeResult::Intact {
            suspect: all_zero(&first) && all_zero(&last),
        })
    }
}

/// Pool of persistent-entry write handles for one distribution pass.
///
/// Handles open lazily on the first row written to a `(cluster, field)` and
/// close when the pool drops, on every exit path. Rows are written in place
/// by seeking into the pre-sized data file, so a pass touches exactly the
/// entries it was asked to populate.
pub struct WriterPool<'a> {
    store: &'a DiskStore,
    files: HashMap<(ClusterId, String), File>,
}

impl<'a> WriterPool<'a> {
    pub fn new(store: &'a DiskStore) -> Self {
        Self {
            store,
            files: HashMap::new(),
        }
    }

    /// Write one row at the given row index.
    pub fn write_row(
        &mut self,
        cluster: ClusterId,
        field: &str,
        row: usize,
        data: &[f32],
    ) -> Result<(), StoreError> {
        let key = (cluster, field.to_string());
        let file = match self.files.entry(key) {
            std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
            std::collections::hash_map::Entry::Vacant(e) => {
                let path = self.store.bin_path(cluster, field);
                e.insert(OpenOptions::new().write(true).open(path)?)
            }
        };
        let offset = (row * data.len() * std::mem::size_of::<f32>()) as u64;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(bytemuck::cast_slice(data))?;
        Ok(())
    }

    /// Number of handles currently open.
    pub fn open_handles(&self) -> usize {
        self.files.len()
    }

    /// Flush every handle. Dropping the pool closes them regardless.
    pub fn finish(mut self) -> Result<(), StoreError> {
        for file in self.files.values_mut() {
            file.flush()?;
        }
        Ok(())
    }
}
