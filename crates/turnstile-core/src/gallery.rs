//! Durable name → reference-embedding store.
//!
//! Readers get an `Arc` snapshot of the whole map and never wait on disk I/O.
//! Writers are serialized by a separate lock: each one builds the next map,
//! persists it atomically, and only then publishes it to readers. A failed
//! write therefore leaves both the file and the in-memory view untouched.

use crate::storage::{self, StorageError};
use crate::types::{Embedding, Gallery};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("storage: {0}")]
    Storage(#[from] StorageError),
}

/// One enrolled identity.
#[derive(Debug, Clone, PartialEq)]
pub struct GalleryEntry {
    pub name: String,
    pub embedding: Embedding,
}

pub struct GalleryStore {
    path: PathBuf,
    entries: RwLock<Arc<Gallery>>,
    writer: Mutex<()>,
}

impl GalleryStore {
    /// Open the gallery at `path`, loading any previously persisted entries.
    ///
    /// Unreadable files, and files whose entries disagree on dimensionality,
    /// are logged and treated as an empty gallery.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut gallery: Gallery = storage::load_or_default(&path, "gallery");

        if let Err(reason) = check_uniform_dim(&gallery) {
            tracing::warn!(
                path = %path.display(),
                %reason,
                "gallery entries inconsistent; starting empty"
            );
            gallery.clear();
        }

        tracing::info!(path = %path.display(), people = gallery.len(), "gallery loaded");

        Self {
            path,
            entries: RwLock::new(Arc::new(gallery)),
            writer: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Look up one identity. Absence is `None`, not an error.
    pub fn get(&self, name: &str) -> Option<GalleryEntry> {
        self.snapshot().get(name).map(|embedding| GalleryEntry {
            name: name.to_string(),
            embedding: embedding.clone(),
        })
    }

    /// All enrolled names, sorted.
    pub fn list(&self) -> Vec<String> {
        self.snapshot().keys().cloned().collect()
    }

    /// Consistent point-in-time view of the full gallery.
    pub fn snapshot(&self) -> Arc<Gallery> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    /// Replace `name`'s reference embedding with the element-wise mean of `samples`.
    ///
    /// The previous reference for `name`, if any, does not contribute to the
    /// new average. The file is flushed before this returns.
    pub fn upsert_average(
        &self,
        name: &str,
        samples: &[Embedding],
    ) -> Result<GalleryEntry, GalleryError> {
        if name.trim().is_empty() {
            return Err(GalleryError::InvalidInput("name must not be empty".into()));
        }
        let embedding = average(samples)?;

        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.snapshot();

        if let Some((other, existing)) = current
            .iter()
            .find(|(other, existing)| other.as_str() != name && existing.dim() != embedding.dim())
        {
            return Err(GalleryError::InvalidInput(format!(
                "embedding has {} dimensions but '{other}' has {}",
                embedding.dim(),
                existing.dim()
            )));
        }

        let mut next = (*current).clone();
        let replaced = next.insert(name.to_string(), embedding.clone()).is_some();
        storage::write_json_atomic(&self.path, &next)?;

        *self.entries.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(next);

        tracing::info!(name, samples = samples.len(), replaced, "gallery entry written");

        Ok(GalleryEntry {
            name: name.to_string(),
            embedding,
        })
    }
}

/// Element-wise mean of a non-empty set of equally sized, finite embeddings.
pub fn average(samples: &[Embedding]) -> Result<Embedding, GalleryError> {
    let first = samples
        .first()
        .ok_or_else(|| GalleryError::InvalidInput("at least one sample is required".into()))?;
    let dim = first.dim();
    if dim == 0 {
        return Err(GalleryError::InvalidInput("embedding is empty".into()));
    }

    let mut sums = vec![0.0f64; dim];
    for (i, sample) in samples.iter().enumerate() {
        if sample.dim() != dim {
            return Err(GalleryError::InvalidInput(format!(
                "sample {i} has {} dimensions, expected {dim}",
                sample.dim()
            )));
        }
        if !sample.is_finite() {
            return Err(GalleryError::InvalidInput(format!(
                "sample {i} contains non-finite values"
            )));
        }
        for (sum, v) in sums.iter_mut().zip(&sample.values) {
            *sum += f64::from(*v);
        }
    }

    let n = samples.len() as f64;
    Ok(Embedding::new(
        sums.into_iter().map(|sum| (sum / n) as f32).collect(),
    ))
}

fn check_uniform_dim(gallery: &Gallery) -> Result<(), String> {
    let mut dims = gallery.iter().map(|(name, e)| (name, e.dim()));
    let Some((first_name, dim)) = dims.next() else {
        return Ok(());
    };
    if dim == 0 {
        return Err(format!("'{first_name}' has an empty embedding"));
    }
    match dims.find(|(_, d)| *d != dim) {
        Some((name, d)) => Err(format!("'{first_name}' has {dim} dimensions, '{name}' has {d}")),
        None => Ok(()),
    }
}
