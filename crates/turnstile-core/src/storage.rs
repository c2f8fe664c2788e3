//! JSON file persistence shared by the gallery and event stores.
//!
//! Writes go to a sibling `.tmp` file which is fsynced and then renamed over
//! the canonical path, so a reader after a crash sees either the old or the
//! new document, never a torn one.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("i/o on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("corrupt state in {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl StorageError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// Serialize `value` as pretty JSON and atomically replace `path` with it.
pub fn write_json_atomic<T: Serialize + ?Sized>(
    path: &Path,
    value: &T,
) -> Result<(), StorageError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| StorageError::io(parent, e))?;
    }

    let tmp_path = sibling(path, ".tmp");
    {
        let file = File::create(&tmp_path).map_err(|e| StorageError::io(&tmp_path, e))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, value).map_err(|e| StorageError::Corrupt {
            path: tmp_path.clone(),
            source: e,
        })?;
        writer.flush().map_err(|e| StorageError::io(&tmp_path, e))?;
        writer
            .get_ref()
            .sync_all()
            .map_err(|e| StorageError::io(&tmp_path, e))?;
    }

    fs::rename(&tmp_path, path).map_err(|e| StorageError::io(path, e))
}

/// Read and parse `path`. A missing file is `Ok(None)`.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StorageError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StorageError::io(path, e)),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| StorageError::Corrupt {
            path: path.to_path_buf(),
            source: e,
        })
}

/// Load persisted state, degrading to `T::default()` on any failure.
///
/// An unreadable or unparseable file is logged at warn level and copied to
/// `<path>.corrupt` so the next write does not destroy the evidence.
pub fn load_or_default<T: DeserializeOwned + Default>(path: &Path, what: &str) -> T {
    match read_json(path) {
        Ok(Some(value)) => value,
        Ok(None) => {
            tracing::info!(path = %path.display(), what, "no persisted state; starting empty");
            T::default()
        }
        Err(err) => {
            let backup = sibling(path, ".corrupt");
            tracing::warn!(
                error = %err,
                backup = %backup.display(),
                what,
                "persisted state unreadable; starting empty"
            );
            if let Err(copy_err) = fs::copy(path, &backup) {
                tracing::warn!(error = %copy_err, "could not back up unreadable state");
            }
            T::default()
        }
    }
}
