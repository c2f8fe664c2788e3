//! Face gallery matching and sighting log.
//!
//! Holds the enrolled gallery, cosine matching, the debounce cache, and the
//! event log, plus an SCRFD + ArcFace extractor that turns image bytes into
//! embeddings via ONNX Runtime.

pub mod alignment;
pub mod debounce;
pub mod detector;
pub mod events;
pub mod extractor;
pub mod gallery;
pub mod recognizer;
pub mod storage;
pub mod types;

pub use debounce::DebounceCache;
pub use events::{Event, EventStore, EventStoreError};
pub use extractor::{ExtractError, FaceExtractor, OnnxExtractor};
pub use gallery::{GalleryEntry, GalleryError, GalleryStore};
pub use types::{CosineMatcher, Embedding, Gallery, MatchError, MatchResult, Matcher, EMBEDDING_DIM};

use std::path::PathBuf;

/// SCRFD detection model file name inside the model directory.
pub const DETECTOR_MODEL_FILE: &str = "det_10g.onnx";
/// ArcFace recognition model file name inside the model directory.
pub const RECOGNIZER_MODEL_FILE: &str = "w600k_r50.onnx";

/// Default location of the ONNX model files: `$XDG_DATA_HOME/turnstile/models`.
pub fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("turnstile/models")
}
