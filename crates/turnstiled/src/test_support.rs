//! Deterministic stand-ins for the ONNX extractor.

use crate::engine::spawn_engine;
use crate::service::Service;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use turnstile_core::{
    DebounceCache, Embedding, EventStore, ExtractError, FaceExtractor, GalleryStore,
};

/// Reads "images" of the form `1,0,0.5` as the embedding itself.
///
/// `garbage` fails to decode, `blank` has no face.
#[derive(Default)]
pub struct StubExtractor {
    pub delay: Duration,
}

impl FaceExtractor for StubExtractor {
    fn extract(&mut self, image: &[u8]) -> Result<Embedding, ExtractError> {
        std::thread::sleep(self.delay);
        match image {
            b"garbage" => Err(ExtractError::Decode("unsupported image format".into())),
            b"blank" => Err(ExtractError::NoFaceDetected),
            raw => {
                let text =
                    std::str::from_utf8(raw).map_err(|e| ExtractError::Decode(e.to_string()))?;
                text.split(',')
                    .map(|v| v.trim().parse::<f32>())
                    .collect::<Result<Vec<_>, _>>()
                    .map(Embedding::new)
                    .map_err(|e| ExtractError::Decode(e.to_string()))
            }
        }
    }
}

/// A service over the stores in `dir` with a 30 s debounce window.
pub fn service_in(dir: &Path) -> Arc<Service> {
    service_with(dir, StubExtractor::default(), Duration::from_secs(5))
}

/// Like [`service_in`] but with a custom extractor and extraction timeout.
pub fn service_with(dir: &Path, extractor: StubExtractor, timeout: Duration) -> Arc<Service> {
    let engine = spawn_engine(extractor, timeout).unwrap();
    Arc::new(Service::new(
        GalleryStore::open(dir.join("embeddings/gallery.json")),
        EventStore::open(dir.join("events.json")),
        DebounceCache::new(Duration::from_secs(30)),
        engine,
    ))
}

/// Write a gallery entry straight to disk, bypassing extraction.
pub fn seed_gallery(dir: &Path, name: &str, values: &[f32]) {
    GalleryStore::open(dir.join("embeddings/gallery.json"))
        .upsert_average(name, &[Embedding::new(values.to_vec())])
        .unwrap();
}
