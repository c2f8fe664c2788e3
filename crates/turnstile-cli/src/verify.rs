//! Offline comparison of two photos with the local ONNX models.

use anyhow::{bail, Context, Result};
use std::path::Path;
use turnstile_core::{Embedding, FaceExtractor, OnnxExtractor};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Verdict {
    pub score: f32,
    pub is_match: bool,
}

pub fn load_extractor(model_dir: &Path) -> Result<OnnxExtractor> {
    let detector = model_dir.join(turnstile_core::DETECTOR_MODEL_FILE);
    let recognizer = model_dir.join(turnstile_core::RECOGNIZER_MODEL_FILE);
    OnnxExtractor::load(&detector, &recognizer)
        .with_context(|| format!("loading models from {}", model_dir.display()))
}

/// Cosine similarity between the faces in `first` and `second`.
pub fn compare<E: FaceExtractor>(
    extractor: &mut E,
    first: &Path,
    second: &Path,
    thr: f32,
) -> Result<Verdict> {
    let a = embed(extractor, first)?;
    let b = embed(extractor, second)?;
    if a.dim() != b.dim() {
        bail!("embedding sizes differ: {} vs {}", a.dim(), b.dim());
    }
    let score = a.similarity(&b);
    Ok(Verdict {
        score,
        is_match: score >= thr,
    })
}

fn embed<E: FaceExtractor>(extractor: &mut E, path: &Path) -> Result<Embedding> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    extractor
        .extract(&bytes)
        .with_context(|| path.display().to_string())
}
