//! Image bytes → face embedding.

use crate::alignment;
use crate::detector::{Detection, DetectorError, FaceDetector};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::types::Embedding;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("cannot decode image: {0}")]
    Decode(String),
    #[error("no face detected")]
    NoFaceDetected,
    #[error("inference failed: {0}")]
    Inference(String),
}

impl From<DetectorError> for ExtractError {
    fn from(err: DetectorError) -> Self {
        Self::Inference(err.to_string())
    }
}

impl From<RecognizerError> for ExtractError {
    fn from(err: RecognizerError) -> Self {
        Self::Inference(err.to_string())
    }
}

/// Produces one embedding per image.
///
/// Implementations may be slow and stateful; callers run them on a
/// dedicated thread.
pub trait FaceExtractor: Send {
    fn extract(&mut self, image: &[u8]) -> Result<Embedding, ExtractError>;
}

/// SCRFD detection + ArcFace recognition on CPU.
pub struct OnnxExtractor {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl OnnxExtractor {
    pub fn load(detector_path: &Path, recognizer_path: &Path) -> Result<Self, ExtractError> {
        let detector = FaceDetector::load(&detector_path.to_string_lossy())?;
        let recognizer = FaceRecognizer::load(&recognizer_path.to_string_lossy())?;
        Ok(Self {
            detector,
            recognizer,
        })
    }
}

impl FaceExtractor for OnnxExtractor {
    fn extract(&mut self, image: &[u8]) -> Result<Embedding, ExtractError> {
        let decoded = image::load_from_memory(image)
            .map_err(|e| ExtractError::Decode(e.to_string()))?
            .to_rgb8();

        let faces = self.detector.detect(&decoded)?;
        let face = largest_face(&faces).ok_or(ExtractError::NoFaceDetected)?;
        tracing::debug!(
            faces = faces.len(),
            score = face.score,
            area = face.area(),
            "extract: using largest face"
        );

        let aligned = alignment::align_face(&decoded, &face.landmarks);
        Ok(self.recognizer.extract(&aligned)?)
    }
}

/// The detection with the biggest box; the first one wins on equal area.
pub fn largest_face(faces: &[Detection]) -> Option<&Detection> {
    faces
        .iter()
        .reduce(|best, d| if d.area() > best.area() { d } else { best })
}
