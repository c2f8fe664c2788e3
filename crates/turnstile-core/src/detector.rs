//! SCRFD face detector via ONNX Runtime.
//!
//! Frames are letterboxed into a 640×640 canvas anchored at the top-left
//! corner, run through the three-stride anchor-free head, and filtered with
//! NMS. Coordinates come back in the original image's pixel space.

use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const SCRFD_INPUT_SIZE: u32 = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_SCORE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// A detected face: corner box, score, and five landmarks
/// (left eye, right eye, nose, left mouth corner, right mouth corner).
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub score: f32,
    pub landmarks: [(f32, f32); 5],
}

impl Detection {
    pub fn area(&self) -> f32 {
        (self.x2 - self.x1).max(0.0) * (self.y2 - self.y1).max(0.0)
    }
}

/// Positions of the score, box, and landmark tensors for one stride.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StrideOutputs {
    score: usize,
    bbox: usize,
    kps: usize,
}

pub struct FaceDetector {
    session: Session,
    outputs: [StrideOutputs; 3],
}

impl FaceDetector {
    /// Load the SCRFD ONNX model (`det_10g.onnx`) from the given path.
    pub fn load(model_path: &str) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        if names.len() < 9 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD needs 9 outputs (score/bbox/kps per stride), model has {}",
                names.len()
            )));
        }

        let outputs = map_outputs(&names);
        tracing::info!(
            path = model_path,
            outputs = ?names,
            mapping = ?outputs,
            "loaded SCRFD model"
        );

        Ok(Self { session, outputs })
    }

    /// Detect faces, highest score first.
    pub fn detect(&mut self, image: &RgbImage) -> Result<Vec<Detection>, DetectorError> {
        let (input, scale) = preprocess(image);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (level, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let idx = self.outputs[level];
            let tensor = |i: usize, what: &str| {
                outputs[i]
                    .try_extract_tensor::<f32>()
                    .map(|(_, data)| data)
                    .map_err(|e| {
                        DetectorError::InferenceFailed(format!("{what} stride {stride}: {e}"))
                    })
            };
            let scores = tensor(idx.score, "scores")?;
            let boxes = tensor(idx.bbox, "boxes")?;
            let kps = tensor(idx.kps, "landmarks")?;

            candidates.extend(decode_level(
                scores,
                boxes,
                kps,
                stride,
                scale,
                SCRFD_SCORE_THRESHOLD,
            ));
        }

        Ok(nms(candidates, SCRFD_NMS_THRESHOLD))
    }
}

/// Letterbox `image` into the detector canvas and normalize to NCHW.
///
/// Returns the tensor and the resize factor (canvas px per source px).
fn preprocess(image: &RgbImage) -> (Array4<f32>, f32) {
    let size = SCRFD_INPUT_SIZE;
    let scale = letterbox_scale(image.width(), image.height());
    let new_w = ((image.width() as f32 * scale).round() as u32).clamp(1, size);
    let new_h = ((image.height() as f32 * scale).round() as u32).clamp(1, size);

    let resized = imageops::resize(image, new_w, new_h, FilterType::Triangle);
    let mut canvas = RgbImage::from_pixel(size, size, Rgb([0, 0, 0]));
    imageops::replace(&mut canvas, &resized, 0, 0);

    let side = size as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, side, side));
    for (x, y, pixel) in canvas.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (pixel[c] as f32 - SCRFD_MEAN) / SCRFD_STD;
        }
    }

    (tensor, scale)
}

fn letterbox_scale(width: u32, height: u32) -> f32 {
    let size = SCRFD_INPUT_SIZE as f32;
    (size / width.max(1) as f32).min(size / height.max(1) as f32)
}

/// Match output tensors to strides by name (`score_8`, `bbox_16`, `kps_32`, ...),
/// or fall back to the stock export order: scores 0-2, boxes 3-5, landmarks 6-8.
fn map_outputs(names: &[String]) -> [StrideOutputs; 3] {
    let position = |prefix: &str, stride: usize| {
        let wanted = format!("{prefix}_{stride}");
        names.iter().position(|n| *n == wanted)
    };

    let mut mapped = [StrideOutputs { score: 0, bbox: 0, kps: 0 }; 3];
    for (level, &stride) in SCRFD_STRIDES.iter().enumerate() {
        match (
            position("score", stride),
            position("bbox", stride),
            position("kps", stride),
        ) {
            (Some(score), Some(bbox), Some(kps)) => {
                mapped[level] = StrideOutputs { score, bbox, kps }
            }
            _ => {
                tracing::debug!(
                    ?names,
                    "SCRFD output names not recognized; using positional order"
                );
                return std::array::from_fn(|level| StrideOutputs {
                    score: level,
                    bbox: level + 3,
                    kps: level + 6,
                });
            }
        }
    }
    mapped
}

/// Turn one stride's raw outputs into detections above `threshold`.
///
/// Anchors are laid out row-major over the `640/stride` grid with
/// `SCRFD_ANCHORS_PER_CELL` anchors per cell; box and landmark offsets are
/// distances in units of `stride` from the cell's top-left corner.
fn decode_level(
    scores: &[f32],
    boxes: &[f32],
    kps: &[f32],
    stride: usize,
    scale: f32,
    threshold: f32,
) -> Vec<Detection> {
    let grid = SCRFD_INPUT_SIZE as usize / stride;
    let anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;
    let s = stride as f32;

    (0..anchors.min(scores.len()))
        .filter(|&i| scores[i] > threshold)
        .filter_map(|i| {
            let b = boxes.get(i * 4..i * 4 + 4)?;
            let k = kps.get(i * 10..i * 10 + 10)?;

            let cell = i / SCRFD_ANCHORS_PER_CELL;
            let cx = (cell % grid) as f32 * s;
            let cy = (cell / grid) as f32 * s;

            let landmarks = std::array::from_fn(|p| {
                ((cx + k[p * 2] * s) / scale, (cy + k[p * 2 + 1] * s) / scale)
            });

            Some(Detection {
                x1: (cx - b[0] * s) / scale,
                y1: (cy - b[1] * s) / scale,
                x2: (cx + b[2] * s) / scale,
                y2: (cy + b[3] * s) / scale,
                score: scores[i],
                landmarks,
            })
        })
        .collect()
}

/// Greedy non-maximum suppression. Output is sorted by descending score.
fn nms(mut candidates: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    candidates.sort_by(|a, b| b.score.total_cmp(&a.score));

    let mut kept: Vec<Detection> = Vec::with_capacity(candidates.len());
    for det in candidates {
        if kept.iter().all(|k| iou(k, &det) <= iou_threshold) {
            kept.push(det);
        }
    }
    kept
}

fn iou(a: &Detection, b: &Detection) -> f32 {
    let w = (a.x2.min(b.x2) - a.x1.max(b.x1)).max(0.0);
    let h = (a.y2.min(b.y2) - a.y1.max(b.y1)).max(0.0);
    let inter = w * h;
    let union = a.area() + b.area() - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}
