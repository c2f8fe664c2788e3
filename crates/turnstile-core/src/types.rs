use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Dimensionality of ArcFace (w600k_r50) embeddings.
pub const EMBEDDING_DIM: usize = 512;

/// Added to vector norms so zero vectors score 0.0 instead of dividing by zero.
const NORM_EPSILON: f32 = 1e-9;

/// Face embedding vector (512-dimensional for ArcFace).
///
/// Serializes as a bare JSON array of floats, which is the gallery file format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    pub fn is_finite(&self) -> bool {
        self.values.iter().all(|v| v.is_finite())
    }

    /// Cosine similarity: `dot(a / (|a| + eps), b / (|b| + eps))`.
    ///
    /// Returns a value in roughly [-1, 1]. Higher = more similar.
    /// Both embeddings must have the same dimensionality; callers check this.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        debug_assert_eq!(self.dim(), other.dim());

        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        dot / ((norm_a.sqrt() + NORM_EPSILON) * (norm_b.sqrt() + NORM_EPSILON))
    }
}

/// Enrolled identities keyed by name. Ordered, so iteration is deterministic.
pub type Gallery = BTreeMap<String, Embedding>;

/// Result of matching a query embedding against the whole gallery.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    /// Cosine similarity of the query against every enrolled identity.
    pub scores: BTreeMap<String, f32>,
    pub best_name: String,
    pub best_score: f32,
    /// `best_score >= threshold`.
    pub is_match: bool,
}

#[derive(Error, Debug, PartialEq)]
pub enum MatchError {
    #[error("gallery empty, enroll first")]
    EmptyGallery,
    #[error("query embedding has {actual} dimensions, gallery uses {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("query embedding contains non-finite values")]
    NonFinite,
}

/// Strategy for comparing a query embedding against a gallery of enrolled faces.
pub trait Matcher {
    fn compare(
        &self,
        query: &Embedding,
        gallery: &Gallery,
        threshold: f32,
    ) -> Result<MatchResult, MatchError>;
}

/// Cosine similarity matcher.
///
/// Ties on the best score resolve to the lexicographically smallest name,
/// independent of gallery iteration order.
pub struct CosineMatcher;

impl Matcher for CosineMatcher {
    fn compare(
        &self,
        query: &Embedding,
        gallery: &Gallery,
        threshold: f32,
    ) -> Result<MatchResult, MatchError> {
        if gallery.is_empty() {
            return Err(MatchError::EmptyGallery);
        }
        if !query.is_finite() {
            return Err(MatchError::NonFinite);
        }

        let mut scores = BTreeMap::new();
        let mut best: Option<(&str, f32)> = None;

        for (name, reference) in gallery {
            if reference.dim() != query.dim() {
                return Err(MatchError::DimensionMismatch {
                    expected: reference.dim(),
                    actual: query.dim(),
                });
            }
            let sim = query.similarity(reference);
            scores.insert(name.clone(), sim);

            let is_better = match best {
                None => true,
                Some((best_name, best_sim)) => {
                    sim > best_sim || (sim == best_sim && name.as_str() < best_name)
                }
            };
            if is_better {
                best = Some((name.as_str(), sim));
            }
        }

        let (best_name, best_score) = best
            .map(|(name, sim)| (name.to_string(), sim))
            .ok_or(MatchError::EmptyGallery)?;

        Ok(MatchResult {
            is_match: best_score >= threshold,
            scores,
            best_name,
            best_score,
        })
    }
}
