use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::region::FaceRegion;

/// Dimensionality of the embeddings produced by the bundled ArcFace model.
pub const EMBEDDING_DIM: usize = 512;

/// Fixed-length identity vector extracted from a face crop.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Scale to unit L2 norm. A zero vector is left untouched.
    pub fn normalized(mut self) -> Self {
        let norm = self.values.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            self.values.iter_mut().for_each(|v| *v /= norm);
        }
        self
    }

    /// True when every component is finite.
    pub fn is_finite(&self) -> bool {
        self.values.iter().all(|v| v.is_finite())
    }
}

/// The single trustworthy output of one verification episode.
///
/// Built in one piece by the liveness session and stored whole, so a reader
/// either sees every field or no result at all.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VerificationResult {
    /// Identifies the verification episode that produced this result.
    pub episode: Uuid,
    pub embedding: Embedding,
    pub region: FaceRegion,
    pub liveness_passed: bool,
    /// Whether an active challenge was part of this episode.
    pub action_confirmed: bool,
    pub captured_at: DateTime<Utc>,
}
