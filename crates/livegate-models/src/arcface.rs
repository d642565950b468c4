use std::path::Path;

use livegate_core::{CapabilityError, Embedding, EmbeddingExtractor, Frame, EMBEDDING_DIM};
use ort::session::Session;

use crate::onnx::{self, ModelLoadError};

const CAPABILITY: &str = "embedding_extractor";
const DEFAULT_INPUT: (u32, u32) = (112, 112);
const MODEL_VERSION: &str = "w600k_r50";
/// Crops smaller than this carry too little detail for identity.
const MIN_CROP_SIDE: u32 = 24;

/// ArcFace (insightface `w600k_r50`) embedding extractor.
pub struct ArcFaceExtractor {
    session: Session,
    input: (u32, u32),
}

impl ArcFaceExtractor {
    pub fn load(path: &Path) -> Result<Self, ModelLoadError> {
        let session = onnx::load_session(path)?;
        let input = onnx::input_size(&session, DEFAULT_INPUT);
        Ok(Self { session, input })
    }
}

impl EmbeddingExtractor for ArcFaceExtractor {
    fn embed(&mut self, face_crop: &Frame) -> Result<Option<Embedding>, CapabilityError> {
        if face_crop.width() < MIN_CROP_SIDE || face_crop.height() < MIN_CROP_SIDE {
            return Ok(None);
        }
        let tensor = onnx::to_nchw(
            face_crop,
            self.input.0,
            self.input.1,
            onnx::Normalize {
                mean: [127.5; 3],
                scale: 1.0 / 127.5,
                bgr: false,
            },
        )?;
        let mut outputs = onnx::run_flat(&mut self.session, tensor, CAPABILITY)?;
        to_embedding(outputs.swap_remove(0)).map(Some)
    }
}

/// Validate the raw model output and scale it to unit length.
fn to_embedding(values: Vec<f32>) -> Result<Embedding, CapabilityError> {
    if values.len() != EMBEDDING_DIM {
        return Err(CapabilityError::UnexpectedOutput {
            capability: CAPABILITY,
            message: format!("expected {EMBEDDING_DIM} values, got {}", values.len()),
        });
    }
    let embedding = Embedding {
        values,
        model_version: Some(MODEL_VERSION.to_string()),
    }
    .normalized();
    if !embedding.is_finite() {
        return Err(CapabilityError::UnexpectedOutput {
            capability: CAPABILITY,
            message: "embedding contains NaN/Inf".to_string(),
        });
    }
    Ok(embedding)
}
