use std::path::Path;

use livegate_core::{CapabilityError, FaceRegion, Frame, LivenessClassifier};
use ort::session::Session;

use crate::onnx::{self, ModelLoadError};

const CAPABILITY: &str = "liveness_classifier";
const DEFAULT_INPUT: (u32, u32) = (32, 32);
/// Index of the "live" class in the two-way (spoof, live) output.
const LIVE_CLASS: usize = 1;

/// Two-class spoof/live classifier over a small face crop, BGR mean
/// subtracted. The score is the softmax probability of the live class.
pub struct OnnxLivenessClassifier {
    session: Session,
    input: (u32, u32),
}

impl OnnxLivenessClassifier {
    pub fn load(path: &Path) -> Result<Self, ModelLoadError> {
        let session = onnx::load_session(path)?;
        let input = onnx::input_size(&session, DEFAULT_INPUT);
        Ok(Self { session, input })
    }
}

impl LivenessClassifier for OnnxLivenessClassifier {
    fn score(&mut self, frame: &Frame, region: &FaceRegion) -> Result<f32, CapabilityError> {
        let crop = region
            .crop(frame)
            .ok_or_else(|| CapabilityError::InvalidInput("face region outside frame".to_string()))?;
        let tensor = onnx::to_nchw(
            &crop,
            self.input.0,
            self.input.1,
            onnx::Normalize {
                mean: [104.0, 177.0, 123.0],
                scale: 1.0,
                bgr: true,
            },
        )?;
        let outputs = onnx::run_flat(&mut self.session, tensor, CAPABILITY)?;
        live_probability(&outputs[0])
    }
}

fn live_probability(logits: &[f32]) -> Result<f32, CapabilityError> {
    if logits.len() <= LIVE_CLASS {
        return Err(CapabilityError::UnexpectedOutput {
            capability: CAPABILITY,
            message: format!("expected 2 classes, got {}", logits.len()),
        });
    }
    // Some exports already end in a softmax layer.
    let sum: f32 = logits.iter().sum();
    let is_distribution = logits.iter().all(|v| (0.0..=1.0).contains(v)) && (sum - 1.0).abs() < 1e-3;
    let probs = if is_distribution {
        logits.to_vec()
    } else {
        onnx::softmax(logits)
    };
    Ok(probs[LIVE_CLASS])
}
