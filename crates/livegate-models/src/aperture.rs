use std::path::Path;

use livegate_core::{ChallengeEstimator, CapabilityError, Frame};
use ort::session::Session;

use crate::onnx::{self, ModelLoadError};

const CAPABILITY: &str = "challenge_estimator";
const DEFAULT_INPUT: (u32, u32) = (112, 112);
const LANDMARKS: usize = 68;

// Inner lip contour of the 68-point (iBUG 300-W) layout.
const MOUTH_LEFT: usize = 60;
const MOUTH_RIGHT: usize = 64;
const UPPER_INNER: [usize; 3] = [61, 62, 63];
const LOWER_INNER: [usize; 3] = [67, 66, 65];

/// Mouth aperture from a 68-point landmark regressor.
///
/// The model takes a face crop scaled to `[0, 1]` and outputs 136 values:
/// `(x, y)` pairs normalised to the crop.
pub struct LandmarkApertureEstimator {
    session: Session,
    input: (u32, u32),
}

impl LandmarkApertureEstimator {
    pub fn load(path: &Path) -> Result<Self, ModelLoadError> {
        let session = onnx::load_session(path)?;
        let input = onnx::input_size(&session, DEFAULT_INPUT);
        Ok(Self { session, input })
    }
}

impl ChallengeEstimator for LandmarkApertureEstimator {
    fn aperture_ratio(&mut self, face_crop: &Frame) -> Result<Option<f32>, CapabilityError> {
        let tensor = onnx::to_nchw(
            face_crop,
            self.input.0,
            self.input.1,
            onnx::Normalize {
                mean: [0.0; 3],
                scale: 1.0 / 255.0,
                bgr: false,
            },
        )?;
        let outputs = onnx::run_flat(&mut self.session, tensor, CAPABILITY)?;
        let points = &outputs[0];
        if points.len() < LANDMARKS * 2 {
            return Err(CapabilityError::UnexpectedOutput {
                capability: CAPABILITY,
                message: format!("expected {} values, got {}", LANDMARKS * 2, points.len()),
            });
        }
        Ok(mouth_aperture_ratio(points))
    }
}

/// Mean inner-lip opening divided by the inner mouth width.
/// `None` when the mouth corners collapse onto each other.
fn mouth_aperture_ratio(points: &[f32]) -> Option<f32> {
    let at = |i: usize| (points[i * 2], points[i * 2 + 1]);
    let dist = |a: (f32, f32), b: (f32, f32)| ((a.0 - b.0).powi(2) + (a.1 - b.1).powi(2)).sqrt();

    let width = dist(at(MOUTH_LEFT), at(MOUTH_RIGHT));
    if width <= f32::EPSILON {
        return None;
    }
    let opening: f32 = UPPER_INNER
        .iter()
        .zip(LOWER_INNER.iter())
        .map(|(&u, &l)| dist(at(u), at(l)))
        .sum::<f32>()
        / UPPER_INNER.len() as f32;
    Some(opening / width)
}
