//! Startup loading of the ONNX-backed capabilities.
//!
//! A model that is missing, corrupt or fails to load disables only its own
//! capability; the inference loop degrades instead of the daemon exiting.

use std::path::Path;

use livegate_core::{
    Capabilities, ChallengeEstimator, EmbeddingExtractor, FaceDetector, LivenessClassifier,
};
use livegate_models::{
    model_for, verify_model, ArcFaceExtractor, LandmarkApertureEstimator, ModelLoadError,
    ModelRole, OnnxLivenessClassifier, ScrfdDetector,
};

pub fn load(model_dir: &Path) -> Capabilities {
    let capabilities = Capabilities {
        detector: load_one(model_dir, ModelRole::FaceDetector, ScrfdDetector::load)
            .map(|d| Box::new(d) as Box<dyn FaceDetector>),
        classifier: load_one(
            model_dir,
            ModelRole::LivenessClassifier,
            OnnxLivenessClassifier::load,
        )
        .map(|c| Box::new(c) as Box<dyn LivenessClassifier>),
        challenge: load_one(
            model_dir,
            ModelRole::ChallengeEstimator,
            LandmarkApertureEstimator::load,
        )
        .map(|c| Box::new(c) as Box<dyn ChallengeEstimator>),
        extractor: load_one(model_dir, ModelRole::EmbeddingExtractor, ArcFaceExtractor::load)
            .map(|e| Box::new(e) as Box<dyn EmbeddingExtractor>),
    };

    let missing = capabilities.missing();
    if missing.is_empty() {
        tracing::info!(model_dir = %model_dir.display(), "all capabilities loaded");
    } else if !capabilities.can_verify() {
        tracing::error!(
            ?missing,
            "required capabilities unavailable, no verification results will be produced"
        );
    } else {
        tracing::warn!(?missing, "running with reduced capabilities");
    }
    capabilities
}

fn load_one<T>(
    model_dir: &Path,
    role: ModelRole,
    loader: impl FnOnce(&Path) -> Result<T, ModelLoadError>,
) -> Option<T> {
    let model = model_for(role);
    let path = match verify_model(model, model_dir) {
        Ok(path) => path,
        Err(e) => {
            tracing::warn!(model = model.name, error = %e, "model unavailable, capability disabled");
            return None;
        }
    };
    match loader(&path) {
        Ok(loaded) => {
            tracing::info!(model = model.name, path = %path.display(), "model loaded");
            Some(loaded)
        }
        Err(e) => {
            tracing::warn!(model = model.name, error = %e, "model failed to load, capability disabled");
            None
        }
    }
}
