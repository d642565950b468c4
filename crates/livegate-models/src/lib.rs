use sha2::{Digest, Sha256};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use thiserror::Error;

mod aperture;
mod arcface;
mod classifier;
mod onnx;
mod scrfd;

pub use aperture::LandmarkApertureEstimator;
pub use arcface::ArcFaceExtractor;
pub use classifier::OnnxLivenessClassifier;
pub use onnx::ModelLoadError;
pub use scrfd::ScrfdDetector;

/// Which capability a model file backs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelRole {
    FaceDetector,
    LivenessClassifier,
    ChallengeEstimator,
    EmbeddingExtractor,
}

/// Model file descriptor: expected filename, role, and where to get it.
///
/// Models without a URL are supplied by the operator; they are checked for
/// presence only unless a checksum is pinned.
pub struct ModelFile {
    pub name: &'static str,
    pub role: ModelRole,
    pub url: Option<&'static str>,
    pub sha256: Option<&'static str>,
    pub size_display: &'static str,
}

// Checksums verified from HuggingFace Git LFS pointer files (oid sha256: field).
// Source: https://huggingface.co/public-data/insightface/raw/main/models/buffalo_l/
pub const MODELS: &[ModelFile] = &[
    ModelFile {
        name: "det_10g.onnx",
        role: ModelRole::FaceDetector,
        url: Some("https://huggingface.co/public-data/insightface/resolve/main/models/buffalo_l/det_10g.onnx"),
        sha256: Some("5838f7fe053675b1c7a08b633df49e7af5495cee0493c7dcf6697200b85b5b91"),
        size_display: "16 MB",
    },
    ModelFile {
        name: "w600k_r50.onnx",
        role: ModelRole::EmbeddingExtractor,
        url: Some("https://huggingface.co/public-data/insightface/resolve/main/models/buffalo_l/w600k_r50.onnx"),
        sha256: Some("4c06341c33c2ca1f86781dab0e829f88ad5b64be9fba56e56bc9ebdefc619e43"),
        size_display: "166 MB",
    },
    ModelFile {
        name: "liveness.onnx",
        role: ModelRole::LivenessClassifier,
        url: None,
        sha256: None,
        size_display: "< 1 MB",
    },
    ModelFile {
        name: "landmarks_68.onnx",
        role: ModelRole::ChallengeEstimator,
        url: None,
        sha256: None,
        size_display: "~ 5 MB",
    },
];

/// The manifest entry for `role`.
pub fn model_for(role: ModelRole) -> &'static ModelFile {
    MODELS
        .iter()
        .find(|m| m.role == role)
        .unwrap_or(&MODELS[0])
}

#[derive(Error, Debug)]
pub enum ModelIntegrityError {
    #[error("model file not found: {name} ({path})")]
    MissingModel { name: &'static str, path: PathBuf },

    #[error("failed to open model file: {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read model file: {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(
        "model checksum mismatch for {name} ({path})\n  expected: {expected}\n  got:      {got}"
    )]
    ChecksumMismatch {
        name: &'static str,
        path: PathBuf,
        expected: String,
        got: String,
    },
}

/// Compute SHA-256 hex digest of a file.
pub fn sha256_file_hex(path: &Path) -> Result<String, ModelIntegrityError> {
    let mut file = fs::File::open(path).map_err(|source| ModelIntegrityError::Open {
        path: path.to_path_buf(),
        source,
    })?;

    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];

    loop {
        let n = file
            .read(&mut buf)
            .map_err(|source| ModelIntegrityError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

pub fn verify_file_sha256(
    name: &'static str,
    path: &Path,
    expected_sha256: &str,
) -> Result<(), ModelIntegrityError> {
    if !path.exists() {
        return Err(ModelIntegrityError::MissingModel {
            name,
            path: path.to_path_buf(),
        });
    }

    let digest = sha256_file_hex(path)?;
    if digest != expected_sha256 {
        return Err(ModelIntegrityError::ChecksumMismatch {
            name,
            path: path.to_path_buf(),
            expected: expected_sha256.to_string(),
            got: digest,
        });
    }

    Ok(())
}

/// Verify one manifest entry inside `model_dir`, returning its path.
pub fn verify_model(model: &ModelFile, model_dir: &Path) -> Result<PathBuf, ModelIntegrityError> {
    let path = model_dir.join(model.name);
    match model.sha256 {
        Some(expected) => verify_file_sha256(model.name, &path, expected)?,
        None if !path.is_file() => {
            return Err(ModelIntegrityError::MissingModel {
                name: model.name,
                path,
            })
        }
        None => {}
    }
    Ok(path)
}

/// Verify every manifest entry, failing on the first problem.
pub fn verify_models_dir(model_dir: &Path) -> Result<(), ModelIntegrityError> {
    for model in MODELS {
        verify_model(model, model_dir)?;
    }

    Ok(())
}
