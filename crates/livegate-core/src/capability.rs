//! Contracts for the external models the inference loop drives.
//!
//! Each capability is optional at runtime: a model that failed to load is
//! simply absent from [`Capabilities`] and the inference loop degrades.

use thiserror::Error;

use crate::embedding::Embedding;
use crate::frame::Frame;
use crate::region::{FaceRegion, PositionSample};

#[derive(Error, Debug)]
pub enum CapabilityError {
    #[error("{capability}: inference failed: {message}")]
    Inference {
        capability: &'static str,
        message: String,
    },
    #[error("{capability}: unexpected model output: {message}")]
    UnexpectedOutput {
        capability: &'static str,
        message: String,
    },
    #[error("invalid input frame: {0}")]
    InvalidInput(String),
}

/// Index of the nose tip in the 5-point landmark convention
/// (left eye, right eye, nose, left mouth corner, right mouth corner).
const NOSE: usize = 2;

/// One detected face.
#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    pub region: FaceRegion,
    pub confidence: f32,
    /// 5-point landmarks in pixel coordinates, when the detector provides them.
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl Detection {
    pub fn new(region: FaceRegion, confidence: f32) -> Self {
        Self {
            region,
            confidence,
            landmarks: None,
        }
    }

    /// The point tracked for movement analysis: the nose tip when landmarks
    /// are available, otherwise the region centre.
    pub fn tracked_position(&self, frame_width: u32, frame_height: u32) -> PositionSample {
        match self.landmarks {
            Some(points) => {
                let (x, y) = points[NOSE];
                PositionSample::from_pixels(x, y, frame_width, frame_height)
            }
            None => self.region.normalized_center(frame_width, frame_height),
        }
    }
}

/// Maps a frame to the faces it contains. An empty list is the normal
/// "no face" answer and must not be reported as an error.
pub trait FaceDetector: Send {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>, CapabilityError>;
}

/// Scores how likely the face in `region` belongs to a live subject.
/// The scale is model specific and compared against a configured threshold.
pub trait LivenessClassifier: Send {
    fn score(&mut self, frame: &Frame, region: &FaceRegion) -> Result<f32, CapabilityError>;
}

/// Estimates the mouth aperture ratio of a face crop, `None` when the
/// landmarks could not be placed.
pub trait ChallengeEstimator: Send {
    fn aperture_ratio(&mut self, face_crop: &Frame) -> Result<Option<f32>, CapabilityError>;
}

/// Extracts an identity embedding from a face crop, `None` when no face is
/// usable in the crop.
pub trait EmbeddingExtractor: Send {
    fn embed(&mut self, face_crop: &Frame) -> Result<Option<Embedding>, CapabilityError>;
}

/// The set of capabilities that loaded successfully.
#[derive(Default)]
pub struct Capabilities {
    pub detector: Option<Box<dyn FaceDetector>>,
    pub classifier: Option<Box<dyn LivenessClassifier>>,
    pub challenge: Option<Box<dyn ChallengeEstimator>>,
    pub extractor: Option<Box<dyn EmbeddingExtractor>>,
}

impl Capabilities {
    /// Names of the capabilities that are missing, for status reporting.
    pub fn missing(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.detector.is_none() {
            missing.push("face_detector");
        }
        if self.classifier.is_none() {
            missing.push("liveness_classifier");
        }
        if self.challenge.is_none() {
            missing.push("challenge_estimator");
        }
        if self.extractor.is_none() {
            missing.push("embedding_extractor");
        }
        missing
    }

    /// Whether a verification episode can produce a result at all.
    ///
    /// The active challenge is optional; the passive check is not.
    pub fn can_verify(&self) -> bool {
        self.detector.is_some() && self.classifier.is_some() && self.extractor.is_some()
    }
}
