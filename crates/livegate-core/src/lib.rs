//! Livegate core library.
//!
//! Holds everything that is independent of where frames come from and which
//! models run on them: the frame and result types, the capability traits the
//! inference loop calls into, the liveness state machine, and the shared
//! store that sits between the ingestion loop, the inference loop and the
//! readers.

pub mod annotate;
pub mod capability;
pub mod embedding;
pub mod frame;
pub mod history;
pub mod liveness;
pub mod region;
pub mod session;
pub mod state;

pub use capability::{
    Capabilities, CapabilityError, ChallengeEstimator, Detection, EmbeddingExtractor,
    FaceDetector, LivenessClassifier,
};
pub use embedding::{Embedding, VerificationResult, EMBEDDING_DIM};
pub use frame::Frame;
pub use region::{FaceRegion, PositionSample};
pub use session::{FaceProbe, LivenessConfig, LivenessSession, SessionState, Step};
pub use state::{FrameSnapshot, ProcessedFrame, ResultUpdate, SharedState};

/// Default directory for ONNX model files.
///
/// `/var/lib/livegate/models` when running as a system service, otherwise
/// `$XDG_DATA_HOME/livegate/models`.
pub fn default_model_dir() -> std::path::PathBuf {
    let system = std::path::PathBuf::from("/var/lib/livegate/models");
    if system.is_dir() {
        return system;
    }
    let data_home = std::env::var("XDG_DATA_HOME").unwrap_or_else(|_| {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
        format!("{home}/.local/share")
    });
    std::path::PathBuf::from(data_home).join("livegate/models")
}
