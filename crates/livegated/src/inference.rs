//! Inference loop: one strictly sequential cycle at a time over the newest
//! frame, driving the liveness session and publishing the outcome.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use livegate_core::annotate::{annotate, Overlay, Tone};
use livegate_core::{
    Capabilities, CapabilityError, ChallengeEstimator, Detection, Embedding, EmbeddingExtractor,
    FaceProbe, FaceRegion, Frame, LivenessClassifier, LivenessConfig, LivenessSession,
    PositionSample, ProcessedFrame, ResultUpdate, SessionState, SharedState, Step,
};

use crate::signal::StopSignal;
use crate::stats::Stats;

/// What one call to [`InferenceLoop::run_cycle`] did.
#[derive(Debug, PartialEq)]
pub enum Cycle {
    /// Nothing captured yet (or the stream was just cut).
    NoFrame,
    /// The newest frame was already processed.
    Unchanged,
    /// A required capability is unavailable; the frame was annotated only.
    Unavailable,
    /// A capability failed; the session was reset.
    Failed,
    Stepped(Step),
}

pub struct InferenceLoop {
    capabilities: Capabilities,
    session: LivenessSession,
    state: SharedState,
    stats: Arc<Stats>,
    one_shot: bool,
    last_seq: Option<u64>,
    epoch: u64,
}

/// `config` as it can actually run with `capabilities`: without a challenge
/// estimator the active challenge stage is skipped.
pub fn effective_liveness(mut config: LivenessConfig, capabilities: &Capabilities) -> LivenessConfig {
    if config.require_active_challenge && capabilities.challenge.is_none() {
        tracing::warn!("challenge estimator unavailable, skipping the active challenge stage");
        config.require_active_challenge = false;
    }
    config
}

impl InferenceLoop {
    pub fn new(
        capabilities: Capabilities,
        config: LivenessConfig,
        one_shot: bool,
        state: SharedState,
        stats: Arc<Stats>,
    ) -> Self {
        let config = effective_liveness(config, &capabilities);
        let epoch = state.epoch();
        Self {
            capabilities,
            session: LivenessSession::new(config),
            state,
            stats,
            one_shot,
            last_seq: None,
            epoch,
        }
    }

    #[cfg(test)]
    pub fn session(&self) -> &LivenessSession {
        &self.session
    }

    /// Hand the capabilities back so the service can restart later.
    pub fn into_capabilities(self) -> Capabilities {
        self.capabilities
    }

    /// Run cycles every `period` until `stop` is triggered. A cycle in flight
    /// always runs to completion.
    pub fn run(&mut self, stop: &StopSignal, period: Duration) {
        tracing::info!(period_ms = period.as_millis() as u64, "inference loop started");
        loop {
            self.guarded_cycle(Instant::now());
            if stop.wait(period) {
                break;
            }
        }
        tracing::info!("inference loop stopped");
    }

    pub fn run_cycle(&mut self, now: Instant) -> Cycle {
        let Some(snapshot) = self.state.read_latest_frame() else {
            return Cycle::NoFrame;
        };

        if snapshot.epoch != self.epoch {
            tracing::info!(epoch = snapshot.epoch, "new stream epoch, session reset");
            self.epoch = snapshot.epoch;
            self.session.reset();
        } else if self.last_seq == Some(snapshot.seq) {
            return Cycle::Unchanged;
        }
        self.last_seq = Some(snapshot.seq);

        if self.one_shot && self.state.acknowledge_consumed() {
            tracing::info!("result consumed, starting a new episode");
            self.session.reset();
        }

        self.stats.inference_cycle();
        let frame = snapshot.frame;
        let epoch = snapshot.epoch;

        let Some(detector) = self.capabilities.detector.as_deref_mut() else {
            self.publish_unavailable(frame, None, epoch);
            return Cycle::Unavailable;
        };

        let detection = match detector.detect(&frame) {
            Ok(detections) => largest(detections),
            Err(e) => return self.fail(frame, e, epoch),
        };

        let Some(detection) = detection else {
            let step = self.session.on_no_face();
            self.publish(frame, &step, None, epoch);
            return Cycle::Stepped(step);
        };
        self.stats.face_detected();

        let caps = &mut self.capabilities;
        let (Some(classifier), Some(extractor)) =
            (caps.classifier.as_deref_mut(), caps.extractor.as_deref_mut())
        else {
            self.publish_unavailable(frame, Some(detection.region), epoch);
            return Cycle::Unavailable;
        };

        let mut probe = CycleProbe {
            frame: &frame,
            detection: &detection,
            crop: None,
            classifier,
            challenge: match caps.challenge.as_deref_mut() {
                Some(challenge) => Some(challenge),
                None => None,
            },
            extractor,
        };
        let step = match self.session.advance(&mut probe, now) {
            Ok(step) => step,
            Err(e) => return self.fail(frame, e, epoch),
        };

        if matches!(step, Step::Verified(_)) {
            self.stats.result_produced();
        }
        self.publish(frame, &step, Some(detection.region), epoch);
        Cycle::Stepped(step)
    }

    /// [`run_cycle`](Self::run_cycle), with a panic raised inside a capability
    /// handled like a capability error so the thread survives it.
    pub fn guarded_cycle(&mut self, now: Instant) -> Cycle {
        match panic::catch_unwind(AssertUnwindSafe(|| self.run_cycle(now))) {
            Ok(cycle) => cycle,
            Err(payload) => {
                tracing::error!(panic = %panic_message(&*payload), "capability panicked, session reset");
                self.stats.capability_error();
                self.session.reset();
                if let Some(snapshot) = self.state.read_latest_frame() {
                    self.publish_error(snapshot.frame, snapshot.epoch);
                }
                Cycle::Failed
            }
        }
    }

    fn fail(&mut self, frame: Frame, error: CapabilityError, epoch: u64) -> Cycle {
        tracing::error!(error = %error, "capability failed, session reset");
        self.stats.capability_error();
        self.session.reset();
        self.publish_error(frame, epoch);
        Cycle::Failed
    }

    fn publish_error(&mut self, frame: Frame, epoch: u64) {
        let processed = ProcessedFrame {
            frame: annotate(frame, &Overlay::new(Tone::Alert)),
            caption: "ERROR".to_string(),
            state: Some(self.session.state()),
        };
        self.state.publish_processed(processed, ResultUpdate::Clear, epoch);
    }

    fn publish_unavailable(&mut self, frame: Frame, region: Option<FaceRegion>, epoch: u64) {
        let mut overlay = Overlay::new(Tone::Alert);
        if let Some(region) = region {
            overlay = overlay.with_region(region);
        }
        let caption = format!("UNAVAILABLE: {}", self.capabilities.missing().join(", "));
        let processed = ProcessedFrame {
            frame: annotate(frame, &overlay),
            caption,
            state: None,
        };
        self.state.publish_processed(processed, ResultUpdate::Clear, epoch);
    }

    fn publish(&mut self, frame: Frame, step: &Step, region: Option<FaceRegion>, epoch: u64) {
        let (run, required) = self.session.progress();
        let state = self.session.state();

        let (tone, caption) = match step {
            Step::NoFace { .. } => (Tone::Idle, "NO FACE".to_string()),
            Step::Checking { .. } | Step::ChallengeTimedOut | Step::ExtractionFailed => {
                (Tone::Checking, format!("CHECKING {run}/{required}"))
            }
            Step::ChallengeIssued | Step::AwaitingChallenge { .. } => {
                (Tone::Action, "OPEN YOUR MOUTH".to_string())
            }
            Step::Verified(_) | Step::Holding { .. } => (Tone::Success, "PASSED".to_string()),
            Step::Expired => (Tone::Idle, format!("CHECKING {run}/{required}")),
        };

        let mut overlay = Overlay::new(tone);
        if let Some(region) = region {
            overlay = overlay.with_region(region);
        }
        if state == SessionState::Checking && region.is_some() {
            overlay = overlay.with_progress(run, required);
        }

        let processed = ProcessedFrame {
            frame: annotate(frame, &overlay),
            caption,
            state: Some(state),
        };
        if !self.state.publish_processed(processed, step.result_update(), epoch) {
            tracing::debug!(epoch, "stream cut during cycle, outcome discarded");
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

/// The face the session tracks: the largest detection.
fn largest(detections: Vec<Detection>) -> Option<Detection> {
    detections.into_iter().max_by_key(|d| d.region.area())
}

/// Runs the capabilities for the tracked face on demand.
struct CycleProbe<'a> {
    frame: &'a Frame,
    detection: &'a Detection,
    crop: Option<Option<Frame>>,
    classifier: &'a mut dyn LivenessClassifier,
    challenge: Option<&'a mut dyn ChallengeEstimator>,
    extractor: &'a mut dyn EmbeddingExtractor,
}

impl CycleProbe<'_> {
    fn ensure_crop(&mut self) {
        if self.crop.is_none() {
            self.crop = Some(self.detection.region.crop(self.frame));
        }
    }
}

impl FaceProbe for CycleProbe<'_> {
    fn region(&self) -> FaceRegion {
        self.detection.region
    }

    fn position(&self) -> PositionSample {
        self.detection
            .tracked_position(self.frame.width(), self.frame.height())
    }

    fn liveness_score(&mut self) -> Result<f32, CapabilityError> {
        self.classifier.score(self.frame, &self.detection.region)
    }

    fn aperture_ratio(&mut self) -> Result<Option<f32>, CapabilityError> {
        self.ensure_crop();
        let crop = self.crop.as_ref().and_then(Option::as_ref);
        match (self.challenge.as_deref_mut(), crop) {
            (Some(challenge), Some(crop)) => challenge.aperture_ratio(crop),
            _ => Ok(None),
        }
    }

    fn embedding(&mut self) -> Result<Option<Embedding>, CapabilityError> {
        self.ensure_crop();
        match self.crop.as_ref().and_then(Option::as_ref) {
            Some(crop) => self.extractor.embed(crop),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use livegate_core::FaceDetector;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Detector whose face drifts 4 px per call while `present` is set.
    struct DriftingDetector {
        present: Arc<AtomicBool>,
        calls: i32,
    }

    impl FaceDetector for DriftingDetector {
        fn detect(&mut self, _frame: &Frame) -> Result<Vec<Detection>, CapabilityError> {
            self.calls += 1;
            if !self.present.load(Ordering::SeqCst) {
                return Ok(Vec::new());
            }
            let x = 20 + (self.calls % 2) * 4;
            Ok(vec![
                Detection::new(FaceRegion::new(x, 20, 40, 40), 0.95),
                Detection::new(FaceRegion::new(0, 0, 5, 5), 0.6),
            ])
        }
    }

    struct FixedClassifier {
        score: f32,
        fail: Arc<AtomicBool>,
    }

    impl LivenessClassifier for FixedClassifier {
        fn score(&mut self, _frame: &Frame, _region: &FaceRegion) -> Result<f32, CapabilityError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(CapabilityError::Inference {
                    capability: "liveness_classifier",
                    message: "session crashed".to_string(),
                });
            }
            Ok(self.score)
        }
    }

    struct OpenMouth;

    impl ChallengeEstimator for OpenMouth {
        fn aperture_ratio(&mut self, _face_crop: &Frame) -> Result<Option<f32>, CapabilityError> {
            Ok(Some(0.8))
        }
    }

    struct ConstantExtractor;

    impl EmbeddingExtractor for ConstantExtractor {
        fn embed(&mut self, face_crop: &Frame) -> Result<Option<Embedding>, CapabilityError> {
            assert_eq!((face_crop.width(), face_crop.height()), (40, 40));
            Ok(Some(Embedding::new(vec![0.25; 512])))
        }
    }

    struct Harness {
        state: SharedState,
        stats: Arc<Stats>,
        present: Arc<AtomicBool>,
        fail: Arc<AtomicBool>,
        inference: InferenceLoop,
    }

    fn harness(run: usize, challenge: bool, one_shot: bool) -> Harness {
        let state = SharedState::new();
        let stats = Arc::new(Stats::new());
        let present = Arc::new(AtomicBool::new(true));
        let fail = Arc::new(AtomicBool::new(false));
        let capabilities = Capabilities {
            detector: Some(Box::new(DriftingDetector {
                present: present.clone(),
                calls: 0,
            })),
            classifier: Some(Box::new(FixedClassifier {
                score: 0.99,
                fail: fail.clone(),
            })),
            challenge: challenge.then(|| Box::new(OpenMouth) as Box<dyn ChallengeEstimator>),
            extractor: Some(Box::new(ConstantExtractor)),
        };
        let config = LivenessConfig {
            stability_run_length: run,
            ..LivenessConfig::default()
        };
        let inference = InferenceLoop::new(capabilities, config, one_shot, state.clone(), stats.clone());
        Harness {
            state,
            stats,
            present,
            fail,
            inference,
        }
    }

    impl Harness {
        fn cycle(&mut self) -> Cycle {
            self.state.publish_frame(Frame::filled(100, 100, [50, 50, 50]));
            self.inference.run_cycle(Instant::now())
        }
    }

    #[test]
    fn test_no_frame_skips_cycle() {
        let mut h = harness(3, true, false);
        assert_eq!(h.inference.run_cycle(Instant::now()), Cycle::NoFrame);
        assert_eq!(h.stats.snapshot().inference_cycles, 0);
    }

    #[test]
    fn test_same_frame_not_processed_twice() {
        let mut h = harness(3, true, false);
        assert!(matches!(h.cycle(), Cycle::Stepped(Step::Checking { run: 1, .. })));
        assert_eq!(h.inference.run_cycle(Instant::now()), Cycle::Unchanged);
        assert_eq!(h.inference.session().progress().0, 1);
    }

    #[test]
    fn test_full_episode_publishes_result() {
        let mut h = harness(3, true, false);
        h.cycle();
        h.cycle();
        assert_eq!(h.cycle(), Cycle::Stepped(Step::ChallengeIssued));
        assert_eq!(h.state.read_latest_processed_frame().unwrap().caption, "OPEN YOUR MOUTH");
        assert!(h.state.read_result().is_none());

        assert!(matches!(h.cycle(), Cycle::Stepped(Step::Verified(_))));
        let result = h.state.read_result().unwrap();
        assert!(result.liveness_passed);
        assert!(result.action_confirmed);
        assert_eq!(result.embedding.dim(), 512);
        let processed = h.state.read_latest_processed_frame().unwrap();
        assert_eq!(processed.caption, "PASSED");
        assert_eq!(processed.state, Some(SessionState::Passed));
        assert_eq!(h.stats.snapshot().results_produced, 1);

        // Holding keeps the result
        assert!(matches!(h.cycle(), Cycle::Stepped(Step::Holding { .. })));
        assert!(h.state.read_result().is_some());
    }

    #[test]
    fn test_missing_challenge_skips_stage() {
        let mut h = harness(2, false, false);
        h.cycle();
        assert!(matches!(h.cycle(), Cycle::Stepped(Step::Verified(_))));
        assert!(!h.state.read_result().unwrap().action_confirmed);
    }

    #[test]
    fn test_face_loss_clears_result() {
        let mut h = harness(1, false, false);
        assert!(matches!(h.cycle(), Cycle::Stepped(Step::Verified(_))));
        assert!(h.state.read_result().is_some());

        h.present.store(false, Ordering::SeqCst);
        assert_eq!(h.cycle(), Cycle::Stepped(Step::NoFace { was_passed: true }));
        assert!(h.state.read_result().is_none());
        assert_eq!(h.inference.session().state(), SessionState::Checking);
        assert_eq!(h.state.read_latest_processed_frame().unwrap().caption, "NO FACE");
    }

    #[test]
    fn test_capability_error_resets_session() {
        let mut h = harness(5, true, false);
        h.cycle();
        h.cycle();
        assert_eq!(h.inference.session().progress().0, 2);

        h.fail.store(true, Ordering::SeqCst);
        assert_eq!(h.cycle(), Cycle::Failed);
        assert_eq!(h.inference.session().progress().0, 0);
        assert_eq!(h.stats.snapshot().capability_errors, 1);
        assert_eq!(h.state.read_latest_processed_frame().unwrap().caption, "ERROR");

        // The loop carries on with the next frame
        h.fail.store(false, Ordering::SeqCst);
        assert!(matches!(h.cycle(), Cycle::Stepped(Step::Checking { run: 1, .. })));
    }

    /// Panics on its first call only.
    struct PanicOnce {
        calls: usize,
    }

    impl LivenessClassifier for PanicOnce {
        fn score(&mut self, _frame: &Frame, _region: &FaceRegion) -> Result<f32, CapabilityError> {
            self.calls += 1;
            if self.calls == 1 {
                panic!("runtime aborted");
            }
            Ok(0.99)
        }
    }

    #[test]
    fn test_capability_panic_does_not_end_loop() {
        let state = SharedState::new();
        let stats = Arc::new(Stats::new());
        let capabilities = Capabilities {
            detector: Some(Box::new(DriftingDetector {
                present: Arc::new(AtomicBool::new(true)),
                calls: 0,
            })),
            classifier: Some(Box::new(PanicOnce { calls: 0 })),
            challenge: None,
            extractor: Some(Box::new(ConstantExtractor)),
        };
        let config = LivenessConfig {
            stability_run_length: 3,
            ..LivenessConfig::default()
        };
        let mut inference = InferenceLoop::new(capabilities, config, false, state.clone(), stats.clone());

        state.publish_frame(Frame::filled(100, 100, [50, 50, 50]));
        assert_eq!(inference.guarded_cycle(Instant::now()), Cycle::Failed);
        assert_eq!(stats.snapshot().capability_errors, 1);
        assert_eq!(state.read_latest_processed_frame().unwrap().caption, "ERROR");
        assert!(state.read_result().is_none());

        state.publish_frame(Frame::filled(100, 100, [50, 50, 50]));
        assert!(matches!(
            inference.guarded_cycle(Instant::now()),
            Cycle::Stepped(Step::Checking { run: 1, .. })
        ));
    }

    #[test]
    fn test_effective_liveness_without_challenge() {
        let config = LivenessConfig::default();
        assert!(config.require_active_challenge);
        assert!(!effective_liveness(config.clone(), &Capabilities::default()).require_active_challenge);

        let capabilities = Capabilities {
            challenge: Some(Box::new(OpenMouth)),
            ..Capabilities::default()
        };
        assert!(effective_liveness(config, &capabilities).require_active_challenge);
    }

    #[test]
    fn test_stream_cut_resets_session() {
        let mut h = harness(5, true, false);
        h.cycle();
        h.cycle();
        h.state.cut_stream();
        assert_eq!(h.inference.run_cycle(Instant::now()), Cycle::NoFrame);

        assert!(matches!(h.cycle(), Cycle::Stepped(Step::Checking { run: 1, .. })));
    }

    #[test]
    fn test_one_shot_resets_after_take() {
        let mut h = harness(1, false, true);
        assert!(matches!(h.cycle(), Cycle::Stepped(Step::Verified(_))));
        let first = h.state.take_result().unwrap();

        // Consumption starts a new episode instead of holding
        assert!(matches!(h.cycle(), Cycle::Stepped(Step::Verified(_))));
        let second = h.state.read_result().unwrap();
        assert_ne!(first.episode, second.episode);
    }

    #[test]
    fn test_missing_detector_still_publishes_preview() {
        let state = SharedState::new();
        let mut inference = InferenceLoop::new(
            Capabilities::default(),
            LivenessConfig::default(),
            false,
            state.clone(),
            Arc::new(Stats::new()),
        );
        state.publish_frame(Frame::filled(10, 10, [0, 0, 0]));
        assert_eq!(inference.run_cycle(Instant::now()), Cycle::Unavailable);
        let processed = state.read_latest_processed_frame().unwrap();
        assert!(processed.caption.starts_with("UNAVAILABLE: face_detector"));
        assert!(state.read_result().is_none());
    }

    #[test]
    fn test_largest_detection_is_tracked() {
        let small = Detection::new(FaceRegion::new(0, 0, 5, 5), 0.99);
        let big = Detection::new(FaceRegion::new(10, 10, 50, 50), 0.7);
        assert_eq!(largest(vec![small, big.clone()]), Some(big));
        assert_eq!(largest(Vec::new()), None);
    }
}
