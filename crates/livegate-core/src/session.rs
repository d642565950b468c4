//! Per-attempt liveness state machine.
//!
//! ```text
//!             all M frames pass            aperture > threshold
//!  CHECKING ────────────────────▶ ACTION_REQUIRED ──────────────────▶ PASSED
//!     ▲  ╲ (no challenge stage)         │ timeout / extraction failure  │
//!     │   ╲─────────────────────────────┼────────────────────────────▶ │
//!     └─────────────────────────────────┴───────────────────────────────┘
//!              face lost (any state), display timeout, capability error
//! ```
//!
//! The session is owned by the inference loop alone and needs no locking.
//! It never calls a model directly: the loop hands it a [`FaceProbe`] and the
//! session pulls only the signals its current state needs.

use std::fmt;
use std::time::{Duration, Instant};

use serde::Serialize;
use uuid::Uuid;

use crate::capability::CapabilityError;
use crate::embedding::{Embedding, VerificationResult};
use crate::history::RingBuffer;
use crate::liveness::{check_movement, passive_predicate, PassiveVerdict};
use crate::region::{FaceRegion, PositionSample};
use crate::state::ResultUpdate;

/// Named thresholds driving the state machine.
#[derive(Debug, Clone, PartialEq)]
pub struct LivenessConfig {
    /// Liveness classifier score a frame must exceed.
    pub confidence_threshold: f32,
    /// Number of consecutive passing frames required to leave CHECKING.
    pub stability_run_length: usize,
    /// Minimum normalised displacement of the tracked point between frames.
    pub movement_threshold: f32,
    /// Capacity of the position ring buffer.
    pub position_history_len: usize,
    /// Mouth aperture ratio that counts as an opened mouth.
    pub active_challenge_threshold: f32,
    /// When false, a completed stability run goes straight to extraction.
    pub require_active_challenge: bool,
    /// Give up on the challenge and start over after this long.
    pub challenge_timeout: Option<Duration>,
    /// How long a PASSED session (and its result) stays alive.
    pub success_display_duration: Duration,
    /// Whether a failing frame also drops the position history.
    pub failure_clears_positions: bool,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.9,
            stability_run_length: 10,
            movement_threshold: 0.002,
            position_history_len: 5,
            active_challenge_threshold: 0.35,
            require_active_challenge: true,
            challenge_timeout: Some(Duration::from_secs(10)),
            success_display_duration: Duration::from_secs(3),
            failure_clears_positions: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Checking,
    ActionRequired,
    Passed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Checking => "CHECKING",
            SessionState::ActionRequired => "ACTION_REQUIRED",
            SessionState::Passed => "PASSED",
        };
        f.write_str(s)
    }
}

/// Lazy access to the signals of the one face being tracked this cycle.
///
/// Implementations run the external capabilities on demand, so a state
/// that does not need a signal never pays for its inference.
pub trait FaceProbe {
    fn region(&self) -> FaceRegion;
    fn position(&self) -> PositionSample;
    fn liveness_score(&mut self) -> Result<f32, CapabilityError>;
    fn aperture_ratio(&mut self) -> Result<Option<f32>, CapabilityError>;
    fn embedding(&mut self) -> Result<Option<Embedding>, CapabilityError>;
}

/// What a single cycle did to the session.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// No face in the frame; the session was reset.
    NoFace { was_passed: bool },
    /// Still accumulating the stability run.
    Checking {
        verdict: PassiveVerdict,
        run: usize,
        required: usize,
    },
    /// The stability run completed and the subject must now act.
    ChallengeIssued,
    /// Waiting for the active challenge.
    AwaitingChallenge { aperture: Option<f32> },
    /// The challenge was not met in time; back to CHECKING.
    ChallengeTimedOut,
    /// A new result was produced this cycle.
    Verified(Box<VerificationResult>),
    /// The extractor found no usable face; back to CHECKING.
    ExtractionFailed,
    /// PASSED and still within the display window.
    Holding { remaining: Duration },
    /// PASSED display window elapsed; the session was reset.
    Expired,
}

impl Step {
    /// How the cached result in the shared store must change.
    pub fn result_update(&self) -> ResultUpdate {
        match self {
            Step::Verified(result) => ResultUpdate::Set(result.as_ref().clone()),
            Step::NoFace { .. }
            | Step::Expired
            | Step::ExtractionFailed
            | Step::ChallengeTimedOut => ResultUpdate::Clear,
            Step::Checking { .. }
            | Step::ChallengeIssued
            | Step::AwaitingChallenge { .. }
            | Step::Holding { .. } => ResultUpdate::Keep,
        }
    }
}

pub struct LivenessSession {
    config: LivenessConfig,
    state: SessionState,
    stability: RingBuffer<bool>,
    positions: RingBuffer<PositionSample>,
    action_confirmed: bool,
    passed_at: Option<Instant>,
    challenge_started: Option<Instant>,
    episode: Uuid,
}

impl LivenessSession {
    pub fn new(config: LivenessConfig) -> Self {
        Self {
            stability: RingBuffer::new(config.stability_run_length),
            positions: RingBuffer::new(config.position_history_len.max(2)),
            config,
            state: SessionState::Checking,
            action_confirmed: false,
            passed_at: None,
            challenge_started: None,
            episode: Uuid::new_v4(),
        }
    }

    pub fn config(&self) -> &LivenessConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Current stability run length and the length required.
    pub fn progress(&self) -> (usize, usize) {
        (self.stability.len(), self.stability.capacity())
    }

    pub fn stability_history(&self) -> Vec<bool> {
        self.stability.to_vec()
    }

    pub fn position_count(&self) -> usize {
        self.positions.len()
    }

    pub fn action_confirmed(&self) -> bool {
        self.action_confirmed
    }

    pub fn passed_at(&self) -> Option<Instant> {
        self.passed_at
    }

    pub fn episode(&self) -> Uuid {
        self.episode
    }

    /// Start a fresh episode in CHECKING with empty histories.
    pub fn reset(&mut self) {
        self.state = SessionState::Checking;
        self.stability.clear();
        self.positions.clear();
        self.action_confirmed = false;
        self.passed_at = None;
        self.challenge_started = None;
        self.episode = Uuid::new_v4();
    }

    /// The frame contained no face. Valid in every state.
    pub fn on_no_face(&mut self) -> Step {
        let was_passed = self.state == SessionState::Passed;
        let had_progress = !self.stability.is_empty() || self.state != SessionState::Checking;
        self.reset();
        if had_progress {
            tracing::debug!(was_passed, "face lost, session reset");
        }
        Step::NoFace { was_passed }
    }

    /// Advance by one cycle with a detected face.
    ///
    /// A capability error leaves the session untouched; the caller decides
    /// how to recover (the inference loop resets).
    pub fn advance(&mut self, face: &mut dyn FaceProbe, now: Instant) -> Result<Step, CapabilityError> {
        match self.state {
            SessionState::Checking => self.check_passive(face, now),
            SessionState::ActionRequired => self.check_challenge(face, now),
            SessionState::Passed => Ok(self.hold(now)),
        }
    }

    fn check_passive(&mut self, face: &mut dyn FaceProbe, now: Instant) -> Result<Step, CapabilityError> {
        let confidence = face.liveness_score()?;
        let position = face.position();
        self.positions.push(position);

        let movement = check_movement(&self.positions.to_vec(), self.config.movement_threshold);
        let verdict = passive_predicate(confidence, self.config.confidence_threshold, movement);

        if verdict.passed {
            self.stability.push(true);
        } else {
            // Strict run: no partial credit survives a failing frame.
            self.stability.clear();
            if self.config.failure_clears_positions {
                self.positions.clear();
                self.positions.push(position);
            }
        }

        let (run, required) = self.progress();
        tracing::debug!(
            confidence = verdict.confidence,
            displacement = verdict.movement.displacement,
            passed = verdict.passed,
            run,
            required,
            "passive check"
        );

        if !self.stability.is_full() {
            return Ok(Step::Checking {
                verdict,
                run,
                required,
            });
        }

        if self.config.require_active_challenge {
            self.state = SessionState::ActionRequired;
            self.challenge_started = Some(now);
            tracing::info!(episode = %self.episode, "stability run complete, challenge issued");
            Ok(Step::ChallengeIssued)
        } else {
            tracing::info!(episode = %self.episode, "stability run complete, extracting embedding");
            self.extract(face, now)
        }
    }

    fn check_challenge(&mut self, face: &mut dyn FaceProbe, now: Instant) -> Result<Step, CapabilityError> {
        if let (Some(timeout), Some(started)) = (self.config.challenge_timeout, self.challenge_started) {
            if now.saturating_duration_since(started) > timeout {
                tracing::info!(episode = %self.episode, "challenge timed out");
                self.reset();
                return Ok(Step::ChallengeTimedOut);
            }
        }

        let aperture = face.aperture_ratio()?;
        let satisfied = aperture.is_some_and(|ratio| ratio > self.config.active_challenge_threshold);
        tracing::debug!(?aperture, satisfied, "active challenge");

        if satisfied {
            self.extract(face, now)
        } else {
            Ok(Step::AwaitingChallenge { aperture })
        }
    }

    fn extract(&mut self, face: &mut dyn FaceProbe, now: Instant) -> Result<Step, CapabilityError> {
        let Some(embedding) = face.embedding()? else {
            // Make the subject re-establish passive stability rather than
            // retrying extraction on the next frame.
            tracing::warn!(episode = %self.episode, "embedding extraction found no face");
            self.reset();
            return Ok(Step::ExtractionFailed);
        };

        self.action_confirmed = self.state == SessionState::ActionRequired;
        self.passed_at = Some(now);
        self.challenge_started = None;
        self.state = SessionState::Passed;

        let result = VerificationResult {
            episode: self.episode,
            embedding,
            region: face.region(),
            liveness_passed: true,
            action_confirmed: self.action_confirmed,
            captured_at: chrono::Utc::now(),
        };
        tracing::info!(
            episode = %self.episode,
            dim = result.embedding.dim(),
            action_confirmed = self.action_confirmed,
            "verification passed"
        );
        Ok(Step::Verified(Box::new(result)))
    }

    fn hold(&mut self, now: Instant) -> Step {
        let passed_at = *self.passed_at.get_or_insert(now);
        let elapsed = now.saturating_duration_since(passed_at);
        let display = self.config.success_display_duration;
        if elapsed > display {
            tracing::info!(episode = %self.episode, "success display elapsed, session reset");
            self.reset();
            Step::Expired
        } else {
            Step::Holding {
                remaining: display - elapsed,
            }
        }
    }
}
