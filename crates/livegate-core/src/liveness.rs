//! Passive liveness signals: classifier confidence plus involuntary movement.
//!
//! A static photograph held in front of the camera produces a tracked facial
//! point that stays put from frame to frame. A live person shows small,
//! involuntary head and eye motion even when trying to hold still. Combining
//! that movement gate with the liveness classifier score gives the per-frame
//! passive predicate the session accumulates into a stability run.
//!
//! # Threat Coverage
//!
//! - **Blocks:** Printed photographs, still images on a screen, replays that
//!   only intermittently fool the classifier (the session requires an
//!   unbroken run).
//! - **Does not block:** High-quality video replays on their own; the active
//!   challenge stage covers those.

use crate::region::PositionSample;

/// Result of the movement check over the position history.
#[derive(Debug, Clone, PartialEq)]
pub struct MovementCheck {
    /// Whether the tracked point moved enough (true = likely live).
    pub is_moving: bool,
    /// Normalised displacement between the two most recent samples.
    pub displacement: f32,
    /// Number of consecutive sample pairs available in the history.
    pub frame_pairs_available: usize,
}

/// Check whether the most recent pair of position samples moved by more
/// than `min_displacement` (normalised frame units).
///
/// Passes through (`is_moving = true`) while fewer than 2 samples exist,
/// since the check needs at least one frame pair.
pub fn check_movement(samples: &[PositionSample], min_displacement: f32) -> MovementCheck {
    let [.., prev, curr] = samples else {
        return MovementCheck {
            is_moving: true, // cannot determine yet
            displacement: 0.0,
            frame_pairs_available: 0,
        };
    };

    let displacement = curr.distance(prev);
    MovementCheck {
        is_moving: displacement > min_displacement,
        displacement,
        frame_pairs_available: samples.len() - 1,
    }
}

/// Per-frame outcome of the passive liveness predicate.
#[derive(Debug, Clone, PartialEq)]
pub struct PassiveVerdict {
    pub passed: bool,
    pub confidence: f32,
    pub movement: MovementCheck,
}

/// `confidence > confidence_threshold` AND the movement gate.
pub fn passive_predicate(
    confidence: f32,
    confidence_threshold: f32,
    movement: MovementCheck,
) -> PassiveVerdict {
    PassiveVerdict {
        passed: confidence > confidence_threshold && movement.is_moving,
        confidence,
        movement,
    }
}
