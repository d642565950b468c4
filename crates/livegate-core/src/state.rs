//! The single structure shared between the ingestion loop, the inference
//! loop and external readers.
//!
//! Every accessor is one short critical section that only moves or clones
//! data. Model inference always happens on a private copy outside the lock,
//! and only the final write comes back here.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::embedding::VerificationResult;
use crate::frame::Frame;
use crate::session::SessionState;

/// A private copy of the most recent raw frame.
#[derive(Clone, Debug)]
pub struct FrameSnapshot {
    /// Monotonic publish counter, unique per frame.
    pub seq: u64,
    /// Stream epoch the frame belongs to; bumped on every stream cut.
    pub epoch: u64,
    pub frame: Frame,
}

/// An annotated frame ready for display.
#[derive(Clone, Debug)]
pub struct ProcessedFrame {
    pub frame: Frame,
    /// Short human-readable status, e.g. `CHECKING 4/10`.
    pub caption: String,
    pub state: Option<SessionState>,
}

/// How a publish changes the cached verification result.
#[derive(Clone, Debug, PartialEq)]
pub enum ResultUpdate {
    Keep,
    Set(VerificationResult),
    Clear,
}

#[derive(Default)]
struct Inner {
    latest_frame: Option<Frame>,
    frame_seq: u64,
    epoch: u64,
    processed: Option<ProcessedFrame>,
    latest_result: Option<VerificationResult>,
    result_consumed: bool,
}

/// Mutex-guarded holder of the latest raw frame, the latest processed frame
/// and the latest verification result. Cloning shares the same store.
#[derive(Clone, Default)]
pub struct SharedState {
    inner: Arc<Mutex<Inner>>,
}

impl SharedState {
    pub fn new() -> Self {
        Self::default()
    }

    // Every critical section leaves `Inner` consistent, so a panic while
    // holding the lock cannot leave a torn value behind.
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the latest raw frame. Returns its sequence number.
    pub fn publish_frame(&self, frame: Frame) -> u64 {
        let mut inner = self.lock();
        inner.frame_seq += 1;
        inner.latest_frame = Some(frame);
        inner.frame_seq
    }

    /// Deep copy of the latest raw frame, `None` before the first capture
    /// or right after a stream cut.
    pub fn read_latest_frame(&self) -> Option<FrameSnapshot> {
        let inner = self.lock();
        inner.latest_frame.as_ref().map(|frame| FrameSnapshot {
            seq: inner.frame_seq,
            epoch: inner.epoch,
            frame: frame.clone(),
        })
    }

    /// Atomically replace the processed frame and apply `update` to the
    /// cached result.
    ///
    /// Work derived from a frame of an earlier stream epoch is discarded so
    /// a result computed just before a stream cut cannot outlive it.
    /// Returns whether the publish was applied.
    pub fn publish_processed(&self, processed: ProcessedFrame, update: ResultUpdate, epoch: u64) -> bool {
        let mut inner = self.lock();
        if inner.epoch != epoch {
            return false;
        }
        inner.processed = Some(processed);
        match update {
            ResultUpdate::Keep => {}
            ResultUpdate::Set(result) => {
                inner.latest_result = Some(result);
                inner.result_consumed = false;
            }
            ResultUpdate::Clear => inner.latest_result = None,
        }
        true
    }

    /// Deep copy of the cached result, if any.
    pub fn read_result(&self) -> Option<VerificationResult> {
        self.lock().latest_result.clone()
    }

    /// Remove and return the cached result, marking it consumed.
    pub fn take_result(&self) -> Option<VerificationResult> {
        let mut inner = self.lock();
        let result = inner.latest_result.take();
        if result.is_some() {
            inner.result_consumed = true;
        }
        result
    }

    /// Returns true once per `take_result` that removed a result.
    pub fn acknowledge_consumed(&self) -> bool {
        std::mem::take(&mut self.lock().result_consumed)
    }

    pub fn read_latest_processed_frame(&self) -> Option<ProcessedFrame> {
        self.lock().processed.clone()
    }

    /// The stream was interrupted: drop the stale frame and result and start
    /// a new epoch. Returns the new epoch.
    pub fn cut_stream(&self) -> u64 {
        let mut inner = self.lock();
        inner.latest_frame = None;
        inner.latest_result = None;
        inner.result_consumed = false;
        inner.epoch += 1;
        inner.epoch
    }

    pub fn epoch(&self) -> u64 {
        self.lock().epoch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::Embedding;
    use crate::region::FaceRegion;
    use std::thread;

    fn result_with(k: i32) -> VerificationResult {
        VerificationResult {
            episode: uuid::Uuid::new_v4(),
            embedding: Embedding::new(vec![k as f32; 512]),
            region: FaceRegion::new(k, k, 10, 10),
            liveness_passed: true,
            action_confirmed: true,
            captured_at: chrono::Utc::now(),
        }
    }

    fn processed(rgb: u8) -> ProcessedFrame {
        ProcessedFrame {
            frame: Frame::filled(2, 2, [rgb, rgb, rgb]),
            caption: String::new(),
            state: None,
        }
    }

    #[test]
    fn test_empty_store() {
        let store = SharedState::new();
        assert!(store.read_latest_frame().is_none());
        assert!(store.read_result().is_none());
        assert!(store.read_latest_processed_frame().is_none());
    }

    #[test]
    fn test_read_returns_independent_copy() {
        let store = SharedState::new();
        let seq = store.publish_frame(Frame::filled(2, 2, [7, 7, 7]));
        assert_eq!(seq, 1);

        let mut snap = store.read_latest_frame().unwrap();
        snap.frame.data_mut()[0] = 0;
        assert_eq!(store.read_latest_frame().unwrap().frame.data()[0], 7);
    }

    #[test]
    fn test_sequence_increases_per_frame() {
        let store = SharedState::new();
        store.publish_frame(Frame::filled(1, 1, [0, 0, 0]));
        store.publish_frame(Frame::filled(1, 1, [1, 1, 1]));
        let snap = store.read_latest_frame().unwrap();
        assert_eq!(snap.seq, 2);
        assert_eq!(snap.frame.data(), &[1, 1, 1]);
    }

    #[test]
    fn test_publish_processed_applies_update() {
        let store = SharedState::new();
        assert!(store.publish_processed(processed(1), ResultUpdate::Set(result_with(3)), 0));
        assert_eq!(store.read_result().unwrap().region.x, 3);

        assert!(store.publish_processed(processed(2), ResultUpdate::Keep, 0));
        assert_eq!(store.read_result().unwrap().region.x, 3);
        assert_eq!(store.read_latest_processed_frame().unwrap().frame.data()[0], 2);

        assert!(store.publish_processed(processed(3), ResultUpdate::Clear, 0));
        assert!(store.read_result().is_none());
    }

    #[test]
    fn test_cut_stream_clears_frame_and_result() {
        let store = SharedState::new();
        store.publish_frame(Frame::filled(1, 1, [0, 0, 0]));
        store.publish_processed(processed(1), ResultUpdate::Set(result_with(1)), 0);

        assert_eq!(store.cut_stream(), 1);
        assert!(store.read_latest_frame().is_none());
        assert!(store.read_result().is_none());
        // The last preview stays available
        assert!(store.read_latest_processed_frame().is_some());
    }

    #[test]
    fn test_stale_epoch_publish_is_discarded() {
        let store = SharedState::new();
        store.publish_frame(Frame::filled(1, 1, [0, 0, 0]));
        let snap = store.read_latest_frame().unwrap();
        store.cut_stream();

        let applied =
            store.publish_processed(processed(9), ResultUpdate::Set(result_with(1)), snap.epoch);
        assert!(!applied);
        assert!(store.read_result().is_none());
        assert!(store.read_latest_processed_frame().is_none());
    }

    #[test]
    fn test_take_result_is_one_shot() {
        let store = SharedState::new();
        assert!(!store.acknowledge_consumed());
        store.publish_processed(processed(1), ResultUpdate::Set(result_with(5)), 0);

        assert_eq!(store.take_result().unwrap().region.x, 5);
        assert!(store.take_result().is_none());
        assert!(store.acknowledge_consumed());
        assert!(!store.acknowledge_consumed());
    }

    #[test]
    fn test_concurrent_readers_never_see_torn_result() {
        let store = SharedState::new();
        let writer_store = store.clone();

        let writer = thread::spawn(move || {
            for k in 1..2000 {
                let update = if k % 3 == 0 {
                    ResultUpdate::Clear
                } else {
                    ResultUpdate::Set(result_with(k))
                };
                writer_store.publish_processed(processed(0), update, 0);
            }
        });

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let store = store.clone();
                thread::spawn(move || {
                    for _ in 0..2000 {
                        if let Some(result) = store.read_result() {
                            assert_eq!(result.embedding.dim(), 512);
                            let k = result.region.x as f32;
                            assert!(result.embedding.values.iter().all(|v| *v == k));
                            assert!(!result.region.is_empty());
                        }
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
    }
}
