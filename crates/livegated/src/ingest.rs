//! Ingestion loop: keeps the newest frame of the feed in the shared store.
//!
//! ```text
//!   CONNECTING ──open ok──▶ STREAMING
//!      ▲   │                   │
//!      │   └─open failed:      │ read failed: release handle,
//!      │     sleep, retry      │ cut the stream, sleep
//!      └───────────────────────┘
//! ```
//!
//! Connection loss is never fatal; only a stop request ends the loop.

use std::sync::Arc;
use std::time::{Duration, Instant};

use livegate_core::SharedState;
use livegate_hw::{FrameSource, SourceOpener};

use crate::signal::StopSignal;
use crate::stats::Stats;

#[derive(Debug, Clone, Copy)]
pub struct IngestSettings {
    pub reconnect_delay: Duration,
    pub period: Duration,
}

pub struct IngestLoop {
    opener: Arc<dyn SourceOpener>,
    state: SharedState,
    stats: Arc<Stats>,
    settings: IngestSettings,
}

enum Phase {
    Connecting,
    Streaming(Box<dyn FrameSource>),
}

impl IngestLoop {
    pub fn new(
        opener: Arc<dyn SourceOpener>,
        state: SharedState,
        stats: Arc<Stats>,
        settings: IngestSettings,
    ) -> Self {
        Self {
            opener,
            state,
            stats,
            settings,
        }
    }

    /// Run until `stop` is triggered. The source handle is dropped on return.
    pub fn run(&self, stop: &StopSignal) {
        let uri = self.opener.describe();
        tracing::info!(source = %uri, "ingestion loop started");
        let mut phase = Phase::Connecting;

        while !stop.is_set() {
            phase = match phase {
                Phase::Connecting => match self.opener.open() {
                    Ok(source) => {
                        tracing::info!(source = %uri, "stream connected");
                        Phase::Streaming(source)
                    }
                    Err(e) => {
                        tracing::warn!(source = %uri, error = %e, "failed to open stream, retrying");
                        if stop.wait(self.settings.reconnect_delay) {
                            break;
                        }
                        Phase::Connecting
                    }
                },
                Phase::Streaming(mut source) => match source.read_frame() {
                    Ok(frame) => {
                        self.state.publish_frame(frame);
                        self.stats.frame_ingested(Instant::now());
                        if stop.wait(self.settings.period) {
                            break;
                        }
                        Phase::Streaming(source)
                    }
                    Err(e) => {
                        drop(source);
                        let epoch = self.state.cut_stream();
                        self.stats.reconnect();
                        tracing::warn!(source = %uri, error = %e, epoch, "stream lost, reconnecting");
                        if stop.wait(self.settings.reconnect_delay) {
                            break;
                        }
                        Phase::Connecting
                    }
                },
            };
        }
        tracing::info!(source = %uri, "ingestion loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use livegate_core::Frame;
    use livegate_hw::SourceError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails the first `failures` opens, then hands out sources that yield
    /// `frames_per_source` frames before failing.
    struct FlakyOpener {
        failures: usize,
        frames_per_source: usize,
        attempts: Arc<AtomicUsize>,
        released: Arc<AtomicUsize>,
    }

    struct CountedSource {
        remaining: usize,
        released: Arc<AtomicUsize>,
    }

    impl FrameSource for CountedSource {
        fn read_frame(&mut self) -> Result<Frame, SourceError> {
            if self.remaining == 0 {
                return Err(SourceError::EndOfStream);
            }
            self.remaining -= 1;
            Ok(Frame::filled(4, 4, [9, 9, 9]))
        }
    }

    impl Drop for CountedSource {
        fn drop(&mut self) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl SourceOpener for FlakyOpener {
        fn open(&self) -> Result<Box<dyn FrameSource>, SourceError> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.failures {
                return Err(SourceError::Unsupported("offline".to_string()));
            }
            Ok(Box::new(CountedSource {
                remaining: self.frames_per_source,
                released: self.released.clone(),
            }))
        }

        fn describe(&self) -> String {
            "flaky://test".to_string()
        }
    }

    fn settings() -> IngestSettings {
        IngestSettings {
            reconnect_delay: Duration::from_millis(1),
            period: Duration::from_millis(1),
        }
    }

    fn wait_until(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_retries_after_failed_opens() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let opener = Arc::new(FlakyOpener {
            failures: 4,
            frames_per_source: usize::MAX,
            attempts: attempts.clone(),
            released: Arc::new(AtomicUsize::new(0)),
        });
        let state = SharedState::new();
        let stats = Arc::new(Stats::new());
        let stop = Arc::new(StopSignal::new());

        let delay = Duration::from_millis(25);
        let ingest = IngestLoop::new(
            opener,
            state.clone(),
            stats.clone(),
            IngestSettings {
                reconnect_delay: delay,
                period: Duration::from_millis(1),
            },
        );
        let started = Instant::now();
        let handle = {
            let stop = stop.clone();
            std::thread::spawn(move || ingest.run(&stop))
        };

        wait_until(|| state.read_latest_frame().is_some());
        let elapsed = started.elapsed();
        stop.trigger();
        handle.join().unwrap();

        // N failed opens, then one successful open
        assert_eq!(attempts.load(Ordering::SeqCst), 5);
        assert!(stats.snapshot().frames_ingested >= 1);
        // The reconnect delay separates every failed attempt from the next
        assert!(elapsed >= delay * 4, "reconnected after {elapsed:?}");
    }

    #[test]
    fn test_read_failure_cuts_stream_and_reconnects() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let released = Arc::new(AtomicUsize::new(0));
        let opener = Arc::new(FlakyOpener {
            failures: 0,
            frames_per_source: 2,
            attempts: attempts.clone(),
            released: released.clone(),
        });
        let state = SharedState::new();
        let stats = Arc::new(Stats::new());
        let stop = Arc::new(StopSignal::new());

        let ingest = IngestLoop::new(opener, state.clone(), stats.clone(), settings());
        let handle = {
            let stop = stop.clone();
            std::thread::spawn(move || ingest.run(&stop))
        };

        wait_until(|| state.epoch() >= 2);
        stop.trigger();
        handle.join().unwrap();

        let snap = stats.snapshot();
        assert!(snap.reconnects >= 2);
        assert!(attempts.load(Ordering::SeqCst) >= 3);
        // Every opened handle is released once the loop exits
        assert_eq!(released.load(Ordering::SeqCst), attempts.load(Ordering::SeqCst));
    }

    #[test]
    fn test_stop_interrupts_reconnect_sleep() {
        let opener = Arc::new(FlakyOpener {
            failures: usize::MAX,
            frames_per_source: 0,
            attempts: Arc::new(AtomicUsize::new(0)),
            released: Arc::new(AtomicUsize::new(0)),
        });
        let stop = Arc::new(StopSignal::new());
        let ingest = IngestLoop::new(
            opener,
            SharedState::new(),
            Arc::new(Stats::new()),
            IngestSettings {
                reconnect_delay: Duration::from_secs(60),
                period: Duration::from_millis(1),
            },
        );
        let handle = {
            let stop = stop.clone();
            std::thread::spawn(move || ingest.run(&stop))
        };

        let start = Instant::now();
        std::thread::sleep(Duration::from_millis(20));
        stop.trigger();
        handle.join().unwrap();
        assert!(start.elapsed() < Duration::from_secs(60));
    }
}
