use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;

const FPS_WINDOW: Duration = Duration::from_secs(1);

/// Runtime counters shared by both loops and the readers.
pub struct Stats {
    frames_ingested: AtomicU64,
    inference_cycles: AtomicU64,
    faces_detected: AtomicU64,
    results_produced: AtomicU64,
    capability_errors: AtomicU64,
    reconnects: AtomicU64,
    fps: Mutex<FpsWindow>,
}

struct FpsWindow {
    started: Instant,
    frames: u64,
    last_fps: f32,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StatsSnapshot {
    pub frames_ingested: u64,
    pub inference_cycles: u64,
    pub faces_detected: u64,
    pub results_produced: u64,
    pub capability_errors: u64,
    pub reconnects: u64,
    pub ingest_fps: f32,
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

impl Stats {
    pub fn new() -> Self {
        Self {
            frames_ingested: AtomicU64::new(0),
            inference_cycles: AtomicU64::new(0),
            faces_detected: AtomicU64::new(0),
            results_produced: AtomicU64::new(0),
            capability_errors: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            fps: Mutex::new(FpsWindow {
                started: Instant::now(),
                frames: 0,
                last_fps: 0.0,
            }),
        }
    }

    pub fn frame_ingested(&self, now: Instant) {
        self.frames_ingested.fetch_add(1, Ordering::Relaxed);
        let mut window = self.fps.lock().unwrap_or_else(|e| e.into_inner());
        window.frames += 1;
        let elapsed = now.saturating_duration_since(window.started);
        if elapsed >= FPS_WINDOW {
            window.last_fps = window.frames as f32 / elapsed.as_secs_f32();
            window.frames = 0;
            window.started = now;
        }
    }

    pub fn inference_cycle(&self) {
        self.inference_cycles.fetch_add(1, Ordering::Relaxed);
    }

    pub fn face_detected(&self) {
        self.faces_detected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn result_produced(&self) {
        self.results_produced.fetch_add(1, Ordering::Relaxed);
    }

    pub fn capability_error(&self) {
        self.capability_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let ingest_fps = self.fps.lock().unwrap_or_else(|e| e.into_inner()).last_fps;
        StatsSnapshot {
            frames_ingested: self.frames_ingested.load(Ordering::Relaxed),
            inference_cycles: self.inference_cycles.load(Ordering::Relaxed),
            faces_detected: self.faces_detected.load(Ordering::Relaxed),
            results_produced: self.results_produced.load(Ordering::Relaxed),
            capability_errors: self.capability_errors.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            ingest_fps,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let stats = Stats::new();
        stats.inference_cycle();
        stats.inference_cycle();
        stats.face_detected();
        stats.capability_error();
        let snap = stats.snapshot();
        assert_eq!(snap.inference_cycles, 2);
        assert_eq!(snap.faces_detected, 1);
        assert_eq!(snap.capability_errors, 1);
        assert_eq!(snap.results_produced, 0);
    }

    #[test]
    fn test_fps_computed_per_window() {
        let stats = Stats::new();
        let start = stats.fps.lock().unwrap().started;
        for i in 1..=20 {
            stats.frame_ingested(start + Duration::from_millis(50 * i));
        }
        // 20 frames over exactly one second
        let snap = stats.snapshot();
        assert_eq!(snap.frames_ingested, 20);
        assert!((snap.ingest_fps - 20.0).abs() < 0.01);
    }
}
