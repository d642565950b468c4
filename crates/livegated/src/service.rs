//! Lifecycle of the two loops and the read accessors over the shared store.

use std::io::Cursor;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use livegate_core::{Capabilities, LivenessConfig, ProcessedFrame, SharedState, VerificationResult};
use livegate_hw::SourceOpener;
use thiserror::Error;

use crate::inference::{effective_liveness, InferenceLoop};
use crate::ingest::{IngestLoop, IngestSettings};
use crate::signal::StopSignal;
use crate::stats::{Stats, StatsSnapshot};

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("failed to spawn {name} thread: {source}")]
    Spawn {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("capabilities were lost when the inference thread panicked")]
    CapabilitiesLost,
    #[error("failed to encode preview: {0}")]
    Encode(#[from] image::ImageError),
}

#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub liveness: LivenessConfig,
    pub ingest: IngestSettings,
    pub inference_period: Duration,
    pub one_shot: bool,
}

struct Running {
    stop: Arc<StopSignal>,
    ingest: JoinHandle<()>,
    inference: JoinHandle<Capabilities>,
}

struct Slots {
    /// Parked while stopped, owned by the inference thread while running.
    capabilities: Option<Capabilities>,
    running: Option<Running>,
}

/// Owns the shared store and spins the ingestion and inference loops up and
/// down on demand.
pub struct Service {
    opener: Arc<dyn SourceOpener>,
    settings: ServiceSettings,
    state: SharedState,
    stats: Arc<Stats>,
    missing: Vec<&'static str>,
    /// Serialises `start` and `stop`. Readers never take it.
    lifecycle: Mutex<()>,
    slots: Mutex<Slots>,
}

impl Service {
    pub fn new(
        opener: Arc<dyn SourceOpener>,
        capabilities: Capabilities,
        mut settings: ServiceSettings,
    ) -> Self {
        settings.liveness = effective_liveness(settings.liveness, &capabilities);
        Self {
            opener,
            settings,
            state: SharedState::new(),
            stats: Arc::new(Stats::new()),
            missing: capabilities.missing(),
            lifecycle: Mutex::new(()),
            slots: Mutex::new(Slots {
                capabilities: Some(capabilities),
                running: None,
            }),
        }
    }

    fn slots(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start both loops. Returns false if they were already running.
    pub fn start(&self) -> Result<bool, ServiceError> {
        let _lifecycle = self.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
        let mut slots = self.slots();
        if slots.running.is_some() {
            return Ok(false);
        }
        let capabilities = slots
            .capabilities
            .take()
            .ok_or(ServiceError::CapabilitiesLost)?;

        let stop = Arc::new(StopSignal::new());
        let mut inference = InferenceLoop::new(
            capabilities,
            self.settings.liveness.clone(),
            self.settings.one_shot,
            self.state.clone(),
            self.stats.clone(),
        );
        let period = self.settings.inference_period;
        let inference = {
            let stop = stop.clone();
            std::thread::Builder::new()
                .name("livegate-inference".into())
                .spawn(move || {
                    inference.run(&stop, period);
                    inference.into_capabilities()
                })
                .map_err(|source| ServiceError::Spawn {
                    name: "inference",
                    source,
                })?
        };

        let ingest_loop = IngestLoop::new(
            self.opener.clone(),
            self.state.clone(),
            self.stats.clone(),
            self.settings.ingest,
        );
        let spawned = {
            let stop = stop.clone();
            std::thread::Builder::new()
                .name("livegate-ingest".into())
                .spawn(move || ingest_loop.run(&stop))
        };
        let ingest = match spawned {
            Ok(handle) => handle,
            Err(source) => {
                stop.trigger();
                slots.capabilities = inference.join().ok();
                return Err(ServiceError::Spawn {
                    name: "ingest",
                    source,
                });
            }
        };

        slots.running = Some(Running {
            stop,
            ingest,
            inference,
        });
        tracing::info!(source = %self.opener.describe(), "service started");
        Ok(true)
    }

    /// Stop both loops, waiting for an in-flight cycle to finish. Returns
    /// false if they were not running.
    ///
    /// The loops count as stopped as soon as the stop is issued; the joins
    /// happen without holding the lock readers use.
    pub fn stop(&self) -> Result<bool, ServiceError> {
        let _lifecycle = self.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
        let Some(running) = self.slots().running.take() else {
            return Ok(false);
        };

        running.stop.trigger();
        if running.ingest.join().is_err() {
            tracing::error!("ingest thread panicked");
        }
        let joined = running.inference.join();
        // Results do not outlive the stream that produced them.
        self.state.cut_stream();
        tracing::info!("service stopped");

        match joined {
            Ok(capabilities) => {
                self.slots().capabilities = Some(capabilities);
                Ok(true)
            }
            Err(_) => {
                tracing::error!("inference thread panicked");
                Err(ServiceError::CapabilitiesLost)
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.slots().running.is_some()
    }

    pub fn latest_result(&self) -> Option<VerificationResult> {
        self.state.read_result()
    }

    /// Remove and return the cached result (one-shot consumption).
    pub fn take_result(&self) -> Option<VerificationResult> {
        self.state.take_result()
    }

    pub fn latest_processed_frame(&self) -> Option<ProcessedFrame> {
        self.state.read_latest_processed_frame()
    }

    /// The latest processed frame as JPEG, with its caption.
    pub fn preview_jpeg(&self) -> Result<Option<(Vec<u8>, String)>, ServiceError> {
        let Some(processed) = self.latest_processed_frame() else {
            return Ok(None);
        };
        let Some(jpeg) = encode_jpeg(&processed)? else {
            return Ok(None);
        };
        Ok(Some((jpeg, processed.caption)))
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn source(&self) -> String {
        self.opener.describe()
    }

    pub fn settings(&self) -> &ServiceSettings {
        &self.settings
    }

    /// Capabilities disabled at startup.
    pub fn missing_capabilities(&self) -> &[&'static str] {
        &self.missing
    }

    #[cfg(test)]
    pub fn shared_state(&self) -> &SharedState {
        &self.state
    }
}

/// `None` when the frame is not RGB.
fn encode_jpeg(processed: &ProcessedFrame) -> Result<Option<Vec<u8>>, ServiceError> {
    let Some(img) = processed.frame.to_rgb_image() else {
        return Ok(None);
    };
    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, image::ImageFormat::Jpeg)?;
    Ok(Some(buf.into_inner()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use livegate_core::{CapabilityError, Detection, FaceDetector, Frame};
    use livegate_hw::UriOpener;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Instant;

    struct NoFaces;

    impl FaceDetector for NoFaces {
        fn detect(&mut self, _frame: &Frame) -> Result<Vec<Detection>, CapabilityError> {
            Ok(Vec::new())
        }
    }

    /// Flags entry, then takes a while to answer.
    struct SlowDetector {
        entered: Arc<AtomicBool>,
        delay: Duration,
    }

    impl FaceDetector for SlowDetector {
        fn detect(&mut self, _frame: &Frame) -> Result<Vec<Detection>, CapabilityError> {
            self.entered.store(true, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            Ok(Vec::new())
        }
    }

    fn service() -> Service {
        service_with(Box::new(NoFaces))
    }

    fn service_with(detector: Box<dyn FaceDetector>) -> Service {
        let capabilities = Capabilities {
            detector: Some(detector),
            ..Capabilities::default()
        };
        Service::new(
            Arc::new(UriOpener::new("stub://test?width=32&height=24")),
            capabilities,
            ServiceSettings {
                liveness: LivenessConfig::default(),
                ingest: IngestSettings {
                    reconnect_delay: Duration::from_millis(5),
                    period: Duration::from_millis(2),
                },
                inference_period: Duration::from_millis(5),
                one_shot: false,
            },
        )
    }

    fn wait_for_preview(service: &Service) -> ProcessedFrame {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            if let Some(processed) = service.latest_processed_frame() {
                return processed;
            }
            assert!(Instant::now() < deadline, "no preview produced");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_start_stop_lifecycle() {
        let service = service();
        assert!(!service.is_running());
        assert!(service.start().unwrap());
        assert!(!service.start().unwrap());
        assert!(service.is_running());

        let processed = wait_for_preview(&service);
        assert_eq!((processed.frame.width(), processed.frame.height()), (32, 24));
        assert!(service.stats().frames_ingested > 0);

        assert!(service.stop().unwrap());
        assert!(!service.stop().unwrap());
        assert!(!service.is_running());
        assert!(service.shared_state().read_latest_frame().is_none());
    }

    #[test]
    fn test_restart_reuses_capabilities() {
        let service = service();
        service.start().unwrap();
        service.stop().unwrap();
        assert_eq!(service.missing_capabilities().len(), 3);
        assert!(service.start().unwrap());
        service.stop().unwrap();
    }

    #[test]
    fn test_is_running_does_not_wait_for_stop() {
        let entered = Arc::new(AtomicBool::new(false));
        let service = Arc::new(service_with(Box::new(SlowDetector {
            entered: entered.clone(),
            delay: Duration::from_millis(800),
        })));
        service.start().unwrap();

        let deadline = Instant::now() + Duration::from_secs(10);
        while !entered.load(Ordering::SeqCst) {
            assert!(Instant::now() < deadline, "no cycle started");
            std::thread::sleep(Duration::from_millis(2));
        }

        let stopping = {
            let service = service.clone();
            std::thread::spawn(move || service.stop())
        };
        std::thread::sleep(Duration::from_millis(50));

        let started = Instant::now();
        let running = service.is_running();
        let elapsed = started.elapsed();
        assert!(!running);
        assert!(elapsed < Duration::from_millis(100), "is_running blocked for {elapsed:?}");
        assert!(service.stats().inference_cycles >= 1);

        assert!(stopping.join().unwrap().unwrap());
        // Capabilities were parked again
        assert!(service.start().unwrap());
        service.stop().unwrap();
    }

    #[test]
    fn test_settings_report_effective_challenge() {
        let service = service();
        assert!(LivenessConfig::default().require_active_challenge);
        assert!(!service.settings().liveness.require_active_challenge);
    }

    #[test]
    fn test_preview_jpeg() {
        let service = service();
        assert!(service.preview_jpeg().unwrap().is_none());

        service.start().unwrap();
        wait_for_preview(&service);
        let (jpeg, caption) = service.preview_jpeg().unwrap().unwrap();
        service.stop().unwrap();

        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        assert_eq!(caption, "NO FACE");
    }
}
