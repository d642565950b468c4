use std::sync::Arc;

use zbus::interface;

use crate::service::Service;

/// D-Bus interface for the Livegate liveness daemon.
///
/// Bus name: org.freedesktop.Livegate1
/// Object path: /org/freedesktop/Livegate1
///
/// A thin reader over the shared store plus the start/stop hooks; no method
/// drives session transitions.
pub struct LivegateService {
    pub service: Arc<Service>,
}

fn failed(e: impl std::fmt::Display) -> zbus::fdo::Error {
    zbus::fdo::Error::Failed(e.to_string())
}

#[interface(name = "org.freedesktop.Livegate1")]
impl LivegateService {
    /// Start the ingestion and inference loops.
    ///
    /// Returns false if they were already running.
    async fn start(&self) -> zbus::fdo::Result<bool> {
        tracing::info!("start requested");
        let service = self.service.clone();
        tokio::task::spawn_blocking(move || service.start())
            .await
            .map_err(failed)?
            .map_err(|e| {
                tracing::error!(error = %e, "start failed");
                failed(e)
            })
    }

    /// Stop both loops. Blocks until an in-flight inference cycle finishes.
    async fn stop(&self) -> zbus::fdo::Result<bool> {
        tracing::info!("stop requested");
        let service = self.service.clone();
        tokio::task::spawn_blocking(move || service.stop())
            .await
            .map_err(failed)?
            .map_err(|e| {
                tracing::error!(error = %e, "stop failed");
                failed(e)
            })
    }

    /// Return daemon status information as JSON.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let service = &self.service;
        let settings = service.settings();
        let processed = service.latest_processed_frame();

        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "running": service.is_running(),
            "source": service.source(),
            "state": processed.as_ref().and_then(|p| p.state),
            "caption": processed.map(|p| p.caption),
            "result_available": service.latest_result().is_some(),
            "missing_capabilities": service.missing_capabilities(),
            "stability_run_length": settings.liveness.stability_run_length,
            "confidence_threshold": settings.liveness.confidence_threshold,
            "require_active_challenge": settings.liveness.require_active_challenge,
            "one_shot": settings.one_shot,
            "stats": service.stats(),
        })
        .to_string())
    }

    /// The cached verification result as JSON, or `null` while none exists.
    async fn latest_result(&self) -> zbus::fdo::Result<String> {
        serde_json::to_string(&self.service.latest_result()).map_err(failed)
    }

    /// Remove and return the cached result as JSON, or `null`.
    async fn take_result(&self) -> zbus::fdo::Result<String> {
        let result = self.service.take_result();
        if let Some(result) = &result {
            tracing::info!(episode = %result.episode, "result taken");
        }
        serde_json::to_string(&result).map_err(failed)
    }

    /// The latest annotated frame as JPEG bytes, with its status caption.
    async fn preview(&self) -> zbus::fdo::Result<(Vec<u8>, String)> {
        let service = self.service.clone();
        tokio::task::spawn_blocking(move || service.preview_jpeg())
            .await
            .map_err(failed)?
            .map_err(failed)?
            .ok_or_else(|| failed("no preview frame available"))
    }
}
