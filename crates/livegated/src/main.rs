use std::sync::Arc;

use anyhow::{Context, Result};
use livegate_hw::UriOpener;
use tracing_subscriber::EnvFilter;

mod capabilities;
mod config;
mod dbus_interface;
mod inference;
mod ingest;
mod service;
mod signal;
mod stats;

use config::Config;
use ingest::IngestSettings;
use service::{Service, ServiceSettings};

const BUS_NAME: &str = "org.freedesktop.Livegate1";
const OBJECT_PATH: &str = "/org/freedesktop/Livegate1";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("livegated starting");

    let config = Config::load().context("failed to load configuration")?;
    tracing::info!(
        source = %config.source,
        model_dir = %config.model_dir.display(),
        stability_run_length = config.stability_run_length,
        require_active_challenge = config.require_active_challenge,
        "configuration loaded"
    );

    let model_dir = config.model_dir.clone();
    let capabilities = tokio::task::spawn_blocking(move || capabilities::load(&model_dir))
        .await
        .context("model loading task failed")?;

    let service = Arc::new(Service::new(
        Arc::new(UriOpener::new(config.source.clone())),
        capabilities,
        ServiceSettings {
            liveness: config.liveness(),
            ingest: IngestSettings {
                reconnect_delay: config.reconnect_delay(),
                period: config.ingestion_period(),
            },
            inference_period: config.inference_period(),
            one_shot: config.one_shot,
        },
    ));

    if config.autostart {
        service.start().context("failed to start service loops")?;
    }

    let builder = if config.session_bus {
        zbus::connection::Builder::session()?
    } else {
        zbus::connection::Builder::system()?
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(
            OBJECT_PATH,
            dbus_interface::LivegateService {
                service: service.clone(),
            },
        )?
        .build()
        .await
        .context("failed to register on D-Bus")?;

    tracing::info!(
        bus = if config.session_bus { "session" } else { "system" },
        "livegated ready"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("livegated shutting down");

    tokio::task::spawn_blocking(move || service.stop())
        .await
        .context("shutdown task failed")??;

    Ok(())
}
