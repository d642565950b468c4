use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod setup;

#[zbus::proxy(
    interface = "org.freedesktop.Livegate1",
    default_service = "org.freedesktop.Livegate1",
    default_path = "/org/freedesktop/Livegate1"
)]
trait Livegate {
    fn start(&self) -> zbus::Result<bool>;
    fn stop(&self) -> zbus::Result<bool>;
    fn status(&self) -> zbus::Result<String>;
    fn latest_result(&self) -> zbus::Result<String>;
    fn take_result(&self) -> zbus::Result<String>;
    fn preview(&self) -> zbus::Result<(Vec<u8>, String)>;
}

#[derive(Parser)]
#[command(name = "livegate", version, about = "Livegate liveness verification CLI")]
struct Cli {
    /// Talk to a daemon on the session bus instead of the system bus
    #[arg(long, global = true)]
    session: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show daemon status and statistics
    Status,
    /// Print the cached verification result, if any
    Result,
    /// Take (consume) the cached verification result
    Take,
    /// Start the ingestion and inference loops
    Start,
    /// Stop the ingestion and inference loops
    Stop,
    /// Save the latest annotated preview frame as JPEG
    Snapshot {
        /// Output file
        #[arg(default_value = "livegate-preview.jpg")]
        output: PathBuf,
    },
    /// Download and verify the ONNX model files
    Setup {
        /// Model directory (defaults to the daemon's model directory)
        #[arg(long)]
        model_dir: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Setup { model_dir } => {
            tokio::task::spawn_blocking(move || setup::run(model_dir)).await??;
        }
        Command::Status => print_json(&connect(cli.session).await?.status().await?)?,
        Command::Result => print_json(&connect(cli.session).await?.latest_result().await?)?,
        Command::Take => print_json(&connect(cli.session).await?.take_result().await?)?,
        Command::Start => {
            let started = connect(cli.session).await?.start().await?;
            println!("{}", if started { "started" } else { "already running" });
        }
        Command::Stop => {
            let stopped = connect(cli.session).await?.stop().await?;
            println!("{}", if stopped { "stopped" } else { "not running" });
        }
        Command::Snapshot { output } => {
            let (jpeg, caption) = connect(cli.session).await?.preview().await?;
            std::fs::write(&output, &jpeg)
                .with_context(|| format!("failed to write {}", output.display()))?;
            println!("{} ({} bytes): {caption}", output.display(), jpeg.len());
        }
    }

    Ok(())
}

async fn connect(session: bool) -> Result<LivegateProxy<'static>> {
    let conn = if session {
        zbus::Connection::session().await
    } else {
        zbus::Connection::system().await
    }
    .context("failed to connect to D-Bus")?;
    LivegateProxy::new(&conn)
        .await
        .context("failed to reach livegated; is the daemon running?")
}

/// Pretty-print a JSON string returned by the daemon.
fn print_json(raw: &str) -> Result<()> {
    let value: serde_json::Value =
        serde_json::from_str(raw).context("daemon returned invalid JSON")?;
    if value.is_null() {
        println!("no verification result available");
    } else {
        println!("{}", serde_json::to_string_pretty(&value)?);
    }
    Ok(())
}
