use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use livegate_core::LivenessConfig;
use serde::Deserialize;

/// Daemon configuration.
///
/// Built from defaults, then the TOML file named by `LIVEGATE_CONFIG` (if
/// any), then `LIVEGATE_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Frame source URI (`v4l2:///dev/videoN`, `stub://...`, `dir://...` or a
    /// directory path).
    pub source: String,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    pub confidence_threshold: f32,
    pub stability_run_length: usize,
    /// Minimum normalised displacement between consecutive tracked positions.
    pub movement_threshold: f32,
    pub position_history_len: usize,
    pub active_challenge_threshold: f32,
    pub require_active_challenge: bool,
    /// 0 disables the challenge timeout.
    pub challenge_timeout_ms: u64,
    pub failure_clears_positions: bool,
    pub success_display_ms: u64,
    /// Reset the session once a result has been taken by a reader.
    pub one_shot: bool,
    pub reconnect_delay_ms: u64,
    pub ingestion_period_ms: u64,
    pub inference_period_ms: u64,
    /// Start both loops at daemon startup instead of waiting for `Start`.
    pub autostart: bool,
    /// Whether the daemon is running on the session bus (development mode).
    pub session_bus: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            source: "stub://synthetic".to_string(),
            model_dir: livegate_core::default_model_dir(),
            confidence_threshold: 0.9,
            stability_run_length: 10,
            movement_threshold: 0.002,
            position_history_len: 5,
            active_challenge_threshold: 0.35,
            require_active_challenge: true,
            challenge_timeout_ms: 10_000,
            failure_clears_positions: false,
            success_display_ms: 3_000,
            one_shot: false,
            reconnect_delay_ms: 2_000,
            ingestion_period_ms: 10,
            inference_period_ms: 50,
            autostart: true,
            session_bus: false,
        }
    }
}

/// Optional overrides read from the TOML file. Unknown keys are rejected so
/// a typo does not silently fall back to a default.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    source: Option<String>,
    model_dir: Option<PathBuf>,
    confidence_threshold: Option<f32>,
    stability_run_length: Option<usize>,
    movement_threshold: Option<f32>,
    position_history_len: Option<usize>,
    active_challenge_threshold: Option<f32>,
    require_active_challenge: Option<bool>,
    challenge_timeout_ms: Option<u64>,
    failure_clears_positions: Option<bool>,
    success_display_ms: Option<u64>,
    one_shot: Option<bool>,
    reconnect_delay_ms: Option<u64>,
    ingestion_period_ms: Option<u64>,
    inference_period_ms: Option<u64>,
    autostart: Option<bool>,
    session_bus: Option<bool>,
}

impl Config {
    /// Load configuration from the optional file and `LIVEGATE_*` variables.
    pub fn load() -> Result<Self> {
        let mut config = Self::default();
        if let Ok(path) = std::env::var("LIVEGATE_CONFIG") {
            config.apply_file(Path::new(&path))?;
        }
        config.apply_env(|key| std::env::var(key).ok());
        config.clamp();
        Ok(config)
    }

    fn apply_file(&mut self, path: &Path) -> Result<()> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        self.apply_toml(&text)
            .with_context(|| format!("invalid config file {}", path.display()))
    }

    fn apply_toml(&mut self, text: &str) -> Result<()> {
        let file: FileConfig = toml::from_str(text)?;

        set(&mut self.source, file.source);
        set(&mut self.model_dir, file.model_dir);
        set(&mut self.confidence_threshold, file.confidence_threshold);
        set(&mut self.stability_run_length, file.stability_run_length);
        set(&mut self.movement_threshold, file.movement_threshold);
        set(&mut self.position_history_len, file.position_history_len);
        set(&mut self.active_challenge_threshold, file.active_challenge_threshold);
        set(&mut self.require_active_challenge, file.require_active_challenge);
        set(&mut self.challenge_timeout_ms, file.challenge_timeout_ms);
        set(&mut self.failure_clears_positions, file.failure_clears_positions);
        set(&mut self.success_display_ms, file.success_display_ms);
        set(&mut self.one_shot, file.one_shot);
        set(&mut self.reconnect_delay_ms, file.reconnect_delay_ms);
        set(&mut self.ingestion_period_ms, file.ingestion_period_ms);
        set(&mut self.inference_period_ms, file.inference_period_ms);
        set(&mut self.autostart, file.autostart);
        set(&mut self.session_bus, file.session_bus);
        Ok(())
    }

    /// Apply environment overrides. Unparseable values are ignored.
    fn apply_env(&mut self, get: impl Fn(&str) -> Option<String>) {
        if let Some(v) = get("LIVEGATE_SOURCE") {
            self.source = v;
        }
        if let Some(v) = get("LIVEGATE_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        parse_into(&get, "LIVEGATE_CONFIDENCE_THRESHOLD", &mut self.confidence_threshold);
        parse_into(&get, "LIVEGATE_STABILITY_RUN_LENGTH", &mut self.stability_run_length);
        parse_into(&get, "LIVEGATE_MOVEMENT_THRESHOLD", &mut self.movement_threshold);
        parse_into(&get, "LIVEGATE_POSITION_HISTORY_LEN", &mut self.position_history_len);
        parse_into(&get, "LIVEGATE_CHALLENGE_THRESHOLD", &mut self.active_challenge_threshold);
        flag_into(&get, "LIVEGATE_REQUIRE_CHALLENGE", &mut self.require_active_challenge);
        parse_into(&get, "LIVEGATE_CHALLENGE_TIMEOUT_MS", &mut self.challenge_timeout_ms);
        flag_into(&get, "LIVEGATE_FAILURE_CLEARS_POSITIONS", &mut self.failure_clears_positions);
        parse_into(&get, "LIVEGATE_SUCCESS_DISPLAY_MS", &mut self.success_display_ms);
        flag_into(&get, "LIVEGATE_ONE_SHOT", &mut self.one_shot);
        parse_into(&get, "LIVEGATE_RECONNECT_DELAY_MS", &mut self.reconnect_delay_ms);
        parse_into(&get, "LIVEGATE_INGESTION_PERIOD_MS", &mut self.ingestion_period_ms);
        parse_into(&get, "LIVEGATE_INFERENCE_PERIOD_MS", &mut self.inference_period_ms);
        flag_into(&get, "LIVEGATE_AUTOSTART", &mut self.autostart);
        if get("LIVEGATE_SESSION_BUS").is_some() {
            self.session_bus = true;
        }
    }

    fn clamp(&mut self) {
        self.stability_run_length = self.stability_run_length.max(1);
        self.position_history_len = self.position_history_len.max(2);
    }

    /// Thresholds for the liveness state machine.
    pub fn liveness(&self) -> LivenessConfig {
        LivenessConfig {
            confidence_threshold: self.confidence_threshold,
            stability_run_length: self.stability_run_length,
            movement_threshold: self.movement_threshold,
            position_history_len: self.position_history_len,
            active_challenge_threshold: self.active_challenge_threshold,
            require_active_challenge: self.require_active_challenge,
            challenge_timeout: (self.challenge_timeout_ms > 0)
                .then(|| Duration::from_millis(self.challenge_timeout_ms)),
            success_display_duration: Duration::from_millis(self.success_display_ms),
            failure_clears_positions: self.failure_clears_positions,
        }
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn ingestion_period(&self) -> Duration {
        Duration::from_millis(self.ingestion_period_ms)
    }

    pub fn inference_period(&self) -> Duration {
        Duration::from_millis(self.inference_period_ms)
    }
}

fn set<T>(slot: &mut T, value: Option<T>) {
    if let Some(v) = value {
        *slot = v;
    }
}

fn parse_into<T: std::str::FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    if let Some(raw) = get(key) {
        match raw.trim().parse() {
            Ok(v) => *slot = v,
            Err(_) => tracing::warn!(key, value = %raw, "ignoring invalid value"),
        }
    }
}

/// `0`, `false`, `no` and `off` disable; anything else enables.
fn flag_into(get: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut bool) {
    if let Some(raw) = get(key) {
        *slot = !matches!(raw.trim().to_ascii_lowercase().as_str(), "0" | "false" | "no" | "off");
    }
}
