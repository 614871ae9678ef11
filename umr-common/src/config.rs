//! Configuration loading and root folder resolution
//!
//! Configuration is a single TOML file read once at startup. Everything the
//! reading pipeline needs at runtime (meters, providers, thresholds, the
//! time-series target) comes from here and is treated as read-only afterwards.
//!
//! # Root folder priority
//! 1. Command-line argument (highest priority)
//! 2. `UMR_ROOT_FOLDER` environment variable
//! 3. `root_folder` key in the TOML file
//! 4. OS-dependent compiled default (fallback)
//!
//! # Credential priority
//! 1. `UMR_<KIND>_API_KEY` environment variable
//! 2. `api_key` in the provider's TOML section

use crate::{Error, MeterType, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Environment variable overriding the root folder
pub const ROOT_FOLDER_ENV: &str = "UMR_ROOT_FOLDER";

/// Minimum allowed capture interval per meter
pub const MIN_INTERVAL_SECS: u64 = 60;

/// Bootstrap configuration loaded from TOML file
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TomlConfig {
    /// Root folder for archive and logs (optional)
    #[serde(default)]
    pub root_folder: Option<PathBuf>,

    /// Logging configuration (optional)
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Pipeline tuning
    #[serde(default)]
    pub pipeline: PipelineSection,

    /// Vision providers in priority order (first is tried first)
    #[serde(default)]
    pub providers: Vec<ProviderSection>,

    /// Configured meters
    #[serde(default)]
    pub meters: Vec<MeterSection>,

    /// Time-series database target (optional)
    #[serde(default)]
    pub influxdb: Option<InfluxSection>,

    /// Administrative HTTP server
    #[serde(default)]
    pub server: ServerSection,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log file path (optional, logs to stderr if not specified)
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

/// `[pipeline]` section
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PipelineSection {
    /// Largest plausible increase between two consecutive readings
    #[serde(default = "default_jump_threshold")]
    pub jump_threshold: f64,

    /// How many prior log entries are read back for validation
    #[serde(default = "default_history_depth")]
    pub history_depth: usize,

    /// Per-provider call timeout
    #[serde(default = "default_provider_timeout_secs")]
    pub provider_timeout_secs: u64,

    /// Time-series write timeout
    #[serde(default = "default_sink_timeout_secs")]
    pub sink_timeout_secs: u64,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            jump_threshold: default_jump_threshold(),
            history_depth: default_history_depth(),
            provider_timeout_secs: default_provider_timeout_secs(),
            sink_timeout_secs: default_sink_timeout_secs(),
        }
    }
}

/// Supported vision provider backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Google Gemini (free tier, primary)
    Gemini,
    /// Anthropic Claude (paid fallback)
    Anthropic,
    /// OpenAI or any OpenAI-compatible endpoint (e.g. a local Ollama)
    Openai,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Gemini => "gemini",
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Openai => "openai",
        }
    }

    /// Environment variable consulted for this provider's credential
    pub fn api_key_env(&self) -> &'static str {
        match self {
            ProviderKind::Gemini => "UMR_GEMINI_API_KEY",
            ProviderKind::Anthropic => "UMR_ANTHROPIC_API_KEY",
            ProviderKind::Openai => "UMR_OPENAI_API_KEY",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One `[[providers]]` entry
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProviderSection {
    pub kind: ProviderKind,

    /// Model name; each backend has its own default
    #[serde(default)]
    pub model: Option<String>,

    #[serde(default)]
    pub api_key: Option<String>,

    /// Override the backend's API base URL
    #[serde(default)]
    pub base_url: Option<String>,

    /// Minimum spacing between requests (free-tier quotas)
    #[serde(default)]
    pub min_interval_ms: Option<u64>,

    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// One `[[meters]]` entry
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MeterSection {
    /// Unique meter name, used as the archive directory name
    pub name: String,

    #[serde(rename = "type")]
    pub meter_type: MeterType,

    /// Snapshot or MJPEG URL of the camera watching this meter
    pub camera_url: String,

    /// Clockwise rotation applied before transcription (0, 90, 180, 270)
    #[serde(default)]
    pub rotation: u16,

    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// Overrides `[pipeline] jump_threshold` for this meter
    #[serde(default)]
    pub jump_threshold: Option<f64>,

    /// Meter has a tenth-of-unit digit wheel
    #[serde(default)]
    pub has_sub_unit_wheel: bool,

    /// Meter has an analog fractional dial
    #[serde(default = "default_true")]
    pub has_dial: bool,

    /// Display unit; defaults per meter type
    #[serde(default)]
    pub unit: Option<String>,

    #[serde(default = "default_camera_timeout_secs")]
    pub camera_timeout_secs: u64,
}

impl MeterSection {
    pub fn unit(&self) -> &str {
        self.unit
            .as_deref()
            .unwrap_or_else(|| self.meter_type.default_unit())
    }
}

/// `[influxdb]` section
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InfluxSection {
    pub url: String,
    pub org: String,
    pub bucket: String,

    /// Falls back to `UMR_INFLUXDB_TOKEN`
    #[serde(default)]
    pub token: Option<String>,

    #[serde(default = "default_measurement")]
    pub measurement: String,
}

/// `[server]` section
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: String,

    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            enabled: true,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_jump_threshold() -> f64 {
    100.0
}

fn default_history_depth() -> usize {
    5
}

fn default_provider_timeout_secs() -> u64 {
    30
}

fn default_sink_timeout_secs() -> u64 {
    5
}

fn default_interval_secs() -> u64 {
    600
}

fn default_camera_timeout_secs() -> u64 {
    10
}

fn default_measurement() -> String {
    "meter_reading".to_string()
}

fn default_bind() -> String {
    "127.0.0.1:5730".to_string()
}

fn default_true() -> bool {
    true
}

impl TomlConfig {
    /// Load and validate configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Read config {} failed: {}", path.display(), e))
        })?;
        let config = Self::parse(&content)?;
        info!(
            path = %path.display(),
            meters = config.meters.len(),
            providers = config.providers.len(),
            "Configuration loaded"
        );
        Ok(config)
    }

    /// Parse and validate configuration from TOML text
    pub fn parse(content: &str) -> Result<Self> {
        let config: TomlConfig = toml::from_str(content)
            .map_err(|e| Error::Config(format!("Parse TOML failed: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Structural checks that serde cannot express
    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for (i, meter) in self.meters.iter().enumerate() {
            if meter.name.trim().is_empty() {
                return Err(Error::Config(format!("Meter {}: name cannot be empty", i)));
            }
            if meter.name.contains(['/', '\\']) || meter.name.starts_with('.') {
                return Err(Error::Config(format!(
                    "Meter {}: name '{}' is not a valid directory name",
                    i, meter.name
                )));
            }
            if !names.insert(meter.name.as_str()) {
                return Err(Error::Config(format!(
                    "Meter name '{}' is configured more than once",
                    meter.name
                )));
            }
            if meter.camera_url.trim().is_empty() {
                return Err(Error::Config(format!(
                    "Meter {}: camera_url cannot be empty",
                    meter.name
                )));
            }
            if !matches!(meter.rotation, 0 | 90 | 180 | 270) {
                return Err(Error::Config(format!(
                    "Meter {}: rotation must be 0, 90, 180 or 270 (got {})",
                    meter.name, meter.rotation
                )));
            }
            if meter.interval_secs < MIN_INTERVAL_SECS {
                return Err(Error::Config(format!(
                    "Meter {}: interval_secs must be >= {} seconds",
                    meter.name, MIN_INTERVAL_SECS
                )));
            }
            if let Some(threshold) = meter.jump_threshold {
                if !(threshold.is_finite() && threshold >= 0.0) {
                    return Err(Error::Config(format!(
                        "Meter {}: jump_threshold must be a non-negative number",
                        meter.name
                    )));
                }
            }
        }

        if !(self.pipeline.jump_threshold.is_finite() && self.pipeline.jump_threshold >= 0.0) {
            return Err(Error::Config(
                "pipeline.jump_threshold must be a non-negative number".to_string(),
            ));
        }
        if self.pipeline.history_depth == 0 {
            return Err(Error::Config(
                "pipeline.history_depth must be at least 1".to_string(),
            ));
        }
        if self.pipeline.provider_timeout_secs == 0 {
            return Err(Error::Config(
                "pipeline.provider_timeout_secs must be positive".to_string(),
            ));
        }

        if !self.meters.is_empty() && !self.providers.iter().any(|p| p.enabled) {
            return Err(Error::Config(
                "At least one enabled provider is required when meters are configured"
                    .to_string(),
            ));
        }

        if let Some(influx) = &self.influxdb {
            for (field, value) in [
                ("url", &influx.url),
                ("org", &influx.org),
                ("bucket", &influx.bucket),
            ] {
                if value.trim().is_empty() {
                    return Err(Error::Config(format!(
                        "InfluxDB config: '{}' cannot be empty",
                        field
                    )));
                }
            }
        }

        Ok(())
    }

    /// Find a meter by name
    pub fn meter(&self, name: &str) -> Option<&MeterSection> {
        self.meters.iter().find(|m| m.name == name)
    }
}

/// Default configuration file path for the platform (`<config_dir>/umr/umr.toml`)
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("umr").join("umr.toml"))
}

/// Get OS-dependent default root folder path
pub fn default_root_folder() -> PathBuf {
    if cfg!(target_os = "linux") {
        // ~/.local/share/umr (or /var/lib/umr for system-wide)
        dirs::data_local_dir()
            .map(|d| d.join("umr"))
            .unwrap_or_else(|| PathBuf::from("/var/lib/umr"))
    } else if cfg!(target_os = "macos") {
        dirs::data_dir()
            .map(|d| d.join("umr"))
            .unwrap_or_else(|| PathBuf::from("/Library/Application Support/umr"))
    } else if cfg!(target_os = "windows") {
        dirs::data_local_dir()
            .map(|d| d.join("umr"))
            .unwrap_or_else(|| PathBuf::from("C:\\ProgramData\\umr"))
    } else {
        PathBuf::from("./umr_data")
    }
}

/// Resolves the root folder following the documented priority order
#[derive(Debug, Clone, Default)]
pub struct RootFolderResolver {
    cli_arg: Option<PathBuf>,
    toml_value: Option<PathBuf>,
}

impl RootFolderResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cli_arg(mut self, path: Option<PathBuf>) -> Self {
        self.cli_arg = path;
        self
    }

    pub fn with_toml_value(mut self, path: Option<PathBuf>) -> Self {
        self.toml_value = path;
        self
    }

    pub fn resolve(&self) -> PathBuf {
        // Priority 1: Command-line argument
        if let Some(path) = &self.cli_arg {
            return path.clone();
        }

        // Priority 2: Environment variable
        if let Ok(path) = std::env::var(ROOT_FOLDER_ENV) {
            if !path.trim().is_empty() {
                return PathBuf::from(path);
            }
        }

        // Priority 3: TOML config file
        if let Some(path) = &self.toml_value {
            return path.clone();
        }

        // Priority 4: OS-dependent compiled default
        default_root_folder()
    }
}

/// Creates the directory layout under the root folder
///
/// ```text
/// <root>/
///   meter_snapshots/<meter_name>/   archive (image + metadata pairs)
///   logs/<type>_readings.jsonl      append-only reading logs
///   logs/provider_attempts.jsonl    provider attempt ledger
/// ```
#[derive(Debug, Clone)]
pub struct RootFolderInitializer {
    root: PathBuf,
}

impl RootFolderInitializer {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.root.join("meter_snapshots")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn attempts_path(&self) -> PathBuf {
        self.log_dir().join("provider_attempts.jsonl")
    }

    /// Create root, archive and log directories if missing
    pub fn ensure_directory_exists(&self) -> Result<()> {
        for dir in [self.root.clone(), self.archive_dir(), self.log_dir()] {
            if !dir.exists() {
                std::fs::create_dir_all(&dir)?;
                info!("Created directory: {}", dir.display());
            }
        }
        Ok(())
    }
}

/// Validate API key (non-empty, non-whitespace)
pub fn is_valid_key(key: &str) -> bool {
    !key.trim().is_empty()
}

/// Resolve a credential from environment then TOML
///
/// Returns `None` when neither source holds a usable value.
pub fn resolve_secret(env_var: &str, toml_value: Option<&str>, label: &str) -> Option<String> {
    let env_value = std::env::var(env_var).ok().filter(|k| is_valid_key(k));
    let toml_value = toml_value.filter(|k| is_valid_key(k));

    match (env_value, toml_value) {
        (Some(env), Some(_)) => {
            warn!(
                "{} found in both environment ({}) and TOML. Using environment.",
                label, env_var
            );
            Some(env)
        }
        (Some(env), None) => {
            info!("{} loaded from environment variable", label);
            Some(env)
        }
        (None, Some(toml)) => {
            info!("{} loaded from TOML config", label);
            Some(toml.to_string())
        }
        (None, None) => None,
    }
}

/// Resolve a provider's API key (`UMR_<KIND>_API_KEY` → TOML)
pub fn resolve_provider_key(section: &ProviderSection) -> Option<String> {
    resolve_secret(
        section.kind.api_key_env(),
        section.api_key.as_deref(),
        &format!("{} API key", section.kind),
    )
}
