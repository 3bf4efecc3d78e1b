//! Configuration file support.
//!
//! Configuration is loaded from `$XDG_CONFIG_HOME/consult/config.toml`.

use crate::performance::{PerformanceThresholds, FRAME_BUDGET_MS};
use crate::types::PerformanceMode;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application configuration
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub data: DataConfig,

    #[serde(default)]
    pub performance: PerformanceConfig,

    #[serde(default)]
    pub recovery: RecoveryConfig,
}

/// Data storage configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DataConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Prefix for every persisted key
    #[serde(default = "default_namespace")]
    pub namespace: String,

    #[serde(default = "default_persist_debounce_ms")]
    pub persist_debounce_ms: u64,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            namespace: default_namespace(),
            persist_debounce_ms: default_persist_debounce_ms(),
        }
    }
}

impl DataConfig {
    pub fn persist_debounce(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.persist_debounce_ms as i64)
    }
}

/// Performance monitor configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PerformanceConfig {
    #[serde(default = "default_sample_interval_ms")]
    pub sample_interval_ms: u64,

    /// Upper bound on the memory limit; unset follows the performance mode
    #[serde(default)]
    pub memory_limit_mb: Option<f64>,

    #[serde(default = "default_memory_warning_ratio")]
    pub memory_warning_ratio: f64,

    #[serde(default = "default_ai_response_warning_ms")]
    pub ai_response_warning_ms: f64,

    #[serde(default = "default_transcription_latency_warning_ms")]
    pub transcription_latency_warning_ms: f64,

    /// Treat the host as mobile regardless of detection
    #[serde(default)]
    pub force_mobile: Option<bool>,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: default_sample_interval_ms(),
            memory_limit_mb: None,
            memory_warning_ratio: default_memory_warning_ratio(),
            ai_response_warning_ms: default_ai_response_warning_ms(),
            transcription_latency_warning_ms: default_transcription_latency_warning_ms(),
            force_mobile: None,
        }
    }
}

impl PerformanceConfig {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms.max(1))
    }

    pub fn thresholds(&self) -> PerformanceThresholds {
        PerformanceThresholds {
            memory_limit_mb: self
                .memory_limit_mb
                .unwrap_or_else(|| PerformanceMode::default().memory_threshold_mb()),
            memory_warning_ratio: self.memory_warning_ratio,
            ai_response_warning_ms: self.ai_response_warning_ms,
            transcription_latency_warning_ms: self.transcription_latency_warning_ms,
            render_budget_ms: FRAME_BUDGET_MS,
        }
    }
}

/// Error recovery configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// How long network recovery waits for connectivity
    #[serde(default = "default_network_timeout_secs")]
    pub network_timeout_secs: u64,

    /// Active consultations older than this are archived by storage cleanup
    #[serde(default = "default_stale_consultation_days")]
    pub stale_consultation_days: i64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            network_timeout_secs: default_network_timeout_secs(),
            stale_consultation_days: default_stale_consultation_days(),
        }
    }
}

impl RecoveryConfig {
    pub fn network_timeout(&self) -> Duration {
        Duration::from_secs(self.network_timeout_secs)
    }

    pub fn stale_consultation_age(&self) -> chrono::Duration {
        chrono::Duration::days(self.stale_consultation_days)
    }
}

// Default value functions
fn default_data_dir() -> PathBuf {
    let base = dirs::data_local_dir().unwrap_or_else(|| home_dir().join(".local/share"));
    base.join("consult")
}

fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

fn default_namespace() -> String {
    "consult".into()
}

fn default_persist_debounce_ms() -> u64 {
    1000
}

fn default_sample_interval_ms() -> u64 {
    5000
}

fn default_memory_warning_ratio() -> f64 {
    0.8
}

fn default_ai_response_warning_ms() -> f64 {
    5000.0
}

fn default_transcription_latency_warning_ms() -> f64 {
    2000.0
}

fn default_network_timeout_secs() -> u64 {
    30
}

fn default_stale_consultation_days() -> i64 {
    7
}

impl Config {
    /// Load configuration from the standard config path
    pub fn load() -> Result<Self> {
        let config_path = Self::default_config_path();
        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        tracing::info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        let base = dirs::config_dir().unwrap_or_else(|| home_dir().join(".config"));
        base.join("consult").join("config.toml")
    }

    /// Save the current configuration to the default path
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::default_config_path())
    }

    /// Save the current configuration to a specific path
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, contents)?;
        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }
}
