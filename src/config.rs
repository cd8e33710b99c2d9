//! Configuration for scribeflow paths and policies.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (SCRIBEFLOW_HOME)
//! 2. Config file (.scribeflow/config.yaml)
//! 3. Defaults (~/.scribeflow)
//!
//! Config file discovery:
//! - Searches current directory and parents for .scribeflow/config.yaml
//! - Paths in config file are relative to the config file's parent directory

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub device: DeviceConfigFile,
    #[serde(default)]
    pub server: ServerConfigFile,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeviceConfigFile {
    /// Device state directory (relative to config file)
    pub home: Option<String>,
    /// Directory watched for finished capture files
    pub captures_dir: Option<String>,
    pub upload_concurrency: Option<usize>,
    pub ack_grace_hours: Option<u64>,
    pub retry: Option<RetryPolicy>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerConfigFile {
    /// Ingestion endpoint base URL the device uploads to
    pub base_url: Option<String>,
    /// Server state directory (relative to config file)
    pub data_dir: Option<String>,
    pub stage_timeout_seconds: Option<u64>,
    pub stage_retry: Option<RetryPolicy>,
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct Config {
    pub device: DeviceSettings,
    pub server: ServerSettings,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct DeviceSettings {
    /// Absolute path to device state (queue log, media copies)
    pub home: PathBuf,
    /// Absolute path to the watched captures directory
    pub captures_dir: PathBuf,
    /// Bound on concurrent uploads over a constrained link
    pub upload_concurrency: usize,
    /// How long an acknowledged entry is kept before it may be purged
    pub ack_grace: Duration,
    pub retry: RetryPolicy,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub base_url: String,
    /// Absolute path to server state (record logs, blobs, audit ledger)
    pub data_dir: PathBuf,
    /// Per-stage transform timeout
    pub stage_timeout: Duration,
    pub stage_retry: RetryPolicy,
}

impl Config {
    /// Load configuration, falling back to defaults when no config file
    /// is found.
    pub fn load() -> Result<Self> {
        let config_file = find_config_file();
        let (raw, base) = match &config_file {
            Some(path) => {
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config file: {}", path.display()))?;
                let raw: ConfigFile =
                    serde_yaml::from_str(&content).context("Failed to parse config YAML")?;
                // Paths resolve relative to the directory holding .scribeflow/
                let base = path
                    .parent()
                    .and_then(Path::parent)
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| PathBuf::from("."));
                (raw, base)
            }
            None => (ConfigFile::default(), PathBuf::from(".")),
        };

        let home = match std::env::var("SCRIBEFLOW_HOME") {
            Ok(value) => PathBuf::from(value),
            Err(_) => match &raw.device.home {
                Some(rel) => base.join(rel),
                None => default_home()?,
            },
        };

        let captures_dir = raw
            .device
            .captures_dir
            .as_ref()
            .map(|rel| base.join(rel))
            .unwrap_or_else(|| home.join("captures"));

        let data_dir = raw
            .server
            .data_dir
            .as_ref()
            .map(|rel| base.join(rel))
            .unwrap_or_else(|| home.join("server"));

        Ok(Self {
            device: DeviceSettings {
                home,
                captures_dir,
                upload_concurrency: raw.device.upload_concurrency.unwrap_or(3),
                ack_grace: Duration::from_secs(raw.device.ack_grace_hours.unwrap_or(24) * 3600),
                retry: raw.device.retry.unwrap_or_default(),
            },
            server: ServerSettings {
                base_url: raw
                    .server
                    .base_url
                    .unwrap_or_else(|| "http://localhost:3000".to_string()),
                data_dir,
                stage_timeout: Duration::from_secs(
                    raw.server.stage_timeout_seconds.unwrap_or(300),
                ),
                stage_retry: raw
                    .server
                    .stage_retry
                    .unwrap_or_else(RetryPolicy::stage_default),
            },
            config_file,
        })
    }
}

/// Default device home (~/.scribeflow)
fn default_home() -> Result<PathBuf> {
    dirs::home_dir()
        .map(|home| home.join(".scribeflow"))
        .context("Could not determine home directory")
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".scribeflow").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            return None;
        }
    }
}

/// Retry policy: exponential backoff with a cap and jitter, bounded
/// attempts. Entries that exhaust the budget are surfaced, never dropped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including first try)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay between retries in milliseconds
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Maximum delay between retries in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Jitter fraction applied to each delay (0.25 = ±25%)
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_max_attempts() -> u32 {
    8
}
fn default_initial_delay() -> u64 {
    1000
}
fn default_max_delay() -> u64 {
    60_000
}
fn default_jitter() -> f64 {
    0.25
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            jitter: default_jitter(),
        }
    }
}

impl RetryPolicy {
    /// Defaults for server-side stage retries.
    pub fn stage_default() -> Self {
        Self {
            max_attempts: 3,
            ..Default::default()
        }
    }

    /// Base delay for a specific attempt (1-indexed), before jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::from_millis(self.initial_delay_ms.min(self.max_delay_ms));
        }

        let delay = self.initial_delay_ms as f64 * 2f64.powi((attempt - 1) as i32);
        let capped = delay.min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(capped)
    }

    /// Delay with jitter applied, for actual scheduling.
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        use rand::Rng;

        let base = self.delay_for_attempt(attempt);
        if self.jitter <= 0.0 {
            return base;
        }
        let factor = rand::thread_rng().gen_range(1.0 - self.jitter..=1.0 + self.jitter);
        base.mul_f64(factor.max(0.0))
    }

    /// Check if we should retry based on attempt count
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}
