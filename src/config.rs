//! Engine configuration.
//!
//! All knobs the algorithms honor (retry budget, backoff window, lock wait,
//! circuit breaker thresholds) live here with sensible defaults. Nothing in
//! the engine hardwires these values.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::{clog_debug, Error, Result};

fn default_max_attempts() -> u32 {
    5
}
fn default_base_delay_ms() -> u64 {
    1_000
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_jitter_fraction() -> f64 {
    0.25
}
fn default_lock_timeout_ms() -> u64 {
    5_000
}
fn default_breaker_threshold() -> u32 {
    5
}
fn default_breaker_cooldown_ms() -> u64 {
    60_000
}
fn default_checkpoint_keep_last() -> usize {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Directory holding the task table and checkpoint files.
    /// Defaults to ~/.conductor when unset.
    pub data_dir: Option<PathBuf>,

    /// Hard ceiling on retry attempts for one logical operation.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// First backoff delay in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Backoff cap in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Uniform jitter applied to each delay, as a fraction of the delay.
    #[serde(default = "default_jitter_fraction")]
    pub jitter_fraction: f64,

    /// Bounded wait for a per-task lock before surfacing a transient failure.
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,

    /// Consecutive failures of one operation kind before the breaker opens.
    #[serde(default = "default_breaker_threshold")]
    pub breaker_threshold: u32,

    /// Cool-down before an open breaker half-opens for a trial call.
    #[serde(default = "default_breaker_cooldown_ms")]
    pub breaker_cooldown_ms: u64,

    /// Checkpoints retained per task by a default prune.
    #[serde(default = "default_checkpoint_keep_last")]
    pub checkpoint_keep_last: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter_fraction: default_jitter_fraction(),
            lock_timeout_ms: default_lock_timeout_ms(),
            breaker_threshold: default_breaker_threshold(),
            breaker_cooldown_ms: default_breaker_cooldown_ms(),
            checkpoint_keep_last: default_checkpoint_keep_last(),
        }
    }
}

impl EngineConfig {
    pub fn conductor_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".conductor"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::conductor_dir()?.join("conductor.toml"))
    }

    /// Resolve the effective data directory.
    pub fn effective_data_dir(&self) -> Result<PathBuf> {
        match &self.data_dir {
            Some(dir) => Ok(expand_tilde(&dir.to_string_lossy())),
            None => Self::conductor_dir(),
        }
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn breaker_cooldown(&self) -> Duration {
        Duration::from_millis(self.breaker_cooldown_ms)
    }

    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        clog_debug!("EngineConfig::load path={}", path.display());
        if !path.exists() {
            clog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(&path)?)?;
        clog_debug!(
            "Config loaded: max_attempts={}, lock_timeout_ms={}",
            config.max_attempts,
            config.lock_timeout_ms
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let dir = Self::conductor_dir()?;
        if !dir.exists() {
            fs::create_dir_all(&dir)?;
        }
        let path = Self::config_path()?;
        fs::write(&path, toml::to_string_pretty(self)?)?;
        clog_debug!("Config saved to {}", path.display());
        Ok(())
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        let data_dir = self.effective_data_dir()?;
        let checkpoints = data_dir.join("checkpoints");
        if !checkpoints.exists() {
            clog_debug!("Creating data directories under {}", data_dir.display());
            fs::create_dir_all(&checkpoints)?;
        }
        Ok(())
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
