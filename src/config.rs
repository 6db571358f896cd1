use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::classifier::RetryPolicy;
use crate::decision::Thresholds;

pub static CONFIG_PATH: Lazy<&'static Path> = Lazy::new(|| {
    Path::new(option_env!("FACEGATE_CONFIG_PATH").unwrap_or("/usr/local/etc/facegate/config.toml"))
});

pub static DATA_PREFIX: Lazy<&'static Path> = Lazy::new(|| {
    Path::new(option_env!("FACEGATE_DATA_PREFIX").unwrap_or("/usr/local/var/facegate"))
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub oracle_url: String,
    pub threshold: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_distance: Option<f64>,
    pub timeout_ms: u64,
    pub retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub jitter: bool,
    pub access_point: String,
    pub ledger_path: PathBuf,
    pub residents_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            oracle_url: "http://localhost:5000".to_string(),
            threshold: 0.6,
            max_distance: None,
            timeout_ms: 5000,
            retries: 2,
            backoff_base_ms: 200,
            backoff_max_ms: 2000,
            jitter: true,
            access_point: "Main Gate".to_string(),
            ledger_path: DATA_PREFIX.join("ledger.bin"),
            residents_path: DATA_PREFIX.join("residents.toml"),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if !self.threshold.is_finite() || !(0.0..=1.0).contains(&self.threshold) {
            anyhow::bail!("threshold must be within [0, 1], got {}", self.threshold);
        }
        if let Some(max) = self.max_distance {
            if !max.is_finite() || max < 0.0 {
                anyhow::bail!("max_distance must be a non-negative number, got {max}");
            }
        }
        if self.timeout_ms == 0 {
            anyhow::bail!("timeout_ms must be greater than zero");
        }
        if self.backoff_base_ms > self.backoff_max_ms {
            anyhow::bail!(
                "backoff_base_ms ({}) exceeds backoff_max_ms ({})",
                self.backoff_base_ms,
                self.backoff_max_ms
            );
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn thresholds(&self) -> Thresholds {
        Thresholds {
            confidence: self.threshold,
            max_distance: self.max_distance,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            retries: self.retries,
            base_delay: Duration::from_millis(self.backoff_base_ms),
            max_delay: Duration::from_millis(self.backoff_max_ms),
            jitter: self.jitter,
        }
    }
}

pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let path = path.unwrap_or(&CONFIG_PATH);
    if !path.exists() {
        return Ok(Config::default());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading config at {}", path.display()))?;
    let cfg: Config =
        toml::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validating config {}", path.display()))?;
    Ok(cfg)
}

pub fn save_config(cfg: &Config, path: Option<&Path>) -> Result<()> {
    let path = path.unwrap_or(&CONFIG_PATH);
    let data = toml::to_string_pretty(cfg)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, data)?;
    Ok(())
}
