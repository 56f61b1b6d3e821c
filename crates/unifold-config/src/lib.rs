//! Configuration and logging setup for unifold hosts.
//!
//! TOML file + `UNIFOLD_`-prefixed environment, layered with `figment`,
//! and translation to `unifold_core::HubConfig`. Also installs the
//! `tracing` subscriber the host logs through.

use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing_subscriber::EnvFilter;

use unifold_core::HubConfig;

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("logging setup failed: {0}")]
    Logging(String),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level TOML configuration.
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub hub: HubSection,

    #[serde(default)]
    pub log: LogSection,
}

/// `[hub]` table.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct HubSection {
    /// Sources refreshed at once; unset refreshes all together.
    pub max_concurrency: Option<usize>,

    #[serde(default = "default_correction_passes")]
    pub correction_passes: usize,

    /// Device ids whose traffic is logged at warn level.
    #[serde(default)]
    pub watched_devices: Vec<String>,

    #[serde(default = "default_true")]
    pub require_code: bool,

    #[serde(default = "default_true")]
    pub require_id: bool,
}

impl Default for HubSection {
    fn default() -> Self {
        Self {
            max_concurrency: None,
            correction_passes: default_correction_passes(),
            watched_devices: Vec::new(),
            require_code: true,
            require_id: true,
        }
    }
}

/// `[log]` table.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct LogSection {
    /// Filter used when `RUST_LOG` is unset, e.g. `"info"` or `"unifold_core=debug"`.
    #[serde(default = "default_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable text.
    #[serde(default)]
    pub json: bool,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: default_level(),
            json: false,
        }
    }
}

fn default_correction_passes() -> usize {
    2
}
fn default_true() -> bool {
    true
}
fn default_level() -> String {
    "info".into()
}

impl Config {
    /// Validate and translate into the core's settings.
    pub fn to_hub_config(&self) -> Result<HubConfig, ConfigError> {
        let hub = &self.hub;
        if hub.max_concurrency == Some(0) {
            return Err(ConfigError::Validation {
                field: "hub.max_concurrency".into(),
                reason: "must be at least 1 (leave unset for no cap)".into(),
            });
        }
        if hub.correction_passes == 0 {
            return Err(ConfigError::Validation {
                field: "hub.correction_passes".into(),
                reason: "must be at least 1".into(),
            });
        }
        Ok(HubConfig {
            max_concurrency: hub.max_concurrency,
            correction_passes: hub.correction_passes,
            watched_devices: hub.watched_devices.clone(),
            require_code: hub.require_code,
            require_id: hub.require_id,
        })
    }
}

// ── Config file path ────────────────────────────────────────────────

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    ProjectDirs::from("dev", "unifold", "unifold").map_or_else(
        || {
            let mut p = dirs_fallback();
            p.push("config.toml");
            p
        },
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

fn dirs_fallback() -> PathBuf {
    let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
    p.push(".config");
    p.push("unifold");
    p
}

// ── Config loading ──────────────────────────────────────────────────

/// Load the full Config from the canonical file + environment.
///
/// Environment keys nest with a double underscore:
/// `UNIFOLD_HUB__MAX_CONCURRENCY=4`.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(&config_path())
}

/// Load from an explicit file path, still layering the environment on top.
pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    let figment = Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("UNIFOLD_").split("__"));

    let config: Config = figment.extract()?;
    Ok(config)
}

/// Load config, returning a default if the file doesn't exist.
pub fn load_config_or_default() -> Config {
    load_config().unwrap_or_default()
}

// ── Config saving ───────────────────────────────────────────────────

/// Serialize config to TOML and write to the canonical config path.
pub fn save_config(cfg: &Config) -> Result<(), ConfigError> {
    save_config_to(cfg, &config_path())
}

pub fn save_config_to(cfg: &Config, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let toml_str = toml::to_string_pretty(cfg)?;
    std::fs::write(path, toml_str)?;
    Ok(())
}

// ── Logging ─────────────────────────────────────────────────────────

/// Install the global `tracing` subscriber. `RUST_LOG` wins over `log.level`.
pub fn init_tracing(log: &LogSection) -> Result<(), ConfigError> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    let installed = if log.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| ConfigError::Logging(e.to_string()))
}
