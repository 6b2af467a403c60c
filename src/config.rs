//! TOML configuration for pimbridge.
//!
//! Every section has compiled-in defaults, so a partial (or missing) file is
//! fine. The file location can be overridden with `PIMBRIDGE_CONFIG`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::accel::{Precision, RuntimeKind};

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "PIMBRIDGE_CONFIG";

/// Standard system location checked when no override is given.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/pimbridge/pimbridge.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PimBridgeConfig {
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub verify: VerifyConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl PimBridgeConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded pimbridge configuration");
        Ok(config)
    }

    /// Try to load configuration from, in order:
    /// 1. The path specified by `PIMBRIDGE_CONFIG`.
    /// 2. `/etc/pimbridge/pimbridge.toml`.
    /// 3. Compiled-in defaults.
    pub fn load_or_default() -> Self {
        let env_path = std::env::var_os(CONFIG_ENV).map(PathBuf::from);
        Self::load_first(env_path.as_deref(), Path::new(SYSTEM_CONFIG_PATH))
    }

    fn load_first(env_path: Option<&Path>, system_path: &Path) -> Self {
        // 1. Environment variable override.
        if let Some(path) = env_path {
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "PIMBRIDGE_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        // 2. Standard system location.
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        // 3. Defaults.
        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("failed to serialize configuration")
    }
}

// ---------------------------------------------------------------------------
// Runtime
// ---------------------------------------------------------------------------

/// Which runtime to bring up and how.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Runtime flavour passed to `initialize`.
    pub kind: RuntimeKind,
    /// Numeric format passed to `initialize` and every descriptor.
    pub precision: Precision,
    /// Artificial per-execution latency of the host emulator (microseconds).
    pub emulator_latency_us: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            kind: RuntimeKind::Emulator,
            precision: Precision::Fp16,
            emulator_latency_us: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Verification
// ---------------------------------------------------------------------------

/// Functional verification settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifyConfig {
    /// Maximum absolute difference tolerated between accelerator and
    /// reference output.
    pub tolerance: f32,
    /// Worker count for the concurrency check.
    pub threads: usize,
    /// Seed for generated operands.
    pub seed: u64,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            tolerance: 1e-2,
            threads: 4,
            seed: 1235,
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Text,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level (`trace`, `debug`, `info`, `warn`, `error`).
    /// `RUST_LOG` wins when set.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
