//! ==============================================================================
//! config.rs - Runtime Configuration Loader
//! ==============================================================================
//!
//! purpose:
//!     defines the schema for `garden.toml`.
//!     loads configuration from file or falls back to defaults.
//!
//! structure:
//!     - BackendConfig: where the garden REST api lives and how to auth.
//!     - CacheConfig: directory holding last-known state per garden.
//!     - ServerConfig: bind address of the local live-view api.
//!     - LoggingConfig: default tracing filter.
//!     - GardenConfig: optional "current garden" hint for first selection.
//!     - TimingConfig: cooldown and staleness intervals.
//!
//! ==============================================================================

use anyhow::Context;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cooldown::DEFAULT_COOLDOWN_SECS;
use crate::staleness::{DEFAULT_STALE_CHECK_SECS, DEFAULT_STALE_THRESHOLD_SECS};

/// Root configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct DashboardConfig {
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub garden: GardenConfig,
    #[serde(default)]
    pub timing: TimingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BackendConfig {
    pub base_url: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    pub dir: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    pub level: String,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct GardenConfig {
    /// garden to prefer when nothing was selected before
    #[serde(default)]
    pub hint: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq)]
#[serde(default)]
pub struct TimingConfig {
    pub cooldown_seconds: u32,
    pub stale_check_seconds: u64,
    pub stale_threshold_seconds: u64,
    pub history_limit: usize,
}

fn default_timeout() -> u64 {
    10
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:5000/api".to_string(),
            token: None,
            timeout_seconds: default_timeout(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { dir: PathBuf::from(".garden-cache") }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { bind: "0.0.0.0:3000".to_string() }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string() }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            cooldown_seconds: DEFAULT_COOLDOWN_SECS,
            stale_check_seconds: DEFAULT_STALE_CHECK_SECS,
            stale_threshold_seconds: DEFAULT_STALE_THRESHOLD_SECS,
            history_limit: 24,
        }
    }
}

impl TimingConfig {
    pub fn stale_check(&self) -> Duration {
        Duration::from_secs(self.stale_check_seconds.max(1))
    }

    pub fn stale_threshold(&self) -> Duration {
        Duration::from_secs(self.stale_threshold_seconds)
    }
}

impl DashboardConfig {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;

        let config: DashboardConfig = toml::from_str(&content)
            .with_context(|| format!("failed to parse config {}", path.display()))?;

        Ok(config)
    }

    /// Load with default fallback
    pub fn load_or_default() -> Self {
        let paths = [
            PathBuf::from("config").join("garden.toml"),
            PathBuf::from("..").join("config").join("garden.toml"),
        ];

        for path in &paths {
            if path.exists() {
                match Self::load(path) {
                    Ok(config) => {
                        println!("[CONFIG] Loaded from {}", path.display());
                        return config;
                    }
                    Err(e) => {
                        println!("[CONFIG] Warning: Failed to load {}: {}", path.display(), e);
                    }
                }
            }
        }

        println!("[CONFIG] Warning: No config file found - using defaults");
        Self::default()
    }

    /// Print configuration summary
    pub fn print_summary(&self) {
        println!("┌─────────────────────────────────────────┐");
        println!("│         GARDEN LIVE CONFIGURATION       │");
        println!("├─────────────────────────────────────────┤");
        println!("│ Backend: {}", self.backend.base_url);
        println!("│ Cache Dir: {}", self.cache.dir.display());
        println!("│ Listen: {}", self.server.bind);
        println!("│ Cooldown: {}s", self.timing.cooldown_seconds);
        println!(
            "│ Staleness: check {}s / threshold {}s",
            self.timing.stale_check_seconds, self.timing.stale_threshold_seconds
        );
        println!("│ Log Level: {}", self.logging.level);
        println!("└─────────────────────────────────────────┘");
    }
}
