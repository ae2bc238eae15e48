//! Configuration for the lanwatch discovery engine.

use std::time::Duration;

use serde::Deserialize;

use crate::error::{DiscoverError, Result};

/// Top-level discover configuration.
///
/// Loaded from the `[discover]` section of `lanwatch.toml` or
/// `LANWATCH_DISCOVER__` environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct DiscoverConfig {
    /// Seconds between the start of two scan cycles.
    #[serde(default = "default_scan_interval")]
    pub scan_interval_secs: u64,

    /// Deadline for one engine session, in milliseconds.
    #[serde(default = "default_scan_duration")]
    pub scan_duration_ms: u64,

    /// Interface to prefer when resolving the local network.
    #[serde(default)]
    pub interface: Option<String>,

    #[serde(default)]
    pub scanners: ScannersConfig,

    #[serde(default)]
    pub sweep: SweepConfig,
}

/// Which discovery methods take part in a scan cycle.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScannersConfig {
    #[serde(default)]
    pub arp: ScannerToggle,
    #[serde(default)]
    pub ssdp: ScannerToggle,
    #[serde(default)]
    pub mdns: ScannerToggle,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScannerToggle {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// ARP subnet sweep tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct SweepConfig {
    /// Seconds after which the full sweep stops dispatching new targets.
    #[serde(default = "default_sweep_timeout")]
    pub timeout_secs: u64,

    /// Maximum stimulation workers in flight.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
}

impl DiscoverConfig {
    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs)
    }

    pub fn scan_duration(&self) -> Duration {
        Duration::from_millis(self.scan_duration_ms)
    }

    /// Load from `<file_prefix>.toml` (optional) and the environment.
    /// Falls back to defaults when no `[discover]` section is present.
    pub fn load(file_prefix: &str) -> Result<Self> {
        let cfg = config::Config::builder()
            .add_source(config::File::with_name(file_prefix).required(false))
            .add_source(
                // LANWATCH_DISCOVER__SCAN_INTERVAL_SECS -> discover.scan_interval_secs
                config::Environment::with_prefix("LANWATCH")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| DiscoverError::Config(e.to_string()))?;

        Self::from_config(&cfg)
    }

    fn from_config(cfg: &config::Config) -> Result<Self> {
        match cfg.get::<DiscoverConfig>("discover") {
            Ok(c) => Ok(c),
            Err(config::ConfigError::NotFound(_)) => Ok(DiscoverConfig::default()),
            Err(e) => Err(DiscoverError::Config(e.to_string())),
        }
    }
}

impl SweepConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_scan_interval() -> u64 {
    10
}

fn default_scan_duration() -> u64 {
    5_000
}

fn default_sweep_timeout() -> u64 {
    60
}

fn default_max_concurrent() -> usize {
    200
}

fn default_true() -> bool {
    true
}

impl Default for DiscoverConfig {
    fn default() -> Self {
        Self {
            scan_interval_secs: default_scan_interval(),
            scan_duration_ms: default_scan_duration(),
            interface: None,
            scanners: ScannersConfig::default(),
            sweep: SweepConfig::default(),
        }
    }
}

impl Default for ScannerToggle {
    fn default() -> Self {
        Self {
            enabled: default_true(),
        }
    }
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_sweep_timeout(),
            max_concurrent: default_max_concurrent(),
        }
    }
}
