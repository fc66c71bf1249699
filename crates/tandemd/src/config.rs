//! Daemon configuration
//!
//! Settings come from CLI flags (with environment fallbacks), then an
//! optional TOML file, then built-in defaults.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use tandem_core::DEFAULT_AWARENESS_TIMEOUT;
use tandem_protocol::{DEFAULT_COMPRESSION_THRESHOLD, DEFAULT_MAX_FRAME_SIZE};
use tandem_transport::broker::DEFAULT_COMPACT_THRESHOLD;
use tandem_transport::{DEFAULT_KEEPALIVE_TIMEOUT, DEFAULT_OUTBOUND_CAPACITY};

pub const DEFAULT_BIND: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 1234;
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Contents of a `--config` file. Every key is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub bind: Option<String>,
    pub port: Option<u16>,
    pub compression_threshold: Option<usize>,
    pub max_frame_size: Option<usize>,
    pub awareness_timeout_ms: Option<u64>,
    pub sweep_interval_ms: Option<u64>,
    pub compact_threshold: Option<usize>,
    pub keepalive_timeout_ms: Option<u64>,
    pub outbound_queue: Option<usize>,
    pub rate_limit: Option<u32>,
    pub rate_burst: Option<u32>,
    pub metrics_port: Option<u16>,
    pub log_level: Option<String>,
}

impl FileConfig {
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("invalid config file {}", path.display()))
    }
}

/// Fully resolved daemon settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub bind: String,
    pub port: u16,
    pub compression_threshold: usize,
    pub max_frame_size: usize,
    pub awareness_timeout: Duration,
    pub sweep_interval: Duration,
    pub compact_threshold: usize,
    /// Unanswered ping deadline, also bounds a single socket write
    pub keepalive_timeout: Duration,
    /// Frames queued per connection before it is closed as stalled
    pub outbound_queue: usize,
    /// Frames per second per connection, 0 = disabled
    pub rate_limit: u32,
    pub rate_burst: u32,
    pub metrics_port: Option<u16>,
    pub log_level: String,
}

impl Settings {
    /// Merge explicit values (`overrides`, from flags or environment) over
    /// the file, then fill the gaps with defaults
    pub fn resolve(overrides: FileConfig, file: FileConfig) -> Result<Self> {
        let rate_limit = overrides.rate_limit.or(file.rate_limit).unwrap_or(0);
        let settings = Self {
            bind: overrides.bind.or(file.bind).unwrap_or_else(|| DEFAULT_BIND.to_string()),
            port: overrides.port.or(file.port).unwrap_or(DEFAULT_PORT),
            compression_threshold: overrides
                .compression_threshold
                .or(file.compression_threshold)
                .unwrap_or(DEFAULT_COMPRESSION_THRESHOLD),
            max_frame_size: overrides
                .max_frame_size
                .or(file.max_frame_size)
                .unwrap_or(DEFAULT_MAX_FRAME_SIZE),
            awareness_timeout: overrides
                .awareness_timeout_ms
                .or(file.awareness_timeout_ms)
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_AWARENESS_TIMEOUT),
            sweep_interval: overrides
                .sweep_interval_ms
                .or(file.sweep_interval_ms)
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_SWEEP_INTERVAL),
            compact_threshold: overrides
                .compact_threshold
                .or(file.compact_threshold)
                .unwrap_or(DEFAULT_COMPACT_THRESHOLD),
            keepalive_timeout: overrides
                .keepalive_timeout_ms
                .or(file.keepalive_timeout_ms)
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_KEEPALIVE_TIMEOUT),
            outbound_queue: overrides
                .outbound_queue
                .or(file.outbound_queue)
                .unwrap_or(DEFAULT_OUTBOUND_CAPACITY),
            rate_limit,
            rate_burst: overrides
                .rate_burst
                .or(file.rate_burst)
                .unwrap_or(rate_limit.saturating_mul(2)),
            metrics_port: overrides.metrics_port.or(file.metrics_port),
            log_level: overrides
                .log_level
                .or(file.log_level)
                .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string()),
        };
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        if self.max_frame_size < 16 {
            anyhow::bail!("max frame size {} is too small", self.max_frame_size);
        }
        if self.sweep_interval.is_zero() {
            anyhow::bail!("sweep interval must be positive");
        }
        if self.awareness_timeout.is_zero() {
            anyhow::bail!("awareness timeout must be positive");
        }
        if self.keepalive_timeout.is_zero() {
            anyhow::bail!("keepalive timeout must be positive");
        }
        if self.outbound_queue == 0 {
            anyhow::bail!("outbound queue must hold at least one frame");
        }
        self.listen_addr()?;
        Ok(())
    }

    pub fn listen_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.bind, self.port)
            .parse()
            .with_context(|| format!("invalid bind address {}:{}", self.bind, self.port))
    }

    pub fn metrics_addr(&self) -> Result<Option<SocketAddr>> {
        self.metrics_port
            .map(|port| {
                format!("{}:{}", self.bind, port)
                    .parse()
                    .with_context(|| format!("invalid metrics address {}:{}", self.bind, port))
            })
            .transpose()
    }
}
