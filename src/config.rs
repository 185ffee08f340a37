use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Top-level configuration for the debug terminal.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Byte source configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Ingest ring configuration.
    #[serde(default)]
    pub ingest: IngestConfig,

    /// Message pool configuration.
    #[serde(default)]
    pub pool: PoolConfig,

    /// Adaptive processing interval configuration.
    #[serde(default)]
    pub pacing: PacingConfig,

    /// Text log sink configuration.
    #[serde(default)]
    pub log_sink: LogSinkConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,

    /// How often to log per-kind record counts. Default: 10s.
    #[serde(default = "default_stats_interval", with = "humantime_serde")]
    pub stats_interval: Duration,
}

/// Byte source configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TransportConfig {
    /// "stdin", "file:<path>" or "tcp:<host:port>". Default: "stdin".
    #[serde(default = "default_transport_source")]
    pub source: String,

    /// Bytes requested per read. Default: 4096.
    #[serde(default = "default_read_size")]
    pub read_size: usize,

    /// Chunks buffered between the reader task and the pipeline. Default: 1024.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

/// Ingest ring configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    /// Ring capacity in bytes. Default: 1MiB.
    #[serde(default = "default_ingest_capacity")]
    pub capacity: usize,
}

/// Message pool configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    /// Number of pre-allocated slots. Default: 100.
    #[serde(default = "default_pool_slots")]
    pub slots: usize,

    /// Hold time after which a slot is reported as slow. Default: 100ms.
    #[serde(default = "default_slow_consumer_threshold", with = "humantime_serde")]
    pub slow_consumer_threshold: Duration,

    /// Exhaustion lasting this long is reported once per episode. Default: 1s.
    #[serde(default = "default_exhaustion_report_after", with = "humantime_serde")]
    pub exhaustion_report_after: Duration,
}

/// Adaptive processing interval configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PacingConfig {
    /// Interval at low message rates. Default: 2ms.
    #[serde(default = "default_min_interval", with = "humantime_serde")]
    pub min_interval: Duration,

    /// Interval during bursts. Default: 20ms.
    #[serde(default = "default_max_interval", with = "humantime_serde")]
    pub max_interval: Duration,

    /// Weight kept by the previous interval on each update, in [0, 1).
    /// Default: 0.8.
    #[serde(default = "default_decay_factor")]
    pub decay_factor: f64,

    /// Rate (messages/s) at or below which the interval targets the minimum.
    /// Default: 50.
    #[serde(default = "default_low_rate")]
    pub low_rate: f64,

    /// Rate (messages/s) at or above which the interval targets the maximum.
    /// Default: 2000.
    #[serde(default = "default_high_rate")]
    pub high_rate: f64,
}

/// Text log sink configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LogSinkConfig {
    /// Write records to the log. Default: true.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Append records to this file instead of stdout.
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Prefix each line with a local timestamp. Default: false.
    #[serde(default)]
    pub timestamps: bool,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Serve /metrics and /healthz. Default: true.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_stats_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_transport_source() -> String {
    "stdin".to_string()
}

fn default_read_size() -> usize {
    4096
}

fn default_channel_capacity() -> usize {
    1024
}

fn default_ingest_capacity() -> usize {
    crate::ingest::DEFAULT_CAPACITY
}

fn default_pool_slots() -> usize {
    crate::pool::DEFAULT_SLOTS
}

fn default_slow_consumer_threshold() -> Duration {
    Duration::from_millis(100)
}

fn default_exhaustion_report_after() -> Duration {
    Duration::from_secs(1)
}

fn default_min_interval() -> Duration {
    Duration::from_millis(2)
}

fn default_max_interval() -> Duration {
    Duration::from_millis(20)
}

fn default_decay_factor() -> f64 {
    0.8
}

fn default_low_rate() -> f64 {
    50.0
}

fn default_high_rate() -> f64 {
    2000.0
}

fn default_true() -> bool {
    true
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            transport: TransportConfig::default(),
            ingest: IngestConfig::default(),
            pool: PoolConfig::default(),
            pacing: PacingConfig::default(),
            log_sink: LogSinkConfig::default(),
            health: HealthConfig::default(),
            stats_interval: default_stats_interval(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            source: default_transport_source(),
            read_size: default_read_size(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            capacity: default_ingest_capacity(),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            slots: default_pool_slots(),
            slow_consumer_threshold: default_slow_consumer_threshold(),
            exhaustion_report_after: default_exhaustion_report_after(),
        }
    }
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            min_interval: default_min_interval(),
            max_interval: default_max_interval(),
            decay_factor: default_decay_factor(),
            low_rate: default_low_rate(),
            high_rate: default_high_rate(),
        }
    }
}

impl Default for LogSinkConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: None,
            timestamps: false,
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        InputSource::parse(&self.transport.source)
            .with_context(|| format!("transport.source {:?}", self.transport.source))?;

        if self.transport.read_size == 0 {
            bail!("transport.read_size must be positive");
        }

        if self.transport.channel_capacity == 0 {
            bail!("transport.channel_capacity must be positive");
        }

        if self.ingest.capacity == 0 {
            bail!("ingest.capacity must be positive");
        }

        if self.pool.slots == 0 {
            bail!("pool.slots must be positive");
        }

        if self.pool.slots > u32::MAX as usize {
            bail!("pool.slots must fit in 32 bits");
        }

        if self.pool.slow_consumer_threshold.is_zero() {
            bail!("pool.slow_consumer_threshold must be positive");
        }

        let pacing = &self.pacing;
        if pacing.min_interval.is_zero() {
            bail!("pacing.min_interval must be positive");
        }

        if pacing.max_interval < pacing.min_interval {
            bail!("pacing.max_interval must not be below pacing.min_interval");
        }

        if !(0.0..1.0).contains(&pacing.decay_factor) {
            bail!("pacing.decay_factor must be in [0, 1)");
        }

        if !(pacing.low_rate >= 0.0 && pacing.high_rate > pacing.low_rate) {
            bail!("pacing.high_rate must be greater than pacing.low_rate (both non-negative)");
        }

        if self.stats_interval.is_zero() {
            bail!("stats_interval must be positive");
        }

        if self.health.enabled && self.health.addr.is_empty() {
            bail!("health.addr is required when enabled");
        }

        Ok(())
    }
}

/// Where transport bytes come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputSource {
    Stdin,
    /// Replay of a captured session.
    File(PathBuf),
    /// Serial-over-network bridge.
    Tcp(String),
}

impl InputSource {
    pub fn parse(source: &str) -> Result<Self> {
        if source.eq_ignore_ascii_case("stdin") || source == "-" {
            return Ok(Self::Stdin);
        }

        if let Some(path) = source.strip_prefix("file:") {
            if path.is_empty() {
                bail!("file source needs a path");
            }
            return Ok(Self::File(PathBuf::from(path)));
        }

        if let Some(addr) = source.strip_prefix("tcp:") {
            if !addr.contains(':') {
                bail!("tcp source needs host:port");
            }
            return Ok(Self::Tcp(addr.to_string()));
        }

        bail!("unknown input source (expected stdin, file:<path> or tcp:<host:port>)");
    }
}

impl std::fmt::Display for InputSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stdin => f.write_str("stdin"),
            Self::File(path) => write!(f, "file:{}", path.display()),
            Self::Tcp(addr) => write!(f, "tcp:{addr}"),
        }
    }
}
