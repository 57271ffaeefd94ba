use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::de::IgnoredAny;
use serde::{Deserialize, Deserializer};

/// Top-level configuration for the collector.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Durable segment buffer configuration.
    #[serde(default)]
    pub buffer: BufferConfig,

    /// Window and persistence configuration.
    #[serde(default)]
    pub aggregation: AggregationConfig,

    /// Downstream exporter configuration.
    #[serde(default)]
    pub exporter: ExporterConfig,

    /// Metrics and ingest HTTP server configuration.
    #[serde(default)]
    pub server: ServerConfig,
}

/// Durable segment buffer configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct BufferConfig {
    /// Directory holding data, offset and lock files. Default: "buffer".
    #[serde(default = "default_buffer_path")]
    pub buffer_path: PathBuf,

    /// Offset file size before rotation. Accepts bytes or "K"/"KB"/"M"/"MB"
    /// strings. Default: 10MB.
    #[serde(
        default = "default_max_offset_file_size",
        deserialize_with = "deserialize_offset_file_size"
    )]
    pub max_offset_file_size: u64,

    /// Data file size before rotation. Same syntax. Default: 1MB.
    #[serde(
        default = "default_max_segment_file_size",
        deserialize_with = "deserialize_segment_file_size"
    )]
    pub max_segment_file_size: u64,

    /// Delete every data and offset file on startup. Default: false.
    #[serde(default)]
    pub clean_buffer_on_restart: bool,

    /// Reader tick interval. Default: 500ms.
    #[serde(default = "default_read_interval", with = "humantime_serde")]
    pub read_interval: Duration,

    /// Cursor flush interval. Default: 1s.
    #[serde(default = "default_offset_flush_interval", with = "humantime_serde")]
    pub offset_flush_interval: Duration,

    /// Delay before the first cursor flush. Default: 100ms.
    #[serde(
        default = "default_offset_flush_initial_delay",
        with = "humantime_serde"
    )]
    pub offset_flush_initial_delay: Duration,
}

/// Window and persistence configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AggregationConfig {
    /// Interval between window swaps and drains. Default: 3s.
    #[serde(default = "default_persist_interval", with = "humantime_serde")]
    pub persist_interval: Duration,

    /// Slowest segments kept per service between drains. Default: 50.
    #[serde(default = "default_slow_trace_top_n")]
    pub slow_trace_top_n: usize,

    /// Segments at or above this duration are slow-trace candidates.
    /// Default: 500ms.
    #[serde(default = "default_slow_trace_threshold", with = "humantime_serde")]
    pub slow_trace_threshold: Duration,

    /// Roll minute metrics up into hour, day and month buckets. Default: true.
    #[serde(default = "default_true")]
    pub rollups: bool,
}

/// Downstream exporter configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExporterConfig {
    /// Log exporter configuration.
    #[serde(default)]
    pub log: LogExportConfig,

    /// HTTP export configuration (e.g., to Vector).
    #[serde(default)]
    pub http: HttpExportConfig,
}

/// Log exporter configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LogExportConfig {
    /// Enable the log exporter. Default: true.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// HTTP export configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpExportConfig {
    /// Enable the HTTP exporter. Default: false.
    #[serde(default)]
    pub enabled: bool,

    /// HTTP endpoint to send data to.
    #[serde(default)]
    pub address: String,

    /// Additional HTTP headers.
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Compression algorithm (none, gzip, zstd, zlib). Default: gzip.
    #[serde(default = "default_compression")]
    pub compression: String,

    /// Maximum rows per request. Default: 512.
    #[serde(default = "default_http_batch_size")]
    pub batch_size: usize,

    /// Maximum duration for one request. Default: 30s.
    #[serde(default = "default_http_export_timeout", with = "humantime_serde")]
    pub export_timeout: Duration,

    /// Enable HTTP keep-alive connections. Default: true.
    #[serde(default = "default_true")]
    pub keep_alive: bool,
}

/// Metrics and ingest HTTP server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Listen address. Default: ":9090".
    #[serde(default = "default_server_addr")]
    pub addr: String,

    /// Accept segments on POST /v1/segments. Default: true.
    #[serde(default = "default_true")]
    pub ingest_enabled: bool,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_buffer_path() -> PathBuf {
    PathBuf::from("buffer")
}

fn default_max_offset_file_size() -> u64 {
    10 * MB
}

fn default_max_segment_file_size() -> u64 {
    MB
}

fn default_read_interval() -> Duration {
    Duration::from_millis(500)
}

fn default_offset_flush_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_offset_flush_initial_delay() -> Duration {
    Duration::from_millis(100)
}

fn default_persist_interval() -> Duration {
    Duration::from_secs(3)
}

fn default_slow_trace_top_n() -> usize {
    50
}

fn default_slow_trace_threshold() -> Duration {
    Duration::from_millis(500)
}

fn default_true() -> bool {
    true
}

fn default_compression() -> String {
    "gzip".to_string()
}

fn default_http_batch_size() -> usize {
    512
}

fn default_http_export_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_server_addr() -> String {
    ":9090".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            buffer: BufferConfig::default(),
            aggregation: AggregationConfig::default(),
            exporter: ExporterConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            buffer_path: default_buffer_path(),
            max_offset_file_size: default_max_offset_file_size(),
            max_segment_file_size: default_max_segment_file_size(),
            clean_buffer_on_restart: false,
            read_interval: default_read_interval(),
            offset_flush_interval: default_offset_flush_interval(),
            offset_flush_initial_delay: default_offset_flush_initial_delay(),
        }
    }
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            persist_interval: default_persist_interval(),
            slow_trace_top_n: default_slow_trace_top_n(),
            slow_trace_threshold: default_slow_trace_threshold(),
            rollups: true,
        }
    }
}

impl Default for LogExportConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl Default for HttpExportConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: String::new(),
            headers: HashMap::new(),
            compression: default_compression(),
            batch_size: default_http_batch_size(),
            export_timeout: default_http_export_timeout(),
            keep_alive: true,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: default_server_addr(),
            ingest_enabled: true,
        }
    }
}

// --- Byte sizes ---

const KB: u64 = 1024;
const MB: u64 = 1024 * KB;

/// Parses "512", "64K", "64KB", "10M" or "10MB" (binary multiples,
/// case-insensitive). Zero and anything else is rejected.
pub fn parse_byte_size(raw: &str) -> Option<u64> {
    let upper = raw.trim().to_ascii_uppercase();

    let (digits, multiplier) = if let Some(n) = upper.strip_suffix("KB") {
        (n, KB)
    } else if let Some(n) = upper.strip_suffix("MB") {
        (n, MB)
    } else if let Some(n) = upper.strip_suffix('K') {
        (n, KB)
    } else if let Some(n) = upper.strip_suffix('M') {
        (n, MB)
    } else {
        (upper.as_str(), 1)
    };

    digits
        .trim()
        .parse::<u64>()
        .ok()
        .and_then(|n| n.checked_mul(multiplier))
        .filter(|n| *n > 0)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawByteSize {
    Number(u64),
    Text(String),
    Other(IgnoredAny),
}

fn byte_size_or_default<'de, D>(deserializer: D, field: &str, default: u64) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let parsed = match RawByteSize::deserialize(deserializer)? {
        RawByteSize::Number(n) if n > 0 => Some(n),
        RawByteSize::Number(_) | RawByteSize::Other(_) => None,
        RawByteSize::Text(s) => parse_byte_size(&s),
    };

    Ok(parsed.unwrap_or_else(|| {
        tracing::warn!(field, default, "unparsable size, using default");
        default
    }))
}

fn deserialize_offset_file_size<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    byte_size_or_default(
        deserializer,
        "buffer.max_offset_file_size",
        default_max_offset_file_size(),
    )
}

fn deserialize_segment_file_size<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    byte_size_or_default(
        deserializer,
        "buffer.max_segment_file_size",
        default_max_segment_file_size(),
    )
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
        if self.buffer.buffer_path.as_os_str().is_empty() {
            bail!("buffer.buffer_path is required");
        }

        if self.buffer.read_interval.is_zero() {
            bail!("buffer.read_interval must be positive");
        }

        if self.buffer.offset_flush_interval.is_zero() {
            bail!("buffer.offset_flush_interval must be positive");
        }

        if self.aggregation.persist_interval.is_zero() {
            bail!("aggregation.persist_interval must be positive");
        }

        if self.aggregation.slow_trace_top_n == 0 {
            bail!("aggregation.slow_trace_top_n must be positive");
        }

        let http = &self.exporter.http;
        if http.enabled {
            if http.address.is_empty() {
                bail!("exporter.http.address is required when enabled");
            }
            if http.batch_size == 0 {
                bail!("exporter.http.batch_size must be positive when enabled");
            }
            match http.compression.as_str() {
                "none" | "" | "gzip" | "zstd" | "zlib" => {}
                other => bail!("invalid compression type: {other}"),
            }
        }

        Ok(())
    }
}
