//! Configuration for the latency monitor.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Most probes ever awaiting a reply at once
pub const PARALLEL_CEILING: usize = 8;
/// Most retransmissions of one probe after the first
pub const RETRY_CEILING: u8 = 2;

/// Transport used to measure round-trip time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeProtocol {
    /// ICMP echo, falling back to TCP handshake timing if raw sockets are unavailable
    #[default]
    Auto,
    Icmp,
    Tcp,
}

impl std::str::FromStr for ProbeProtocol {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(ProbeProtocol::Auto),
            "icmp" => Ok(ProbeProtocol::Icmp),
            "tcp" => Ok(ProbeProtocol::Tcp),
            other => Err(format!("unknown probe protocol: {}", other)),
        }
    }
}

/// Latency monitor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Master switch for latency probing and scoring
    pub enabled: bool,

    #[serde(with = "duration_millis")]
    pub probe_timeout: Duration,
    /// Ceiling on probes awaiting a reply at once
    pub max_parallel: usize,
    /// Retries per server after the first transmission
    pub max_retries: u8,

    /// Delay between the end of one sweep and the next
    #[serde(with = "duration_millis")]
    pub refresh_interval: Duration,
    /// Delay before the first sweep after activation
    #[serde(with = "duration_millis")]
    pub initial_delay: Duration,
    /// Minimum spacing of change notifications
    #[serde(with = "duration_millis")]
    pub progress_delay: Duration,

    /// Active servers a city needs for the redundancy bonus
    pub redundancy_threshold: usize,
    pub excellent_latency_ms: u64,

    pub protocol: ProbeProtocol,
    /// Port probed by the TCP fallback
    pub tcp_port: u16,

    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enabled: true,
            probe_timeout: Duration::from_secs(5),
            max_parallel: PARALLEL_CEILING,
            max_retries: RETRY_CEILING,
            refresh_interval: Duration::from_secs(30 * 60),
            initial_delay: Duration::from_secs(1),
            progress_delay: Duration::from_millis(500),
            redundancy_threshold: 3,
            excellent_latency_ms: 30,
            protocol: ProbeProtocol::Auto,
            tcp_port: 80,
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("Failed to read config: {e}")))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path.as_ref(), content)
            .map_err(|e| Error::Config(format!("Failed to write config: {e}")))?;

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_parallel == 0 || self.max_parallel > PARALLEL_CEILING {
            return Err(Error::InvalidConfig(format!(
                "max_parallel must be between 1 and {PARALLEL_CEILING}"
            )));
        }
        if self.max_retries > RETRY_CEILING {
            return Err(Error::InvalidConfig(format!(
                "max_retries must be at most {RETRY_CEILING}"
            )));
        }
        if self.probe_timeout.is_zero() {
            return Err(Error::InvalidConfig("probe_timeout must be non-zero".into()));
        }
        if self.refresh_interval.is_zero() {
            return Err(Error::InvalidConfig(
                "refresh_interval must be non-zero".into(),
            ));
        }
        if self.tcp_port == 0 {
            return Err(Error::InvalidConfig("tcp_port must be non-zero".into()));
        }
        Ok(())
    }

    /// Default config path (`<config dir>/relayscore/config.toml`).
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("relayscore")
            .join("config.toml")
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset
    pub level: String,
    /// `text` or `json`
    pub format: String,
    pub color: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
            color: true,
        }
    }
}

/// Install the global tracing subscriber.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.format == "json" {
        subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| Error::Config(format!("Failed to init logging: {e}")))?;
    } else {
        subscriber
            .with(fmt::layer().with_ansi(config.color))
            .try_init()
            .map_err(|e| Error::Config(format!("Failed to init logging: {e}")))?;
    }

    Ok(())
}

/// Serde helper for Duration as whole milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
