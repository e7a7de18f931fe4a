//! Command-line arguments.

use std::path::PathBuf;
use std::str::FromStr;

use clap::Parser;

use crate::config::{Config, ProbeProtocol};

/// Probe VPN relay servers and score every city by connection quality
#[derive(Parser, Debug)]
#[command(name = "relayscore", author, version, about)]
pub struct Cli {
    /// Server catalog (JSON with a top-level "countries" array)
    pub catalog: PathBuf,

    /// Configuration file path
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    pub log_level: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long)]
    pub log_json: bool,

    /// Observer latitude in degrees
    #[arg(long, requires = "lon", allow_hyphen_values = true)]
    pub lat: Option<f64>,

    /// Observer longitude in degrees
    #[arg(long, requires = "lat", allow_hyphen_values = true)]
    pub lon: Option<f64>,

    /// Observer country code
    #[arg(long)]
    pub country: Option<String>,

    /// Probe transport (auto, icmp, tcp)
    #[arg(short, long)]
    pub protocol: Option<ProbeProtocol>,

    /// Port used for TCP probes
    #[arg(long)]
    pub port: Option<u16>,

    /// Per-probe timeout in milliseconds
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Maximum probes in flight (1 to 8)
    #[arg(long)]
    pub parallel: Option<usize>,

    /// Score a multi-hop pair, given as EXIT,ENTRY with each hop as COUNTRY:CITY
    #[arg(long, value_name = "EXIT,ENTRY")]
    pub multihop: Vec<HopPair>,

    /// Print the report as JSON instead of a table
    #[arg(long)]
    pub json: bool,

    /// Also write the JSON report into this directory
    #[arg(long, value_name = "DIR")]
    pub export: Option<PathBuf>,

    /// Keep running and report after every sweep until interrupted
    #[arg(short, long)]
    pub watch: bool,
}

impl Cli {
    /// Apply command-line overrides on top of the loaded configuration
    pub fn apply(&self, config: &mut Config) {
        if let Some(protocol) = self.protocol {
            config.protocol = protocol;
        }
        if let Some(port) = self.port {
            config.tcp_port = port;
        }
        if let Some(timeout) = self.timeout {
            config.probe_timeout = std::time::Duration::from_millis(timeout);
        }
        if let Some(parallel) = self.parallel {
            config.max_parallel = parallel;
        }
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
        if self.log_json {
            config.logging.format = "json".into();
        }
    }
}

/// `COUNTRY:CITY`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CityRef {
    pub country: String,
    pub city: String,
}

impl FromStr for CityRef {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (country, city) = s
            .split_once(':')
            .ok_or_else(|| format!("expected COUNTRY:CITY, got '{}'", s))?;
        let (country, city) = (country.trim(), city.trim());
        if country.is_empty() || city.is_empty() {
            return Err(format!("expected COUNTRY:CITY, got '{}'", s));
        }
        Ok(Self {
            country: country.to_string(),
            city: city.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HopPair {
    pub exit: CityRef,
    pub entry: CityRef,
}

impl FromStr for HopPair {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (exit, entry) = s
            .split_once(',')
            .ok_or_else(|| format!("expected EXIT,ENTRY, got '{}'", s))?;
        Ok(Self {
            exit: exit.parse()?,
            entry: entry.parse()?,
        })
    }
}
