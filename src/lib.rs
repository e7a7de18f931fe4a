//! Relay latency probing and connection quality scoring.
//!
//! A [`LatencyMonitor`] periodically probes every server in a [`Catalog`]
//! over ICMP echo (or TCP connect timing when raw ICMP is unavailable),
//! keeps per-server round-trip samples and cooldowns, and scores each city
//! from redundancy, locality and measured latency. [`LatencyService`] drives
//! it on a tokio task.

pub mod catalog;
pub mod cli;
pub mod clock;
pub mod config;
pub mod error;
pub mod export;
pub mod geo;
pub mod lifecycle;
pub mod monitor;
pub mod probe;
pub mod scoring;
pub mod service;
pub mod state;
pub mod sweep;

pub use catalog::{Catalog, SharedCatalog};
pub use config::Config;
pub use error::{Error, Result};
pub use lifecycle::{AppState, LifecycleState, MonitorEvent, TunnelState};
pub use monitor::LatencyMonitor;
pub use service::{LatencyService, MonitorHandle};
pub use state::ConnectionScore;
