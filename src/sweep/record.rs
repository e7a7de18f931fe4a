//! Probe bookkeeping.
//!
//! A record is created for every catalog server when a sweep starts. It sits
//! in the send queue until dispatched, then in the in-flight table until a
//! reply with its sequence arrives or it times out.

use std::net::Ipv4Addr;

/// One queued or in-flight measurement
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeRecord {
    pub public_key: String,
    pub country_code: String,
    pub city_name: String,
    pub target: Ipv4Addr,
    /// ICMP sequence, assigned on each transmission
    pub sequence: u16,
    /// Monotonic milliseconds of the latest transmission
    pub sent_at_ms: u64,
    pub retries: u8,
    /// Angular distance from the observer, used for queue order only
    pub distance: f64,
}

impl ProbeRecord {
    pub fn new(
        public_key: impl Into<String>,
        country_code: impl Into<String>,
        city_name: impl Into<String>,
        target: Ipv4Addr,
        distance: f64,
    ) -> Self {
        Self {
            public_key: public_key.into(),
            country_code: country_code.into(),
            city_name: city_name.into(),
            target,
            sequence: 0,
            sent_at_ms: 0,
            retries: 0,
            distance,
        }
    }

    /// Abbreviated key for logs
    pub fn short_key(&self) -> &str {
        short_key(&self.public_key)
    }
}

/// A transmission the scheduler wants sent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dispatch {
    pub target: Ipv4Addr,
    pub sequence: u16,
}

/// First eight characters of a public key
pub fn short_key(key: &str) -> &str {
    match key.char_indices().nth(8) {
        Some((idx, _)) => &key[..idx],
        None => key,
    }
}
