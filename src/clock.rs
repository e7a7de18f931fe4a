//! Time sources.
//!
//! Probe timing runs on a monotonic millisecond counter while cooldown
//! expiries are absolute epoch seconds. Both come from one [`Clock`] so tests
//! can drive them together.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;

pub trait Clock: Send + Sync {
    /// Monotonic milliseconds since an arbitrary origin.
    fn now_millis(&self) -> u64;

    /// Wall-clock seconds since the Unix epoch.
    fn epoch_secs(&self) -> i64;
}

pub type SharedClock = Arc<dyn Clock>;

/// Real time: `Instant` for the monotonic side, `chrono` for wall-clock.
#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    pub fn shared() -> SharedClock {
        Arc::new(Self::new())
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    fn epoch_secs(&self) -> i64 {
        Utc::now().timestamp()
    }
}

/// Hand-driven clock. Epoch seconds advance with the monotonic counter.
#[derive(Debug)]
pub struct ManualClock {
    millis: AtomicU64,
    epoch_base: i64,
}

impl ManualClock {
    pub fn new(epoch_base: i64) -> Self {
        Self {
            millis: AtomicU64::new(0),
            epoch_base,
        }
    }

    pub fn advance(&self, by: Duration) {
        self.millis.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set_millis(&self, millis: u64) {
        self.millis.store(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.millis.load(Ordering::SeqCst)
    }

    fn epoch_secs(&self) -> i64 {
        self.epoch_base + (self.now_millis() / 1000) as i64
    }
}
