//! Lifecycle states, host signals, and the monitor's timer set.

use serde::{Deserialize, Serialize};

/// Where the monitor is in its refresh cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    /// No sweep running; the refresh timer may be armed
    Idle,
    Sweeping,
    /// Probing is held off by the tunnel or the app being in the background
    Suspended,
}

/// Coarse tunnel state as seen by the monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelState {
    #[default]
    Off,
    /// Connecting, connected, switching, disconnecting: anything but off
    Active,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppState {
    #[default]
    Foreground,
    Background,
}

/// Change notification published to observers
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MonitorEvent {
    Changed {
        progress: f64,
        state: LifecycleState,
    },
}

/// Single-shot timers, as absolute monotonic millisecond deadlines
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timers {
    /// Oldest in-flight probe times out
    pub probe: Option<u64>,
    /// Next periodic sweep
    pub refresh: Option<u64>,
    /// Earliest cooldown expiry
    pub cooldown: Option<u64>,
    /// Trailing edge of the notification debounce
    pub progress: Option<u64>,
}

/// Which timers fired
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Fired {
    pub probe: bool,
    pub refresh: bool,
    pub cooldown: bool,
    pub progress: bool,
}

impl Timers {
    /// Earliest armed deadline
    pub fn next_deadline(&self) -> Option<u64> {
        [self.probe, self.refresh, self.cooldown, self.progress]
            .into_iter()
            .flatten()
            .min()
    }

    /// Disarm and report every timer due at `now`
    pub fn take_due(&mut self, now: u64) -> Fired {
        fn take(slot: &mut Option<u64>, now: u64) -> bool {
            if slot.is_some_and(|deadline| deadline <= now) {
                *slot = None;
                true
            } else {
                false
            }
        }

        Fired {
            probe: take(&mut self.probe, now),
            refresh: take(&mut self.refresh, now),
            cooldown: take(&mut self.cooldown, now),
            progress: take(&mut self.progress, now),
        }
    }

    pub fn cancel_all(&mut self) {
        *self = Self::default();
    }
}
