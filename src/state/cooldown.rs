use std::collections::HashMap;

/// Suppression expiry per server, in epoch seconds.
///
/// A server without an entry is not suppressed. A server whose expiry is at
/// or before `now` counts as active again even before the entry is swept.
#[derive(Debug, Clone, Default)]
pub struct CooldownMap {
    expiry: HashMap<String, i64>,
}

impl CooldownMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Suppress a server for `timeout_secs`; a non-positive timeout clears it.
    pub fn set(&mut self, public_key: &str, timeout_secs: i64, now: i64) {
        if timeout_secs <= 0 {
            self.expiry.remove(public_key);
        } else {
            self.expiry
                .insert(public_key.to_string(), now.saturating_add(timeout_secs));
        }
    }

    pub fn set_expiry(&mut self, public_key: &str, expiry: i64) {
        self.expiry.insert(public_key.to_string(), expiry);
    }

    pub fn remove(&mut self, public_key: &str) {
        self.expiry.remove(public_key);
    }

    /// Expiry for a server, 0 if none
    pub fn expiry(&self, public_key: &str) -> i64 {
        self.expiry.get(public_key).copied().unwrap_or(0)
    }

    pub fn is_suppressed(&self, public_key: &str, now: i64) -> bool {
        self.expiry(public_key) > now
    }

    /// Remove every entry expired at `now`, returning the affected servers
    pub fn take_expired(&mut self, now: i64) -> Vec<String> {
        let expired: Vec<String> = self
            .expiry
            .iter()
            .filter(|(_, exp)| **exp <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            self.expiry.remove(key);
        }
        expired
    }

    /// Soonest expiry still pending
    pub fn next_expiry(&self) -> Option<i64> {
        self.expiry.values().copied().min()
    }

    pub fn len(&self) -> usize {
        self.expiry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.expiry.is_empty()
    }

    pub fn clear(&mut self) {
        self.expiry.clear();
    }
}
