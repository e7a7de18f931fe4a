use std::collections::HashMap;

/// Most recent round-trip time per server, with a running sum for O(1) mean.
#[derive(Debug, Clone, Default)]
pub struct LatencyMap {
    samples: HashMap<String, u64>,
    sum_ms: u64,
}

impl LatencyMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the sample for a server, keeping the sum in step
    pub fn record(&mut self, public_key: &str, latency_ms: u64) {
        match self.samples.get_mut(public_key) {
            Some(prev) => {
                self.sum_ms = self.sum_ms - *prev + latency_ms;
                *prev = latency_ms;
            }
            None => {
                self.sum_ms += latency_ms;
                self.samples.insert(public_key.to_string(), latency_ms);
            }
        }
    }

    pub fn get(&self, public_key: &str) -> Option<u64> {
        self.samples.get(public_key).copied()
    }

    /// Ceiling mean over every server, 0 when empty
    pub fn average(&self) -> u64 {
        ceil_mean(self.sum_ms, self.samples.len() as u64)
    }

    /// Ceiling mean over the given servers that have a positive sample.
    ///
    /// Returns 0 when none qualify.
    pub fn average_of<'a, I>(&self, public_keys: I) -> u64
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut sum = 0u64;
        let mut count = 0u64;
        for key in public_keys {
            if let Some(rtt) = self.get(key).filter(|rtt| *rtt > 0) {
                sum += rtt;
                count += 1;
            }
        }
        ceil_mean(sum, count)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
        self.sum_ms = 0;
    }
}

fn ceil_mean(sum: u64, count: u64) -> u64 {
    if count == 0 {
        0
    } else {
        sum.div_ceil(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_average_is_zero() {
        let map = LatencyMap::new();
        assert_eq!(map.average(), 0);
        assert!(map.is_empty());
    }

    #[test]
    fn test_single_sample() {
        let mut map = LatencyMap::new();
        map.record("a", 100);
        assert_eq!(map.average(), 100);
    }

    #[test]
    fn test_average_rounds_up() {
        let mut map = LatencyMap::new();
        map.record("a", 10);
        map.record("b", 11);
        // 10.5 -> 11
        assert_eq!(map.average(), 11);
        map.record("c", 10);
        // 31 / 3 = 10.33 -> 11
        assert_eq!(map.average(), 11);
    }

    #[test]
    fn test_replace_adjusts_sum() {
        let mut map = LatencyMap::new();
        map.record("a", 100);
        map.record("b", 50);
        map.record("a", 10);
        assert_eq!(map.len(), 2);
        assert_eq!(map.get("a"), Some(10));
        assert_eq!(map.average(), 30);
    }

    #[test]
    fn test_average_of_skips_missing_and_zero() {
        let mut map = LatencyMap::new();
        map.record("a", 20);
        map.record("b", 0);
        map.record("c", 25);
        assert_eq!(map.average_of(["a", "b", "c", "d"]), 23);
        assert_eq!(map.average_of(["b", "d"]), 0);
    }

    #[test]
    fn test_clear() {
        let mut map = LatencyMap::new();
        map.record("a", 20);
        map.clear();
        assert_eq!(map.average(), 0);
        map.record("b", 40);
        assert_eq!(map.average(), 40);
    }
}
