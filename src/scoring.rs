//! City connection scores.
//!
//! A score starts from redundancy and locality (the base score) and may be
//! raised by measured latency. Multi-hop pairs replace the latency bonus with
//! a proximity bonus between the two hops.

use std::f64::consts::PI;
use tracing::debug;

use crate::catalog::{Catalog, City};
use crate::config::Config;
use crate::geo::angular_distance;
use crate::state::{ConnectionScore, CooldownMap, LatencyMap};

/// Hops closer than one eighth of the earth's circumference get a bonus
const MULTIHOP_NEAR_RADIANS: f64 = PI / 4.0;

#[derive(Debug, Clone, Copy)]
pub struct Scorer {
    redundancy_threshold: usize,
    excellent_latency_ms: u64,
}

impl Scorer {
    pub fn new(redundancy_threshold: usize, excellent_latency_ms: u64) -> Self {
        Self {
            redundancy_threshold,
            excellent_latency_ms,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.redundancy_threshold, config.excellent_latency_ms)
    }

    /// Score from active server count and origin country alone
    pub fn base_score(
        &self,
        city: &City,
        origin_country: &str,
        cooldowns: &CooldownMap,
        now: i64,
    ) -> ConnectionScore {
        let active = city
            .server_keys()
            .filter(|key| !cooldowns.is_suppressed(key, now))
            .count();
        if active == 0 {
            return ConnectionScore::Unavailable;
        }

        let same_country =
            !origin_country.is_empty() && origin_country.eq_ignore_ascii_case(&city.country);

        ConnectionScore::Poor
            .promote_if(active >= self.redundancy_threshold)
            .promote_if(same_country)
    }

    /// Recompute and store a city's average latency and score.
    ///
    /// `global_average` is the mean over every measured server at this moment,
    /// so results depend on how much of the sweep has reported so far.
    pub fn update_city(
        &self,
        city: &mut City,
        origin_country: &str,
        latencies: &LatencyMap,
        cooldowns: &CooldownMap,
        now: i64,
    ) -> ConnectionScore {
        let city_avg = latencies.average_of(city.server_keys());
        city.latency_ms = city_avg;

        let base = self.base_score(city, origin_country, cooldowns, now);
        if base <= ConnectionScore::Unavailable || city_avg == 0 {
            city.score = base;
            return base;
        }

        let faster_than_average = city_avg < latencies.average();
        let score = base
            .promote_if(faster_than_average)
            .promote_if(faster_than_average && city_avg < self.excellent_latency_ms);

        city.score = score;
        score
    }

    /// Score an entry/exit pair.
    ///
    /// Unknown cities yield `NoData`. The entry country stands in as origin,
    /// so same-country pairs get the locality bonus.
    pub fn multi_hop_score(
        &self,
        catalog: &Catalog,
        exit: (&str, &str),
        entry: (&str, &str),
        cooldowns: &CooldownMap,
        now: i64,
    ) -> ConnectionScore {
        let (exit_country, exit_city) = exit;
        let (entry_country, entry_city) = entry;

        let Some(exit) = catalog.find_city(exit_country, exit_city) else {
            debug!(exit_country, exit_city, "multihop exit city unknown");
            return ConnectionScore::NoData;
        };
        let Some(entry) = catalog.find_city(entry_country, entry_city) else {
            debug!(entry_country, entry_city, "multihop entry city unknown");
            return ConnectionScore::NoData;
        };

        let score = self.base_score(exit, entry_country, cooldowns, now);
        if score <= ConnectionScore::Unavailable {
            return score;
        }

        let hop_distance =
            angular_distance(exit.latitude, exit.longitude, entry.latitude, entry.longitude);
        score.promote_if(hop_distance < MULTIHOP_NEAR_RADIANS)
    }
}

impl Default for Scorer {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}
