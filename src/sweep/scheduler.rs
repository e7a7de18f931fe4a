//! Send queue and in-flight table for one sweep.
//!
//! The scheduler is pure bookkeeping: it never touches a socket or a timer.
//! Callers pass the current monotonic time in and transmit the returned
//! [`Dispatch`]es themselves.

use std::collections::VecDeque;
use std::time::Duration;
use tracing::debug;

use crate::sweep::record::{Dispatch, ProbeRecord};

/// Outcome of scanning the in-flight table for timeouts
#[derive(Debug, Default)]
pub struct Expired {
    /// Timed-out probes that were re-queued as fresh transmissions
    pub retried: Vec<Dispatch>,
    /// Probes that ran out of retries
    pub dropped: Vec<ProbeRecord>,
}

/// A reply matched to its probe
#[derive(Debug)]
pub struct Reply {
    pub record: ProbeRecord,
    pub latency_ms: u64,
}

#[derive(Debug)]
pub struct Scheduler {
    queue: VecDeque<ProbeRecord>,
    /// Oldest transmission first. Every append carries the newest timestamp,
    /// so the front is always the next to expire.
    in_flight: VecDeque<ProbeRecord>,
    sequence: u16,
    total: usize,
    timeout_ms: u64,
    max_parallel: usize,
    max_retries: u8,
}

impl Scheduler {
    pub fn new(timeout: Duration, max_parallel: usize, max_retries: u8) -> Self {
        Self {
            queue: VecDeque::new(),
            in_flight: VecDeque::with_capacity(max_parallel),
            sequence: 0,
            total: 0,
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            max_parallel: max_parallel.max(1),
            max_retries,
        }
    }

    /// Start a sweep over `records`, nearest first.
    ///
    /// Ties keep their input order. Any previous sweep state is discarded and
    /// the sequence counter restarts at zero.
    pub fn load(&mut self, mut records: Vec<ProbeRecord>) {
        records.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        self.clear();
        self.total = records.len();
        self.queue = records.into();
    }

    fn next_sequence(&mut self) -> u16 {
        let seq = self.sequence;
        self.sequence = self.sequence.wrapping_add(1);
        seq
    }

    /// Retry or drop every in-flight probe whose timeout has elapsed at `now`.
    pub fn expire(&mut self, now: u64) -> Expired {
        let mut out = Expired::default();

        while let Some(front) = self.in_flight.front() {
            if front.sent_at_ms.saturating_add(self.timeout_ms) > now {
                break;
            }
            let Some(mut record) = self.in_flight.pop_front() else {
                break;
            };
            debug!(
                server = record.short_key(),
                retries = record.retries,
                "probe timeout"
            );

            if record.retries < self.max_retries {
                record.retries += 1;
                record.sequence = self.next_sequence();
                record.sent_at_ms = now;
                out.retried.push(Dispatch {
                    target: record.target,
                    sequence: record.sequence,
                });
                self.in_flight.push_back(record);
            } else {
                out.dropped.push(record);
            }
        }

        out
    }

    /// Move probes from the queue to in-flight until the parallelism ceiling
    pub fn fill(&mut self, now: u64) -> Vec<Dispatch> {
        let mut dispatches = Vec::new();

        while self.in_flight.len() < self.max_parallel {
            let Some(mut record) = self.queue.pop_front() else {
                break;
            };
            record.sequence = self.next_sequence();
            record.sent_at_ms = now;
            record.retries = 0;
            dispatches.push(Dispatch {
                target: record.target,
                sequence: record.sequence,
            });
            self.in_flight.push_back(record);
        }

        dispatches
    }

    /// Remove the in-flight probe with this sequence and measure it
    pub fn take_reply(&mut self, sequence: u16, now: u64) -> Option<Reply> {
        let idx = self.in_flight.iter().position(|r| r.sequence == sequence)?;
        let record = self.in_flight.remove(idx)?;
        let latency_ms = now.saturating_sub(record.sent_at_ms);
        Some(Reply { record, latency_ms })
    }

    /// Milliseconds until the oldest in-flight probe times out.
    ///
    /// Never negative; `None` when nothing is in flight.
    pub fn next_timeout(&self, now: u64) -> Option<u64> {
        self.in_flight.front().map(|record| {
            record
                .sent_at_ms
                .saturating_add(self.timeout_ms)
                .saturating_sub(now)
        })
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn queued_len(&self) -> usize {
        self.queue.len()
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn in_flight(&self) -> impl Iterator<Item = &ProbeRecord> {
        self.in_flight.iter()
    }

    pub fn is_idle(&self) -> bool {
        self.in_flight.is_empty() && self.queue.is_empty()
    }

    /// Fraction of the sweep finished; 1.0 when there is nothing to do
    pub fn progress(&self) -> f64 {
        if self.total == 0 {
            return 1.0;
        }
        let remaining = (self.in_flight.len() + self.queue.len()) as f64;
        1.0 - remaining / self.total as f64
    }

    pub fn clear(&mut self) {
        self.queue.clear();
        self.in_flight.clear();
        self.sequence = 0;
        self.total = 0;
    }
}
