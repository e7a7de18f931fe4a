//! The latency monitor.
//!
//! [`LatencyMonitor`] is a single-threaded state machine. Every entry point
//! runs to completion and leaves its follow-up work as a deadline in
//! [`Timers`]; the service loop in [`crate::service`] sleeps until
//! [`LatencyMonitor::next_deadline`] and calls [`LatencyMonitor::on_timer`].

use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};

use crate::catalog::{CityKey, SharedCatalog};
use crate::clock::SharedClock;
use crate::config::Config;
use crate::geo::Observer;
use crate::lifecycle::{AppState, LifecycleState, MonitorEvent, Timers, TunnelState};
use crate::probe::{EventSink, EventTx, PingSender, SenderFactory, TransportEvent, TransportEventKind};
use crate::scoring::Scorer;
use crate::state::{ConnectionScore, CooldownMap, LatencyMap};
use crate::sweep::{ProbeRecord, Scheduler, short_key};

const EVENT_CAPACITY: usize = 64;

/// Whole milliseconds, saturating for durations beyond `u64`
fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

pub struct LatencyMonitor {
    config: Config,
    catalog: SharedCatalog,
    clock: SharedClock,
    factory: Box<dyn SenderFactory>,
    events_tx: EventTx,
    /// Bumped per sweep so late replies from a torn-down transport are ignored
    generation: u64,
    /// Present exactly while a sweep runs
    sender: Option<Box<dyn PingSender>>,
    scheduler: Scheduler,
    latencies: LatencyMap,
    cooldowns: CooldownMap,
    scorer: Scorer,
    observer: Option<Observer>,
    enabled: bool,
    tunnel: TunnelState,
    app: AppState,
    want_refresh: bool,
    timers: Timers,
    notify: broadcast::Sender<MonitorEvent>,
}

impl LatencyMonitor {
    pub fn new(
        config: Config,
        catalog: SharedCatalog,
        clock: SharedClock,
        factory: Box<dyn SenderFactory>,
        events_tx: EventTx,
    ) -> Self {
        let (notify, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            scheduler: Scheduler::new(config.probe_timeout, config.max_parallel, config.max_retries),
            scorer: Scorer::from_config(&config),
            enabled: config.enabled,
            config,
            catalog,
            clock,
            factory,
            events_tx,
            generation: 0,
            sender: None,
            latencies: LatencyMap::new(),
            cooldowns: CooldownMap::new(),
            observer: None,
            tunnel: TunnelState::Off,
            app: AppState::Foreground,
            want_refresh: false,
            timers: Timers::default(),
            notify,
        }
    }

    /// Schedule the first sweep shortly after activation
    pub fn initialize(&mut self) {
        if self.enabled {
            self.arm_refresh(self.config.initial_delay);
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.notify.subscribe()
    }

    /// Sender half of the notification channel, for handles that subscribe later
    pub fn notifier(&self) -> broadcast::Sender<MonitorEvent> {
        self.notify.clone()
    }

    /// Begin a sweep over the whole catalog.
    ///
    /// Does nothing while a sweep runs. While the tunnel is up or the app is
    /// in the background it only remembers that a sweep is wanted.
    pub fn start(&mut self) {
        if !self.enabled {
            self.clear();
            return;
        }
        if self.is_held() {
            // Probing through an active tunnel would measure the tunnel
            self.want_refresh = true;
            return;
        }
        if self.sender.is_some() {
            return;
        }

        self.want_refresh = false;
        let records = self.build_queue();
        self.scheduler.load(records);

        self.generation += 1;
        let sink = EventSink::new(self.generation, self.events_tx.clone());
        match self.factory.create(sink) {
            Ok(sender) => {
                info!(
                    protocol = ?sender.protocol(),
                    servers = self.scheduler.total(),
                    "starting latency sweep"
                );
                self.sender = Some(sender);
            }
            Err(e) => {
                warn!(error = %e, "no probe transport available, skipping sweep");
                self.stop();
                return;
            }
        }

        self.timers.refresh = None;
        self.timers.progress = None;
        self.notify_now();
        self.tick();
    }

    /// Every catalog server, nearest city first
    fn build_queue(&self) -> Vec<ProbeRecord> {
        let catalog = self.catalog.read();
        let mut records = Vec::with_capacity(catalog.server_count());
        for city in catalog.cities() {
            let distance = self
                .observer
                .as_ref()
                .map_or(0.0, |o| o.distance_to(city.latitude, city.longitude));
            for server in &city.servers {
                records.push(ProbeRecord::new(
                    server.public_key.clone(),
                    city.country.clone(),
                    city.name.clone(),
                    server.ipv4_addr_in,
                    distance,
                ));
            }
        }
        records
    }

    /// Expire timed-out probes, top up the in-flight table, and re-arm the
    /// probe timer. Ends the sweep once nothing is left in flight.
    pub fn tick(&mut self) {
        let Some(sender) = self.sender.as_mut() else {
            return;
        };
        let now = self.clock.now_millis();

        let expired = self.scheduler.expire(now);
        for dispatch in &expired.retried {
            sender.send_ping(dispatch.target, dispatch.sequence);
        }
        for record in &expired.dropped {
            debug!(
                server = record.short_key(),
                city = %record.city_name,
                "no reply after retries"
            );
        }

        for dispatch in self.scheduler.fill(now) {
            sender.send_ping(dispatch.target, dispatch.sequence);
        }

        self.mark_changed();

        match self.scheduler.next_timeout(now) {
            Some(delay) => self.timers.probe = Some(now.saturating_add(delay)),
            None => self.stop(),
        }
    }

    pub fn on_transport_event(&mut self, event: TransportEvent) {
        if event.generation != self.generation || self.sender.is_none() {
            trace!(generation = event.generation, "dropping stale transport event");
            return;
        }
        match event.kind {
            TransportEventKind::Reply(sequence) => self.on_reply(sequence),
            TransportEventKind::Error(message) => self.on_transport_failure(&message),
        }
    }

    /// Match a reply to its probe and record the round trip
    pub fn on_reply(&mut self, sequence: u16) {
        if self.sender.is_none() {
            return;
        }
        let now = self.clock.now_millis();
        let Some(reply) = self.scheduler.take_reply(sequence, now) else {
            trace!(sequence, "reply for unknown sequence");
            return;
        };

        trace!(
            server = reply.record.short_key(),
            latency_ms = reply.latency_ms,
            "probe reply"
        );
        self.record_latency(&reply.record.public_key, reply.latency_ms);
        self.tick();
    }

    /// The sweep carries on and runs out through timeouts
    pub fn on_transport_failure(&mut self, message: &str) {
        warn!(error = message, "unrecoverable ping error");
    }

    /// End the sweep and schedule the next one
    pub fn stop(&mut self) {
        self.halt();
        if self.enabled && self.timers.refresh.is_none() {
            self.arm_refresh(self.config.refresh_interval);
        }
    }

    fn halt(&mut self) {
        self.timers.probe = None;
        self.scheduler.clear();
        if self.sender.take().is_some() {
            debug!(generation = self.generation, "latency sweep finished");
        }
        self.timers.progress = None;
        self.notify_now();
    }

    /// Drop all measurements and sweep again, unless a sweep is running
    pub fn refresh(&mut self) {
        if self.sender.is_some() {
            return;
        }
        self.clear();
        self.start();
    }

    pub fn clear(&mut self) {
        self.latencies.clear();
        self.notify_now();
    }

    /// Cancel everything; used when the service shuts down
    pub fn shutdown(&mut self) {
        self.halt();
        self.timers.cancel_all();
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        if self.enabled == enabled {
            return;
        }
        self.enabled = enabled;
        if enabled {
            self.start();
        } else {
            info!("latency scoring disabled");
            self.halt();
            self.timers.refresh = None;
            self.want_refresh = false;
            self.clear();
        }
    }

    pub fn catalog_changed(&mut self) {
        self.start();
    }

    pub fn set_observer(&mut self, observer: Observer) {
        self.observer = Some(observer);
        self.rescore_all();
    }

    pub fn on_tunnel_state(&mut self, state: TunnelState) {
        self.tunnel = state;
        match state {
            TunnelState::Active => {
                if self.sender.is_some() {
                    self.want_refresh = true;
                }
                self.stop();
            }
            TunnelState::Off => {
                if self.want_refresh {
                    self.start();
                }
            }
        }
    }

    /// Sockets may be reclaimed in the background, so sweeps pause there
    pub fn on_app_state(&mut self, state: AppState) {
        self.app = state;
        match state {
            AppState::Background => {
                if self.sender.is_some() {
                    self.want_refresh = true;
                    self.stop();
                }
            }
            AppState::Foreground => {
                if self.want_refresh && self.tunnel == TunnelState::Off {
                    self.refresh();
                }
            }
        }
    }

    fn is_held(&self) -> bool {
        self.tunnel == TunnelState::Active || self.app == AppState::Background
    }

    /// Store a round-trip sample and rescore the server's city
    pub fn record_latency(&mut self, public_key: &str, latency_ms: u64) {
        self.latencies.record(public_key, latency_ms);
        self.update_connection_score(public_key);
    }

    pub fn average_latency(&self) -> u64 {
        self.latencies.average()
    }

    pub fn latency(&self, public_key: &str) -> Option<u64> {
        self.latencies.get(public_key)
    }

    fn update_connection_score(&mut self, public_key: &str) {
        let city_key = self.catalog.read().city_key_of(public_key);
        match city_key {
            Some(key) => self.rescore_city(key),
            None => trace!(server = short_key(public_key), "server not in catalog"),
        }
    }

    fn rescore_city(&mut self, key: CityKey) {
        let now = self.clock.epoch_secs();
        let origin = self.observer.as_ref().map_or("", |o| o.country_code.as_str());
        {
            let mut catalog = self.catalog.write();
            let city = catalog.city_mut(key);
            self.scorer
                .update_city(city, origin, &self.latencies, &self.cooldowns, now);
        }
        self.mark_changed();
    }

    fn rescore_all(&mut self) {
        let now = self.clock.epoch_secs();
        let origin = self.observer.as_ref().map_or("", |o| o.country_code.as_str());
        {
            let mut catalog = self.catalog.write();
            for city in catalog.cities_mut() {
                self.scorer
                    .update_city(city, origin, &self.latencies, &self.cooldowns, now);
            }
        }
        self.mark_changed();
    }

    /// Suppress one server; a non-positive timeout lifts suppression
    pub fn set_cooldown(&mut self, public_key: &str, timeout_secs: i64) {
        let now = self.clock.epoch_secs();
        self.cooldowns.set(public_key, timeout_secs, now);
        self.update_connection_score(public_key);
        self.arm_cooldown_timer();
    }

    /// Suppress every server of a city identified by country and city code.
    ///
    /// Returns false if no such city exists.
    pub fn set_city_cooldown(&mut self, country: &str, city_code: &str, timeout_secs: i64) -> bool {
        let key = self.catalog.read().find_city_key_by_code(country, city_code);
        let Some(key) = key else {
            debug!(country, city = city_code, "cooldown for unknown city");
            return false;
        };
        debug!(country, city = city_code, timeout_secs, "cooldown for all servers in city");

        if timeout_secs <= 0 {
            let keys: Vec<String> = self
                .catalog
                .read()
                .city(key)
                .server_keys()
                .map(str::to_string)
                .collect();
            for public_key in &keys {
                self.cooldowns.remove(public_key);
            }
            self.rescore_city(key);
        } else {
            let expiry = self.clock.epoch_secs().saturating_add(timeout_secs);
            {
                let mut catalog = self.catalog.write();
                let city = catalog.city_mut(key);
                for public_key in city.server_keys() {
                    self.cooldowns.set_expiry(public_key, expiry);
                }
                // Every member is suppressed by construction
                city.score = ConnectionScore::Unavailable;
            }
            self.mark_changed();
        }

        self.arm_cooldown_timer();
        true
    }

    /// Lift suppressions that have run out and rescore their cities
    pub fn clear_expired_cooldowns(&mut self) {
        let now = self.clock.epoch_secs();
        let expired = self.cooldowns.take_expired(now);
        for public_key in &expired {
            self.update_connection_score(public_key);
        }
        if !expired.is_empty() {
            debug!(count = expired.len(), "cooldowns expired");
        }
        self.arm_cooldown_timer();
    }

    /// Expiry of a server's cooldown in epoch seconds, 0 if none
    pub fn cooldown(&self, public_key: &str) -> i64 {
        self.cooldowns.expiry(public_key)
    }

    fn arm_cooldown_timer(&mut self) {
        let now_ms = self.clock.now_millis();
        let now_secs = self.clock.epoch_secs();
        self.timers.cooldown = self.cooldowns.next_expiry().map(|expiry| {
            let wait_secs = expiry.saturating_sub(now_secs).max(0) as u64;
            now_ms.saturating_add(wait_secs.saturating_mul(1000))
        });
    }

    pub fn multi_hop_score(
        &self,
        exit_country: &str,
        exit_city: &str,
        entry_country: &str,
        entry_city: &str,
    ) -> ConnectionScore {
        let catalog = self.catalog.read();
        self.scorer.multi_hop_score(
            &catalog,
            (exit_country, exit_city),
            (entry_country, entry_city),
            &self.cooldowns,
            self.clock.epoch_secs(),
        )
    }

    /// Fraction of the current sweep done; 1.0 when idle
    pub fn progress(&self) -> f64 {
        if self.sender.is_none() {
            return 1.0;
        }
        self.scheduler.progress()
    }

    pub fn state(&self) -> LifecycleState {
        if self.sender.is_some() {
            LifecycleState::Sweeping
        } else if self.is_held() {
            LifecycleState::Suspended
        } else {
            LifecycleState::Idle
        }
    }

    pub fn in_flight_len(&self) -> usize {
        self.scheduler.in_flight_len()
    }

    pub fn timers(&self) -> &Timers {
        &self.timers
    }

    pub fn next_deadline(&self) -> Option<u64> {
        self.timers.next_deadline()
    }

    /// Fire every timer that is due
    pub fn on_timer(&mut self) {
        let now = self.clock.now_millis();
        let fired = self.timers.take_due(now);
        if fired.probe {
            self.tick();
        }
        if fired.refresh {
            self.start();
        }
        if fired.cooldown {
            self.clear_expired_cooldowns();
        }
        if fired.progress {
            self.notify_now();
        }
    }

    fn arm_refresh(&mut self, after: Duration) {
        self.timers.refresh = Some(self.clock.now_millis().saturating_add(millis(after)));
    }

    /// Something observable changed; publish on the debounce's trailing edge
    fn mark_changed(&mut self) {
        if self.timers.progress.is_none() {
            let delay = millis(self.config.progress_delay);
            self.timers.progress = Some(self.clock.now_millis().saturating_add(delay));
        }
    }

    fn notify_now(&self) {
        // No subscribers is fine
        let _ = self.notify.send(MonitorEvent::Changed {
            progress: self.progress(),
            state: self.state(),
        });
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::catalog::tests::{city, country, server};
    use crate::catalog::Catalog;
    use crate::clock::{Clock, ManualClock};
    use crate::config::ProbeProtocol;
    use crate::error::{Error, Result};
    use parking_lot::Mutex;
    use std::net::Ipv4Addr;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    pub(crate) type SentLog = Arc<Mutex<Vec<(Ipv4Addr, u16)>>>;

    pub(crate) struct RecordingSender {
        sent: SentLog,
    }

    impl PingSender for RecordingSender {
        fn send_ping(&mut self, dest: Ipv4Addr, sequence: u16) {
            self.sent.lock().push((dest, sequence));
        }

        fn protocol(&self) -> ProbeProtocol {
            ProbeProtocol::Icmp
        }
    }

    pub(crate) struct RecordingFactory {
        pub sent: SentLog,
        pub fail: bool,
    }

    impl SenderFactory for RecordingFactory {
        fn create(&self, _sink: EventSink) -> Result<Box<dyn PingSender>> {
            if self.fail {
                return Err(Error::Socket("no sockets here".into()));
            }
            Ok(Box::new(RecordingSender {
                sent: self.sent.clone(),
            }))
        }
    }

    const EPOCH: i64 = 1_700_000_000;

    struct Harness {
        monitor: LatencyMonitor,
        clock: Arc<ManualClock>,
        catalog: SharedCatalog,
        sent: SentLog,
    }

    impl Harness {
        fn new(catalog: Catalog) -> Self {
            Self::with_config(catalog, Config::default(), false)
        }

        fn with_config(catalog: Catalog, config: Config, fail: bool) -> Self {
            let clock = Arc::new(ManualClock::new(EPOCH));
            let catalog = catalog.shared();
            let sent: SentLog = Arc::new(Mutex::new(Vec::new()));
            let (tx, _rx) = mpsc::unbounded_channel();
            let monitor = LatencyMonitor::new(
                config,
                catalog.clone(),
                clock.clone(),
                Box::new(RecordingFactory {
                    sent: sent.clone(),
                    fail,
                }),
                tx,
            );
            Self {
                monitor,
                clock,
                catalog,
                sent,
            }
        }

        fn advance(&self, ms: u64) {
            self.clock.advance(Duration::from_millis(ms));
        }

        /// Advance to the next deadline and fire it
        fn run_next_timer(&mut self) -> bool {
            let Some(deadline) = self.monitor.next_deadline() else {
                return false;
            };
            let now = self.clock.now_millis();
            if deadline > now {
                self.clock.set_millis(deadline);
            }
            self.monitor.on_timer();
            true
        }

        /// Advance to the probe deadline and fire due timers
        fn run_probe_timer(&mut self) -> bool {
            let Some(deadline) = self.monitor.timers().probe else {
                return false;
            };
            self.clock.set_millis(deadline.max(self.clock.now_millis()));
            self.monitor.on_timer();
            true
        }

        fn sent(&self) -> Vec<(Ipv4Addr, u16)> {
            self.sent.lock().clone()
        }

        fn score(&self, country: &str, name: &str) -> ConnectionScore {
            self.catalog.read().find_city(country, name).unwrap().score
        }
    }

    fn many_servers(n: u8) -> Catalog {
        Catalog::new(vec![country(
            "de",
            vec![city(
                "fra",
                "Frankfurt",
                50.1,
                8.7,
                (0..n).map(|i| server(&format!("k{i}"), i)).collect(),
            )],
        )])
    }

    #[test]
    fn test_empty_catalog_completes_immediately() {
        let mut h = Harness::new(Catalog::default());
        let mut events = h.monitor.subscribe();
        h.monitor.start();

        assert_eq!(h.monitor.state(), LifecycleState::Idle);
        assert_eq!(h.monitor.progress(), 1.0);
        assert!(h.sent().is_empty());
        assert_eq!(h.monitor.timers().refresh, Some(30 * 60 * 1000));
        assert_eq!(h.monitor.timers().probe, None);

        let mut last = None;
        while let Ok(ev) = events.try_recv() {
            last = Some(ev);
        }
        assert_eq!(
            last,
            Some(MonitorEvent::Changed {
                progress: 1.0,
                state: LifecycleState::Idle
            })
        );
    }

    #[test]
    fn test_sweep_keeps_pipeline_full() {
        let mut h = Harness::new(many_servers(10));
        h.monitor.start();

        assert_eq!(h.monitor.state(), LifecycleState::Sweeping);
        assert_eq!(h.sent().len(), 8);
        assert_eq!(h.monitor.in_flight_len(), 8);
        assert_eq!(h.monitor.progress(), 0.0);
        assert_eq!(h.monitor.timers().probe, Some(5000));

        h.advance(25);
        h.monitor.on_reply(0);
        assert_eq!(h.monitor.latency("k0"), Some(25));
        assert_eq!(h.sent().len(), 9);
        assert_eq!(h.sent()[8].1, 8);
        assert_eq!(h.monitor.in_flight_len(), 8);
        assert!((h.monitor.progress() - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_sweep_completes_and_schedules_refresh() {
        let mut h = Harness::new(many_servers(3));
        h.monitor.start();
        h.advance(10);
        for seq in 0..3 {
            h.monitor.on_reply(seq);
        }

        assert_eq!(h.monitor.state(), LifecycleState::Idle);
        assert_eq!(h.monitor.progress(), 1.0);
        assert_eq!(h.monitor.timers().refresh, Some(10 + 30 * 60 * 1000));
        assert_eq!(h.monitor.average_latency(), 10);

        // Refresh timer restarts the sweep
        h.clock.set_millis(10 + 30 * 60 * 1000);
        h.monitor.on_timer();
        assert_eq!(h.monitor.state(), LifecycleState::Sweeping);
        assert_eq!(h.sent().len(), 6);
        // Sequence counter restarted
        assert_eq!(h.sent()[3].1, 0);
    }

    #[test]
    fn test_unanswered_probe_retried_then_dropped() {
        let mut h = Harness::new(many_servers(1));
        h.monitor.start();
        assert_eq!(h.sent(), vec![(Ipv4Addr::new(10, 0, 0, 0), 0)]);

        assert!(h.run_probe_timer());
        assert_eq!(h.clock.now_millis(), 5000);
        assert_eq!(h.sent().last().unwrap().1, 1);

        assert!(h.run_probe_timer());
        assert_eq!(h.clock.now_millis(), 10_000);
        assert_eq!(h.sent().last().unwrap().1, 2);
        assert_eq!(h.monitor.state(), LifecycleState::Sweeping);

        // Third timeout exhausts the retries
        assert!(h.run_probe_timer());
        assert!(!h.run_probe_timer());
        assert_eq!(h.clock.now_millis(), 15_000);
        assert_eq!(h.sent().len(), 3);
        assert_eq!(h.monitor.state(), LifecycleState::Idle);
        assert_eq!(h.monitor.latency("k0"), None);
    }

    #[test]
    fn test_reply_to_retry_is_measured_from_retry() {
        let mut h = Harness::new(many_servers(1));
        h.monitor.start();
        h.run_probe_timer();
        h.advance(40);
        h.monitor.on_reply(0);
        assert_eq!(h.monitor.latency("k0"), None);
        h.monitor.on_reply(1);
        assert_eq!(h.monitor.latency("k0"), Some(40));
    }

    #[test]
    fn test_stale_generation_ignored() {
        let mut h = Harness::new(many_servers(2));
        h.monitor.start();
        h.advance(5);
        h.monitor.on_transport_event(TransportEvent {
            generation: 0,
            kind: TransportEventKind::Reply(0),
        });
        assert_eq!(h.monitor.latency("k0"), None);

        h.monitor.on_transport_event(TransportEvent {
            generation: 1,
            kind: TransportEventKind::Reply(0),
        });
        assert_eq!(h.monitor.latency("k0"), Some(5));
    }

    #[test]
    fn test_transport_error_does_not_abort() {
        let mut h = Harness::new(many_servers(2));
        h.monitor.start();
        h.monitor.on_transport_event(TransportEvent {
            generation: 1,
            kind: TransportEventKind::Error("socket closed".into()),
        });
        assert_eq!(h.monitor.state(), LifecycleState::Sweeping);
        assert_eq!(h.monitor.in_flight_len(), 2);
    }

    #[test]
    fn test_transport_creation_failure_skips_sweep() {
        let mut h = Harness::with_config(many_servers(2), Config::default(), true);
        h.monitor.start();
        assert_eq!(h.monitor.state(), LifecycleState::Idle);
        assert_eq!(h.monitor.progress(), 1.0);
        assert!(h.monitor.timers().refresh.is_some());
    }

    #[test]
    fn test_tunnel_suspends_and_resumes() {
        let mut h = Harness::new(many_servers(2));
        h.monitor.start();
        assert_eq!(h.monitor.state(), LifecycleState::Sweeping);

        h.monitor.on_tunnel_state(TunnelState::Active);
        assert_eq!(h.monitor.state(), LifecycleState::Suspended);
        assert_eq!(h.monitor.progress(), 1.0);
        assert_eq!(h.monitor.timers().probe, None);

        // Start requests while the tunnel is up are deferred
        h.monitor.start();
        assert_eq!(h.monitor.state(), LifecycleState::Suspended);
        assert_eq!(h.sent().len(), 2);

        h.monitor.on_tunnel_state(TunnelState::Off);
        assert_eq!(h.monitor.state(), LifecycleState::Sweeping);
        assert_eq!(h.sent().len(), 4);
    }

    #[test]
    fn test_tunnel_off_without_pending_refresh_stays_idle() {
        let mut h = Harness::new(many_servers(2));
        h.monitor.on_tunnel_state(TunnelState::Active);
        h.monitor.on_tunnel_state(TunnelState::Off);
        assert_eq!(h.monitor.state(), LifecycleState::Idle);
        assert!(h.sent().is_empty());
    }

    #[test]
    fn test_background_pauses_sweep() {
        let mut h = Harness::new(many_servers(2));
        h.monitor.record_latency("k1", 80);
        h.monitor.start();
        h.monitor.on_app_state(AppState::Background);
        assert_eq!(h.monitor.state(), LifecycleState::Suspended);

        h.monitor.on_app_state(AppState::Foreground);
        assert_eq!(h.monitor.state(), LifecycleState::Sweeping);
        // Foreground refresh starts from a clean slate
        assert_eq!(h.monitor.latency("k1"), None);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let mut h = Harness::new(many_servers(2));
        h.monitor.stop();
        h.monitor.stop();
        h.monitor.start();
        h.monitor.stop();
        h.monitor.stop();
        assert_eq!(h.monitor.state(), LifecycleState::Idle);
        assert_eq!(h.monitor.in_flight_len(), 0);
        assert_eq!(h.monitor.timers().probe, None);
    }

    #[test]
    fn test_refresh_ignored_while_sweeping() {
        let mut h = Harness::new(many_servers(2));
        h.monitor.record_latency("k0", 30);
        h.monitor.start();
        h.monitor.refresh();
        assert_eq!(h.sent().len(), 2);
        assert_eq!(h.monitor.latency("k0"), Some(30));
    }

    #[test]
    fn test_disable_clears_and_stops() {
        let mut h = Harness::new(many_servers(2));
        h.monitor.initialize();
        assert_eq!(h.monitor.timers().refresh, Some(1000));

        h.run_next_timer();
        assert_eq!(h.monitor.state(), LifecycleState::Sweeping);
        h.advance(12);
        h.monitor.on_reply(0);

        h.monitor.set_enabled(false);
        assert_eq!(h.monitor.state(), LifecycleState::Idle);
        assert_eq!(h.monitor.average_latency(), 0);
        assert_eq!(h.monitor.timers().refresh, None);

        h.monitor.start();
        assert_eq!(h.monitor.state(), LifecycleState::Idle);

        h.monitor.set_enabled(true);
        assert_eq!(h.monitor.state(), LifecycleState::Sweeping);
    }

    #[test]
    fn test_notifications_debounced() {
        let mut h = Harness::new(many_servers(10));
        let mut events = h.monitor.subscribe();
        h.monitor.start();
        // Immediate notification at sweep start
        assert!(events.try_recv().is_ok());
        assert!(events.try_recv().is_err());

        for seq in 0..5 {
            h.advance(50);
            h.monitor.on_reply(seq);
        }
        assert!(events.try_recv().is_err());
        assert_eq!(h.monitor.timers().progress, Some(500));

        h.clock.set_millis(500);
        h.monitor.on_timer();
        match events.try_recv() {
            Ok(MonitorEvent::Changed { progress, state }) => {
                assert!((progress - 0.5).abs() < 1e-9);
                assert_eq!(state, LifecycleState::Sweeping);
            }
            other => panic!("expected change event, got {:?}", other),
        }
        assert!(events.try_recv().is_err());
    }

    fn two_city_catalog() -> Catalog {
        Catalog::new(vec![
            country(
                "de",
                vec![city(
                    "fra",
                    "Frankfurt",
                    50.11,
                    8.68,
                    vec![server("a1", 1), server("a2", 2), server("a3", 3)],
                )],
            ),
            country(
                "au",
                vec![city("syd", "Sydney", -33.87, 151.21, vec![server("b1", 4)])],
            ),
        ])
    }

    #[test]
    fn test_scoring_scenario() {
        let mut h = Harness::new(two_city_catalog());
        h.monitor.set_observer(Observer::new(52.5, 13.4, "de"));

        for key in ["a1", "a2", "a3"] {
            h.monitor.record_latency(key, 10);
        }
        h.monitor.record_latency("b1", 200);

        assert_eq!(h.score("de", "Frankfurt"), ConnectionScore::Excellent);
        assert_eq!(h.score("au", "Sydney"), ConnectionScore::Poor);
        assert_eq!(h.catalog.read().find_city("au", "Sydney").unwrap().latency_ms, 200);
        assert_eq!(h.monitor.average_latency(), 58);
    }

    #[test]
    fn test_city_cooldown_scenario() {
        let mut h = Harness::new(two_city_catalog());
        h.monitor.set_observer(Observer::new(52.5, 13.4, "de"));
        for key in ["a1", "a2", "a3"] {
            h.monitor.record_latency(key, 10);
        }
        h.monitor.record_latency("b1", 200);

        assert!(h.monitor.set_city_cooldown("de", "fra", 60));
        assert_eq!(h.score("de", "Frankfurt"), ConnectionScore::Unavailable);
        assert_eq!(h.monitor.cooldown("a2"), EPOCH + 60);
        assert_eq!(h.monitor.timers().cooldown, Some(60_000));

        // Latency changes cannot lift a suppressed city
        h.monitor.record_latency("a1", 5);
        assert_eq!(h.score("de", "Frankfurt"), ConnectionScore::Unavailable);

        h.clock.set_millis(60_000);
        h.monitor.on_timer();
        assert_eq!(h.score("de", "Frankfurt"), ConnectionScore::Excellent);
        assert_eq!(h.monitor.cooldown("a1"), 0);
        assert_eq!(h.monitor.timers().cooldown, None);
    }

    #[test]
    fn test_city_cooldown_unknown_city() {
        let mut h = Harness::new(two_city_catalog());
        assert!(!h.monitor.set_city_cooldown("de", "muc", 60));
        assert!(!h.monitor.set_city_cooldown("fr", "fra", 60));
        assert_eq!(h.monitor.timers().cooldown, None);
    }

    #[test]
    fn test_server_cooldown_and_timer_tracks_minimum() {
        let mut h = Harness::new(two_city_catalog());
        h.monitor.set_cooldown("a1", 120);
        assert_eq!(h.monitor.timers().cooldown, Some(120_000));
        h.monitor.set_cooldown("a2", 30);
        assert_eq!(h.monitor.timers().cooldown, Some(30_000));
        h.monitor.set_cooldown("a3", 300);
        assert_eq!(h.monitor.timers().cooldown, Some(30_000));
        assert_eq!(h.score("de", "Frankfurt"), ConnectionScore::Unavailable);

        h.clock.set_millis(30_000);
        h.monitor.on_timer();
        assert_eq!(h.monitor.cooldown("a2"), 0);
        assert_eq!(h.score("de", "Frankfurt"), ConnectionScore::Poor);
        assert_eq!(h.monitor.timers().cooldown, Some(120_000));

        // Clearing is idempotent
        h.monitor.set_cooldown("a1", 0);
        h.monitor.set_cooldown("a1", -1);
        assert_eq!(h.monitor.cooldown("a1"), 0);
        assert_eq!(h.monitor.timers().cooldown, Some(300_000));
    }

    #[test]
    fn test_cooldown_does_not_block_probing() {
        let mut h = Harness::new(two_city_catalog());
        h.monitor.set_city_cooldown("au", "syd", 600);
        h.monitor.start();
        assert_eq!(h.sent().len(), 4);
    }

    #[test]
    fn test_queue_ordered_by_observer_distance() {
        let mut h = Harness::new(two_city_catalog());
        h.monitor.set_observer(Observer::new(-37.8, 144.9, "au"));
        h.monitor.start();
        // Sydney is closest to Melbourne
        assert_eq!(h.sent()[0], (Ipv4Addr::new(10, 0, 0, 4), 0));
    }

    #[test]
    fn test_multi_hop_via_monitor() {
        let mut h = Harness::new(two_city_catalog());
        assert_eq!(
            h.monitor.multi_hop_score("de", "Frankfurt", "au", "Sydney"),
            ConnectionScore::Good
        );
        assert_eq!(
            h.monitor.multi_hop_score("de", "Berlin", "au", "Sydney"),
            ConnectionScore::NoData
        );
        h.monitor.set_city_cooldown("de", "fra", 60);
        assert_eq!(
            h.monitor.multi_hop_score("de", "Frankfurt", "au", "Sydney"),
            ConnectionScore::Unavailable
        );
    }

    #[test]
    fn test_parallel_ceiling_from_config() {
        let config = Config {
            max_parallel: 3,
            ..Default::default()
        };
        let mut h = Harness::with_config(many_servers(10), config, false);
        h.monitor.start();
        assert_eq!(h.monitor.in_flight_len(), 3);
    }

    #[test]
    fn test_unbounded_cooldown_saturates_timer() {
        let mut h = Harness::new(two_city_catalog());
        h.monitor.set_cooldown("a1", i64::MAX);

        assert_eq!(h.monitor.cooldown("a1"), i64::MAX);
        assert_eq!(h.monitor.timers().cooldown, Some(u64::MAX));
        assert_eq!(h.score("de", "Frankfurt"), ConnectionScore::Poor);

        h.advance(60_000);
        h.monitor.on_timer();
        assert_eq!(h.monitor.cooldown("a1"), i64::MAX);
    }

    #[test]
    fn test_oversized_durations_saturate() {
        let config = Config {
            probe_timeout: Duration::MAX,
            refresh_interval: Duration::MAX,
            progress_delay: Duration::MAX,
            ..Default::default()
        };
        let mut h = Harness::with_config(many_servers(2), config, false);
        h.monitor.start();
        assert_eq!(h.monitor.timers().probe, Some(u64::MAX));
        assert_eq!(h.monitor.timers().progress, Some(u64::MAX));

        h.monitor.stop();
        assert_eq!(h.monitor.timers().refresh, Some(u64::MAX));
    }

    #[test]
    fn test_replaced_catalog_swept_on_change() {
        let mut h = Harness::new(two_city_catalog());
        h.catalog.write().replace(vec![country(
            "nl",
            vec![city("ams", "Amsterdam", 52.37, 4.90, vec![server("n1", 9)])],
        )]);
        h.monitor.catalog_changed();
        assert_eq!(h.sent(), vec![(Ipv4Addr::new(10, 0, 0, 9), 0)]);

        h.advance(20);
        h.monitor.on_reply(0);
        assert_eq!(h.monitor.state(), LifecycleState::Idle);

        let catalog = h.catalog.read();
        assert!(catalog.find_city("de", "Frankfurt").is_none());
        assert!(catalog.city_key_of("a1").is_none());
        let amsterdam = catalog.find_city("nl", "Amsterdam").unwrap();
        assert_eq!(amsterdam.country, "nl");
        assert_eq!(amsterdam.latency_ms, 20);
        assert_eq!(amsterdam.score, ConnectionScore::Poor);
    }
}
