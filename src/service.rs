//! Async driver for the latency monitor.
//!
//! [`LatencyService::run`] owns the [`LatencyMonitor`] on a single task and
//! feeds it transport events, host commands, tunnel/app state changes, and
//! timer expiries one at a time. Everything else talks to it through a
//! cloneable [`MonitorHandle`].

use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::catalog::SharedCatalog;
use crate::clock::{SharedClock, SystemClock};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::geo::Observer;
use crate::lifecycle::{AppState, LifecycleState, MonitorEvent, TunnelState};
use crate::monitor::LatencyMonitor;
use crate::probe::{EventRx, SenderFactory, SystemSenderFactory};
use crate::state::ConnectionScore;

/// Snapshot of the monitor for status queries
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MonitorStatus {
    pub state: LifecycleState,
    pub progress: f64,
    pub average_latency_ms: u64,
}

#[derive(Debug)]
pub enum Command {
    Refresh,
    CatalogChanged,
    SetEnabled(bool),
    SetObserver(Observer),
    SetCooldown {
        public_key: String,
        timeout_secs: i64,
    },
    SetCityCooldown {
        country: String,
        city_code: String,
        timeout_secs: i64,
        reply: oneshot::Sender<bool>,
    },
    MultiHopScore {
        exit_country: String,
        exit_city: String,
        entry_country: String,
        entry_city: String,
        reply: oneshot::Sender<ConnectionScore>,
    },
    Status(oneshot::Sender<MonitorStatus>),
}

/// Cloneable front end to a running [`LatencyService`]
#[derive(Clone)]
pub struct MonitorHandle {
    commands: mpsc::UnboundedSender<Command>,
    catalog: SharedCatalog,
    notify: broadcast::Sender<MonitorEvent>,
}

impl MonitorHandle {
    fn send(&self, command: Command) -> Result<()> {
        self.commands.send(command).map_err(|_| Error::ServiceClosed)
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.send(build(tx))?;
        rx.await.map_err(|_| Error::ServiceClosed)
    }

    /// Discard measurements and sweep again (ignored mid-sweep)
    pub fn refresh(&self) -> Result<()> {
        self.send(Command::Refresh)
    }

    /// The catalog behind [`MonitorHandle::catalog`] was modified
    pub fn catalog_changed(&self) -> Result<()> {
        self.send(Command::CatalogChanged)
    }

    pub fn set_enabled(&self, enabled: bool) -> Result<()> {
        self.send(Command::SetEnabled(enabled))
    }

    pub fn set_observer(&self, observer: Observer) -> Result<()> {
        self.send(Command::SetObserver(observer))
    }

    pub fn set_cooldown(&self, public_key: impl Into<String>, timeout_secs: i64) -> Result<()> {
        self.send(Command::SetCooldown {
            public_key: public_key.into(),
            timeout_secs,
        })
    }

    /// Returns whether the city exists
    pub async fn set_city_cooldown(
        &self,
        country: impl Into<String>,
        city_code: impl Into<String>,
        timeout_secs: i64,
    ) -> Result<bool> {
        let country = country.into();
        let city_code = city_code.into();
        self.request(|reply| Command::SetCityCooldown {
            country,
            city_code,
            timeout_secs,
            reply,
        })
        .await
    }

    pub async fn multi_hop_score(
        &self,
        exit: (&str, &str),
        entry: (&str, &str),
    ) -> Result<ConnectionScore> {
        let (exit_country, exit_city) = (exit.0.to_string(), exit.1.to_string());
        let (entry_country, entry_city) = (entry.0.to_string(), entry.1.to_string());
        self.request(|reply| Command::MultiHopScore {
            exit_country,
            exit_city,
            entry_country,
            entry_city,
            reply,
        })
        .await
    }

    pub async fn status(&self) -> Result<MonitorStatus> {
        self.request(Command::Status).await
    }

    /// Current score of a city, read straight from the catalog
    pub fn city_score(&self, country: &str, city: &str) -> Option<ConnectionScore> {
        self.catalog.read().find_city(country, city).map(|c| c.score)
    }

    pub fn catalog(&self) -> SharedCatalog {
        self.catalog.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.notify.subscribe()
    }
}

pub struct LatencyService {
    monitor: LatencyMonitor,
    clock: SharedClock,
    transport_rx: EventRx,
    commands_rx: mpsc::UnboundedReceiver<Command>,
    tunnel: watch::Receiver<TunnelState>,
    app: watch::Receiver<AppState>,
}

impl LatencyService {
    /// Service with real sockets and the system clock
    pub fn new(
        config: Config,
        catalog: SharedCatalog,
        tunnel: watch::Receiver<TunnelState>,
        app: watch::Receiver<AppState>,
    ) -> (Self, MonitorHandle) {
        let factory = SystemSenderFactory::from_config(&config);
        Self::with_parts(
            config,
            catalog,
            SystemClock::shared(),
            Box::new(factory),
            tunnel,
            app,
        )
    }

    pub fn with_parts(
        config: Config,
        catalog: SharedCatalog,
        clock: SharedClock,
        factory: Box<dyn SenderFactory>,
        tunnel: watch::Receiver<TunnelState>,
        app: watch::Receiver<AppState>,
    ) -> (Self, MonitorHandle) {
        let (events_tx, transport_rx) = mpsc::unbounded_channel();
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let monitor = LatencyMonitor::new(config, catalog.clone(), clock.clone(), factory, events_tx);

        let handle = MonitorHandle {
            commands,
            catalog,
            notify: monitor.notifier(),
        };
        let service = Self {
            monitor,
            clock,
            transport_rx,
            commands_rx,
            tunnel,
            app,
        };
        (service, handle)
    }

    /// Run until cancelled
    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        self.monitor.initialize();

        let tunnel = *self.tunnel.borrow_and_update();
        if tunnel != TunnelState::Off {
            self.monitor.on_tunnel_state(tunnel);
        }
        let app = *self.app.borrow_and_update();
        if app != AppState::Foreground {
            self.monitor.on_app_state(app);
        }

        let mut commands_open = true;
        let mut tunnel_open = true;
        let mut app_open = true;

        info!("latency service running");

        loop {
            let wait = self
                .monitor
                .next_deadline()
                .map(|deadline| Duration::from_millis(deadline.saturating_sub(self.clock.now_millis())));

            tokio::select! {
                _ = cancel.cancelled() => {
                    break;
                }
                Some(event) = self.transport_rx.recv() => {
                    self.monitor.on_transport_event(event);
                }
                command = self.commands_rx.recv(), if commands_open => {
                    match command {
                        Some(command) => self.handle(command),
                        None => {
                            debug!("all monitor handles dropped");
                            commands_open = false;
                        }
                    }
                }
                changed = self.tunnel.changed(), if tunnel_open => {
                    match changed {
                        Ok(()) => {
                            let state = *self.tunnel.borrow_and_update();
                            debug!(?state, "tunnel state changed");
                            self.monitor.on_tunnel_state(state);
                        }
                        Err(_) => tunnel_open = false,
                    }
                }
                changed = self.app.changed(), if app_open => {
                    match changed {
                        Ok(()) => {
                            let state = *self.app.borrow_and_update();
                            debug!(?state, "application state changed");
                            self.monitor.on_app_state(state);
                        }
                        Err(_) => app_open = false,
                    }
                }
                _ = tokio::time::sleep(wait.unwrap_or_default()), if wait.is_some() => {
                    self.monitor.on_timer();
                }
            }
        }

        self.monitor.shutdown();
        info!("latency service stopped");
        Ok(())
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Refresh => self.monitor.refresh(),
            Command::CatalogChanged => self.monitor.catalog_changed(),
            Command::SetEnabled(enabled) => self.monitor.set_enabled(enabled),
            Command::SetObserver(observer) => self.monitor.set_observer(observer),
            Command::SetCooldown {
                public_key,
                timeout_secs,
            } => self.monitor.set_cooldown(&public_key, timeout_secs),
            Command::SetCityCooldown {
                country,
                city_code,
                timeout_secs,
                reply,
            } => {
                let found = self
                    .monitor
                    .set_city_cooldown(&country, &city_code, timeout_secs);
                let _ = reply.send(found);
            }
            Command::MultiHopScore {
                exit_country,
                exit_city,
                entry_country,
                entry_city,
                reply,
            } => {
                let score = self.monitor.multi_hop_score(
                    &exit_country,
                    &exit_city,
                    &entry_country,
                    &entry_city,
                );
                let _ = reply.send(score);
            }
            Command::Status(reply) => {
                let _ = reply.send(MonitorStatus {
                    state: self.monitor.state(),
                    progress: self.monitor.progress(),
                    average_latency_ms: self.monitor.average_latency(),
                });
            }
        }
    }
}
