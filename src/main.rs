use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use relayscore::catalog::Catalog;
use relayscore::cli::Cli;
use relayscore::config::{Config, init_logging};
use relayscore::export::{ScoreReport, export_json_file, export_json_string};
use relayscore::geo::Observer;
use relayscore::lifecycle::{AppState, LifecycleState, MonitorEvent, TunnelState};
use relayscore::service::{LatencyService, MonitorHandle};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None if Config::default_path().exists() => Config::load(Config::default_path())?,
        None => Config::default(),
    };
    cli.apply(&mut config);
    config.validate()?;
    init_logging(&config.logging)?;

    let catalog = Catalog::load_json(&cli.catalog)
        .with_context(|| format!("loading catalog {}", cli.catalog.display()))?;
    info!(
        countries = catalog.countries().len(),
        servers = catalog.server_count(),
        "catalog loaded"
    );

    // A standalone run never has a tunnel up and is always in the foreground
    let (_tunnel_tx, tunnel_rx) = watch::channel(TunnelState::Off);
    let (_app_tx, app_rx) = watch::channel(AppState::Foreground);

    let (service, handle) = LatencyService::new(config, catalog.shared(), tunnel_rx, app_rx);
    let cancel = CancellationToken::new();
    let service_task = tokio::spawn(service.run(cancel.clone()));

    if let (Some(lat), Some(lon)) = (cli.lat, cli.lon) {
        let country = cli.country.clone().unwrap_or_default();
        handle.set_observer(Observer::new(lat, lon, country))?;
    }

    let mut events = handle.subscribe();
    handle.refresh()?;

    let result = if cli.watch {
        watch_sweeps(&cli, &handle, &mut events).await
    } else {
        wait_for_sweep(&handle, &mut events).await?;
        report(&cli, &handle).await
    };

    cancel.cancel();
    service_task.await??;
    result
}

/// Block until the sweep started by the last refresh has finished
async fn wait_for_sweep(
    handle: &MonitorHandle,
    events: &mut broadcast::Receiver<MonitorEvent>,
) -> Result<()> {
    // A sweep that could not start leaves the monitor idle without an event
    if handle.status().await?.state != LifecycleState::Sweeping {
        return Ok(());
    }

    loop {
        match events.recv().await {
            Ok(MonitorEvent::Changed { state, progress }) => {
                if state == LifecycleState::Sweeping {
                    info!(progress = format!("{:.0}%", progress * 100.0), "sweeping");
                } else if handle.status().await?.state != LifecycleState::Sweeping {
                    return Ok(());
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "missed monitor events");
            }
            Err(broadcast::error::RecvError::Closed) => return Ok(()),
        }
    }
}

/// Report after every completed sweep until Ctrl-C
async fn watch_sweeps(
    cli: &Cli,
    handle: &MonitorHandle,
    events: &mut broadcast::Receiver<MonitorEvent>,
) -> Result<()> {
    let mut sweeping = handle.status().await?.state == LifecycleState::Sweeping;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                return Ok(());
            }
            event = events.recv() => match event {
                Ok(MonitorEvent::Changed { state, .. }) => {
                    if state == LifecycleState::Sweeping {
                        sweeping = true;
                    } else if sweeping {
                        sweeping = false;
                        report(cli, handle).await?;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "missed monitor events");
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            }
        }
    }
}

async fn report(cli: &Cli, handle: &MonitorHandle) -> Result<()> {
    let status = handle.status().await?;
    let mut report = ScoreReport::from_catalog(&handle.catalog().read(), status.average_latency_ms);
    report.sort_by_quality();

    if cli.json {
        println!("{}", export_json_string(&report)?);
    } else {
        print_table(&report);
    }

    for pair in &cli.multihop {
        let score = handle
            .multi_hop_score(
                (&pair.exit.country, &pair.exit.city),
                (&pair.entry.country, &pair.entry.city),
            )
            .await?;
        println!(
            "multihop {}:{} via {}:{}  {}",
            pair.exit.country, pair.exit.city, pair.entry.country, pair.entry.city, score
        );
    }

    if let Some(dir) = &cli.export {
        let path = export_json_file(&report, dir)?;
        info!(path = %path.display(), "report written");
    }
    Ok(())
}

fn print_table(report: &ScoreReport) {
    println!(
        "{:<4} {:<24} {:>7} {:>10}  {}",
        "CC", "CITY", "SERVERS", "LATENCY", "SCORE"
    );
    for city in &report.cities {
        let latency = if city.latency_ms > 0 {
            format!("{} ms", city.latency_ms)
        } else {
            "-".to_string()
        };
        println!(
            "{:<4} {:<24} {:>7} {:>10}  {}",
            city.country, city.name, city.servers, latency, city.score
        );
    }
    println!("average latency: {} ms", report.average_latency_ms);
}
