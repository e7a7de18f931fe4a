use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::catalog::Catalog;
use crate::state::ConnectionScore;

/// One city in a score report
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CityReport {
    pub country: String,
    pub code: String,
    pub name: String,
    pub servers: usize,
    pub latency_ms: u64,
    pub score: ConnectionScore,
    /// Numeric form of `score` for consumers that sort or chart
    pub level: i8,
}

/// Snapshot of every city score at a point in time
#[derive(Debug, Clone, Serialize)]
pub struct ScoreReport {
    pub generated_at: DateTime<Utc>,
    /// Mean over all measured servers
    pub average_latency_ms: u64,
    pub cities: Vec<CityReport>,
}

impl ScoreReport {
    pub fn from_catalog(catalog: &Catalog, average_latency_ms: u64) -> Self {
        let cities = catalog
            .cities()
            .map(|city| CityReport {
                country: city.country.clone(),
                code: city.code.clone(),
                name: city.name.clone(),
                servers: city.servers.len(),
                latency_ms: city.latency_ms,
                score: city.score,
                level: city.score.level(),
            })
            .collect();
        Self {
            generated_at: Utc::now(),
            average_latency_ms,
            cities,
        }
    }

    /// Best score first, then lowest latency; unmeasured cities sort last
    /// within their score
    pub fn sort_by_quality(&mut self) {
        self.cities.sort_by(|a, b| {
            b.score
                .cmp(&a.score)
                .then_with(|| (a.latency_ms == 0).cmp(&(b.latency_ms == 0)))
                .then_with(|| a.latency_ms.cmp(&b.latency_ms))
        });
    }
}

/// Export report to JSON
pub fn export_json<W: Write>(report: &ScoreReport, writer: W) -> Result<()> {
    serde_json::to_writer_pretty(writer, report)?;
    Ok(())
}

pub fn export_json_string(report: &ScoreReport) -> Result<String> {
    Ok(serde_json::to_string_pretty(report)?)
}

/// Export report into `dir` with a timestamped name
pub fn export_json_file(report: &ScoreReport, dir: &Path) -> Result<PathBuf> {
    let timestamp = report.generated_at.format("%Y%m%d-%H%M%S");
    let path = dir.join(format!("relayscore-{}.json", timestamp));

    let file = std::fs::File::create(&path)?;
    export_json(report, std::io::BufWriter::new(file))?;

    Ok(path)
}
