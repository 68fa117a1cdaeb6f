//! Output formatting and persistence for analysis results.
//!
//! Supports the JSON summary, flat CSV metric tables (optionally gzipped),
//! a per-run history CSV that is appended to, and anomaly CSV for stdout.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use csv::{Writer, WriterBuilder};
use flate2::Compression;
use flate2::write::GzEncoder;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::analyzers::analyzer::AccuracyAnalysis;
use crate::analyzers::grade::{QualityCategory, geh_pass_rate_category, mape_category};
use crate::analyzers::metrics::GroupMetrics;
use crate::analyzers::quality::ClassifiedRecord;
use crate::analyzers::summary::AccuracySummary;
use crate::analyzers::types::TimeBucket;

/// One row of the per-location or per-bucket metric table.
#[derive(Debug, Serialize)]
struct GroupRow {
    group_by: &'static str,
    key: String,
    sample_size: usize,
    mae: Option<f64>,
    rmse: Option<f64>,
    mape: Option<f64>,
    mape_sample_size: usize,
    correlation: Option<f64>,
    geh_mean: Option<f64>,
    geh_pass_rate: Option<f64>,
    total_observed_flow: f64,
    total_simulated_flow: f64,
    flow_ratio: Option<f64>,
    category: QualityCategory,
}

impl GroupRow {
    fn new(group_by: &'static str, key: String, g: &GroupMetrics) -> Self {
        let m = &g.metrics;
        Self {
            group_by,
            key,
            sample_size: m.sample_size,
            mae: m.mae,
            rmse: m.rmse,
            mape: m.mape,
            mape_sample_size: m.mape_sample_size,
            correlation: m.correlation,
            geh_mean: m.geh_mean,
            geh_pass_rate: m.geh_pass_rate,
            total_observed_flow: g.total_observed_flow,
            total_simulated_flow: g.total_simulated_flow,
            flow_ratio: g.flow_ratio,
            category: g.category,
        }
    }
}

/// One aligned sample with its pointwise metrics and tags.
#[derive(Debug, Serialize)]
struct AlignedRow<'a> {
    location_id: &'a str,
    time_bucket: TimeBucket,
    observed_flow: f64,
    simulated_flow: f64,
    observed_speed: Option<f64>,
    simulated_speed: Option<f64>,
    simulated_occupancy: Option<f64>,
    mape: Option<f64>,
    geh: Option<f64>,
    category: QualityCategory,
    /// Tags joined with `;`, empty when the sample is clean.
    tags: String,
}

impl<'a> From<&'a ClassifiedRecord> for AlignedRow<'a> {
    fn from(c: &'a ClassifiedRecord) -> Self {
        let r = &c.record;
        Self {
            location_id: &r.location_id,
            time_bucket: r.time_bucket,
            observed_flow: r.observed_flow,
            simulated_flow: r.simulated_flow,
            observed_speed: r.observed_speed,
            simulated_speed: r.simulated_speed,
            simulated_occupancy: r.simulated_occupancy,
            mape: c.mape,
            geh: c.geh,
            category: c.classification.category,
            tags: c
                .classification
                .tags
                .iter()
                .map(|t| t.as_str())
                .collect::<Vec<_>>()
                .join(";"),
        }
    }
}

/// Headline numbers of one run, appended to a history CSV.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunRecord {
    pub generated_at: DateTime<Utc>,
    pub observed_rows_kept: Option<usize>,
    pub simulated_rows_kept: Option<usize>,
    pub matched_ids: usize,
    pub match_rate: f64,
    pub aligned_records: usize,
    pub mae: Option<f64>,
    pub rmse: Option<f64>,
    pub mape: Option<f64>,
    pub geh_mean: Option<f64>,
    pub geh_pass_rate: Option<f64>,
    pub correlation: Option<f64>,
    pub mape_category: QualityCategory,
    pub geh_category: QualityCategory,
    pub anomalous_records: usize,
}

impl RunRecord {
    pub fn from_summary(s: &AccuracySummary) -> Self {
        let o = &s.overall;
        Self {
            generated_at: s.generated_at,
            observed_rows_kept: s.observed_normalization.as_ref().map(|r| r.kept_rows),
            simulated_rows_kept: s.simulated_normalization.as_ref().map(|r| r.kept_rows),
            matched_ids: s.alignment.matched_ids,
            match_rate: s.alignment.match_rate,
            aligned_records: s.alignment.final_aligned_records,
            mae: o.mae,
            rmse: o.rmse,
            mape: o.mape,
            geh_mean: o.geh_mean,
            geh_pass_rate: o.geh_pass_rate,
            correlation: o.correlation,
            mape_category: mape_category(o.mape),
            geh_category: geh_pass_rate_category(o.geh_pass_rate),
            anomalous_records: s.anomaly_counts.anomalous_records,
        }
    }
}

/// Logs the headline metrics of a summary.
pub fn log_summary(summary: &AccuracySummary) {
    let o = &summary.overall;
    info!(
        matched_ids = summary.alignment.matched_ids,
        match_rate = summary.alignment.match_rate,
        samples = o.sample_size,
        mae = ?o.mae,
        rmse = ?o.rmse,
        mape = ?o.mape,
        geh_pass_rate = ?o.geh_pass_rate,
        category = %mape_category(o.mape),
        anomalies = summary.anomaly_counts.anomalous_records,
        "Accuracy summary"
    );
    debug!("{:#?}", summary.alignment);
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory '{}'", parent.display()))?;
    }
    Ok(())
}

/// Writes the summary as pretty-printed JSON.
pub fn write_summary_json(path: impl AsRef<Path>, summary: &AccuracySummary) -> Result<()> {
    let path = path.as_ref();
    ensure_parent(path)?;
    let file = File::create(path).with_context(|| format!("failed to create '{}'", path.display()))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, summary)?;
    writer.flush()?;
    info!(path = %path.display(), "Wrote summary JSON");
    Ok(())
}

fn serialize_rows<W: Write, T: Serialize>(writer: W, rows: impl IntoIterator<Item = T>) -> Result<W> {
    let mut csv = Writer::from_writer(writer);
    for row in rows {
        csv.serialize(row)?;
    }
    Ok(csv.into_inner().map_err(|e| e.into_error())?)
}

/// Writes `rows` to `dir/name.csv`, or `dir/name.csv.gz` when `gzip` is set.
fn write_table<T: Serialize>(
    dir: &Path,
    name: &str,
    rows: impl IntoIterator<Item = T>,
    gzip: bool,
) -> Result<PathBuf> {
    let path = if gzip {
        dir.join(format!("{name}.csv.gz"))
    } else {
        dir.join(format!("{name}.csv"))
    };
    let file = File::create(&path).with_context(|| format!("failed to create '{}'", path.display()))?;

    if gzip {
        let encoder = serialize_rows(GzEncoder::new(file, Compression::default()), rows)?;
        encoder.finish()?;
    } else {
        serialize_rows(BufWriter::new(file), rows)?.flush()?;
    }

    debug!(path = %path.display(), "Wrote table");
    Ok(path)
}

/// Exports per-location metrics, per-bucket metrics and the aligned samples
/// as CSV files under `dir`. Returns the written paths.
pub fn write_metric_tables(
    dir: impl AsRef<Path>,
    analysis: &AccuracyAnalysis,
    gzip: bool,
) -> Result<Vec<PathBuf>> {
    let dir = dir.as_ref();
    fs::create_dir_all(dir).with_context(|| format!("failed to create directory '{}'", dir.display()))?;
    let summary = &analysis.summary;

    let locations = summary
        .per_location
        .iter()
        .map(|l| GroupRow::new("location", l.location_id.clone(), &l.group));
    let buckets = summary
        .per_time_bucket
        .iter()
        .map(|b| GroupRow::new("time_bucket", b.time_bucket.to_string(), &b.group));
    let aligned = analysis.classified.iter().map(AlignedRow::from);

    let paths = vec![
        write_table(dir, "location_metrics", locations, gzip)?,
        write_table(dir, "time_bucket_metrics", buckets, gzip)?,
        write_table(dir, "aligned_records", aligned, gzip)?,
    ];
    info!(dir = %dir.display(), files = paths.len(), gzip, "Exported metric tables");
    Ok(paths)
}

/// Writes the anomalous samples as CSV, e.g. to stdout.
pub fn write_anomalies<W: Write>(writer: W, analysis: &AccuracyAnalysis) -> Result<()> {
    let mut writer = serialize_rows(writer, analysis.anomalies().map(AlignedRow::from))?;
    writer.flush()?;
    Ok(())
}

/// Appends a [`RunRecord`] as a row to a CSV file.
///
/// Creates the file with headers if it does not already exist.
pub fn append_record(path: &str, record: &RunRecord) -> Result<()> {
    let file_exists = Path::new(path).exists();
    debug!(path, file_exists, "Appending CSV record");

    ensure_parent(Path::new(path))?;
    let file = OpenOptions::new().append(true).create(true).open(path)?;

    let mut writer = WriterBuilder::new()
        .has_headers(!file_exists) // IMPORTANT when appending
        .from_writer(file);

    writer.serialize(record)?;
    writer.flush()?;

    Ok(())
}
