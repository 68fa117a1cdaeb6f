//! Raw tabular rows → canonical [`FlowRecord`]s.
//!
//! Column lookup by name happens exactly once, when a [`SourceSchema`] is
//! resolved against a table header. Per-row problems drop the row and bump a
//! counter in [`NormalizeReport`]; only a header that lacks a required field
//! altogether is an error.

use chrono::{DateTime, DurationRound, NaiveDateTime, TimeDelta};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::analyzers::types::{FlowRecord, Source, TimeBucket};
use crate::config::NormalizeConfig;
use crate::error::{EngineError, EngineResult};

/// Timestamp layouts accepted besides RFC 3339.
static TIMESTAMP_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y/%m/%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y/%m/%d %H:%M",
];

/// Header plus string cells, as handed over by a loader.
#[derive(Debug, Clone, Default)]
pub struct RawTable {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl RawTable {
    pub fn new<H: Into<String>>(headers: impl IntoIterator<Item = H>) -> Self {
        Self {
            headers: headers.into_iter().map(Into::into).collect(),
            rows: Vec::new(),
        }
    }

    /// Appends a row. Rows shorter than the header are padded with missing cells.
    pub fn push_row<C: Into<String>>(&mut self, cells: impl IntoIterator<Item = C>) {
        self.rows.push(cells.into_iter().map(Into::into).collect());
    }

    pub fn with_row<C: Into<String>>(mut self, cells: impl IntoIterator<Item = C>) -> Self {
        self.push_row(cells);
        self
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Index of the first header matching any of `aliases` (case and
    /// surrounding whitespace ignored).
    fn find(&self, aliases: &[&str]) -> Option<usize> {
        aliases.iter().find_map(|alias| {
            self.headers
                .iter()
                .position(|h| h.trim().eq_ignore_ascii_case(alias))
        })
    }
}

/// Where each canonical field may live in a source's table.
#[derive(Debug, Clone)]
pub struct SourceSchema {
    pub source: Source,
    /// Columns holding the location id verbatim.
    pub location: &'static [&'static str],
    /// Columns holding a per-lane detector id; the location is the id with
    /// its trailing `_<lane>` removed.
    pub detector: &'static [&'static str],
    pub timestamp: &'static [&'static str],
    /// Columns holding seconds since the simulation start.
    pub offset_seconds: &'static [&'static str],
    pub flow: &'static [&'static str],
    /// Per-class flow columns summed when no total flow column exists.
    pub sub_flows: &'static [&'static str],
    pub speed: &'static [&'static str],
    pub occupancy: &'static [&'static str],
    pub contributions: &'static [&'static str],
}

impl SourceSchema {
    /// Gantry export layout.
    pub const fn observed() -> Self {
        Self {
            source: Source::Observed,
            location: &["gantry_id", "start_gantryid", "location_id"],
            detector: &[],
            timestamp: &["start_time", "timestamp", "interval_start"],
            offset_seconds: &[],
            flow: &["flow", "total_flow"],
            sub_flows: &["k1", "k2", "k3", "k4", "h1", "h2", "h3", "h4", "h5", "h6"],
            speed: &["speed"],
            occupancy: &[],
            contributions: &[],
        }
    }

    /// E1 detector interval layout.
    pub const fn simulated() -> Self {
        Self {
            source: Source::Simulated,
            location: &["gantry_id", "location_id"],
            detector: &["detector_id", "id"],
            timestamp: &["start_time", "timestamp"],
            offset_seconds: &["begin"],
            flow: &["flow", "entered"],
            sub_flows: &[],
            speed: &["speed"],
            occupancy: &["occupancy"],
            contributions: &["nvehcontrib"],
        }
    }
}

#[derive(Debug)]
enum LocationColumn {
    Plain(usize),
    StripLane(usize),
}

#[derive(Debug)]
enum TimeColumn {
    Absolute(usize),
    Offset { column: usize, start: NaiveDateTime },
}

#[derive(Debug)]
enum FlowColumn {
    Total(usize),
    Summed(Vec<usize>),
}

#[derive(Debug)]
struct Columns {
    location: LocationColumn,
    time: TimeColumn,
    flow: FlowColumn,
    speed: Option<usize>,
    occupancy: Option<usize>,
    contributions: Option<usize>,
}

impl Columns {
    fn resolve(
        table: &RawTable,
        schema: &SourceSchema,
        simulation_start: Option<NaiveDateTime>,
    ) -> EngineResult<Self> {
        let mut missing = Vec::new();

        let location = if let Some(i) = table.find(schema.location) {
            Some(LocationColumn::Plain(i))
        } else if let Some(i) = table.find(schema.detector) {
            Some(LocationColumn::StripLane(i))
        } else {
            missing.push("location_id".to_string());
            None
        };

        let time = if let Some(i) = table.find(schema.timestamp) {
            Some(TimeColumn::Absolute(i))
        } else if let Some(i) = table.find(schema.offset_seconds) {
            let start = simulation_start.ok_or_else(|| {
                EngineError::InvalidConfig(format!(
                    "{} table uses simulation-relative offsets but no simulation start is configured",
                    schema.source
                ))
            })?;
            Some(TimeColumn::Offset { column: i, start })
        } else {
            missing.push("timestamp".to_string());
            None
        };

        let flow = if let Some(i) = table.find(schema.flow) {
            Some(FlowColumn::Total(i))
        } else {
            let parts: Vec<usize> = schema
                .sub_flows
                .iter()
                .filter_map(|c| table.find(std::slice::from_ref(c)))
                .collect();
            if parts.is_empty() {
                missing.push("flow".to_string());
                None
            } else {
                Some(FlowColumn::Summed(parts))
            }
        };

        match (location, time, flow) {
            (Some(location), Some(time), Some(flow)) => Ok(Columns {
                location,
                time,
                flow,
                speed: table.find(schema.speed),
                occupancy: table.find(schema.occupancy),
                contributions: table.find(schema.contributions),
            }),
            _ => Err(EngineError::MissingColumns {
                series: schema.source,
                missing,
            }),
        }
    }
}

/// Row accounting for one normalization pass. `kept_rows` plus the dropped
/// counters always equals `total_rows`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NormalizeReport {
    pub source: Source,
    pub total_rows: usize,
    pub kept_rows: usize,
    pub dropped_missing_location: usize,
    pub dropped_missing_timestamp: usize,
    pub dropped_missing_flow: usize,
    pub dropped_negative_flow: usize,
}

impl NormalizeReport {
    fn new(source: Source) -> Self {
        Self {
            source,
            total_rows: 0,
            kept_rows: 0,
            dropped_missing_location: 0,
            dropped_missing_timestamp: 0,
            dropped_missing_flow: 0,
            dropped_negative_flow: 0,
        }
    }

    pub fn dropped_rows(&self) -> usize {
        self.dropped_missing_location
            + self.dropped_missing_timestamp
            + self.dropped_missing_flow
            + self.dropped_negative_flow
    }
}

#[derive(Debug, Clone)]
pub struct Normalized {
    pub records: Vec<FlowRecord>,
    pub report: NormalizeReport,
}

enum Rejection {
    Location,
    Timestamp,
    Flow,
    NegativeFlow,
}

/// Converts every usable row of `table` into a [`FlowRecord`] bucketed at the
/// width configured for `schema.source`.
#[tracing::instrument(skip_all, fields(source = %schema.source, rows = table.len()))]
pub fn normalize(
    table: &RawTable,
    schema: &SourceSchema,
    cfg: &NormalizeConfig,
) -> EngineResult<Normalized> {
    let width = match schema.source {
        Source::Observed => cfg.observed_bucket()?,
        Source::Simulated => cfg.simulated_bucket()?,
    };

    let columns = Columns::resolve(table, schema, cfg.simulation_start)?;
    debug!(?columns, "Resolved columns");

    let mut report = NormalizeReport::new(schema.source);
    let mut records = Vec::with_capacity(table.len());

    for row in &table.rows {
        report.total_rows += 1;
        match normalize_row(row, &columns, width, schema.source) {
            Ok(record) => {
                report.kept_rows += 1;
                records.push(record);
            }
            Err(Rejection::Location) => report.dropped_missing_location += 1,
            Err(Rejection::Timestamp) => report.dropped_missing_timestamp += 1,
            Err(Rejection::Flow) => report.dropped_missing_flow += 1,
            Err(Rejection::NegativeFlow) => report.dropped_negative_flow += 1,
        }
    }

    if report.total_rows > 0 && report.kept_rows == 0 {
        warn!(total = report.total_rows, "Every row was dropped during normalization");
    } else {
        info!(
            kept = report.kept_rows,
            dropped = report.dropped_rows(),
            "Normalization complete"
        );
    }

    Ok(Normalized { records, report })
}

fn normalize_row(
    row: &[String],
    columns: &Columns,
    width: TimeDelta,
    source: Source,
) -> Result<FlowRecord, Rejection> {
    let location_id = match columns.location {
        LocationColumn::Plain(i) => cell(row, i).map(str::to_string),
        LocationColumn::StripLane(i) => cell(row, i).map(strip_lane_suffix),
    }
    .ok_or(Rejection::Location)?;

    let timestamp = match columns.time {
        TimeColumn::Absolute(i) => cell(row, i).and_then(parse_timestamp),
        TimeColumn::Offset { column, start } => cell(row, column)
            .and_then(parse_number)
            .and_then(|secs| offset_timestamp(start, secs)),
    }
    .ok_or(Rejection::Timestamp)?;

    let time_bucket = timestamp
        .duration_trunc(width)
        .map(TimeBucket)
        .map_err(|_| Rejection::Timestamp)?;

    let flow = match &columns.flow {
        FlowColumn::Total(i) => cell(row, *i).and_then(parse_number),
        FlowColumn::Summed(parts) => parts
            .iter()
            .filter_map(|i| cell(row, *i).and_then(parse_number))
            .fold(None, |acc, v| Some(acc.unwrap_or(0.0) + v)),
    }
    .ok_or(Rejection::Flow)?;
    if flow < 0.0 {
        return Err(Rejection::NegativeFlow);
    }

    let optional = |idx: Option<usize>| idx.and_then(|i| cell(row, i)).and_then(parse_number);

    Ok(FlowRecord {
        location_id,
        timestamp,
        time_bucket,
        flow,
        speed: optional(columns.speed).filter(|s| *s >= 0.0),
        occupancy: optional(columns.occupancy),
        contributions: optional(columns.contributions).filter(|c| *c >= 0.0),
        source,
    })
}

fn cell(row: &[String], idx: usize) -> Option<&str> {
    row.get(idx).map(|s| s.trim()).filter(|s| !s.is_empty())
}

/// Parses a finite number; anything else counts as missing.
fn parse_number(s: &str) -> Option<f64> {
    s.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Parses the timestamp layouts seen in gantry exports and detector dumps.
/// Offsets in RFC 3339 values are dropped, keeping the wall-clock time, so
/// both sources compare on the same local clock.
pub fn parse_timestamp(s: &str) -> Option<NaiveDateTime> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.naive_local());
    }
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
}

fn offset_timestamp(start: NaiveDateTime, seconds: f64) -> Option<NaiveDateTime> {
    let millis = (seconds * 1000.0).round();
    if !millis.is_finite() || millis.abs() > i64::MAX as f64 {
        return None;
    }
    let delta = TimeDelta::try_milliseconds(millis as i64)?;
    start.checked_add_signed(delta)
}

/// `G4201_0` → `G4201`. Ids without an underscore are returned unchanged.
pub fn strip_lane_suffix(detector_id: &str) -> String {
    match detector_id.rsplit_once('_') {
        Some((location, _lane)) => location.to_string(),
        None => detector_id.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 6, 3)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    fn cfg() -> NormalizeConfig {
        NormalizeConfig::default()
    }

    #[test]
    fn test_strip_lane_suffix() {
        assert_eq!(strip_lane_suffix("G420151001000110010_0"), "G420151001000110010");
        assert_eq!(strip_lane_suffix("A_B_2"), "A_B");
        assert_eq!(strip_lane_suffix("plain"), "plain");
    }

    #[test]
    fn test_parse_timestamp_formats() {
        let expected = at(7, 3, 0);
        assert_eq!(parse_timestamp("2025-06-03 07:03:00"), Some(expected));
        assert_eq!(parse_timestamp("2025-06-03T07:03:00"), Some(expected));
        assert_eq!(parse_timestamp("2025/06/03 07:03:00"), Some(expected));
        assert_eq!(parse_timestamp("2025-06-03 07:03"), Some(expected));
        assert_eq!(parse_timestamp("2025-06-03T07:03:00+08:00"), Some(expected));
        assert!(parse_timestamp("2025-06-03 07:03:00.250").is_some());
        assert_eq!(parse_timestamp("yesterday"), None);
    }

    #[test]
    fn test_observed_rows_bucket_to_five_minutes() {
        let table = RawTable::new(["gantry_id", "start_time", "flow", "speed"])
            .with_row(["G1", "2025-06-03 07:03:20", "12", "80.5"])
            .with_row(["G1", "2025-06-03 07:09:59", "8", ""]);

        let out = normalize(&table, &SourceSchema::observed(), &cfg()).unwrap();
        assert_eq!(out.records.len(), 2);
        assert_eq!(out.records[0].time_bucket, TimeBucket(at(7, 0, 0)));
        assert_eq!(out.records[1].time_bucket, TimeBucket(at(7, 5, 0)));
        assert_eq!(out.records[0].speed, Some(80.5));
        assert_eq!(out.records[1].speed, None);
        assert_eq!(out.records[0].source, Source::Observed);
    }

    #[test]
    fn test_headers_are_case_and_space_insensitive() {
        let table = RawTable::new([" Gantry_ID ", "START_TIME", "Flow"])
            .with_row(["G1", "2025-06-03 07:00:00", "3"]);
        let out = normalize(&table, &SourceSchema::observed(), &cfg()).unwrap();
        assert_eq!(out.records.len(), 1);
    }

    #[test]
    fn test_drops_are_counted_per_reason() {
        let table = RawTable::new(["gantry_id", "start_time", "flow"])
            .with_row(["", "2025-06-03 07:00:00", "1"])
            .with_row(["G1", "not a time", "1"])
            .with_row(["G1", "2025-06-03 07:00:00", "n/a"])
            .with_row(["G1", "2025-06-03 07:00:00", "-4"])
            .with_row(["G1", "2025-06-03 07:00:00"])
            .with_row(["G1", "2025-06-03 07:00:00", "5"]);

        let out = normalize(&table, &SourceSchema::observed(), &cfg()).unwrap();
        let r = &out.report;
        assert_eq!(r.total_rows, 6);
        assert_eq!(r.kept_rows, 1);
        assert_eq!(r.dropped_missing_location, 1);
        assert_eq!(r.dropped_missing_timestamp, 1);
        assert_eq!(r.dropped_missing_flow, 2);
        assert_eq!(r.dropped_negative_flow, 1);
        assert_eq!(r.kept_rows + r.dropped_rows(), r.total_rows);
    }

    #[test]
    fn test_missing_required_columns_is_structural_error() {
        let table = RawTable::new(["speed", "occupancy"]).with_row(["1", "2"]);
        let err = normalize(&table, &SourceSchema::observed(), &cfg()).unwrap_err();
        assert_eq!(
            err,
            EngineError::MissingColumns {
                series: Source::Observed,
                missing: vec!["location_id".into(), "timestamp".into(), "flow".into()],
            }
        );
    }

    #[test]
    fn test_empty_table_with_valid_header_is_not_an_error() {
        let table = RawTable::new(["gantry_id", "start_time", "flow"]);
        let out = normalize(&table, &SourceSchema::observed(), &cfg()).unwrap();
        assert!(out.records.is_empty());
        assert_eq!(out.report.total_rows, 0);
    }

    #[test]
    fn test_sub_flows_are_summed_when_no_total_column() {
        let table = RawTable::new(["start_gantryid", "start_time", "k1", "k2", "h1"])
            .with_row(["G1", "2025-06-03 07:00:00", "3", "2", "1"])
            .with_row(["G1", "2025-06-03 07:05:00", "4", "", "x"])
            .with_row(["G1", "2025-06-03 07:10:00", "", "", ""]);

        let out = normalize(&table, &SourceSchema::observed(), &cfg()).unwrap();
        assert_eq!(out.records.len(), 2);
        assert_eq!(out.records[0].flow, 6.0);
        assert_eq!(out.records[1].flow, 4.0);
        assert_eq!(out.report.dropped_missing_flow, 1);
    }

    #[test]
    fn test_simulated_detector_ids_and_offsets() {
        let mut cfg = cfg();
        cfg.simulation_start = Some(at(7, 0, 0));

        let table = RawTable::new(["id", "begin", "end", "entered", "speed", "occupancy", "nVehContrib"])
            .with_row(["G1_0", "0.00", "60.00", "7", "22.5", "4.1", "7"])
            .with_row(["G1_1", "60.00", "120.00", "5", "-1", "3.0", "5"]);

        let out = normalize(&table, &SourceSchema::simulated(), &cfg).unwrap();
        assert_eq!(out.records.len(), 2);
        assert_eq!(out.records[0].location_id, "G1");
        assert_eq!(out.records[0].time_bucket, TimeBucket(at(7, 0, 0)));
        assert_eq!(out.records[1].time_bucket, TimeBucket(at(7, 1, 0)));
        assert_eq!(out.records[0].contributions, Some(7.0));
        assert_eq!(out.records[0].occupancy, Some(4.1));
        // negative speed is a detector sentinel, not a value
        assert_eq!(out.records[1].speed, None);
    }

    #[test]
    fn test_offsets_without_simulation_start_is_config_error() {
        let table = RawTable::new(["id", "begin", "entered"]).with_row(["G1_0", "0", "1"]);
        let err = normalize(&table, &SourceSchema::simulated(), &cfg()).unwrap_err();
        assert!(matches!(err, EngineError::InvalidConfig(_)));
    }

    #[test]
    fn test_plain_location_column_wins_over_detector_id() {
        let table = RawTable::new(["detector_id", "gantry_id", "start_time", "flow"])
            .with_row(["G9_2", "G9", "2025-06-03 07:00:30", "1"]);
        let out = normalize(&table, &SourceSchema::simulated(), &cfg()).unwrap();
        assert_eq!(out.records[0].location_id, "G9");
        assert_eq!(out.records[0].time_bucket, TimeBucket(at(7, 0, 0)));
    }
}
