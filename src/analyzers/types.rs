//! Data types used by the reconciliation pipeline.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which side of the comparison a record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    /// Gantry counts, treated as ground truth.
    Observed,
    /// Simulated E1 detector output, the value under validation.
    Simulated,
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Observed => f.write_str("observed"),
            Source::Simulated => f.write_str("simulated"),
        }
    }
}

/// Start of a fixed-width time bucket. Always already floored to the bucket width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TimeBucket(pub NaiveDateTime);

impl fmt::Display for TimeBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d %H:%M:%S"))
    }
}

/// Inclusive range of buckets covered by a series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: TimeBucket,
    pub end: TimeBucket,
}

impl TimeRange {
    /// Range spanned by `buckets`, or `None` when the iterator is empty.
    pub fn spanning(buckets: impl IntoIterator<Item = TimeBucket>) -> Option<Self> {
        buckets.into_iter().fold(None, |acc, b| match acc {
            None => Some(TimeRange { start: b, end: b }),
            Some(r) => Some(TimeRange {
                start: r.start.min(b),
                end: r.end.max(b),
            }),
        })
    }

    /// Intersection of two ranges, `None` when they are disjoint.
    pub fn overlap(&self, other: &TimeRange) -> Option<TimeRange> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        (start <= end).then_some(TimeRange { start, end })
    }
}

/// One canonical row produced by the normalizer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlowRecord {
    pub location_id: String,
    pub timestamp: NaiveDateTime,
    pub time_bucket: TimeBucket,
    pub flow: f64,
    pub speed: Option<f64>,
    pub occupancy: Option<f64>,
    /// Vehicle contribution count, used as the speed weight.
    pub contributions: Option<f64>,
    pub source: Source,
}

/// One value per (location, bucket) for a single source.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregatedRecord {
    pub location_id: String,
    pub time_bucket: TimeBucket,
    pub flow: f64,
    pub speed: Option<f64>,
    pub occupancy: Option<f64>,
    pub contributions: f64,
    pub record_count: usize,
    pub source: Source,
}

#[cfg(test)]
impl AggregatedRecord {
    /// Minimal record with only a flow value.
    pub fn new(
        location_id: impl Into<String>,
        time_bucket: TimeBucket,
        flow: f64,
        source: Source,
    ) -> Self {
        Self {
            location_id: location_id.into(),
            time_bucket,
            flow,
            speed: None,
            occupancy: None,
            contributions: 0.0,
            record_count: 1,
            source,
        }
    }

    pub fn with_speed(mut self, speed: f64) -> Self {
        self.speed = Some(speed);
        self
    }
}

/// A matched (location, bucket) pair present in both sources.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlignedRecord {
    pub location_id: String,
    pub time_bucket: TimeBucket,
    pub observed_flow: f64,
    pub simulated_flow: f64,
    pub observed_speed: Option<f64>,
    pub simulated_speed: Option<f64>,
    pub simulated_occupancy: Option<f64>,
}
