//! Structural errors raised by the accuracy engine.
//!
//! Row-level problems never surface here: they are dropped and counted by the
//! normalizer. Everything in [`EngineError`] means the inputs or the
//! configuration are unusable as a whole.

use thiserror::Error;

use crate::analyzers::types::{Source, TimeBucket};

#[derive(Debug, Error, PartialEq)]
pub enum EngineError {
    /// A required canonical field has no matching column in the table header.
    #[error("{series} table is missing required columns: {}", .missing.join(", "))]
    MissingColumns { series: Source, missing: Vec<String> },

    /// Two aggregated records share a (location, bucket) key within one source.
    #[error("duplicate aggregation key in {series} series: location {location_id} at {time_bucket}")]
    DuplicateKey {
        series: Source,
        location_id: String,
        time_bucket: TimeBucket,
    },

    /// A record tagged with one source was passed where the other was expected.
    #[error("expected only {expected} records, found a {found} record")]
    MixedSources { expected: Source, found: Source },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type EngineResult<T> = Result<T, EngineError>;
