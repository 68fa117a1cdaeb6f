//! Observed-versus-simulated flow comparison.
//!
//! This module normalizes both raw tables, aggregates lane rows per location
//! and bucket, aligns the two series, computes accuracy metrics at several
//! granularities, classifies every aligned sample and assembles the summary.

pub mod aggregate;
pub mod align;
pub mod analyzer;
pub mod grade;
pub mod metrics;
pub mod normalize;
pub mod quality;
pub mod summary;
pub mod types;
