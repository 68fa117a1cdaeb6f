//! Inner join of the observed and simulated series on (location, bucket).

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{info, warn};

use crate::analyzers::types::{AggregatedRecord, AlignedRecord, Source, TimeBucket, TimeRange};
use crate::error::{EngineError, EngineResult};

/// Outcome of the time-range intersection step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeAlignment {
    /// No common location ids, so time ranges were never compared.
    NotAttempted,
    Success,
    /// The two series cover disjoint time ranges.
    Failed,
}

/// Coverage diagnostics for one alignment call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlignmentReport {
    pub total_observed_ids: usize,
    pub total_simulated_ids: usize,
    pub matched_ids: usize,
    /// Matched ids as a percentage of observed ids.
    pub match_rate: f64,
    pub time_alignment: TimeAlignment,
    pub time_range_observed: Option<TimeRange>,
    pub time_range_simulated: Option<TimeRange>,
    pub overlap_time_range: Option<TimeRange>,
    pub final_aligned_records: usize,
    pub final_aligned_locations: usize,
    pub final_time_points: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Alignment {
    pub records: Vec<AlignedRecord>,
    pub report: AlignmentReport,
}

/// Indexes one source by key, rejecting duplicate keys and foreign records.
fn index_series(
    source: Source,
    records: &[AggregatedRecord],
) -> EngineResult<BTreeMap<(&str, TimeBucket), &AggregatedRecord>> {
    let mut index = BTreeMap::new();
    for r in records {
        if r.source != source {
            return Err(EngineError::MixedSources {
                expected: source,
                found: r.source,
            });
        }
        if index
            .insert((r.location_id.as_str(), r.time_bucket), r)
            .is_some()
        {
            return Err(EngineError::DuplicateKey {
                series: source,
                location_id: r.location_id.clone(),
                time_bucket: r.time_bucket,
            });
        }
    }
    Ok(index)
}

fn id_set<'a>(index: &BTreeMap<(&'a str, TimeBucket), &AggregatedRecord>) -> BTreeSet<&'a str> {
    index.keys().map(|(id, _)| *id).collect()
}

/// Bucket range of `index` restricted to `ids`.
fn span_of(
    index: &BTreeMap<(&str, TimeBucket), &AggregatedRecord>,
    ids: &BTreeSet<&str>,
) -> Option<TimeRange> {
    TimeRange::spanning(
        index
            .keys()
            .filter(|(id, _)| ids.contains(*id))
            .map(|(_, t)| *t),
    )
}

/// Aligns the two aggregated series.
///
/// Data gaps (no shared ids, disjoint time ranges) produce an empty record
/// list with the report explaining why. Duplicate keys within one source are
/// the only failure besides mis-tagged records.
#[tracing::instrument(skip_all, fields(observed = observed.len(), simulated = simulated.len()))]
pub fn align(observed: &[AggregatedRecord], simulated: &[AggregatedRecord]) -> EngineResult<Alignment> {
    let obs_index = index_series(Source::Observed, observed)?;
    let sim_index = index_series(Source::Simulated, simulated)?;

    let obs_ids = id_set(&obs_index);
    let sim_ids = id_set(&sim_index);
    let common: BTreeSet<&str> = obs_ids.intersection(&sim_ids).copied().collect();

    let match_rate = if obs_ids.is_empty() {
        0.0
    } else {
        common.len() as f64 / obs_ids.len() as f64 * 100.0
    };

    let mut report = AlignmentReport {
        total_observed_ids: obs_ids.len(),
        total_simulated_ids: sim_ids.len(),
        matched_ids: common.len(),
        match_rate,
        time_alignment: TimeAlignment::NotAttempted,
        time_range_observed: None,
        time_range_simulated: None,
        overlap_time_range: None,
        final_aligned_records: 0,
        final_aligned_locations: 0,
        final_time_points: 0,
    };

    if common.is_empty() {
        report.time_range_observed = TimeRange::spanning(obs_index.keys().map(|(_, t)| *t));
        report.time_range_simulated = TimeRange::spanning(sim_index.keys().map(|(_, t)| *t));
        warn!(
            observed_ids = report.total_observed_ids,
            simulated_ids = report.total_simulated_ids,
            "No location ids shared between sources"
        );
        return Ok(Alignment {
            records: Vec::new(),
            report,
        });
    }

    report.time_range_observed = span_of(&obs_index, &common);
    report.time_range_simulated = span_of(&sim_index, &common);

    let overlap = match (&report.time_range_observed, &report.time_range_simulated) {
        (Some(o), Some(s)) => o.overlap(s),
        _ => None,
    };
    let Some(overlap) = overlap else {
        report.time_alignment = TimeAlignment::Failed;
        warn!(
            observed = ?report.time_range_observed,
            simulated = ?report.time_range_simulated,
            "Observed and simulated time ranges do not overlap"
        );
        return Ok(Alignment {
            records: Vec::new(),
            report,
        });
    };
    report.time_alignment = TimeAlignment::Success;
    report.overlap_time_range = Some(overlap);

    let records: Vec<AlignedRecord> = obs_index
        .iter()
        .filter(|((id, _), _)| common.contains(*id))
        .filter_map(|(key, obs)| {
            sim_index.get(key).map(|sim| AlignedRecord {
                location_id: obs.location_id.clone(),
                time_bucket: obs.time_bucket,
                observed_flow: obs.flow,
                simulated_flow: sim.flow,
                observed_speed: obs.speed,
                simulated_speed: sim.speed,
                simulated_occupancy: sim.occupancy,
            })
        })
        .collect();

    let locations: BTreeSet<&str> = records.iter().map(|r| r.location_id.as_str()).collect();
    let buckets: BTreeSet<TimeBucket> = records.iter().map(|r| r.time_bucket).collect();
    report.final_aligned_records = records.len();
    report.final_aligned_locations = locations.len();
    report.final_time_points = buckets.len();

    info!(
        records = report.final_aligned_records,
        locations = report.final_aligned_locations,
        time_points = report.final_time_points,
        match_rate = report.match_rate,
        "Alignment complete"
    );

    Ok(Alignment { records, report })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn bucket(m: u32) -> TimeBucket {
        TimeBucket(
            NaiveDate::from_ymd_opt(2025, 6, 3)
                .unwrap()
                .and_hms_opt(7, m, 0)
                .unwrap(),
        )
    }

    fn obs(loc: &str, m: u32, flow: f64) -> AggregatedRecord {
        AggregatedRecord::new(loc, bucket(m), flow, Source::Observed)
    }

    fn sim(loc: &str, m: u32, flow: f64) -> AggregatedRecord {
        AggregatedRecord::new(loc, bucket(m), flow, Source::Simulated)
    }

    #[test]
    fn test_single_match() {
        let out = align(&[obs("A", 0, 100.0)], &[sim("A", 0, 110.0).with_speed(70.0)]).unwrap();
        assert_eq!(out.records.len(), 1);
        let r = &out.records[0];
        assert_eq!(r.observed_flow, 100.0);
        assert_eq!(r.simulated_flow, 110.0);
        assert_eq!(r.simulated_speed, Some(70.0));
        assert_eq!(r.observed_speed, None);
        assert_eq!(out.report.time_alignment, TimeAlignment::Success);
        assert_eq!(out.report.match_rate, 100.0);
        assert_eq!(out.report.final_aligned_records, 1);
    }

    #[test]
    fn test_no_shared_ids() {
        let out = align(&[obs("A", 0, 1.0)], &[sim("B", 0, 1.0)]).unwrap();
        assert!(out.records.is_empty());
        let r = &out.report;
        assert_eq!(r.matched_ids, 0);
        assert_eq!(r.match_rate, 0.0);
        assert_eq!(r.total_observed_ids, 1);
        assert_eq!(r.total_simulated_ids, 1);
        assert_eq!(r.time_alignment, TimeAlignment::NotAttempted);
        assert!(r.time_range_observed.is_some());
        assert!(r.overlap_time_range.is_none());
        assert_eq!(r.final_aligned_records, 0);
    }

    #[test]
    fn test_disjoint_time_ranges() {
        let out = align(
            &[obs("A", 0, 1.0), obs("A", 5, 1.0)],
            &[sim("A", 10, 1.0), sim("A", 11, 1.0)],
        )
        .unwrap();
        assert!(out.records.is_empty());
        assert_eq!(out.report.time_alignment, TimeAlignment::Failed);
        assert_eq!(out.report.time_range_observed.unwrap().end, bucket(5));
        assert_eq!(out.report.time_range_simulated.unwrap().start, bucket(10));
        assert_eq!(out.report.overlap_time_range, None);
    }

    #[test]
    fn test_time_ranges_use_common_ids_only() {
        let out = align(
            &[obs("A", 5, 1.0), obs("Z", 0, 1.0)],
            &[sim("A", 5, 1.0), sim("Y", 20, 1.0)],
        )
        .unwrap();
        let r = &out.report;
        assert_eq!(r.time_range_observed.unwrap().start, bucket(5));
        assert_eq!(r.time_range_simulated.unwrap().end, bucket(5));
        assert_eq!(r.match_rate, 50.0);
    }

    #[test]
    fn test_partial_overlap_counts() {
        let out = align(
            &[obs("A", 0, 1.0), obs("A", 1, 2.0), obs("B", 0, 3.0), obs("C", 0, 4.0)],
            &[sim("A", 1, 2.5), sim("B", 0, 3.5), sim("B", 2, 9.0)],
        )
        .unwrap();
        let r = &out.report;
        assert_eq!(r.total_observed_ids, 3);
        assert_eq!(r.total_simulated_ids, 2);
        assert_eq!(r.matched_ids, 2);
        assert!((r.match_rate - 200.0 / 3.0).abs() < 1e-9);
        assert_eq!(r.final_aligned_records, 2);
        assert_eq!(r.final_aligned_locations, 2);
        assert_eq!(r.final_time_points, 2);
        assert_eq!(out.records[0].location_id, "A");
        assert_eq!(out.records[1].location_id, "B");
    }

    #[test]
    fn test_duplicate_key_fails_loudly() {
        let err = align(&[obs("A", 0, 1.0), obs("A", 0, 2.0)], &[sim("A", 0, 1.0)]).unwrap_err();
        assert_eq!(
            err,
            EngineError::DuplicateKey {
                series: Source::Observed,
                location_id: "A".into(),
                time_bucket: bucket(0),
            }
        );

        let err = align(&[obs("A", 0, 1.0)], &[sim("A", 0, 1.0), sim("A", 0, 1.0)]).unwrap_err();
        assert!(matches!(
            err,
            EngineError::DuplicateKey {
                series: Source::Simulated,
                ..
            }
        ));
    }

    #[test]
    fn test_wrong_source_tag_rejected() {
        let err = align(&[sim("A", 0, 1.0)], &[sim("A", 0, 1.0)]).unwrap_err();
        assert!(matches!(err, EngineError::MixedSources { .. }));
    }

    #[test]
    fn test_idempotent() {
        let o = vec![obs("A", 0, 1.0), obs("B", 1, 2.0), obs("A", 1, 3.0)];
        let s = vec![sim("B", 1, 2.2), sim("A", 0, 0.9), sim("A", 1, 3.1)];
        assert_eq!(align(&o, &s).unwrap(), align(&o, &s).unwrap());
    }

    #[test]
    fn test_empty_inputs() {
        let out = align(&[], &[]).unwrap();
        assert!(out.records.is_empty());
        assert_eq!(out.report.match_rate, 0.0);
        assert_eq!(out.report.time_range_observed, None);
    }
}
