use crate::analyzers::types::{AggregatedRecord, FlowRecord, Source, TimeBucket};
use crate::error::{EngineError, EngineResult};
use chrono::{DurationRound, TimeDelta};
use std::collections::BTreeMap;
use tracing::debug;

/// Running sums for one (location, bucket) group.
#[derive(Default)]
struct Accumulator {
    flow: f64,
    record_count: usize,

    speed_sum: f64,
    speed_count: usize,
    weighted_speed_sum: f64,
    weight_sum: f64,

    occupancy_sum: f64,
    occupancy_count: usize,

    contributions: f64,
}

impl Accumulator {
    fn push(&mut self, r: &FlowRecord) {
        self.flow += r.flow;
        self.record_count += 1;

        if let Some(w) = r.contributions {
            self.contributions += w;
        }

        if let Some(speed) = r.speed {
            self.speed_sum += speed;
            self.speed_count += 1;
            if let Some(w) = r.contributions {
                self.weighted_speed_sum += speed * w;
                self.weight_sum += w;
            }
        }

        if let Some(occ) = r.occupancy {
            self.occupancy_sum += occ;
            self.occupancy_count += 1;
        }
    }

    /// Contribution-weighted mean speed, falling back to the plain mean when
    /// no row carried a usable weight.
    fn speed(&self) -> Option<f64> {
        if self.weight_sum > 0.0 {
            Some(self.weighted_speed_sum / self.weight_sum)
        } else if self.speed_count > 0 {
            Some(self.speed_sum / self.speed_count as f64)
        } else {
            None
        }
    }

    fn occupancy(&self) -> Option<f64> {
        (self.occupancy_count > 0).then(|| self.occupancy_sum / self.occupancy_count as f64)
    }
}

/// Collapses lane- and class-level rows into one [`AggregatedRecord`] per
/// (location, bucket).
///
/// Flows are summed, speed is the contribution-weighted mean and occupancy
/// the plain mean. Output is sorted by key, so the result does not depend on
/// input order.
pub fn aggregate_series(source: Source, records: &[FlowRecord]) -> EngineResult<Vec<AggregatedRecord>> {
    let mut groups: BTreeMap<(&str, TimeBucket), Accumulator> = BTreeMap::new();

    for r in records {
        if r.source != source {
            return Err(EngineError::MixedSources {
                expected: source,
                found: r.source,
            });
        }
        groups
            .entry((r.location_id.as_str(), r.time_bucket))
            .or_default()
            .push(r);
    }

    debug!(%source, input = records.len(), groups = groups.len(), "Aggregated series");

    Ok(groups
        .into_iter()
        .map(|((location_id, time_bucket), acc)| AggregatedRecord {
            location_id: location_id.to_string(),
            time_bucket,
            flow: acc.flow,
            speed: acc.speed(),
            occupancy: acc.occupancy(),
            contributions: acc.contributions,
            record_count: acc.record_count,
            source,
        })
        .collect())
}

/// Re-floors every record onto the comparison grid of `width`.
///
/// Buckets are recomputed from the raw timestamp, so a series normalized at a
/// finer width rolls up into the coarser buckets of the other series.
pub fn rebucket(records: &mut [FlowRecord], width: TimeDelta) -> EngineResult<()> {
    for r in records.iter_mut() {
        let floored = r.timestamp.duration_trunc(width).map_err(|e| {
            EngineError::InvalidConfig(format!("cannot floor {} to a {width} bucket: {e}", r.timestamp))
        })?;
        r.time_bucket = TimeBucket(floored);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, NaiveDateTime};

    fn at(m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 6, 3)
            .unwrap()
            .and_hms_opt(7, m, 0)
            .unwrap()
    }

    fn rec(loc: &str, m: u32, flow: f64, speed: Option<f64>, weight: Option<f64>) -> FlowRecord {
        FlowRecord {
            location_id: loc.to_string(),
            timestamp: at(m),
            time_bucket: TimeBucket(at(m)),
            flow,
            speed,
            occupancy: None,
            contributions: weight,
            source: Source::Simulated,
        }
    }

    #[test]
    fn test_empty_input() {
        assert!(aggregate_series(Source::Simulated, &[]).unwrap().is_empty());
    }

    #[test]
    fn test_flows_are_summed_per_key() {
        let input = vec![
            rec("A", 0, 3.0, None, None),
            rec("A", 0, 4.0, None, None),
            rec("A", 1, 1.0, None, None),
            rec("B", 0, 2.0, None, None),
        ];
        let out = aggregate_series(Source::Simulated, &input).unwrap();
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].location_id, "A");
        assert_eq!(out[0].flow, 7.0);
        assert_eq!(out[0].record_count, 2);
        assert_eq!(out[1].flow, 1.0);
        assert_eq!(out[2].location_id, "B");
    }

    #[test]
    fn test_speed_weighted_by_contributions() {
        let input = vec![
            rec("A", 0, 3.0, Some(60.0), Some(3.0)),
            rec("A", 0, 1.0, Some(100.0), Some(1.0)),
        ];
        let out = aggregate_series(Source::Simulated, &input).unwrap();
        assert_eq!(out[0].speed, Some(70.0));
        assert_eq!(out[0].contributions, 4.0);
    }

    #[test]
    fn test_speed_falls_back_to_plain_mean() {
        let zero_weights = vec![
            rec("A", 0, 0.0, Some(60.0), Some(0.0)),
            rec("A", 0, 0.0, Some(100.0), Some(0.0)),
        ];
        let out = aggregate_series(Source::Simulated, &zero_weights).unwrap();
        assert_eq!(out[0].speed, Some(80.0));

        let no_weights = vec![rec("A", 0, 1.0, Some(50.0), None), rec("A", 0, 1.0, None, None)];
        let out = aggregate_series(Source::Simulated, &no_weights).unwrap();
        assert_eq!(out[0].speed, Some(50.0));
    }

    #[test]
    fn test_no_speed_anywhere() {
        let out = aggregate_series(Source::Simulated, &[rec("A", 0, 1.0, None, None)]).unwrap();
        assert_eq!(out[0].speed, None);
        assert_eq!(out[0].occupancy, None);
    }

    #[test]
    fn test_occupancy_is_mean() {
        let mut a = rec("A", 0, 1.0, None, None);
        a.occupancy = Some(2.0);
        let mut b = rec("A", 0, 1.0, None, None);
        b.occupancy = Some(4.0);
        let out = aggregate_series(Source::Simulated, &[a, b]).unwrap();
        assert_eq!(out[0].occupancy, Some(3.0));
    }

    #[test]
    fn test_order_independent() {
        let input = vec![
            rec("B", 1, 2.0, Some(40.0), Some(2.0)),
            rec("A", 0, 3.0, Some(60.0), Some(3.0)),
            rec("A", 0, 1.0, Some(100.0), Some(1.0)),
        ];
        let mut reversed = input.clone();
        reversed.reverse();
        assert_eq!(
            aggregate_series(Source::Simulated, &input).unwrap(),
            aggregate_series(Source::Simulated, &reversed).unwrap()
        );
    }

    #[test]
    fn test_rebucket_rolls_minutes_into_coarser_buckets() {
        let mut input: Vec<FlowRecord> = (0..7).map(|m| rec("A", m, 20.0, None, None)).collect();
        rebucket(&mut input, TimeDelta::minutes(5)).unwrap();
        assert_eq!(input[4].time_bucket, TimeBucket(at(0)));
        assert_eq!(input[5].time_bucket, TimeBucket(at(5)));

        let out = aggregate_series(Source::Simulated, &input).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].flow, 100.0);
        assert_eq!(out[0].record_count, 5);
        assert_eq!(out[1].flow, 40.0);
    }

    #[test]
    fn test_mixed_sources_rejected() {
        let mut obs = rec("A", 0, 1.0, None, None);
        obs.source = Source::Observed;
        let err = aggregate_series(Source::Simulated, &[obs]).unwrap_err();
        assert_eq!(
            err,
            EngineError::MixedSources {
                expected: Source::Simulated,
                found: Source::Observed
            }
        );
    }
}
