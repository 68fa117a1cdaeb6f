//! Accuracy metrics over aligned flow pairs.
//!
//! Every granularity (overall, per location, per time bucket) goes through
//! the same [`MetricsEngine::compute_pairs`]; groups only differ in which
//! pairs they feed in.
//!
//! Undefined values are `None` and come with the sample size that was
//! actually used:
//! - MAPE skips zero observations under [`ZeroPolicy::Filter`]
//! - GEH is undefined when both flows are zero and is then left out of the
//!   mean and the pass rate
//! - correlation is undefined for fewer than two pairs or a constant series

use serde::Serialize;
use std::collections::BTreeMap;

use crate::analyzers::grade::{QualityCategory, mape_category};
use crate::analyzers::types::{AlignedRecord, TimeBucket};
use crate::config::{MetricsConfig, ZeroPolicy};
use crate::stats::{mean, pearson};

/// GEH statistic for one pair of counts. NaN when `sim + obs == 0`.
pub fn geh(simulated: f64, observed: f64) -> f64 {
    let denominator = (simulated + observed) / 2.0;
    if denominator == 0.0 {
        return f64::NAN;
    }
    ((simulated - observed).powi(2) / denominator).sqrt()
}

/// Absolute percentage error of one pair, `None` when the policy excludes it.
pub fn pointwise_mape(simulated: f64, observed: f64, policy: ZeroPolicy) -> Option<f64> {
    let reference = match policy {
        ZeroPolicy::Filter if observed == 0.0 => return None,
        ZeroPolicy::Filter => observed,
        ZeroPolicy::Epsilon { epsilon } if observed == 0.0 => epsilon,
        ZeroPolicy::Epsilon { .. } => observed,
    };
    Some(((simulated - observed) / reference).abs() * 100.0)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricSet {
    pub sample_size: usize,
    pub mae: Option<f64>,
    pub mse: Option<f64>,
    pub rmse: Option<f64>,
    pub mape: Option<f64>,
    pub mape_sample_size: usize,
    pub correlation: Option<f64>,
    pub geh_mean: Option<f64>,
    pub geh_sample_size: usize,
    pub geh_pass_rate: Option<f64>,
}

impl MetricSet {
    pub fn empty() -> Self {
        Self {
            sample_size: 0,
            mae: None,
            mse: None,
            rmse: None,
            mape: None,
            mape_sample_size: 0,
            correlation: None,
            geh_mean: None,
            geh_sample_size: 0,
            geh_pass_rate: None,
        }
    }
}

/// Metrics for one location or one time bucket.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupMetrics {
    #[serde(flatten)]
    pub metrics: MetricSet,
    pub total_observed_flow: f64,
    pub total_simulated_flow: f64,
    /// Simulated over observed totals, `None` when nothing was observed.
    pub flow_ratio: Option<f64>,
    pub category: QualityCategory,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocationMetrics {
    pub location_id: String,
    #[serde(flatten)]
    pub group: GroupMetrics,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimeBucketMetrics {
    pub time_bucket: TimeBucket,
    #[serde(flatten)]
    pub group: GroupMetrics,
}

/// Error metrics for the speed channel, over pairs where both speeds exist.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpeedMetrics {
    pub sample_size: usize,
    pub mae: Option<f64>,
    pub rmse: Option<f64>,
    pub correlation: Option<f64>,
}

/// A (simulated, observed) flow pair.
type Pair = (f64, f64);

fn flow_pair(r: &AlignedRecord) -> Pair {
    (r.simulated_flow, r.observed_flow)
}

#[derive(Debug, Clone)]
pub struct MetricsEngine {
    cfg: MetricsConfig,
}

impl MetricsEngine {
    pub fn new(cfg: &MetricsConfig) -> Self {
        Self { cfg: cfg.clone() }
    }

    /// Overall metrics over every aligned record.
    pub fn compute(&self, records: &[AlignedRecord]) -> MetricSet {
        let pairs: Vec<Pair> = records.iter().map(flow_pair).collect();
        self.compute_pairs(&pairs)
    }

    pub fn compute_pairs(&self, pairs: &[Pair]) -> MetricSet {
        if pairs.is_empty() {
            return MetricSet::empty();
        }

        let abs_errors: Vec<f64> = pairs.iter().map(|(s, o)| (s - o).abs()).collect();
        let sq_errors: Vec<f64> = pairs.iter().map(|(s, o)| (s - o).powi(2)).collect();
        let mse = mean(&sq_errors);

        let ape: Vec<f64> = pairs
            .iter()
            .filter_map(|&(s, o)| pointwise_mape(s, o, self.cfg.zero_policy))
            .collect();

        let gehs: Vec<f64> = pairs
            .iter()
            .map(|&(s, o)| geh(s, o))
            .filter(|g| !g.is_nan())
            .collect();
        let geh_pass_rate = (!gehs.is_empty()).then(|| {
            let passed = gehs.iter().filter(|g| **g <= self.cfg.geh_threshold).count();
            passed as f64 / gehs.len() as f64 * 100.0
        });

        let sims: Vec<f64> = pairs.iter().map(|(s, _)| *s).collect();
        let obss: Vec<f64> = pairs.iter().map(|(_, o)| *o).collect();

        MetricSet {
            sample_size: pairs.len(),
            mae: mean(&abs_errors),
            mse,
            rmse: mse.map(f64::sqrt),
            mape: mean(&ape),
            mape_sample_size: ape.len(),
            correlation: pearson(&sims, &obss),
            geh_mean: mean(&gehs),
            geh_sample_size: gehs.len(),
            geh_pass_rate,
        }
    }

    fn group(&self, pairs: &[Pair]) -> GroupMetrics {
        let metrics = self.compute_pairs(pairs);
        let total_simulated_flow: f64 = pairs.iter().map(|(s, _)| s).sum();
        let total_observed_flow: f64 = pairs.iter().map(|(_, o)| o).sum();
        let flow_ratio =
            (total_observed_flow > 0.0).then(|| total_simulated_flow / total_observed_flow);
        let category = mape_category(metrics.mape);

        GroupMetrics {
            metrics,
            total_observed_flow,
            total_simulated_flow,
            flow_ratio,
            category,
        }
    }

    /// One entry per location, sorted by location id.
    pub fn per_location(&self, records: &[AlignedRecord]) -> Vec<LocationMetrics> {
        let mut groups: BTreeMap<&str, Vec<Pair>> = BTreeMap::new();
        for r in records {
            groups
                .entry(r.location_id.as_str())
                .or_default()
                .push(flow_pair(r));
        }
        groups
            .into_iter()
            .map(|(location_id, pairs)| LocationMetrics {
                location_id: location_id.to_string(),
                group: self.group(&pairs),
            })
            .collect()
    }

    /// One entry per time bucket, in time order.
    pub fn per_time_bucket(&self, records: &[AlignedRecord]) -> Vec<TimeBucketMetrics> {
        let mut groups: BTreeMap<TimeBucket, Vec<Pair>> = BTreeMap::new();
        for r in records {
            groups.entry(r.time_bucket).or_default().push(flow_pair(r));
        }
        groups
            .into_iter()
            .map(|(time_bucket, pairs)| TimeBucketMetrics {
                time_bucket,
                group: self.group(&pairs),
            })
            .collect()
    }

    pub fn speed_metrics(&self, records: &[AlignedRecord]) -> SpeedMetrics {
        let pairs: Vec<Pair> = records
            .iter()
            .filter_map(|r| Some((r.simulated_speed?, r.observed_speed?)))
            .collect();

        let abs_errors: Vec<f64> = pairs.iter().map(|(s, o)| (s - o).abs()).collect();
        let sq_errors: Vec<f64> = pairs.iter().map(|(s, o)| (s - o).powi(2)).collect();
        let sims: Vec<f64> = pairs.iter().map(|(s, _)| *s).collect();
        let obss: Vec<f64> = pairs.iter().map(|(_, o)| *o).collect();

        SpeedMetrics {
            sample_size: pairs.len(),
            mae: mean(&abs_errors),
            rmse: mean(&sq_errors).map(f64::sqrt),
            correlation: pearson(&sims, &obss),
        }
    }
}
