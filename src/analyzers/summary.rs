//! Final assembly of one analysis run.
//!
//! [`AccuracySummaryBuilder`] only collects already-computed parts and counts
//! tags and categories. It never recomputes a metric.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::analyzers::align::AlignmentReport;
use crate::analyzers::grade::QualityCategory;
use crate::analyzers::metrics::{LocationMetrics, MetricSet, SpeedMetrics, TimeBucketMetrics};
use crate::analyzers::normalize::NormalizeReport;
use crate::analyzers::quality::{AnomalyTag, ClassifiedRecord};
use crate::analyzers::types::{AlignedRecord, Source};
use crate::config::EngineConfig;
use crate::stats::{Distribution, pearson, spearman};

/// Bumped whenever the serialized summary layout changes.
pub const SCHEMA_VERSION: u32 = 2;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AnomalyCounts {
    pub high_mape: usize,
    pub high_geh: usize,
    pub zero_reference: usize,
    pub extreme_ratio: usize,
    /// Records carrying at least one tag.
    pub anomalous_records: usize,
}

impl AnomalyCounts {
    fn add(&mut self, tag: AnomalyTag) {
        match tag {
            AnomalyTag::HighMape => self.high_mape += 1,
            AnomalyTag::HighGeh => self.high_geh += 1,
            AnomalyTag::ZeroReference => self.zero_reference += 1,
            AnomalyTag::ExtremeRatio => self.extreme_ratio += 1,
        }
    }

    pub fn get(&self, tag: AnomalyTag) -> usize {
        match tag {
            AnomalyTag::HighMape => self.high_mape,
            AnomalyTag::HighGeh => self.high_geh,
            AnomalyTag::ZeroReference => self.zero_reference,
            AnomalyTag::ExtremeRatio => self.extreme_ratio,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CategoryCounts {
    pub excellent: usize,
    pub good: usize,
    pub fair: usize,
    pub poor: usize,
    pub undefined: usize,
}

impl CategoryCounts {
    fn add(&mut self, category: QualityCategory) {
        match category {
            QualityCategory::Excellent => self.excellent += 1,
            QualityCategory::Good => self.good += 1,
            QualityCategory::Fair => self.fair += 1,
            QualityCategory::Poor => self.poor += 1,
            QualityCategory::Undefined => self.undefined += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.excellent + self.good + self.fair + self.poor + self.undefined
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FlowStatistics {
    pub observed: Distribution,
    pub simulated: Distribution,
    pub pearson: Option<f64>,
    pub spearman: Option<f64>,
}

impl FlowStatistics {
    pub fn from_aligned(records: &[AlignedRecord]) -> Self {
        let obs: Vec<f64> = records.iter().map(|r| r.observed_flow).collect();
        let sim: Vec<f64> = records.iter().map(|r| r.simulated_flow).collect();
        FlowStatistics {
            observed: Distribution::from_values(&obs),
            simulated: Distribution::from_values(&sim),
            pearson: pearson(&sim, &obs),
            spearman: spearman(&sim, &obs),
        }
    }
}

/// Spread of the pointwise accuracy values. Undefined values are left out,
/// so each count can be smaller than the number of classified records.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AccuracyDistribution {
    pub mape: Distribution,
    pub geh: Distribution,
}

impl AccuracyDistribution {
    pub fn from_classified(records: &[ClassifiedRecord]) -> Self {
        let mape: Vec<f64> = records.iter().filter_map(|r| r.mape).collect();
        let geh: Vec<f64> = records.iter().filter_map(|r| r.geh).collect();
        AccuracyDistribution {
            mape: Distribution::from_values(&mape),
            geh: Distribution::from_values(&geh),
        }
    }
}

/// Everything one run produced, ready to serialize.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccuracySummary {
    pub schema_version: u32,
    pub generated_at: DateTime<Utc>,
    pub config: EngineConfig,
    pub observed_normalization: Option<NormalizeReport>,
    pub simulated_normalization: Option<NormalizeReport>,
    pub alignment: AlignmentReport,
    pub overall: MetricSet,
    pub speed: Option<SpeedMetrics>,
    pub statistics: FlowStatistics,
    pub accuracy_distribution: AccuracyDistribution,
    pub per_location: Vec<LocationMetrics>,
    pub per_time_bucket: Vec<TimeBucketMetrics>,
    pub anomaly_counts: AnomalyCounts,
    pub category_counts: CategoryCounts,
    pub classified_records: usize,
}

pub struct AccuracySummaryBuilder {
    config: EngineConfig,
    alignment: AlignmentReport,
    overall: MetricSet,
    observed_normalization: Option<NormalizeReport>,
    simulated_normalization: Option<NormalizeReport>,
    speed: Option<SpeedMetrics>,
    statistics: FlowStatistics,
    accuracy_distribution: AccuracyDistribution,
    per_location: Vec<LocationMetrics>,
    per_time_bucket: Vec<TimeBucketMetrics>,
    anomaly_counts: AnomalyCounts,
    category_counts: CategoryCounts,
    classified_records: usize,
    generated_at: Option<DateTime<Utc>>,
}

impl AccuracySummaryBuilder {
    pub fn new(config: &EngineConfig, alignment: AlignmentReport, overall: MetricSet) -> Self {
        Self {
            config: config.clone(),
            alignment,
            overall,
            observed_normalization: None,
            simulated_normalization: None,
            speed: None,
            statistics: FlowStatistics::default(),
            accuracy_distribution: AccuracyDistribution::default(),
            per_location: Vec::new(),
            per_time_bucket: Vec::new(),
            anomaly_counts: AnomalyCounts::default(),
            category_counts: CategoryCounts::default(),
            classified_records: 0,
            generated_at: None,
        }
    }

    pub fn normalization(mut self, report: NormalizeReport) -> Self {
        match report.source {
            Source::Observed => self.observed_normalization = Some(report),
            Source::Simulated => self.simulated_normalization = Some(report),
        }
        self
    }

    pub fn speed(mut self, speed: SpeedMetrics) -> Self {
        self.speed = Some(speed);
        self
    }

    pub fn statistics(mut self, statistics: FlowStatistics) -> Self {
        self.statistics = statistics;
        self
    }

    pub fn per_location(mut self, groups: Vec<LocationMetrics>) -> Self {
        self.per_location = groups;
        self
    }

    pub fn per_time_bucket(mut self, groups: Vec<TimeBucketMetrics>) -> Self {
        self.per_time_bucket = groups;
        self
    }

    /// Tallies tags and categories and takes the spread of the pointwise
    /// MAPE and GEH values. Replaces any earlier tally.
    pub fn classifications(mut self, records: &[ClassifiedRecord]) -> Self {
        let mut anomalies = AnomalyCounts::default();
        let mut categories = CategoryCounts::default();
        for r in records {
            let c = &r.classification;
            categories.add(c.category);
            for tag in &c.tags {
                anomalies.add(*tag);
            }
            if c.is_anomalous() {
                anomalies.anomalous_records += 1;
            }
        }
        self.accuracy_distribution = AccuracyDistribution::from_classified(records);
        self.anomaly_counts = anomalies;
        self.category_counts = categories;
        self.classified_records = records.len();
        self
    }

    /// Pins the timestamp instead of using the current time.
    pub fn generated_at(mut self, at: DateTime<Utc>) -> Self {
        self.generated_at = Some(at);
        self
    }

    pub fn build(self) -> AccuracySummary {
        AccuracySummary {
            schema_version: SCHEMA_VERSION,
            generated_at: self.generated_at.unwrap_or_else(Utc::now),
            config: self.config,
            observed_normalization: self.observed_normalization,
            simulated_normalization: self.simulated_normalization,
            alignment: self.alignment,
            overall: self.overall,
            speed: self.speed,
            statistics: self.statistics,
            accuracy_distribution: self.accuracy_distribution,
            per_location: self.per_location,
            per_time_bucket: self.per_time_bucket,
            anomaly_counts: self.anomaly_counts,
            category_counts: self.category_counts,
            classified_records: self.classified_records,
        }
    }
}
