use serde::Serialize;
use std::fmt;

use crate::analyzers::grade::{QualityCategory, mape_category};
use crate::analyzers::metrics::{geh, pointwise_mape};
use crate::analyzers::types::AlignedRecord;
use crate::config::{MetricsConfig, QualityConfig};

/// Reason an aligned sample is considered unreliable. Tags are independent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnomalyTag {
    HighMape,
    HighGeh,
    ZeroReference,
    ExtremeRatio,
}

impl AnomalyTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnomalyTag::HighMape => "HIGH_MAPE",
            AnomalyTag::HighGeh => "HIGH_GEH",
            AnomalyTag::ZeroReference => "ZERO_REFERENCE",
            AnomalyTag::ExtremeRatio => "EXTREME_RATIO",
        }
    }
}

impl fmt::Display for AnomalyTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Classification {
    pub category: QualityCategory,
    pub tags: Vec<AnomalyTag>,
}

impl Classification {
    pub fn is_anomalous(&self) -> bool {
        !self.tags.is_empty()
    }

    pub fn has(&self, tag: AnomalyTag) -> bool {
        self.tags.contains(&tag)
    }
}

/// An aligned record together with its pointwise metrics and classification.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassifiedRecord {
    #[serde(flatten)]
    pub record: AlignedRecord,
    pub mape: Option<f64>,
    pub geh: Option<f64>,
    #[serde(flatten)]
    pub classification: Classification,
}

#[derive(Debug, Clone)]
pub struct QualityClassifier {
    cfg: QualityConfig,
}

impl QualityClassifier {
    pub fn new(cfg: &QualityConfig) -> Self {
        Self { cfg: cfg.clone() }
    }

    pub fn classify(&self, record: &AlignedRecord, mape: Option<f64>, geh: Option<f64>) -> Classification {
        let mape = mape.filter(|m| !m.is_nan());
        let geh = geh.filter(|g| !g.is_nan());
        let mut tags = Vec::new();

        if mape.is_some_and(|m| m > self.cfg.mape_threshold) {
            tags.push(AnomalyTag::HighMape);
        }
        if geh.is_some_and(|g| g > self.cfg.geh_threshold) {
            tags.push(AnomalyTag::HighGeh);
        }

        let obs = record.observed_flow;
        if obs == 0.0 {
            tags.push(AnomalyTag::ZeroReference);
        } else {
            let ratio = record.simulated_flow / obs;
            if ratio > self.cfg.max_flow_ratio || ratio < self.cfg.min_flow_ratio {
                tags.push(AnomalyTag::ExtremeRatio);
            }
        }

        Classification {
            category: mape_category(mape),
            tags,
        }
    }

    /// Computes pointwise MAPE and GEH under `metrics` and classifies every record.
    pub fn classify_all(&self, records: &[AlignedRecord], metrics: &MetricsConfig) -> Vec<ClassifiedRecord> {
        records
            .iter()
            .map(|r| {
                let mape = pointwise_mape(r.simulated_flow, r.observed_flow, metrics.zero_policy);
                let g = geh(r.simulated_flow, r.observed_flow);
                let geh = (!g.is_nan()).then_some(g);
                ClassifiedRecord {
                    record: r.clone(),
                    mape,
                    geh,
                    classification: self.classify(r, mape, geh),
                }
            })
            .collect()
    }
}
