//! Engine configuration.
//!
//! A single immutable [`EngineConfig`] is passed into every analysis run. It
//! can be built in code, loaded from a JSON file, or tweaked from CLI flags;
//! every field has a default so partial JSON files are fine:
//! ```json
//! {
//!   "normalize": { "observed_bucket_minutes": 5, "simulation_start": "2025-06-03T07:00:00" },
//!   "metrics": { "zero_policy": { "mode": "epsilon", "epsilon": 0.000001 } }
//! }
//! ```

use anyhow::{Context, Result};
use chrono::{NaiveDateTime, TimeDelta};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// Replacement denominator used by [`ZeroPolicy::Epsilon`] unless overridden.
pub const DEFAULT_EPSILON: f64 = 1e-6;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub normalize: NormalizeConfig,
    pub metrics: MetricsConfig,
    pub quality: QualityConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizeConfig {
    /// Bucket width applied to gantry observations.
    pub observed_bucket_minutes: i64,
    /// Bucket width applied to detector output.
    pub simulated_bucket_minutes: i64,
    /// Absolute start of the simulation, required when detector rows carry
    /// simulation-relative `begin` offsets instead of timestamps.
    pub simulation_start: Option<NaiveDateTime>,
}

impl Default for NormalizeConfig {
    fn default() -> Self {
        Self {
            observed_bucket_minutes: 5,
            simulated_bucket_minutes: 1,
            simulation_start: None,
        }
    }
}

impl NormalizeConfig {
    pub fn observed_bucket(&self) -> EngineResult<TimeDelta> {
        bucket_width("observed", self.observed_bucket_minutes)
    }

    pub fn simulated_bucket(&self) -> EngineResult<TimeDelta> {
        bucket_width("simulated", self.simulated_bucket_minutes)
    }

    /// Width of the grid both series are compared on: the coarser of the two
    /// source widths. The finer width must divide it evenly.
    pub fn comparison_bucket(&self) -> EngineResult<TimeDelta> {
        let observed = self.observed_bucket()?;
        let simulated = self.simulated_bucket()?;
        let (fine, coarse) = if observed <= simulated {
            (self.observed_bucket_minutes, simulated)
        } else {
            (self.simulated_bucket_minutes, observed)
        };
        if coarse.num_minutes() % fine != 0 {
            return Err(EngineError::InvalidConfig(format!(
                "bucket widths must be whole multiples of each other (observed={}, simulated={})",
                self.observed_bucket_minutes, self.simulated_bucket_minutes
            )));
        }
        Ok(coarse)
    }
}

fn bucket_width(series: &str, minutes: i64) -> EngineResult<TimeDelta> {
    if minutes <= 0 {
        return Err(EngineError::InvalidConfig(format!(
            "{series} bucket width must be positive, got {minutes}"
        )));
    }
    TimeDelta::try_minutes(minutes).ok_or_else(|| {
        EngineError::InvalidConfig(format!("{series} bucket width of {minutes} minutes is out of range"))
    })
}

/// How MAPE treats records whose observed flow is zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ZeroPolicy {
    #[default]
    /// Exclude zero-reference records from MAPE and report the reduced sample size.
    Filter,
    /// Substitute `epsilon` for a zero observed flow and keep every record.
    Epsilon { epsilon: f64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub zero_policy: ZeroPolicy,
    /// GEH values at or below this count as passing.
    pub geh_threshold: f64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            zero_policy: ZeroPolicy::Filter,
            geh_threshold: 5.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    pub mape_threshold: f64,
    pub geh_threshold: f64,
    /// sim/obs above this is tagged as an extreme ratio.
    pub max_flow_ratio: f64,
    /// sim/obs below this is tagged as an extreme ratio.
    pub min_flow_ratio: f64,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            mape_threshold: 15.0,
            geh_threshold: 5.0,
            max_flow_ratio: 5.0,
            min_flow_ratio: 0.2,
        }
    }
}

impl EngineConfig {
    /// Loads a config from a JSON file at `path`. Missing fields keep their defaults.
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file '{path}'"))?;
        let cfg: EngineConfig = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config file '{path}'"))?;
        Ok(cfg)
    }

    /// Rejects values the engine cannot work with.
    pub fn validate(&self) -> EngineResult<()> {
        self.normalize.comparison_bucket()?;

        if let ZeroPolicy::Epsilon { epsilon } = self.metrics.zero_policy {
            if !(epsilon.is_finite() && epsilon > 0.0) {
                return Err(EngineError::InvalidConfig(format!(
                    "epsilon must be a positive finite number, got {epsilon}"
                )));
            }
        }

        let q = &self.quality;
        if !(q.min_flow_ratio > 0.0 && q.min_flow_ratio < q.max_flow_ratio) {
            return Err(EngineError::InvalidConfig(format!(
                "flow ratio bounds must satisfy 0 < min < max (min={}, max={})",
                q.min_flow_ratio, q.max_flow_ratio
            )));
        }

        let thresholds = [
            self.metrics.geh_threshold,
            q.mape_threshold,
            q.geh_threshold,
        ];
        if thresholds.iter().any(|t| !t.is_finite() || *t < 0.0) {
            return Err(EngineError::InvalidConfig(
                "thresholds must be finite and non-negative".into(),
            ));
        }

        Ok(())
    }
}
