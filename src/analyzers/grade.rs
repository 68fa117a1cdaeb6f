use serde::Serialize;
use std::fmt;

/// Accuracy tier of a sample or group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QualityCategory {
    Excellent,
    Good,
    Fair,
    Poor,
    /// No defined metric to grade.
    Undefined,
}

impl QualityCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            QualityCategory::Excellent => "EXCELLENT",
            QualityCategory::Good => "GOOD",
            QualityCategory::Fair => "FAIR",
            QualityCategory::Poor => "POOR",
            QualityCategory::Undefined => "UNDEFINED",
        }
    }
}

impl fmt::Display for QualityCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Converts a MAPE percentage into a quality category.
///
/// | MAPE (%)     | Category  |
/// |--------------|-----------|
/// | <= 10        | EXCELLENT |
/// | <= 20        | GOOD      |
/// | <= 30        | FAIR      |
/// | > 30         | POOR      |
/// | undefined    | UNDEFINED |
pub fn mape_category(mape: Option<f64>) -> QualityCategory {
    match mape {
        Some(m) if m.is_nan() => QualityCategory::Undefined,
        Some(m) if m <= 10.0 => QualityCategory::Excellent,
        Some(m) if m <= 20.0 => QualityCategory::Good,
        Some(m) if m <= 30.0 => QualityCategory::Fair,
        Some(_) => QualityCategory::Poor,
        None => QualityCategory::Undefined,
    }
}

/// Converts a GEH pass rate (percentage of samples with GEH <= threshold).
///
/// | Pass rate (%) | Category  |
/// |---------------|-----------|
/// | >= 85         | EXCELLENT |
/// | >= 75         | GOOD      |
/// | >= 60         | FAIR      |
/// | < 60          | POOR      |
pub fn geh_pass_rate_category(pass_rate: Option<f64>) -> QualityCategory {
    match pass_rate {
        Some(p) if p.is_nan() => QualityCategory::Undefined,
        Some(p) if p >= 85.0 => QualityCategory::Excellent,
        Some(p) if p >= 75.0 => QualityCategory::Good,
        Some(p) if p >= 60.0 => QualityCategory::Fair,
        Some(_) => QualityCategory::Poor,
        None => QualityCategory::Undefined,
    }
}
