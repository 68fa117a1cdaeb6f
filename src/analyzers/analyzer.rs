use tracing::{debug, info, warn};

use crate::analyzers::aggregate::{aggregate_series, rebucket};
use crate::analyzers::align::{TimeAlignment, align};
use crate::analyzers::metrics::MetricsEngine;
use crate::analyzers::normalize::{RawTable, SourceSchema, normalize};
use crate::analyzers::quality::{ClassifiedRecord, QualityClassifier};
use crate::analyzers::summary::{AccuracySummary, AccuracySummaryBuilder, FlowStatistics};
use crate::analyzers::types::{AlignedRecord, Source};
use crate::config::EngineConfig;
use crate::error::EngineResult;

/// Output of one observed-versus-simulated comparison.
#[derive(Debug, Clone)]
pub struct AccuracyAnalysis {
    pub aligned: Vec<AlignedRecord>,
    pub classified: Vec<ClassifiedRecord>,
    pub summary: AccuracySummary,
}

impl AccuracyAnalysis {
    /// Records carrying at least one anomaly tag, in aligned order.
    pub fn anomalies(&self) -> impl Iterator<Item = &ClassifiedRecord> {
        self.classified
            .iter()
            .filter(|r| r.classification.is_anomalous())
    }
}

/// Runs the whole comparison on two raw tables.
///
/// Both series are rolled up onto the coarser of the two bucket widths before
/// they are joined.
///
/// Only structural problems fail: invalid config, a table missing a required
/// column, or a duplicate key after aggregation. Data gaps (everything
/// dropped, no shared ids, no time overlap) produce an empty but complete
/// summary and are logged at warn.
#[tracing::instrument(skip_all, fields(observed_rows = observed.len(), simulated_rows = simulated.len()))]
pub fn run_analysis(
    observed: &RawTable,
    simulated: &RawTable,
    cfg: &EngineConfig,
) -> EngineResult<AccuracyAnalysis> {
    cfg.validate()?;
    let width = cfg.normalize.comparison_bucket()?;
    debug!(minutes = width.num_minutes(), "Comparison bucket width");

    let mut obs = normalize(observed, &SourceSchema::observed(), &cfg.normalize)?;
    let mut sim = normalize(simulated, &SourceSchema::simulated(), &cfg.normalize)?;
    rebucket(&mut obs.records, width)?;
    rebucket(&mut sim.records, width)?;

    let obs_agg = aggregate_series(Source::Observed, &obs.records)?;
    let sim_agg = aggregate_series(Source::Simulated, &sim.records)?;

    let alignment = align(&obs_agg, &sim_agg)?;
    if alignment.report.time_alignment != TimeAlignment::Success {
        warn!(
            time_alignment = ?alignment.report.time_alignment,
            matched_ids = alignment.report.matched_ids,
            "Nothing to compare"
        );
    }

    let engine = MetricsEngine::new(&cfg.metrics);
    let records = &alignment.records;
    let overall = engine.compute(records);
    let classified = QualityClassifier::new(&cfg.quality).classify_all(records, &cfg.metrics);

    let summary = AccuracySummaryBuilder::new(cfg, alignment.report, overall)
        .normalization(obs.report)
        .normalization(sim.report)
        .speed(engine.speed_metrics(records))
        .statistics(FlowStatistics::from_aligned(records))
        .per_location(engine.per_location(records))
        .per_time_bucket(engine.per_time_bucket(records))
        .classifications(&classified)
        .build();

    info!(
        samples = summary.overall.sample_size,
        mape = ?summary.overall.mape,
        geh_pass_rate = ?summary.overall.geh_pass_rate,
        anomalies = summary.anomaly_counts.anomalous_records,
        "Analysis complete"
    );

    Ok(AccuracyAnalysis {
        aligned: alignment.records,
        classified,
        summary,
    })
}
