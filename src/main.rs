//! CLI entry point for the flow accuracy tool.
//!
//! Compares gantry observations against simulated detector output and
//! reports accuracy metrics, or lists the samples flagged as anomalous.

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use clap::{Args, Parser, Subcommand, ValueEnum};
use flow_accuracy::analyzers::analyzer::{AccuracyAnalysis, run_analysis};
use flow_accuracy::analyzers::normalize::parse_timestamp;
use flow_accuracy::config::{DEFAULT_EPSILON, EngineConfig, ZeroPolicy};
use flow_accuracy::input::load_table;
use flow_accuracy::output::{
    RunRecord, append_record, log_summary, write_anomalies, write_metric_tables,
    write_summary_json,
};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

#[derive(Parser)]
#[command(name = "flow_accuracy")]
#[command(about = "Compare simulated traffic flow against gantry observations", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compute accuracy metrics and write the summary
    Analyze {
        #[command(flatten)]
        run: RunArgs,

        /// JSON file to write the full summary to
        #[arg(short, long, default_value = "accuracy_summary.json")]
        output: PathBuf,

        /// Directory to export per-location, per-bucket and aligned CSV tables to
        #[arg(long)]
        export_dir: Option<PathBuf>,

        /// Gzip the exported CSV tables
        #[arg(long, default_value_t = false)]
        gzip: bool,

        /// CSV file to append one headline row per run to
        #[arg(long)]
        history: Option<String>,
    },
    /// Print every anomalous aligned sample as CSV to stdout
    Classify {
        #[command(flatten)]
        run: RunArgs,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Gantry observation CSV (.csv or .csv.gz)
    #[arg(long)]
    observed: PathBuf,

    /// Simulated detector CSV (.csv or .csv.gz)
    #[arg(long)]
    simulated: PathBuf,

    /// JSON engine config; flags below override it
    #[arg(short, long)]
    config: Option<String>,

    /// Simulation start, required when detector rows carry `begin` offsets
    #[arg(long, value_parser = parse_sim_start)]
    sim_start: Option<NaiveDateTime>,

    #[arg(long)]
    observed_bucket_minutes: Option<i64>,

    #[arg(long)]
    simulated_bucket_minutes: Option<i64>,

    /// How MAPE treats zero observed flow
    #[arg(long, value_enum)]
    zero_policy: Option<ZeroPolicyArg>,

    /// Denominator substituted for zero observed flow with `--zero-policy epsilon`
    #[arg(long)]
    epsilon: Option<f64>,
}

#[derive(Clone, Copy, ValueEnum)]
enum ZeroPolicyArg {
    Filter,
    Epsilon,
}

fn parse_sim_start(s: &str) -> Result<NaiveDateTime, String> {
    parse_timestamp(s).ok_or_else(|| format!("unrecognized timestamp '{s}'"))
}

impl RunArgs {
    /// Loads the config file (if any) and applies flag overrides.
    fn engine_config(&self) -> Result<EngineConfig> {
        let mut cfg = match &self.config {
            Some(path) => EngineConfig::load(path)?,
            None => EngineConfig::default(),
        };

        if let Some(start) = self.sim_start {
            cfg.normalize.simulation_start = Some(start);
        }
        if let Some(minutes) = self.observed_bucket_minutes {
            cfg.normalize.observed_bucket_minutes = minutes;
        }
        if let Some(minutes) = self.simulated_bucket_minutes {
            cfg.normalize.simulated_bucket_minutes = minutes;
        }

        match (self.zero_policy, self.epsilon) {
            (Some(ZeroPolicyArg::Filter), Some(_)) => {
                warn!("--epsilon is ignored with --zero-policy filter");
                cfg.metrics.zero_policy = ZeroPolicy::Filter;
            }
            (Some(ZeroPolicyArg::Filter), None) => cfg.metrics.zero_policy = ZeroPolicy::Filter,
            (Some(ZeroPolicyArg::Epsilon), epsilon) => {
                cfg.metrics.zero_policy = ZeroPolicy::Epsilon {
                    epsilon: epsilon.unwrap_or(DEFAULT_EPSILON),
                }
            }
            (None, Some(epsilon)) => {
                if let ZeroPolicy::Epsilon { .. } = cfg.metrics.zero_policy {
                    cfg.metrics.zero_policy = ZeroPolicy::Epsilon { epsilon };
                } else {
                    warn!("--epsilon has no effect unless the zero policy is epsilon");
                }
            }
            (None, None) => {}
        }

        Ok(cfg)
    }

    fn run(&self) -> Result<AccuracyAnalysis> {
        let cfg = self.engine_config()?;
        let observed = load_table(&self.observed)?;
        let simulated = load_table(&self.simulated)?;
        run_analysis(&observed, &simulated, &cfg).context("analysis failed")
    }
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok(); // Load .env file

    // Logging setup: colored stderr + JSON rolling log file
    let log_file_path =
        std::env::var("LOG_FILE_PATH").unwrap_or_else(|_| "logs/flow_accuracy.log".to_string());
    let log_dir = Path::new(&log_file_path)
        .parent()
        .unwrap_or(Path::new("logs"));
    let log_file_name = Path::new(&log_file_path)
        .file_name()
        .unwrap_or(OsStr::new("flow_accuracy.log"));

    let file_appender = tracing_appender::rolling::daily(log_dir, log_file_name);
    let (non_blocking_file, _file_guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::try_from_env("RUST_LOG").unwrap_or_else(|_| EnvFilter::new("info")));

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(non_blocking_file)
        .with_filter(
            EnvFilter::try_from_env("RUST_LOG_JSON").unwrap_or_else(|_| EnvFilter::new("debug")),
        );

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Analyze {
            run,
            output,
            export_dir,
            gzip,
            history,
        } => {
            let analysis = run.run()?;
            log_summary(&analysis.summary);

            write_summary_json(&output, &analysis.summary)?;

            if let Some(dir) = export_dir {
                write_metric_tables(&dir, &analysis, gzip)?;
            }

            if let Some(path) = history {
                append_record(&path, &RunRecord::from_summary(&analysis.summary))?;
                info!(path = %path, "Appended run history");
            }
        }
        Commands::Classify { run } => {
            let analysis = run.run()?;
            info!(
                aligned = analysis.aligned.len(),
                anomalous = analysis.summary.anomaly_counts.anomalous_records,
                "Classification complete"
            );
            write_anomalies(std::io::stdout().lock(), &analysis)?;
        }
    }

    Ok(())
}
