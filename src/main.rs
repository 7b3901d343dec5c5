//! CLI entry point for the heatmap aggregation tool.
//!
//! Turns raw analytics event logs (TSV, optionally gzipped) into
//! aggregated heatmap JSON. The heavy lifting lives in the library; this
//! binary only parses flags and sets up logging.

use anyhow::{Context, Result, bail};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use clap::Parser;
use heatmap_aggr::aggregation::{AggregationOptions, HeatmapAggregator};
use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

/// Fields the spatial smoothing divisor applies to.
const SPACE_FIELDS: &[&str] = &["x", "y", "z", "dx", "dy", "dz"];
/// Fields the rotational smoothing divisor applies to.
const ROTATION_FIELDS: &[&str] = &["rx", "ry", "rz"];

#[derive(Parser)]
#[command(name = "heatmap_aggr")]
#[command(about = "Aggregate raw analytics event logs into heatmap JSON", long_about = None)]
struct Cli {
    /// Raw event log files (TSV, `.gz` accepted); the first names the output
    #[arg(value_name = "INPUT", required = true)]
    inputs: Vec<PathBuf>,

    /// Base directory for output; results land in <DATA_PATH>/HeatmapData
    #[arg(short, long, default_value = ".")]
    data_path: PathBuf,

    /// Drop rows before this date (YYYY-MM-DD, inclusive)
    #[arg(long, value_name = "DATE")]
    start_date: Option<String>,

    /// Drop rows after this date (YYYY-MM-DD, inclusive)
    #[arg(long, value_name = "DATE")]
    end_date: Option<String>,

    /// Fields that make a point unique (pseudo-fields: userID, sessionID, platform, debug)
    #[arg(long, value_delimiter = ',', default_value = "x,y,z")]
    aggregate_on: Vec<String>,

    /// Smoothing divisor for spatial axes (x/y/z/dx/dy/dz); 0 keeps raw precision
    #[arg(short, long, default_value_t = 0.0)]
    space: f32,

    /// Smoothing divisor for the time axis (t); 0 keeps raw precision
    #[arg(short, long, default_value_t = 0.0)]
    time: f32,

    /// Smoothing divisor for rotation axes (rx/ry/rz); 0 keeps raw precision
    #[arg(short, long, default_value_t = 0.0)]
    rotation: f32,

    /// Fields that split the output into named series
    #[arg(long, value_delimiter = ',', default_value = "eventName")]
    group_on: Vec<String>,

    /// Derive density from this custom field instead of counting events
    #[arg(long, value_name = "FIELD")]
    remap_density: Option<String>,

    /// Aggregation method: increment, cumulative, average, min, max, first, last, percentile
    #[arg(short, long, default_value = "increment")]
    method: String,

    /// Percentile (0-100) used by the percentile method
    #[arg(long, default_value_t = 50.0)]
    percentile: f32,

    /// Only process these event names (comma-separated)
    #[arg(short, long, value_delimiter = ',')]
    events: Vec<String>,
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok(); // Load .env file

    // Logging setup: colored stderr + JSON rolling log file
    let log_file_path =
        std::env::var("LOG_FILE_PATH").unwrap_or_else(|_| "logs/heatmap_aggr.log".to_string());
    let log_dir = Path::new(&log_file_path)
        .parent()
        .unwrap_or(Path::new("logs"));
    let log_file_name = Path::new(&log_file_path)
        .file_name()
        .unwrap_or(OsStr::new("heatmap_aggr.log"));

    let file_appender = tracing_appender::rolling::daily(log_dir, log_file_name);
    let (non_blocking_file, _file_guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::from_env("RUST_LOG").add_directive("info".parse().unwrap()));

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(non_blocking_file)
        .with_filter(EnvFilter::from_env("RUST_LOG_JSON").add_directive("debug".parse().unwrap()));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let cli = Cli::parse();
    let options = build_options(&cli)?;

    let aggregator = HeatmapAggregator::new(&cli.data_path);
    match aggregator.process(&cli.inputs, &options, None)? {
        Some(summary) => {
            info!(
                output = %summary.output_path.display(),
                files = summary.files,
                rows = summary.rows,
                points = summary.points,
                skipped = summary.skipped_rows,
                "done"
            );
        }
        None => {
            warn!("no output produced; check event names, dates, and input files");
        }
    }

    Ok(())
}

/// Translates CLI flags into engine options.
fn build_options(cli: &Cli) -> Result<AggregationOptions> {
    let start_date = match &cli.start_date {
        Some(s) => day_start(s)?,
        None => DateTime::UNIX_EPOCH,
    };
    let end_date = match &cli.end_date {
        Some(s) => day_end(s)?,
        None => DateTime::<Utc>::MAX_UTC,
    };
    if start_date > end_date {
        bail!("start date is after end date");
    }

    // Per-axis divisors expand to a per-field map; only aggregated fields
    // participate, since smoothing must be a subset of aggregation.
    let mut smooth_on = HashMap::new();
    for field in &cli.aggregate_on {
        let divisor = if SPACE_FIELDS.contains(&field.as_str()) {
            cli.space
        } else if field == "t" {
            cli.time
        } else if ROTATION_FIELDS.contains(&field.as_str()) {
            cli.rotation
        } else {
            continue;
        };
        smooth_on.insert(field.clone(), divisor);
    }

    Ok(AggregationOptions {
        start_date,
        end_date,
        aggregate_on: cli.aggregate_on.clone(),
        smooth_on,
        group_on: cli.group_on.clone(),
        remap_density_field: cli.remap_density.clone(),
        method: cli.method.parse()?,
        percentile: cli.percentile,
        events_whitelist: cli.events.clone(),
    })
}

fn day_start(s: &str) -> Result<DateTime<Utc>> {
    let date: NaiveDate = s
        .parse()
        .with_context(|| format!("'{}' is not a YYYY-MM-DD date", s))?;
    Ok(date.and_time(NaiveTime::MIN).and_utc())
}

fn day_end(s: &str) -> Result<DateTime<Utc>> {
    let date: NaiveDate = s
        .parse()
        .with_context(|| format!("'{}' is not a YYYY-MM-DD date", s))?;
    let last_second = NaiveTime::from_hms_opt(23, 59, 59).unwrap();
    Ok(date.and_time(last_second).and_utc())
}
