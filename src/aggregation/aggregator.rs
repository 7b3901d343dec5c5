//! The raw-event aggregation engine.
//!
//! [`HeatmapAggregator::process`] streams one or more raw event logs,
//! collapses nearby rows onto shared bucket keys, accretes a density value
//! per bucket, groups buckets into named series, and writes the result as
//! a JSON file for the downstream renderer.

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

use crate::aggregation::key::{CompositeKey, KeyPart};
use crate::aggregation::method::{AggregationMethod, DensityAccumulator};
use crate::aggregation::smooth::smooth;
use crate::output::{self, BucketData, SeriesCollection};
use crate::raw::{self, ColumnMap, RawEventRow, RowSkip, param_f32, param_label};

/// Numeric fields that carry through to output buckets when aggregated on.
/// Position, time, rotation, and destination axes.
const POINT_FIELDS: &[&str] = &["x", "y", "z", "t", "rx", "ry", "rz", "dx", "dy", "dz"];

/// Configuration for one aggregation run. Immutable while `process` runs.
#[derive(Debug, Clone)]
pub struct AggregationOptions {
    /// Inclusive lower bound on row timestamps.
    pub start_date: DateTime<Utc>,
    /// Inclusive upper bound on row timestamps.
    pub end_date: DateTime<Utc>,
    /// Fields that participate in bucket-key construction. Pseudo-fields
    /// `userID`, `sessionID`, `platform`, and `debug` pull from row
    /// metadata; anything else is a numeric `custom_params` field.
    pub aggregate_on: Vec<String>,
    /// Smoothing divisors, keyed by field name. Must be a subset of
    /// `aggregate_on`; aggregated fields without a divisor are zeroed
    /// (fully collapsed along that axis).
    pub smooth_on: HashMap<String, f32>,
    /// Fields that determine series grouping. Same pseudo-fields as
    /// `aggregate_on`, plus `eventName` and arbitrary custom fields.
    pub group_on: Vec<String>,
    /// When set, density derives from this field's value instead of an
    /// event count; rows lacking the field contribute zero.
    pub remap_density_field: Option<String>,
    pub method: AggregationMethod,
    /// Percentile (0–100) for [`AggregationMethod::Percentile`].
    pub percentile: f32,
    /// When non-empty, only these event names are processed.
    pub events_whitelist: Vec<String>,
}

impl Default for AggregationOptions {
    fn default() -> Self {
        AggregationOptions {
            start_date: DateTime::UNIX_EPOCH,
            end_date: DateTime::<Utc>::MAX_UTC,
            aggregate_on: vec!["x".to_string(), "y".to_string(), "z".to_string()],
            smooth_on: HashMap::new(),
            group_on: vec!["eventName".to_string()],
            remap_density_field: None,
            method: AggregationMethod::Increment,
            percentile: 50.0,
            events_whitelist: Vec::new(),
        }
    }
}

/// What one run did: where the output went and how much input survived.
#[derive(Debug)]
pub struct AggregationSummary {
    pub output_path: PathBuf,
    pub files: usize,
    pub rows: usize,
    pub points: usize,
    pub skipped_rows: usize,
    pub group_sizes: Vec<usize>,
}

/// One aggregated point: its shared field values plus the density
/// accumulator fed by every row that landed on its key.
struct Bucket {
    fields: Vec<(String, f32)>,
    density: DensityAccumulator,
}

/// Mutable state scoped to a single `process` call.
#[derive(Default)]
struct RunState {
    buckets: Vec<Bucket>,
    point_index: HashMap<CompositeKey, usize>,
    series: Vec<(CompositeKey, Vec<usize>)>,
    series_index: HashMap<CompositeKey, usize>,
    files: usize,
    rows: usize,
    points: usize,
    skipped_rows: usize,
}

/// The aggregation engine. Holds only the output data path between runs;
/// everything else is per-invocation. Not for concurrent use from
/// multiple threads on one instance.
pub struct HeatmapAggregator {
    data_path: PathBuf,
}

impl HeatmapAggregator {
    pub fn new(data_path: impl Into<PathBuf>) -> Self {
        HeatmapAggregator {
            data_path: data_path.into(),
        }
    }

    /// Points the aggregator at a different output data path. Safe to call
    /// between runs; has no effect on a run already in flight.
    pub fn set_data_path(&mut self, data_path: impl Into<PathBuf>) {
        self.data_path = data_path.into();
    }

    /// Runs one aggregation batch over `input_files`.
    ///
    /// Returns `Ok(Some(summary))` with the written output path, or
    /// `Ok(None)` when no rows survived filtering (a warning, not an
    /// error) or the run was cancelled. Row-level problems are counted
    /// and skipped; unreadable files and missing header columns abort
    /// the run.
    pub fn process(
        &self,
        input_files: &[PathBuf],
        options: &AggregationOptions,
        cancel: Option<&AtomicBool>,
    ) -> Result<Option<AggregationSummary>> {
        if input_files.is_empty() {
            bail!("no input files given");
        }

        let mut state = RunState::default();

        for path in input_files {
            state.files += 1;
            if !self.load_stream(&mut state, path, options, cancel)? {
                info!("aggregation cancelled, discarding partial results");
                return Ok(None);
            }
        }

        let group_sizes: Vec<usize> = state.series.iter().map(|(_, b)| b.len()).collect();
        if group_sizes.iter().all(|&n| n == 0) {
            warn!("the aggregation process yielded no results");
            return Ok(None);
        }

        info!(
            files = state.files,
            rows = state.rows,
            points = state.points,
            groups = state.series.len(),
            group_sizes = ?group_sizes,
            "aggregation complete"
        );

        let collection = self.assemble(&state, options.percentile);
        let output_name = output_file_name(&input_files[0]);
        let output_path = output::write_series(&self.data_path, &output_name, &collection)?;

        Ok(Some(AggregationSummary {
            output_path,
            files: state.files,
            rows: state.rows,
            points: state.points,
            skipped_rows: state.skipped_rows,
            group_sizes,
        }))
    }

    /// Streams one input file into the run state. Returns `false` when the
    /// cancellation flag tripped.
    fn load_stream(
        &self,
        state: &mut RunState,
        path: &Path,
        options: &AggregationOptions,
        cancel: Option<&AtomicBool>,
    ) -> Result<bool> {
        let mut reader = raw::open_reader(path)?;
        let cols = ColumnMap::from_header(reader.headers().with_context(|| {
            format!("reading header row of {}", path.display())
        })?)?;

        for record in reader.records() {
            if let Some(flag) = cancel {
                if flag.load(Ordering::Relaxed) {
                    return Ok(false);
                }
            }

            let record = record.with_context(|| format!("reading {}", path.display()))?;
            state.rows += 1;

            let meta = match raw::decode_meta(&record, &cols) {
                Ok(meta) => meta,
                Err(skip) => {
                    state.skipped_rows += 1;
                    log_skip(skip, state.rows);
                    continue;
                }
            };

            if meta.timestamp < options.start_date || meta.timestamp > options.end_date {
                state.skipped_rows += 1;
                continue;
            }

            if !options.events_whitelist.is_empty()
                && !options.events_whitelist.contains(&meta.event_name)
            {
                state.skipped_rows += 1;
                continue;
            }

            // Filters passed; now pay for the JSON decode.
            let row = match meta.into_row(&record, &cols) {
                Ok(row) => row,
                Err(skip) => {
                    state.skipped_rows += 1;
                    log_skip(skip, state.rows);
                    continue;
                }
            };

            state.points += 1;
            self.fold_row(state, &row, options);
        }

        Ok(true)
    }

    /// Folds one surviving row into its bucket and, on first occurrence of
    /// the bucket key, into its group's series.
    fn fold_row(&self, state: &mut RunState, row: &RawEventRow, options: &AggregationOptions) {
        let (bucket_key, fields) = bucket_key_for(row, options);
        let observed = match &options.remap_density_field {
            Some(field) => param_f32(&row.params, field).unwrap_or(0.0),
            None => 1.0,
        };

        if let Some(&idx) = state.point_index.get(&bucket_key) {
            state.buckets[idx].density.accrete(observed);
            return;
        }

        let idx = state.buckets.len();
        state.buckets.push(Bucket {
            fields,
            density: DensityAccumulator::first(options.method, observed),
        });
        state.point_index.insert(bucket_key, idx);

        let group_key = group_key_for(row, options);
        let series_idx = match state.series_index.get(&group_key) {
            Some(&i) => i,
            None => {
                state.series.push((group_key.clone(), Vec::new()));
                state.series_index.insert(group_key, state.series.len() - 1);
                state.series.len() - 1
            }
        };
        state.series[series_idx].1.push(idx);
    }

    /// Resolves accumulated densities and stringifies group keys into the
    /// serializable series collection.
    fn assemble(&self, state: &RunState, percentile: f32) -> SeriesCollection {
        let groups = state
            .series
            .iter()
            .map(|(key, bucket_ids)| {
                let buckets = bucket_ids
                    .iter()
                    .map(|&idx| {
                        let bucket = &state.buckets[idx];
                        BucketData {
                            fields: bucket.fields.clone(),
                            density: bucket.density.density(percentile),
                        }
                    })
                    .collect();
                (key.to_string(), buckets)
            })
            .collect();

        SeriesCollection { groups }
    }
}

/// Builds the row's bucket key and the point fields the bucket will carry.
///
/// The key always leads with the event name; each `aggregate_on` entry
/// contributes one part, so key shape is fixed for the whole run. Numeric
/// fields are smoothed when a divisor is configured and zeroed otherwise;
/// absent numeric fields default to 0.
fn bucket_key_for(row: &RawEventRow, options: &AggregationOptions) -> (CompositeKey, Vec<(String, f32)>) {
    let mut parts = vec![KeyPart::label(row.event_name.clone())];
    let mut fields = Vec::new();

    for name in &options.aggregate_on {
        match name.as_str() {
            "userID" => parts.push(KeyPart::label(row.user_id.clone())),
            "sessionID" => parts.push(KeyPart::label(row.session_id.clone())),
            "platform" => parts.push(KeyPart::label(row.platform.clone())),
            "debug" => parts.push(KeyPart::Flag(row.is_debug_device)),
            _ => {
                let value = param_f32(&row.params, name).unwrap_or(0.0);
                let value = match options.smooth_on.get(name) {
                    Some(&divisor) => smooth(value, divisor),
                    None => 0.0,
                };
                parts.push(KeyPart::num(value));
                if POINT_FIELDS.contains(&name.as_str()) {
                    fields.push((name.clone(), value));
                }
            }
        }
    }

    (CompositeKey::new(parts), fields)
}

/// Builds the row's group key. `eventName` contributes the bare name;
/// metadata pseudo-fields and custom fields contribute `label:value`
/// parts; fields absent from the row contribute nothing.
fn group_key_for(row: &RawEventRow, options: &AggregationOptions) -> CompositeKey {
    let mut parts = Vec::new();

    for name in &options.group_on {
        match name.as_str() {
            "eventName" => parts.push(KeyPart::label(row.event_name.clone())),
            "userID" => parts.push(KeyPart::label(format!("user:{}", row.user_id))),
            "sessionID" => parts.push(KeyPart::label(format!("session:{}", row.session_id))),
            "platform" => parts.push(KeyPart::label(format!("platform:{}", row.platform))),
            "debug" => parts.push(KeyPart::label(format!("debug:{}", row.is_debug_device))),
            _ => {
                if let Some(value) = param_label(&row.params, name) {
                    parts.push(KeyPart::label(format!("{}:{}", name, value)));
                }
            }
        }
    }

    CompositeKey::new(parts)
}

/// Derives the output file name from the first input: strip a `.gz`
/// suffix if present, then swap the extension for `.json`.
fn output_file_name(first_input: &Path) -> String {
    let name = first_input
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("heatmap");
    let name = name.strip_suffix(".gz").unwrap_or(name);
    match name.rsplit_once('.') {
        Some((stem, _)) => format!("{}.json", stem),
        None => format!("{}.json", name),
    }
}

fn log_skip(skip: RowSkip, row_number: usize) {
    match skip {
        RowSkip::MissingColumns => debug!(row_number, "skipping row with missing columns"),
        RowSkip::BadTimestamp => debug!(row_number, "skipping row with unparseable submit_time"),
        RowSkip::BadParams => debug!(row_number, "skipping row with malformed custom_params"),
        RowSkip::NotHeatmapEvent => debug!(row_number, "skipping row without x/y"),
    }
}
