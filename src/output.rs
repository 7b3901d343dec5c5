//! Output serialization and persistence for aggregated series.
//!
//! The on-disk format is one JSON object per run: keys are the `~`-joined
//! group labels, values are arrays of bucket objects carrying the captured
//! numeric fields plus `d` (density). Object keys serialize sorted, so
//! identical runs produce byte-identical files.

use anyhow::{Context, Result};
use serde_json::{Map, Number, Value, json};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

/// Subdirectory of the data path where result files land.
const OUTPUT_DIR: &str = "HeatmapData";

/// One serializable bucket: captured field values plus resolved density.
#[derive(Debug, Clone, PartialEq)]
pub struct BucketData {
    pub fields: Vec<(String, f32)>,
    pub density: f32,
}

/// The full result of a run: named series in first-appearance order.
#[derive(Debug, Default)]
pub struct SeriesCollection {
    pub groups: Vec<(String, Vec<BucketData>)>,
}

impl SeriesCollection {
    /// Renders the collection as a JSON value.
    pub fn to_json(&self) -> Value {
        let mut root = Map::new();
        for (name, buckets) in &self.groups {
            let list: Vec<Value> = buckets.iter().map(bucket_to_json).collect();
            root.insert(name.clone(), Value::Array(list));
        }
        Value::Object(root)
    }
}

fn bucket_to_json(bucket: &BucketData) -> Value {
    let mut obj = Map::new();
    for (field, value) in &bucket.fields {
        obj.insert(field.clone(), number(*value));
    }
    obj.insert("d".to_string(), number(bucket.density));
    Value::Object(obj)
}

/// Converts an f32 to a JSON number, falling back to 0 for the
/// non-finite values JSON cannot represent.
fn number(value: f32) -> Value {
    Number::from_f64(value as f64).map(Value::Number).unwrap_or(json!(0))
}

/// Writes the collection to `<data_path>/HeatmapData/<file_name>`,
/// creating the directory if needed. Returns the written path.
pub fn write_series(
    data_path: &Path,
    file_name: &str,
    collection: &SeriesCollection,
) -> Result<PathBuf> {
    let dir = data_path.join(OUTPUT_DIR);
    fs::create_dir_all(&dir)
        .with_context(|| format!("creating output directory {}", dir.display()))?;

    let path = dir.join(file_name);
    let json = serde_json::to_string(&collection.to_json())?;
    fs::write(&path, json)
        .with_context(|| format!("writing output file {}", path.display()))?;

    info!(path = %path.display(), groups = collection.groups.len(), "wrote aggregated heatmap data");
    Ok(path)
}
