//! Raw event log decoding.
//!
//! Raw data exports are tab-separated text files, one event per line, with a
//! header row naming the columns. Column positions are resolved from the
//! header rather than assumed fixed, so exports survive upstream schema
//! drift. The `custom_params` column holds a JSON object whose numeric
//! fields are encoded as JSON strings (e.g. `"x":"12.5"`).

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use csv::StringRecord;
use flate2::read::GzDecoder;
use serde_json::{Map, Value};
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Resolved positions of the required columns within one input file.
#[derive(Debug, Clone, Copy)]
pub struct ColumnMap {
    pub name: usize,
    pub submit_time: usize,
    pub custom_params: usize,
    pub userid: usize,
    pub sessionid: usize,
    pub platform: usize,
    pub debug_device: usize,
}

impl ColumnMap {
    /// Resolves column positions from a header record.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first required column missing from the
    /// header. A file without the required columns is unusable, so this is
    /// fatal rather than a per-row skip.
    pub fn from_header(header: &StringRecord) -> Result<Self> {
        let find = |wanted: &str| -> Result<usize> {
            header
                .iter()
                .position(|col| col.trim() == wanted)
                .ok_or_else(|| anyhow!("input header is missing required column '{}'", wanted))
        };

        Ok(ColumnMap {
            name: find("name")?,
            submit_time: find("submit_time")?,
            custom_params: find("custom_params")?,
            userid: find("userid")?,
            sessionid: find("sessionid")?,
            platform: find("platform")?,
            debug_device: find("debug_device")?,
        })
    }
}

/// Row metadata decoded ahead of the parameter blob, so date and
/// whitelist filters can drop a row before any JSON parsing happens.
#[derive(Debug)]
pub struct RowMeta {
    pub timestamp: DateTime<Utc>,
    pub event_name: String,
    pub user_id: String,
    pub session_id: String,
    pub platform: String,
    pub is_debug_device: bool,
}

/// One fully decoded data row. Ephemeral: built per line, folded into a
/// bucket, then dropped.
#[derive(Debug)]
pub struct RawEventRow {
    pub timestamp: DateTime<Utc>,
    pub event_name: String,
    pub user_id: String,
    pub session_id: String,
    pub platform: String,
    pub is_debug_device: bool,
    pub params: Map<String, Value>,
}

/// Why a data row was dropped instead of decoded. Row-level problems are
/// never fatal; the engine counts them and moves on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowSkip {
    /// Fewer columns than the header promised, or empty required cells.
    MissingColumns,
    /// `submit_time` did not parse as epoch seconds.
    BadTimestamp,
    /// `custom_params` was not a JSON object.
    BadParams,
    /// No `x`/`y` pair, so not a heatmap event at all.
    NotHeatmapEvent,
}

/// Decodes a data record's metadata against the resolved column map.
pub fn decode_meta(record: &StringRecord, cols: &ColumnMap) -> Result<RowMeta, RowSkip> {
    let cell = |idx: usize| record.get(idx).map(str::trim).unwrap_or("");

    let event_name = cell(cols.name);
    let submit_time = cell(cols.submit_time);
    if event_name.is_empty() || submit_time.is_empty() || cell(cols.custom_params).is_empty() {
        return Err(RowSkip::MissingColumns);
    }

    let seconds: f64 = submit_time.parse().map_err(|_| RowSkip::BadTimestamp)?;
    let timestamp = epoch_seconds_to_utc(seconds).ok_or(RowSkip::BadTimestamp)?;

    Ok(RowMeta {
        timestamp,
        event_name: event_name.to_string(),
        user_id: cell(cols.userid).to_string(),
        session_id: cell(cols.sessionid).to_string(),
        platform: cell(cols.platform).to_string(),
        is_debug_device: parse_flag(cell(cols.debug_device)),
    })
}

impl RowMeta {
    /// Finishes decoding by parsing the `custom_params` blob.
    pub fn into_row(self, record: &StringRecord, cols: &ColumnMap) -> Result<RawEventRow, RowSkip> {
        let raw_params = record.get(cols.custom_params).map(str::trim).unwrap_or("");
        let params = match serde_json::from_str::<Value>(raw_params) {
            Ok(Value::Object(map)) => map,
            _ => return Err(RowSkip::BadParams),
        };

        // Without both x and y there is nothing to plot.
        if !params.contains_key("x") || !params.contains_key("y") {
            return Err(RowSkip::NotHeatmapEvent);
        }

        Ok(RawEventRow {
            timestamp: self.timestamp,
            event_name: self.event_name,
            user_id: self.user_id,
            session_id: self.session_id,
            platform: self.platform,
            is_debug_device: self.is_debug_device,
            params,
        })
    }
}

/// Converts fractional Unix epoch seconds to a UTC timestamp.
fn epoch_seconds_to_utc(seconds: f64) -> Option<DateTime<Utc>> {
    if !seconds.is_finite() {
        return None;
    }
    let whole = seconds.trunc() as i64;
    let nanos = (seconds.fract() * 1e9).abs() as u32;
    DateTime::from_timestamp(whole, nanos)
}

/// Interprets the export's boolean-ish cells (`true`/`false`, `1`/`0`).
fn parse_flag(value: &str) -> bool {
    matches!(value.to_ascii_lowercase().as_str(), "true" | "1" | "t" | "yes")
}

/// Coerces a parameter value to a float.
///
/// The export writes numbers as JSON strings, but native numbers are
/// accepted too. Returns `None` when the key is absent; an unparseable
/// string coerces to 0 rather than failing the row.
pub fn param_f32(params: &Map<String, Value>, key: &str) -> Option<f32> {
    match params.get(key)? {
        Value::String(s) => Some(s.trim().parse().unwrap_or(0.0)),
        Value::Number(n) => Some(n.as_f64().unwrap_or(0.0) as f32),
        _ => Some(0.0),
    }
}

/// Returns a parameter's display form for use in group labels.
pub fn param_label(params: &Map<String, Value>, key: &str) -> Option<String> {
    match params.get(key)? {
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Opens an input file as a tab-separated reader, transparently
/// decompressing `.gz` files.
///
/// Quoting is disabled because the JSON parameter blobs contain quote
/// characters that must pass through untouched.
pub fn open_reader(path: &Path) -> Result<csv::Reader<Box<dyn Read>>> {
    let file = File::open(path).with_context(|| format!("opening input file {}", path.display()))?;

    let raw: Box<dyn Read> = if path.extension().and_then(|e| e.to_str()) == Some("gz") {
        Box::new(GzDecoder::new(file))
    } else {
        Box::new(file)
    };

    Ok(csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .quoting(false)
        .flexible(true)
        .has_headers(true)
        .from_reader(raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str =
        "ts\tappid\ttype\tuserid\tsessionid\tremote_ip\tplatform\tsdk_ver\tdebug_device\tuser_agent\tsubmit_time\tname\tcustom_params";

    fn header_record() -> StringRecord {
        StringRecord::from(HEADER.split('\t').collect::<Vec<_>>())
    }

    fn sample_record(submit_time: &str, name: &str, params: &str) -> StringRecord {
        StringRecord::from(vec![
            "1446000000000",
            "app-1",
            "custom",
            "user-a",
            "session-1",
            "10.0.0.1",
            "ios",
            "5.2",
            "false",
            "agent",
            submit_time,
            name,
            params,
        ])
    }

    #[test]
    fn test_column_map_resolves_positions() {
        let cols = ColumnMap::from_header(&header_record()).unwrap();
        assert_eq!(cols.userid, 3);
        assert_eq!(cols.submit_time, 10);
        assert_eq!(cols.name, 11);
        assert_eq!(cols.custom_params, 12);
    }

    #[test]
    fn test_column_map_ignores_column_order() {
        let header = StringRecord::from(vec![
            "custom_params",
            "name",
            "submit_time",
            "debug_device",
            "platform",
            "sessionid",
            "userid",
        ]);
        let cols = ColumnMap::from_header(&header).unwrap();
        assert_eq!(cols.custom_params, 0);
        assert_eq!(cols.userid, 6);
    }

    #[test]
    fn test_column_map_missing_column_is_error() {
        let header = StringRecord::from(vec!["name", "submit_time", "userid"]);
        let err = ColumnMap::from_header(&header).unwrap_err();
        assert!(err.to_string().contains("custom_params"));
    }

    #[test]
    fn test_decode_row_basic() {
        let cols = ColumnMap::from_header(&header_record()).unwrap();
        let record = sample_record("1446161400", "PlayerPosition", r#"{"x":"1.5","y":"2"}"#);
        let meta = decode_meta(&record, &cols).unwrap();

        assert_eq!(meta.event_name, "PlayerPosition");
        assert_eq!(meta.user_id, "user-a");
        assert_eq!(meta.platform, "ios");
        assert!(!meta.is_debug_device);
        assert_eq!(meta.timestamp.timestamp(), 1446161400);

        let row = meta.into_row(&record, &cols).unwrap();
        assert_eq!(param_f32(&row.params, "x"), Some(1.5));
        assert_eq!(row.event_name, "PlayerPosition");
    }

    #[test]
    fn test_decode_row_missing_xy_is_not_heatmap() {
        let cols = ColumnMap::from_header(&header_record()).unwrap();
        let record = sample_record("1446161400", "LevelUp", r#"{"level":"3"}"#);
        let meta = decode_meta(&record, &cols).unwrap();
        assert_eq!(
            meta.into_row(&record, &cols).unwrap_err(),
            RowSkip::NotHeatmapEvent
        );
    }

    #[test]
    fn test_decode_row_malformed_params() {
        let cols = ColumnMap::from_header(&header_record()).unwrap();
        let record = sample_record("1446161400", "PlayerPosition", "{not json");
        let meta = decode_meta(&record, &cols).unwrap();
        assert_eq!(meta.into_row(&record, &cols).unwrap_err(), RowSkip::BadParams);
    }

    #[test]
    fn test_decode_row_bad_timestamp() {
        let cols = ColumnMap::from_header(&header_record()).unwrap();
        let record = sample_record("yesterday", "PlayerPosition", r#"{"x":"1","y":"2"}"#);
        assert_eq!(decode_meta(&record, &cols).unwrap_err(), RowSkip::BadTimestamp);
    }

    #[test]
    fn test_decode_row_short_record() {
        let cols = ColumnMap::from_header(&header_record()).unwrap();
        let record = StringRecord::from(vec!["1446161400"]);
        assert_eq!(decode_meta(&record, &cols).unwrap_err(), RowSkip::MissingColumns);
    }

    #[test]
    fn test_param_f32_coerces_strings_and_numbers() {
        let params: Map<String, Value> =
            serde_json::from_str(r#"{"a":"4.25","b":7,"c":"junk","d":true}"#).unwrap();
        assert_eq!(param_f32(&params, "a"), Some(4.25));
        assert_eq!(param_f32(&params, "b"), Some(7.0));
        assert_eq!(param_f32(&params, "c"), Some(0.0));
        assert_eq!(param_f32(&params, "d"), Some(0.0));
        assert_eq!(param_f32(&params, "missing"), None);
    }

    #[test]
    fn test_fractional_submit_time() {
        let ts = epoch_seconds_to_utc(1446161400.5).unwrap();
        assert_eq!(ts.timestamp(), 1446161400);
        assert_eq!(ts.timestamp_subsec_millis(), 500);
    }
}
