//! CSV storage for measurement sessions.
//!
//! # File Layout
//!
//! ```text
//! # Generated: 2026-03-02T14:07:11.284113+01:00
//! # Mode: capacitance
//! # Instrument: synthetic
//! # Start Time: 2026-03-02T14:06:01.002311+01:00
//! # End Time: 2026-03-02T14:07:11.001923+01:00
//! # Sample Period: 100 ms
//! # Autorange: true
//! # Sample Count: 700
//! # Soft Errors: 0
//! #
//! timestamp_iso8601,t_seconds,capacitance_F
//! 2026-03-02T14:06:01.103114+01:00,1.008030000000e-1,1.005871233412e-9
//! ```
//!
//! `Resource`, `End Time` and `Manual Range` lines are written only when present.
//! Values use 13 significant digits; timestamps keep full sub-second precision.
//!
//! Loading is lenient about metadata and strict about data: an unknown or unparsable
//! comment line is skipped, but a missing data column or malformed row fails the load.

use crate::error::{MonitorError, MonitorResult};
use crate::measurement::{MeasurementMode, Sample};
use crate::metadata::SessionMetadata;
use chrono::{DateTime, Local, NaiveDateTime, SecondsFormat, TimeZone};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::{debug, info, warn};

const TIMESTAMP_COLUMN: &str = "timestamp_iso8601";
const ELAPSED_COLUMN: &str = "t_seconds";
const DEFAULT_SAMPLE_PERIOD_MS: u64 = 100;

/// Samples and metadata read back from a CSV file.
#[derive(Debug, Clone)]
pub struct LoadedData {
    /// Session metadata reconstructed from the header comments.
    pub metadata: SessionMetadata,
    /// Samples in file order.
    pub samples: Vec<Sample>,
}

/// Metadata keys in the order they are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HeaderKey {
    Generated,
    Mode,
    Instrument,
    Resource,
    StartTime,
    EndTime,
    SamplePeriod,
    Autorange,
    ManualRange,
    SampleCount,
    SoftErrors,
}

impl HeaderKey {
    const ALL: [HeaderKey; 11] = [
        HeaderKey::Generated,
        HeaderKey::Mode,
        HeaderKey::Instrument,
        HeaderKey::Resource,
        HeaderKey::StartTime,
        HeaderKey::EndTime,
        HeaderKey::SamplePeriod,
        HeaderKey::Autorange,
        HeaderKey::ManualRange,
        HeaderKey::SampleCount,
        HeaderKey::SoftErrors,
    ];

    fn label(self) -> &'static str {
        match self {
            HeaderKey::Generated => "Generated",
            HeaderKey::Mode => "Mode",
            HeaderKey::Instrument => "Instrument",
            HeaderKey::Resource => "Resource",
            HeaderKey::StartTime => "Start Time",
            HeaderKey::EndTime => "End Time",
            HeaderKey::SamplePeriod => "Sample Period",
            HeaderKey::Autorange => "Autorange",
            HeaderKey::ManualRange => "Manual Range",
            HeaderKey::SampleCount => "Sample Count",
            HeaderKey::SoftErrors => "Soft Errors",
        }
    }

    fn from_label(label: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.label().eq_ignore_ascii_case(label))
    }
}

// =============================================================================
// Save
// =============================================================================

/// Write `samples` and `metadata` to `path`, creating parent directories as needed.
pub fn save(path: &Path, samples: &[Sample], metadata: &SessionMetadata) -> MonitorResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let mut file = BufWriter::new(File::create(path)?);
    for (key, value) in header_lines(metadata) {
        writeln!(file, "# {}: {}", key.label(), value)?;
    }
    writeln!(file, "#")?;

    let mut writer = csv::Writer::from_writer(file);
    writer.write_record([TIMESTAMP_COLUMN, ELAPSED_COLUMN, metadata.mode.column_name()])?;
    for sample in samples {
        writer.write_record([
            format_timestamp(&sample.timestamp),
            format!("{:.12e}", sample.t_seconds),
            format!("{:.12e}", sample.value.raw()),
        ])?;
    }
    writer.flush()?;

    info!(path = %path.display(), samples = samples.len(), "Saved measurement CSV");
    Ok(())
}

fn header_lines(metadata: &SessionMetadata) -> Vec<(HeaderKey, String)> {
    let mut lines = vec![
        (HeaderKey::Generated, format_timestamp(&Local::now())),
        (HeaderKey::Mode, metadata.mode.to_string()),
        (HeaderKey::Instrument, metadata.instrument_type.clone()),
    ];
    if let Some(resource) = &metadata.resource {
        lines.push((HeaderKey::Resource, resource.clone()));
    }
    lines.push((HeaderKey::StartTime, format_timestamp(&metadata.start_time)));
    if let Some(end) = &metadata.end_time {
        lines.push((HeaderKey::EndTime, format_timestamp(end)));
    }
    lines.push((
        HeaderKey::SamplePeriod,
        format!("{} ms", metadata.sample_period_ms),
    ));
    lines.push((HeaderKey::Autorange, metadata.autorange.to_string()));
    if let Some(range) = metadata.manual_range {
        lines.push((
            HeaderKey::ManualRange,
            format!("{:.12e} {}", range, metadata.mode.unit()),
        ));
    }
    lines.push((HeaderKey::SampleCount, metadata.sample_count.to_string()));
    lines.push((HeaderKey::SoftErrors, metadata.soft_error_count.to_string()));
    lines
}

fn format_timestamp(ts: &DateTime<Local>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::AutoSi, false)
}

// =============================================================================
// Load
// =============================================================================

#[derive(Debug, Default)]
struct ParsedHeader {
    mode: Option<MeasurementMode>,
    instrument: Option<String>,
    resource: Option<String>,
    start_time: Option<DateTime<Local>>,
    end_time: Option<DateTime<Local>>,
    sample_period_ms: Option<u64>,
    autorange: Option<bool>,
    manual_range: Option<f64>,
    sample_count: Option<usize>,
    soft_errors: Option<u32>,
}

impl ParsedHeader {
    fn apply(&mut self, key: HeaderKey, value: &str) -> bool {
        let first_token = || value.split_whitespace().next().unwrap_or_default();
        match key {
            HeaderKey::Generated => return true,
            HeaderKey::Mode => self.mode = value.parse().ok(),
            HeaderKey::Instrument => self.instrument = Some(value.to_string()),
            HeaderKey::Resource => self.resource = Some(value.to_string()),
            HeaderKey::StartTime => self.start_time = parse_timestamp(value),
            HeaderKey::EndTime => self.end_time = parse_timestamp(value),
            HeaderKey::SamplePeriod => self.sample_period_ms = first_token().parse().ok(),
            HeaderKey::Autorange => self.autorange = value.parse().ok(),
            HeaderKey::ManualRange => self.manual_range = first_token().parse().ok(),
            HeaderKey::SampleCount => self.sample_count = value.parse().ok(),
            HeaderKey::SoftErrors => self.soft_errors = value.parse().ok(),
        }
        match key {
            HeaderKey::Mode => self.mode.is_some(),
            HeaderKey::StartTime => self.start_time.is_some(),
            HeaderKey::EndTime => self.end_time.is_some(),
            HeaderKey::SamplePeriod => self.sample_period_ms.is_some(),
            HeaderKey::Autorange => self.autorange.is_some(),
            HeaderKey::ManualRange => self.manual_range.is_some(),
            HeaderKey::SampleCount => self.sample_count.is_some(),
            HeaderKey::SoftErrors => self.soft_errors.is_some(),
            _ => true,
        }
    }
}

/// Read a CSV file written by [`save`].
pub fn load(path: &Path) -> MonitorResult<LoadedData> {
    let content = fs::read_to_string(path)?;

    let mut header = ParsedHeader::default();
    for line in content.lines().take_while(|l| l.starts_with('#')) {
        let Some((key, value)) = line.trim_start_matches('#').split_once(':') else {
            continue;
        };
        let (key, value) = (key.trim(), value.trim());
        match HeaderKey::from_label(key) {
            Some(k) => {
                if !header.apply(k, value) {
                    warn!(key, value, "Ignoring unparsable CSV metadata field");
                }
            }
            None => debug!(key, "Ignoring unknown CSV metadata key"),
        }
    }

    let mut reader = csv::ReaderBuilder::new()
        .comment(Some(b'#'))
        .trim(csv::Trim::All)
        .from_reader(content.as_bytes());

    let columns = reader.headers()?.clone();
    let timestamp_idx = column_index(&columns, TIMESTAMP_COLUMN)?;
    let elapsed_idx = column_index(&columns, ELAPSED_COLUMN)?;
    let (value_idx, column_mode) = columns
        .iter()
        .enumerate()
        .find_map(|(i, c)| MeasurementMode::from_column(c).map(|m| (i, m)))
        .ok_or_else(|| {
            MonitorError::Storage(format!(
                "missing value column (expected '{}' or '{}')",
                MeasurementMode::Capacitance.column_name(),
                MeasurementMode::Resistance.column_name()
            ))
        })?;

    if header.mode.is_some_and(|m| m != column_mode) {
        warn!(
            header = ?header.mode,
            column = %column_mode,
            "Mode comment disagrees with value column; using the column"
        );
    }

    let mut rows = Vec::new();
    for (row, record) in reader.records().enumerate() {
        let line = row + 1;
        let record =
            record.map_err(|e| MonitorError::Storage(format!("row {line}: {e}")))?;
        let field = |idx: usize| {
            record.get(idx).ok_or_else(|| {
                MonitorError::Storage(format!("row {line}: missing field {idx}"))
            })
        };

        let raw_ts = field(timestamp_idx)?;
        let timestamp = parse_timestamp(raw_ts).ok_or_else(|| {
            MonitorError::Storage(format!("row {line}: invalid timestamp '{raw_ts}'"))
        })?;
        let raw_value = field(value_idx)?;
        let value: f64 = raw_value.parse().map_err(|_| {
            MonitorError::Storage(format!("row {line}: invalid value '{raw_value}'"))
        })?;
        let raw_elapsed = field(elapsed_idx)?;
        let t_seconds: f64 = raw_elapsed.parse().map_err(|_| {
            MonitorError::Storage(format!("row {line}: invalid t_seconds '{raw_elapsed}'"))
        })?;
        rows.push((timestamp, t_seconds, value));
    }

    let start_time = header
        .start_time
        .or_else(|| rows.first().map(|(ts, _, _)| *ts))
        .unwrap_or_else(Local::now);

    let samples: Vec<Sample> = rows
        .into_iter()
        .map(|(timestamp, t_seconds, value)| {
            Sample::new(timestamp, t_seconds, column_mode.tag(value))
        })
        .collect();

    let autorange = header.autorange.unwrap_or(header.manual_range.is_none());
    let metadata = SessionMetadata {
        start_time,
        end_time: header.end_time,
        sample_count: header.sample_count.unwrap_or(samples.len()),
        sample_period_ms: header.sample_period_ms.unwrap_or(DEFAULT_SAMPLE_PERIOD_MS),
        mode: column_mode,
        autorange,
        manual_range: if autorange { None } else { header.manual_range },
        instrument_type: header.instrument.unwrap_or_else(|| "unknown".to_string()),
        resource: header.resource,
        soft_error_count: header.soft_errors.unwrap_or(0),
    };

    info!(path = %path.display(), samples = samples.len(), "Loaded measurement CSV");
    Ok(LoadedData { metadata, samples })
}

fn column_index(columns: &csv::StringRecord, name: &str) -> MonitorResult<usize> {
    columns
        .iter()
        .position(|c| c == name)
        .ok_or_else(|| MonitorError::Storage(format!("missing required column '{name}'")))
}

/// Parse an RFC 3339 timestamp; a timestamp without offset is read as local time.
fn parse_timestamp(value: &str) -> Option<DateTime<Local>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Some(ts.with_timezone(&Local));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
        .and_then(|naive| Local.from_local_datetime(&naive).earliest())
}
