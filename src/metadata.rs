//! Session metadata structures.

use crate::measurement::MeasurementMode;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

/// Describes one measurement session.
///
/// Created when a session starts, finalized when it stops, and replaced
/// wholesale by the next start. It is also what the CSV header round-trips.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMetadata {
    /// When acquisition started.
    pub start_time: DateTime<Local>,
    /// When acquisition stopped (or the data was last exported).
    pub end_time: Option<DateTime<Local>>,
    /// Number of samples held when the session was finalized.
    pub sample_count: usize,
    /// Configured sample period.
    pub sample_period_ms: u64,
    /// Measured quantity.
    pub mode: MeasurementMode,
    /// Whether the instrument selected its own range.
    pub autorange: bool,
    /// Fixed range in SI units of `mode`, present only without autorange.
    pub manual_range: Option<f64>,
    /// Instrument type tag ("synthetic", "keithley2110", ...).
    pub instrument_type: String,
    /// Bus resource identifier of a real instrument.
    pub resource: Option<String>,
    /// Recovered read failures during the session.
    pub soft_error_count: u32,
}

impl SessionMetadata {
    /// Start a new session record stamped with `start_time`.
    pub fn begin(
        start_time: DateTime<Local>,
        sample_period_ms: u64,
        mode: MeasurementMode,
        autorange: bool,
        manual_range: f64,
        instrument_type: impl Into<String>,
        resource: Option<String>,
    ) -> Self {
        Self {
            start_time,
            end_time: None,
            sample_count: 0,
            sample_period_ms,
            mode,
            autorange,
            manual_range: (!autorange).then_some(manual_range),
            instrument_type: instrument_type.into(),
            resource,
            soft_error_count: 0,
        }
    }

    /// Session duration, if the session has been finalized.
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.end_time.map(|end| end - self.start_time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_range_only_recorded_without_autorange() {
        let now = Local::now();
        let auto = SessionMetadata::begin(
            now,
            100,
            MeasurementMode::Capacitance,
            true,
            1e-9,
            "synthetic",
            None,
        );
        assert_eq!(auto.manual_range, None);
        assert_eq!(auto.duration(), None);

        let manual = SessionMetadata::begin(
            now,
            100,
            MeasurementMode::Resistance,
            false,
            1e4,
            "keithley2110",
            Some("TCPIP0::192.168.0.7::5025::SOCKET".into()),
        );
        assert_eq!(manual.manual_range, Some(1e4));
    }
}
