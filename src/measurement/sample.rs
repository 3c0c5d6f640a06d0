//! Mode-tagged samples.

use super::MeasurementMode;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

/// A reading tagged with the quantity it measures.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum SampleValue {
    /// Capacitance in farads
    CapacitanceFarads(f64),
    /// Resistance in ohms
    ResistanceOhms(f64),
}

impl SampleValue {
    /// Raw value in SI units.
    pub fn raw(&self) -> f64 {
        match *self {
            SampleValue::CapacitanceFarads(v) | SampleValue::ResistanceOhms(v) => v,
        }
    }

    /// Mode the value was measured in.
    pub fn mode(&self) -> MeasurementMode {
        match self {
            SampleValue::CapacitanceFarads(_) => MeasurementMode::Capacitance,
            SampleValue::ResistanceOhms(_) => MeasurementMode::Resistance,
        }
    }

    /// Capacitance in farads, if this is a capacitance reading.
    pub fn capacitance_farads(&self) -> Option<f64> {
        match *self {
            SampleValue::CapacitanceFarads(v) => Some(v),
            SampleValue::ResistanceOhms(_) => None,
        }
    }

    /// Resistance in ohms, if this is a resistance reading.
    pub fn resistance_ohms(&self) -> Option<f64> {
        match *self {
            SampleValue::ResistanceOhms(v) => Some(v),
            SampleValue::CapacitanceFarads(_) => None,
        }
    }
}

/// A single timestamped measurement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Absolute acquisition time
    pub timestamp: DateTime<Local>,
    /// Seconds elapsed since the session started
    pub t_seconds: f64,
    /// Measured value
    pub value: SampleValue,
}

impl Sample {
    /// Create a sample.
    pub fn new(timestamp: DateTime<Local>, t_seconds: f64, value: SampleValue) -> Self {
        Self {
            timestamp,
            t_seconds,
            value,
        }
    }
}
