//! Measurement data types.
//!
//! A session measures exactly one quantity, selected by [`MeasurementMode`]. Every
//! [`Sample`] carries its value tagged with that mode, so a buffer can never mix
//! capacitance and resistance readings by accident.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub mod sample;

pub use sample::{Sample, SampleValue};

/// Quantity measured by a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MeasurementMode {
    /// Capacitance in farads
    #[default]
    Capacitance,
    /// Resistance in ohms
    Resistance,
}

impl MeasurementMode {
    /// Name of the CSV value column for this mode.
    pub fn column_name(&self) -> &'static str {
        match self {
            MeasurementMode::Capacitance => "capacitance_F",
            MeasurementMode::Resistance => "resistance_Ohm",
        }
    }

    /// SI unit symbol.
    pub fn unit(&self) -> &'static str {
        match self {
            MeasurementMode::Capacitance => "F",
            MeasurementMode::Resistance => "Ohm",
        }
    }

    /// Tag a raw reading with this mode.
    pub fn tag(&self, value: f64) -> SampleValue {
        match self {
            MeasurementMode::Capacitance => SampleValue::CapacitanceFarads(value),
            MeasurementMode::Resistance => SampleValue::ResistanceOhms(value),
        }
    }

    /// Resolve a CSV value column back to its mode.
    pub fn from_column(column: &str) -> Option<Self> {
        [MeasurementMode::Capacitance, MeasurementMode::Resistance]
            .into_iter()
            .find(|mode| mode.column_name() == column)
    }
}

impl fmt::Display for MeasurementMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MeasurementMode::Capacitance => write!(f, "capacitance"),
            MeasurementMode::Resistance => write!(f, "resistance"),
        }
    }
}

impl FromStr for MeasurementMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "capacitance" | "cap" => Ok(MeasurementMode::Capacitance),
            "resistance" | "res" => Ok(MeasurementMode::Resistance),
            other => Err(format!("Unknown measurement mode '{other}'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn column_names_round_trip() {
        for mode in [MeasurementMode::Capacitance, MeasurementMode::Resistance] {
            assert_eq!(MeasurementMode::from_column(mode.column_name()), Some(mode));
        }
        assert_eq!(MeasurementMode::from_column("voltage_V"), None);
    }

    #[test]
    fn parses_mode_names() {
        assert_eq!("Capacitance".parse(), Ok(MeasurementMode::Capacitance));
        assert_eq!(" res ".parse(), Ok(MeasurementMode::Resistance));
        assert!("inductance".parse::<MeasurementMode>().is_err());
    }
}
