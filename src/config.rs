//! Configuration System using Figment
//!
//! Configuration is layered, later sources overriding earlier ones:
//! 1. Built-in defaults ([`MonitorConfig::default`])
//! 2. `config/capmon.toml` (or the path given on the command line)
//! 3. Environment variables prefixed with `CAPMON_`, nested keys separated by `__`
//!
//! # Example
//! ```no_run
//! use capmon::config::MonitorConfig;
//!
//! // CAPMON_ACQUISITION__SAMPLE_PERIOD_MS=200 overrides the file value
//! let config = MonitorConfig::load()?;
//! config.validate()?;
//! println!("Sampling every {} ms", config.acquisition.sample_period_ms);
//! # Ok::<(), capmon::error::MonitorError>(())
//! ```

use crate::acquisition::AcquisitionSettings;
use crate::controller::ControllerSettings;
use crate::data::sample_buffer::DEFAULT_CAPACITY;
use crate::error::{MonitorError, MonitorResult};
use crate::hardware::synthetic::{DEFAULT_BASELINE_FARADS, DEFAULT_BASELINE_OHMS, DEFAULT_SEED};
use crate::measurement::MeasurementMode;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/capmon.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "CAPMON_";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Sampling settings
    pub acquisition: AcquisitionConfig,
    /// Instrument selection
    pub instrument: InstrumentConfig,
    /// Synthetic instrument model
    pub synthetic: SyntheticConfig,
    /// Export settings
    pub storage: StorageConfig,
    /// Scheduler poll periods
    pub scheduler: SchedulerConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    pub log_format: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "Capacitance Monitor".to_string(),
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

/// Acquisition configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    /// Measured quantity
    pub mode: MeasurementMode,
    /// Sample period (50 to 2000 ms)
    pub sample_period_ms: u64,
    /// Let the instrument select its range
    pub autorange: bool,
    /// Fixed capacitance range when autorange is off
    pub manual_range_farads: f64,
    /// Fixed resistance range when autorange is off
    pub manual_range_ohms: f64,
    /// Integration time in power-line cycles
    pub nplc: f64,
    /// Maximum wait for the acquisition thread on stop
    pub stop_timeout_ms: u64,
    /// Upper bound on one idle sleep of the acquisition loop
    pub idle_wait_ms: u64,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            mode: MeasurementMode::Capacitance,
            sample_period_ms: 100,
            autorange: true,
            manual_range_farads: 1e-9,
            manual_range_ohms: 1e4,
            nplc: 1.0,
            stop_timeout_ms: 5000,
            idle_wait_ms: 1,
        }
    }
}

/// Instrument driver selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstrumentKind {
    /// Simulated instrument
    #[default]
    Synthetic,
    /// Keithley 2110 over SCPI
    Keithley2110,
}

/// Instrument configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstrumentConfig {
    /// Driver to use
    pub kind: InstrumentKind,
    /// Bus resource, e.g. `TCPIP0::192.168.0.7::5025::SOCKET`
    pub resource: Option<String>,
    /// I/O timeout
    pub timeout_ms: u64,
}

impl Default for InstrumentConfig {
    fn default() -> Self {
        Self {
            kind: InstrumentKind::Synthetic,
            resource: None,
            timeout_ms: 5000,
        }
    }
}

/// Synthetic instrument configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyntheticConfig {
    /// Capacitance baseline in farads
    pub baseline_farads: f64,
    /// Resistance baseline in ohms
    pub baseline_ohms: f64,
    /// Fraction of the signal, 0 to 1
    pub noise_level: f64,
    /// RNG seed for reproducible signals
    pub seed: u64,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            baseline_farads: DEFAULT_BASELINE_FARADS,
            baseline_ohms: DEFAULT_BASELINE_OHMS,
            noise_level: 0.1,
            seed: DEFAULT_SEED,
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory for exported CSV files (`~` expands to the home directory)
    pub export_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            export_dir: PathBuf::from("measurements"),
        }
    }
}

impl StorageConfig {
    /// Export directory with a leading `~` expanded.
    pub fn resolved_export_dir(&self) -> PathBuf {
        match self.export_dir.strip_prefix("~") {
            Ok(rest) => match dirs::home_dir() {
                Some(home) => home.join(rest),
                None => self.export_dir.clone(),
            },
            Err(_) => self.export_dir.clone(),
        }
    }
}

/// Scheduler configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Poll period for delayed-stop tasks
    pub coarse_poll_ms: u64,
    /// Poll period for sequence steps
    pub fine_poll_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            coarse_poll_ms: 1000,
            fine_poll_ms: 100,
        }
    }
}

impl MonitorConfig {
    /// Load from [`DEFAULT_CONFIG_PATH`] and the environment.
    pub fn load() -> MonitorResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file path and the environment.
    ///
    /// A missing file is not an error; defaults and environment still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> MonitorResult<Self> {
        Self::figment(path.as_ref()).extract().map_err(MonitorError::from)
    }

    /// The provider stack used by [`load_from`](Self::load_from).
    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(MonitorConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> MonitorResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(MonitorError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.to_lowercase().as_str()) {
            return Err(MonitorError::Configuration(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            )));
        }

        let acq = &self.acquisition;
        if !(50..=2000).contains(&acq.sample_period_ms) {
            return Err(MonitorError::Configuration(format!(
                "Sample period must be between 50 and 2000 ms (got {})",
                acq.sample_period_ms
            )));
        }
        for (name, value) in [
            ("manual_range_farads", acq.manual_range_farads),
            ("manual_range_ohms", acq.manual_range_ohms),
            ("nplc", acq.nplc),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(MonitorError::Configuration(format!(
                    "{name} must be a positive number (got {value})"
                )));
            }
        }
        if acq.stop_timeout_ms == 0 {
            return Err(MonitorError::Configuration(
                "stop_timeout_ms must be greater than 0".into(),
            ));
        }

        if !(0.0..=1.0).contains(&self.synthetic.noise_level) {
            return Err(MonitorError::Configuration(format!(
                "Synthetic noise_level must be between 0 and 1 (got {})",
                self.synthetic.noise_level
            )));
        }

        if self.instrument.kind == InstrumentKind::Keithley2110
            && self.instrument.resource.as_deref().map_or(true, str::is_empty)
        {
            return Err(MonitorError::Configuration(
                "instrument.resource is required for the keithley2110 driver".into(),
            ));
        }

        if self.scheduler.coarse_poll_ms == 0 || self.scheduler.fine_poll_ms == 0 {
            return Err(MonitorError::Configuration(
                "Scheduler poll periods must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    /// Controller settings derived from this configuration.
    pub fn controller_settings(&self) -> ControllerSettings {
        let acq = &self.acquisition;
        let manual_range = match acq.mode {
            MeasurementMode::Capacitance => acq.manual_range_farads,
            MeasurementMode::Resistance => acq.manual_range_ohms,
        };
        ControllerSettings {
            acquisition: AcquisitionSettings {
                mode: acq.mode,
                sample_period: Duration::from_millis(acq.sample_period_ms),
                autorange: acq.autorange,
                manual_range,
                nplc: acq.nplc,
                resource: self.instrument.resource.clone(),
                idle_quantum: Duration::from_millis(acq.idle_wait_ms.max(1)),
                ..AcquisitionSettings::default()
            },
            buffer_capacity: DEFAULT_CAPACITY,
            stop_timeout: Duration::from_millis(acq.stop_timeout_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn defaults_are_valid() {
        let config = MonitorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.acquisition.sample_period_ms, 100);
        assert_eq!(config.scheduler.fine_poll_ms, 100);
    }

    #[test]
    fn file_and_environment_are_layered() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "capmon.toml",
                r#"
                [acquisition]
                mode = "resistance"
                sample_period_ms = 250
                autorange = false

                [instrument]
                kind = "keithley2110"
                resource = "TCPIP0::10.0.0.5::5025::SOCKET"
                "#,
            )?;
            jail.set_env("CAPMON_ACQUISITION__SAMPLE_PERIOD_MS", "500");

            let config = MonitorConfig::load_from("capmon.toml").map_err(|e| e.to_string())?;
            assert_eq!(config.acquisition.mode, MeasurementMode::Resistance);
            assert_eq!(config.acquisition.sample_period_ms, 500);
            assert_eq!(config.instrument.kind, InstrumentKind::Keithley2110);
            // Untouched sections keep their defaults.
            assert_eq!(config.scheduler.coarse_poll_ms, 1000);
            assert!(config.validate().is_ok());

            let settings = config.controller_settings();
            assert_eq!(settings.acquisition.manual_range, 1e4);
            assert!(!settings.acquisition.autorange);
            Ok(())
        });
    }

    #[test]
    fn missing_file_uses_defaults() {
        let config = MonitorConfig::load_from("does/not/exist.toml").unwrap();
        assert_eq!(config, MonitorConfig::default());
    }

    #[test]
    fn rejects_out_of_range_values() {
        let mut config = MonitorConfig::default();
        config.acquisition.sample_period_ms = 49;
        assert!(matches!(config.validate(), Err(MonitorError::Configuration(_))));

        let mut config = MonitorConfig::default();
        config.acquisition.sample_period_ms = 2000;
        assert!(config.validate().is_ok());

        let mut config = MonitorConfig::default();
        config.instrument.kind = InstrumentKind::Keithley2110;
        assert!(config.validate().is_err());

        let mut config = MonitorConfig::default();
        config.application.log_level = "verbose".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn tilde_export_dir_expands_to_home() {
        let storage = StorageConfig {
            export_dir: PathBuf::from("~/capmon"),
        };
        if let Some(home) = dirs::home_dir() {
            assert_eq!(storage.resolved_export_dir(), home.join("capmon"));
        }
        assert_eq!(
            StorageConfig::default().resolved_export_dir(),
            PathBuf::from("measurements")
        );
    }
}
