//! Instrument Capability Interface
//!
//! This module defines [`InstrumentPort`], the capability set the acquisition worker
//! needs from a multimeter-style instrument, and [`InstrumentError`], the failure
//! taxonomy every driver maps its transport errors into.
//!
//! # Design
//!
//! The port is deliberately **blocking**: it is owned by exactly one acquisition
//! thread for the lifetime of a session, and that thread is the only context allowed to
//! block on instrument I/O. Drivers therefore take `&mut self` and need only be `Send`.
//!
//! ```rust,ignore
//! fn one_reading(port: &mut dyn InstrumentPort) -> Result<f64, InstrumentError> {
//!     port.open(None)?;
//!     port.initialize(MeasurementMode::Capacitance)?;
//!     port.set_autorange(true)?;
//!     let value = port.read(MeasurementMode::Capacitance)?;
//!     port.close()?;
//!     Ok(value)
//! }
//! ```

use crate::measurement::MeasurementMode;
use thiserror::Error;

/// Failures reported by instrument drivers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InstrumentError {
    /// The link to the instrument went away mid-session.
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// The instrument did not answer in time.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The instrument answered with something that could not be interpreted.
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// An operation that needs an open session was called before `open`.
    #[error("Instrument not connected")]
    NotConnected,
}

impl From<std::io::Error> for InstrumentError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::TimedOut | ErrorKind::WouldBlock => InstrumentError::Timeout(err.to_string()),
            ErrorKind::InvalidData | ErrorKind::InvalidInput | ErrorKind::UnexpectedEof => {
                InstrumentError::ProtocolError(err.to_string())
            }
            _ => InstrumentError::ConnectionLost(err.to_string()),
        }
    }
}

/// Capability: single-value measurement of capacitance or resistance.
///
/// # Contract
/// - `open` must be called before any other operation except `close`,
///   `identify` on some drivers, and `is_connected`.
/// - Calling `open` on an already-open port re-uses the existing session.
/// - `close` is idempotent and never fails on an already-closed port.
/// - `read` returns the value in SI units of `mode` (farads or ohms).
pub trait InstrumentPort: Send {
    /// Open a session.
    ///
    /// # Arguments
    /// * `resource` - Bus resource identifier; `None` lets the driver use its
    ///   configured default (or nothing, for synthetic instruments)
    fn open(&mut self, resource: Option<&str>) -> Result<(), InstrumentError>;

    /// Close the session. Idempotent.
    fn close(&mut self) -> Result<(), InstrumentError>;

    /// Switch the instrument's measurement function.
    fn initialize(&mut self, mode: MeasurementMode) -> Result<(), InstrumentError>;

    /// Enable or disable autorange.
    fn set_autorange(&mut self, enabled: bool) -> Result<(), InstrumentError>;

    /// Select a fixed range, in SI units of `mode`.
    fn set_manual_range(&mut self, mode: MeasurementMode, value: f64)
        -> Result<(), InstrumentError>;

    /// Set the integration time in power-line cycles.
    fn set_integration_time(&mut self, nplc: f64) -> Result<(), InstrumentError>;

    /// Take one reading.
    fn read(&mut self, mode: MeasurementMode) -> Result<f64, InstrumentError>;

    /// Instrument identification string (`*IDN?` style).
    fn identify(&mut self) -> Result<String, InstrumentError>;

    /// Whether a session is currently open.
    fn is_connected(&self) -> bool;

    /// Short type tag recorded in session metadata.
    fn instrument_type(&self) -> &str;

    /// Bus resource identifier of the open (or configured) session.
    fn resource(&self) -> Option<&str> {
        None
    }
}

impl<T: InstrumentPort + ?Sized> InstrumentPort for Box<T> {
    fn open(&mut self, resource: Option<&str>) -> Result<(), InstrumentError> {
        (**self).open(resource)
    }

    fn close(&mut self) -> Result<(), InstrumentError> {
        (**self).close()
    }

    fn initialize(&mut self, mode: MeasurementMode) -> Result<(), InstrumentError> {
        (**self).initialize(mode)
    }

    fn set_autorange(&mut self, enabled: bool) -> Result<(), InstrumentError> {
        (**self).set_autorange(enabled)
    }

    fn set_manual_range(
        &mut self,
        mode: MeasurementMode,
        value: f64,
    ) -> Result<(), InstrumentError> {
        (**self).set_manual_range(mode, value)
    }

    fn set_integration_time(&mut self, nplc: f64) -> Result<(), InstrumentError> {
        (**self).set_integration_time(nplc)
    }

    fn read(&mut self, mode: MeasurementMode) -> Result<f64, InstrumentError> {
        (**self).read(mode)
    }

    fn identify(&mut self) -> Result<String, InstrumentError> {
        (**self).identify()
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }

    fn instrument_type(&self) -> &str {
        (**self).instrument_type()
    }

    fn resource(&self) -> Option<&str> {
        (**self).resource()
    }
}
