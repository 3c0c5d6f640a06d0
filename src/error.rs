//! Custom error types for the application.
//!
//! This module defines the primary error type, `MonitorError`, used by the controller,
//! the scheduler and the storage layer. Using the `thiserror` crate, it provides a
//! centralized way to describe everything that can go wrong outside of the instrument
//! driver itself (driver failures live in [`InstrumentError`] and convert into
//! `MonitorError` with `?`).
//!
//! ## Error Hierarchy
//!
//! - **`Instrument`**: Wraps [`InstrumentError`] (connection, timeout, protocol). Read
//!   failures are normally recovered inside the acquisition loop and only surface here
//!   when a caller talks to the instrument directly.
//! - **`SequenceValidation`**: A malformed sequence step. The whole sequence is rejected
//!   before anything executes.
//! - **`Scheduling`**: A requested duration outside `(0 s, 86400 s]`.
//! - **`Buffer`**: Save/export attempted with no data or no session metadata.
//! - **`Storage`** / **`Csv`** / **`Io`**: Read/write failures and malformed files.
//! - **`AlreadyMeasuring`** / **`NotMeasuring`**: Lifecycle preconditions.
//! - **`Config`** / **`Configuration`**: Parse errors from `figment` and semantic
//!   validation errors respectively.

use crate::hardware::port::InstrumentError;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type MonitorResult<T> = std::result::Result<T, MonitorError>;

/// Application error type.
#[derive(Error, Debug)]
pub enum MonitorError {
    /// Driver failure outside the acquisition loop
    #[error("Instrument error: {0}")]
    Instrument(#[from] InstrumentError),

    /// Malformed sequence step; nothing was scheduled
    #[error("Invalid sequence step {index}: {reason}")]
    SequenceValidation {
        /// Zero-based step index
        index: usize,
        /// What is wrong with the step
        reason: String,
    },

    /// Duration outside `(0 s, 86400 s]`
    #[error("Scheduling error: {0}")]
    Scheduling(String),

    /// Nothing to save or export
    #[error("{0}")]
    Buffer(String),

    /// Read/write failure or malformed file
    #[error("Storage error: {0}")]
    Storage(String),

    /// CSV encoding or decoding failure
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Filesystem failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// `start` while a session is running
    #[error("Measurement is already running")]
    AlreadyMeasuring,

    /// `stop` while idle
    #[error("No measurement is currently running")]
    NotMeasuring,

    /// Configuration could not be parsed
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration parsed but failed validation
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Actor task has exited
    #[error("Monitor actor is not running")]
    ActorUnavailable,
}

impl From<figment::Error> for MonitorError {
    fn from(value: figment::Error) -> Self {
        MonitorError::Config(Box::new(value))
    }
}

impl MonitorError {
    /// Whether the error was caused by the caller's input rather than by the system.
    ///
    /// Validation errors are guaranteed to have had no side effects.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            MonitorError::SequenceValidation { .. }
                | MonitorError::Scheduling(_)
                | MonitorError::Configuration(_)
        )
    }

    /// Whether the error is a lifecycle precondition that a tool call reports as a
    /// failed result: start while measuring, stop while idle, export with nothing to save.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            MonitorError::AlreadyMeasuring | MonitorError::NotMeasuring | MonitorError::Buffer(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instrument_error_converts_with_question_mark() {
        fn read() -> MonitorResult<f64> {
            Err(InstrumentError::Timeout("no reply".into()))?
        }

        let err = read().unwrap_err();
        assert!(matches!(err, MonitorError::Instrument(InstrumentError::Timeout(_))));
        assert_eq!(err.to_string(), "Instrument error: Timeout: no reply");
    }

    #[test]
    fn validation_errors_are_flagged() {
        let err = MonitorError::SequenceValidation {
            index: 2,
            reason: "missing 'action'".into(),
        };
        assert!(err.is_validation());
        assert_eq!(err.to_string(), "Invalid sequence step 2: missing 'action'");
        assert!(!MonitorError::AlreadyMeasuring.is_validation());
    }

    #[test]
    fn lifecycle_errors_are_preconditions() {
        assert!(MonitorError::AlreadyMeasuring.is_precondition());
        assert!(MonitorError::NotMeasuring.is_precondition());
        assert!(MonitorError::Buffer("No data to export.".into()).is_precondition());
        assert!(!MonitorError::Storage("disk full".into()).is_precondition());
        assert!(!MonitorError::from(InstrumentError::Timeout("no reply".into())).is_precondition());
    }
}
