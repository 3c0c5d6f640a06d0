//! # Capacitance Monitor Core Library
//!
//! Library behind the `capmon` CLI: continuous capacitance or resistance acquisition
//! from a bench multimeter, a bounded live buffer, CSV persistence with metadata
//! headers, and timed control (delayed stops and multi-step sequences) exposed through
//! a uniform tool-call surface.
//!
//! ## Crate Structure
//!
//! - **`hardware`**: The [`InstrumentPort`](hardware::InstrumentPort) trait plus the
//!   Keithley 2110 SCPI driver, its TCP/serial transports and a synthetic instrument.
//! - **`acquisition`**: One OS thread per session polling the instrument and sending
//!   session-tagged events back to the controller.
//! - **`controller`**: Measurement lifecycle, live buffer, metadata, save/load.
//! - **`scheduler`**: Delayed-stop tasks and timed sequences on monotonic clocks.
//! - **`tools`**: Uniform `{success, message, data}` actions over controller and scheduler.
//! - **`actor`** / **`messages`**: Task that owns the executor, and its command protocol.
//! - **`data`**: Ring buffer and CSV storage.
//! - **`config`**: Figment-layered TOML + environment configuration.
//! - **`error`**: The [`MonitorError`](error::MonitorError) type.
//! - **`measurement`** / **`metadata`**: Sample and session metadata types.
//! - **`tracing_init`**: Subscriber setup.

pub mod acquisition;
pub mod actor;
pub mod config;
pub mod controller;
pub mod data;
pub mod error;
pub mod hardware;
pub mod measurement;
pub mod messages;
pub mod metadata;
pub mod scheduler;
pub mod tools;
pub mod tracing_init;

pub use error::{MonitorError, MonitorResult};
