//! Keithley 2110 Digital Multimeter Driver
//!
//! Reference: Keithley 2110 5½-Digit DMM Reference Manual
//!
//! Protocol Overview:
//! - Format: SCPI
//! - Terminator: LF (\n) both directions
//! - Function select: `:FUNC "CAP"` / `:FUNC "RES"`
//! - Ranging: `:<FUNC>:RANG:AUTO ON|OFF`, `:<FUNC>:RANG <value>`
//! - Query: `:READ?` (one triggered reading)
//!
//! # Important Notes
//!
//! - Overload readings come back as `9.9E37`; they are reported as protocol errors so
//!   the acquisition loop counts them as soft errors instead of buffering them.
//! - `:SYST:LOC` is sent on close to hand the front panel back to the user.
//!
//! # Example Usage
//!
//! ```no_run
//! use capmon::hardware::keithley2110::Keithley2110;
//! use capmon::hardware::port::InstrumentPort;
//! use capmon::measurement::MeasurementMode;
//!
//! let mut dmm = Keithley2110::new();
//! dmm.open(Some("TCPIP0::192.168.0.7::5025::SOCKET"))?;
//! dmm.initialize(MeasurementMode::Capacitance)?;
//! let farads = dmm.read(MeasurementMode::Capacitance)?;
//! println!("C = {:.3e} F", farads);
//! dmm.close()?;
//! # Ok::<(), capmon::hardware::port::InstrumentError>(())
//! ```

use crate::hardware::port::{InstrumentError, InstrumentPort};
use crate::hardware::transport::{self, ScpiTransport};
use crate::measurement::MeasurementMode;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Readings at or above this magnitude are the DMM's overload marker.
const OVERLOAD_THRESHOLD: f64 = 9.9e37;

/// Driver for the Keithley 2110 DMM.
pub struct Keithley2110 {
    transport: Option<Box<dyn ScpiTransport>>,
    resource: Option<String>,
    timeout: Duration,
    mode: MeasurementMode,
}

impl Keithley2110 {
    /// Create an unconnected driver with a 5 s I/O timeout.
    pub fn new() -> Self {
        Self {
            transport: None,
            resource: None,
            timeout: Duration::from_secs(5),
            mode: MeasurementMode::Capacitance,
        }
    }

    /// Resource used when `open` is called without one.
    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    /// Set the I/O timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Create a driver over an already-connected transport.
    pub fn with_transport(transport: Box<dyn ScpiTransport>, resource: impl Into<String>) -> Self {
        Self {
            transport: Some(transport),
            resource: Some(resource.into()),
            timeout: Duration::from_secs(5),
            mode: MeasurementMode::Capacitance,
        }
    }

    fn link(&mut self) -> Result<&mut Box<dyn ScpiTransport>, InstrumentError> {
        self.transport.as_mut().ok_or(InstrumentError::NotConnected)
    }

    fn send(&mut self, command: &str) -> Result<(), InstrumentError> {
        self.link()?.command(command)
    }

    fn function_prefix(mode: MeasurementMode) -> &'static str {
        match mode {
            MeasurementMode::Capacitance => "CAP",
            MeasurementMode::Resistance => "RES",
        }
    }
}

impl Default for Keithley2110 {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse a `:READ?` response.
///
/// Accepts plain or comma-separated replies and takes the first field.
pub fn parse_reading(response: &str) -> Result<f64, InstrumentError> {
    let field = response.split(',').next().unwrap_or_default().trim();
    let value: f64 = field.parse().map_err(|_| {
        InstrumentError::ProtocolError(format!("unparsable reading '{response}'"))
    })?;
    if !value.is_finite() || value.abs() >= OVERLOAD_THRESHOLD {
        return Err(InstrumentError::ProtocolError(format!(
            "reading overload ({field})"
        )));
    }
    Ok(value)
}

impl InstrumentPort for Keithley2110 {
    fn open(&mut self, resource: Option<&str>) -> Result<(), InstrumentError> {
        if self.transport.is_none() {
            let resource = resource
                .map(str::to_string)
                .or_else(|| self.resource.clone())
                .ok_or_else(|| {
                    InstrumentError::ConnectionLost("no bus resource configured".into())
                })?;
            self.transport = Some(transport::connect(&resource, self.timeout)?);
            self.resource = Some(resource);
        }

        if let Err(err) = self.send("*CLS") {
            self.transport = None;
            return Err(err);
        }
        info!(resource = ?self.resource, "Connected to Keithley 2110");
        Ok(())
    }

    fn close(&mut self) -> Result<(), InstrumentError> {
        let Some(mut link) = self.transport.take() else {
            return Ok(());
        };
        let result = link.command(":SYST:LOC");
        if let Err(ref err) = result {
            warn!(error = %err, "Failed to return Keithley 2110 to local control");
        }
        info!("Keithley 2110 connection closed");
        result
    }

    fn initialize(&mut self, mode: MeasurementMode) -> Result<(), InstrumentError> {
        let prefix = Self::function_prefix(mode);
        self.send(":SYST:REM")?;
        self.send(&format!(":FUNC \"{prefix}\""))?;
        self.send(&format!(":{prefix}:RANG:AUTO ON"))?;
        self.send("*CLS")?;
        self.mode = mode;
        info!(%mode, "Keithley 2110 initialized");
        Ok(())
    }

    fn set_autorange(&mut self, enabled: bool) -> Result<(), InstrumentError> {
        let prefix = Self::function_prefix(self.mode);
        let state = if enabled { "ON" } else { "OFF" };
        self.send(&format!(":{prefix}:RANG:AUTO {state}"))?;
        debug!(enabled, "Autorange set");
        Ok(())
    }

    fn set_manual_range(
        &mut self,
        mode: MeasurementMode,
        value: f64,
    ) -> Result<(), InstrumentError> {
        let prefix = Self::function_prefix(mode);
        self.send(&format!(":{prefix}:RANG {value:.12e}"))?;
        debug!(%mode, range = value, "Manual range set");
        Ok(())
    }

    fn set_integration_time(&mut self, nplc: f64) -> Result<(), InstrumentError> {
        let prefix = Self::function_prefix(self.mode);
        self.send(&format!(":SENS:{prefix}:NPLC {nplc}"))?;
        debug!(nplc, "NPLC set");
        Ok(())
    }

    fn read(&mut self, _mode: MeasurementMode) -> Result<f64, InstrumentError> {
        let response = self.link()?.query(":READ?")?;
        parse_reading(&response)
    }

    fn identify(&mut self) -> Result<String, InstrumentError> {
        self.link()?.query("*IDN?")
    }

    fn is_connected(&self) -> bool {
        self.transport.is_some()
    }

    fn instrument_type(&self) -> &str {
        "keithley2110"
    }

    fn resource(&self) -> Option<&str> {
        self.resource.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct ScriptedTransport {
        sent: Arc<Mutex<Vec<String>>>,
        replies: Arc<Mutex<VecDeque<String>>>,
    }

    impl ScpiTransport for ScriptedTransport {
        fn command(&mut self, command: &str) -> Result<(), InstrumentError> {
            self.sent.lock().push(command.to_string());
            Ok(())
        }

        fn query(&mut self, command: &str) -> Result<String, InstrumentError> {
            self.command(command)?;
            self.replies
                .lock()
                .pop_front()
                .ok_or_else(|| InstrumentError::Timeout("no scripted reply".into()))
        }
    }

    #[test]
    fn parses_readings() {
        assert_eq!(parse_reading("+1.23456789E-09").unwrap(), 1.23456789e-9);
        assert_eq!(parse_reading(" 4.7E+03,extra").unwrap(), 4.7e3);
        assert!(matches!(
            parse_reading("+9.90000000E+37"),
            Err(InstrumentError::ProtocolError(_))
        ));
        assert!(matches!(
            parse_reading("garbage"),
            Err(InstrumentError::ProtocolError(_))
        ));
    }

    #[test]
    fn resistance_session_sends_expected_commands() {
        let transport = ScriptedTransport::default();
        transport.replies.lock().push_back("+1.0E+04".into());
        let sent = transport.sent.clone();

        let mut dmm = Keithley2110::with_transport(Box::new(transport), "TCPIP0::dmm::SOCKET");
        dmm.open(None).unwrap();
        dmm.initialize(MeasurementMode::Resistance).unwrap();
        dmm.set_autorange(false).unwrap();
        dmm.set_manual_range(MeasurementMode::Resistance, 1e4).unwrap();
        dmm.set_integration_time(1.0).unwrap();
        assert_eq!(dmm.read(MeasurementMode::Resistance).unwrap(), 1e4);
        dmm.close().unwrap();
        dmm.close().unwrap();

        let sent = sent.lock().clone();
        assert_eq!(
            sent,
            vec![
                "*CLS",
                ":SYST:REM",
                ":FUNC \"RES\"",
                ":RES:RANG:AUTO ON",
                "*CLS",
                ":RES:RANG:AUTO OFF",
                ":RES:RANG 1.000000000000e4",
                ":SENS:RES:NPLC 1",
                ":READ?",
                ":SYST:LOC",
            ]
        );
        assert!(!dmm.is_connected());
    }

    #[test]
    fn operations_before_open_report_not_connected() {
        let mut dmm = Keithley2110::new();
        assert_eq!(
            dmm.read(MeasurementMode::Capacitance),
            Err(InstrumentError::NotConnected)
        );
        assert!(matches!(
            dmm.open(None),
            Err(InstrumentError::ConnectionLost(_))
        ));
        assert!(dmm.close().is_ok());
    }
}
