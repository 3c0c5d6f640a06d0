//! Instrument drivers.
//!
//! - [`port`]: the [`InstrumentPort`] capability trait and [`InstrumentError`]
//! - [`synthetic`]: seeded simulator with fault injection
//! - [`keithley2110`]: SCPI driver for the Keithley 2110 DMM
//! - [`transport`]: TCP and serial SCPI links
//!
//! A new instrument is built for every session, so callers hold an
//! [`InstrumentFactory`] rather than an instrument.

pub mod keithley2110;
pub mod port;
pub mod synthetic;
pub mod transport;

pub use port::{InstrumentError, InstrumentPort};

use crate::config::{InstrumentConfig, InstrumentKind, SyntheticConfig};
use keithley2110::Keithley2110;
use std::time::Duration;
use synthetic::SyntheticInstrument;

/// Creates a fresh instrument for each measurement session.
pub type InstrumentFactory = Box<dyn FnMut() -> Box<dyn InstrumentPort> + Send>;

/// Build one instrument from configuration.
pub fn build_instrument(
    instrument: &InstrumentConfig,
    synthetic: &SyntheticConfig,
) -> Box<dyn InstrumentPort> {
    match instrument.kind {
        InstrumentKind::Synthetic => Box::new(
            SyntheticInstrument::with_seed(synthetic.seed)
                .with_baseline_farads(synthetic.baseline_farads)
                .with_baseline_ohms(synthetic.baseline_ohms)
                .with_noise_level(synthetic.noise_level),
        ),
        InstrumentKind::Keithley2110 => {
            let mut dmm =
                Keithley2110::new().with_timeout(Duration::from_millis(instrument.timeout_ms));
            if let Some(resource) = &instrument.resource {
                dmm = dmm.with_resource(resource.clone());
            }
            Box::new(dmm)
        }
    }
}

/// Factory building instruments from a snapshot of the configuration.
pub fn factory_from_config(
    instrument: &InstrumentConfig,
    synthetic: &SyntheticConfig,
) -> InstrumentFactory {
    let instrument = instrument.clone();
    let synthetic = synthetic.clone();
    Box::new(move || build_instrument(&instrument, &synthetic))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_configured_driver() {
        let synthetic = SyntheticConfig::default();
        let mut factory = factory_from_config(&InstrumentConfig::default(), &synthetic);
        assert_eq!(factory().instrument_type(), "synthetic");

        let keithley = InstrumentConfig {
            kind: InstrumentKind::Keithley2110,
            resource: Some("TCPIP0::10.0.0.5::5025::SOCKET".into()),
            timeout_ms: 1000,
        };
        let dmm = build_instrument(&keithley, &synthetic);
        assert_eq!(dmm.instrument_type(), "keithley2110");
        assert_eq!(dmm.resource(), Some("TCPIP0::10.0.0.5::5025::SOCKET"));
        assert!(!dmm.is_connected());
    }
}
