//! Synthetic Instrument
//!
//! Provides a simulated multimeter for running the monitor without hardware.
//! The generated signal is deterministic for a given seed so that tests and demo
//! runs are reproducible.
//!
//! # Signal Model
//!
//! ```text
//! value = baseline
//!       + 0.1·baseline·(1 − e^(−t/300 s))          slow drift toward 1.1 × baseline
//!       + Σ step injections whose offset has elapsed
//!       + N(0, σ = noise_level · signal / 3)         3-sigma noise
//!       + 0.005·signal·(1 + t/600)·(1 + 0.2·(t mod 30 s)/30)   slow periodic term
//! value = max(value, 1e-15)
//! ```
//!
//! # Fault Injection
//!
//! The instrument is moved into the acquisition thread, so faults are injected through a
//! cloned [`FaultInjector`] handle rather than through the instrument itself.

use crate::hardware::port::{InstrumentError, InstrumentPort};
use crate::measurement::MeasurementMode;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Default capacitance baseline (1 nF).
pub const DEFAULT_BASELINE_FARADS: f64 = 1e-9;

/// Default resistance baseline (10 kΩ).
pub const DEFAULT_BASELINE_OHMS: f64 = 1e4;

/// Default RNG seed.
pub const DEFAULT_SEED: u64 = 42;

/// Drift time constant in seconds.
const DRIFT_TIME_CONSTANT_S: f64 = 300.0;

/// Lower bound keeping the signal physically positive.
const SIGNAL_FLOOR: f64 = 1e-15;

/// Identification string returned by `identify`.
const IDENTIFICATION: &str = "Synthetic Instrument,Capacitance Monitor,1.0,Simulated";

// =============================================================================
// FaultInjector - shared fault plan
// =============================================================================

#[derive(Debug, Default)]
struct FaultPlan {
    failing_reads: u32,
    read_error: Option<InstrumentError>,
    open_error: Option<InstrumentError>,
    close_error: Option<InstrumentError>,
    close_delay: Option<Duration>,
    connection_lost: bool,
    reads_attempted: u64,
    opens: u32,
    closes: u32,
}

/// Handle for injecting faults into a [`SyntheticInstrument`] from another thread.
#[derive(Debug, Clone, Default)]
pub struct FaultInjector {
    plan: Arc<Mutex<FaultPlan>>,
}

impl FaultInjector {
    /// Make the next `count` reads fail with `error`.
    pub fn fail_next_reads(&self, count: u32, error: InstrumentError) {
        let mut plan = self.plan.lock();
        plan.failing_reads = count;
        plan.read_error = Some(error);
    }

    /// Make every read fail with `error` until [`clear`](Self::clear) is called.
    pub fn fail_all_reads(&self, error: InstrumentError) {
        self.fail_next_reads(u32::MAX, error);
    }

    /// Make the next `open` fail.
    pub fn fail_open(&self, error: InstrumentError) {
        self.plan.lock().open_error = Some(error);
    }

    /// Make `close` fail (it still marks the instrument disconnected).
    pub fn fail_close(&self, error: InstrumentError) {
        self.plan.lock().close_error = Some(error);
    }

    /// Make `close` block for `delay` before returning.
    pub fn delay_close(&self, delay: Duration) {
        self.plan.lock().close_delay = Some(delay);
    }

    /// Simulate the link dropping: every later operation fails with `ConnectionLost`.
    pub fn simulate_connection_loss(&self) {
        self.plan.lock().connection_lost = true;
    }

    /// Remove every pending fault.
    pub fn clear(&self) {
        let mut plan = self.plan.lock();
        plan.failing_reads = 0;
        plan.read_error = None;
        plan.open_error = None;
        plan.close_error = None;
        plan.close_delay = None;
        plan.connection_lost = false;
    }

    /// Number of `read` calls made so far, failed or not.
    pub fn reads_attempted(&self) -> u64 {
        self.plan.lock().reads_attempted
    }

    /// Number of `open` calls made so far.
    pub fn opens(&self) -> u32 {
        self.plan.lock().opens
    }

    /// Number of `close` calls made so far.
    pub fn closes(&self) -> u32 {
        self.plan.lock().closes
    }
}

// =============================================================================
// SyntheticInstrument
// =============================================================================

/// Simulated capacitance/resistance meter.
///
/// # Example
///
/// ```rust
/// use capmon::hardware::port::InstrumentPort;
/// use capmon::hardware::synthetic::SyntheticInstrument;
/// use capmon::measurement::MeasurementMode;
///
/// let mut meter = SyntheticInstrument::new();
/// meter.open(None).unwrap();
/// meter.initialize(MeasurementMode::Capacitance).unwrap();
/// let farads = meter.read(MeasurementMode::Capacitance).unwrap();
/// assert!(farads > 0.0);
/// ```
pub struct SyntheticInstrument {
    baseline_farads: f64,
    baseline_ohms: f64,
    noise_level: f64,
    rng: StdRng,
    connected: bool,
    opened_at: Option<Instant>,
    mode: MeasurementMode,
    autorange: bool,
    manual_range: Option<f64>,
    nplc: f64,
    /// (offset seconds, step size in SI units)
    step_changes: Vec<(f64, f64)>,
    faults: FaultInjector,
}

impl SyntheticInstrument {
    /// Create a synthetic instrument with default baselines, 10% noise and seed 42.
    pub fn new() -> Self {
        Self::with_seed(DEFAULT_SEED)
    }

    /// Create a synthetic instrument with a specific RNG seed.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            baseline_farads: DEFAULT_BASELINE_FARADS,
            baseline_ohms: DEFAULT_BASELINE_OHMS,
            noise_level: 0.1,
            rng: StdRng::seed_from_u64(seed),
            connected: false,
            opened_at: None,
            mode: MeasurementMode::Capacitance,
            autorange: true,
            manual_range: None,
            nplc: 1.0,
            step_changes: Vec::new(),
            faults: FaultInjector::default(),
        }
    }

    /// Set the capacitance baseline in farads.
    pub fn with_baseline_farads(mut self, farads: f64) -> Self {
        self.baseline_farads = farads;
        self
    }

    /// Set the resistance baseline in ohms.
    pub fn with_baseline_ohms(mut self, ohms: f64) -> Self {
        self.baseline_ohms = ohms;
        self
    }

    /// Set the noise level as a fraction of the signal, clamped to `[0, 1]`.
    pub fn with_noise_level(mut self, noise_level: f64) -> Self {
        self.set_noise_level(noise_level);
        self
    }

    /// Set the noise level as a fraction of the signal, clamped to `[0, 1]`.
    pub fn set_noise_level(&mut self, noise_level: f64) {
        self.noise_level = noise_level.clamp(0.0, 1.0);
        debug!(noise_level = self.noise_level, "Synthetic noise level set");
    }

    /// Share an existing fault plan, e.g. one held by a test across several sessions.
    pub fn with_fault_injector(mut self, faults: FaultInjector) -> Self {
        self.faults = faults;
        self
    }

    /// Handle for injecting faults after the instrument has been moved to a worker.
    pub fn fault_injector(&self) -> FaultInjector {
        self.faults.clone()
    }

    /// Add a step change of `step_size` (SI units) at `offset_seconds` after open.
    pub fn add_step_change(&mut self, offset_seconds: f64, step_size: f64) {
        self.step_changes.push((offset_seconds, step_size));
        debug!(offset_seconds, step_size, "Added synthetic step change");
    }

    /// Remove all step changes.
    pub fn clear_step_changes(&mut self) {
        self.step_changes.clear();
    }

    /// Currently configured integration time.
    pub fn nplc(&self) -> f64 {
        self.nplc
    }

    /// Currently configured manual range (None while autoranging).
    pub fn manual_range(&self) -> Option<f64> {
        if self.autorange {
            None
        } else {
            self.manual_range
        }
    }

    fn baseline(&self, mode: MeasurementMode) -> f64 {
        match mode {
            MeasurementMode::Capacitance => self.baseline_farads,
            MeasurementMode::Resistance => self.baseline_ohms,
        }
    }

    /// Evaluate the signal model `elapsed_s` seconds after open.
    ///
    /// Advances the RNG, so consecutive calls with the same time differ by noise only.
    pub fn signal_at(&mut self, mode: MeasurementMode, elapsed_s: f64) -> f64 {
        let baseline = self.baseline(mode);
        let mut signal = baseline;

        signal += 0.1 * baseline * (1.0 - (-elapsed_s / DRIFT_TIME_CONSTANT_S).exp());

        signal += self
            .step_changes
            .iter()
            .filter(|(offset, _)| elapsed_s >= *offset)
            .map(|(_, size)| size)
            .sum::<f64>();

        let sigma = (signal * self.noise_level / 3.0).abs();
        if sigma > 0.0 {
            if let Ok(noise) = Normal::new(0.0, sigma) {
                signal += noise.sample(&mut self.rng);
            }
        }

        let periodic = 0.05
            * signal
            * (1.0 + 0.1 * elapsed_s / 60.0)
            * (1.0 + 0.2 * (elapsed_s % 30.0) / 30.0);
        signal += periodic * 0.1;

        signal.max(SIGNAL_FLOOR)
    }

    fn check_link(&self) -> Result<(), InstrumentError> {
        if self.faults.plan.lock().connection_lost {
            return Err(InstrumentError::ConnectionLost(
                "synthetic link dropped".into(),
            ));
        }
        if !self.connected {
            return Err(InstrumentError::NotConnected);
        }
        Ok(())
    }
}

impl Default for SyntheticInstrument {
    fn default() -> Self {
        Self::new()
    }
}

impl InstrumentPort for SyntheticInstrument {
    fn open(&mut self, _resource: Option<&str>) -> Result<(), InstrumentError> {
        {
            let mut plan = self.faults.plan.lock();
            plan.opens += 1;
            if let Some(err) = plan.open_error.take() {
                warn!(error = %err, "Synthetic open failure injected");
                return Err(err);
            }
        }
        if self.connected {
            return Ok(());
        }
        self.connected = true;
        self.opened_at = Some(Instant::now());
        info!("Synthetic instrument opened");
        Ok(())
    }

    fn close(&mut self) -> Result<(), InstrumentError> {
        let (delay, close_error) = {
            let mut plan = self.faults.plan.lock();
            plan.closes += 1;
            (plan.close_delay, plan.close_error.take())
        };
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        let was_connected = std::mem::replace(&mut self.connected, false);
        if was_connected {
            info!("Synthetic instrument closed");
        }
        match close_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn initialize(&mut self, mode: MeasurementMode) -> Result<(), InstrumentError> {
        self.check_link()?;
        self.mode = mode;
        info!(%mode, "Synthetic instrument initialized");
        Ok(())
    }

    fn set_autorange(&mut self, enabled: bool) -> Result<(), InstrumentError> {
        self.check_link()?;
        self.autorange = enabled;
        debug!(enabled, "Synthetic autorange set");
        Ok(())
    }

    fn set_manual_range(
        &mut self,
        mode: MeasurementMode,
        value: f64,
    ) -> Result<(), InstrumentError> {
        self.check_link()?;
        self.manual_range = Some(value);
        debug!(%mode, range = value, "Synthetic manual range set");
        Ok(())
    }

    fn set_integration_time(&mut self, nplc: f64) -> Result<(), InstrumentError> {
        self.check_link()?;
        self.nplc = nplc;
        debug!(nplc, "Synthetic NPLC set");
        Ok(())
    }

    fn read(&mut self, mode: MeasurementMode) -> Result<f64, InstrumentError> {
        {
            let mut plan = self.faults.plan.lock();
            plan.reads_attempted += 1;
            if plan.failing_reads > 0 {
                if let Some(err) = plan.read_error.clone() {
                    if plan.failing_reads != u32::MAX {
                        plan.failing_reads -= 1;
                    }
                    return Err(err);
                }
            }
        }
        self.check_link()?;

        let elapsed = self
            .opened_at
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or_default();
        Ok(self.signal_at(mode, elapsed))
    }

    fn identify(&mut self) -> Result<String, InstrumentError> {
        Ok(IDENTIFICATION.to_string())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn instrument_type(&self) -> &str {
        "synthetic"
    }
}
