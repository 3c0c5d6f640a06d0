//! Background acquisition worker.
//!
//! Each measurement session owns exactly one [`AcquisitionWorker`], which owns exactly one
//! [`InstrumentPort`]. The worker runs a timed sampling loop on a dedicated OS thread so
//! that blocking instrument I/O never stalls the async side of the application.
//!
//! # Architecture
//!
//! ```text
//!   ┌──────────────────────────┐        unbounded mpsc         ┌──────────────────┐
//!   │ capmon-acquisition thread│ ───── SessionEvent ─────────▶ │  MonitorActor    │
//!   │  open → configure → loop │                               │  (controller)    │
//!   └────────────┬─────────────┘                               └────────┬─────────┘
//!                │ AtomicBool running ◀──────── request_stop ───────────┘
//!                │ AtomicU32 soft_errors ─────── soft_error_count ─────▶
//!                └─ oneshot done ─────────────── stop(timeout) ────────▶
//! ```
//!
//! # Loop Semantics
//!
//! - A reading is taken when at least one sample period has elapsed since the previous
//!   successful reading. The deadline check, not the idle sleep, sets the cadence.
//! - A failed reading increments the soft-error counter, emits [`WorkerEvent::Error`] and
//!   backs off before retrying. Reaching the ceiling faults the session.
//! - Between iterations the thread sleeps for the shorter of the idle quantum and the
//!   time left until the next deadline.
//!
//! Events are sent on an unbounded channel so the acquisition thread never waits on a
//! slow consumer.

use crate::error::MonitorResult;
use crate::hardware::port::InstrumentPort;
use crate::measurement::{MeasurementMode, SampleValue};
use chrono::{DateTime, Local};
use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Soft-error ceiling after which a session is faulted.
pub const MAX_SOFT_ERRORS: u32 = 100;

/// Back-off after a failed reading.
pub const READ_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Upper bound on a single idle sleep.
pub const IDLE_QUANTUM: Duration = Duration::from_millis(1);

// =============================================================================
// Settings, state and events
// =============================================================================

/// Per-session acquisition parameters.
#[derive(Debug, Clone)]
pub struct AcquisitionSettings {
    /// Quantity to measure.
    pub mode: MeasurementMode,
    /// Target interval between readings.
    pub sample_period: Duration,
    /// Let the instrument pick its range.
    pub autorange: bool,
    /// Fixed range in SI units of `mode`, used when `autorange` is off.
    pub manual_range: f64,
    /// Integration time in power-line cycles.
    pub nplc: f64,
    /// Bus resource passed to `open`.
    pub resource: Option<String>,
    /// Upper bound on a single idle sleep.
    pub idle_quantum: Duration,
    /// Sleep after a failed reading.
    pub error_backoff: Duration,
    /// Failed readings tolerated before the session faults.
    pub max_soft_errors: u32,
}

impl Default for AcquisitionSettings {
    fn default() -> Self {
        Self {
            mode: MeasurementMode::Capacitance,
            sample_period: Duration::from_millis(100),
            autorange: true,
            manual_range: 1e-9,
            nplc: 1.0,
            resource: None,
            idle_quantum: IDLE_QUANTUM,
            error_backoff: READ_ERROR_BACKOFF,
            max_soft_errors: MAX_SOFT_ERRORS,
        }
    }
}

/// Lifecycle of an acquisition worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Constructed, thread not yet running
    Idle,
    /// Opening and configuring the instrument
    Opening,
    /// Sampling
    Running,
    /// Stop requested, leaving the loop
    Stopping,
    /// Terminated by an unrecoverable error
    Faulted,
    /// Instrument closed, thread finished
    Closed,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerState::Idle => write!(f, "Idle"),
            WorkerState::Opening => write!(f, "Opening"),
            WorkerState::Running => write!(f, "Running"),
            WorkerState::Stopping => write!(f, "Stopping"),
            WorkerState::Faulted => write!(f, "Faulted"),
            WorkerState::Closed => write!(f, "Closed"),
        }
    }
}

/// Events emitted by the acquisition thread.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    /// A successful reading.
    Sample {
        /// Wall-clock time of the reading
        timestamp: DateTime<Local>,
        /// Tagged value
        value: SampleValue,
    },
    /// Informational status text.
    Status(String),
    /// A recovered (soft) read failure.
    Error(String),
    /// Instrument connection state changed.
    Connection(bool),
    /// Terminal failure; the worker has left its loop.
    Faulted(String),
}

/// A [`WorkerEvent`] stamped with the session that produced it.
///
/// A worker abandoned after a stop timeout may still emit a few events; the session
/// number lets the controller discard them.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionEvent {
    /// Session number assigned by the controller
    pub session: u64,
    /// The event
    pub event: WorkerEvent,
}

// =============================================================================
// AcquisitionWorker
// =============================================================================

/// Handle to a running acquisition thread.
pub struct AcquisitionWorker {
    session: u64,
    state: Arc<RwLock<WorkerState>>,
    running: Arc<AtomicBool>,
    soft_errors: Arc<AtomicU32>,
    samples_emitted: Arc<AtomicU64>,
    done_rx: Option<oneshot::Receiver<()>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl AcquisitionWorker {
    /// Move `port` onto a new acquisition thread and start sampling.
    ///
    /// Returns once the thread is spawned; opening the instrument happens on the thread
    /// and failures arrive as [`WorkerEvent::Faulted`].
    pub fn spawn<P>(
        port: P,
        settings: AcquisitionSettings,
        session: u64,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> MonitorResult<Self>
    where
        P: InstrumentPort + 'static,
    {
        let state = Arc::new(RwLock::new(WorkerState::Idle));
        let running = Arc::new(AtomicBool::new(true));
        let soft_errors = Arc::new(AtomicU32::new(0));
        let samples_emitted = Arc::new(AtomicU64::new(0));
        let (done_tx, done_rx) = oneshot::channel();

        let thread_loop = AcquisitionLoop {
            port,
            settings,
            session,
            events,
            state: state.clone(),
            running: running.clone(),
            soft_errors: soft_errors.clone(),
            samples_emitted: samples_emitted.clone(),
        };

        let thread = thread::Builder::new()
            .name("capmon-acquisition".into())
            .spawn(move || {
                thread_loop.run();
                let _ = done_tx.send(());
            })?;

        Ok(Self {
            session,
            state,
            running,
            soft_errors,
            samples_emitted,
            done_rx: Some(done_rx),
            thread: Some(thread),
        })
    }

    /// Session number this worker stamps on its events.
    pub fn session(&self) -> u64 {
        self.session
    }

    /// Current lifecycle state.
    pub fn state(&self) -> WorkerState {
        *self.state.read()
    }

    /// Whether the loop has not yet been asked to stop.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Failed readings so far in this session.
    pub fn soft_error_count(&self) -> u32 {
        self.soft_errors.load(Ordering::SeqCst)
    }

    /// Successful readings so far in this session.
    pub fn samples_emitted(&self) -> u64 {
        self.samples_emitted.load(Ordering::SeqCst)
    }

    /// Ask the loop to exit. Observed within one iteration.
    pub fn request_stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Request a stop and wait up to `timeout` for the thread to close the instrument.
    ///
    /// Returns `true` if the thread finished in time. On timeout the thread is detached
    /// and left to finish on its own.
    pub async fn stop(&mut self, timeout: Duration) -> bool {
        self.request_stop();

        let Some(done_rx) = self.done_rx.take() else {
            return true;
        };

        match tokio::time::timeout(timeout, done_rx).await {
            Ok(Ok(())) => {
                if let Some(handle) = self.thread.take() {
                    if handle.join().is_err() {
                        warn!(session = self.session, "Acquisition thread panicked after completion");
                    }
                }
                debug!(session = self.session, "Acquisition worker stopped");
                true
            }
            Ok(Err(_)) => {
                warn!(
                    session = self.session,
                    "Acquisition thread exited without signalling completion"
                );
                self.thread.take();
                true
            }
            Err(_) => {
                warn!(
                    session = self.session,
                    timeout_ms = timeout.as_millis() as u64,
                    "Acquisition worker did not stop in time; abandoning thread"
                );
                self.thread.take();
                false
            }
        }
    }
}

impl Drop for AcquisitionWorker {
    fn drop(&mut self) {
        if self.running.load(Ordering::SeqCst) {
            self.request_stop();
        }
    }
}

// =============================================================================
// Thread body
// =============================================================================

struct AcquisitionLoop<P> {
    port: P,
    settings: AcquisitionSettings,
    session: u64,
    events: mpsc::UnboundedSender<SessionEvent>,
    state: Arc<RwLock<WorkerState>>,
    running: Arc<AtomicBool>,
    soft_errors: Arc<AtomicU32>,
    samples_emitted: Arc<AtomicU64>,
}

impl<P: InstrumentPort> AcquisitionLoop<P> {
    fn run(mut self) {
        self.set_state(WorkerState::Opening);

        if let Err(reason) = self.open_and_configure() {
            error!(session = self.session, %reason, "Acquisition failed to start");
            self.set_state(WorkerState::Faulted);
            self.emit(WorkerEvent::Faulted(reason));
            self.finish(false);
            return;
        }

        self.emit(WorkerEvent::Connection(true));
        self.emit(WorkerEvent::Status(format!(
            "Acquisition started: {} every {} ms",
            self.settings.mode,
            self.settings.sample_period.as_millis()
        )));
        self.set_state(WorkerState::Running);
        info!(
            session = self.session,
            mode = %self.settings.mode,
            period_ms = self.settings.sample_period.as_millis() as u64,
            "Acquisition loop running"
        );

        let faulted = self.sample_loop();

        if !faulted {
            self.set_state(WorkerState::Stopping);
        }
        self.finish(true);
    }

    fn open_and_configure(&mut self) -> Result<(), String> {
        let mode = self.settings.mode;

        self.port
            .open(self.settings.resource.as_deref())
            .map_err(|e| format!("Failed to open instrument: {e}"))?;

        if let Err(e) = self.port.initialize(mode) {
            let _ = self.port.close();
            return Err(format!("Failed to initialize instrument: {e}"));
        }

        let range_result = if self.settings.autorange {
            self.port.set_autorange(true)
        } else {
            self.port
                .set_autorange(false)
                .and_then(|_| self.port.set_manual_range(mode, self.settings.manual_range))
        };
        if let Err(e) = range_result {
            warn!(session = self.session, error = %e, "Failed to configure range");
        }

        if let Err(e) = self.port.set_integration_time(self.settings.nplc) {
            warn!(session = self.session, error = %e, "Failed to set integration time");
        }

        Ok(())
    }

    /// Returns `true` if the loop ended because the session faulted.
    fn sample_loop(&mut self) -> bool {
        let mode = self.settings.mode;
        let period = self.settings.sample_period;
        let mut last_reading: Option<Instant> = None;

        while self.running.load(Ordering::SeqCst) {
            let now = Instant::now();
            let due = last_reading.map_or(true, |t| now.duration_since(t) >= period);

            if due {
                match self.port.read(mode) {
                    Ok(raw) => {
                        last_reading = Some(now);
                        self.samples_emitted.fetch_add(1, Ordering::SeqCst);
                        self.emit(WorkerEvent::Sample {
                            timestamp: Local::now(),
                            value: mode.tag(raw),
                        });
                    }
                    Err(e) => {
                        let count = self.soft_errors.fetch_add(1, Ordering::SeqCst) + 1;
                        warn!(session = self.session, soft_errors = count, error = %e, "Read failed");
                        self.emit(WorkerEvent::Error(format!("Read error: {e}")));

                        if count >= self.settings.max_soft_errors {
                            let reason = format!(
                                "Too many read errors ({count}); last error: {e}"
                            );
                            error!(session = self.session, %reason, "Acquisition faulted");
                            self.set_state(WorkerState::Faulted);
                            self.running.store(false, Ordering::SeqCst);
                            self.emit(WorkerEvent::Faulted(reason));
                            return true;
                        }

                        thread::sleep(self.settings.error_backoff);
                        continue;
                    }
                }
            }

            let until_deadline = last_reading
                .map(|t| period.saturating_sub(t.elapsed()))
                .unwrap_or_default();
            let wait = until_deadline.min(self.settings.idle_quantum);
            if !wait.is_zero() {
                thread::sleep(wait);
            }
        }

        false
    }

    fn finish(&mut self, was_open: bool) {
        if was_open {
            if let Err(e) = self.port.close() {
                warn!(session = self.session, error = %e, "Error closing instrument");
            }
            self.emit(WorkerEvent::Connection(false));
        }
        self.running.store(false, Ordering::SeqCst);
        self.set_state(WorkerState::Closed);
        debug!(
            session = self.session,
            samples = self.samples_emitted.load(Ordering::SeqCst),
            soft_errors = self.soft_errors.load(Ordering::SeqCst),
            "Acquisition thread finished"
        );
    }

    fn set_state(&self, state: WorkerState) {
        *self.state.write() = state;
    }

    fn emit(&self, event: WorkerEvent) {
        // A closed receiver means nobody is listening any more.
        let _ = self.events.send(SessionEvent {
            session: self.session,
            event,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::port::InstrumentError;
    use crate::hardware::synthetic::SyntheticInstrument;

    fn fast_settings() -> AcquisitionSettings {
        AcquisitionSettings {
            sample_period: Duration::from_millis(10),
            error_backoff: Duration::from_millis(1),
            ..Default::default()
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> Vec<WorkerEvent> {
        let mut events = Vec::new();
        while let Ok(e) = rx.try_recv() {
            events.push(e.event);
        }
        events
    }

    #[tokio::test]
    async fn emits_samples_and_closes_on_stop() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let meter = SyntheticInstrument::new();
        let faults = meter.fault_injector();

        let mut worker = AcquisitionWorker::spawn(meter, fast_settings(), 1, tx).unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(worker.stop(Duration::from_secs(5)).await);
        assert_eq!(worker.state(), WorkerState::Closed);

        let events = drain(&mut rx);
        assert_eq!(events.first(), Some(&WorkerEvent::Connection(true)));
        assert_eq!(events.last(), Some(&WorkerEvent::Connection(false)));

        let samples = events
            .iter()
            .filter(|e| matches!(e, WorkerEvent::Sample { .. }))
            .count();
        assert!(samples >= 3, "expected several samples, got {samples}");
        assert_eq!(samples as u64, worker.samples_emitted());
        assert_eq!(faults.closes(), 1);
    }

    #[tokio::test]
    async fn open_failure_faults_without_sampling() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let meter = SyntheticInstrument::new();
        meter
            .fault_injector()
            .fail_open(InstrumentError::ConnectionLost("unplugged".into()));

        let mut worker = AcquisitionWorker::spawn(meter, fast_settings(), 7, tx).unwrap();
        assert!(worker.stop(Duration::from_secs(5)).await);

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], WorkerEvent::Faulted(msg) if msg.contains("unplugged")));
    }

    #[tokio::test]
    async fn soft_errors_fault_at_ceiling() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let meter = SyntheticInstrument::new();
        let faults = meter.fault_injector();
        faults.fail_all_reads(InstrumentError::Timeout("no reply".into()));

        let settings = AcquisitionSettings {
            max_soft_errors: 5,
            ..fast_settings()
        };
        let mut worker = AcquisitionWorker::spawn(meter, settings, 3, tx).unwrap();

        let mut errors = 0;
        loop {
            let event = rx.recv().await.unwrap();
            assert_eq!(event.session, 3);
            match event.event {
                WorkerEvent::Error(_) => errors += 1,
                WorkerEvent::Faulted(_) => break,
                _ => {}
            }
        }
        assert_eq!(errors, 5);
        assert_eq!(worker.soft_error_count(), 5);
        assert_eq!(faults.reads_attempted(), 5);
        assert!(worker.stop(Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn hung_close_is_abandoned_after_timeout() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let meter = SyntheticInstrument::new();
        meter.fault_injector().delay_close(Duration::from_millis(500));

        let mut worker = AcquisitionWorker::spawn(meter, fast_settings(), 1, tx).unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let started = Instant::now();
        assert!(!worker.stop(Duration::from_millis(50)).await);
        assert!(started.elapsed() < Duration::from_millis(400));
    }
}
