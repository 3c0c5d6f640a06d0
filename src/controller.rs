//! Measurement controller.
//!
//! [`MeasurementController`] is the single writer for everything a measurement session
//! produces: the live [`SampleBuffer`], the overlay loaded from disk and the
//! [`SessionMetadata`]. It owns the lifecycle of at most one [`AcquisitionWorker`] and
//! turns the worker's [`SessionEvent`]s into buffered samples and [`ControllerEvent`]s
//! for any number of subscribers.
//!
//! # Lifecycle
//!
//! ```text
//!          start(instrument)                 stop() / Faulted event
//!   Idle ───────────────────▶ Measuring ───────────────────────────▶ Idle
//!    ▲        AlreadyMeasuring ◀─┘                                    │
//!    └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The controller is not `Sync` and is meant to live inside one task (see
//! [`crate::actor`]). Worker events are pulled with [`next_worker_event`] and applied
//! with [`handle_worker_event`].
//!
//! [`next_worker_event`]: MeasurementController::next_worker_event
//! [`handle_worker_event`]: MeasurementController::handle_worker_event

use crate::acquisition::{AcquisitionSettings, AcquisitionWorker, SessionEvent, WorkerEvent};
use crate::data::csv_storage::{self, LoadedData};
use crate::data::sample_buffer::{SampleBuffer, DEFAULT_CAPACITY};
use crate::error::{MonitorError, MonitorResult};
use crate::hardware::port::InstrumentPort;
use crate::measurement::{Sample, SampleValue};
use crate::metadata::SessionMetadata;
use chrono::{DateTime, Local};
use std::path::Path;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

/// Capacity of the controller event broadcast channel.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Controller configuration.
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    /// Parameters handed to each new acquisition worker.
    pub acquisition: AcquisitionSettings,
    /// Live buffer capacity.
    pub buffer_capacity: usize,
    /// How long `stop` waits for the acquisition thread.
    pub stop_timeout: Duration,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            acquisition: AcquisitionSettings::default(),
            buffer_capacity: DEFAULT_CAPACITY,
            stop_timeout: Duration::from_secs(5),
        }
    }
}

/// Controller lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    /// No session running
    Idle,
    /// Acquisition thread running
    Measuring,
}

/// Notifications published to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum ControllerEvent {
    /// A sample was appended to the live buffer.
    Sample(Sample),
    /// Informational status text.
    Status(String),
    /// A recovered or reported error.
    Error(String),
    /// Instrument connection state changed.
    Connection(bool),
    /// A session started.
    Started(SessionMetadata),
    /// A session ended (stopped or faulted).
    Stopped(SessionMetadata),
    /// Both buffers were cleared.
    Cleared,
}

/// Owns session data and the acquisition worker.
pub struct MeasurementController {
    settings: ControllerSettings,
    state: ControllerState,
    worker: Option<AcquisitionWorker>,
    session: u64,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: mpsc::UnboundedReceiver<SessionEvent>,
    buffer: SampleBuffer,
    overlay: Vec<Sample>,
    metadata: Option<SessionMetadata>,
    session_start: Option<DateTime<Local>>,
    last_t_seconds: f64,
    instrument_connected: bool,
    notify: broadcast::Sender<ControllerEvent>,
}

impl MeasurementController {
    /// Idle controller with an empty buffer.
    pub fn new(settings: ControllerSettings) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (notify, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            buffer: SampleBuffer::new(settings.buffer_capacity),
            settings,
            state: ControllerState::Idle,
            worker: None,
            session: 0,
            events_tx,
            events_rx,
            overlay: Vec::new(),
            metadata: None,
            session_start: None,
            last_t_seconds: 0.0,
            instrument_connected: false,
            notify,
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Start a session on `instrument`.
    ///
    /// Fails with [`MonitorError::AlreadyMeasuring`], without touching the running
    /// session, if one is active.
    pub fn start<P>(&mut self, instrument: P) -> MonitorResult<()>
    where
        P: InstrumentPort + 'static,
    {
        if self.state == ControllerState::Measuring {
            warn!("Measurement already in progress");
            return Err(MonitorError::AlreadyMeasuring);
        }

        let acquisition = self.settings.acquisition.clone();
        let start_time = Local::now();
        let resource = acquisition
            .resource
            .clone()
            .or_else(|| instrument.resource().map(str::to_string));
        let metadata = SessionMetadata::begin(
            start_time,
            acquisition.sample_period.as_millis() as u64,
            acquisition.mode,
            acquisition.autorange,
            acquisition.manual_range,
            instrument.instrument_type(),
            resource,
        );

        let session = self.session + 1;
        let worker =
            AcquisitionWorker::spawn(instrument, acquisition, session, self.events_tx.clone())?;

        self.session = session;
        self.worker = Some(worker);
        self.session_start = Some(start_time);
        self.last_t_seconds = 0.0;
        self.metadata = Some(metadata.clone());
        self.state = ControllerState::Measuring;

        info!(session, mode = %metadata.mode, "Measurement started");
        self.publish(ControllerEvent::Started(metadata));
        self.publish(ControllerEvent::Status("Measurement started".into()));
        Ok(())
    }

    /// Stop the running session. No-op when idle.
    ///
    /// Waits up to the configured stop timeout for the acquisition thread, then applies
    /// every event it already queued before finalizing the metadata.
    pub async fn stop(&mut self) {
        if self.state != ControllerState::Measuring {
            return;
        }

        let mut soft_errors = None;
        if let Some(mut worker) = self.worker.take() {
            let finished = worker.stop(self.settings.stop_timeout).await;
            if !finished {
                self.publish(ControllerEvent::Error(
                    "Acquisition thread did not stop in time".into(),
                ));
            }
            soft_errors = Some(worker.soft_error_count());
        }

        // A queued Faulted event may already finalize the session here.
        self.drain_worker_events();
        if self.state == ControllerState::Measuring {
            self.finalize(soft_errors);
        } else if let (Some(count), Some(metadata)) = (soft_errors, self.metadata.as_mut()) {
            metadata.soft_error_count = count;
        }
        self.publish(ControllerEvent::Status("Measurement stopped".into()));
    }

    /// Stop and release everything; used on shutdown.
    pub async fn shutdown(&mut self) {
        self.stop().await;
        debug!("Measurement controller shut down");
    }

    fn finalize(&mut self, soft_errors: Option<u32>) {
        self.state = ControllerState::Idle;
        let sample_count = self.buffer.len();
        if let Some(metadata) = self.metadata.as_mut() {
            metadata.end_time = Some(Local::now());
            metadata.sample_count = sample_count;
            if let Some(count) = soft_errors {
                metadata.soft_error_count = count;
            }
            info!(
                samples = sample_count,
                soft_errors = metadata.soft_error_count,
                "Measurement stopped"
            );
            let snapshot = metadata.clone();
            self.publish(ControllerEvent::Stopped(snapshot));
        }
    }

    // =========================================================================
    // Worker events
    // =========================================================================

    /// Wait for the next event from the acquisition thread.
    ///
    /// Pending forever while no worker has ever been started, which makes it usable as
    /// a `select!` branch.
    pub async fn next_worker_event(&mut self) -> Option<SessionEvent> {
        self.events_rx.recv().await
    }

    /// Apply every event already queued by the acquisition thread.
    pub fn drain_worker_events(&mut self) -> usize {
        let mut applied = 0;
        while let Ok(event) = self.events_rx.try_recv() {
            self.handle_worker_event(event);
            applied += 1;
        }
        applied
    }

    /// Apply one worker event. Events from earlier sessions are discarded.
    pub fn handle_worker_event(&mut self, event: SessionEvent) {
        if event.session != self.session {
            debug!(
                stale = event.session,
                current = self.session,
                "Discarding event from previous session"
            );
            return;
        }

        match event.event {
            WorkerEvent::Sample { timestamp, value } => self.on_sample(timestamp, value),
            WorkerEvent::Status(message) => {
                debug!(%message, "Worker status");
                self.publish(ControllerEvent::Status(message));
            }
            WorkerEvent::Error(message) => self.publish(ControllerEvent::Error(message)),
            WorkerEvent::Connection(connected) => {
                self.instrument_connected = connected;
                self.publish(ControllerEvent::Connection(connected));
            }
            WorkerEvent::Faulted(reason) => {
                error!(%reason, "Acquisition faulted");
                self.publish(ControllerEvent::Error(reason));
                if self.state == ControllerState::Measuring {
                    let soft_errors = self.worker.take().map(|w| {
                        w.request_stop();
                        w.soft_error_count()
                    });
                    self.finalize(soft_errors);
                }
            }
        }
    }

    /// Append a reading to the live buffer.
    ///
    /// Ignored when no session has ever started. Elapsed time never goes backwards within
    /// a session even if the wall clock does.
    pub fn on_sample(&mut self, timestamp: DateTime<Local>, value: SampleValue) {
        let Some(start) = self.session_start else {
            return;
        };

        let elapsed = (timestamp - start)
            .num_microseconds()
            .map(|us| us as f64 / 1e6)
            .unwrap_or(self.last_t_seconds);
        let t_seconds = elapsed.max(self.last_t_seconds);
        self.last_t_seconds = t_seconds;

        let sample = Sample::new(timestamp, t_seconds, value);
        self.buffer.push(sample.clone());
        self.publish(ControllerEvent::Sample(sample));
    }

    // =========================================================================
    // Data
    // =========================================================================

    /// Save the live buffer to `path`.
    pub fn save(&mut self, path: &Path) -> MonitorResult<()> {
        if self.buffer.is_empty() {
            return Err(MonitorError::Buffer("No data to save".into()));
        }
        let sample_count = self.buffer.len();
        let metadata = self
            .metadata
            .as_mut()
            .ok_or_else(|| MonitorError::Buffer("No measurement metadata available".into()))?;

        metadata.sample_count = sample_count;
        metadata.end_time = Some(Local::now());
        let metadata = metadata.clone();

        let samples = self.buffer.snapshot();
        match csv_storage::save(path, &samples, &metadata) {
            Ok(()) => {
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| path.display().to_string());
                self.publish(ControllerEvent::Status(format!("Data saved to {name}")));
                Ok(())
            }
            Err(e) => {
                error!(error = %e, path = %path.display(), "Failed to save data");
                self.publish(ControllerEvent::Error(format!("Failed to save data: {e}")));
                Err(e)
            }
        }
    }

    /// Replace the overlay with the samples in `path` and return its metadata.
    pub fn load(&mut self, path: &Path) -> MonitorResult<SessionMetadata> {
        match csv_storage::load(path) {
            Ok(LoadedData { metadata, samples }) => {
                let count = samples.len();
                self.overlay = samples;
                info!(samples = count, path = %path.display(), "Loaded overlay data");
                self.publish(ControllerEvent::Status(format!(
                    "Loaded {count} samples from {}",
                    path.display()
                )));
                Ok(metadata)
            }
            Err(e) => {
                error!(error = %e, path = %path.display(), "Failed to load data");
                self.publish(ControllerEvent::Error(format!("Failed to load data: {e}")));
                Err(e)
            }
        }
    }

    /// Empty both the live buffer and the overlay.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.overlay.clear();
        info!("Data cleared");
        self.publish(ControllerEvent::Cleared);
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Current lifecycle state.
    pub fn state(&self) -> ControllerState {
        self.state
    }

    /// Whether a session is running.
    pub fn is_measuring(&self) -> bool {
        self.state == ControllerState::Measuring
    }

    /// Samples in the live buffer.
    pub fn sample_count(&self) -> usize {
        self.buffer.len()
    }

    /// Live count from the worker while measuring, the recorded count afterwards.
    pub fn soft_error_count(&self) -> u32 {
        match &self.worker {
            Some(worker) => worker.soft_error_count(),
            None => self
                .metadata
                .as_ref()
                .map(|m| m.soft_error_count)
                .unwrap_or(0),
        }
    }

    /// Whether the active worker reports an open instrument.
    pub fn instrument_connected(&self) -> bool {
        self.instrument_connected
    }

    /// Live samples, oldest first.
    pub fn samples(&self) -> Vec<Sample> {
        self.buffer.snapshot()
    }

    /// Live samples from the last `seconds` of session time.
    pub fn samples_in_window(&self, seconds: f64) -> Vec<Sample> {
        self.buffer.window(seconds)
    }

    /// Samples loaded from storage, shown beside the live buffer.
    pub fn overlay(&self) -> &[Sample] {
        &self.overlay
    }

    /// Metadata of the current or last session, or of the last loaded file.
    pub fn metadata(&self) -> Option<&SessionMetadata> {
        self.metadata.as_ref()
    }

    /// Settings the controller was built with.
    pub fn settings(&self) -> &ControllerSettings {
        &self.settings
    }

    /// Replace the acquisition parameters used by the next session.
    pub fn set_acquisition_settings(&mut self, acquisition: AcquisitionSettings) {
        if self.is_measuring() {
            debug!("Acquisition settings updated; applied on next start");
        }
        self.settings.acquisition = acquisition;
    }

    /// Receive every [`ControllerEvent`] published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ControllerEvent> {
        self.notify.subscribe()
    }

    fn publish(&self, event: ControllerEvent) {
        // No subscribers is fine.
        let _ = self.notify.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::synthetic::SyntheticInstrument;
    use crate::measurement::MeasurementMode;
    use chrono::Duration as ChronoDuration;

    fn controller() -> MeasurementController {
        MeasurementController::new(ControllerSettings {
            acquisition: AcquisitionSettings {
                sample_period: Duration::from_millis(50),
                ..Default::default()
            },
            ..Default::default()
        })
    }

    #[test]
    fn samples_before_any_session_are_ignored() {
        let mut ctl = controller();
        ctl.on_sample(Local::now(), SampleValue::CapacitanceFarads(1e-9));
        assert_eq!(ctl.sample_count(), 0);
    }

    #[test]
    fn save_without_data_is_a_buffer_error() {
        let mut ctl = controller();
        let err = ctl.save(Path::new("unused.csv")).unwrap_err();
        assert!(matches!(err, MonitorError::Buffer(_)));
        assert_eq!(err.to_string(), "No data to save");
    }

    #[tokio::test]
    async fn start_stop_collects_samples_and_finalizes_metadata() {
        let mut ctl = controller();
        let mut events = ctl.subscribe();

        ctl.start(SyntheticInstrument::new()).unwrap();
        assert!(ctl.is_measuring());
        assert!(matches!(
            ctl.start(SyntheticInstrument::new()),
            Err(MonitorError::AlreadyMeasuring)
        ));

        tokio::time::sleep(Duration::from_millis(300)).await;
        ctl.stop().await;
        assert!(!ctl.is_measuring());
        assert!(ctl.sample_count() >= 3);

        let metadata = ctl.metadata().unwrap();
        assert_eq!(metadata.sample_count, ctl.sample_count());
        assert_eq!(metadata.instrument_type, "synthetic");
        assert!(metadata.end_time.is_some());
        assert_eq!(metadata.mode, MeasurementMode::Capacitance);

        let samples = ctl.samples();
        assert!(samples.windows(2).all(|w| w[0].t_seconds <= w[1].t_seconds));

        assert!(matches!(events.try_recv(), Ok(ControllerEvent::Started(_))));

        // Idempotent.
        ctl.stop().await;
    }

    #[tokio::test]
    async fn stale_session_events_are_discarded() {
        let mut ctl = controller();
        ctl.start(SyntheticInstrument::new()).unwrap();
        ctl.stop().await;
        let before = ctl.sample_count();

        ctl.handle_worker_event(SessionEvent {
            session: 0,
            event: WorkerEvent::Sample {
                timestamp: Local::now(),
                value: SampleValue::CapacitanceFarads(1e-9),
            },
        });
        assert_eq!(ctl.sample_count(), before);
    }

    #[tokio::test]
    async fn elapsed_time_never_goes_backwards() {
        let mut ctl = controller();
        ctl.start(SyntheticInstrument::new()).unwrap();
        ctl.stop().await;
        ctl.clear();

        let start = ctl.metadata().unwrap().start_time;
        ctl.on_sample(start + ChronoDuration::seconds(2), SampleValue::CapacitanceFarads(1.0));
        ctl.on_sample(start + ChronoDuration::seconds(1), SampleValue::CapacitanceFarads(2.0));
        let samples = ctl.samples();
        assert_eq!(samples[0].t_seconds, 2.0);
        assert_eq!(samples[1].t_seconds, 2.0);
    }
}
