//! Tool-call surface.
//!
//! [`ToolExecutor`] exposes controller and scheduler operations as uniformly shaped
//! actions. Every action returns a [`ToolResult`]; failures become `success: false` with
//! a message and never propagate. The same executor performs whatever the
//! [`ActionScheduler`] reports as due, so scheduled and interactive actions go through
//! one code path.
//!
//! Calls arrive either as typed [`ToolCall`]s or as `{"name", "arguments"}` JSON from a
//! planner (see [`ToolCall::from_json`]).

use crate::acquisition::SessionEvent;
use crate::config::MonitorConfig;
use crate::controller::MeasurementController;
use crate::error::{MonitorError, MonitorResult};
use crate::hardware::{self, InstrumentFactory};
use crate::scheduler::sequence::{self, SequenceAction, SequenceStep};
use crate::scheduler::{ActionScheduler, DueStep, SchedulerDue, ScheduledTask};
use chrono::Local;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info, warn};

// =============================================================================
// Result and call types
// =============================================================================

/// Outcome of one tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    /// Whether the action succeeded
    pub success: bool,
    /// Human-readable outcome
    pub message: String,
    /// Structured details for planners
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ToolResult {
    /// Successful result with a message.
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: None,
        }
    }

    /// Failed result with a message.
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            data: None,
        }
    }

    /// Attach structured data.
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Work the executor's owner has to apply next.
#[derive(Debug)]
pub enum Pending {
    /// Event from an acquisition thread
    Worker(SessionEvent),
    /// Scheduled task or sequence step whose time has come
    Due(SchedulerDue),
}

/// A tool result produced by scheduled work rather than a direct call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolNotification {
    /// Tool that ran
    pub tool: String,
    /// Result of the action
    pub result: ToolResult,
}

fn default_true() -> bool {
    true
}

/// Every callable action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", content = "arguments", rename_all = "snake_case")]
pub enum ToolCall {
    /// Start acquisition
    StartMeasurement,
    /// Stop acquisition
    StopMeasurement,
    /// Save the live buffer to CSV
    ExportCsv {
        /// File name; generated from the time if absent
        #[serde(default)]
        filename: Option<String>,
    },
    /// Empty the live buffer
    ClearData,
    /// Report state and counters
    GetStatus,
    /// Start now and stop after a duration
    ScheduleMeasurement {
        /// Seconds part of the duration
        #[serde(default)]
        duration_seconds: Option<f64>,
        /// Minutes part of the duration
        #[serde(default)]
        duration_minutes: Option<f64>,
        /// Export after the stop
        #[serde(default = "default_true")]
        auto_export: bool,
    },
    /// Run a timed step list
    ExecuteMeasurementSequence {
        /// Planner step list, validated on execution
        sequence: Value,
    },
    /// Load a CSV file as overlay
    LoadCsv {
        /// File to read
        path: PathBuf,
    },
    /// Cancel the running sequence
    CancelSequence,
    /// Report sequence progress
    GetSequenceStatus,
    /// List tool descriptors
    AvailableTools,
}

impl ToolCall {
    /// Build a call from a tool name and its JSON arguments.
    pub fn from_json(name: &str, arguments: Value) -> Result<Self, String> {
        let has_arguments = match &arguments {
            Value::Null => false,
            Value::Object(map) => !map.is_empty(),
            _ => true,
        };
        let parsed = if has_arguments {
            serde_json::from_value(json!({ "name": name, "arguments": arguments }))
        } else {
            // Unit variants take no content; struct variants with defaults need an empty map.
            serde_json::from_value(json!({ "name": name }))
                .or_else(|_| serde_json::from_value(json!({ "name": name, "arguments": {} })))
        };
        parsed.map_err(|e| format!("Invalid call to '{name}': {e}"))
    }

    /// Tool name as exposed to planners.
    pub fn name(&self) -> &'static str {
        match self {
            ToolCall::StartMeasurement => "start_measurement",
            ToolCall::StopMeasurement => "stop_measurement",
            ToolCall::ExportCsv { .. } => "export_csv",
            ToolCall::ClearData => "clear_data",
            ToolCall::GetStatus => "get_status",
            ToolCall::ScheduleMeasurement { .. } => "schedule_measurement",
            ToolCall::ExecuteMeasurementSequence { .. } => "execute_measurement_sequence",
            ToolCall::LoadCsv { .. } => "load_csv",
            ToolCall::CancelSequence => "cancel_sequence",
            ToolCall::GetSequenceStatus => "get_sequence_status",
            ToolCall::AvailableTools => "available_tools",
        }
    }
}

// =============================================================================
// ToolExecutor
// =============================================================================

/// Owns the controller and scheduler and performs every action on them.
pub struct ToolExecutor {
    controller: MeasurementController,
    scheduler: ActionScheduler,
    factory: InstrumentFactory,
    export_dir: PathBuf,
}

impl ToolExecutor {
    /// Assemble an executor from its parts.
    pub fn new(
        controller: MeasurementController,
        scheduler: ActionScheduler,
        factory: InstrumentFactory,
        export_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            controller,
            scheduler,
            factory,
            export_dir: export_dir.into(),
        }
    }

    /// Build everything from configuration. Must be called inside a Tokio runtime.
    pub fn from_config(config: &MonitorConfig) -> Self {
        Self::new(
            MeasurementController::new(config.controller_settings()),
            ActionScheduler::new(
                Duration::from_millis(config.scheduler.coarse_poll_ms),
                Duration::from_millis(config.scheduler.fine_poll_ms),
            ),
            hardware::factory_from_config(&config.instrument, &config.synthetic),
            config.storage.resolved_export_dir(),
        )
    }

    /// Measurement controller.
    pub fn controller(&self) -> &MeasurementController {
        &self.controller
    }

    /// Mutable measurement controller.
    pub fn controller_mut(&mut self) -> &mut MeasurementController {
        &mut self.controller
    }

    /// Action scheduler.
    pub fn scheduler(&self) -> &ActionScheduler {
        &self.scheduler
    }

    /// Mutable action scheduler.
    pub fn scheduler_mut(&mut self) -> &mut ActionScheduler {
        &mut self.scheduler
    }

    /// Directory exports are written to.
    pub fn export_dir(&self) -> &Path {
        &self.export_dir
    }

    /// Dispatch one call.
    pub async fn call(&mut self, call: ToolCall) -> ToolResult {
        let name = call.name();
        let result = match call {
            ToolCall::StartMeasurement => self.start_measurement(),
            ToolCall::StopMeasurement => self.stop_measurement().await,
            ToolCall::ExportCsv { filename } => self.export_csv(filename.as_deref()),
            ToolCall::ClearData => self.clear_data(),
            ToolCall::GetStatus => self.get_status(),
            ToolCall::ScheduleMeasurement {
                duration_seconds,
                duration_minutes,
                auto_export,
            } => self.schedule_measurement(duration_seconds, duration_minutes, auto_export),
            ToolCall::ExecuteMeasurementSequence { sequence } => {
                self.execute_sequence_json(&sequence)
            }
            ToolCall::LoadCsv { path } => self.load_csv(&path),
            ToolCall::CancelSequence => self.cancel_sequence(),
            ToolCall::GetSequenceStatus => self.get_sequence_status(),
            ToolCall::AvailableTools => ToolResult::success("Available tools")
                .with_data(Value::Array(Self::available_tools())),
        };
        if !result.success {
            warn!(tool = name, message = %result.message, "Tool call failed");
        }
        result
    }

    // =========================================================================
    // Core operations (errors propagate)
    // =========================================================================

    /// Start a session on a freshly built instrument.
    pub fn start(&mut self) -> MonitorResult<()> {
        if self.controller.is_measuring() {
            return Err(MonitorError::AlreadyMeasuring);
        }
        let instrument = (self.factory)();
        self.controller.start(instrument)
    }

    /// Stop the running session.
    pub async fn stop(&mut self) -> MonitorResult<()> {
        if !self.controller.is_measuring() {
            return Err(MonitorError::NotMeasuring);
        }
        self.controller.stop().await;
        Ok(())
    }

    /// Save the live buffer into the export directory and return the file path.
    pub fn export(&mut self, filename: Option<&str>) -> MonitorResult<PathBuf> {
        if self.controller.sample_count() == 0 {
            return Err(MonitorError::Buffer(
                "No data to export. Start a measurement first.".into(),
            ));
        }
        let path = self.export_dir.join(export_file_name(filename));
        self.controller.save(&path)?;
        Ok(path)
    }

    // =========================================================================
    // Tools
    // =========================================================================

    /// Start a measurement.
    pub fn start_measurement(&mut self) -> ToolResult {
        match self.start() {
            Ok(()) => ToolResult::success("Measurement started successfully."),
            Err(e @ MonitorError::AlreadyMeasuring) => {
                ToolResult::failure(precondition_message(&e))
            }
            Err(e) => {
                error!(error = %e, "Failed to start measurement");
                ToolResult::failure(format!("Failed to start measurement: {e}"))
            }
        }
    }

    /// Stop the running measurement.
    pub async fn stop_measurement(&mut self) -> ToolResult {
        match self.stop().await {
            Ok(()) => ToolResult::success("Measurement stopped successfully."),
            Err(e @ MonitorError::NotMeasuring) => {
                ToolResult::failure(precondition_message(&e))
            }
            Err(e) => ToolResult::failure(format!("Failed to stop measurement: {e}")),
        }
    }

    /// Export the live buffer; `filename` defaults to a timestamped name.
    pub fn export_csv(&mut self, filename: Option<&str>) -> ToolResult {
        match self.export(filename) {
            Ok(path) => ToolResult::success(format!(
                "Data exported successfully to {}",
                path.display()
            ))
            .with_data(json!({ "filepath": path.display().to_string() })),
            Err(e @ MonitorError::Buffer(_)) => ToolResult::failure(e.to_string()),
            Err(e) => {
                error!(error = %e, "Failed to export CSV");
                ToolResult::failure(format!("Failed to export CSV: {e}"))
            }
        }
    }

    /// Clear the live buffer.
    pub fn clear_data(&mut self) -> ToolResult {
        self.controller.clear();
        ToolResult::success("Data cleared successfully.")
    }

    /// Running state, counts and schedule.
    pub fn get_status(&self) -> ToolResult {
        let ctl = &self.controller;
        let is_measuring = ctl.is_measuring();
        let sample_count = ctl.sample_count();
        let error_count = ctl.soft_error_count();

        let message = if is_measuring {
            format!("Measurement is running. Samples: {sample_count}, Errors: {error_count}")
        } else {
            format!(
                "Measurement is stopped. Total samples: {sample_count}, Errors: {error_count}"
            )
        };

        ToolResult::success(message).with_data(json!({
            "is_measuring": is_measuring,
            "sample_count": sample_count,
            "error_count": error_count,
            "instrument_connected": ctl.instrument_connected(),
            "mode": ctl.settings().acquisition.mode,
            "scheduled_tasks": self.scheduler.pending_tasks().len(),
            "sequence_active": self.scheduler.is_sequence_active(),
        }))
    }

    /// Start a measurement now and stop it after the given duration.
    pub fn schedule_measurement(
        &mut self,
        duration_seconds: Option<f64>,
        duration_minutes: Option<f64>,
        auto_export: bool,
    ) -> ToolResult {
        if let Err(e) = crate::scheduler::validate_duration(duration_seconds, duration_minutes) {
            return ToolResult::failure(scheduling_message(e));
        }
        if self.controller.is_measuring() {
            return ToolResult::failure("A measurement is already running. Stop it first.");
        }

        let started = self.start_measurement();
        if !started.success {
            return started;
        }

        match self
            .scheduler
            .schedule_stop(duration_seconds, duration_minutes, auto_export)
        {
            Ok(task) => ToolResult::success(format!(
                "Measurement scheduled for {}. Will stop at {}.",
                task.duration_label,
                task.scheduled_time.format("%H:%M:%S")
            ))
            .with_data(json!({
                "task_id": task.id,
                "duration_seconds": task.duration_seconds,
                "stop_time": task.scheduled_time.to_rfc3339(),
                "auto_export": task.auto_export,
            })),
            Err(e) => ToolResult::failure(scheduling_message(e)),
        }
    }

    /// Validate and run a typed step list.
    pub fn execute_measurement_sequence(&mut self, steps: Vec<SequenceStep>) -> ToolResult {
        let summary = sequence::summarize(&steps);
        let total_steps = steps.len();
        let encoded = serde_json::to_value(&steps).unwrap_or(Value::Null);

        match self.scheduler.execute(steps) {
            Ok(run_id) => {
                ToolResult::success(format!("Measurement sequence started:\n{summary}"))
                    .with_data(json!({
                        "run_id": run_id.to_string(),
                        "sequence": encoded,
                        "total_steps": total_steps,
                    }))
            }
            Err(e) => ToolResult::failure(e.to_string()),
        }
    }

    /// Validate and run planner JSON.
    pub fn execute_sequence_json(&mut self, value: &Value) -> ToolResult {
        match sequence::parse_steps(value) {
            Ok(steps) => self.execute_measurement_sequence(steps),
            Err(e) => ToolResult::failure(e.to_string()),
        }
    }

    /// Load a previous export as overlay data.
    pub fn load_csv(&mut self, path: &Path) -> ToolResult {
        match self.controller.load(path) {
            Ok(metadata) => {
                let count = self.controller.overlay().len();
                ToolResult::success(format!("Loaded {count} samples from {}", path.display()))
                    .with_data(json!({
                        "sample_count": count,
                        "metadata": metadata,
                    }))
            }
            Err(e) => ToolResult::failure(format!("Failed to load data: {e}")),
        }
    }

    /// Cancel the running sequence.
    pub fn cancel_sequence(&mut self) -> ToolResult {
        if self.scheduler.cancel_sequence() {
            ToolResult::success("Sequence cancelled.")
        } else {
            ToolResult::failure("No sequence is currently running.")
        }
    }

    /// Progress of the current or last sequence.
    pub fn get_sequence_status(&self) -> ToolResult {
        match self.scheduler.sequence_status() {
            Some(status) => {
                let message = match (&status.halted, status.active) {
                    (Some(reason), _) => format!(
                        "Sequence halted after {}/{} steps: {reason}",
                        status.completed_steps, status.total_steps
                    ),
                    (None, true) => format!(
                        "Sequence running: {}/{} steps done, {:.1}s elapsed",
                        status.completed_steps, status.total_steps, status.elapsed_seconds
                    ),
                    (None, false) => format!(
                        "Sequence completed: {} steps",
                        status.total_steps
                    ),
                };
                let data = serde_json::to_value(&status).unwrap_or(Value::Null);
                ToolResult::success(message).with_data(data)
            }
            None => ToolResult::success("No sequence has been run."),
        }
    }

    // =========================================================================
    // Scheduled work
    // =========================================================================

    /// Wait for the next worker event or due scheduler work. Cancel-safe.
    pub async fn next_pending(&mut self) -> Pending {
        tokio::select! {
            Some(event) = self.controller.next_worker_event() => Pending::Worker(event),
            due = self.scheduler.next_due() => Pending::Due(due),
        }
    }

    /// Perform whatever the scheduler reported as due.
    pub async fn run_due(&mut self, due: SchedulerDue) -> Vec<ToolNotification> {
        match due {
            SchedulerDue::Tasks(tasks) => {
                let mut notifications = Vec::new();
                for task in tasks {
                    notifications.extend(self.run_task(task).await);
                }
                notifications
            }
            SchedulerDue::Step(step) => vec![self.run_step(step).await],
        }
    }

    async fn run_task(&mut self, task: ScheduledTask) -> Vec<ToolNotification> {
        info!(task = task.id, "Running scheduled stop");
        let mut notifications = vec![ToolNotification {
            tool: "stop_measurement".into(),
            result: self.stop_measurement().await,
        }];
        if task.auto_export {
            notifications.push(ToolNotification {
                tool: "export_csv".into(),
                result: self.export_csv(None),
            });
        }
        for n in notifications.iter().filter(|n| !n.result.success) {
            warn!(task = task.id, tool = %n.tool, message = %n.result.message, "Scheduled task action failed");
        }
        notifications
    }

    async fn run_step(&mut self, due: DueStep) -> ToolNotification {
        let outcome: MonitorResult<String> = match &due.step.action {
            SequenceAction::Start => self
                .start()
                .map(|()| "Measurement started successfully.".to_string()),
            SequenceAction::Stop => self
                .stop()
                .await
                .map(|()| "Measurement stopped successfully.".to_string()),
            SequenceAction::Export => self
                .export(None)
                .map(|path| format!("Data exported successfully to {}", path.display())),
            SequenceAction::Clear => {
                self.controller.clear();
                Ok("Data cleared successfully.".to_string())
            }
            SequenceAction::Wait => Ok("Waiting.".to_string()),
            SequenceAction::Unknown(name) => {
                warn!(action = %name, index = due.index, "Unknown sequence action skipped");
                Ok(format!("Skipped unknown action '{name}'."))
            }
        };

        let result = match outcome {
            Ok(message) => ToolResult::success(message),
            Err(e) if e.is_precondition() => {
                warn!(index = due.index, action = %due.step.action, error = %e, "Sequence step failed; continuing");
                ToolResult::failure(precondition_message(&e))
            }
            Err(e) => {
                error!(index = due.index, action = %due.step.action, error = %e, "Sequence step failed");
                self.scheduler
                    .halt_sequence(due.run_id, format!("step {} failed: {e}", due.index));
                ToolResult::failure(format!("Sequence halted at step {}: {e}", due.index))
            }
        };
        ToolNotification {
            tool: due.step.action.to_string(),
            result,
        }
    }

    /// Stop everything; used on shutdown.
    pub async fn shutdown(&mut self) {
        self.scheduler.cancel_sequence();
        self.scheduler.cancel_tasks();
        self.controller.shutdown().await;
    }

    // =========================================================================
    // Planner descriptors
    // =========================================================================

    /// JSON descriptors of every tool, for an external planner.
    pub fn available_tools() -> Vec<Value> {
        vec![
            json!({
                "name": "execute_measurement_sequence",
                "description": "Execute a planned measurement sequence",
                "parameters": {
                    "sequence": {
                        "type": "array",
                        "description": "Array of measurement actions with timing",
                        "items": {
                            "type": "object",
                            "properties": {
                                "action": {
                                    "type": "string",
                                    "description": "Action to perform: start_measurement, stop_measurement, export_csv, clear_data, or wait"
                                },
                                "time_offset": {
                                    "type": "number",
                                    "description": "Time offset in seconds from sequence start"
                                },
                                "duration": {
                                    "type": "string",
                                    "description": "Optional duration description for display purposes"
                                }
                            },
                            "required": ["action", "time_offset"]
                        },
                        "required": true
                    }
                }
            }),
            json!({
                "name": "start_measurement",
                "description": "Start measurement",
                "parameters": {}
            }),
            json!({
                "name": "stop_measurement",
                "description": "Stop measurement",
                "parameters": {}
            }),
            json!({
                "name": "export_csv",
                "description": "Export current measurement data to CSV file",
                "parameters": {
                    "filename": {
                        "type": "string",
                        "description": "Optional filename for the CSV file",
                        "required": false
                    }
                }
            }),
            json!({
                "name": "clear_data",
                "description": "Clear all measurement data",
                "parameters": {}
            }),
            json!({
                "name": "get_status",
                "description": "Get current measurement status and statistics",
                "parameters": {}
            }),
            json!({
                "name": "schedule_measurement",
                "description": "Start a measurement and automatically stop it after specified duration",
                "parameters": {
                    "duration_seconds": {
                        "type": "number",
                        "description": "Duration of measurement in seconds (must be greater than 0, maximum 86400 seconds/24 hours)",
                        "required": false
                    },
                    "duration_minutes": {
                        "type": "number",
                        "description": "Duration of measurement in minutes (must be greater than 0, maximum 1440 minutes/24 hours)",
                        "required": false
                    },
                    "auto_export": {
                        "type": "boolean",
                        "description": "Whether to automatically export CSV after measurement",
                        "required": false,
                        "default": true
                    }
                }
            }),
            json!({
                "name": "load_csv",
                "description": "Load a previously exported CSV file as overlay data",
                "parameters": {
                    "path": {
                        "type": "string",
                        "description": "Path of the CSV file",
                        "required": true
                    }
                }
            }),
            json!({
                "name": "cancel_sequence",
                "description": "Cancel the running measurement sequence",
                "parameters": {}
            }),
            json!({
                "name": "get_sequence_status",
                "description": "Get progress of the current or last measurement sequence",
                "parameters": {}
            }),
        ]
    }
}

/// `measurement_YYYYMMDD_HHMMSS.csv` unless a name is given; `.csv` is appended if missing.
pub fn export_file_name(filename: Option<&str>) -> String {
    let name = match filename.map(str::trim).filter(|f| !f.is_empty()) {
        Some(name) => name.to_string(),
        None => format!("measurement_{}.csv", Local::now().format("%Y%m%d_%H%M%S")),
    };
    if name.ends_with(".csv") {
        name
    } else {
        format!("{name}.csv")
    }
}

/// Tool wording for a lifecycle precondition failure.
fn precondition_message(err: &MonitorError) -> String {
    match err {
        MonitorError::AlreadyMeasuring => "Measurement is already running.".to_string(),
        MonitorError::NotMeasuring => "No measurement is currently running.".to_string(),
        other => other.to_string(),
    }
}

fn scheduling_message(err: MonitorError) -> String {
    match err {
        MonitorError::Scheduling(message) => message,
        other => other.to_string(),
    }
}
