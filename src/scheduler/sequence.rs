//! Ordered measurement sequences.
//!
//! A sequence is a list of [`SequenceStep`]s, each with an offset in seconds from the
//! moment the sequence was accepted. Steps are planned externally and arrive as JSON:
//!
//! ```json
//! [
//!   {"action": "start_measurement", "time_offset": 0},
//!   {"action": "stop_measurement",  "time_offset": 10, "duration": "10s"},
//!   {"action": "export_csv",        "time_offset": 10.1}
//! ]
//! ```
//!
//! Action names are accepted in both the short (`start`) and the tool-name
//! (`start_measurement`) spelling. Anything else is kept as
//! [`SequenceAction::Unknown`] so the runner can skip it with a warning.

use crate::error::{MonitorError, MonitorResult};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::time::Instant;
use uuid::Uuid;

/// What a sequence step does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SequenceAction {
    /// Start a measurement
    Start,
    /// Stop the measurement
    Stop,
    /// Export the buffer to CSV
    Export,
    /// Clear the live buffer
    Clear,
    /// Do nothing
    Wait,
    /// Unrecognised action name, skipped at run time.
    Unknown(String),
}

impl SequenceAction {
    /// Canonical tool name.
    pub fn as_str(&self) -> &str {
        match self {
            SequenceAction::Start => "start_measurement",
            SequenceAction::Stop => "stop_measurement",
            SequenceAction::Export => "export_csv",
            SequenceAction::Clear => "clear_data",
            SequenceAction::Wait => "wait",
            SequenceAction::Unknown(name) => name,
        }
    }
}

impl From<&str> for SequenceAction {
    fn from(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "start" | "start_measurement" => SequenceAction::Start,
            "stop" | "stop_measurement" => SequenceAction::Stop,
            "export" | "export_csv" => SequenceAction::Export,
            "clear" | "clear_data" => SequenceAction::Clear,
            "wait" => SequenceAction::Wait,
            _ => SequenceAction::Unknown(name.to_string()),
        }
    }
}

impl From<String> for SequenceAction {
    fn from(name: String) -> Self {
        SequenceAction::from(name.as_str())
    }
}

impl From<SequenceAction> for String {
    fn from(action: SequenceAction) -> Self {
        action.as_str().to_string()
    }
}

impl fmt::Display for SequenceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One timed step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceStep {
    /// What to do
    pub action: SequenceAction,
    /// Seconds from sequence start
    pub time_offset: f64,
    /// Display label such as "10s"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
}

impl SequenceStep {
    /// Step with no duration label.
    pub fn new(action: impl Into<SequenceAction>, time_offset: f64) -> Self {
        Self {
            action: action.into(),
            time_offset,
            duration: None,
        }
    }

    /// Attach a display label.
    pub fn with_duration(mut self, label: impl Into<String>) -> Self {
        self.duration = Some(label.into());
        self
    }

    /// `"At 10.0s - stop_measurement for 10s"`
    pub fn summary_line(&self) -> String {
        let mut line = format!(
            "At {} - {}",
            format_time_offset(self.time_offset),
            self.action
        );
        if let Some(label) = &self.duration {
            line.push_str(" for ");
            line.push_str(label);
        }
        line
    }
}

/// Parse planner output, reporting the first offending step by index.
pub fn parse_steps(value: &serde_json::Value) -> MonitorResult<Vec<SequenceStep>> {
    let items = value.as_array().ok_or_else(|| MonitorError::SequenceValidation {
        index: 0,
        reason: "sequence must be an array of steps".into(),
    })?;

    let steps = items
        .iter()
        .enumerate()
        .map(|(index, item)| {
            let invalid = |reason: &str| MonitorError::SequenceValidation {
                index,
                reason: reason.to_string(),
            };
            let object = item.as_object().ok_or_else(|| invalid("step must be an object"))?;
            let action = object
                .get("action")
                .and_then(|a| a.as_str())
                .ok_or_else(|| invalid("missing 'action'"))?;
            let time_offset = object
                .get("time_offset")
                .and_then(|t| t.as_f64())
                .ok_or_else(|| invalid("missing 'time_offset'"))?;
            let duration = object
                .get("duration")
                .and_then(|d| d.as_str())
                .map(str::to_string);
            Ok(SequenceStep {
                action: SequenceAction::from(action),
                time_offset,
                duration,
            })
        })
        .collect::<MonitorResult<Vec<_>>>()?;

    validate_steps(&steps)?;
    Ok(steps)
}

/// Check a whole sequence before anything runs.
pub fn validate_steps(steps: &[SequenceStep]) -> MonitorResult<()> {
    if steps.is_empty() {
        return Err(MonitorError::SequenceValidation {
            index: 0,
            reason: "No sequence provided to execute".into(),
        });
    }
    for (index, step) in steps.iter().enumerate() {
        if step.action.as_str().trim().is_empty() {
            return Err(MonitorError::SequenceValidation {
                index,
                reason: "missing 'action'".into(),
            });
        }
        if !step.time_offset.is_finite() || step.time_offset < 0.0 {
            return Err(MonitorError::SequenceValidation {
                index,
                reason: format!(
                    "'time_offset' must be a non-negative number (got {})",
                    step.time_offset
                ),
            });
        }
    }
    Ok(())
}

/// Format an offset as `"5.0s"`, `"1m 5.0s"` or `"1h 2m 3.0s"`.
pub fn format_time_offset(seconds: f64) -> String {
    if seconds < 60.0 {
        format!("{seconds:.1}s")
    } else if seconds < 3600.0 {
        let minutes = (seconds / 60.0).floor() as u64;
        format!("{minutes}m {:.1}s", seconds % 60.0)
    } else {
        let hours = (seconds / 3600.0).floor() as u64;
        let minutes = ((seconds % 3600.0) / 60.0).floor() as u64;
        format!("{hours}h {minutes}m {:.1}s", seconds % 60.0)
    }
}

/// Multi-line plan summary, one line per step.
pub fn summarize(steps: &[SequenceStep]) -> String {
    steps
        .iter()
        .map(SequenceStep::summary_line)
        .collect::<Vec<_>>()
        .join("\n")
}

/// The active sequence and its cursor.
#[derive(Debug, Clone)]
pub struct SequenceRun {
    pub(crate) id: Uuid,
    pub(crate) steps: Vec<SequenceStep>,
    pub(crate) cursor: usize,
    pub(crate) started: Instant,
    pub(crate) started_wall: DateTime<Local>,
    pub(crate) halted: Option<String>,
}

impl SequenceRun {
    pub(crate) fn new(steps: Vec<SequenceStep>, now: Instant) -> Self {
        Self {
            id: Uuid::new_v4(),
            steps,
            cursor: 0,
            started: now,
            started_wall: Local::now(),
            halted: None,
        }
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.cursor >= self.steps.len()
    }

    pub(crate) fn is_active(&self) -> bool {
        self.halted.is_none() && !self.is_complete()
    }

    pub(crate) fn status(&self, now: Instant) -> SequenceStatus {
        SequenceStatus {
            run_id: self.id,
            started_at: self.started_wall,
            elapsed_seconds: now.saturating_duration_since(self.started).as_secs_f64(),
            completed_steps: self.cursor,
            total_steps: self.steps.len(),
            next_step: self.steps.get(self.cursor).cloned().filter(|_| self.is_active()),
            halted: self.halted.clone(),
            active: self.is_active(),
        }
    }
}

/// Snapshot of the current or last sequence.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SequenceStatus {
    /// Run identifier
    pub run_id: Uuid,
    /// Wall-clock start
    pub started_at: DateTime<Local>,
    /// Seconds since start
    pub elapsed_seconds: f64,
    /// Steps executed so far
    pub completed_steps: usize,
    /// Steps in the run
    pub total_steps: usize,
    /// Step the cursor points at
    pub next_step: Option<SequenceStep>,
    /// Why the sequence stopped early, if it did
    pub halted: Option<String>,
    /// Still running
    pub active: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn accepts_both_action_spellings() {
        let steps = parse_steps(&json!([
            {"action": "start", "time_offset": 0},
            {"action": "stop_measurement", "time_offset": 10, "duration": "10s"},
            {"action": "EXPORT_CSV", "time_offset": 10.1},
            {"action": "dance", "time_offset": 11}
        ]))
        .unwrap();

        assert_eq!(steps[0].action, SequenceAction::Start);
        assert_eq!(steps[1].action, SequenceAction::Stop);
        assert_eq!(steps[1].duration.as_deref(), Some("10s"));
        assert_eq!(steps[2].action, SequenceAction::Export);
        assert_eq!(steps[3].action, SequenceAction::Unknown("dance".into()));
    }

    #[test]
    fn validation_reports_offending_index() {
        let err = parse_steps(&json!([
            {"action": "start", "time_offset": 0},
            {"time_offset": 5}
        ]))
        .unwrap_err();
        assert!(matches!(err, MonitorError::SequenceValidation { index: 1, .. }));

        let err = parse_steps(&json!([
            {"action": "start", "time_offset": 0},
            {"action": "stop", "time_offset": -1}
        ]))
        .unwrap_err();
        assert!(matches!(err, MonitorError::SequenceValidation { index: 1, .. }));

        assert!(parse_steps(&json!([])).is_err());
        assert!(parse_steps(&json!({"action": "start"})).is_err());
        assert!(validate_steps(&[SequenceStep::new("wait", f64::INFINITY)]).is_err());
    }

    #[test]
    fn serde_round_trip_uses_tool_names() {
        let step = SequenceStep::new("clear", 2.5);
        let encoded = serde_json::to_value(&step).unwrap();
        assert_eq!(encoded, json!({"action": "clear_data", "time_offset": 2.5}));
        let decoded: SequenceStep = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded, step);
    }

    #[test]
    fn formats_offsets_and_summary() {
        assert_eq!(format_time_offset(10.0), "10.0s");
        assert_eq!(format_time_offset(65.0), "1m 5.0s");
        assert_eq!(format_time_offset(3723.0), "1h 2m 3.0s");

        let summary = summarize(&[
            SequenceStep::new("start", 0.0),
            SequenceStep::new("stop", 10.0).with_duration("10s"),
        ]);
        assert_eq!(
            summary,
            "At 0.0s - start_measurement\nAt 10.0s - stop_measurement for 10s"
        );
    }
}
