//! One-off delayed-stop tasks.

use crate::error::{MonitorError, MonitorResult};
use chrono::{DateTime, Local};
use serde::Serialize;
use tokio::time::Instant;

/// Longest schedulable duration (24 h), inclusive.
pub const MAX_DURATION_SECONDS: f64 = 86_400.0;

/// A pending "stop the measurement at T" request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScheduledTask {
    /// Identifier, unique within one scheduler
    pub id: u64,
    /// Export the buffer after stopping
    pub auto_export: bool,
    /// Requested duration
    pub duration_seconds: f64,
    /// Human-readable duration ("1h 2m 3s")
    pub duration_label: String,
    /// Wall-clock stop time, for display
    pub scheduled_time: DateTime<Local>,
    /// Monotonic stop time, for evaluation
    #[serde(skip)]
    pub deadline: Instant,
}

impl ScheduledTask {
    /// Whether the deadline has passed at `now`.
    pub fn is_due(&self, now: Instant) -> bool {
        now >= self.deadline
    }
}

/// Combine the optional components into a validated total in seconds.
///
/// The total must be in `(0, 86400]`.
pub fn validate_duration(seconds: Option<f64>, minutes: Option<f64>) -> MonitorResult<f64> {
    let total = seconds.unwrap_or(0.0) + minutes.unwrap_or(0.0) * 60.0;

    if !total.is_finite() {
        return Err(MonitorError::Scheduling(
            "Duration must be a finite number of seconds".into(),
        ));
    }
    if total <= 0.0 {
        return Err(MonitorError::Scheduling(
            "Duration must be greater than 0. Please specify a valid duration.".into(),
        ));
    }
    if total > MAX_DURATION_SECONDS {
        return Err(MonitorError::Scheduling(
            "Duration cannot exceed 24 hours. Please specify a shorter duration.".into(),
        ));
    }
    Ok(total)
}

/// Format a duration as `"45s"`, `"2m 5s"` or `"1h 0m 30s"` (whole seconds).
pub fn format_duration(total_seconds: f64) -> String {
    let total = total_seconds.max(0.0) as u64;
    let (hours, minutes, seconds) = (total / 3600, (total % 3600) / 60, total % 60);
    if hours > 0 {
        format!("{hours}h {minutes}m {seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else {
        format!("{seconds}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_bounds() {
        assert!(validate_duration(None, None).is_err());
        assert!(validate_duration(Some(0.0), Some(0.0)).is_err());
        assert!(validate_duration(Some(-5.0), None).is_err());
        assert!(validate_duration(None, Some(1440.1)).is_err());
        assert!(validate_duration(Some(f64::NAN), None).is_err());

        assert_eq!(validate_duration(Some(86_400.0), None).unwrap(), 86_400.0);
        assert_eq!(validate_duration(None, Some(1440.0)).unwrap(), 86_400.0);
        assert_eq!(validate_duration(Some(30.0), Some(1.5)).unwrap(), 120.0);
    }

    #[test]
    fn zero_duration_message() {
        let err = validate_duration(Some(0.0), None).unwrap_err();
        assert!(err.to_string().contains("must be greater than 0"));
        assert!(err.is_validation());
    }

    #[test]
    fn formats_durations() {
        assert_eq!(format_duration(45.0), "45s");
        assert_eq!(format_duration(125.0), "2m 5s");
        assert_eq!(format_duration(3630.0), "1h 0m 30s");
    }
}
