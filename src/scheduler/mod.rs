//! Action Scheduler
//!
//! Two independent timing mechanisms drive the measurement lifecycle:
//!
//! - **Delayed-stop tasks** ([`delayed_stop`]): "stop (and export) in N seconds". Any
//!   number may be pending; a coarse poll (1 s by default) runs every task whose
//!   deadline has passed.
//! - **Sequence** ([`sequence`]): one ordered list of timed steps. A fine poll (100 ms
//!   by default, first tick immediate) executes at most one due step per tick.
//!
//! The scheduler never performs actions itself. [`ActionScheduler::next_due`] resolves
//! to whatever is due and the caller performs it, reporting a failed sequence step back
//! through [`ActionScheduler::halt_sequence`]. All deadlines use the monotonic
//! [`tokio::time::Instant`], so wall-clock changes do not affect timing and tests can
//! run with a paused clock.
//!
//! # Example
//!
//! ```no_run
//! use capmon::scheduler::{ActionScheduler, SchedulerDue};
//! use capmon::scheduler::sequence::SequenceStep;
//! use std::time::Duration;
//!
//! # async fn example() -> capmon::error::MonitorResult<()> {
//! let mut scheduler = ActionScheduler::new(Duration::from_secs(1), Duration::from_millis(100));
//! scheduler.execute(vec![
//!     SequenceStep::new("start", 0.0),
//!     SequenceStep::new("stop", 10.0),
//! ])?;
//!
//! while scheduler.is_sequence_active() {
//!     if let SchedulerDue::Step(due) = scheduler.next_due().await {
//!         println!("step {} -> {}", due.index, due.step.action);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod delayed_stop;
pub mod sequence;

pub use delayed_stop::{format_duration, validate_duration, ScheduledTask};
pub use sequence::{SequenceAction, SequenceStatus, SequenceStep};

use crate::error::MonitorResult;
use chrono::Local;
use sequence::{validate_steps, SequenceRun};
use std::time::Duration;
use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A sequence step whose time has come.
#[derive(Debug, Clone, PartialEq)]
pub struct DueStep {
    /// Sequence the step belongs to
    pub run_id: Uuid,
    /// Position in the sequence
    pub index: usize,
    /// The step itself
    pub step: SequenceStep,
}

/// What [`ActionScheduler::next_due`] resolved to.
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerDue {
    /// Delayed-stop tasks whose deadline passed, already removed from the schedule.
    Tasks(Vec<ScheduledTask>),
    /// The next sequence step; the cursor has already advanced past it.
    Step(DueStep),
}

/// Delayed-stop tasks plus at most one active sequence.
pub struct ActionScheduler {
    tasks: Vec<ScheduledTask>,
    next_task_id: u64,
    sequence: Option<SequenceRun>,
    coarse: Interval,
    fine: Interval,
}

impl ActionScheduler {
    /// Create a scheduler. Must be called inside a Tokio runtime.
    pub fn new(coarse_period: Duration, fine_period: Duration) -> Self {
        let mut coarse = time::interval(coarse_period.max(Duration::from_millis(1)));
        coarse.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut fine = time::interval(fine_period.max(Duration::from_millis(1)));
        fine.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            tasks: Vec::new(),
            next_task_id: 1,
            sequence: None,
            coarse,
            fine,
        }
    }

    // =========================================================================
    // Delayed-stop tasks
    // =========================================================================

    /// Add a task stopping the measurement after the given duration.
    ///
    /// The duration is `seconds + 60 × minutes` and must lie in `(0, 86400]`.
    pub fn schedule_stop(
        &mut self,
        seconds: Option<f64>,
        minutes: Option<f64>,
        auto_export: bool,
    ) -> MonitorResult<ScheduledTask> {
        let total = validate_duration(seconds, minutes)?;
        let offset = Duration::from_secs_f64(total);

        let was_idle = self.tasks.is_empty();
        let task = ScheduledTask {
            id: self.next_task_id,
            auto_export,
            duration_seconds: total,
            duration_label: format_duration(total),
            scheduled_time: Local::now()
                + chrono::Duration::milliseconds(offset.as_millis() as i64),
            deadline: Instant::now() + offset,
        };
        self.next_task_id += 1;
        self.tasks.push(task.clone());

        if was_idle {
            // First check one coarse period from now.
            self.coarse.reset();
        }
        info!(
            task = task.id,
            duration = %task.duration_label,
            auto_export,
            "Scheduled measurement stop"
        );
        Ok(task)
    }

    /// Pending tasks in scheduling order.
    pub fn pending_tasks(&self) -> &[ScheduledTask] {
        &self.tasks
    }

    /// Whether any delayed stop is still waiting.
    pub fn has_pending_tasks(&self) -> bool {
        !self.tasks.is_empty()
    }

    /// Drop every pending task; returns how many were removed.
    pub fn cancel_tasks(&mut self) -> usize {
        let count = self.tasks.len();
        self.tasks.clear();
        count
    }

    /// Remove and return every task due at `now`, in scheduling order.
    pub fn take_due_tasks(&mut self, now: Instant) -> Vec<ScheduledTask> {
        let (due, pending): (Vec<_>, Vec<_>) =
            self.tasks.drain(..).partition(|task| task.is_due(now));
        self.tasks = pending;
        if !due.is_empty() && self.tasks.is_empty() {
            debug!("No scheduled tasks left; coarse poll inactive");
        }
        due
    }

    // =========================================================================
    // Sequence
    // =========================================================================

    /// Validate and start a sequence, replacing any sequence in flight.
    ///
    /// Validation is all-or-nothing: on error the current sequence is untouched.
    pub fn execute(&mut self, steps: Vec<SequenceStep>) -> MonitorResult<Uuid> {
        validate_steps(&steps)?;

        if let Some(previous) = self.sequence.as_ref().filter(|run| run.is_active()) {
            warn!(
                run_id = %previous.id,
                completed = previous.cursor,
                total = previous.steps.len(),
                "Replacing sequence in flight"
            );
        }

        let run = SequenceRun::new(steps, Instant::now());
        let id = run.id;
        info!(run_id = %id, steps = run.steps.len(), "Sequence started");
        self.sequence = Some(run);
        self.fine.reset_immediately();
        Ok(id)
    }

    /// If the step under the cursor is due at `now`, advance past it and return it.
    ///
    /// At most one step is returned per call, even when several are overdue.
    pub fn next_due_step(&mut self, now: Instant) -> Option<DueStep> {
        let run = self.sequence.as_mut().filter(|run| run.is_active())?;
        let elapsed = now.saturating_duration_since(run.started).as_secs_f64();
        let step = &run.steps[run.cursor];
        if step.time_offset > elapsed {
            return None;
        }

        let due = DueStep {
            run_id: run.id,
            index: run.cursor,
            step: step.clone(),
        };
        run.cursor += 1;
        debug!(
            run_id = %run.id,
            index = due.index,
            action = %due.step.action,
            elapsed,
            "Sequence step due"
        );
        if run.is_complete() {
            info!(run_id = %run.id, elapsed, "Sequence completed");
        }
        Some(due)
    }

    /// Stop the sequence `run_id` permanently after a failed step.
    pub fn halt_sequence(&mut self, run_id: Uuid, reason: impl Into<String>) {
        if let Some(run) = self.sequence.as_mut().filter(|run| run.id == run_id) {
            let reason = reason.into();
            warn!(run_id = %run.id, step = run.cursor.saturating_sub(1), %reason, "Sequence halted");
            run.halted = Some(reason);
        }
    }

    /// Cancel the active sequence. Returns `false` if none was active.
    pub fn cancel_sequence(&mut self) -> bool {
        match self.sequence.as_mut().filter(|run| run.is_active()) {
            Some(run) => {
                run.halted = Some("cancelled".into());
                info!(run_id = %run.id, "Sequence cancelled");
                true
            }
            None => false,
        }
    }

    /// Whether a sequence is running (neither finished, halted nor cancelled).
    pub fn is_sequence_active(&self) -> bool {
        self.sequence.as_ref().is_some_and(SequenceRun::is_active)
    }

    /// Status of the current or most recent sequence.
    pub fn sequence_status(&self) -> Option<SequenceStatus> {
        self.sequence.as_ref().map(|run| run.status(Instant::now()))
    }

    // =========================================================================
    // Polling
    // =========================================================================

    /// Wait until a task or sequence step is due.
    ///
    /// Pends forever while nothing is scheduled. Cancel-safe: dropping the future
    /// loses no work, so it can sit in a `select!` loop.
    pub async fn next_due(&mut self) -> SchedulerDue {
        loop {
            let tasks_pending = self.has_pending_tasks();
            let sequence_active = self.is_sequence_active();

            tokio::select! {
                _ = self.coarse.tick(), if tasks_pending => {
                    let due = self.take_due_tasks(Instant::now());
                    if !due.is_empty() {
                        return SchedulerDue::Tasks(due);
                    }
                }
                _ = self.fine.tick(), if sequence_active => {
                    if let Some(step) = self.next_due_step(Instant::now()) {
                        return SchedulerDue::Step(step);
                    }
                }
                else => std::future::pending::<()>().await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduler() -> ActionScheduler {
        ActionScheduler::new(Duration::from_secs(1), Duration::from_millis(100))
    }

    #[tokio::test(start_paused = true)]
    async fn tasks_are_tracked_independently() {
        let mut sched = scheduler();
        let a = sched.schedule_stop(Some(2.0), None, true).unwrap();
        let b = sched.schedule_stop(None, Some(0.1), false).unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(sched.pending_tasks().len(), 2);

        let start = Instant::now();
        let SchedulerDue::Tasks(first) = sched.next_due().await else {
            panic!("expected tasks");
        };
        assert_eq!(first, vec![a]);
        assert_eq!(start.elapsed(), Duration::from_secs(2));

        let SchedulerDue::Tasks(second) = sched.next_due().await else {
            panic!("expected tasks");
        };
        assert_eq!(second, vec![b]);
        assert_eq!(start.elapsed(), Duration::from_secs(6));
        assert!(!sched.has_pending_tasks());
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_schedule_has_no_effect() {
        let mut sched = scheduler();
        assert!(sched.schedule_stop(Some(0.0), Some(0.0), true).is_err());
        assert!(sched.schedule_stop(None, Some(1440.1), true).is_err());
        assert!(!sched.has_pending_tasks());
        assert!(sched.schedule_stop(Some(86_400.0), None, true).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn one_step_per_tick() {
        let mut sched = scheduler();
        sched
            .execute(vec![
                SequenceStep::new("start", 0.0),
                SequenceStep::new("wait", 0.0),
                SequenceStep::new("stop", 0.0),
            ])
            .unwrap();

        let start = Instant::now();
        let mut fired = Vec::new();
        while sched.is_sequence_active() {
            if let SchedulerDue::Step(due) = sched.next_due().await {
                fired.push((due.index, start.elapsed()));
            }
        }
        assert_eq!(
            fired,
            vec![
                (0, Duration::ZERO),
                (1, Duration::from_millis(100)),
                (2, Duration::from_millis(200)),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_sequence_keeps_current_one() {
        let mut sched = scheduler();
        let id = sched
            .execute(vec![SequenceStep::new("start", 0.0), SequenceStep::new("stop", 5.0)])
            .unwrap();
        assert!(sched
            .execute(vec![SequenceStep::new("start", -1.0)])
            .is_err());
        assert_eq!(sched.sequence_status().map(|s| s.run_id), Some(id));
        assert!(sched.is_sequence_active());
    }

    #[tokio::test(start_paused = true)]
    async fn halted_sequence_stops_firing() {
        let mut sched = scheduler();
        let id = sched
            .execute(vec![SequenceStep::new("start", 0.0), SequenceStep::new("stop", 0.5)])
            .unwrap();

        let SchedulerDue::Step(first) = sched.next_due().await else {
            panic!("expected step");
        };
        assert_eq!(first.index, 0);
        sched.halt_sequence(id, "Measurement is already running");

        assert!(!sched.is_sequence_active());
        let status = sched.sequence_status().unwrap();
        assert_eq!(status.completed_steps, 1);
        assert_eq!(status.halted.as_deref(), Some("Measurement is already running"));
        assert!(status.next_step.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_and_replace() {
        let mut sched = scheduler();
        assert!(!sched.cancel_sequence());

        let first = sched.execute(vec![SequenceStep::new("stop", 60.0)]).unwrap();
        let second = sched.execute(vec![SequenceStep::new("stop", 1.0)]).unwrap();
        assert_ne!(first, second);
        // Halting the replaced run is ignored.
        sched.halt_sequence(first, "stale");
        assert!(sched.is_sequence_active());

        assert!(sched.cancel_sequence());
        assert!(!sched.is_sequence_active());
        assert_eq!(
            sched.sequence_status().and_then(|s| s.halted).as_deref(),
            Some("cancelled")
        );
    }
}
