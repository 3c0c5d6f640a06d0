//! Tool-call behaviour end to end, through the executor and the actor.

use capmon::acquisition::AcquisitionSettings;
use capmon::actor::MonitorHandle;
use capmon::controller::{ControllerSettings, MeasurementController};
use capmon::hardware::synthetic::SyntheticInstrument;
use capmon::hardware::{InstrumentFactory, InstrumentPort};
use capmon::scheduler::sequence::SequenceStep;
use capmon::scheduler::ActionScheduler;
use capmon::tools::{Pending, ToolCall, ToolExecutor, ToolNotification};
use serde_json::json;
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::broadcast;
use tokio_test::assert_ok;

fn executor(export_dir: &Path) -> ToolExecutor {
    let factory: InstrumentFactory =
        Box::new(|| Box::new(SyntheticInstrument::new()) as Box<dyn InstrumentPort>);
    ToolExecutor::new(
        MeasurementController::new(ControllerSettings {
            acquisition: AcquisitionSettings {
                sample_period: Duration::from_millis(20),
                ..Default::default()
            },
            stop_timeout: Duration::from_millis(500),
            ..Default::default()
        }),
        ActionScheduler::new(Duration::from_millis(50), Duration::from_millis(20)),
        factory,
        export_dir,
    )
}

async fn wait_for(
    notifications: &mut broadcast::Receiver<ToolNotification>,
    tool: &str,
) -> ToolNotification {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let notification = notifications.recv().await.unwrap();
            if notification.tool == tool {
                return notification;
            }
        }
    })
    .await
    .expect("notification did not arrive")
}

#[tokio::test]
async fn schedule_is_rejected_while_measuring() {
    let dir = TempDir::new().unwrap();
    let mut executor = executor(dir.path());

    assert!(executor.start_measurement().success);
    let rejected = executor.schedule_measurement(Some(5.0), None, true);
    assert!(!rejected.success);
    assert_eq!(
        rejected.message,
        "A measurement is already running. Stop it first."
    );
    assert!(!executor.scheduler().has_pending_tasks());

    executor.stop_measurement().await;
}

#[tokio::test]
async fn invalid_schedule_changes_nothing() {
    let dir = TempDir::new().unwrap();
    let mut executor = executor(dir.path());

    let zero = executor.schedule_measurement(Some(0.0), Some(0.0), true);
    assert!(!zero.success);
    assert_eq!(
        zero.message,
        "Duration must be greater than 0. Please specify a valid duration."
    );

    let long = executor.schedule_measurement(None, Some(1440.1), true);
    assert!(!long.success);
    assert!(long.message.contains("24 hours"));

    assert!(!executor.controller().is_measuring());
    assert!(!executor.scheduler().has_pending_tasks());
}

#[tokio::test]
async fn schedule_starts_now_and_reports_stop_time() {
    let dir = TempDir::new().unwrap();
    let mut executor = executor(dir.path());

    let scheduled = executor.schedule_measurement(Some(125.0), None, false);
    assert!(scheduled.success, "{}", scheduled.message);
    assert!(scheduled
        .message
        .starts_with("Measurement scheduled for 2m 5s. Will stop at "));
    assert!(executor.controller().is_measuring());
    assert_eq!(executor.scheduler().pending_tasks().len(), 1);

    let data = scheduled.data.unwrap();
    assert_eq!(data["duration_seconds"], 125.0);
    assert_eq!(data["auto_export"], false);

    executor.stop_measurement().await;
}

#[tokio::test]
async fn status_reports_counts_and_schedule() {
    let dir = TempDir::new().unwrap();
    let mut executor = executor(dir.path());

    let idle = executor.get_status();
    assert_eq!(idle.message, "Measurement is stopped. Total samples: 0, Errors: 0");

    executor.start_measurement();
    let running = executor.get_status();
    assert!(running.message.starts_with("Measurement is running. Samples: "));
    let data = running.data.unwrap();
    assert_eq!(data["is_measuring"], true);
    assert_eq!(data["mode"], "capacitance");
    assert_eq!(data["scheduled_tasks"], 0);
    assert_eq!(data["sequence_active"], false);

    executor.stop_measurement().await;
    assert!(executor.clear_data().success);
    assert_eq!(executor.controller().sample_count(), 0);
}

/// Apply worker events and run due steps until the sequence is no longer active.
async fn drive_sequence(executor: &mut ToolExecutor) -> Vec<ToolNotification> {
    let mut notifications = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), async {
        while executor.scheduler().is_sequence_active() {
            match executor.next_pending().await {
                Pending::Worker(event) => executor.controller_mut().handle_worker_event(event),
                Pending::Due(due) => notifications.extend(executor.run_due(due).await),
            }
        }
    })
    .await
    .expect("sequence did not finish");
    notifications
}

#[tokio::test]
async fn lifecycle_failure_in_a_step_does_not_halt_the_sequence() {
    let dir = TempDir::new().unwrap();
    let mut executor = executor(dir.path());

    let started = executor.execute_measurement_sequence(vec![
        SequenceStep::new("stop", 0.0),
        SequenceStep::new("start", 0.05),
        SequenceStep::new("stop", 0.15),
    ]);
    assert!(started.success);
    assert!(started.message.starts_with("Measurement sequence started:\n"));

    let notifications = drive_sequence(&mut executor).await;
    assert_eq!(notifications.len(), 3);

    assert_eq!(notifications[0].tool, "stop_measurement");
    assert!(!notifications[0].result.success);
    assert_eq!(
        notifications[0].result.message,
        "No measurement is currently running."
    );
    assert!(notifications[1].result.success, "{}", notifications[1].result.message);
    assert!(notifications[2].result.success, "{}", notifications[2].result.message);

    let status = executor.get_sequence_status();
    assert_eq!(status.message, "Sequence completed: 3 steps");
    assert!(!executor.controller().is_measuring());
}

#[tokio::test]
async fn storage_failure_in_a_step_halts_the_sequence() {
    let dir = TempDir::new().unwrap();
    // A regular file where the export directory should be.
    let blocked = dir.path().join("exports");
    std::fs::write(&blocked, "").unwrap();
    let mut executor = executor(&blocked);

    let started = executor.execute_measurement_sequence(vec![
        SequenceStep::new("start", 0.0),
        SequenceStep::new("stop", 0.15),
        SequenceStep::new("export", 0.2),
        SequenceStep::new("clear", 0.25),
    ]);
    assert!(started.success);

    let notifications = drive_sequence(&mut executor).await;
    assert_eq!(notifications.len(), 3);
    let export = &notifications[2];
    assert!(!export.result.success);
    assert!(
        export.result.message.starts_with("Sequence halted at step 2"),
        "{}",
        export.result.message
    );

    let status = executor.get_sequence_status();
    assert!(status.message.starts_with("Sequence halted after "), "{}", status.message);

    // The clear step never runs.
    assert!(executor.controller().sample_count() > 0);
}

#[tokio::test]
async fn malformed_sequence_is_rejected_with_index() {
    let dir = TempDir::new().unwrap();
    let mut executor = executor(dir.path());

    let result = executor.call(ToolCall::ExecuteMeasurementSequence {
        sequence: json!([
            {"action": "start", "time_offset": 0},
            {"action": "stop"}
        ]),
    })
    .await;
    assert!(!result.success);
    assert!(result.message.contains("step 1"), "{}", result.message);
    assert!(executor.scheduler().sequence_status().is_none());
}

#[tokio::test]
async fn actor_runs_planned_sequence_and_exports() {
    let dir = TempDir::new().unwrap();
    let (handle, task) = MonitorHandle::spawn_with(executor(dir.path()));
    let mut notifications = handle.notifications();

    let call = ToolCall::from_json(
        "execute_measurement_sequence",
        json!({
            "sequence": [
                {"action": "start_measurement", "time_offset": 0},
                {"action": "stop_measurement", "time_offset": 0.3},
                {"action": "export_csv", "time_offset": 0.35}
            ]
        }),
    )
    .unwrap();
    let started = assert_ok!(handle.call(call).await);
    assert!(started.success, "{}", started.message);
    assert_eq!(started.data.unwrap()["total_steps"], 3);

    let exported = wait_for(&mut notifications, "export_csv").await;
    assert!(exported.result.success, "{}", exported.result.message);
    let exported_files = std::fs::read_dir(dir.path()).unwrap().count();
    assert_eq!(exported_files, 1);

    let samples = assert_ok!(handle.samples(None).await);
    assert!(!samples.is_empty());

    let status = assert_ok!(handle.call(ToolCall::GetSequenceStatus).await);
    assert!(status.message.starts_with("Sequence completed"));

    assert_ok!(handle.shutdown().await);
    assert_ok!(task.await);
}

#[tokio::test]
async fn actor_runs_delayed_stop_with_auto_export() {
    let dir = TempDir::new().unwrap();
    let (handle, task) = MonitorHandle::spawn_with(executor(dir.path()));
    let mut notifications = handle.notifications();

    let scheduled = handle
        .call(ToolCall::ScheduleMeasurement {
            duration_seconds: Some(0.2),
            duration_minutes: None,
            auto_export: true,
        })
        .await
        .unwrap();
    assert!(scheduled.success, "{}", scheduled.message);

    let stopped = wait_for(&mut notifications, "stop_measurement").await;
    assert!(stopped.result.success);
    let exported = wait_for(&mut notifications, "export_csv").await;
    assert!(exported.result.success, "{}", exported.result.message);

    let status = handle.call(ToolCall::GetStatus).await.unwrap();
    assert_eq!(status.data.unwrap()["is_measuring"], false);

    handle.shutdown().await.unwrap();
    task.await.unwrap();
}
