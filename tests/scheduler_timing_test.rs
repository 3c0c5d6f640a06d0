//! Scheduler timing on a paused Tokio clock.

use capmon::scheduler::sequence::{parse_steps, SequenceAction, SequenceStep};
use capmon::scheduler::{ActionScheduler, SchedulerDue};
use serde_json::json;
use std::time::Duration;
use tokio::time::Instant;

fn scheduler() -> ActionScheduler {
    ActionScheduler::new(Duration::from_secs(1), Duration::from_millis(100))
}

#[tokio::test(start_paused = true)]
async fn start_stop_export_sequence_fires_on_fine_ticks() {
    let mut sched = scheduler();
    let steps = parse_steps(&json!([
        {"action": "start_measurement", "time_offset": 0},
        {"action": "stop_measurement", "time_offset": 10, "duration": "10s"},
        {"action": "export_csv", "time_offset": 10.1}
    ]))
    .unwrap();

    let begin = Instant::now();
    sched.execute(steps).unwrap();

    let mut fired = Vec::new();
    while sched.is_sequence_active() {
        if let SchedulerDue::Step(due) = sched.next_due().await {
            fired.push((due.step.action, begin.elapsed()));
        }
    }

    let actions: Vec<_> = fired.iter().map(|(a, _)| a.clone()).collect();
    assert_eq!(
        actions,
        vec![
            SequenceAction::Start,
            SequenceAction::Stop,
            SequenceAction::Export
        ]
    );

    assert!(fired[0].1 < Duration::from_millis(100));
    assert!(fired[1].1 >= Duration::from_secs(10));
    assert!(fired[1].1 < Duration::from_millis(10_100));

    let done = fired[2].1;
    assert!(done >= Duration::from_millis(10_100), "{done:?}");
    assert!(done <= Duration::from_millis(10_210), "{done:?}");

    let status = sched.sequence_status().unwrap();
    assert!(!status.active);
    assert_eq!(status.completed_steps, 3);
    assert_eq!(status.halted, None);
}

#[tokio::test(start_paused = true)]
async fn out_of_order_offsets_run_in_list_order() {
    let mut sched = scheduler();
    sched
        .execute(vec![
            SequenceStep::new("start", 1.0),
            SequenceStep::new("clear", 0.0),
        ])
        .unwrap();

    let begin = Instant::now();
    let mut fired = Vec::new();
    while sched.is_sequence_active() {
        if let SchedulerDue::Step(due) = sched.next_due().await {
            fired.push((due.index, begin.elapsed()));
        }
    }

    // The second step is already due when the first fires, but waits one tick.
    assert_eq!(fired[0], (0, Duration::from_secs(1)));
    assert_eq!(fired[1], (1, Duration::from_millis(1100)));
}

#[tokio::test(start_paused = true)]
async fn schedule_bounds() {
    let mut sched = scheduler();

    let zero = sched.schedule_stop(Some(0.0), Some(0.0), true).unwrap_err();
    assert!(zero.to_string().contains("greater than 0"));
    assert!(zero.is_validation());

    let long = sched.schedule_stop(None, Some(1440.1), true).unwrap_err();
    assert!(long.to_string().contains("cannot exceed 24 hours"));

    assert!(!sched.has_pending_tasks());

    let max = sched.schedule_stop(Some(86_400.0), None, false).unwrap();
    assert_eq!(max.duration_seconds, 86_400.0);
    assert_eq!(max.duration_label, "24h 0m 0s");
    assert!(!max.auto_export);
}

#[tokio::test(start_paused = true)]
async fn delayed_stop_fires_on_first_coarse_tick_after_deadline() {
    let mut sched = scheduler();
    let begin = Instant::now();
    let task = sched.schedule_stop(Some(2.5), None, true).unwrap();

    let SchedulerDue::Tasks(due) = sched.next_due().await else {
        panic!("expected a task");
    };
    assert_eq!(due, vec![task]);
    assert_eq!(begin.elapsed(), Duration::from_secs(3));
    assert!(!sched.has_pending_tasks());
}

#[tokio::test(start_paused = true)]
async fn cancelled_tasks_never_fire() {
    let mut sched = scheduler();
    sched.schedule_stop(Some(1.0), None, true).unwrap();
    sched.schedule_stop(Some(2.0), None, true).unwrap();
    assert_eq!(sched.cancel_tasks(), 2);

    let waited = tokio::time::timeout(Duration::from_secs(10), sched.next_due()).await;
    assert!(waited.is_err());
}
