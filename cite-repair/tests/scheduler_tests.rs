//! Job scheduler integration tests
//!
//! Timers run on tokio's paused clock; `next_run` values are wall-clock
//! timestamps, so they are compared against `Utc::now()` with a tolerance.

mod helpers;

use chrono::Utc;
use cite_common::config::SchedulerSettings;
use cite_common::{EventBus, RepairEvent};
use cite_repair::models::{JobState, Priority, ScheduleOptions};
use cite_repair::scheduler::{HealthIssueKind, MAX_SCHEDULE_MS};
use cite_repair::services::{FnOperation, GuardedOperation};
use cite_repair::{JobScheduler, RepairError};
use helpers::memory_store;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn settings() -> SchedulerSettings {
    SchedulerSettings {
        max_concurrent_jobs: 2,
        retry_delay_ms: 1_000,
        back_pressure_delay_ms: 500,
        health_check_interval_ms: 60_000,
        stuck_job_threshold_ms: 1_000,
        overdue_grace_ms: 500,
        initial_delay_ms: 0,
    }
}

/// Counts its runs; fails every run when `fail` is set
fn counting(name: &str, calls: &Arc<AtomicUsize>, fail: bool) -> Arc<dyn GuardedOperation> {
    let calls = Arc::clone(calls);
    Arc::new(FnOperation::new(name, move |_input: Value| {
        let calls = Arc::clone(&calls);
        async move {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if fail {
                anyhow::bail!("link check {} failed", n);
            }
            Ok(json!({ "run": n }))
        }
    }))
}

/// Never finishes
fn hanging(name: &str) -> Arc<dyn GuardedOperation> {
    Arc::new(FnOperation::new(name, |_input: Value| {
        futures::future::pending::<anyhow::Result<Value>>()
    }))
}

fn drain(rx: &mut tokio::sync::broadcast::Receiver<RepairEvent>) -> Vec<RepairEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

// ============================================================================
// Scheduling
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_schedule_rejects_zero_interval_and_duplicates() {
    let scheduler = JobScheduler::new(settings());
    let calls = Arc::new(AtomicUsize::new(0));

    let zero = scheduler.schedule("zero", counting("check", &calls, false), ScheduleOptions::every(0));
    assert!(matches!(zero, Err(RepairError::Scheduler(_))));

    scheduler
        .schedule("links", counting("check", &calls, false), ScheduleOptions::every(1_000))
        .unwrap();
    let duplicate =
        scheduler.schedule("links", counting("check", &calls, false), ScheduleOptions::every(1_000));
    assert!(matches!(duplicate, Err(RepairError::Scheduler(_))));
}

#[tokio::test(start_paused = true)]
async fn test_schedule_rejects_out_of_range_interval_and_delay() {
    let scheduler = JobScheduler::new(settings());
    let calls = Arc::new(AtomicUsize::new(0));

    let forever = scheduler.schedule(
        "forever",
        counting("check", &calls, false),
        ScheduleOptions::every(u64::MAX).initial_delay_ms(0),
    );
    assert!(matches!(forever, Err(RepairError::Scheduler(_))));

    let late = scheduler.schedule(
        "late",
        counting("check", &calls, false),
        ScheduleOptions::every(1_000).initial_delay_ms(MAX_SCHEDULE_MS + 1),
    );
    assert!(matches!(late, Err(RepairError::Scheduler(_))));
    assert!(scheduler.entries().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_longest_interval_job_runs_and_rearms() {
    let scheduler = JobScheduler::new(settings());
    let calls = Arc::new(AtomicUsize::new(0));
    scheduler
        .schedule(
            "decennial",
            counting("check", &calls, false),
            ScheduleOptions::every(MAX_SCHEDULE_MS).initial_delay_ms(MAX_SCHEDULE_MS),
        )
        .unwrap();
    scheduler.start();

    scheduler.trigger("decennial").await.unwrap();

    let entry = scheduler.entry("decennial").unwrap();
    assert_eq!(entry.run_count, 1);
    assert_eq!(entry.state, JobState::Waiting);
    assert!(entry.next_run > Utc::now() + chrono::Duration::days(9 * 365));
}

#[tokio::test(start_paused = true)]
async fn test_entries_wait_idle_until_started() {
    let scheduler = JobScheduler::new(settings());
    let calls = Arc::new(AtomicUsize::new(0));

    let entry = scheduler
        .schedule("links", counting("check", &calls, false), ScheduleOptions::every(1_000))
        .unwrap();
    assert_eq!(entry.state, JobState::Idle);
    assert_eq!(entry.validator_ref, "check");
    assert!(scheduler.armed_entries().is_empty());

    tokio::time::sleep(Duration::from_millis(1_500)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    scheduler.start();
    assert_eq!(scheduler.armed_entries(), vec!["links".to_string()]);
    tokio::time::sleep(Duration::from_millis(2_500)).await;

    // Runs at 0, 1000 and 2000 ms after start
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    let entry = scheduler.entry("links").unwrap();
    assert_eq!(entry.run_count, 3);
    assert_eq!(entry.state, JobState::Waiting);
    assert!(entry.last_run.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_stop_cancels_timers() {
    let scheduler = JobScheduler::new(settings());
    let calls = Arc::new(AtomicUsize::new(0));
    scheduler
        .schedule(
            "links",
            counting("check", &calls, false),
            ScheduleOptions::every(1_000).initial_delay_ms(500),
        )
        .unwrap();

    scheduler.start();
    scheduler.stop();
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(scheduler.armed_entries().is_empty());
    assert_eq!(scheduler.entry("links").unwrap().state, JobState::Idle);
    assert!(!scheduler.is_running());
}

#[tokio::test(start_paused = true)]
async fn test_disabled_entry_never_runs() {
    let scheduler = JobScheduler::new(settings());
    let calls = Arc::new(AtomicUsize::new(0));
    scheduler
        .schedule(
            "links",
            counting("check", &calls, false),
            ScheduleOptions::every(1_000).disabled(),
        )
        .unwrap();

    scheduler.start();
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    scheduler.set_enabled("links", true).unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    assert!(scheduler.set_enabled("missing", true).is_err());
    assert!(scheduler.unschedule("links"));
    assert!(!scheduler.unschedule("links"));
}

// ============================================================================
// Retries
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_failing_job_retries_then_returns_to_interval() {
    let bus = EventBus::new(64);
    let mut rx = bus.subscribe();
    let scheduler = JobScheduler::builder(settings()).event_bus(bus).build();
    let calls = Arc::new(AtomicUsize::new(0));

    scheduler
        .schedule(
            "links",
            counting("check", &calls, true),
            ScheduleOptions::every(60_000).max_retries(3),
        )
        .unwrap();
    scheduler.start();

    // Failures at 0 ms, +1000 ms (1 x retry delay) and +2000 ms (2 x)
    tokio::time::sleep(Duration::from_millis(3_500)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let entry = scheduler.entry("links").unwrap();
    assert_eq!(entry.retry_count, 0);
    assert_eq!(entry.failure_count, 3);
    assert!(entry.last_error.as_deref().unwrap().contains("link check 3 failed"));
    let until_next = (entry.next_run - Utc::now()).num_milliseconds();
    assert!((59_000..=60_000).contains(&until_next), "next run in {} ms", until_next);

    let retry_counts: Vec<u32> = drain(&mut rx)
        .into_iter()
        .filter_map(|event| match event {
            RepairEvent::JobFailed { retry_count, .. } => Some(retry_count),
            _ => None,
        })
        .collect();
    assert_eq!(retry_counts, vec![1, 2, 3]);

    // Back on the normal interval, nothing more for a while
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn test_success_resets_retry_count() {
    let scheduler = JobScheduler::new(settings());
    let attempts = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&attempts);
    let flaky: Arc<dyn GuardedOperation> = Arc::new(FnOperation::new("flaky", move |_input: Value| {
        let seen = Arc::clone(&seen);
        async move {
            if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                anyhow::bail!("connection reset");
            }
            Ok(Value::Null)
        }
    }));

    scheduler
        .schedule("flaky", flaky, ScheduleOptions::every(60_000))
        .unwrap();
    scheduler.start();
    tokio::time::sleep(Duration::from_millis(1_500)).await;

    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    let entry = scheduler.entry("flaky").unwrap();
    assert_eq!(entry.retry_count, 0);
    assert!(entry.last_error.is_none());
    assert_eq!(entry.run_count, 2);
}

// ============================================================================
// Maintenance mode
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_maintenance_mode_cancels_non_critical_timers() {
    let bus = EventBus::new(16);
    let mut rx = bus.subscribe();
    let scheduler = JobScheduler::builder(settings()).event_bus(bus).build();
    let calls = Arc::new(AtomicUsize::new(0));
    let options = ScheduleOptions::every(60_000).initial_delay_ms(60_000);

    for name in ["alpha", "beta", "gamma", "delta"] {
        scheduler
            .schedule(name, counting("check", &calls, false), options.clone())
            .unwrap();
    }
    scheduler
        .schedule(
            "critical",
            counting("check", &calls, false),
            options.clone().priority(Priority::Critical),
        )
        .unwrap();
    scheduler.start();
    assert_eq!(scheduler.armed_entries().len(), 5);

    let mut cancelled = scheduler.enable_maintenance_mode("index rebuild");
    cancelled.sort();
    assert_eq!(cancelled, vec!["alpha", "beta", "delta", "gamma"]);
    assert_eq!(scheduler.armed_entries(), vec!["critical".to_string()]);
    assert!(scheduler.is_maintenance_mode());
    assert_eq!(scheduler.maintenance_reason().as_deref(), Some("index rebuild"));
    assert_eq!(scheduler.entry("alpha").unwrap().state, JobState::Idle);

    let mut rearmed = scheduler.disable_maintenance_mode();
    rearmed.sort();
    assert_eq!(rearmed, vec!["alpha", "beta", "delta", "gamma"]);
    assert_eq!(scheduler.armed_entries().len(), 5);
    assert!(scheduler.maintenance_reason().is_none());

    let toggles: Vec<bool> = drain(&mut rx)
        .into_iter()
        .filter_map(|event| match event {
            RepairEvent::MaintenanceModeChanged { enabled, .. } => Some(enabled),
            _ => None,
        })
        .collect();
    assert_eq!(toggles, vec![true, false]);
}

#[tokio::test(start_paused = true)]
async fn test_critical_job_keeps_running_in_maintenance() {
    let scheduler = JobScheduler::new(settings());
    let critical_calls = Arc::new(AtomicUsize::new(0));
    let normal_calls = Arc::new(AtomicUsize::new(0));

    scheduler
        .schedule(
            "backups",
            counting("backup", &critical_calls, false),
            ScheduleOptions::every(1_000).priority(Priority::Critical),
        )
        .unwrap();
    scheduler
        .schedule("links", counting("check", &normal_calls, false), ScheduleOptions::every(1_000))
        .unwrap();

    scheduler.enable_maintenance_mode("migration");
    scheduler.start();
    tokio::time::sleep(Duration::from_millis(2_500)).await;

    assert_eq!(critical_calls.load(Ordering::SeqCst), 3);
    assert_eq!(normal_calls.load(Ordering::SeqCst), 0);
}

// ============================================================================
// Concurrency
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_concurrency_cap_defers_extra_jobs() {
    let bus = EventBus::new(16);
    let mut rx = bus.subscribe();
    let mut capped = settings();
    capped.max_concurrent_jobs = 1;
    let scheduler = JobScheduler::builder(capped).event_bus(bus).build();

    scheduler
        .schedule("first", hanging("slow"), ScheduleOptions::every(60_000))
        .unwrap();
    scheduler
        .schedule("second", hanging("slow"), ScheduleOptions::every(60_000))
        .unwrap();
    scheduler.start();
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(scheduler.executing_count(), 1);
    let events = drain(&mut rx);
    let started = events
        .iter()
        .filter(|e| matches!(e, RepairEvent::JobStarted { .. }))
        .count();
    let deferred = events
        .iter()
        .filter(|e| matches!(e, RepairEvent::JobDeferred { delay_ms: 500, .. }))
        .count();
    assert_eq!(started, 1);
    assert_eq!(deferred, 1);

    let entries = scheduler.entries();
    assert!(entries.iter().any(|e| e.state == JobState::Executing));
    let waiting = entries
        .iter()
        .find(|e| e.state == JobState::Waiting)
        .expect("deferred job is re-armed");

    let triggered = scheduler.trigger(&waiting.name).await;
    assert!(matches!(triggered, Err(RepairError::Scheduler(message)) if message.contains("Concurrency limit")));
}

// ============================================================================
// Manual trigger
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_trigger_runs_now_and_keeps_schedule() {
    let scheduler = JobScheduler::new(settings());
    let calls = Arc::new(AtomicUsize::new(0));
    scheduler
        .schedule(
            "links",
            counting("check", &calls, false),
            ScheduleOptions::every(60_000).initial_delay_ms(60_000),
        )
        .unwrap();
    scheduler.start();

    let output = scheduler.trigger("links").await.unwrap();
    assert_eq!(output, json!({ "run": 1 }));

    let entry = scheduler.entry("links").unwrap();
    assert_eq!(entry.run_count, 1);
    assert_eq!(entry.state, JobState::Waiting);
    let until_next = (entry.next_run - Utc::now()).num_milliseconds();
    assert!((59_000..=60_000).contains(&until_next));

    assert!(scheduler.trigger("missing").await.is_err());
}

#[tokio::test(start_paused = true)]
async fn test_trigger_reports_failure_and_panic() {
    let scheduler = JobScheduler::new(settings());
    let calls = Arc::new(AtomicUsize::new(0));
    let panicking: Arc<dyn GuardedOperation> = Arc::new(FnOperation::new("boom", |_input: Value| async {
        if true {
            panic!("validator state corrupted");
        }
        Ok(Value::Null)
    }));

    scheduler
        .schedule("failing", counting("check", &calls, true), ScheduleOptions::every(60_000))
        .unwrap();
    scheduler
        .schedule("panicking", panicking, ScheduleOptions::every(60_000))
        .unwrap();

    let failed = scheduler.trigger("failing").await;
    assert!(matches!(failed, Err(RepairError::Scheduler(message)) if message.contains("link check 1 failed")));

    let panicked = scheduler.trigger("panicking").await;
    assert!(matches!(panicked, Err(RepairError::Scheduler(message)) if message.contains("panicked")));

    assert_eq!(scheduler.executing_count(), 0);
    assert_eq!(scheduler.entry("panicking").unwrap().failure_count, 1);
    assert_eq!(scheduler.entry("panicking").unwrap().state, JobState::Idle);
}

// ============================================================================
// Health
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_health_reports_stuck_and_overdue_jobs() {
    let mut monitored = settings();
    monitored.health_check_interval_ms = 1_000;
    let scheduler = JobScheduler::new(monitored);
    let calls = Arc::new(AtomicUsize::new(0));

    scheduler
        .schedule("stuck", hanging("slow"), ScheduleOptions::every(60_000))
        .unwrap();
    scheduler
        .schedule(
            "later",
            counting("check", &calls, false),
            ScheduleOptions::every(60_000).initial_delay_ms(60_000),
        )
        .unwrap();
    scheduler.start();
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert!(scheduler.check_health().is_healthy());

    let report = scheduler.check_health_at(Utc::now() + chrono::Duration::seconds(61));
    assert_eq!(report.executing, 1);
    assert_eq!(report.issues.len(), 2);

    let later = report.issues.iter().find(|i| i.name == "later").unwrap();
    assert!(matches!(later.kind, HealthIssueKind::Overdue { overdue_ms } if overdue_ms > 500));
    let stuck = report.issues.iter().find(|i| i.name == "stuck").unwrap();
    assert!(matches!(stuck.kind, HealthIssueKind::Stuck { executing_ms } if executing_ms > 60_000));

    // The monitor ticks on its own
    assert!(scheduler.last_health_report().is_none());
    tokio::time::sleep(Duration::from_millis(1_100)).await;
    assert!(scheduler.last_health_report().is_some());
}

// ============================================================================
// Persistence
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_entries_survive_save_and_load() {
    let store = memory_store();
    let calls = Arc::new(AtomicUsize::new(0));

    let scheduler = JobScheduler::builder(settings()).store(Arc::clone(&store)).build();
    scheduler
        .schedule(
            "links",
            counting("check", &calls, false),
            ScheduleOptions::every(3_600_000).priority(Priority::Critical),
        )
        .unwrap();
    scheduler
        .schedule("reports", counting("report", &calls, false), ScheduleOptions::every(86_400_000))
        .unwrap();
    assert_eq!(scheduler.save_entries().await.unwrap(), 2);

    let restored = JobScheduler::builder(settings()).store(store).build();
    let mut validators: HashMap<String, Arc<dyn GuardedOperation>> = HashMap::new();
    validators.insert("check".to_string(), counting("check", &calls, false));

    // "reports" has no validator to bind to
    let loaded = restored.load_entries(&validators).await.unwrap();
    assert_eq!(loaded, vec!["links".to_string()]);

    let entry = restored.entry("links").unwrap();
    assert_eq!(entry.interval_ms, 3_600_000);
    assert_eq!(entry.priority, Priority::Critical);
    assert_eq!(entry.state, JobState::Idle);
}

#[tokio::test]
async fn test_persistence_requires_store() {
    let scheduler = JobScheduler::new(settings());
    assert!(matches!(scheduler.save_entries().await, Err(RepairError::Scheduler(_))));
    assert!(scheduler.load_entries(&HashMap::new()).await.is_err());
}
