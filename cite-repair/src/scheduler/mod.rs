//! Job scheduler
//!
//! Runs named [`GuardedOperation`]s on a recurring interval. Each entry owns
//! at most one live timer (a spawned task racing a sleep against a
//! [`CancellationToken`]). When a timer fires the entry is either skipped
//! (maintenance mode, non-critical), deferred (concurrency cap reached) or
//! executed; every outcome re-arms the entry, so a failing validator never
//! stops future scheduling.
//!
//! Timers carry a generation number. Re-arming or cancelling bumps the
//! generation, so a timer that fires after being superseded does nothing.

use crate::error::{RepairError, Result};
use crate::models::{JobState, ScheduleEntry, ScheduleOptions};
use crate::services::batch_processor::panic_message;
use crate::services::GuardedOperation;
use chrono::{DateTime, Utc};
use cite_common::config::SchedulerSettings;
use cite_common::{EventBus, KeyValueStore, RepairEvent};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

mod health;

pub use health::{HealthIssue, HealthIssueKind, HealthReport};

/// Store key for persisted schedule entries
pub const SCHEDULE_KEY: &str = "schedule:entries";

/// Upper bound for intervals and initial delays (ten years)
pub const MAX_SCHEDULE_MS: u64 = 10 * 365 * 86_400_000;

struct JobSlot {
    entry: ScheduleEntry,
    validator: Arc<dyn GuardedOperation>,
    /// Live timer, if armed
    timer: Option<CancellationToken>,
    generation: u64,
}

impl JobSlot {
    fn cancel_timer(&mut self) -> bool {
        self.generation += 1;
        match self.timer.take() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }
}

#[derive(Default)]
struct SchedulerState {
    running: bool,
    maintenance_mode: bool,
    maintenance_reason: Option<String>,
    jobs: BTreeMap<String, JobSlot>,
    /// Entries currently in `JobState::Executing`
    executing: usize,
    monitor: Option<CancellationToken>,
    last_health: Option<HealthReport>,
}

impl SchedulerState {
    /// Maintenance mode holds back this entry
    fn suppressed(&self, entry: &ScheduleEntry) -> bool {
        self.maintenance_mode && !entry.is_critical()
    }
}

struct SchedulerInner {
    settings: SchedulerSettings,
    store: Option<Arc<dyn KeyValueStore>>,
    event_bus: Option<EventBus>,
    state: Mutex<SchedulerState>,
}

impl SchedulerInner {
    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: RepairEvent) {
        if let Some(bus) = &self.event_bus {
            bus.emit_lossy(event);
        }
    }
}

/// What a fired timer decided to do
enum FireDecision {
    Skip,
    Defer,
    Run(Arc<dyn GuardedOperation>, Value),
}

/// Builder for [`JobScheduler`]
pub struct JobSchedulerBuilder {
    settings: SchedulerSettings,
    store: Option<Arc<dyn KeyValueStore>>,
    event_bus: Option<EventBus>,
}

impl JobSchedulerBuilder {
    /// Store used by `save_entries` / `load_entries`
    pub fn store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    pub fn build(self) -> JobScheduler {
        JobScheduler {
            inner: Arc::new(SchedulerInner {
                settings: self.settings,
                store: self.store,
                event_bus: self.event_bus,
                state: Mutex::new(SchedulerState::default()),
            }),
        }
    }
}

/// Recurring validator scheduler
///
/// Cheap to clone; clones share the same schedule.
#[derive(Clone)]
pub struct JobScheduler {
    inner: Arc<SchedulerInner>,
}

impl JobScheduler {
    pub fn new(settings: SchedulerSettings) -> Self {
        Self::builder(settings).build()
    }

    pub fn builder(settings: SchedulerSettings) -> JobSchedulerBuilder {
        JobSchedulerBuilder {
            settings,
            store: None,
            event_bus: None,
        }
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.inner.settings
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Arm every eligible entry and start the health monitor
    pub fn start(&self) {
        let mut state = self.inner.lock();
        if state.running {
            return;
        }
        state.running = true;

        let names: Vec<String> = state
            .jobs
            .iter()
            .filter(|(_, slot)| eligible(&state, slot))
            .map(|(name, _)| name.clone())
            .collect();
        for name in &names {
            let at = state.jobs[name].entry.next_run;
            arm(&self.inner, &mut state, name, at);
        }

        let token = CancellationToken::new();
        state.monitor = Some(token.clone());
        health::spawn_monitor(Arc::clone(&self.inner), token);

        info!(
            jobs = state.jobs.len(),
            armed = names.len(),
            maintenance_mode = state.maintenance_mode,
            "Job scheduler started"
        );
    }

    /// Cancel every timer and the health monitor; running jobs finish
    pub fn stop(&self) {
        let mut state = self.inner.lock();
        if !state.running {
            return;
        }
        state.running = false;
        if let Some(monitor) = state.monitor.take() {
            monitor.cancel();
        }
        for slot in state.jobs.values_mut() {
            slot.cancel_timer();
            if slot.entry.state == JobState::Waiting {
                slot.entry.state = JobState::Idle;
            }
        }
        info!(jobs = state.jobs.len(), "Job scheduler stopped");
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock().running
    }

    // ========================================================================
    // Entries
    // ========================================================================

    /// Register a validator under `name`
    ///
    /// The first run happens after `initial_delay_ms` (scheduler default when
    /// unset). The timer is armed only while the scheduler is running.
    pub fn schedule(
        &self,
        name: impl Into<String>,
        validator: Arc<dyn GuardedOperation>,
        options: ScheduleOptions,
    ) -> Result<ScheduleEntry> {
        let name = name.into();
        if options.interval_ms == 0 {
            return Err(RepairError::Scheduler(format!(
                "Job {} needs a positive interval",
                name
            )));
        }
        if options.interval_ms > MAX_SCHEDULE_MS
            || options.initial_delay_ms.is_some_and(|ms| ms > MAX_SCHEDULE_MS)
        {
            return Err(RepairError::Scheduler(format!(
                "Job {} interval and initial delay must not exceed {} ms",
                name, MAX_SCHEDULE_MS
            )));
        }

        let mut state = self.inner.lock();
        if state.jobs.contains_key(&name) {
            return Err(RepairError::Scheduler(format!("Job {} is already scheduled", name)));
        }

        let delay_ms = options
            .initial_delay_ms
            .unwrap_or(self.inner.settings.initial_delay_ms);
        let entry = ScheduleEntry {
            name: name.clone(),
            interval_ms: options.interval_ms,
            validator_ref: validator.name().to_string(),
            input: options.input,
            enabled: options.enabled,
            last_run: None,
            next_run: after(Utc::now(), delay_ms),
            retry_count: 0,
            max_retries: options.max_retries,
            priority: options.priority,
            state: JobState::Idle,
            execution_started_at: None,
            last_error: None,
            run_count: 0,
            failure_count: 0,
        };

        let next_run = entry.next_run;
        state.jobs.insert(
            name.clone(),
            JobSlot {
                entry,
                validator,
                timer: None,
                generation: 0,
            },
        );
        if eligible(&state, &state.jobs[&name]) {
            arm(&self.inner, &mut state, &name, next_run);
        }

        info!(
            job = %name,
            interval_ms = options.interval_ms,
            priority = ?options.priority,
            next_run = %next_run,
            "Job scheduled"
        );
        Ok(state.jobs[&name].entry.clone())
    }

    /// Remove an entry, cancelling its timer
    pub fn unschedule(&self, name: &str) -> bool {
        let mut state = self.inner.lock();
        match state.jobs.remove(name) {
            Some(mut slot) => {
                slot.cancel_timer();
                info!(job = %name, "Job unscheduled");
                true
            }
            None => false,
        }
    }

    pub fn set_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        let mut state = self.inner.lock();
        let slot = state
            .jobs
            .get_mut(name)
            .ok_or_else(|| RepairError::Scheduler(format!("Unknown job {}", name)))?;

        slot.entry.enabled = enabled;
        if !enabled {
            slot.cancel_timer();
            if slot.entry.state == JobState::Waiting {
                slot.entry.state = JobState::Idle;
            }
        } else if eligible(&state, &state.jobs[name]) {
            let at = state.jobs[name].entry.next_run;
            arm(&self.inner, &mut state, name, at);
        }
        debug!(job = %name, enabled, "Job enabled flag changed");
        Ok(())
    }

    pub fn entry(&self, name: &str) -> Option<ScheduleEntry> {
        self.inner.lock().jobs.get(name).map(|slot| slot.entry.clone())
    }

    pub fn entries(&self) -> Vec<ScheduleEntry> {
        self.inner
            .lock()
            .jobs
            .values()
            .map(|slot| slot.entry.clone())
            .collect()
    }

    /// Names of entries with a live timer
    pub fn armed_entries(&self) -> Vec<String> {
        self.inner
            .lock()
            .jobs
            .iter()
            .filter(|(_, slot)| slot.timer.is_some())
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Number of entries executing right now
    pub fn executing_count(&self) -> usize {
        self.inner.lock().executing
    }

    /// Run an entry now, outside its timer
    ///
    /// Respects the concurrency cap but not maintenance mode (an operator
    /// asked for this run). The entry's schedule continues from the result
    /// as if the timer had fired.
    pub async fn trigger(&self, name: &str) -> Result<Value> {
        let (validator, input) = {
            let mut state = self.inner.lock();
            let executing = state.executing;
            let slot = state
                .jobs
                .get_mut(name)
                .ok_or_else(|| RepairError::Scheduler(format!("Unknown job {}", name)))?;
            if slot.entry.state == JobState::Executing {
                return Err(RepairError::Scheduler(format!("Job {} is already executing", name)));
            }
            if executing >= self.inner.settings.max_concurrent_jobs {
                return Err(RepairError::Scheduler(format!(
                    "Concurrency limit of {} jobs reached",
                    self.inner.settings.max_concurrent_jobs
                )));
            }
            slot.cancel_timer();
            let claimed = begin_execution(slot);
            state.executing += 1;
            claimed
        };

        info!(job = %name, "Job triggered manually");
        let outcome = execute(&self.inner, name, validator, input).await;
        outcome.map_err(|e| RepairError::Scheduler(format!("Job {} failed: {}", name, e)))
    }

    // ========================================================================
    // Maintenance mode
    // ========================================================================

    /// Suppress every non-critical entry, cancelling its timer
    ///
    /// # Returns
    /// Names of the entries whose timers were cancelled
    pub fn enable_maintenance_mode(&self, reason: impl Into<String>) -> Vec<String> {
        let reason = reason.into();
        let mut state = self.inner.lock();
        state.maintenance_mode = true;
        state.maintenance_reason = Some(reason.clone());

        let mut cancelled = Vec::new();
        for (name, slot) in state.jobs.iter_mut() {
            if slot.entry.is_critical() {
                continue;
            }
            if slot.cancel_timer() {
                if slot.entry.state == JobState::Waiting {
                    slot.entry.state = JobState::Idle;
                }
                cancelled.push(name.clone());
            }
        }
        drop(state);

        warn!(reason = %reason, cancelled = cancelled.len(), "Maintenance mode enabled");
        self.inner.emit(RepairEvent::MaintenanceModeChanged {
            enabled: true,
            reason: Some(reason),
            timestamp: Utc::now(),
        });
        cancelled
    }

    /// Leave maintenance mode, re-arming every enabled entry without a live timer
    ///
    /// # Returns
    /// Names of the entries that were re-armed
    pub fn disable_maintenance_mode(&self) -> Vec<String> {
        let mut state = self.inner.lock();
        state.maintenance_mode = false;
        state.maintenance_reason = None;

        let names: Vec<String> = state
            .jobs
            .iter()
            .filter(|(_, slot)| eligible(&state, slot))
            .map(|(name, _)| name.clone())
            .collect();
        for name in &names {
            let at = state.jobs[name].entry.next_run;
            arm(&self.inner, &mut state, name, at);
        }
        drop(state);

        info!(rearmed = names.len(), "Maintenance mode disabled");
        self.inner.emit(RepairEvent::MaintenanceModeChanged {
            enabled: false,
            reason: None,
            timestamp: Utc::now(),
        });
        names
    }

    pub fn is_maintenance_mode(&self) -> bool {
        self.inner.lock().maintenance_mode
    }

    pub fn maintenance_reason(&self) -> Option<String> {
        self.inner.lock().maintenance_reason.clone()
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    /// Persist every entry under [`SCHEDULE_KEY`]
    pub async fn save_entries(&self) -> Result<usize> {
        let store = self.store()?;
        let entries = self.entries();
        let value = serde_json::to_value(&entries).map_err(cite_common::Error::from)?;
        store.put(SCHEDULE_KEY, value).await?;
        debug!(entries = entries.len(), "Schedule entries saved");
        Ok(entries.len())
    }

    /// Restore persisted entries, binding each to its validator by name
    ///
    /// Entries whose validator is not in `validators`, or whose name is
    /// already scheduled, are skipped with a warning.
    ///
    /// # Returns
    /// Names of the entries restored
    pub async fn load_entries(
        &self,
        validators: &HashMap<String, Arc<dyn GuardedOperation>>,
    ) -> Result<Vec<String>> {
        let store = self.store()?;
        let Some(value) = store.get(SCHEDULE_KEY).await? else {
            return Ok(Vec::new());
        };
        let entries: Vec<ScheduleEntry> =
            serde_json::from_value(value).map_err(cite_common::Error::from)?;

        let mut state = self.inner.lock();
        let mut loaded = Vec::new();
        for mut entry in entries {
            let Some(validator) = validators.get(&entry.validator_ref) else {
                warn!(job = %entry.name, validator = %entry.validator_ref, "No validator for persisted job, skipping");
                continue;
            };
            if state.jobs.contains_key(&entry.name) {
                warn!(job = %entry.name, "Persisted job already scheduled, skipping");
                continue;
            }

            entry.state = JobState::Idle;
            entry.execution_started_at = None;
            let name = entry.name.clone();
            let next_run = entry.next_run;
            state.jobs.insert(
                name.clone(),
                JobSlot {
                    entry,
                    validator: Arc::clone(validator),
                    timer: None,
                    generation: 0,
                },
            );
            if eligible(&state, &state.jobs[&name]) {
                arm(&self.inner, &mut state, &name, next_run);
            }
            loaded.push(name);
        }

        info!(loaded = loaded.len(), "Schedule entries restored");
        Ok(loaded)
    }

    fn store(&self) -> Result<&Arc<dyn KeyValueStore>> {
        self.inner
            .store
            .as_ref()
            .ok_or_else(|| RepairError::Scheduler("No store configured".to_string()))
    }
}

/// Should this entry have a live timer right now
fn eligible(state: &SchedulerState, slot: &JobSlot) -> bool {
    state.running
        && slot.entry.enabled
        && slot.timer.is_none()
        && slot.entry.state != JobState::Executing
        && !state.suppressed(&slot.entry)
}

fn millis(ms: u64) -> chrono::Duration {
    chrono::Duration::milliseconds(i64::try_from(ms).unwrap_or(i64::MAX))
}

/// `from + ms`, saturating at the latest representable instant
fn after(from: DateTime<Utc>, ms: u64) -> DateTime<Utc> {
    from.checked_add_signed(millis(ms)).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Arm (or re-arm) the entry's timer for `at`, clamped to now
fn arm(inner: &Arc<SchedulerInner>, state: &mut SchedulerState, name: &str, at: DateTime<Utc>) {
    let Some(slot) = state.jobs.get_mut(name) else {
        return;
    };
    slot.cancel_timer();

    let now = Utc::now();
    let at = at.max(now);
    slot.entry.next_run = at;
    slot.entry.state = JobState::Waiting;

    let token = CancellationToken::new();
    slot.timer = Some(token.clone());
    let generation = slot.generation;
    let delay = (at - now).to_std().unwrap_or_default();

    let inner = Arc::clone(inner);
    let name = name.to_string();
    debug!(job = %name, delay_ms = delay.as_millis() as u64, "Timer armed");
    tokio::spawn(async move {
        tokio::select! {
            _ = token.cancelled() => {}
            _ = tokio::time::sleep(delay) => fire(inner, name, generation).await,
        }
    });
}

fn begin_execution(slot: &mut JobSlot) -> (Arc<dyn GuardedOperation>, Value) {
    let now = Utc::now();
    slot.entry.state = JobState::Executing;
    slot.entry.execution_started_at = Some(now);
    slot.entry.last_run = Some(now);
    (Arc::clone(&slot.validator), slot.entry.input.clone())
}

fn fire(inner: Arc<SchedulerInner>, name: String, generation: u64) -> BoxFuture<'static, ()> {
    async move {
        let decision = {
            let mut state = inner.lock();
            let running = state.running;
            let executing = state.executing;
            let maintenance = state.maintenance_mode;
            let Some(slot) = state.jobs.get_mut(&name) else {
                return;
            };
            if slot.generation != generation {
                return;
            }
            slot.timer = None;

            if !running || !slot.entry.enabled {
                slot.entry.state = JobState::Idle;
                return;
            }

            let decision = if maintenance && !slot.entry.is_critical() {
                FireDecision::Skip
            } else if executing >= inner.settings.max_concurrent_jobs {
                FireDecision::Defer
            } else {
                let (validator, input) = begin_execution(slot);
                FireDecision::Run(validator, input)
            };

            match &decision {
                FireDecision::Skip => {
                    let at = after(Utc::now(), slot.entry.interval_ms);
                    arm(&inner, &mut state, &name, at);
                }
                FireDecision::Defer => {
                    let at = after(Utc::now(), inner.settings.back_pressure_delay_ms);
                    arm(&inner, &mut state, &name, at);
                }
                FireDecision::Run(..) => state.executing += 1,
            }
            decision
        };

        match decision {
            FireDecision::Skip => {
                info!(job = %name, "Maintenance mode, run skipped");
                inner.emit(RepairEvent::JobSkipped {
                    name,
                    reason: "maintenance mode".to_string(),
                    timestamp: Utc::now(),
                });
            }
            FireDecision::Defer => {
                let delay_ms = inner.settings.back_pressure_delay_ms;
                warn!(job = %name, delay_ms, "Concurrency limit reached, run deferred");
                inner.emit(RepairEvent::JobDeferred {
                    name,
                    delay_ms,
                    timestamp: Utc::now(),
                });
            }
            FireDecision::Run(validator, input) => {
                // Failures are recorded on the entry and reported by execute
                let _ = execute(&inner, &name, validator, input).await;
            }
        }
    }
    .boxed()
}

/// Run a claimed entry and fold the outcome back into its schedule
async fn execute(
    inner: &Arc<SchedulerInner>,
    name: &str,
    validator: Arc<dyn GuardedOperation>,
    input: Value,
) -> std::result::Result<Value, String> {
    info!(job = %name, validator = %validator.name(), "Job started");
    inner.emit(RepairEvent::JobStarted {
        name: name.to_string(),
        timestamp: Utc::now(),
    });

    let started = tokio::time::Instant::now();
    let outcome = match AssertUnwindSafe(validator.run(&input)).catch_unwind().await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(format!("{:#}", e)),
        Err(panic) => Err(format!("validator panicked: {}", panic_message(panic.as_ref()))),
    };
    let duration_ms = started.elapsed().as_millis() as u64;

    complete(inner, name, &outcome, duration_ms);
    outcome
}

fn complete(
    inner: &Arc<SchedulerInner>,
    name: &str,
    outcome: &std::result::Result<Value, String>,
    duration_ms: u64,
) {
    let mut state = inner.lock();
    state.executing = state.executing.saturating_sub(1);

    let Some(slot) = state.jobs.get_mut(name) else {
        debug!(job = %name, "Job finished after being unscheduled");
        return;
    };
    slot.entry.state = JobState::Idle;
    slot.entry.execution_started_at = None;
    slot.entry.run_count += 1;

    let now = Utc::now();
    let event = match outcome {
        Ok(_) => {
            slot.entry.retry_count = 0;
            slot.entry.last_error = None;
            slot.entry.next_run = after(now, slot.entry.interval_ms);
            info!(job = %name, duration_ms, next_run = %slot.entry.next_run, "Job succeeded");
            RepairEvent::JobSucceeded {
                name: name.to_string(),
                duration_ms,
                timestamp: now,
            }
        }
        Err(error) => {
            slot.entry.failure_count += 1;
            slot.entry.retry_count += 1;
            slot.entry.last_error = Some(error.clone());
            let retry_count = slot.entry.retry_count;

            if retry_count < slot.entry.max_retries {
                let delay_ms = inner.settings.retry_delay_ms.saturating_mul(u64::from(retry_count));
                slot.entry.next_run = after(now, delay_ms);
                warn!(job = %name, retry_count, delay_ms, error = %error, "Job failed, retry scheduled");
            } else {
                slot.entry.retry_count = 0;
                slot.entry.next_run = after(now, slot.entry.interval_ms);
                warn!(
                    job = %name,
                    retries = retry_count,
                    error = %error,
                    next_run = %slot.entry.next_run,
                    "Job failed, retries exhausted, back to normal interval"
                );
            }
            RepairEvent::JobFailed {
                name: name.to_string(),
                retry_count,
                error: error.clone(),
                timestamp: now,
            }
        }
    };

    if eligible(&state, &state.jobs[name]) {
        let at = state.jobs[name].entry.next_run;
        arm(inner, &mut state, name, at);
    }
    drop(state);
    inner.emit(event);
}
