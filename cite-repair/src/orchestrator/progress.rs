//! Progress reporting for orchestrator runs

use crate::models::Phase;
use chrono::{DateTime, Utc};
use cite_common::{EventBus, RepairEvent};
use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::time::Instant;
use uuid::Uuid;

/// Progress callback supplied by the caller
pub type ProgressCallback = Arc<dyn Fn(&ProgressUpdate) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressUpdate {
    pub message: String,
    pub phase: Option<Phase>,
    /// Zero-based position of `phase` in this run's phase list
    pub phase_index: usize,
    pub phase_count: usize,
    /// Items processed in the current phase
    pub processed: usize,
    pub total: usize,
    /// Overall progress across all phases (0-100)
    pub percentage: f64,
    pub elapsed_ms: u64,
    /// Projected from item throughput; `None` until an item was processed
    pub estimated_completion: Option<DateTime<Utc>>,
    pub error_count: usize,
    pub warning_count: usize,
}

#[derive(Default)]
struct TrackerState {
    phase: Option<Phase>,
    phase_index: usize,
    processed: usize,
    total: usize,
    phase_started: Option<Instant>,
    error_count: usize,
    warning_count: usize,
}

/// Builds [`ProgressUpdate`]s and forwards them to the callback
pub(crate) struct ProgressTracker {
    callback: Option<ProgressCallback>,
    events: Option<(EventBus, Uuid)>,
    phase_count: usize,
    started: Instant,
    state: Mutex<TrackerState>,
}

impl ProgressTracker {
    pub(crate) fn new(phase_count: usize, callback: Option<ProgressCallback>) -> Self {
        Self {
            callback,
            events: None,
            phase_count,
            started: Instant::now(),
            state: Mutex::new(TrackerState::default()),
        }
    }

    /// Mirror every update onto the bus as [`RepairEvent::Progress`]
    pub(crate) fn with_events(mut self, bus: Option<EventBus>, session_id: Uuid) -> Self {
        self.events = bus.map(|bus| (bus, session_id));
        self
    }

    pub(crate) fn enter_phase(&self, phase: Phase, phase_index: usize) {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.phase = Some(phase);
            state.phase_index = phase_index;
            state.processed = 0;
            state.total = 0;
            state.phase_started = Some(Instant::now());
        }
        self.report(format!("Starting {}", phase));
    }

    pub(crate) fn finish_phase(&self, phase: Phase, status: &str, error_count: usize, warning_count: usize) {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.error_count = error_count;
            state.warning_count = warning_count;
            if state.total > 0 {
                state.processed = state.total;
            }
        }
        self.report(format!("{} {}", phase, status));
    }

    /// Item-level progress inside the current phase
    pub(crate) fn item_progress(&self, processed: usize, total: usize) {
        let phase = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.processed = processed;
            state.total = total;
            state.phase
        };
        let label = phase.map(|p| p.as_str()).unwrap_or("run");
        self.report(format!("{}: {}/{}", label, processed, total));
    }

    pub(crate) fn message(&self, message: impl Into<String>) {
        self.report(message.into());
    }

    /// Current update without emitting it
    pub(crate) fn snapshot(&self, message: String) -> ProgressUpdate {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let phase_fraction = if state.total > 0 {
            state.processed.min(state.total) as f64 / state.total as f64
        } else {
            0.0
        };
        let percentage = if self.phase_count == 0 {
            100.0
        } else {
            ((state.phase_index as f64 + phase_fraction) / self.phase_count as f64 * 100.0)
                .min(100.0)
        };

        let estimated_completion = match state.phase_started {
            Some(phase_started) if state.processed > 0 => {
                let elapsed = phase_started.elapsed().as_secs_f64();
                let remaining = state.total.saturating_sub(state.processed) as f64;
                let per_item = elapsed / state.processed as f64;
                let eta_ms = (per_item * remaining * 1000.0) as i64;
                Some(Utc::now() + chrono::Duration::milliseconds(eta_ms))
            }
            _ => None,
        };

        ProgressUpdate {
            message,
            phase: state.phase,
            phase_index: state.phase_index,
            phase_count: self.phase_count,
            processed: state.processed,
            total: state.total,
            percentage,
            elapsed_ms: self.started.elapsed().as_millis() as u64,
            estimated_completion,
            error_count: state.error_count,
            warning_count: state.warning_count,
        }
    }

    fn report(&self, message: String) {
        if self.callback.is_none() && self.events.is_none() {
            return;
        }
        let update = self.snapshot(message);
        if let Some(callback) = &self.callback {
            callback(&update);
        }
        if let Some((bus, session_id)) = &self.events {
            bus.emit_lossy(RepairEvent::Progress {
                session_id: *session_id,
                phase: update.phase.map(|p| p.as_str().to_string()),
                percentage: update.percentage,
                message: update.message,
                timestamp: Utc::now(),
            });
        }
    }
}
