//! Event types and broadcast bus for citation repair
//!
//! Progress callbacks are the primary reporting contract of each component.
//! The bus is an optional secondary channel for observers (dashboards,
//! log shippers) that want every component's events in one stream.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Citation repair event types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RepairEvent {
    /// Validation session started
    SessionStarted {
        session_id: Uuid,
        kind: String,
        entry_count: usize,
        timestamp: DateTime<Utc>,
    },

    /// Validation session finalized (completed, failed or stopped)
    SessionFinished {
        session_id: Uuid,
        status: String,
        error_count: usize,
        warning_count: usize,
        timestamp: DateTime<Utc>,
    },

    /// Phase entered
    PhaseStarted {
        session_id: Uuid,
        phase: String,
        phase_index: usize,
        timestamp: DateTime<Utc>,
    },

    /// Phase resolved with a terminal status
    PhaseFinished {
        session_id: Uuid,
        phase: String,
        status: String,
        timestamp: DateTime<Utc>,
    },

    /// Orchestrator progress, mirrored from the progress callback
    Progress {
        session_id: Uuid,
        phase: Option<String>,
        percentage: f64,
        message: String,
        timestamp: DateTime<Utc>,
    },

    /// Batch finished inside a batch run
    BatchCompleted {
        job: String,
        batch_index: usize,
        batch_size: usize,
        processed: usize,
        total: usize,
        timestamp: DateTime<Utc>,
    },

    /// Checkpoint persisted
    CheckpointSaved {
        job: String,
        processed: usize,
        remaining: usize,
        timestamp: DateTime<Utc>,
    },

    /// Replacement transaction committed
    TransactionCommitted {
        transaction_id: Uuid,
        operations: usize,
        timestamp: DateTime<Utc>,
    },

    /// Replacement transaction rolled back
    TransactionRolledBack {
        transaction_id: Uuid,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// Scheduled job started executing
    JobStarted {
        name: String,
        timestamp: DateTime<Utc>,
    },

    /// Scheduled job finished successfully
    JobSucceeded {
        name: String,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// Scheduled job failed
    JobFailed {
        name: String,
        retry_count: u32,
        error: String,
        timestamp: DateTime<Utc>,
    },

    /// Scheduled run suppressed by maintenance mode
    JobSkipped {
        name: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// Scheduled run deferred by the concurrency cap
    JobDeferred {
        name: String,
        delay_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// Maintenance mode toggled
    MaintenanceModeChanged {
        enabled: bool,
        reason: Option<String>,
        timestamp: DateTime<Utc>,
    },

    /// Health monitor found a stuck or overdue job
    HealthIssue {
        name: String,
        issue: String,
        timestamp: DateTime<Utc>,
    },
}

/// Broadcast bus for [`RepairEvent`]s
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<RepairEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with specified channel capacity
    ///
    /// Slow subscribers lose the oldest events once `capacity` is exceeded.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<RepairEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Err` if no subscribers are listening.
    #[allow(clippy::result_large_err)]
    pub fn emit(
        &self,
        event: RepairEvent,
    ) -> Result<usize, broadcast::error::SendError<RepairEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: RepairEvent) {
        let _ = self.tx.send(event);
    }

    /// Get the current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Get the configured channel capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
