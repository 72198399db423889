//! Scheduled validator entries

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    #[default]
    Normal,
    /// Keeps running during maintenance mode
    Critical,
}

/// Per-entry state machine: Idle → Waiting → Executing → Idle | Waiting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    #[default]
    Idle,
    /// Timer armed for `next_run`
    Waiting,
    Executing,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleEntry {
    pub name: String,
    pub interval_ms: u64,
    /// Name of the guarded operation this entry runs
    pub validator_ref: String,
    /// Input handed to the validator on every run
    #[serde(default)]
    pub input: Value,
    pub enabled: bool,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: DateTime<Utc>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub priority: Priority,
    pub state: JobState,
    pub execution_started_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub run_count: u64,
    pub failure_count: u64,
}

impl ScheduleEntry {
    pub fn is_critical(&self) -> bool {
        self.priority == Priority::Critical
    }
}

/// Options accepted by `JobScheduler::schedule`
#[derive(Debug, Clone)]
pub struct ScheduleOptions {
    pub interval_ms: u64,
    pub max_retries: u32,
    pub priority: Priority,
    /// Delay before the first run; scheduler default when `None`
    pub initial_delay_ms: Option<u64>,
    pub enabled: bool,
    pub input: Value,
}

impl ScheduleOptions {
    pub fn every(interval_ms: u64) -> Self {
        Self {
            interval_ms,
            max_retries: 3,
            priority: Priority::Normal,
            initial_delay_ms: None,
            enabled: true,
            input: Value::Null,
        }
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn initial_delay_ms(mut self, delay_ms: u64) -> Self {
        self.initial_delay_ms = Some(delay_ms);
        self
    }

    pub fn input(mut self, input: Value) -> Self {
        self.input = input;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}
