//! Scheduler health monitor
//!
//! Flags entries that have been executing longer than the stuck threshold
//! and entries whose `next_run` passed more than the grace period ago
//! without firing. Findings are reported, never corrected.

use super::{JobScheduler, SchedulerInner};
use crate::models::JobState;
use chrono::{DateTime, Utc};
use cite_common::RepairEvent;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum HealthIssueKind {
    Stuck { executing_ms: i64 },
    Overdue { overdue_ms: i64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthIssue {
    pub name: String,
    pub kind: HealthIssueKind,
}

impl std::fmt::Display for HealthIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            HealthIssueKind::Stuck { executing_ms } => {
                write!(f, "{} executing for {} ms", self.name, executing_ms)
            }
            HealthIssueKind::Overdue { overdue_ms } => {
                write!(f, "{} overdue by {} ms", self.name, overdue_ms)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub checked_at: DateTime<Utc>,
    pub issues: Vec<HealthIssue>,
    pub executing: usize,
    pub maintenance_mode: bool,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.issues.is_empty()
    }
}

impl SchedulerInner {
    fn health_at(&self, now: DateTime<Utc>) -> HealthReport {
        let state = self.lock();
        let stuck_ms = i64::try_from(self.settings.stuck_job_threshold_ms).unwrap_or(i64::MAX);
        let grace_ms = i64::try_from(self.settings.overdue_grace_ms).unwrap_or(i64::MAX);

        let mut issues = Vec::new();
        for (name, slot) in &state.jobs {
            let entry = &slot.entry;
            if entry.state == JobState::Executing {
                if let Some(started) = entry.execution_started_at {
                    let executing_ms = (now - started).num_milliseconds();
                    if executing_ms > stuck_ms {
                        issues.push(HealthIssue {
                            name: name.clone(),
                            kind: HealthIssueKind::Stuck { executing_ms },
                        });
                    }
                }
                continue;
            }

            if !state.running || !entry.enabled || state.suppressed(entry) {
                continue;
            }
            let overdue_ms = (now - entry.next_run).num_milliseconds();
            if overdue_ms > grace_ms {
                issues.push(HealthIssue {
                    name: name.clone(),
                    kind: HealthIssueKind::Overdue { overdue_ms },
                });
            }
        }

        HealthReport {
            checked_at: now,
            issues,
            executing: state.executing,
            maintenance_mode: state.maintenance_mode,
        }
    }
}

impl JobScheduler {
    /// Check every entry against the stuck and overdue thresholds
    pub fn check_health(&self) -> HealthReport {
        self.check_health_at(Utc::now())
    }

    /// Same as [`check_health`](Self::check_health) with an explicit clock
    pub fn check_health_at(&self, now: DateTime<Utc>) -> HealthReport {
        self.inner.health_at(now)
    }

    /// Report from the most recent monitor tick
    pub fn last_health_report(&self) -> Option<HealthReport> {
        self.inner.lock().last_health.clone()
    }
}

/// Spawn the periodic monitor; runs until `token` is cancelled
pub(super) fn spawn_monitor(inner: Arc<SchedulerInner>, token: CancellationToken) {
    let period = Duration::from_millis(inner.settings.health_check_interval_ms.max(1));

    tokio::spawn(async move {
        let mut timer = tokio::time::interval(period);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // First tick completes immediately
        timer.tick().await;

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = timer.tick() => {}
            }

            let report = inner.health_at(Utc::now());
            if report.is_healthy() {
                debug!(executing = report.executing, "Scheduler health check passed");
            }
            for issue in &report.issues {
                warn!(job = %issue.name, issue = %issue, "Scheduler health issue");
                inner.emit(RepairEvent::HealthIssue {
                    name: issue.name.clone(),
                    issue: issue.to_string(),
                    timestamp: report.checked_at,
                });
            }
            inner.lock().last_health = Some(report);
        }
        debug!("Scheduler health monitor stopped");
    });
}
