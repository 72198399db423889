//! Validation session state
//!
//! One [`ValidationSession`] is produced per orchestrator run. Phase results
//! are kept in a `Vec` rather than a map so that insertion order is the
//! pipeline order.

use crate::error::ErrorClass;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Pipeline phases, declared in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Initialization,
    AccessibilityValidation,
    ContentAnalysis,
    DuplicationDetection,
    AttributionVerification,
    ReplacementPlanning,
    ReplacementExecution,
    FinalValidation,
    Reporting,
}

impl Phase {
    /// Complete pipeline in execution order
    pub const PIPELINE: [Phase; 9] = [
        Phase::Initialization,
        Phase::AccessibilityValidation,
        Phase::ContentAnalysis,
        Phase::DuplicationDetection,
        Phase::AttributionVerification,
        Phase::ReplacementPlanning,
        Phase::ReplacementExecution,
        Phase::FinalValidation,
        Phase::Reporting,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Initialization => "initialization",
            Phase::AccessibilityValidation => "accessibility_validation",
            Phase::ContentAnalysis => "content_analysis",
            Phase::DuplicationDetection => "duplication_detection",
            Phase::AttributionVerification => "attribution_verification",
            Phase::ReplacementPlanning => "replacement_planning",
            Phase::ReplacementExecution => "replacement_execution",
            Phase::FinalValidation => "final_validation",
            Phase::Reporting => "reporting",
        }
    }

    /// Reduce a requested phase list to pipeline order without duplicates
    pub fn normalize(requested: &[Phase]) -> Vec<Phase> {
        Phase::PIPELINE
            .iter()
            .copied()
            .filter(|phase| requested.contains(phase))
            .collect()
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    Complete,
    Partial,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Completed,
    Failed,
    /// Ended by `stop()` before all phases ran
    Stopped,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::Stopped => "stopped",
        }
    }
}

/// Terminal status of one phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Completed,
    Failed,
    Skipped,
    /// Completed after at least one retry
    Retried,
}

impl PhaseStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PhaseStatus::Completed => "completed",
            PhaseStatus::Failed => "failed",
            PhaseStatus::Skipped => "skipped",
            PhaseStatus::Retried => "retried",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseResult {
    pub status: PhaseStatus,
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    /// Classification of the failure that produced `errors`, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_class: Option<ErrorClass>,
    /// Handler invocations, including the first one
    pub attempts: u32,
    pub duration_ms: u64,
}

impl PhaseResult {
    pub fn new(status: PhaseStatus, payload: Value) -> Self {
        Self {
            status,
            timestamp: Utc::now(),
            payload,
            errors: Vec::new(),
            warnings: Vec::new(),
            error_class: None,
            attempts: 1,
            duration_ms: 0,
        }
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        let mut result = Self::new(PhaseStatus::Skipped, serde_json::json!({ "reason": reason }));
        result.warnings.push(reason);
        result
    }

    pub fn failed(message: impl Into<String>) -> Self {
        let mut result = Self::new(PhaseStatus::Failed, Value::Null);
        result.errors.push(message.into());
        result
    }
}

/// Ordered (phase, result) pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseEntry {
    pub phase: Phase,
    pub result: PhaseResult,
}

/// Error or warning recorded against a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionIssue {
    pub phase: Option<Phase>,
    pub class: Option<ErrorClass>,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl SessionIssue {
    pub fn new(phase: Option<Phase>, class: Option<ErrorClass>, message: impl Into<String>) -> Self {
        Self {
            phase,
            class,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Item routed to a human because automatic repair was not possible
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManualReviewItem {
    pub phase: Phase,
    /// Entry or reference the item concerns ("entry[index]"), if any
    pub subject: Option<String>,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

/// Aggregate counts for a session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub total_entries: usize,
    pub total_references: usize,
    pub accessible: usize,
    pub inaccessible: usize,
    pub accessibility_unknown: usize,
    pub relevant: usize,
    pub irrelevant: usize,
    pub relevance_unknown: usize,
    pub duplicate_groups: usize,
    pub attribution_issues: usize,
    pub replacements_planned: usize,
    pub replacements_executed: usize,
    pub replacements_failed: usize,
    pub manual_review: usize,
    /// Weighted health (0-100) under the configured credit policy
    pub health_percentage: f64,
}

/// One orchestrator run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationSession {
    pub id: Uuid,
    pub kind: SessionKind,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: SessionStatus,
    pub phases: Vec<PhaseEntry>,
    pub summary: SessionSummary,
    pub errors: Vec<SessionIssue>,
    pub warnings: Vec<SessionIssue>,
    pub manual_review: Vec<ManualReviewItem>,
}

impl ValidationSession {
    pub fn new(kind: SessionKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            start_time: Utc::now(),
            end_time: None,
            status: SessionStatus::Active,
            phases: Vec::new(),
            summary: SessionSummary::default(),
            errors: Vec::new(),
            warnings: Vec::new(),
            manual_review: Vec::new(),
        }
    }

    /// Result of a phase, if it ran
    pub fn phase(&self, phase: Phase) -> Option<&PhaseResult> {
        self.phases
            .iter()
            .find(|entry| entry.phase == phase)
            .map(|entry| &entry.result)
    }

    /// Phase names in recorded order
    pub fn phase_names(&self) -> Vec<Phase> {
        self.phases.iter().map(|entry| entry.phase).collect()
    }

    /// Append a phase result, folding its errors/warnings into the session log
    pub fn record_phase(&mut self, phase: Phase, result: PhaseResult) {
        for message in &result.errors {
            self.errors
                .push(SessionIssue::new(Some(phase), result.error_class, message.clone()));
        }
        for message in &result.warnings {
            self.warnings.push(SessionIssue::new(Some(phase), None, message.clone()));
        }
        self.phases.push(PhaseEntry { phase, result });
    }

    /// Move to a terminal status and stamp the end time
    pub fn finalize(&mut self, status: SessionStatus) {
        self.status = status;
        self.end_time = Some(Utc::now());
    }

    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }

    /// Errors recorded against one phase
    pub fn errors_for(&self, phase: Phase) -> Vec<&SessionIssue> {
        self.errors.iter().filter(|e| e.phase == Some(phase)).collect()
    }

    pub fn duration_ms(&self) -> Option<i64> {
        self.end_time
            .map(|end| (end - self.start_time).num_milliseconds())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_names_serialize_snake_case() {
        let json = serde_json::to_value(Phase::ContentAnalysis).unwrap();
        assert_eq!(json, "content_analysis");
        assert_eq!(Phase::ReplacementExecution.to_string(), "replacement_execution");
    }

    #[test]
    fn test_normalize_orders_and_dedupes() {
        let phases = Phase::normalize(&[
            Phase::Reporting,
            Phase::Initialization,
            Phase::Reporting,
            Phase::ContentAnalysis,
        ]);
        assert_eq!(
            phases,
            vec![Phase::Initialization, Phase::ContentAnalysis, Phase::Reporting]
        );
    }

    #[test]
    fn test_record_phase_folds_issues_into_session() {
        let mut session = ValidationSession::new(SessionKind::Complete);
        let mut result = PhaseResult::new(PhaseStatus::Completed, Value::Null);
        result.warnings.push("3 references without content".to_string());
        session.record_phase(Phase::ContentAnalysis, result);
        session.record_phase(Phase::DuplicationDetection, PhaseResult::failed("boom"));

        assert_eq!(
            session.phase_names(),
            vec![Phase::ContentAnalysis, Phase::DuplicationDetection]
        );
        assert_eq!(session.warnings.len(), 1);
        assert_eq!(session.errors_for(Phase::DuplicationDetection).len(), 1);
        assert_eq!(
            session.phase(Phase::DuplicationDetection).unwrap().status,
            PhaseStatus::Failed
        );
    }

    #[test]
    fn test_finalize_sets_end_time() {
        let mut session = ValidationSession::new(SessionKind::Partial);
        assert!(session.is_active());
        session.finalize(SessionStatus::Stopped);
        assert!(!session.is_active());
        assert!(session.end_time.is_some());
        assert!(session.duration_ms().unwrap() >= 0);
    }
}
