//! Error taxonomy for citation repair
//!
//! Phase handlers fail with [`RepairError`]. The orchestrator maps every
//! failure to an [`ErrorClass`] and looks up the [`RecoveryStrategy`] for it.
//! Classification prefers the typed variant and falls back to the message
//! text, so errors that arrive as plain strings (collaborators wrapping
//! third-party failures, guarded operations returning `anyhow` errors) are
//! still routed correctly.

use crate::models::Phase;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Failures reported by external collaborators
#[derive(Debug, Clone, Error)]
pub enum CollaboratorError {
    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Content analysis failed: {0}")]
    Analysis(String),

    #[error("Collaborator unavailable: {0}")]
    Unavailable(String),

    #[error("{0}")]
    Other(String),
}

/// Failures of the transactional replacer
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransactionError {
    #[error("Transaction {0} is still active")]
    TransactionActive(Uuid),

    #[error("Entry not found: {0}")]
    EntryNotFound(String),

    #[error("Reference index {index} out of range for {entry_name} ({len} references)")]
    IndexOutOfRange {
        entry_name: String,
        index: usize,
        len: usize,
    },

    #[error("Invalid replacement candidate: {0}")]
    InvalidCandidate(String),

    #[error("Replacement rejected: {0}")]
    Rejected(String),

    #[error("Batch replacement rolled back: {failed} of {total} replacements failed")]
    BatchRolledBack { failed: usize, total: usize },
}

/// Errors surfaced by orchestrator, batch processor and scheduler
#[derive(Debug, Error)]
pub enum RepairError {
    #[error("A validation session is already running")]
    AlreadyRunning,

    #[error("Phase {phase} requires a {collaborator}, none was provided")]
    DependencyMissing {
        phase: Phase,
        collaborator: &'static str,
    },

    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),

    #[error("Phase {phase} failed ({class}): {message}")]
    PhaseFailed {
        phase: Phase,
        class: ErrorClass,
        message: String,
    },

    #[error(transparent)]
    Transaction(#[from] TransactionError),

    #[error("Validation timeout: {0}")]
    ValidationTimeout(String),

    #[error("Run stopped")]
    Stopped,

    #[error(transparent)]
    Common(#[from] cite_common::Error),

    #[error("Scheduler error: {0}")]
    Scheduler(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, RepairError>;

// ============================================================================
// Classification
// ============================================================================

/// Failure classes that drive recovery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    NetworkTimeout,
    InvalidUrl,
    ContentAnalysisFailed,
    ReplacementFailed,
    ValidationTimeout,
    #[serde(rename = "unknown_error")]
    Unknown,
}

impl ErrorClass {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorClass::NetworkTimeout => "network_timeout",
            ErrorClass::InvalidUrl => "invalid_url",
            ErrorClass::ContentAnalysisFailed => "content_analysis_failed",
            ErrorClass::ReplacementFailed => "replacement_failed",
            ErrorClass::ValidationTimeout => "validation_timeout",
            ErrorClass::Unknown => "unknown_error",
        }
    }

    pub fn classify(error: &RepairError) -> Self {
        match error {
            RepairError::Collaborator(inner) => match inner {
                CollaboratorError::Timeout(_) | CollaboratorError::Network(_) => {
                    ErrorClass::NetworkTimeout
                }
                CollaboratorError::InvalidUrl(_) => ErrorClass::InvalidUrl,
                CollaboratorError::Analysis(_) => ErrorClass::ContentAnalysisFailed,
                CollaboratorError::Unavailable(message) | CollaboratorError::Other(message) => {
                    Self::classify_message(message)
                }
            },
            RepairError::Transaction(_) => ErrorClass::ReplacementFailed,
            RepairError::ValidationTimeout(_) => ErrorClass::ValidationTimeout,
            RepairError::PhaseFailed { class, .. } => *class,
            other => Self::classify_message(&other.to_string()),
        }
    }

    /// Classify free-form error text
    pub fn classify_message(message: &str) -> Self {
        let message = message.to_lowercase();
        if message.contains("validation timeout") {
            ErrorClass::ValidationTimeout
        } else if message.contains("timeout")
            || message.contains("timed out")
            || message.contains("network")
            || message.contains("connection")
        {
            ErrorClass::NetworkTimeout
        } else if message.contains("invalid url") {
            ErrorClass::InvalidUrl
        } else if message.contains("content analysis") {
            ErrorClass::ContentAnalysisFailed
        } else if message.contains("replacement") {
            ErrorClass::ReplacementFailed
        } else {
            ErrorClass::Unknown
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Recovery action for a classified phase failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    RetryWithBackoff,
    SkipAndContinue,
    MarkForManualReview,
    RollbackAndContinue,
    PartialCompletion,
}

impl RecoveryStrategy {
    /// `None` means the failure is not recoverable
    pub fn for_class(class: ErrorClass) -> Option<Self> {
        match class {
            ErrorClass::NetworkTimeout => Some(RecoveryStrategy::RetryWithBackoff),
            ErrorClass::InvalidUrl => Some(RecoveryStrategy::SkipAndContinue),
            ErrorClass::ContentAnalysisFailed => Some(RecoveryStrategy::MarkForManualReview),
            ErrorClass::ReplacementFailed => Some(RecoveryStrategy::RollbackAndContinue),
            ErrorClass::ValidationTimeout => Some(RecoveryStrategy::PartialCompletion),
            ErrorClass::Unknown => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_variants_take_precedence() {
        let err = RepairError::Collaborator(CollaboratorError::Timeout("HEAD request".into()));
        assert_eq!(ErrorClass::classify(&err), ErrorClass::NetworkTimeout);

        let err = RepairError::Transaction(TransactionError::EntryNotFound("dorian".into()));
        assert_eq!(ErrorClass::classify(&err), ErrorClass::ReplacementFailed);

        let err = RepairError::Collaborator(CollaboratorError::Analysis("empty body".into()));
        assert_eq!(ErrorClass::classify(&err), ErrorClass::ContentAnalysisFailed);
    }

    #[test]
    fn test_message_classification() {
        assert_eq!(
            ErrorClass::classify_message("validation timeout after 500 ms"),
            ErrorClass::ValidationTimeout
        );
        assert_eq!(
            ErrorClass::classify_message("Network Timeout while fetching"),
            ErrorClass::NetworkTimeout
        );
        assert_eq!(
            ErrorClass::classify_message("invalid URL: ht!tp"),
            ErrorClass::InvalidUrl
        );
        assert_eq!(
            ErrorClass::classify_message("analyzer exploded"),
            ErrorClass::Unknown
        );

        let err = RepairError::Other(anyhow::anyhow!("replacement step failed"));
        assert_eq!(ErrorClass::classify(&err), ErrorClass::ReplacementFailed);
    }

    #[test]
    fn test_recovery_table() {
        assert_eq!(
            RecoveryStrategy::for_class(ErrorClass::NetworkTimeout),
            Some(RecoveryStrategy::RetryWithBackoff)
        );
        assert_eq!(
            RecoveryStrategy::for_class(ErrorClass::ValidationTimeout),
            Some(RecoveryStrategy::PartialCompletion)
        );
        assert_eq!(RecoveryStrategy::for_class(ErrorClass::Unknown), None);
    }

    #[test]
    fn test_class_serializes_with_wire_names() {
        assert_eq!(
            serde_json::to_value(ErrorClass::Unknown).unwrap(),
            "unknown_error"
        );
        assert_eq!(ErrorClass::ContentAnalysisFailed.to_string(), "content_analysis_failed");
    }
}
