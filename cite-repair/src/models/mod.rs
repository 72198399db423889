//! Data models for citation repair

pub mod checkpoint;
pub mod citation;
pub mod schedule;
pub mod session;
pub mod transaction;

pub use checkpoint::{checkpoint_key, Checkpoint, ItemError};
pub use citation::{
    CitationRecord, CitationSet, ReferenceEntry, ReferenceLocator, ReplacementCandidate, Tristate,
};
pub use schedule::{JobState, Priority, ScheduleEntry, ScheduleOptions};
pub use session::{
    ManualReviewItem, Phase, PhaseEntry, PhaseResult, PhaseStatus, SessionIssue, SessionKind,
    SessionStatus, SessionSummary, ValidationSession,
};
pub use transaction::{
    Backup, OperationStatus, Transaction, TransactionKind, TransactionOperation, TransactionStatus,
};
