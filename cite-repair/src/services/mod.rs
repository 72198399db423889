//! Services for citation repair

pub mod acceptance;
pub mod batch_processor;
pub mod guard;
pub mod quality;
pub mod replacer;
pub mod run_control;

pub use acceptance::AcceptanceChecks;
pub use batch_processor::{
    BatchError, BatchOptions, BatchProcessor, BatchSummary, BatchTiming, ItemProgressFn,
    TimingMetadata, Verdict,
};
pub use guard::{FnOperation, GuardedOperation, GuardedOperationExt, Logged, Timed, Validated};
pub use quality::{CreditPolicy, PartialCredit, QualityDelta, QualityScorer, StrictCredit};
pub use replacer::{
    BatchReplaceResult, PlannedReplacement, ReplaceOptions, ReplaceResult, ReplacementOutcome,
    TransactionalReplacer,
};
pub use run_control::{Gate, RunControl};
