//! Citation validate-and-repair orchestration
//!
//! Four components, usable on their own or together:
//! - [`orchestrator::PhaseOrchestrator`]: ordered validation and repair
//!   pipeline producing a [`models::ValidationSession`]
//! - [`services::BatchProcessor`]: rate-limited, checkpointed batch runs
//! - [`services::TransactionalReplacer`]: backup/commit/rollback reference
//!   replacement
//! - [`scheduler::JobScheduler`]: recurring validators with retries,
//!   maintenance mode and a health monitor
//!
//! Fetching, scoring, matching and report formatting are supplied by the
//! caller through the traits in [`types`].

pub mod error;
pub mod job;
pub mod loader;
pub mod models;
pub mod orchestrator;
pub mod scheduler;
pub mod services;
pub mod types;

pub use crate::error::{ErrorClass, RecoveryStrategy, RepairError, Result};
pub use crate::job::{CitationSource, FileCitationSource, OrchestratorJob};
pub use crate::orchestrator::{Collaborators, PhaseOrchestrator, RunOptions};
pub use crate::scheduler::JobScheduler;
