//! Transactional replacer
//!
//! Replaces references in a [`CitationSet`] under a backup-then-commit-or-
//! rollback discipline. All operations are synchronous, so a transaction is
//! always closed before the call returns. A single "current transaction"
//! slot rejects a second open while one is active.
//!
//! Order of a single replacement:
//! 1. open the transaction
//! 2. validate identity (entry exists, index in range, candidate fields)
//! 3. snapshot the record (`backup_enabled`)
//! 4. acceptance checks (`validate_before_commit`)
//! 5. swap in the new reference
//! 6. commit, or roll back on any failure in 2-5

use crate::error::TransactionError;
use crate::models::{
    Backup, CitationSet, OperationStatus, ReferenceEntry, ReferenceLocator, ReplacementCandidate,
    Transaction,
    TransactionKind, TransactionOperation, TransactionStatus,
};
use crate::services::acceptance::{check_required_fields, AcceptanceChecks};
use crate::services::quality::{QualityDelta, QualityScorer};
use chrono::Utc;
use cite_common::config::ReplacerSettings;
use cite_common::{EventBus, RepairEvent};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplaceOptions {
    pub backup_enabled: bool,
    pub validate_before_commit: bool,
    pub allow_partial_success: bool,
}

impl From<&ReplacerSettings> for ReplaceOptions {
    fn from(settings: &ReplacerSettings) -> Self {
        Self {
            backup_enabled: settings.backup_enabled,
            validate_before_commit: settings.validate_before_commit,
            allow_partial_success: settings.allow_partial_success,
        }
    }
}

/// One entry of a replacement plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannedReplacement {
    pub entry_name: String,
    pub reference_index: usize,
    pub candidate: ReplacementCandidate,
    /// Why the reference is being replaced
    pub reasons: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplaceResult {
    pub success: bool,
    pub new_reference: Option<ReferenceEntry>,
    pub error: Option<String>,
    /// `None` only when the transaction could not be opened
    pub transaction_id: Option<Uuid>,
    pub quality: Option<QualityDelta>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplacementOutcome {
    pub entry_name: String,
    pub reference_index: usize,
    /// Applied inside the batch (undone again if the batch rolled back)
    pub applied: bool,
    pub new_reference: Option<ReferenceEntry>,
    pub error: Option<String>,
    pub quality: Option<QualityDelta>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReplaceResult {
    pub transaction_id: Uuid,
    pub status: TransactionStatus,
    /// Replacements in effect after the call
    pub succeeded: usize,
    pub failed: usize,
    pub outcomes: Vec<ReplacementOutcome>,
}

impl BatchReplaceResult {
    pub fn committed(&self) -> bool {
        self.status == TransactionStatus::Committed
    }
}

#[derive(Default)]
struct ReplacerState {
    current: Option<Transaction>,
    /// Most recent first
    history: VecDeque<Transaction>,
}

/// Transactional replacer service
pub struct TransactionalReplacer {
    settings: ReplacerSettings,
    acceptance: AcceptanceChecks,
    scorer: QualityScorer,
    state: Mutex<ReplacerState>,
    event_bus: Option<EventBus>,
}

impl TransactionalReplacer {
    pub fn new(settings: ReplacerSettings) -> Self {
        Self {
            acceptance: AcceptanceChecks::new(&settings.blocked_domains),
            settings,
            scorer: QualityScorer::default(),
            state: Mutex::new(ReplacerState::default()),
            event_bus: None,
        }
    }

    pub fn with_scorer(mut self, scorer: QualityScorer) -> Self {
        self.scorer = scorer;
        self
    }

    pub fn with_event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    /// Options derived from the configured settings
    pub fn default_options(&self) -> ReplaceOptions {
        ReplaceOptions::from(&self.settings)
    }

    pub fn acceptance(&self) -> &AcceptanceChecks {
        &self.acceptance
    }

    pub fn scorer(&self) -> &QualityScorer {
        &self.scorer
    }

    fn state(&self) -> MutexGuard<'_, ReplacerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Id of the transaction currently holding the slot
    pub fn current_transaction(&self) -> Option<Uuid> {
        self.state().current.as_ref().map(|tx| tx.id)
    }

    /// Closed transactions, most recent first
    pub fn history(&self) -> Vec<Transaction> {
        self.state().history.iter().cloned().collect()
    }

    // ========================================================================
    // Transaction primitives
    // ========================================================================

    /// Claim the transaction slot
    pub fn open_transaction(&self, kind: TransactionKind) -> Result<Uuid, TransactionError> {
        let mut state = self.state();
        if let Some(active) = &state.current {
            warn!(active = %active.id, "Rejected nested transaction");
            return Err(TransactionError::TransactionActive(active.id));
        }
        let tx = Transaction::open(kind);
        let id = tx.id;
        debug!(transaction_id = %id, ?kind, "Transaction opened");
        state.current = Some(tx);
        Ok(id)
    }

    /// Commit the active transaction, if any
    pub fn commit_transaction(&self) -> Option<Transaction> {
        let tx = {
            let mut state = self.state();
            let mut tx = state.current.take()?;
            tx.close(TransactionStatus::Committed, None);
            self.push_history(&mut state, tx.clone());
            tx
        };

        info!(
            transaction_id = %tx.id,
            operations = tx.operations.len(),
            applied = tx.applied_count(),
            failed = tx.failed_count(),
            "Transaction committed"
        );
        if let Some(bus) = &self.event_bus {
            bus.emit_lossy(RepairEvent::TransactionCommitted {
                transaction_id: tx.id,
                operations: tx.applied_count(),
                timestamp: Utc::now(),
            });
        }
        Some(tx)
    }

    /// Roll back the active transaction, restoring every record it changed
    pub fn rollback_transaction(
        &self,
        citations: &mut CitationSet,
        reason: &str,
    ) -> Option<Transaction> {
        let tx = {
            let mut state = self.state();
            let mut tx = state.current.take()?;
            let transaction_id = tx.id;

            for op in tx.operations.iter_mut().rev() {
                if op.status != OperationStatus::Applied {
                    continue;
                }
                let restored = match (&op.backup, &op.previous) {
                    (Some(backup), _) => {
                        citations.insert(backup.entry_name.clone(), backup.snapshot.clone());
                        true
                    }
                    (None, Some(previous)) => citations
                        .reference_mut(&ReferenceLocator::new(op.entry_name.as_str(), op.reference_index))
                        .map(|slot| *slot = previous.clone())
                        .is_some(),
                    (None, None) => false,
                };
                if restored {
                    op.status = OperationStatus::Reverted;
                } else {
                    warn!(
                        %transaction_id,
                        entry = %op.entry_name,
                        index = op.reference_index,
                        "Replacement cannot be reverted"
                    );
                }
            }

            tx.close(TransactionStatus::RolledBack, Some(reason.to_string()));
            self.push_history(&mut state, tx.clone());
            tx
        };

        warn!(transaction_id = %tx.id, reason, "Transaction rolled back");
        if let Some(bus) = &self.event_bus {
            bus.emit_lossy(RepairEvent::TransactionRolledBack {
                transaction_id: tx.id,
                reason: reason.to_string(),
                timestamp: Utc::now(),
            });
        }
        Some(tx)
    }

    fn push_history(&self, state: &mut ReplacerState, tx: Transaction) {
        state.history.push_front(tx);
        state
            .history
            .truncate(self.settings.transaction_history_limit.max(1));
    }

    /// Apply one replacement inside the active transaction
    ///
    /// Records the operation (applied or failed) on the transaction. The
    /// record is only touched once every check has passed.
    fn apply(
        &self,
        citations: &mut CitationSet,
        entry_name: &str,
        reference_index: usize,
        candidate: &ReplacementCandidate,
        options: &ReplaceOptions,
    ) -> Result<(ReferenceEntry, QualityDelta), TransactionError> {
        let mut backup = None;
        let mut previous = None;

        let outcome = self.apply_checked(
            citations,
            entry_name,
            reference_index,
            candidate,
            options,
            &mut backup,
            &mut previous,
        );

        let mut state = self.state();
        if let Some(tx) = state.current.as_mut() {
            if tx.kind == TransactionKind::Single && tx.backup.is_none() {
                tx.backup = backup.clone();
            }
            tx.operations.push(TransactionOperation {
                entry_name: entry_name.to_string(),
                reference_index,
                original_url: previous.as_ref().map(|r| r.url.clone()),
                new_url: candidate.url.clone(),
                status: if outcome.is_ok() {
                    OperationStatus::Applied
                } else {
                    OperationStatus::Failed
                },
                error: outcome.as_ref().err().map(|e| e.to_string()),
                backup,
                previous,
            });
        }
        outcome
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_checked(
        &self,
        citations: &mut CitationSet,
        entry_name: &str,
        reference_index: usize,
        candidate: &ReplacementCandidate,
        options: &ReplaceOptions,
        backup: &mut Option<Backup>,
        previous: &mut Option<ReferenceEntry>,
    ) -> Result<(ReferenceEntry, QualityDelta), TransactionError> {
        let record = citations
            .get_mut(entry_name)
            .ok_or_else(|| TransactionError::EntryNotFound(entry_name.to_string()))?;

        let len = record.references.len();
        let original = record
            .references
            .get(reference_index)
            .cloned()
            .ok_or_else(|| TransactionError::IndexOutOfRange {
                entry_name: entry_name.to_string(),
                index: reference_index,
                len,
            })?;
        *previous = Some(original.clone());
        check_required_fields(candidate)?;

        if options.backup_enabled {
            *backup = Some(Backup::capture(entry_name, record));
        }

        if options.validate_before_commit {
            self.acceptance.check(&original, candidate)?;
        }

        let replacement = build_replacement(&original, candidate);
        let quality = self.scorer.delta(&original, &replacement);
        record.references[reference_index] = replacement.clone();

        debug!(
            entry = entry_name,
            index = reference_index,
            from = %original.url,
            to = %replacement.url,
            improvement = quality.improvement,
            "Reference replaced"
        );
        Ok((replacement, quality))
    }

    // ========================================================================
    // Public operations
    // ========================================================================

    /// Replace one reference in its own transaction
    pub fn replace(
        &self,
        citations: &mut CitationSet,
        entry_name: &str,
        reference_index: usize,
        candidate: &ReplacementCandidate,
        options: &ReplaceOptions,
    ) -> ReplaceResult {
        let transaction_id = match self.open_transaction(TransactionKind::Single) {
            Ok(id) => id,
            Err(e) => {
                return ReplaceResult {
                    success: false,
                    new_reference: None,
                    error: Some(e.to_string()),
                    transaction_id: None,
                    quality: None,
                }
            }
        };

        match self.apply(citations, entry_name, reference_index, candidate, options) {
            Ok((new_reference, quality)) => {
                self.commit_transaction();
                ReplaceResult {
                    success: true,
                    new_reference: Some(new_reference),
                    error: None,
                    transaction_id: Some(transaction_id),
                    quality: Some(quality),
                }
            }
            Err(e) => {
                let reason = e.to_string();
                self.rollback_transaction(citations, &reason);
                ReplaceResult {
                    success: false,
                    new_reference: None,
                    error: Some(reason),
                    transaction_id: Some(transaction_id),
                    quality: None,
                }
            }
        }
    }

    /// Apply a whole plan inside one outer transaction
    ///
    /// Any failure rolls back every replacement unless
    /// `allow_partial_success` is set, in which case the successes commit
    /// and the failures are reported.
    pub fn replace_many(
        &self,
        citations: &mut CitationSet,
        plan: &[PlannedReplacement],
        options: &ReplaceOptions,
    ) -> Result<BatchReplaceResult, TransactionError> {
        let transaction_id = self.open_transaction(TransactionKind::Batch)?;

        let mut outcomes = Vec::with_capacity(plan.len());
        for planned in plan {
            let outcome = match self.apply(
                citations,
                &planned.entry_name,
                planned.reference_index,
                &planned.candidate,
                options,
            ) {
                Ok((new_reference, quality)) => ReplacementOutcome {
                    entry_name: planned.entry_name.clone(),
                    reference_index: planned.reference_index,
                    applied: true,
                    new_reference: Some(new_reference),
                    error: None,
                    quality: Some(quality),
                },
                Err(e) => ReplacementOutcome {
                    entry_name: planned.entry_name.clone(),
                    reference_index: planned.reference_index,
                    applied: false,
                    new_reference: None,
                    error: Some(e.to_string()),
                    quality: None,
                },
            };
            outcomes.push(outcome);
        }

        let applied = outcomes.iter().filter(|o| o.applied).count();
        let failed = outcomes.len() - applied;

        let (status, succeeded) = if failed == 0 || options.allow_partial_success {
            self.commit_transaction();
            (TransactionStatus::Committed, applied)
        } else {
            let reason = TransactionError::BatchRolledBack {
                failed,
                total: outcomes.len(),
            }
            .to_string();
            self.rollback_transaction(citations, &reason);
            (TransactionStatus::RolledBack, 0)
        };

        Ok(BatchReplaceResult {
            transaction_id,
            status,
            succeeded,
            failed,
            outcomes,
        })
    }
}

/// New reference built from a candidate, carrying replacement provenance
///
/// Descriptive fields the candidate leaves empty keep the original's value.
fn build_replacement(original: &ReferenceEntry, candidate: &ReplacementCandidate) -> ReferenceEntry {
    ReferenceEntry {
        url: candidate.url.trim().to_string(),
        title: candidate.title.trim().to_string(),
        kind: if candidate.kind.trim().is_empty() {
            original.kind.clone()
        } else {
            candidate.kind.clone()
        },
        authors: candidate.authors.clone().or_else(|| original.authors.clone()),
        publisher: candidate.publisher.clone().or_else(|| original.publisher.clone()),
        year: candidate.year.clone().or_else(|| original.year.clone()),
        accessible: candidate.accessible,
        content_relevant: candidate.content_relevant,
        relevance_score: candidate.relevance_score,
        replaced_at: Some(Utc::now()),
        original_url: Some(original.url.clone()),
        original_title: Some(original.title.clone()),
    }
}
