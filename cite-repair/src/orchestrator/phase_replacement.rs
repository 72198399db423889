//! Replacement phases
//!
//! Planning asks the source matcher for candidates for every problematic
//! reference and keeps the best one that would pass acceptance. Execution
//! applies the whole plan through the transactional replacer in a single
//! batch transaction.

use super::context::{keywords_for, PipelineContext};
use super::phase_validation::all_failed_error;
use super::{batch_options, PhaseOrchestrator, ProgressTracker};
use crate::error::{RepairError, Result, TransactionError};
use crate::models::{
    CitationSet, Phase, PhaseResult, PhaseStatus, ReferenceEntry, ReferenceLocator,
    ReplacementCandidate,
};
use crate::services::acceptance::check_required_fields;
use crate::services::PlannedReplacement;
use crate::types::MatchContext;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

/// Work item for the planning batch
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlanItem {
    locator: ReferenceLocator,
    reference: ReferenceEntry,
    context: MatchContext,
}

impl PhaseOrchestrator {
    pub(super) async fn phase_replacement_planning(
        &self,
        ctx: &mut PipelineContext,
        citations: &mut CitationSet,
        tracker: &Arc<ProgressTracker>,
    ) -> Result<PhaseResult> {
        let matcher = self
            .collaborators
            .matcher
            .as_deref()
            .ok_or(RepairError::DependencyMissing {
                phase: Phase::ReplacementPlanning,
                collaborator: "source matcher",
            })?;

        let items: Vec<PlanItem> = citations
            .references()
            .filter_map(|(locator, reference)| {
                let mut reasons = Vec::new();
                if reference.accessible.is_false() {
                    reasons.push("inaccessible".to_string());
                }
                if reference.content_relevant.is_false() {
                    reasons.push("not relevant to the entry".to_string());
                }
                if let Some(keep) = ctx.duplicate_of(&locator) {
                    reasons.push(format!("duplicate of {}", keep));
                }
                if reasons.is_empty() {
                    return None;
                }

                let context = MatchContext {
                    entry_name: locator.entry_name.clone(),
                    description: citations
                        .get(&locator.entry_name)
                        .map(|record| record.description.clone())
                        .unwrap_or_default(),
                    keywords: keywords_for(citations, &locator.entry_name),
                    reasons,
                };
                Some(PlanItem {
                    locator,
                    reference: reference.clone(),
                    context,
                })
            })
            .collect();

        ctx.plan.clear();
        if items.is_empty() {
            ctx.summary.replacements_planned = 0;
            tracing::info!(session_id = %ctx.session_id, "No problematic references, nothing to plan");
            return Ok(PhaseResult::new(
                PhaseStatus::Completed,
                json!({ "problematic": 0, "planned": 0 }),
            ));
        }

        let problematic = items.len();
        let summary = self
            .batch
            .process_batch(
                items.clone(),
                &batch_options("replacement_planning", tracker),
                move |item: PlanItem| async move {
                    matcher.find_replacements(&item.reference, &item.context).await
                },
            )
            .await?;

        if let Some(error) = all_failed_error(&summary) {
            return Err(error);
        }

        let mut warnings = Vec::new();
        for (index, (item, found)) in items.iter().zip(&summary.results).enumerate() {
            let subject = Some(item.locator.to_string());
            let reasons = item.context.reasons.join(", ");

            let Some(candidates) = found else {
                let message = summary
                    .errors
                    .iter()
                    .find(|e| e.index == index)
                    .map(|e| e.message.as_str())
                    .unwrap_or("not processed");
                warnings.push(format!("Source matching failed for {}: {}", item.locator, message));
                ctx.review(
                    Phase::ReplacementPlanning,
                    subject,
                    format!("Source matching failed ({}): {}", reasons, message),
                );
                continue;
            };

            match self.best_candidate(&item.reference, candidates) {
                Some(candidate) => ctx.plan.push(PlannedReplacement {
                    entry_name: item.locator.entry_name.clone(),
                    reference_index: item.locator.reference_index,
                    candidate,
                    reasons: item.context.reasons.clone(),
                }),
                None => ctx.review(
                    Phase::ReplacementPlanning,
                    subject,
                    format!("No acceptable replacement found ({})", reasons),
                ),
            }
        }
        ctx.summary.replacements_planned = ctx.plan.len();

        tracing::info!(
            session_id = %ctx.session_id,
            problematic,
            planned = ctx.plan.len(),
            unresolved = problematic - ctx.plan.len(),
            "Replacement plan built"
        );

        let mut result = PhaseResult::new(
            PhaseStatus::Completed,
            json!({
                "problematic": problematic,
                "planned": ctx.plan.len(),
                "plan": ctx.plan,
            }),
        );
        result.warnings = warnings;
        Ok(result)
    }

    /// Highest-confidence candidate that would pass acceptance
    fn best_candidate(
        &self,
        original: &ReferenceEntry,
        candidates: &[ReplacementCandidate],
    ) -> Option<ReplacementCandidate> {
        let mut ranked: Vec<&ReplacementCandidate> = candidates.iter().collect();
        ranked.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

        ranked
            .into_iter()
            .find(|candidate| {
                check_required_fields(candidate).is_ok()
                    && self.replacer.acceptance().check(original, candidate).is_ok()
            })
            .cloned()
    }

    pub(super) async fn phase_replacement_execution(
        &self,
        ctx: &mut PipelineContext,
        citations: &mut CitationSet,
    ) -> Result<PhaseResult> {
        if ctx.plan.is_empty() {
            return Ok(PhaseResult::new(
                PhaseStatus::Completed,
                json!({ "planned": 0, "succeeded": 0, "failed": 0 }),
            ));
        }

        if ctx.dry_run {
            tracing::info!(
                session_id = %ctx.session_id,
                planned = ctx.plan.len(),
                "Dry run, replacements not applied"
            );
            return Ok(PhaseResult::skipped(format!(
                "Dry run: {} replacements planned, none applied",
                ctx.plan.len()
            )));
        }

        let options = self.replacer.default_options();
        let outcome = self.replacer.replace_many(citations, &ctx.plan, &options)?;

        ctx.summary.replacements_executed = outcome.succeeded;
        ctx.summary.replacements_failed = outcome.failed;

        let mut warnings = Vec::new();
        for failure in outcome.outcomes.iter().filter(|o| !o.applied) {
            let subject = ReferenceLocator::new(failure.entry_name.clone(), failure.reference_index);
            let error = failure.error.clone().unwrap_or_default();
            warnings.push(format!("Replacement of {} failed: {}", subject, error));
            ctx.review(
                Phase::ReplacementExecution,
                Some(subject.to_string()),
                format!("Replacement failed: {}", error),
            );
        }

        if !outcome.committed() {
            tracing::warn!(
                session_id = %ctx.session_id,
                transaction_id = %outcome.transaction_id,
                failed = outcome.failed,
                total = outcome.outcomes.len(),
                "Replacement batch rolled back"
            );
            return Err(TransactionError::BatchRolledBack {
                failed: outcome.failed,
                total: outcome.outcomes.len(),
            }
            .into());
        }

        ctx.refresh_counts(citations, &self.scorer);
        let improvement: f64 = outcome
            .outcomes
            .iter()
            .filter_map(|o| o.quality.as_ref())
            .map(|q| q.improvement)
            .sum();

        tracing::info!(
            session_id = %ctx.session_id,
            transaction_id = %outcome.transaction_id,
            succeeded = outcome.succeeded,
            failed = outcome.failed,
            improvement,
            "Replacements committed"
        );

        let mut result = PhaseResult::new(
            PhaseStatus::Completed,
            json!({
                "transactionId": outcome.transaction_id,
                "status": outcome.status,
                "succeeded": outcome.succeeded,
                "failed": outcome.failed,
                "totalImprovement": improvement,
                "outcomes": outcome.outcomes,
            }),
        );
        result.warnings = warnings;
        Ok(result)
    }
}
