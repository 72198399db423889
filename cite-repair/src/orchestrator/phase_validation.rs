//! Validation phases
//!
//! initialization, accessibility_validation, content_analysis,
//! duplication_detection and attribution_verification. None of these
//! replace anything; they annotate references in place and collect the
//! findings replacement planning works from.

use super::context::{keywords_for, PipelineContext};
use super::{batch_options, PhaseOrchestrator, ProgressTracker};
use crate::error::{CollaboratorError, RepairError, Result};
use crate::models::{
    CitationSet, Phase, PhaseResult, PhaseStatus, ReferenceEntry, ReferenceLocator, Tristate,
};
use crate::services::{BatchSummary, Verdict};
use crate::types::{AttributionCheck, ContentAnalysis, ExtractedMetadata};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

impl Verdict for ContentAnalysis {
    fn verdict(&self) -> Tristate {
        self.relevant.into()
    }
}

impl Verdict for AttributionCheck {
    fn verdict(&self) -> Tristate {
        self.accurate.into()
    }
}

/// Work item for the content analysis batch
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContentItem {
    locator: ReferenceLocator,
    content: String,
    keywords: Vec<String>,
}

/// Work item for the attribution batch
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AttributionItem {
    locator: ReferenceLocator,
    reference: ReferenceEntry,
    metadata: ExtractedMetadata,
}

/// A batch in which every item failed is a phase failure, not a result
pub(super) fn all_failed_error<O>(summary: &BatchSummary<O>) -> Option<RepairError> {
    if !summary.all_failed() {
        return None;
    }
    let message = summary
        .errors
        .first()
        .map(|e| e.message.clone())
        .unwrap_or_default();
    Some(CollaboratorError::Other(message).into())
}

impl PhaseOrchestrator {
    /// Count what we were given and take the starting health figure
    pub(super) async fn phase_initialization(
        &self,
        ctx: &mut PipelineContext,
        citations: &mut CitationSet,
    ) -> Result<PhaseResult> {
        let mut warnings = Vec::new();
        if citations.is_empty() {
            warnings.push("Citation set is empty".to_string());
        }
        for (name, record) in citations.iter() {
            if record.references.is_empty() {
                warnings.push(format!("Entry {} has no references", name));
            }
        }
        for (locator, reference) in citations.references() {
            if reference.url.trim().is_empty() {
                warnings.push(format!("Reference {} has no URL", locator));
            }
        }

        ctx.refresh_counts(citations, &self.scorer);
        let initial_health = ctx.summary.health_percentage;
        ctx.initial_health = Some(initial_health);

        tracing::info!(
            session_id = %ctx.session_id,
            entries = ctx.summary.total_entries,
            references = ctx.summary.total_references,
            initial_health,
            "Citation set loaded"
        );

        let mut result = PhaseResult::new(
            PhaseStatus::Completed,
            json!({
                "entries": ctx.summary.total_entries,
                "references": ctx.summary.total_references,
                "initialHealth": initial_health,
                "creditPolicy": self.scorer.policy_name(),
            }),
        );
        result.warnings = warnings;
        Ok(result)
    }

    pub(super) async fn phase_accessibility(
        &self,
        ctx: &mut PipelineContext,
        citations: &mut CitationSet,
        tracker: &Arc<ProgressTracker>,
    ) -> Result<PhaseResult> {
        let checker = self
            .collaborators
            .accessibility
            .as_deref()
            .ok_or(RepairError::DependencyMissing {
                phase: Phase::AccessibilityValidation,
                collaborator: "accessibility checker",
            })?;

        let tracker = Arc::clone(tracker);
        let progress = move |processed: usize, total: usize| tracker.item_progress(processed, total);
        let report = checker.check_all(citations, &progress).await?;

        let mut stale = 0;
        for check in &report.results {
            match citations.reference_mut(&check.locator) {
                // The URL guard keeps a result from landing on a reference it was not taken for
                Some(reference) if reference.url == check.url => {
                    reference.accessible = check.accessible;
                }
                _ => stale += 1,
            }
            ctx.checks.insert(check.locator.clone(), check.clone());
        }
        ctx.refresh_counts(citations, &self.scorer);

        tracing::info!(
            session_id = %ctx.session_id,
            checked = report.summary.checked,
            accessible = report.summary.accessible,
            inaccessible = report.summary.inaccessible,
            unknown = report.summary.unknown,
            "Accessibility validated"
        );

        let mut result = PhaseResult::new(
            PhaseStatus::Completed,
            json!({
                "summary": report.summary,
                "results": report.results.len(),
            }),
        );
        if stale > 0 {
            result
                .warnings
                .push(format!("{} accessibility results did not match a reference", stale));
        }
        Ok(result)
    }

    pub(super) async fn phase_content_analysis(
        &self,
        ctx: &mut PipelineContext,
        citations: &mut CitationSet,
        tracker: &Arc<ProgressTracker>,
    ) -> Result<PhaseResult> {
        let analyzer = self
            .collaborators
            .content
            .as_deref()
            .ok_or(RepairError::DependencyMissing {
                phase: Phase::ContentAnalysis,
                collaborator: "content analyzer",
            })?;

        let items: Vec<ContentItem> = ctx
            .checks
            .iter()
            .filter(|(locator, _)| citations.reference(locator).is_some())
            .filter_map(|(locator, check)| {
                let content = check.content.as_ref().filter(|c| !c.trim().is_empty())?;
                Some(ContentItem {
                    locator: locator.clone(),
                    content: content.clone(),
                    keywords: keywords_for(citations, &locator.entry_name),
                })
            })
            .collect();

        let skipped = citations.reference_count().saturating_sub(items.len());
        if items.is_empty() {
            tracing::info!(session_id = %ctx.session_id, "No fetched content to analyze");
            return Ok(PhaseResult::new(
                PhaseStatus::Completed,
                json!({ "analyzed": 0, "withoutContent": skipped }),
            ));
        }

        let locators: Vec<ReferenceLocator> = items.iter().map(|i| i.locator.clone()).collect();
        let summary = self
            .batch
            .process_batch(
                items,
                &batch_options("content_analysis", tracker),
                move |item: ContentItem| async move {
                    analyzer
                        .analyze(&item.content, &item.locator.entry_name, &item.keywords)
                        .await
                },
            )
            .await?;

        if let Some(error) = all_failed_error(&summary) {
            return Err(error);
        }

        let mut issues = Vec::new();
        for (locator, analysis) in locators.iter().zip(&summary.results) {
            let (Some(analysis), Some(reference)) = (analysis, citations.reference_mut(locator)) else {
                continue;
            };
            reference.content_relevant = analysis.relevant.into();
            reference.relevance_score = Some(analysis.score);
            for issue in &analysis.issues {
                issues.push(format!("{}: {}", locator, issue));
            }
        }
        ctx.refresh_counts(citations, &self.scorer);

        tracing::info!(
            session_id = %ctx.session_id,
            analyzed = summary.processed,
            relevant = summary.succeeded,
            failed = summary.failed,
            "Content analyzed"
        );

        let mut result = PhaseResult::new(
            PhaseStatus::Completed,
            json!({
                "analyzed": summary.processed,
                "relevant": summary.succeeded,
                "notRelevant": summary.failed - summary.errors.len(),
                "errors": summary.errors.len(),
                "withoutContent": skipped,
                "issues": issues,
                "stopped": summary.stopped,
            }),
        );
        for error in &summary.errors {
            result
                .warnings
                .push(format!("Content analysis failed for {}: {}", locators[error.index], error.message));
        }
        Ok(result)
    }

    pub(super) async fn phase_duplication(
        &self,
        ctx: &mut PipelineContext,
        citations: &mut CitationSet,
    ) -> Result<PhaseResult> {
        let detector = self
            .collaborators
            .duplicates
            .as_deref()
            .ok_or(RepairError::DependencyMissing {
                phase: Phase::DuplicationDetection,
                collaborator: "duplicate detector",
            })?;

        let report = detector.detect_duplicates(citations).await?;
        ctx.duplicates = report
            .groups
            .into_iter()
            .filter(|group| group.members.len() > 1)
            .collect();
        ctx.summary.duplicate_groups = ctx.duplicates.len();

        let redundant: usize = ctx.duplicates.iter().map(|g| g.members.len() - 1).sum();
        tracing::info!(
            session_id = %ctx.session_id,
            groups = ctx.duplicates.len(),
            redundant,
            "Duplicates detected"
        );

        Ok(PhaseResult::new(
            PhaseStatus::Completed,
            json!({ "groups": ctx.duplicates, "redundantReferences": redundant }),
        ))
    }

    pub(super) async fn phase_attribution(
        &self,
        ctx: &mut PipelineContext,
        citations: &mut CitationSet,
        tracker: &Arc<ProgressTracker>,
    ) -> Result<PhaseResult> {
        let verifier = self
            .collaborators
            .attribution
            .as_deref()
            .ok_or(RepairError::DependencyMissing {
                phase: Phase::AttributionVerification,
                collaborator: "attribution verifier",
            })?;

        let items: Vec<AttributionItem> = ctx
            .checks
            .iter()
            .filter_map(|(locator, check)| {
                let metadata = check.metadata.clone()?;
                let reference = citations.reference(locator)?.clone();
                Some(AttributionItem {
                    locator: locator.clone(),
                    reference,
                    metadata,
                })
            })
            .collect();

        if items.is_empty() {
            return Ok(PhaseResult::new(PhaseStatus::Completed, json!({ "verified": 0 })));
        }

        let locators: Vec<ReferenceLocator> = items.iter().map(|i| i.locator.clone()).collect();
        let summary = self
            .batch
            .process_batch(
                items,
                &batch_options("attribution_verification", tracker),
                move |item: AttributionItem| async move {
                    verifier.verify(&item.reference, &item.metadata).await
                },
            )
            .await?;

        if let Some(error) = all_failed_error(&summary) {
            return Err(error);
        }

        ctx.attribution_issues.clear();
        for (locator, check) in locators.iter().zip(&summary.results) {
            let Some(check) = check else { continue };
            if check.accurate {
                continue;
            }
            let reason = if check.issues.is_empty() {
                "Attribution does not match the source".to_string()
            } else {
                check.issues.join("; ")
            };
            ctx.review(Phase::AttributionVerification, Some(locator.to_string()), reason);
            ctx.attribution_issues.insert(locator.clone(), check.issues.clone());
        }
        ctx.summary.attribution_issues = ctx.attribution_issues.len();

        tracing::info!(
            session_id = %ctx.session_id,
            verified = summary.processed,
            inaccurate = ctx.attribution_issues.len(),
            "Attribution verified"
        );

        let mut result = PhaseResult::new(
            PhaseStatus::Completed,
            json!({
                "verified": summary.processed,
                "accurate": summary.succeeded,
                "inaccurate": ctx.attribution_issues.len(),
                "errors": summary.errors.len(),
            }),
        );
        for error in &summary.errors {
            result.warnings.push(format!(
                "Attribution check failed for {}: {}",
                locators[error.index], error.message
            ));
        }
        Ok(result)
    }
}
