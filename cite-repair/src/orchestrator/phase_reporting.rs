//! Closing phases: final statistics and the report

use super::context::PipelineContext;
use super::PhaseOrchestrator;
use crate::error::{RepairError, Result};
use crate::models::{CitationSet, Phase, PhaseResult, PhaseStatus, ValidationSession};
use crate::types::ReportInput;
use serde_json::json;

impl PhaseOrchestrator {
    /// Recompute statistics over the repaired set
    pub(super) async fn phase_final_validation(
        &self,
        ctx: &mut PipelineContext,
        citations: &mut CitationSet,
    ) -> Result<PhaseResult> {
        ctx.refresh_counts(citations, &self.scorer);
        let final_health = ctx.summary.health_percentage;
        let improvement = ctx.initial_health.map(|initial| final_health - initial);

        let remaining_problematic = citations
            .references()
            .filter(|(_, reference)| reference.is_problematic())
            .count();
        let replacements_in_set = citations
            .references()
            .filter(|(_, reference)| reference.is_replacement())
            .count();

        tracing::info!(
            session_id = %ctx.session_id,
            final_health,
            improvement = improvement.unwrap_or_default(),
            remaining_problematic,
            "Final validation complete"
        );

        Ok(PhaseResult::new(
            PhaseStatus::Completed,
            json!({
                "initialHealth": ctx.initial_health,
                "finalHealth": final_health,
                "improvement": improvement,
                "remainingProblematic": remaining_problematic,
                "replacementsInSet": replacements_in_set,
                "creditPolicy": self.scorer.policy_name(),
            }),
        ))
    }

    pub(super) async fn phase_reporting(
        &self,
        session: &ValidationSession,
        ctx: &mut PipelineContext,
        citations: &mut CitationSet,
    ) -> Result<PhaseResult> {
        let reporter = self
            .collaborators
            .reporter
            .as_deref()
            .ok_or(RepairError::DependencyMissing {
                phase: Phase::Reporting,
                collaborator: "reporter",
            })?;

        let input = ReportInput {
            session,
            citations,
        };
        let report = reporter.generate(&input, &ctx.report_options).await?;

        tracing::info!(
            session_id = %ctx.session_id,
            format = %ctx.report_options.format,
            "Report generated"
        );
        Ok(PhaseResult::new(PhaseStatus::Completed, report))
    }
}
