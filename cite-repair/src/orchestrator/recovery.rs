//! Phase dispatch and failure recovery
//!
//! A phase handler either returns a [`PhaseResult`] or an error. Errors are
//! classified and routed through [`RecoveryStrategy::for_class`]; an error
//! with no strategy (or a retry budget that ran out) fails the phase, which
//! aborts the session unless partial validation is enabled.

use super::context::PipelineContext;
use super::{PhaseOrchestrator, ProgressTracker};
use crate::error::{ErrorClass, RecoveryStrategy, RepairError, Result};
use crate::models::{CitationSet, Phase, PhaseResult, PhaseStatus, SessionIssue, ValidationSession};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

impl PhaseOrchestrator {
    /// Run one phase, applying the recovery strategy for any failure
    ///
    /// # Returns
    /// The phase result to record, or the error that aborts the session
    pub(super) async fn run_phase_with_recovery(
        &self,
        phase: Phase,
        session: &mut ValidationSession,
        ctx: &mut PipelineContext,
        citations: &mut CitationSet,
        tracker: &Arc<ProgressTracker>,
    ) -> Result<PhaseResult> {
        let started = Instant::now();
        let mut attempt: u32 = 1;

        loop {
            let outcome = self.dispatch(phase, session, ctx, citations, tracker).await;

            let error = match outcome {
                Ok(mut result) => {
                    result.attempts = attempt;
                    result.duration_ms = started.elapsed().as_millis() as u64;
                    if attempt > 1 && result.status == PhaseStatus::Completed {
                        result.status = PhaseStatus::Retried;
                    }
                    return Ok(result);
                }
                Err(e) => e,
            };

            if let RepairError::DependencyMissing { collaborator, .. } = &error {
                if self.settings.enable_partial_validation {
                    tracing::warn!(
                        session_id = %ctx.session_id,
                        phase = %phase,
                        collaborator,
                        "Collaborator missing, skipping phase"
                    );
                    return Ok(self.finish(
                        PhaseResult::skipped(error.to_string()),
                        attempt,
                        started,
                    ));
                }
                return Err(error);
            }

            let class = ErrorClass::classify(&error);
            let message = error.to_string();
            let strategy = RecoveryStrategy::for_class(class);

            tracing::warn!(
                session_id = %ctx.session_id,
                phase = %phase,
                attempt,
                class = %class,
                strategy = ?strategy,
                error = %message,
                "Phase handler failed"
            );

            let result = match strategy {
                Some(RecoveryStrategy::RetryWithBackoff) if attempt <= self.settings.max_retries => {
                    let delay = backoff_delay(self.settings.retry_base_delay_ms, attempt);
                    session.warnings.push(SessionIssue::new(
                        Some(phase),
                        Some(class),
                        format!(
                            "Attempt {} failed ({}), retrying in {} ms",
                            attempt,
                            message,
                            delay.as_millis()
                        ),
                    ));
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                    continue;
                }
                Some(RecoveryStrategy::RetryWithBackoff) | None => {
                    if !self.settings.enable_partial_validation {
                        return Err(RepairError::PhaseFailed {
                            phase,
                            class,
                            message,
                        });
                    }
                    let mut result = PhaseResult::failed(message);
                    result.error_class = Some(class);
                    result
                }
                Some(RecoveryStrategy::SkipAndContinue) => {
                    let mut result = PhaseResult::skipped(message);
                    result.error_class = Some(class);
                    result
                }
                Some(RecoveryStrategy::MarkForManualReview) => {
                    ctx.review(phase, None, message.clone());
                    let mut result = PhaseResult::skipped(format!("Marked for manual review: {}", message));
                    result.error_class = Some(class);
                    result
                }
                Some(RecoveryStrategy::RollbackAndContinue) => {
                    if self.replacer.current_transaction().is_some() {
                        self.replacer.rollback_transaction(citations, &message);
                    }
                    let mut result = PhaseResult::failed(message);
                    result.error_class = Some(class);
                    result
                }
                Some(RecoveryStrategy::PartialCompletion) => {
                    let mut result = PhaseResult::new(
                        PhaseStatus::Completed,
                        json!({ "partial": true, "reason": message }),
                    );
                    result.warnings.push(format!("Completed partially: {}", message));
                    result.error_class = Some(class);
                    result
                }
            };

            return Ok(self.finish(result, attempt, started));
        }
    }

    fn finish(&self, mut result: PhaseResult, attempts: u32, started: Instant) -> PhaseResult {
        result.attempts = attempts;
        result.duration_ms = started.elapsed().as_millis() as u64;
        result
    }

    async fn dispatch(
        &self,
        phase: Phase,
        session: &ValidationSession,
        ctx: &mut PipelineContext,
        citations: &mut CitationSet,
        tracker: &Arc<ProgressTracker>,
    ) -> Result<PhaseResult> {
        match phase {
            Phase::Initialization => self.phase_initialization(ctx, citations).await,
            Phase::AccessibilityValidation => {
                self.phase_accessibility(ctx, citations, tracker).await
            }
            Phase::ContentAnalysis => self.phase_content_analysis(ctx, citations, tracker).await,
            Phase::DuplicationDetection => self.phase_duplication(ctx, citations).await,
            Phase::AttributionVerification => {
                self.phase_attribution(ctx, citations, tracker).await
            }
            Phase::ReplacementPlanning => {
                self.phase_replacement_planning(ctx, citations, tracker).await
            }
            Phase::ReplacementExecution => self.phase_replacement_execution(ctx, citations).await,
            Phase::FinalValidation => self.phase_final_validation(ctx, citations).await,
            Phase::Reporting => self.phase_reporting(session, ctx, citations).await,
        }
    }
}

/// `base * 2^(attempt - 1)`
fn backoff_delay(base_ms: u64, attempt: u32) -> Duration {
    let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
    Duration::from_millis(base_ms.saturating_mul(factor))
}
