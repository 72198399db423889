//! Phase orchestrator
//!
//! Runs a fixed, ordered pipeline of phases against a [`CitationSet`] and
//! produces one [`ValidationSession`] per run.
//!
//! # Pipeline
//! initialization → accessibility_validation → content_analysis →
//! duplication_detection → attribution_verification → replacement_planning →
//! replacement_execution → final_validation → reporting
//!
//! # Architecture
//! Each phase is handled by a dedicated `phase_*` method, grouped by family:
//!
//! - `phase_validation.rs`: initialization, accessibility, content,
//!   duplicates, attribution
//! - `phase_replacement.rs`: replacement planning and execution
//! - `phase_reporting.rs`: final validation statistics and the report
//!
//! Failures go through `recovery.rs`, which classifies the error and applies
//! the matching recovery strategy (retry with backoff, skip, manual review,
//! rollback, partial completion).
//!
//! Pause and stop are cooperative: the flags are checked at every phase
//! boundary and, through the shared [`RunControl`], at every batch boundary.

use crate::error::{RepairError, Result};
use crate::models::{
    CitationSet, Phase, PhaseResult, SessionIssue, SessionKind, SessionStatus, ValidationSession,
};
use crate::services::{
    BatchOptions, BatchProcessor, CreditPolicy, Gate, QualityScorer, RunControl,
    TransactionalReplacer,
};
use crate::types::{
    AccessibilityChecker, AttributionVerifier, ContentAnalyzer, DuplicateDetector, ReportOptions,
    Reporter, SourceMatcher,
};
use chrono::Utc;
use cite_common::config::{OrchestratorSettings, TomlConfig};
use cite_common::{EventBus, KeyValueStore, RepairEvent};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{error, info, warn};

mod context;
mod phase_replacement;
mod phase_reporting;
mod phase_validation;
mod progress;
mod recovery;

use context::PipelineContext;
pub use progress::{ProgressCallback, ProgressUpdate};
pub(crate) use progress::ProgressTracker;

/// External collaborators; any of them may be absent
#[derive(Clone, Default)]
pub struct Collaborators {
    pub accessibility: Option<Arc<dyn AccessibilityChecker>>,
    pub content: Option<Arc<dyn ContentAnalyzer>>,
    pub duplicates: Option<Arc<dyn DuplicateDetector>>,
    pub attribution: Option<Arc<dyn AttributionVerifier>>,
    pub matcher: Option<Arc<dyn SourceMatcher>>,
    pub reporter: Option<Arc<dyn Reporter>>,
}

impl Collaborators {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_accessibility(mut self, checker: Arc<dyn AccessibilityChecker>) -> Self {
        self.accessibility = Some(checker);
        self
    }

    pub fn with_content(mut self, analyzer: Arc<dyn ContentAnalyzer>) -> Self {
        self.content = Some(analyzer);
        self
    }

    pub fn with_duplicates(mut self, detector: Arc<dyn DuplicateDetector>) -> Self {
        self.duplicates = Some(detector);
        self
    }

    pub fn with_attribution(mut self, verifier: Arc<dyn AttributionVerifier>) -> Self {
        self.attribution = Some(verifier);
        self
    }

    pub fn with_matcher(mut self, matcher: Arc<dyn SourceMatcher>) -> Self {
        self.matcher = Some(matcher);
        self
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }
}

/// Per-run options
#[derive(Clone, Default)]
pub struct RunOptions {
    /// Restrict a partial run to these entries
    pub entry_names: Option<Vec<String>>,
    /// Restrict a partial run to these phases (pipeline order is kept)
    pub phases: Option<Vec<Phase>>,
    pub progress: Option<ProgressCallback>,
    /// Plan replacements without applying them
    pub dry_run: bool,
    pub report: ReportOptions,
}

impl RunOptions {
    pub fn entries<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.entry_names = Some(names.into_iter().map(Into::into).collect());
        self
    }

    pub fn phases(mut self, phases: &[Phase]) -> Self {
        self.phases = Some(phases.to_vec());
        self
    }

    pub fn with_progress(mut self, progress: ProgressCallback) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn dry_run(mut self) -> Self {
        self.dry_run = true;
        self
    }
}

/// Clears the running flag when a run ends, however it ends
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Phase orchestrator service
pub struct PhaseOrchestrator {
    settings: OrchestratorSettings,
    collaborators: Collaborators,
    batch: BatchProcessor,
    replacer: TransactionalReplacer,
    scorer: QualityScorer,
    control: Arc<RunControl>,
    event_bus: Option<EventBus>,
    running: AtomicBool,
    active: Mutex<Option<ValidationSession>>,
    /// Most recent first
    history: Mutex<VecDeque<ValidationSession>>,
}

impl PhaseOrchestrator {
    /// Create an orchestrator from the TOML configuration
    ///
    /// # Arguments
    /// * `config` - Orchestrator, batch and replacer sections are used
    /// * `collaborators` - External validation units
    /// * `store` - Checkpoint store for batch phases
    pub fn new(
        config: &TomlConfig,
        collaborators: Collaborators,
        store: Arc<dyn KeyValueStore>,
    ) -> Self {
        let control = Arc::new(RunControl::new(Duration::from_millis(
            config.orchestrator.pause_poll_interval_ms.max(1),
        )));

        Self {
            settings: config.orchestrator.clone(),
            collaborators,
            batch: BatchProcessor::with_control(config.batch.clone(), store, Arc::clone(&control)),
            replacer: TransactionalReplacer::new(config.replacer.clone()),
            scorer: QualityScorer::default(),
            control,
            event_bus: None,
            running: AtomicBool::new(false),
            active: Mutex::new(None),
            history: Mutex::new(VecDeque::new()),
        }
    }

    pub fn with_event_bus(mut self, event_bus: EventBus) -> Self {
        self.batch = self.batch.with_event_bus(event_bus.clone());
        self.replacer = self.replacer.with_event_bus(event_bus.clone());
        self.event_bus = Some(event_bus);
        self
    }

    /// Replace the credit policy used for quality deltas and health figures
    pub fn with_credit_policy(mut self, policy: Arc<dyn CreditPolicy>) -> Self {
        self.scorer = QualityScorer::new(policy);
        self.replacer = self.replacer.with_scorer(self.scorer.clone());
        self
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    pub fn replacer(&self) -> &TransactionalReplacer {
        &self.replacer
    }

    pub fn batch_processor(&self) -> &BatchProcessor {
        &self.batch
    }

    pub fn pause(&self) {
        info!("Orchestrator pause requested");
        self.control.pause();
    }

    pub fn resume(&self) {
        info!("Orchestrator resume requested");
        self.control.resume();
    }

    pub fn stop(&self) {
        info!("Orchestrator stop requested");
        self.control.stop();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        self.control.is_paused()
    }

    /// Snapshot of the active session, as of its last finished phase
    pub fn current_session(&self) -> Option<ValidationSession> {
        lock(&self.active).clone()
    }

    /// Finished sessions, most recent first
    pub fn history(&self) -> Vec<ValidationSession> {
        lock(&self.history).iter().cloned().collect()
    }

    /// Run every phase against the whole set
    pub async fn run_complete(
        &self,
        citations: &mut CitationSet,
        options: RunOptions,
    ) -> Result<ValidationSession> {
        self.execute(SessionKind::Complete, citations, Phase::PIPELINE.to_vec(), None, &options)
            .await
    }

    /// Run a subset of phases and/or entries through the same loop
    pub async fn run_partial(
        &self,
        citations: &mut CitationSet,
        options: RunOptions,
    ) -> Result<ValidationSession> {
        let phases = match &options.phases {
            Some(requested) => Phase::normalize(requested),
            None => Phase::PIPELINE.to_vec(),
        };
        let entry_names = options.entry_names.clone();
        self.execute(SessionKind::Partial, citations, phases, entry_names, &options)
            .await
    }

    fn claim(&self) -> Result<RunningGuard<'_>> {
        self.running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| RepairError::AlreadyRunning)?;
        Ok(RunningGuard(&self.running))
    }

    async fn execute(
        &self,
        kind: SessionKind,
        citations: &mut CitationSet,
        phases: Vec<Phase>,
        entry_names: Option<Vec<String>>,
        options: &RunOptions,
    ) -> Result<ValidationSession> {
        let _running = self.claim()?;
        self.control.reset();

        let mut session = ValidationSession::new(kind);
        let entry_count = entry_names.as_ref().map_or(citations.len(), Vec::len);

        info!(
            session_id = %session.id,
            kind = ?kind,
            entries = entry_count,
            phases = phases.len(),
            "Starting validation session"
        );
        self.emit(RepairEvent::SessionStarted {
            session_id: session.id,
            kind: format!("{:?}", kind).to_lowercase(),
            entry_count,
            timestamp: Utc::now(),
        });
        *lock(&self.active) = Some(session.clone());

        let tracker = Arc::new(
            ProgressTracker::new(phases.len(), options.progress.clone())
                .with_events(self.event_bus.clone(), session.id),
        );

        let outcome = match &entry_names {
            Some(names) => {
                let (mut subset, missing) = citations.restrict(names);
                for name in missing {
                    warn!(session_id = %session.id, entry = %name, "Requested entry not in citation set");
                    session
                        .warnings
                        .push(SessionIssue::new(None, None, format!("Unknown entry: {}", name)));
                }
                let outcome = self
                    .run_pipeline(&mut session, &mut subset, &phases, options, &tracker)
                    .await;
                citations.merge_from(subset);
                outcome
            }
            None => {
                self.run_pipeline(&mut session, citations, &phases, options, &tracker)
                    .await
            }
        };

        let status = match &outcome {
            Ok(status) => *status,
            Err(_) => SessionStatus::Failed,
        };
        session.finalize(status);
        tracker.message(format!("Session {}", status.as_str()));

        info!(
            session_id = %session.id,
            status = status.as_str(),
            phases = session.phases.len(),
            errors = session.errors.len(),
            warnings = session.warnings.len(),
            manual_review = session.manual_review.len(),
            "Validation session finished"
        );
        self.emit(RepairEvent::SessionFinished {
            session_id: session.id,
            status: status.as_str().to_string(),
            error_count: session.errors.len(),
            warning_count: session.warnings.len(),
            timestamp: Utc::now(),
        });
        self.archive(session.clone());

        outcome.map(|_| session)
    }

    async fn run_pipeline(
        &self,
        session: &mut ValidationSession,
        citations: &mut CitationSet,
        phases: &[Phase],
        options: &RunOptions,
        tracker: &Arc<ProgressTracker>,
    ) -> Result<SessionStatus> {
        let mut ctx = PipelineContext::new(session.id, options);

        for (index, &phase) in phases.iter().enumerate() {
            if self.control.gate().await == Gate::Stop {
                warn!(session_id = %session.id, next_phase = %phase, "Session stopped");
                session.warnings.push(SessionIssue::new(
                    Some(phase),
                    None,
                    "Stopped before this phase ran",
                ));
                return Ok(SessionStatus::Stopped);
            }

            tracker.enter_phase(phase, index);
            info!(session_id = %session.id, phase = %phase, index, "Phase started");
            self.emit(RepairEvent::PhaseStarted {
                session_id: session.id,
                phase: phase.as_str().to_string(),
                phase_index: index,
                timestamp: Utc::now(),
            });

            let outcome = self
                .run_phase_with_recovery(phase, session, &mut ctx, citations, tracker)
                .await;

            session.manual_review.append(&mut ctx.manual_review);
            ctx.summary.manual_review = session.manual_review.len();
            session.summary = ctx.summary.clone();

            let result = match outcome {
                Ok(result) => result,
                Err(e) => {
                    let class = crate::error::ErrorClass::classify(&e);
                    error!(
                        session_id = %session.id,
                        phase = %phase,
                        class = %class,
                        error = %e,
                        "Phase failed, aborting session"
                    );
                    let mut result = PhaseResult::failed(e.to_string());
                    result.error_class = Some(class);
                    self.record(session, phase, result, tracker);
                    return Err(e);
                }
            };

            self.record(session, phase, result, tracker);
        }

        Ok(SessionStatus::Completed)
    }

    fn record(
        &self,
        session: &mut ValidationSession,
        phase: Phase,
        result: PhaseResult,
        tracker: &ProgressTracker,
    ) {
        let status = result.status;
        info!(
            session_id = %session.id,
            phase = %phase,
            status = status.as_str(),
            attempts = result.attempts,
            duration_ms = result.duration_ms,
            "Phase finished"
        );
        session.record_phase(phase, result);

        self.emit(RepairEvent::PhaseFinished {
            session_id: session.id,
            phase: phase.as_str().to_string(),
            status: status.as_str().to_string(),
            timestamp: Utc::now(),
        });
        tracker.finish_phase(phase, status.as_str(), session.errors.len(), session.warnings.len());
        *lock(&self.active) = Some(session.clone());
    }

    fn archive(&self, session: ValidationSession) {
        *lock(&self.active) = None;
        let mut history = lock(&self.history);
        history.push_front(session);
        history.truncate(self.settings.history_limit.max(1));
    }

    fn emit(&self, event: RepairEvent) {
        if let Some(bus) = &self.event_bus {
            bus.emit_lossy(event);
        }
    }
}

/// Batch options for a phase, forwarding item progress to the tracker
fn batch_options(job: &str, tracker: &Arc<ProgressTracker>) -> BatchOptions {
    let tracker = Arc::clone(tracker);
    BatchOptions::new(job).with_progress(Arc::new(move |processed, total| {
        tracker.item_progress(processed, total)
    }))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
