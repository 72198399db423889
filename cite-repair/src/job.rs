//! Orchestrator runs as scheduled jobs
//!
//! [`OrchestratorJob`] adapts a [`PhaseOrchestrator`] to
//! [`GuardedOperation`] so the scheduler can run validate-and-repair
//! sessions on an interval. The citation set comes from (and goes back to)
//! a [`CitationSource`].

use crate::loader;
use crate::models::{CitationSet, Phase, SessionStatus};
use crate::orchestrator::{PhaseOrchestrator, RunOptions};
use crate::services::GuardedOperation;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;

/// Where a scheduled run reads and writes its citation set
#[async_trait::async_trait]
pub trait CitationSource: Send + Sync {
    async fn load(&self) -> cite_common::Result<CitationSet>;

    async fn save(&self, set: &CitationSet) -> cite_common::Result<()>;

    /// Human-readable location, for logs
    fn describe(&self) -> String;
}

/// Citation set stored in a JSON file
pub struct FileCitationSource {
    path: PathBuf,
}

impl FileCitationSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait::async_trait]
impl CitationSource for FileCitationSource {
    async fn load(&self) -> cite_common::Result<CitationSet> {
        loader::load_citation_set(&self.path).await
    }

    async fn save(&self, set: &CitationSet) -> cite_common::Result<()> {
        loader::save_citation_set(&self.path, set).await
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Per-run input accepted by [`OrchestratorJob`]; `null` means a complete run
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct JobInput {
    pub entries: Option<Vec<String>>,
    pub phases: Option<Vec<Phase>>,
    pub dry_run: Option<bool>,
}

pub struct OrchestratorJob {
    name: String,
    orchestrator: Arc<PhaseOrchestrator>,
    source: Arc<dyn CitationSource>,
    options: RunOptions,
}

impl OrchestratorJob {
    pub fn new(
        name: impl Into<String>,
        orchestrator: Arc<PhaseOrchestrator>,
        source: Arc<dyn CitationSource>,
    ) -> Self {
        Self {
            name: name.into(),
            orchestrator,
            source,
            options: RunOptions::default(),
        }
    }

    /// Base options; per-run input overrides entries, phases and dry-run
    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }
}

#[async_trait::async_trait]
impl GuardedOperation for OrchestratorJob {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, input: &Value) -> anyhow::Result<Value> {
        let input: JobInput = if input.is_null() {
            JobInput::default()
        } else {
            serde_json::from_value(input.clone())?
        };

        let mut options = self.options.clone();
        if let Some(dry_run) = input.dry_run {
            options.dry_run = dry_run;
        }
        let partial = input.entries.is_some() || input.phases.is_some();
        if input.entries.is_some() {
            options.entry_names = input.entries;
        }
        if input.phases.is_some() {
            options.phases = input.phases;
        }

        let mut citations = self.source.load().await?;
        tracing::info!(
            job = %self.name,
            source = %self.source.describe(),
            entries = citations.len(),
            partial,
            "Scheduled validation run"
        );

        let dry_run = options.dry_run;
        let session = if partial {
            self.orchestrator.run_partial(&mut citations, options).await
        } else {
            self.orchestrator.run_complete(&mut citations, options).await
        }?;

        if session.status == SessionStatus::Failed {
            anyhow::bail!("Session {} failed", session.id);
        }
        if !dry_run {
            self.source.save(&citations).await?;
        }

        Ok(json!({
            "sessionId": session.id,
            "status": session.status,
            "phases": session.phases.len(),
            "errors": session.errors.len(),
            "warnings": session.warnings.len(),
            "manualReview": session.manual_review.len(),
            "summary": session.summary,
        }))
    }
}
