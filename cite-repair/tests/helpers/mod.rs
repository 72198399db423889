//! Test Helper Utilities
//!
//! Mock collaborators and fixtures shared by the integration tests

#![allow(dead_code)]

use cite_common::config::TomlConfig;
use cite_common::{KeyValueStore, MemoryStore};
use cite_repair::error::CollaboratorError;
use cite_repair::models::{CitationRecord, CitationSet, ReferenceEntry, ReplacementCandidate, Tristate};
use cite_repair::types::{
    AccessibilityChecker, AccessibilityReport, AccessibilitySummary, AttributionCheck,
    AttributionVerifier, CheckProgress, ContentAnalysis, ContentAnalyzer, DuplicateDetector,
    DuplicateGroup, DuplicateReport, ExtractedMetadata, MatchContext, ReferenceCheck, ReportInput,
    ReportOptions, Reporter, SourceMatcher,
};
use cite_repair::{Collaborators, PhaseOrchestrator};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Fixtures
// ============================================================================

/// Three entries; `dorian[1]` and `phrygian[0]` point at dead hosts
pub fn citation_set() -> CitationSet {
    let mut set = CitationSet::new();
    set.insert(
        "dorian",
        CitationRecord::new(
            "Minor scale with a raised sixth",
            vec![
                ReferenceEntry::new("https://live.test/dorian", "Dorian mode", "encyclopedia"),
                ReferenceEntry::new("https://dead.test/dorian-old", "Dorian (old)", "article"),
            ],
        ),
    );
    set.insert(
        "lydian",
        CitationRecord::new(
            "Major scale with a raised fourth",
            vec![ReferenceEntry::new("https://live.test/lydian", "Lydian mode", "encyclopedia")],
        ),
    );
    set.insert(
        "phrygian",
        CitationRecord::new(
            "Minor scale with a lowered second",
            vec![ReferenceEntry::new("https://dead.test/phrygian", "Phrygian mode", "article")],
        ),
    );
    set
}

/// Defaults with short delays so paused-clock tests stay small
pub fn test_config() -> TomlConfig {
    let mut config = TomlConfig::default();
    config.batch.batch_size = 2;
    config.batch.rate_limit_delay_ms = 10;
    config.orchestrator.retry_base_delay_ms = 100;
    config.orchestrator.pause_poll_interval_ms = 5;
    config
}

pub fn memory_store() -> Arc<dyn KeyValueStore> {
    Arc::new(MemoryStore::new())
}

pub fn full_collaborators() -> Collaborators {
    Collaborators::new()
        .with_accessibility(Arc::new(MockChecker::new()))
        .with_content(Arc::new(KeywordAnalyzer))
        .with_duplicates(Arc::new(UrlDuplicateDetector))
        .with_attribution(Arc::new(TitleVerifier))
        .with_matcher(Arc::new(ArchiveMatcher))
        .with_reporter(Arc::new(JsonReporter))
}

pub fn orchestrator(collaborators: Collaborators) -> PhaseOrchestrator {
    PhaseOrchestrator::new(&test_config(), collaborators, memory_store())
}

pub fn candidate(url: &str, title: &str) -> ReplacementCandidate {
    ReplacementCandidate {
        url: url.to_string(),
        title: title.to_string(),
        kind: "archive".to_string(),
        authors: None,
        publisher: Some("Archive".to_string()),
        year: Some("2020".to_string()),
        accessible: Tristate::True,
        content_relevant: Tristate::True,
        relevance_score: Some(0.9),
        confidence: 0.9,
    }
}

// ============================================================================
// Collaborators
// ============================================================================

/// Hosts under `dead.test` are inaccessible; everything else serves its title
pub struct MockChecker {
    delay: Duration,
}

impl MockChecker {
    pub fn new() -> Self {
        Self {
            delay: Duration::ZERO,
        }
    }

    /// Sleeps before answering, to hold a session inside this phase
    pub fn slow(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait::async_trait]
impl AccessibilityChecker for MockChecker {
    async fn check_all(
        &self,
        citations: &CitationSet,
        progress: &CheckProgress,
    ) -> Result<AccessibilityReport, CollaboratorError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let total = citations.reference_count();
        let mut summary = AccessibilitySummary::default();
        let mut results = Vec::new();
        for (i, (locator, reference)) in citations.references().enumerate() {
            let accessible = !reference.url.contains("dead.test");
            summary.checked += 1;
            if accessible {
                summary.accessible += 1;
            } else {
                summary.inaccessible += 1;
            }
            results.push(ReferenceCheck {
                locator,
                url: reference.url.clone(),
                accessible: accessible.into(),
                status_code: Some(if accessible { 200 } else { 404 }),
                content: accessible.then(|| format!("{} relevant text", reference.title)),
                metadata: accessible.then(|| ExtractedMetadata {
                    title: Some(reference.title.clone()),
                    ..ExtractedMetadata::default()
                }),
                error: (!accessible).then(|| "HTTP 404".to_string()),
            });
            progress(i + 1, total);
        }
        Ok(AccessibilityReport { summary, results })
    }
}

/// Relevant when the content mentions "relevant"
pub struct KeywordAnalyzer;

#[async_trait::async_trait]
impl ContentAnalyzer for KeywordAnalyzer {
    async fn analyze(
        &self,
        content: &str,
        _entry_name: &str,
        _keywords: &[String],
    ) -> Result<ContentAnalysis, CollaboratorError> {
        let relevant = content.contains("relevant");
        Ok(ContentAnalysis {
            relevant,
            score: if relevant { 0.9 } else { 0.1 },
            issues: Vec::new(),
        })
    }
}

/// Fails its first `failures` calls, then behaves like [`KeywordAnalyzer`]
pub struct FailingAnalyzer {
    error: CollaboratorError,
    remaining: AtomicUsize,
    pub calls: AtomicUsize,
}

impl FailingAnalyzer {
    pub fn always(error: CollaboratorError) -> Self {
        Self::times(error, usize::MAX)
    }

    pub fn times(error: CollaboratorError, failures: usize) -> Self {
        Self {
            error,
            remaining: AtomicUsize::new(failures),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait::async_trait]
impl ContentAnalyzer for FailingAnalyzer {
    async fn analyze(
        &self,
        content: &str,
        entry_name: &str,
        keywords: &[String],
    ) -> Result<ContentAnalysis, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(self.error.clone());
        }
        KeywordAnalyzer.analyze(content, entry_name, keywords).await
    }
}

/// Groups references with identical URLs
pub struct UrlDuplicateDetector;

#[async_trait::async_trait]
impl DuplicateDetector for UrlDuplicateDetector {
    async fn detect_duplicates(
        &self,
        citations: &CitationSet,
    ) -> Result<DuplicateReport, CollaboratorError> {
        let mut by_url: BTreeMap<String, Vec<_>> = BTreeMap::new();
        for (locator, reference) in citations.references() {
            by_url.entry(reference.url.clone()).or_default().push(locator);
        }
        Ok(DuplicateReport {
            groups: by_url
                .into_iter()
                .filter(|(_, members)| members.len() > 1)
                .map(|(key, members)| DuplicateGroup { key, members })
                .collect(),
        })
    }
}

/// Accurate when the page title matches the reference title
pub struct TitleVerifier;

#[async_trait::async_trait]
impl AttributionVerifier for TitleVerifier {
    async fn verify(
        &self,
        reference: &ReferenceEntry,
        metadata: &ExtractedMetadata,
    ) -> Result<AttributionCheck, CollaboratorError> {
        let accurate = metadata.title.as_deref() == Some(reference.title.as_str());
        Ok(AttributionCheck {
            accurate,
            confidence: if accurate { 0.95 } else { 0.4 },
            issues: if accurate {
                Vec::new()
            } else {
                vec!["title mismatch".to_string()]
            },
        })
    }
}

/// Offers an archive copy of every problematic reference
pub struct ArchiveMatcher;

#[async_trait::async_trait]
impl SourceMatcher for ArchiveMatcher {
    async fn find_replacements(
        &self,
        reference: &ReferenceEntry,
        context: &MatchContext,
    ) -> Result<Vec<ReplacementCandidate>, CollaboratorError> {
        let slug = reference.url.rsplit('/').next().unwrap_or_default();
        let mut weak = candidate("https://bit.ly/short", &reference.title);
        weak.confidence = 0.99;
        Ok(vec![
            // Highest confidence but on a blocked domain
            weak,
            candidate(
                &format!("https://archive.test/{}/{}", context.entry_name, slug),
                &format!("Archived: {}", reference.title),
            ),
        ])
    }
}

/// Summarizes the session as JSON
pub struct JsonReporter;

#[async_trait::async_trait]
impl Reporter for JsonReporter {
    async fn generate(
        &self,
        input: &ReportInput<'_>,
        options: &ReportOptions,
    ) -> Result<Value, CollaboratorError> {
        Ok(json!({
            "format": options.format,
            "sessionId": input.session.id,
            "phasesSoFar": input.session.phases.len(),
            "entries": input.citations.len(),
        }))
    }
}
