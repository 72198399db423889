//! Working state shared by the phases of one run

use super::RunOptions;
use crate::models::{CitationSet, ManualReviewItem, Phase, ReferenceLocator, SessionSummary};
use crate::services::{PlannedReplacement, QualityScorer};
use crate::types::{DuplicateGroup, ReferenceCheck, ReportOptions};
use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// Words shorter than this are not used as keywords
const MIN_KEYWORD_LEN: usize = 4;

pub(super) struct PipelineContext {
    pub session_id: Uuid,
    pub dry_run: bool,
    pub report_options: ReportOptions,
    /// Accessibility results, the source of fetched content and metadata
    pub checks: BTreeMap<ReferenceLocator, ReferenceCheck>,
    pub duplicates: Vec<DuplicateGroup>,
    pub attribution_issues: BTreeMap<ReferenceLocator, Vec<String>>,
    pub plan: Vec<PlannedReplacement>,
    pub initial_health: Option<f64>,
    pub summary: SessionSummary,
    /// Drained into the session after every phase
    pub manual_review: Vec<ManualReviewItem>,
}

impl PipelineContext {
    pub(super) fn new(session_id: Uuid, options: &RunOptions) -> Self {
        Self {
            session_id,
            dry_run: options.dry_run,
            report_options: options.report.clone(),
            checks: BTreeMap::new(),
            duplicates: Vec::new(),
            attribution_issues: BTreeMap::new(),
            plan: Vec::new(),
            initial_health: None,
            summary: SessionSummary::default(),
            manual_review: Vec::new(),
        }
    }

    pub(super) fn review(&mut self, phase: Phase, subject: Option<String>, reason: impl Into<String>) {
        self.manual_review.push(ManualReviewItem {
            phase,
            subject,
            reason: reason.into(),
            timestamp: Utc::now(),
        });
    }

    /// Recompute validation counts and health from the live set
    pub(super) fn refresh_counts(&mut self, citations: &CitationSet, scorer: &QualityScorer) {
        let summary = &mut self.summary;
        summary.total_entries = citations.len();
        summary.total_references = citations.reference_count();
        summary.accessible = 0;
        summary.inaccessible = 0;
        summary.accessibility_unknown = 0;
        summary.relevant = 0;
        summary.irrelevant = 0;
        summary.relevance_unknown = 0;

        for (_, reference) in citations.references() {
            if reference.accessible.is_true() {
                summary.accessible += 1;
            } else if reference.accessible.is_false() {
                summary.inaccessible += 1;
            } else {
                summary.accessibility_unknown += 1;
            }

            if reference.content_relevant.is_true() {
                summary.relevant += 1;
            } else if reference.content_relevant.is_false() {
                summary.irrelevant += 1;
            } else {
                summary.relevance_unknown += 1;
            }
        }
        summary.health_percentage = scorer.health_percentage(citations);
    }

    /// Locators to keep out of a duplicate group (every member but the first)
    pub(super) fn duplicate_of(&self, locator: &ReferenceLocator) -> Option<&ReferenceLocator> {
        self.duplicates.iter().find_map(|group| {
            let (keep, rest) = group.members.split_first()?;
            rest.contains(locator).then_some(keep)
        })
    }
}

/// Keywords for an entry: its name plus significant description words
pub(super) fn keywords_for(citations: &CitationSet, entry_name: &str) -> Vec<String> {
    let description = citations
        .get(entry_name)
        .map(|record| record.description.as_str())
        .unwrap_or_default();

    let mut seen = BTreeSet::new();
    let mut keywords = Vec::new();
    for word in entry_name
        .split(|c: char| !c.is_alphanumeric())
        .chain(description.split(|c: char| !c.is_alphanumeric()))
    {
        let word = word.to_lowercase();
        if word.chars().count() >= MIN_KEYWORD_LEN && seen.insert(word.clone()) {
            keywords.push(word);
        }
    }
    keywords
}
