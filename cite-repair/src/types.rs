//! Collaborator contracts
//!
//! Fetching, scoring, duplicate heuristics, source discovery and report
//! formatting live outside this crate. The orchestrator consumes them only
//! through the traits below.

use crate::error::CollaboratorError;
use crate::models::{
    CitationSet, ReferenceEntry, ReferenceLocator, ReplacementCandidate, Tristate,
    ValidationSession,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Item progress callback: (processed, total)
pub type CheckProgress = dyn Fn(usize, usize) + Send + Sync;

// ============================================================================
// Accessibility
// ============================================================================

/// Metadata extracted from a fetched page
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractedMetadata {
    pub title: Option<String>,
    pub authors: Option<String>,
    pub publisher: Option<String>,
    pub year: Option<String>,
    pub description: Option<String>,
}

/// Result of checking one reference
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferenceCheck {
    pub locator: ReferenceLocator,
    pub url: String,
    pub accessible: Tristate,
    pub status_code: Option<u16>,
    /// Page text, when it was fetched
    pub content: Option<String>,
    pub metadata: Option<ExtractedMetadata>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessibilitySummary {
    pub checked: usize,
    pub accessible: usize,
    pub inaccessible: usize,
    pub unknown: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessibilityReport {
    pub summary: AccessibilitySummary,
    pub results: Vec<ReferenceCheck>,
}

#[async_trait::async_trait]
pub trait AccessibilityChecker: Send + Sync {
    /// Check every reference in the set, reporting item progress as it goes
    async fn check_all(
        &self,
        citations: &CitationSet,
        progress: &CheckProgress,
    ) -> Result<AccessibilityReport, CollaboratorError>;
}

// ============================================================================
// Content analysis
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentAnalysis {
    pub relevant: bool,
    /// Relevance score (0.0-1.0)
    pub score: f64,
    pub issues: Vec<String>,
}

#[async_trait::async_trait]
pub trait ContentAnalyzer: Send + Sync {
    async fn analyze(
        &self,
        content: &str,
        entry_name: &str,
        keywords: &[String],
    ) -> Result<ContentAnalysis, CollaboratorError>;
}

// ============================================================================
// Duplicates
// ============================================================================

/// References considered to point at the same source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DuplicateGroup {
    /// Normalized URL or fingerprint shared by the group
    pub key: String,
    /// First member is the one to keep
    pub members: Vec<ReferenceLocator>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DuplicateReport {
    pub groups: Vec<DuplicateGroup>,
}

#[async_trait::async_trait]
pub trait DuplicateDetector: Send + Sync {
    async fn detect_duplicates(
        &self,
        citations: &CitationSet,
    ) -> Result<DuplicateReport, CollaboratorError>;
}

// ============================================================================
// Attribution
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttributionCheck {
    pub accurate: bool,
    pub confidence: f64,
    pub issues: Vec<String>,
}

#[async_trait::async_trait]
pub trait AttributionVerifier: Send + Sync {
    /// Compare a reference's stated attribution with what the page says
    async fn verify(
        &self,
        reference: &ReferenceEntry,
        metadata: &ExtractedMetadata,
    ) -> Result<AttributionCheck, CollaboratorError>;
}

// ============================================================================
// Source matching
// ============================================================================

/// What the matcher knows about the entry a replacement is needed for
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchContext {
    pub entry_name: String,
    pub description: String,
    pub keywords: Vec<String>,
    /// Why the reference needs replacing
    pub reasons: Vec<String>,
}

#[async_trait::async_trait]
pub trait SourceMatcher: Send + Sync {
    /// Candidates in the matcher's own ranking order
    async fn find_replacements(
        &self,
        reference: &ReferenceEntry,
        context: &MatchContext,
    ) -> Result<Vec<ReplacementCandidate>, CollaboratorError>;
}

// ============================================================================
// Reporting
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportOptions {
    /// Output format understood by the reporter ("json", "markdown", ...)
    pub format: String,
    pub include_details: bool,
}

impl Default for ReportOptions {
    fn default() -> Self {
        Self {
            format: "json".to_string(),
            include_details: true,
        }
    }
}

/// Everything a reporter may draw on
pub struct ReportInput<'a> {
    pub session: &'a ValidationSession,
    pub citations: &'a CitationSet,
}

#[async_trait::async_trait]
pub trait Reporter: Send + Sync {
    async fn generate(
        &self,
        input: &ReportInput<'_>,
        options: &ReportOptions,
    ) -> Result<Value, CollaboratorError>;
}
