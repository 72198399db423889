//! Reference quality scoring
//!
//! Scores are advisory: they are reported next to a replacement and folded
//! into the session health figure, never used as a gate. How an `Unknown`
//! validation outcome counts is decided by the injected [`CreditPolicy`].

use crate::models::{CitationSet, ReferenceEntry, Tristate};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

const ACCESSIBILITY_WEIGHT: f64 = 0.4;
const RELEVANCE_WEIGHT: f64 = 0.4;
const METADATA_WEIGHT: f64 = 0.2;

/// How much a three-valued outcome is worth (0.0-1.0)
pub trait CreditPolicy: Send + Sync {
    fn credit(&self, state: Tristate) -> f64;

    fn name(&self) -> &'static str;
}

/// Unknown earns nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct StrictCredit;

impl CreditPolicy for StrictCredit {
    fn credit(&self, state: Tristate) -> f64 {
        match state {
            Tristate::True => 1.0,
            Tristate::False | Tristate::Unknown => 0.0,
        }
    }

    fn name(&self) -> &'static str {
        "strict"
    }
}

/// Unknown earns a fixed fraction
#[derive(Debug, Clone, Copy)]
pub struct PartialCredit(pub f64);

impl CreditPolicy for PartialCredit {
    fn credit(&self, state: Tristate) -> f64 {
        match state {
            Tristate::True => 1.0,
            Tristate::False => 0.0,
            Tristate::Unknown => self.0.clamp(0.0, 1.0),
        }
    }

    fn name(&self) -> &'static str {
        "partial"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityDelta {
    pub before: f64,
    pub after: f64,
    pub improvement: f64,
}

#[derive(Clone)]
pub struct QualityScorer {
    policy: Arc<dyn CreditPolicy>,
}

impl QualityScorer {
    pub fn new(policy: Arc<dyn CreditPolicy>) -> Self {
        Self { policy }
    }

    pub fn policy_name(&self) -> &'static str {
        self.policy.name()
    }

    pub fn credit(&self, state: Tristate) -> f64 {
        self.policy.credit(state)
    }

    /// Weighted score (0.0-1.0) of one reference
    pub fn score(&self, reference: &ReferenceEntry) -> f64 {
        let accessibility = self.policy.credit(reference.accessible);
        let relevance = match reference.relevance_score {
            Some(score) => score.clamp(0.0, 1.0),
            None => self.policy.credit(reference.content_relevant),
        };

        ACCESSIBILITY_WEIGHT * accessibility
            + RELEVANCE_WEIGHT * relevance
            + METADATA_WEIGHT * metadata_completeness(reference)
    }

    pub fn delta(&self, before: &ReferenceEntry, after: &ReferenceEntry) -> QualityDelta {
        let before = self.score(before);
        let after = self.score(after);
        QualityDelta {
            before,
            after,
            improvement: after - before,
        }
    }

    /// Mean reference score as a percentage; 0 for an empty set
    pub fn health_percentage(&self, citations: &CitationSet) -> f64 {
        let (sum, count) = citations
            .references()
            .fold((0.0, 0usize), |(sum, count), (_, reference)| {
                (sum + self.score(reference), count + 1)
            });
        if count == 0 {
            0.0
        } else {
            sum / count as f64 * 100.0
        }
    }
}

impl Default for QualityScorer {
    fn default() -> Self {
        Self::new(Arc::new(StrictCredit))
    }
}

/// Share of the descriptive fields that are filled in
fn metadata_completeness(reference: &ReferenceEntry) -> f64 {
    let filled = [
        !reference.title.trim().is_empty(),
        reference.authors.as_deref().is_some_and(|s| !s.trim().is_empty()),
        reference.publisher.as_deref().is_some_and(|s| !s.trim().is_empty()),
        reference.year.as_deref().is_some_and(|s| !s.trim().is_empty()),
    ]
    .iter()
    .filter(|present| **present)
    .count();
    filled as f64 / 4.0
}
