//! Citation data model
//!
//! A [`CitationSet`] maps entry names to their [`CitationRecord`]. Each
//! record carries an ordered list of [`ReferenceEntry`] values whose
//! validation outcomes are three-valued ([`Tristate`]): a reference that was
//! never checked, or whose check was inconclusive, stays `Unknown` rather
//! than being folded into true or false.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Three-valued validation outcome, serialized as `true` / `false` / `null`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "Option<bool>", into = "Option<bool>")]
pub enum Tristate {
    True,
    False,
    #[default]
    Unknown,
}

impl Tristate {
    pub fn is_true(self) -> bool {
        self == Tristate::True
    }

    pub fn is_false(self) -> bool {
        self == Tristate::False
    }

    pub fn is_unknown(self) -> bool {
        self == Tristate::Unknown
    }
}

impl From<bool> for Tristate {
    fn from(value: bool) -> Self {
        if value {
            Tristate::True
        } else {
            Tristate::False
        }
    }
}

impl From<Option<bool>> for Tristate {
    fn from(value: Option<bool>) -> Self {
        match value {
            Some(v) => v.into(),
            None => Tristate::Unknown,
        }
    }
}

impl From<Tristate> for Option<bool> {
    fn from(value: Tristate) -> Self {
        match value {
            Tristate::True => Some(true),
            Tristate::False => Some(false),
            Tristate::Unknown => None,
        }
    }
}

/// One URL-backed claim of support for an entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferenceEntry {
    pub url: String,
    pub title: String,
    /// Source type ("article", "book", "encyclopedia", ...)
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authors: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publisher: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year: Option<String>,
    #[serde(default)]
    pub accessible: Tristate,
    #[serde(default)]
    pub content_relevant: Tristate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relevance_score: Option<f64>,

    /// Replacement provenance, present only on references produced by a replacement
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replaced_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_title: Option<String>,
}

impl ReferenceEntry {
    /// Minimal reference with unknown validation state
    pub fn new(url: impl Into<String>, title: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            title: title.into(),
            kind: kind.into(),
            authors: None,
            publisher: None,
            year: None,
            accessible: Tristate::Unknown,
            content_relevant: Tristate::Unknown,
            relevance_score: None,
            replaced_at: None,
            original_url: None,
            original_title: None,
        }
    }

    /// True when a validation phase has flagged this reference as unusable
    pub fn is_problematic(&self) -> bool {
        self.accessible.is_false() || self.content_relevant.is_false()
    }

    /// True when this reference was installed by a replacement
    pub fn is_replacement(&self) -> bool {
        self.replaced_at.is_some()
    }
}

/// Citations attached to one named entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CitationRecord {
    pub description: String,
    #[serde(default)]
    pub references: Vec<ReferenceEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cultural_context: Option<String>,
}

impl CitationRecord {
    pub fn new(description: impl Into<String>, references: Vec<ReferenceEntry>) -> Self {
        Self {
            description: description.into(),
            references,
            cultural_context: None,
        }
    }
}

/// Position of one reference inside a [`CitationSet`]
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferenceLocator {
    pub entry_name: String,
    pub reference_index: usize,
}

impl ReferenceLocator {
    pub fn new(entry_name: impl Into<String>, reference_index: usize) -> Self {
        Self {
            entry_name: entry_name.into(),
            reference_index,
        }
    }
}

impl std::fmt::Display for ReferenceLocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[{}]", self.entry_name, self.reference_index)
    }
}

/// Entry name → citation record (keys unique, iteration in name order)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CitationSet {
    entries: BTreeMap<String, CitationRecord>,
}

impl CitationSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, record: CitationRecord) -> Option<CitationRecord> {
        self.entries.insert(name.into(), record)
    }

    pub fn get(&self, name: &str) -> Option<&CitationRecord> {
        self.entries.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut CitationRecord> {
        self.entries.get_mut(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &CitationRecord)> {
        self.entries.iter()
    }

    /// Look up one reference
    pub fn reference(&self, locator: &ReferenceLocator) -> Option<&ReferenceEntry> {
        self.entries
            .get(&locator.entry_name)
            .and_then(|record| record.references.get(locator.reference_index))
    }

    pub fn reference_mut(&mut self, locator: &ReferenceLocator) -> Option<&mut ReferenceEntry> {
        self.entries
            .get_mut(&locator.entry_name)
            .and_then(|record| record.references.get_mut(locator.reference_index))
    }

    /// Every reference with its locator, in entry-name then index order
    pub fn references(&self) -> impl Iterator<Item = (ReferenceLocator, &ReferenceEntry)> {
        self.entries.iter().flat_map(|(name, record)| {
            record
                .references
                .iter()
                .enumerate()
                .map(move |(index, reference)| (ReferenceLocator::new(name.clone(), index), reference))
        })
    }

    /// Total number of references across all entries
    pub fn reference_count(&self) -> usize {
        self.entries.values().map(|r| r.references.len()).sum()
    }

    /// Subset containing only the named entries; unknown names are returned separately
    pub fn restrict(&self, names: &[String]) -> (CitationSet, Vec<String>) {
        let mut subset = CitationSet::new();
        let mut missing = Vec::new();
        for name in names {
            match self.entries.get(name) {
                Some(record) => {
                    subset.entries.insert(name.clone(), record.clone());
                }
                None => missing.push(name.clone()),
            }
        }
        (subset, missing)
    }

    /// Overwrite entries with those from `other` (used to fold a partial run back in)
    pub fn merge_from(&mut self, other: CitationSet) {
        for (name, record) in other.entries {
            self.entries.insert(name, record);
        }
    }
}

impl FromIterator<(String, CitationRecord)> for CitationSet {
    fn from_iter<T: IntoIterator<Item = (String, CitationRecord)>>(iter: T) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// A ranked alternative source proposed by the source matcher
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplacementCandidate {
    pub url: String,
    pub title: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub authors: Option<String>,
    #[serde(default)]
    pub publisher: Option<String>,
    #[serde(default)]
    pub year: Option<String>,
    #[serde(default)]
    pub accessible: Tristate,
    #[serde(default)]
    pub content_relevant: Tristate,
    #[serde(default)]
    pub relevance_score: Option<f64>,
    /// Matcher confidence (0.0-1.0), used only for ranking
    #[serde(default)]
    pub confidence: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_set() -> CitationSet {
        let mut set = CitationSet::new();
        set.insert(
            "dorian",
            CitationRecord::new(
                "Dorian mode",
                vec![
                    ReferenceEntry::new("https://a.test/dorian", "Dorian", "article"),
                    ReferenceEntry::new("https://b.test/modes", "Modes", "book"),
                ],
            ),
        );
        set.insert(
            "lydian",
            CitationRecord::new(
                "Lydian mode",
                vec![ReferenceEntry::new("https://c.test/lydian", "Lydian", "article")],
            ),
        );
        set
    }

    #[test]
    fn test_tristate_serializes_as_nullable_bool() {
        assert_eq!(serde_json::to_value(Tristate::True).unwrap(), json!(true));
        assert_eq!(serde_json::to_value(Tristate::False).unwrap(), json!(false));
        assert_eq!(serde_json::to_value(Tristate::Unknown).unwrap(), json!(null));

        let parsed: Tristate = serde_json::from_value(json!(null)).unwrap();
        assert!(parsed.is_unknown());
    }

    #[test]
    fn test_reference_deserializes_with_missing_optional_fields() {
        let reference: ReferenceEntry = serde_json::from_value(json!({
            "url": "https://a.test",
            "title": "A",
            "type": "article"
        }))
        .unwrap();

        assert_eq!(reference.kind, "article");
        assert!(reference.accessible.is_unknown());
        assert!(reference.authors.is_none());
        assert!(!reference.is_replacement());
    }

    #[test]
    fn test_absent_descriptive_fields_are_not_written_back() {
        let source = json!({
            "url": "https://a.test",
            "title": "A",
            "type": "article",
            "accessible": null,
            "contentRelevant": null
        });
        let reference: ReferenceEntry = serde_json::from_value(source.clone()).unwrap();

        assert_eq!(serde_json::to_value(&reference).unwrap(), source);
    }

    #[test]
    fn test_references_iterates_in_entry_then_index_order() {
        let set = sample_set();
        let locators: Vec<String> = set.references().map(|(l, _)| l.to_string()).collect();
        assert_eq!(locators, vec!["dorian[0]", "dorian[1]", "lydian[0]"]);
        assert_eq!(set.reference_count(), 3);
    }

    #[test]
    fn test_restrict_reports_missing_names() {
        let set = sample_set();
        let (subset, missing) = set.restrict(&["lydian".to_string(), "phrygian".to_string()]);
        assert_eq!(subset.len(), 1);
        assert!(subset.contains("lydian"));
        assert_eq!(missing, vec!["phrygian".to_string()]);
    }

    #[test]
    fn test_merge_from_overwrites_matching_entries_only() {
        let mut set = sample_set();
        let (mut subset, _) = set.restrict(&["lydian".to_string()]);
        subset.get_mut("lydian").unwrap().description = "changed".to_string();

        set.merge_from(subset);
        assert_eq!(set.get("lydian").unwrap().description, "changed");
        assert_eq!(set.get("dorian").unwrap().description, "Dorian mode");
    }
}
