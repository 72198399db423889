//! Batch run checkpoints

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Store key for a job's checkpoint
pub fn checkpoint_key(job: &str) -> String {
    format!("checkpoint:{}", job)
}

/// Failure of one item in a batch run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemError {
    /// Position in the original input list
    pub index: usize,
    pub message: String,
}

/// Resumable snapshot of a batch run
///
/// `partial_results` always has `total_items` slots; slot `i` holds the
/// result for input `i` once it has settled successfully.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint<I, O> {
    pub job: String,
    pub total_items: usize,
    pub processed_count: usize,
    pub remaining_items: Vec<I>,
    pub partial_results: Vec<Option<O>>,
    pub partial_errors: Vec<ItemError>,
    pub timestamp: DateTime<Utc>,
}

impl<I, O> Checkpoint<I, O> {
    /// Processed and remaining items account for every input
    pub fn is_consistent(&self) -> bool {
        self.processed_count + self.remaining_items.len() == self.total_items
            && self.partial_results.len() == self.total_items
    }
}
