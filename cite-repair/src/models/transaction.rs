//! Replacement transactions

use super::citation::{CitationRecord, ReferenceEntry};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    /// One `replace` call
    Single,
    /// Outer transaction of a `replace_many` call
    Batch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Active,
    Committed,
    RolledBack,
}

impl TransactionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TransactionStatus::Active => "active",
            TransactionStatus::Committed => "committed",
            TransactionStatus::RolledBack => "rolled_back",
        }
    }

    pub fn is_closed(self) -> bool {
        self != TransactionStatus::Active
    }
}

/// Deep copy of a record taken before it was mutated
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Backup {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub entry_name: String,
    pub snapshot: CitationRecord,
}

impl Backup {
    pub fn capture(entry_name: &str, record: &CitationRecord) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            entry_name: entry_name.to_string(),
            snapshot: record.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Applied,
    Failed,
    /// Applied, then undone by a rollback
    Reverted,
}

/// One replacement attempted inside a transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionOperation {
    pub entry_name: String,
    pub reference_index: usize,
    pub original_url: Option<String>,
    pub new_url: String,
    pub status: OperationStatus,
    pub error: Option<String>,
    /// Snapshot of the record before this operation touched it
    pub backup: Option<Backup>,
    /// Reference as it was before the swap; restores the slot when no
    /// record backup was taken
    pub previous: Option<ReferenceEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub id: Uuid,
    pub kind: TransactionKind,
    pub status: TransactionStatus,
    pub operations: Vec<TransactionOperation>,
    /// Record snapshot for single-replacement transactions
    pub backup: Option<Backup>,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    /// Reason recorded on rollback
    pub failure: Option<String>,
}

impl Transaction {
    pub fn open(kind: TransactionKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            status: TransactionStatus::Active,
            operations: Vec::new(),
            backup: None,
            opened_at: Utc::now(),
            closed_at: None,
            failure: None,
        }
    }

    pub fn applied_count(&self) -> usize {
        self.operations
            .iter()
            .filter(|op| op.status == OperationStatus::Applied)
            .count()
    }

    pub fn failed_count(&self) -> usize {
        self.operations
            .iter()
            .filter(|op| op.status == OperationStatus::Failed)
            .count()
    }

    pub(crate) fn close(&mut self, status: TransactionStatus, failure: Option<String>) {
        self.status = status;
        self.failure = failure;
        self.closed_at = Some(Utc::now());
    }
}
