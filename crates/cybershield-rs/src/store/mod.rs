mod memory;
mod sqlite;

pub use memory::{MemoryJobStore, MemoryUsageStore};
pub use sqlite::{SqliteJobStore, SqliteUsageStore};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{JobOutcome, MonthKey, ScanJob, ScanState, UsageCounter};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("corrupt record: {0}")]
    Corrupt(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("job {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: Uuid,
        from: ScanState,
        to: ScanState,
    },
}

/// Durable scan job documents. Jobs are appended and updated, never deleted.
#[async_trait::async_trait]
pub trait JobStore: Send + Sync {
    async fn insert(&self, job: &ScanJob) -> Result<(), StoreError>;

    async fn find(&self, id: Uuid) -> Result<Option<ScanJob>, StoreError>;

    /// Like [`JobStore::find`] but only matches jobs belonging to `owner_id`.
    async fn find_owned(&self, id: Uuid, owner_id: &str) -> Result<Option<ScanJob>, StoreError>;

    /// Newest first. Returns the page and the owner's total job count.
    async fn list_by_owner(
        &self,
        owner_id: &str,
        offset: u64,
        limit: u64,
    ) -> Result<(Vec<ScanJob>, u64), StoreError>;

    /// `pending -> running`.
    async fn mark_running(&self, id: Uuid) -> Result<(), StoreError>;

    /// Writes the terminal state. Fails with `InvalidTransition` if the job is already terminal.
    async fn finish(
        &self,
        id: Uuid,
        outcome: &JobOutcome,
        completed_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;
}

/// One counter per (owner, month). Increments are atomic at the store level.
#[async_trait::async_trait]
pub trait UsageStore: Send + Sync {
    /// Returns the existing counter or creates one at zero. Concurrent callers
    /// for the same key observe the same counter.
    async fn find_or_create(
        &self,
        owner_id: &str,
        month: MonthKey,
    ) -> Result<UsageCounter, StoreError>;

    async fn find(&self, owner_id: &str, month: MonthKey)
        -> Result<Option<UsageCounter>, StoreError>;

    async fn increment(&self, counter_id: Uuid) -> Result<(), StoreError>;
}

fn transition_error(id: Uuid, current: Option<ScanState>, to: ScanState) -> StoreError {
    match current {
        Some(from) => StoreError::InvalidTransition { id, from, to },
        None => StoreError::NotFound(format!("scan job {id}")),
    }
}
