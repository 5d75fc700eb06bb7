use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use super::{transition_error, JobStore, StoreError, UsageStore};
use crate::models::{JobOutcome, MonthKey, ScanJob, ScanResult, ScanState, UsageCounter};

const JOB_COLUMNS: &str =
    "id, owner_id, target, state, result, error_message, created_at, completed_at, duration_seconds";

#[derive(Debug, sqlx::FromRow)]
struct ScanJobRow {
    id: String,
    owner_id: String,
    target: String,
    state: String,
    result: Option<String>,
    error_message: Option<String>,
    created_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    duration_seconds: Option<i64>,
}

impl TryFrom<ScanJobRow> for ScanJob {
    type Error = StoreError;

    fn try_from(row: ScanJobRow) -> Result<Self, Self::Error> {
        let id = parse_id(&row.id)?;
        let state = row.state.parse::<ScanState>().map_err(StoreError::Corrupt)?;
        let result = row
            .result
            .as_deref()
            .map(serde_json::from_str::<ScanResult>)
            .transpose()
            .map_err(|e| StoreError::Corrupt(format!("scan job {id} result: {e}")))?;

        Ok(ScanJob {
            id,
            owner_id: row.owner_id,
            target: row.target,
            state,
            result,
            error_message: row.error_message,
            created_at: row.created_at,
            completed_at: row.completed_at,
            duration_seconds: row.duration_seconds,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct UsageRow {
    id: String,
    owner_id: String,
    month_key: String,
    scan_count: i64,
}

impl TryFrom<UsageRow> for UsageCounter {
    type Error = StoreError;

    fn try_from(row: UsageRow) -> Result<Self, Self::Error> {
        Ok(UsageCounter {
            id: parse_id(&row.id)?,
            owner_id: row.owner_id,
            month: row.month_key.parse().map_err(StoreError::Corrupt)?,
            count: u32::try_from(row.scan_count)
                .map_err(|_| StoreError::Corrupt(format!("scan_count {}", row.scan_count)))?,
        })
    }
}

fn parse_id(raw: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(raw).map_err(|e| StoreError::Corrupt(format!("id {raw:?}: {e}")))
}

#[derive(Debug, Clone)]
pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl SqliteJobStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn current_state(&self, id: Uuid) -> Result<Option<ScanState>, StoreError> {
        let state: Option<String> = sqlx::query_scalar("SELECT state FROM scan_jobs WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        state
            .map(|s| s.parse::<ScanState>().map_err(StoreError::Corrupt))
            .transpose()
    }
}

#[async_trait::async_trait]
impl JobStore for SqliteJobStore {
    async fn insert(&self, job: &ScanJob) -> Result<(), StoreError> {
        let result = job
            .result
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;

        sqlx::query(
            "INSERT INTO scan_jobs(id, owner_id, target, state, result, error_message, created_at, completed_at, duration_seconds) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(job.id.to_string())
        .bind(&job.owner_id)
        .bind(&job.target)
        .bind(job.state.as_str())
        .bind(result)
        .bind(&job.error_message)
        .bind(job.created_at)
        .bind(job.completed_at)
        .bind(job.duration_seconds)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find(&self, id: Uuid) -> Result<Option<ScanJob>, StoreError> {
        sqlx::query_as::<_, ScanJobRow>(&format!("SELECT {JOB_COLUMNS} FROM scan_jobs WHERE id = ?"))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .map(ScanJob::try_from)
            .transpose()
    }

    async fn find_owned(&self, id: Uuid, owner_id: &str) -> Result<Option<ScanJob>, StoreError> {
        sqlx::query_as::<_, ScanJobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM scan_jobs WHERE id = ? AND owner_id = ?"
        ))
        .bind(id.to_string())
        .bind(owner_id)
        .fetch_optional(&self.pool)
        .await?
        .map(ScanJob::try_from)
        .transpose()
    }

    async fn list_by_owner(
        &self,
        owner_id: &str,
        offset: u64,
        limit: u64,
    ) -> Result<(Vec<ScanJob>, u64), StoreError> {
        let rows = sqlx::query_as::<_, ScanJobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM scan_jobs WHERE owner_id = ? ORDER BY created_at DESC, rowid DESC LIMIT ? OFFSET ?"
        ))
        .bind(owner_id)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .bind(i64::try_from(offset).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM scan_jobs WHERE owner_id = ?")
            .bind(owner_id)
            .fetch_one(&self.pool)
            .await?;

        let jobs = rows
            .into_iter()
            .map(ScanJob::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        Ok((jobs, total.max(0) as u64))
    }

    async fn mark_running(&self, id: Uuid) -> Result<(), StoreError> {
        let updated = sqlx::query("UPDATE scan_jobs SET state = 'running' WHERE id = ? AND state = 'pending'")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        if updated.rows_affected() == 1 {
            return Ok(());
        }
        Err(transition_error(id, self.current_state(id).await?, ScanState::Running))
    }

    async fn finish(
        &self,
        id: Uuid,
        outcome: &JobOutcome,
        completed_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let (result, error_message, duration_seconds) = match outcome {
            JobOutcome::Completed {
                result,
                duration_seconds,
            } => (
                Some(serde_json::to_string(result).map_err(|e| StoreError::Corrupt(e.to_string()))?),
                None,
                Some(*duration_seconds),
            ),
            JobOutcome::Failed(category) => (None, Some(category.message()), None),
        };

        let updated = sqlx::query(
            "UPDATE scan_jobs SET state = ?, result = ?, error_message = ?, completed_at = ?, duration_seconds = ? WHERE id = ? AND state IN ('pending', 'running')",
        )
        .bind(outcome.state().as_str())
        .bind(result)
        .bind(error_message)
        .bind(completed_at)
        .bind(duration_seconds)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 1 {
            return Ok(());
        }
        Err(transition_error(id, self.current_state(id).await?, outcome.state()))
    }
}

#[derive(Debug, Clone)]
pub struct SqliteUsageStore {
    pool: SqlitePool,
}

impl SqliteUsageStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl UsageStore for SqliteUsageStore {
    async fn find_or_create(
        &self,
        owner_id: &str,
        month: MonthKey,
    ) -> Result<UsageCounter, StoreError> {
        let now = Utc::now();
        // The unique (owner_id, month_key) index settles concurrent first inserts.
        sqlx::query(
            "INSERT INTO scan_usage(id, owner_id, month_key, scan_count, created_at, updated_at) VALUES(?, ?, ?, 0, ?, ?) ON CONFLICT(owner_id, month_key) DO NOTHING",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(owner_id)
        .bind(month.to_string())
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.find(owner_id, month)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("usage counter {owner_id}/{month}")))
    }

    async fn find(
        &self,
        owner_id: &str,
        month: MonthKey,
    ) -> Result<Option<UsageCounter>, StoreError> {
        sqlx::query_as::<_, UsageRow>(
            "SELECT id, owner_id, month_key, scan_count FROM scan_usage WHERE owner_id = ? AND month_key = ?",
        )
        .bind(owner_id)
        .bind(month.to_string())
        .fetch_optional(&self.pool)
        .await?
        .map(UsageCounter::try_from)
        .transpose()
    }

    async fn increment(&self, counter_id: Uuid) -> Result<(), StoreError> {
        let updated = sqlx::query(
            "UPDATE scan_usage SET scan_count = scan_count + 1, updated_at = ? WHERE id = ?",
        )
        .bind(Utc::now())
        .bind(counter_id.to_string())
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("usage counter {counter_id}")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{db, store::contract};

    async fn pool() -> SqlitePool {
        let pool = db::create_pool("sqlite::memory:").await.expect("pool");
        db::run_migrations(&pool).await.expect("migrations");
        pool
    }

    #[tokio::test]
    async fn sqlite_jobs_round_trip_and_scope_by_owner() {
        contract::jobs_round_trip_and_scope_by_owner(Arc::new(SqliteJobStore::new(pool().await)))
            .await;
    }

    #[tokio::test]
    async fn sqlite_jobs_list_newest_first_with_total() {
        contract::jobs_list_newest_first_with_total(Arc::new(SqliteJobStore::new(pool().await)))
            .await;
    }

    #[tokio::test]
    async fn sqlite_jobs_accept_exactly_one_terminal_update() {
        contract::jobs_accept_exactly_one_terminal_update(Arc::new(SqliteJobStore::new(
            pool().await,
        )))
        .await;
    }

    #[tokio::test]
    async fn sqlite_failed_jobs_carry_only_the_message() {
        contract::failed_jobs_carry_only_the_message(Arc::new(SqliteJobStore::new(pool().await)))
            .await;
    }

    #[tokio::test]
    async fn sqlite_usage_find_or_create_is_idempotent() {
        contract::usage_find_or_create_is_idempotent(Arc::new(SqliteUsageStore::new(
            pool().await,
        )))
        .await;
    }

    #[tokio::test]
    async fn sqlite_usage_increments_do_not_lose_counts() {
        contract::usage_increments_do_not_lose_counts(Arc::new(SqliteUsageStore::new(
            pool().await,
        )))
        .await;
    }

    #[tokio::test]
    async fn sqlite_rejects_corrupt_state_values() {
        let pool = pool().await;
        let store = SqliteJobStore::new(pool.clone());
        let job = ScanJob::new("u1", "https://example.com", Utc::now());
        store.insert(&job).await.unwrap();
        // Bypass the CHECK constraint by dropping straight into the column.
        sqlx::query("PRAGMA ignore_check_constraints = ON")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("UPDATE scan_jobs SET state = 'bogus' WHERE id = ?")
            .bind(job.id.to_string())
            .execute(&pool)
            .await
            .unwrap();

        assert!(matches!(store.find(job.id).await, Err(StoreError::Corrupt(_))));
    }
}
