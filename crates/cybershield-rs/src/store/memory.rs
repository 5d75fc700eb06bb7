use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{transition_error, JobStore, StoreError, UsageStore};
use crate::models::{JobOutcome, MonthKey, ScanJob, ScanState, UsageCounter};

#[derive(Debug, Default)]
struct Jobs {
    by_id: HashMap<Uuid, ScanJob>,
    insertion_order: Vec<Uuid>,
}

/// Process-local job store. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    inner: RwLock<Jobs>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, job: &ScanJob) -> Result<(), StoreError> {
        let mut jobs = self.inner.write().await;
        jobs.insertion_order.push(job.id);
        jobs.by_id.insert(job.id, job.clone());
        Ok(())
    }

    async fn find(&self, id: Uuid) -> Result<Option<ScanJob>, StoreError> {
        Ok(self.inner.read().await.by_id.get(&id).cloned())
    }

    async fn find_owned(&self, id: Uuid, owner_id: &str) -> Result<Option<ScanJob>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .by_id
            .get(&id)
            .filter(|job| job.owner_id == owner_id)
            .cloned())
    }

    async fn list_by_owner(
        &self,
        owner_id: &str,
        offset: u64,
        limit: u64,
    ) -> Result<(Vec<ScanJob>, u64), StoreError> {
        let jobs = self.inner.read().await;
        // Newest insert first, then a stable sort keeps that order for equal timestamps.
        let mut owned: Vec<&ScanJob> = jobs
            .insertion_order
            .iter()
            .rev()
            .filter_map(|id| jobs.by_id.get(id))
            .filter(|job| job.owner_id == owner_id)
            .collect();
        owned.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let total = owned.len() as u64;
        let page = owned
            .into_iter()
            .skip(usize::try_from(offset).unwrap_or(usize::MAX))
            .take(usize::try_from(limit).unwrap_or(usize::MAX))
            .cloned()
            .collect();
        Ok((page, total))
    }

    async fn mark_running(&self, id: Uuid) -> Result<(), StoreError> {
        let mut jobs = self.inner.write().await;
        let job = jobs.by_id.get_mut(&id);
        match job {
            Some(job) if job.state.can_transition_to(ScanState::Running) => {
                job.state = ScanState::Running;
                Ok(())
            }
            other => Err(transition_error(
                id,
                other.map(|j| j.state),
                ScanState::Running,
            )),
        }
    }

    async fn finish(
        &self,
        id: Uuid,
        outcome: &JobOutcome,
        completed_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let next = outcome.state();
        let mut jobs = self.inner.write().await;
        let current = jobs.by_id.get(&id).map(|j| j.state);
        let job = match jobs.by_id.get_mut(&id) {
            Some(job) if job.state.can_transition_to(next) => job,
            _ => return Err(transition_error(id, current, next)),
        };

        job.state = next;
        job.completed_at = Some(completed_at);
        match outcome {
            JobOutcome::Completed {
                result,
                duration_seconds,
            } => {
                job.result = Some(result.clone());
                job.duration_seconds = Some(*duration_seconds);
            }
            JobOutcome::Failed(category) => {
                job.error_message = Some(category.message().to_string());
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Counters {
    by_key: HashMap<(String, MonthKey), Uuid>,
    by_id: HashMap<Uuid, UsageCounter>,
}

#[derive(Debug, Default)]
pub struct MemoryUsageStore {
    inner: RwLock<Counters>,
}

impl MemoryUsageStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl UsageStore for MemoryUsageStore {
    async fn find_or_create(
        &self,
        owner_id: &str,
        month: MonthKey,
    ) -> Result<UsageCounter, StoreError> {
        let mut counters = self.inner.write().await;
        let key = (owner_id.to_string(), month);
        if let Some(existing) = counters.by_key.get(&key).and_then(|id| counters.by_id.get(id)) {
            return Ok(existing.clone());
        }

        let counter = UsageCounter {
            id: Uuid::new_v4(),
            owner_id: owner_id.to_string(),
            month,
            count: 0,
        };
        counters.by_key.insert(key, counter.id);
        counters.by_id.insert(counter.id, counter.clone());
        Ok(counter)
    }

    async fn find(
        &self,
        owner_id: &str,
        month: MonthKey,
    ) -> Result<Option<UsageCounter>, StoreError> {
        let counters = self.inner.read().await;
        Ok(counters
            .by_key
            .get(&(owner_id.to_string(), month))
            .and_then(|id| counters.by_id.get(id))
            .cloned())
    }

    async fn increment(&self, counter_id: Uuid) -> Result<(), StoreError> {
        let mut counters = self.inner.write().await;
        let counter = counters
            .by_id
            .get_mut(&counter_id)
            .ok_or_else(|| StoreError::NotFound(format!("usage counter {counter_id}")))?;
        counter.count = counter.count.saturating_add(1);
        Ok(())
    }
}
