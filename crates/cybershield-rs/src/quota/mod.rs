use std::sync::Arc;

use chrono::NaiveDate;
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    clock::Clock,
    models::{MonthKey, UsageCounter},
    store::{StoreError, UsageStore},
};

pub const DEFAULT_MONTHLY_LIMIT: u32 = 5;

/// Usage meter for one owner and month.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageSnapshot {
    pub month: MonthKey,
    pub used: u32,
    pub limit: u32,
    pub remaining: u32,
    pub resets_on: NaiveDate,
}

impl UsageSnapshot {
    fn new(month: MonthKey, used: u32, limit: u32) -> Self {
        Self {
            month,
            used,
            limit,
            remaining: limit.saturating_sub(used),
            resets_on: month.resets_on(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QuotaError {
    #[error("Monthly scan limit reached ({} scans/month).", .0.limit)]
    Exceeded(UsageSnapshot),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Permission to create one job this month. Consumed by [`QuotaEnforcer::increment`],
/// so a reservation can be counted at most once.
#[derive(Debug)]
pub struct UsageReservation {
    counter_id: Uuid,
    owner_id: String,
    month: MonthKey,
}

impl UsageReservation {
    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }
}

/// Gates job creation on the per-owner monthly counter.
///
/// Checking and counting are separate steps: a request that passes the check
/// but never creates a job consumes nothing. Concurrent requests from one owner
/// that all pass the check before any of them increments can overshoot the
/// limit; the counter itself never loses an increment.
pub struct QuotaEnforcer {
    store: Arc<dyn UsageStore>,
    clock: Arc<dyn Clock>,
    monthly_limit: u32,
}

impl QuotaEnforcer {
    pub fn new(store: Arc<dyn UsageStore>, clock: Arc<dyn Clock>, monthly_limit: u32) -> Self {
        Self {
            store,
            clock,
            monthly_limit,
        }
    }

    pub fn monthly_limit(&self) -> u32 {
        self.monthly_limit
    }

    pub async fn check_and_reserve(&self, owner_id: &str) -> Result<UsageReservation, QuotaError> {
        let month = MonthKey::of(self.clock.now());
        let UsageCounter { id, count, .. } = self.store.find_or_create(owner_id, month).await?;

        if count >= self.monthly_limit {
            info!(owner_id, %month, used = count, limit = self.monthly_limit, "monthly scan quota exhausted");
            return Err(QuotaError::Exceeded(UsageSnapshot::new(
                month,
                count,
                self.monthly_limit,
            )));
        }

        debug!(owner_id, %month, used = count, "quota check passed");
        Ok(UsageReservation {
            counter_id: id,
            owner_id: owner_id.to_string(),
            month,
        })
    }

    /// Adds one to the reserved counter. Call only after the job record is committed.
    pub async fn increment(&self, reservation: UsageReservation) -> Result<(), StoreError> {
        self.store.increment(reservation.counter_id).await?;
        debug!(owner_id = %reservation.owner_id, month = %reservation.month, "scan counted");
        Ok(())
    }

    /// Current month's meter. Reading never creates a counter.
    pub async fn usage(&self, owner_id: &str) -> Result<UsageSnapshot, StoreError> {
        let month = MonthKey::of(self.clock.now());
        let used = self
            .store
            .find(owner_id, month)
            .await?
            .map_or(0, |counter| counter.count);
        Ok(UsageSnapshot::new(month, used, self.monthly_limit))
    }
}
