use std::{
    collections::{HashMap, VecDeque},
    fmt,
    net::IpAddr,
    sync::Arc,
};

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use tracing::debug;

use crate::clock::Clock;

pub const DEFAULT_SCANS_PER_HOUR: u32 = 10;

/// Past this many tracked keys, idle keys are dropped on the next hit.
const SWEEP_THRESHOLD: usize = 10_000;

/// Who a request is counted against.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RateLimitKey {
    Owner(String),
    Address(IpAddr),
    Anonymous,
}

impl RateLimitKey {
    /// Authenticated owner first, then the caller's address.
    pub fn resolve(owner_id: Option<&str>, addr: Option<IpAddr>) -> Self {
        match (owner_id, addr) {
            (Some(owner), _) => RateLimitKey::Owner(owner.to_string()),
            (None, Some(ip)) => RateLimitKey::Address(ip),
            (None, None) => RateLimitKey::Anonymous,
        }
    }
}

impl fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateLimitKey::Owner(id) => write!(f, "owner:{id}"),
            RateLimitKey::Address(ip) => write!(f, "addr:{ip}"),
            RateLimitKey::Anonymous => f.write_str("anonymous"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Max {limit} scans per hour.")]
pub struct RateLimited {
    pub limit: u32,
    pub retry_after_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowState {
    pub admitted: bool,
    pub hits: u32,
    pub oldest: Option<DateTime<Utc>>,
}

/// Hit log backing the limiter.
#[async_trait::async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Forgets hits at or before `window_start`, then records `now` if fewer
    /// than `limit` hits remain for `key`.
    async fn try_record(
        &self,
        key: &str,
        now: DateTime<Utc>,
        window_start: DateTime<Utc>,
        limit: u32,
    ) -> WindowState;
}

#[derive(Debug, Default)]
pub struct MemoryRateLimitStore {
    hits: Mutex<HashMap<String, VecDeque<DateTime<Utc>>>>,
}

impl MemoryRateLimitStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl RateLimitStore for MemoryRateLimitStore {
    async fn try_record(
        &self,
        key: &str,
        now: DateTime<Utc>,
        window_start: DateTime<Utc>,
        limit: u32,
    ) -> WindowState {
        let mut hits = self.hits.lock().await;
        if hits.len() > SWEEP_THRESHOLD {
            hits.retain(|_, log| log.back().is_some_and(|last| *last > window_start));
        }

        let log = hits.entry(key.to_string()).or_default();
        while let Some(front) = log.front() {
            if *front <= window_start {
                log.pop_front();
            } else {
                break;
            }
        }

        let admitted = log.len() < limit as usize;
        if admitted {
            log.push_back(now);
        }
        WindowState {
            admitted,
            hits: log.len() as u32,
            oldest: log.front().copied(),
        }
    }
}

/// Caps scan-creation requests per key over a rolling window. Built once at
/// startup and shared by reference.
pub struct RateLimiter {
    limit: u32,
    window: Duration,
    clock: Arc<dyn Clock>,
    store: Arc<dyn RateLimitStore>,
}

impl RateLimiter {
    pub fn new(
        limit: u32,
        window: Duration,
        clock: Arc<dyn Clock>,
        store: Arc<dyn RateLimitStore>,
    ) -> Self {
        Self {
            limit,
            window,
            clock,
            store,
        }
    }

    pub fn hourly(limit: u32, clock: Arc<dyn Clock>) -> Self {
        Self::new(
            limit,
            Duration::hours(1),
            clock,
            Arc::new(MemoryRateLimitStore::new()),
        )
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Counts one request for `key`. Returns the requests still allowed in the window.
    pub async fn check(&self, key: &RateLimitKey) -> Result<u32, RateLimited> {
        let now = self.clock.now();
        let state = self
            .store
            .try_record(&key.to_string(), now, now - self.window, self.limit)
            .await;

        if state.admitted {
            return Ok(self.limit.saturating_sub(state.hits));
        }

        // Rounded up so a client waiting exactly this long is admitted.
        let retry_after_secs = state
            .oldest
            .map(|oldest| {
                let wait_ms = (oldest + self.window - now).num_milliseconds();
                ((wait_ms + 999) / 1000).max(1) as u64
            })
            .unwrap_or(1);
        debug!(%key, limit = self.limit, retry_after_secs, "scan request rate limited");
        Err(RateLimited {
            limit: self.limit,
            retry_after_secs,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use chrono::TimeZone;

    use super::*;
    use crate::clock::ManualClock;

    fn limiter(limit: u32) -> (RateLimiter, ManualClock) {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 10, 18, 9, 0, 0).unwrap());
        (RateLimiter::hourly(limit, Arc::new(clock.clone())), clock)
    }

    #[tokio::test]
    async fn admits_up_to_the_limit_then_rejects_with_retry_guidance() {
        let (limiter, clock) = limiter(3);
        let key = RateLimitKey::Owner("u1".into());

        assert_eq!(limiter.check(&key).await, Ok(2));
        clock.advance(Duration::minutes(10));
        assert_eq!(limiter.check(&key).await, Ok(1));
        assert_eq!(limiter.check(&key).await, Ok(0));

        let denied = limiter.check(&key).await.unwrap_err();
        assert_eq!(denied.limit, 3);
        // The first hit leaves the window 50 minutes from now.
        assert_eq!(denied.retry_after_secs, 50 * 60);
        assert_eq!(denied.to_string(), "Max 3 scans per hour.");
    }

    #[tokio::test]
    async fn retry_after_rounds_partial_seconds_up() {
        let (limiter, clock) = limiter(1);
        let key = RateLimitKey::Owner("u1".into());
        limiter.check(&key).await.unwrap();

        clock.advance(Duration::minutes(30) + Duration::milliseconds(500));
        let denied = limiter.check(&key).await.unwrap_err();
        assert_eq!(denied.retry_after_secs, 30 * 60);

        clock.advance(Duration::seconds(denied.retry_after_secs as i64));
        assert_eq!(limiter.check(&key).await, Ok(0));
    }

    #[tokio::test]
    async fn window_rolls_forward() {
        let (limiter, clock) = limiter(2);
        let key = RateLimitKey::Owner("u1".into());
        limiter.check(&key).await.unwrap();
        clock.advance(Duration::minutes(30));
        limiter.check(&key).await.unwrap();
        assert!(limiter.check(&key).await.is_err());

        clock.advance(Duration::minutes(31));
        assert_eq!(limiter.check(&key).await, Ok(0));
        assert!(limiter.check(&key).await.is_err());
    }

    #[tokio::test]
    async fn rejected_requests_are_not_recorded() {
        let (limiter, clock) = limiter(1);
        let key = RateLimitKey::Owner("u1".into());
        limiter.check(&key).await.unwrap();
        for _ in 0..5 {
            clock.advance(Duration::minutes(5));
            assert!(limiter.check(&key).await.is_err());
        }
        clock.advance(Duration::minutes(36));
        assert!(limiter.check(&key).await.is_ok());
    }

    #[tokio::test]
    async fn keys_are_counted_independently() {
        let (limiter, _) = limiter(1);
        let ip = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7));
        assert!(limiter.check(&RateLimitKey::Owner("u1".into())).await.is_ok());
        assert!(limiter.check(&RateLimitKey::Owner("u2".into())).await.is_ok());
        assert!(limiter.check(&RateLimitKey::Address(ip)).await.is_ok());
        assert!(limiter.check(&RateLimitKey::Owner("u1".into())).await.is_err());
    }

    #[test]
    fn key_prefers_owner_over_address() {
        let ip = IpAddr::V4(Ipv4Addr::LOCALHOST);
        assert_eq!(
            RateLimitKey::resolve(Some("u1"), Some(ip)),
            RateLimitKey::Owner("u1".into())
        );
        assert_eq!(RateLimitKey::resolve(None, Some(ip)), RateLimitKey::Address(ip));
        assert_eq!(RateLimitKey::resolve(None, None).to_string(), "anonymous");
    }
}
