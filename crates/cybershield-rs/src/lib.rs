pub mod adapters;
pub mod api;
pub mod auth;
pub mod clock;
pub mod config;
pub mod db;
pub mod jobs;
pub mod limiter;
pub mod models;
pub mod parser;
pub mod quota;
pub mod security;
pub mod store;

use std::sync::Arc;

use chrono::Duration;

use crate::{
    adapters::ScannerClient,
    auth::SessionStore,
    clock::Clock,
    config::AppConfig,
    jobs::ScanOrchestrator,
    limiter::{MemoryRateLimitStore, RateLimiter},
    quota::QuotaEnforcer,
    security::TargetPolicy,
};

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<ScanOrchestrator>,
    pub quota: Arc<QuotaEnforcer>,
    /// Scan submissions per owner per hour.
    pub rate_limiter: Arc<RateLimiter>,
    /// Every request, per caller, over `api_window_secs`.
    pub api_limiter: Arc<RateLimiter>,
    pub sessions: SessionStore,
}

/// Wires stores, quota, limiter and orchestrator from `config`.
pub async fn build_state(
    config: &AppConfig,
    scanner: Arc<dyn ScannerClient>,
    clock: Arc<dyn Clock>,
) -> anyhow::Result<AppState> {
    let stores = db::open_stores(&config.database_url).await?;
    let policy = TargetPolicy::from_networks(&config.blocked_networks)?;

    let quota = Arc::new(QuotaEnforcer::new(
        stores.usage,
        clock.clone(),
        config.monthly_scan_limit,
    ));
    let orchestrator = Arc::new(ScanOrchestrator::new(
        stores.jobs,
        quota.clone(),
        scanner,
        clock.clone(),
        policy,
        config.orchestrator_settings(),
    ));
    let rate_limiter = Arc::new(RateLimiter::hourly(config.scans_per_hour, clock.clone()));
    let api_limiter = Arc::new(RateLimiter::new(
        config.api_requests_per_window,
        Duration::seconds(config.api_window_secs as i64),
        clock,
        Arc::new(MemoryRateLimitStore::new()),
    ));

    Ok(AppState {
        orchestrator,
        quota,
        rate_limiter,
        api_limiter,
        sessions: SessionStore::from_tokens(&config.api_tokens),
    })
}
