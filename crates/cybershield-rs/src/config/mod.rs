use std::{collections::HashMap, env, fs, time::Duration};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::{
    jobs::OrchestratorSettings,
    limiter::DEFAULT_SCANS_PER_HOUR,
    quota::DEFAULT_MONTHLY_LIMIT,
    security::DEFAULT_BLOCKED_NETWORKS,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    /// SQLite URL, or `memory` for process-local stores.
    pub database_url: String,
    pub scanner_url: String,
    pub health_probe_timeout_secs: u64,
    pub scan_timeout_secs: u64,
    pub max_concurrent_scans: usize,
    pub monthly_scan_limit: u32,
    pub scans_per_hour: u32,
    /// General request budget per caller, across all routes.
    pub api_requests_per_window: u32,
    pub api_window_secs: u64,
    pub blocked_networks: Vec<String>,
    /// Bearer token -> owner id.
    pub api_tokens: HashMap<String, String>,
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        let path = env::var("CYBERSHIELD_CONFIG").unwrap_or_else(|_| "config.json".to_string());
        let file_cfg: Option<AppConfig> = fs::read_to_string(&path)
            .ok()
            .map(|raw| serde_json::from_str(&raw))
            .transpose()
            .with_context(|| format!("failed to parse {path}"))?;

        let mut cfg = file_cfg.unwrap_or_default();
        cfg.apply_env(|key| env::var(key).ok());
        Ok(cfg)
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("CS_HOST") {
            self.host = v;
        }
        if let Some(v) = var("CS_PORT") {
            self.port = v.parse().unwrap_or(self.port);
        }
        if let Some(v) = var("CS_DATABASE_URL") {
            self.database_url = v;
        }
        if let Some(v) = var("CS_SCANNER_URL") {
            self.scanner_url = v;
        }
        if let Some(v) = var("CS_MONTHLY_SCAN_LIMIT") {
            self.monthly_scan_limit = v.parse().unwrap_or(self.monthly_scan_limit);
        }
        if let Some(v) = var("CS_SCANS_PER_HOUR") {
            self.scans_per_hour = v.parse().unwrap_or(self.scans_per_hour);
        }
        if let Some(v) = var("CS_API_RATE_LIMIT_MAX") {
            self.api_requests_per_window = v.parse().unwrap_or(self.api_requests_per_window);
        }
        if let Some(v) = var("CS_API_RATE_LIMIT_WINDOW_SECS") {
            self.api_window_secs = v.parse().unwrap_or(self.api_window_secs);
        }
        if let Some(v) = var("CS_SCAN_TIMEOUT_SECS") {
            self.scan_timeout_secs = v.parse().unwrap_or(self.scan_timeout_secs);
        }
        if let Some(v) = var("CS_API_TOKENS") {
            self.api_tokens = v
                .split(',')
                .filter_map(|pair| pair.split_once(':'))
                .map(|(token, owner)| (token.trim().to_string(), owner.trim().to_string()))
                .filter(|(token, owner)| !token.is_empty() && !owner.is_empty())
                .collect();
        }
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            health_probe_timeout: Duration::from_secs(self.health_probe_timeout_secs),
            scan_timeout: Duration::from_secs(self.scan_timeout_secs),
            max_concurrent_scans: self.max_concurrent_scans,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            database_url: "sqlite://cybershield.db".to_string(),
            scanner_url: "http://127.0.0.1:8000".to_string(),
            health_probe_timeout_secs: 4,
            scan_timeout_secs: 120,
            max_concurrent_scans: 8,
            monthly_scan_limit: DEFAULT_MONTHLY_LIMIT,
            scans_per_hour: DEFAULT_SCANS_PER_HOUR,
            api_requests_per_window: 100,
            api_window_secs: 15 * 60,
            blocked_networks: DEFAULT_BLOCKED_NETWORKS
                .iter()
                .map(ToString::to_string)
                .collect(),
            api_tokens: HashMap::new(),
        }
    }
}
