use std::time::Duration;

use anyhow::Context;
use url::Url;
use uuid::Uuid;

use crate::{
    models::{FailureCategory, ScanResult},
    parser::parse_scan_report,
};

#[derive(Debug, Clone)]
pub struct ScanRequest {
    pub job_id: Uuid,
    pub target: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ScannerError {
    #[error("scanner unreachable: {0}")]
    Unreachable(String),
    #[error("scanner did not answer within {0:?}")]
    Timeout(Duration),
    #[error("scanner call failed: {0}")]
    Unexpected(String),
}

impl ScannerError {
    pub fn category(&self) -> FailureCategory {
        match self {
            ScannerError::Unreachable(_) => FailureCategory::Unreachable,
            ScannerError::Timeout(_) => FailureCategory::Timeout,
            ScannerError::Unexpected(_) => FailureCategory::Unexpected,
        }
    }
}

/// The external scanner. Stateless request/response; tests swap in a fake.
#[async_trait::async_trait]
pub trait ScannerClient: Send + Sync {
    fn name(&self) -> &'static str;

    /// `true` when the scanner answered its health endpoint within `timeout`.
    async fn health_check(&self, timeout: Duration) -> bool;

    async fn analyze(&self, req: ScanRequest, timeout: Duration)
        -> Result<ScanResult, ScannerError>;
}

#[derive(Debug, serde::Serialize)]
struct AnalyzeBody<'a> {
    url: &'a str,
    scan_id: String,
}

#[derive(Debug, Clone)]
pub struct HttpScannerClient {
    base_url: Url,
    http: reqwest::Client,
}

impl HttpScannerClient {
    pub fn new(base_url: &str) -> anyhow::Result<Self> {
        let mut base_url =
            Url::parse(base_url).with_context(|| format!("invalid scanner url {base_url:?}"))?;
        // `Url::join` replaces the last path segment unless the base ends in '/'.
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        let http = reqwest::Client::builder()
            .build()
            .context("failed to build scanner http client")?;
        Ok(Self { base_url, http })
    }

    fn endpoint(&self, path: &str) -> Result<Url, ScannerError> {
        self.base_url
            .join(path)
            .map_err(|e| ScannerError::Unexpected(format!("bad scanner endpoint {path}: {e}")))
    }
}

fn classify(err: reqwest::Error, timeout: Duration) -> ScannerError {
    // A connect timeout reports both flags; it counts as a timeout.
    if err.is_timeout() {
        ScannerError::Timeout(timeout)
    } else if err.is_connect() {
        ScannerError::Unreachable(err.to_string())
    } else {
        ScannerError::Unexpected(err.to_string())
    }
}

#[async_trait::async_trait]
impl ScannerClient for HttpScannerClient {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn health_check(&self, timeout: Duration) -> bool {
        let Ok(url) = self.endpoint("health") else {
            return false;
        };
        match self.http.get(url).timeout(timeout).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                tracing::debug!(error = %e, "scanner health probe failed");
                false
            }
        }
    }

    async fn analyze(
        &self,
        req: ScanRequest,
        timeout: Duration,
    ) -> Result<ScanResult, ScannerError> {
        let resp = self
            .http
            .post(self.endpoint("scan")?)
            .timeout(timeout)
            .json(&AnalyzeBody {
                url: &req.target,
                scan_id: req.job_id.to_string(),
            })
            .send()
            .await
            .map_err(|e| classify(e, timeout))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(ScannerError::Unexpected(format!(
                "scanner answered {status}"
            )));
        }

        let body = resp.text().await.map_err(|e| classify(e, timeout))?;
        parse_scan_report(&body).map_err(|e| ScannerError::Unexpected(e.to_string()))
    }
}
