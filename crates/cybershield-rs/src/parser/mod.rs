use chrono::{DateTime, Utc};

use crate::models::{CertificateInfo, Finding, HeaderReport, ScanResult, SeverityCounts};

#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("malformed scanner report: {0}")]
    Json(#[from] serde_json::Error),
    #[error("security score {0} is outside 0-100")]
    ScoreOutOfRange(f64),
}

#[derive(Debug, serde::Deserialize)]
struct ScannerReport {
    security_score: f64,
    #[serde(default)]
    vulnerabilities: Vec<Finding>,
    #[serde(default)]
    ssl_info: Option<SslInfo>,
    #[serde(default)]
    headers: Option<HeaderReport>,
    #[serde(default)]
    open_ports: Vec<u16>,
    #[serde(default)]
    technologies: Vec<String>,
}

#[derive(Debug, serde::Deserialize)]
struct SslInfo {
    #[serde(default)]
    valid: bool,
    #[serde(default)]
    issuer: Option<String>,
    #[serde(default)]
    expiry_date: Option<String>,
    #[serde(default)]
    days_until_expiry: Option<i64>,
}

/// Normalizes the scanner's `/scan` response body into a [`ScanResult`].
pub fn parse_scan_report(body: &str) -> Result<ScanResult, ReportError> {
    let report: ScannerReport = serde_json::from_str(body)?;

    let score = report.security_score.round();
    if !(0.0..=100.0).contains(&score) {
        return Err(ReportError::ScoreOutOfRange(report.security_score));
    }

    let certificate = report.ssl_info.map(|ssl| CertificateInfo {
        valid: ssl.valid,
        issuer: ssl.issuer,
        expiry_date: ssl
            .expiry_date
            .as_deref()
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|dt| dt.with_timezone(&Utc)),
        days_until_expiry: ssl.days_until_expiry,
    });

    Ok(ScanResult {
        score: score as u8,
        summary: SeverityCounts::tally(&report.vulnerabilities),
        findings: report.vulnerabilities,
        certificate,
        headers: report.headers.unwrap_or_default(),
        open_ports: report.open_ports,
        technologies: report.technologies,
    })
}
