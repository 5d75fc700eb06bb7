use std::{fmt, str::FromStr};

use chrono::{DateTime, Datelike, Days, Months, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanState {
    Pending,
    Running,
    Completed,
    Failed,
}

impl ScanState {
    pub fn as_str(self) -> &'static str {
        match self {
            ScanState::Pending => "pending",
            ScanState::Running => "running",
            ScanState::Completed => "completed",
            ScanState::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ScanState::Completed | ScanState::Failed)
    }

    /// `pending -> running -> {completed, failed}`; a pending job may also fail
    /// directly if it never got as far as dispatch.
    pub fn can_transition_to(self, next: ScanState) -> bool {
        matches!(
            (self, next),
            (ScanState::Pending, ScanState::Running)
                | (ScanState::Pending | ScanState::Running, ScanState::Completed)
                | (ScanState::Pending | ScanState::Running, ScanState::Failed)
        )
    }
}

impl fmt::Display for ScanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScanState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ScanState::Pending),
            "running" => Ok(ScanState::Running),
            "completed" => Ok(ScanState::Completed),
            "failed" => Ok(ScanState::Failed),
            other => Err(format!("unknown scan state: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
    /// Anything the scanner reports outside the four known buckets.
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub title: String,
    pub severity: Severity,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub recommendation: String,
    #[serde(default)]
    pub evidence: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeverityCounts {
    pub low: u32,
    pub medium: u32,
    pub high: u32,
    pub critical: u32,
}

impl SeverityCounts {
    /// Counts findings per severity bucket. Unknown severities are skipped.
    pub fn tally(findings: &[Finding]) -> Self {
        findings
            .iter()
            .fold(Self::default(), |mut counts, finding| {
                match finding.severity {
                    Severity::Low => counts.low += 1,
                    Severity::Medium => counts.medium += 1,
                    Severity::High => counts.high += 1,
                    Severity::Critical => counts.critical += 1,
                    Severity::Unknown => {}
                }
                counts
            })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CertificateInfo {
    pub valid: bool,
    pub issuer: Option<String>,
    pub expiry_date: Option<DateTime<Utc>>,
    pub days_until_expiry: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HeaderReport {
    pub missing: Vec<String>,
    pub present: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanResult {
    pub score: u8,
    pub findings: Vec<Finding>,
    pub summary: SeverityCounts,
    pub certificate: Option<CertificateInfo>,
    pub headers: HeaderReport,
    pub open_ports: Vec<u16>,
    pub technologies: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanJob {
    pub id: Uuid,
    pub owner_id: String,
    pub target: String,
    pub state: ScanState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ScanResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i64>,
}

impl ScanJob {
    pub fn new(owner_id: &str, target: &str, created_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner_id: owner_id.to_string(),
            target: target.to_string(),
            state: ScanState::Pending,
            result: None,
            error_message: None,
            created_at,
            completed_at: None,
            duration_seconds: None,
        }
    }
}

/// History row: everything but the findings list.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanSummary {
    pub id: Uuid,
    pub target: String,
    pub state: ScanState,
    pub score: Option<u8>,
    pub summary: Option<SeverityCounts>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i64>,
}

impl From<ScanJob> for ScanSummary {
    fn from(job: ScanJob) -> Self {
        Self {
            id: job.id,
            target: job.target,
            state: job.state,
            score: job.result.as_ref().map(|r| r.score),
            summary: job.result.as_ref().map(|r| r.summary),
            error_message: job.error_message,
            created_at: job.created_at,
            completed_at: job.completed_at,
            duration_seconds: job.duration_seconds,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: u32,
    pub limit: u32,
    pub total: u64,
}

impl<T> Page<T> {
    pub fn pages(&self) -> u64 {
        if self.limit == 0 {
            return 0;
        }
        self.total.div_ceil(u64::from(self.limit))
    }
}

/// Why a dispatched scan ended in `failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCategory {
    Unreachable,
    Timeout,
    Unexpected,
}

impl FailureCategory {
    pub fn message(self) -> &'static str {
        match self {
            FailureCategory::Unreachable => "Scanner service stopped during scan.",
            FailureCategory::Timeout => "Scan timed out. Target may be unreachable.",
            FailureCategory::Unexpected => "Scan failed due to an unexpected error.",
        }
    }
}

/// The single terminal write a dispatch performs.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed {
        result: ScanResult,
        duration_seconds: i64,
    },
    Failed(FailureCategory),
}

impl JobOutcome {
    pub fn state(&self) -> ScanState {
        match self {
            JobOutcome::Completed { .. } => ScanState::Completed,
            JobOutcome::Failed(_) => ScanState::Failed,
        }
    }
}

/// Calendar month (UTC) a usage counter belongs to, rendered `YYYY-MM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MonthKey(NaiveDate);

impl MonthKey {
    pub fn of(at: DateTime<Utc>) -> Self {
        let date = at.date_naive();
        Self(date - Days::new(u64::from(date.day0())))
    }

    /// First day of the following month.
    pub fn resets_on(self) -> NaiveDate {
        self.0 + Months::new(1)
    }
}

impl fmt::Display for MonthKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m"))
    }
}

impl FromStr for MonthKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NaiveDate::parse_from_str(&format!("{s}-01"), "%Y-%m-%d")
            .map(MonthKey)
            .map_err(|e| format!("invalid month key {s:?}: {e}"))
    }
}

impl TryFrom<String> for MonthKey {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MonthKey> for String {
    fn from(key: MonthKey) -> Self {
        key.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageCounter {
    pub id: Uuid,
    pub owner_id: String,
    pub month: MonthKey,
    pub count: u32,
}
