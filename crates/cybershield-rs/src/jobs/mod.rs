use std::{sync::Arc, time::Duration};

use tokio::sync::{Mutex, Semaphore};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    adapters::{ScanRequest, ScannerClient},
    clock::Clock,
    limiter::RateLimited,
    models::{FailureCategory, JobOutcome, Page, ScanJob, ScanSummary},
    quota::{QuotaEnforcer, QuotaError, UsageReservation, UsageSnapshot},
    security::{TargetError, TargetPolicy},
    store::{JobStore, StoreError},
};

pub const MAX_PAGE_SIZE: u32 = 100;

#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error(transparent)]
    Validation(#[from] TargetError),
    #[error(transparent)]
    RateLimited(#[from] RateLimited),
    #[error("Monthly scan limit reached ({} scans/month).", .0.limit)]
    QuotaExceeded(UsageSnapshot),
    #[error("Scanner service is not running.")]
    ScannerUnreachable,
    #[error("Scan not found")]
    NotFound,
    #[error("storage failure: {0}")]
    Store(#[from] StoreError),
}

impl From<QuotaError> for ScanError {
    fn from(err: QuotaError) -> Self {
        match err {
            QuotaError::Exceeded(snapshot) => ScanError::QuotaExceeded(snapshot),
            QuotaError::Store(e) => ScanError::Store(e),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub health_probe_timeout: Duration,
    pub scan_timeout: Duration,
    pub max_concurrent_scans: usize,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            health_probe_timeout: Duration::from_secs(4),
            scan_timeout: Duration::from_secs(120),
            max_concurrent_scans: 8,
        }
    }
}

#[derive(Debug, Default)]
pub struct JobRunnerState {
    pub running: usize,
}

/// Owns the scan job lifecycle: create, detached dispatch, terminal update.
pub struct ScanOrchestrator {
    jobs: Arc<dyn JobStore>,
    quota: Arc<QuotaEnforcer>,
    policy: TargetPolicy,
    scanner: Arc<dyn ScannerClient>,
    clock: Arc<dyn Clock>,
    health_probe_timeout: Duration,
    dispatcher: Dispatcher,
}

impl ScanOrchestrator {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        quota: Arc<QuotaEnforcer>,
        scanner: Arc<dyn ScannerClient>,
        clock: Arc<dyn Clock>,
        policy: TargetPolicy,
        settings: OrchestratorSettings,
    ) -> Self {
        let dispatcher = Dispatcher {
            jobs: jobs.clone(),
            scanner: scanner.clone(),
            clock: clock.clone(),
            scan_timeout: settings.scan_timeout,
            permits: Arc::new(Semaphore::new(settings.max_concurrent_scans.max(1))),
            runner_state: Arc::new(Mutex::new(JobRunnerState::default())),
        };
        Self {
            jobs,
            quota,
            policy,
            scanner,
            clock,
            health_probe_timeout: settings.health_probe_timeout,
            dispatcher,
        }
    }

    /// Quota check followed by [`ScanOrchestrator::create`].
    pub async fn submit(&self, owner_id: &str, target: &str) -> Result<ScanJob, ScanError> {
        let reservation = self.quota.check_and_reserve(owner_id).await?;
        self.create(target, reservation).await
    }

    /// validate -> probe -> persist -> count usage -> return, with dispatch
    /// running detached. Nothing is written if validation or the probe fails.
    /// The job belongs to the owner the reservation was made for.
    pub async fn create(
        &self,
        target: &str,
        reservation: UsageReservation,
    ) -> Result<ScanJob, ScanError> {
        let owner = reservation.owner_id().to_string();
        let owner_id = owner.as_str();
        let target = target.trim();
        self.policy.validate(target)?;

        if !self.scanner.health_check(self.health_probe_timeout).await {
            warn!(owner_id, target, scanner = self.scanner.name(), "scanner failed pre-flight probe");
            return Err(ScanError::ScannerUnreachable);
        }

        let job = ScanJob::new(owner_id, target, self.clock.now());
        self.jobs.insert(&job).await?;

        // The job exists now; a counting failure under-counts rather than refusing it.
        if let Err(e) = self.quota.increment(reservation).await {
            error!(error = %e, job_id = %job.id, owner_id, "failed to count scan usage");
        }

        info!(job_id = %job.id, owner_id, target, "scan initiated");
        let dispatcher = self.dispatcher.clone();
        let job_id = job.id;
        tokio::spawn(async move { dispatcher.run(job_id).await });

        Ok(job)
    }

    /// Runs one job against the scanner and writes its terminal state. Never
    /// fails outward; problems are logged. `create` already spawns this.
    pub async fn dispatch(&self, job_id: Uuid) {
        self.dispatcher.run(job_id).await
    }

    /// Jobs owned by someone else are reported as missing.
    pub async fn get(&self, job_id: Uuid, owner_id: &str) -> Result<ScanJob, ScanError> {
        self.jobs
            .find_owned(job_id, owner_id)
            .await?
            .ok_or(ScanError::NotFound)
    }

    /// Newest first. `page` is 1-based; `limit` is clamped to `1..=MAX_PAGE_SIZE`.
    pub async fn list(
        &self,
        owner_id: &str,
        page: u32,
        limit: u32,
    ) -> Result<Page<ScanSummary>, ScanError> {
        let page = page.max(1);
        let limit = limit.clamp(1, MAX_PAGE_SIZE);
        let offset = u64::from(page - 1) * u64::from(limit);

        let (jobs, total) = self
            .jobs
            .list_by_owner(owner_id, offset, u64::from(limit))
            .await?;
        Ok(Page {
            items: jobs.into_iter().map(ScanSummary::from).collect(),
            page,
            limit,
            total,
        })
    }

    pub async fn in_flight(&self) -> usize {
        self.dispatcher.runner_state.lock().await.running
    }
}

#[derive(Clone)]
struct Dispatcher {
    jobs: Arc<dyn JobStore>,
    scanner: Arc<dyn ScannerClient>,
    clock: Arc<dyn Clock>,
    scan_timeout: Duration,
    permits: Arc<Semaphore>,
    runner_state: Arc<Mutex<JobRunnerState>>,
}

impl Dispatcher {
    async fn run(&self, job_id: Uuid) {
        let Ok(_permit) = self.permits.clone().acquire_owned().await else {
            error!(%job_id, "dispatch pool closed; job left pending");
            return;
        };

        {
            let mut lock = self.runner_state.lock().await;
            lock.running += 1;
        }

        self.execute(job_id).await;

        decrement_running(&self.runner_state).await;
    }

    async fn execute(&self, job_id: Uuid) {
        let job = match self.jobs.find(job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                error!(%job_id, "dispatched job does not exist");
                return;
            }
            Err(e) => {
                error!(error = %e, %job_id, "failed to load job for dispatch");
                self.fail_unexpected(job_id).await;
                return;
            }
        };

        match self.jobs.mark_running(job_id).await {
            Ok(()) => {}
            // Already started or finished elsewhere; nothing to do.
            Err(e @ StoreError::InvalidTransition { .. }) => {
                warn!(error = %e, %job_id, "job cannot start");
                return;
            }
            Err(e) => {
                error!(error = %e, %job_id, "failed to start job");
                self.fail_unexpected(job_id).await;
                return;
            }
        }

        let request = ScanRequest {
            job_id,
            target: job.target.clone(),
        };
        let analysis =
            tokio::time::timeout(self.scan_timeout, self.scanner.analyze(request, self.scan_timeout))
                .await;

        let completed_at = self.clock.now();
        let outcome = match analysis {
            Ok(Ok(result)) => {
                let duration_seconds =
                    ((completed_at - job.created_at).num_milliseconds().max(0) as f64 / 1000.0)
                        .round() as i64;
                info!(
                    %job_id,
                    target = %job.target,
                    score = result.score,
                    findings = result.findings.len(),
                    duration_secs = duration_seconds,
                    "scan completed"
                );
                JobOutcome::Completed {
                    result,
                    duration_seconds,
                }
            }
            Ok(Err(e)) => {
                error!(error = %e, %job_id, target = %job.target, scanner = self.scanner.name(), "scan failed");
                JobOutcome::Failed(e.category())
            }
            Err(_) => {
                error!(%job_id, target = %job.target, timeout = ?self.scan_timeout, "scan exceeded its deadline");
                JobOutcome::Failed(FailureCategory::Timeout)
            }
        };

        if let Err(e) = self.jobs.finish(job_id, &outcome, completed_at).await {
            error!(error = %e, %job_id, state = %outcome.state(), "failed to record scan outcome");
        }
    }

    /// Best-effort terminal write for a job that could not be started.
    async fn fail_unexpected(&self, job_id: Uuid) {
        let outcome = JobOutcome::Failed(FailureCategory::Unexpected);
        if let Err(e) = self.jobs.finish(job_id, &outcome, self.clock.now()).await {
            error!(error = %e, %job_id, "job left unfinished after store failure");
        }
    }
}

async fn decrement_running(runner_state: &Arc<Mutex<JobRunnerState>>) {
    let mut lock = runner_state.lock().await;
    lock.running = lock.running.saturating_sub(1);
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::{
        adapters::ScannerError,
        clock::{ManualClock, SystemClock},
        models::{
            Finding, HeaderReport, MonthKey, ScanResult, ScanState, Severity, SeverityCounts,
            UsageCounter,
        },
        store::{MemoryJobStore, MemoryUsageStore, UsageStore},
    };

    #[derive(Debug, Clone)]
    pub enum Behaviour {
        Report(ScanResult),
        Refused,
        DeadlineExceeded,
        Broken,
        Hang(Duration),
    }

    /// Scripted stand-in for the external scanner.
    pub struct FakeScanner {
        pub healthy: bool,
        pub behaviour: Behaviour,
        pub probes: AtomicUsize,
        pub analyses: AtomicUsize,
        /// Moved forward by `work` during every analysis.
        pub clock: Option<(ManualClock, chrono::Duration)>,
    }

    impl FakeScanner {
        pub fn new(behaviour: Behaviour) -> Self {
            Self {
                healthy: true,
                behaviour,
                probes: AtomicUsize::new(0),
                analyses: AtomicUsize::new(0),
                clock: None,
            }
        }

        pub fn down() -> Self {
            Self {
                healthy: false,
                ..Self::new(Behaviour::Broken)
            }
        }
    }

    #[async_trait::async_trait]
    impl ScannerClient for FakeScanner {
        fn name(&self) -> &'static str {
            "fake"
        }

        async fn health_check(&self, _timeout: Duration) -> bool {
            self.probes.fetch_add(1, Ordering::SeqCst);
            self.healthy
        }

        async fn analyze(
            &self,
            _req: ScanRequest,
            timeout: Duration,
        ) -> Result<ScanResult, ScannerError> {
            self.analyses.fetch_add(1, Ordering::SeqCst);
            if let Some((clock, work)) = &self.clock {
                clock.advance(*work);
            }
            match &self.behaviour {
                Behaviour::Report(result) => Ok(result.clone()),
                Behaviour::Refused => Err(ScannerError::Unreachable("connection refused".into())),
                Behaviour::DeadlineExceeded => Err(ScannerError::Timeout(timeout)),
                Behaviour::Broken => Err(ScannerError::Unexpected("HTTP 500".into())),
                Behaviour::Hang(d) => {
                    tokio::time::sleep(*d).await;
                    Err(ScannerError::Unexpected("hung scanner eventually gave up".into()))
                }
            }
        }
    }

    pub fn report(score: u8, severities: &[Severity]) -> ScanResult {
        let findings: Vec<Finding> = severities
            .iter()
            .map(|severity| Finding {
                title: "Missing Referrer-Policy Header".into(),
                severity: *severity,
                description: "Sensitive URL information may be leaked to third parties.".into(),
                category: Some("Security Headers".into()),
                recommendation: "Add a Referrer-Policy header.".into(),
                evidence: "Header 'Referrer-Policy' not found in response".into(),
            })
            .collect();
        ScanResult {
            score,
            summary: SeverityCounts::tally(&findings),
            findings,
            certificate: None,
            headers: HeaderReport::default(),
            open_ports: vec![443],
            technologies: vec![],
        }
    }

    struct Harness {
        orchestrator: ScanOrchestrator,
        scanner: Arc<FakeScanner>,
        usage: Arc<dyn UsageStore>,
        quota: Arc<QuotaEnforcer>,
    }

    fn harness_with(
        scanner: FakeScanner,
        usage: Arc<dyn UsageStore>,
        clock: Arc<dyn Clock>,
    ) -> Harness {
        harness_with_jobs(scanner, Arc::new(MemoryJobStore::new()), usage, clock)
    }

    fn harness_with_jobs(
        scanner: FakeScanner,
        jobs: Arc<dyn JobStore>,
        usage: Arc<dyn UsageStore>,
        clock: Arc<dyn Clock>,
    ) -> Harness {
        let scanner = Arc::new(scanner);
        let quota = Arc::new(QuotaEnforcer::new(usage.clone(), clock.clone(), 5));
        let orchestrator = ScanOrchestrator::new(
            jobs,
            quota.clone(),
            scanner.clone(),
            clock,
            TargetPolicy::default(),
            OrchestratorSettings::default(),
        );
        Harness {
            orchestrator,
            scanner,
            usage,
            quota,
        }
    }

    fn harness(scanner: FakeScanner) -> Harness {
        harness_with(
            scanner,
            Arc::new(MemoryUsageStore::new()),
            Arc::new(SystemClock),
        )
    }

    pub async fn wait_for_terminal(
        orchestrator: &ScanOrchestrator,
        job_id: Uuid,
        owner_id: &str,
    ) -> ScanJob {
        for _ in 0..600 {
            let job = orchestrator.get(job_id, owner_id).await.unwrap();
            if job.state.is_terminal() {
                return job;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        panic!("job {job_id} never reached a terminal state");
    }

    #[tokio::test(start_paused = true)]
    async fn created_job_is_non_terminal_with_nothing_set() {
        let h = harness(FakeScanner::new(Behaviour::Hang(Duration::from_secs(30))));
        let job = h.orchestrator.submit("u1", "https://example.com").await.unwrap();
        assert_eq!(job.state, ScanState::Pending);

        let fetched = h.orchestrator.get(job.id, "u1").await.unwrap();
        assert!(matches!(fetched.state, ScanState::Pending | ScanState::Running));
        assert_eq!(fetched.result, None);
        assert_eq!(fetched.error_message, None);
        assert_eq!(fetched.completed_at, None);
        assert_eq!(h.quota.usage("u1").await.unwrap().used, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn successful_scan_completes_with_tallied_summary() {
        let h = harness(FakeScanner::new(Behaviour::Report(report(82, &[Severity::Low]))));
        let job = h.orchestrator.submit("u1", "https://example.com").await.unwrap();

        let done = wait_for_terminal(&h.orchestrator, job.id, "u1").await;
        assert_eq!(done.state, ScanState::Completed);
        let result = done.result.expect("completed job has a result");
        assert_eq!(result.score, 82);
        assert_eq!(
            result.summary,
            SeverityCounts {
                low: 1,
                medium: 0,
                high: 0,
                critical: 0
            }
        );
        assert_eq!(done.error_message, None);
        assert!(done.completed_at.is_some());
        assert!(done.duration_seconds.is_some());
        assert_eq!(h.orchestrator.in_flight().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn duration_is_measured_from_creation() {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 10, 18, 9, 0, 0).unwrap());
        let mut scanner = FakeScanner::new(Behaviour::Report(report(90, &[])));
        scanner.clock = Some((clock.clone(), chrono::Duration::milliseconds(41_600)));
        let h = harness_with(scanner, Arc::new(MemoryUsageStore::new()), Arc::new(clock.clone()));

        let job = h.orchestrator.submit("u1", "https://example.com").await.unwrap();
        let done = wait_for_terminal(&h.orchestrator, job.id, "u1").await;
        assert_eq!(done.duration_seconds, Some(42));
        assert_eq!(
            done.completed_at,
            Some(Utc.with_ymd_and_hms(2026, 10, 18, 9, 0, 41).unwrap()
                + chrono::Duration::milliseconds(600))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn scanner_down_leaves_no_job_and_no_usage() {
        let h = harness(FakeScanner::down());
        let err = h
            .orchestrator
            .submit("u1", "https://example.com")
            .await
            .unwrap_err();
        assert!(matches!(err, ScanError::ScannerUnreachable));

        let page = h.orchestrator.list("u1", 1, 10).await.unwrap();
        assert_eq!(page.total, 0);
        assert_eq!(h.quota.usage("u1").await.unwrap().used, 0);
        assert_eq!(h.scanner.analyses.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_targets_are_rejected_before_the_probe() {
        let h = harness(FakeScanner::new(Behaviour::Report(report(82, &[]))));
        let err = h
            .orchestrator
            .submit("u1", "http://192.168.1.5")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ScanError::Validation(TargetError::PrivateAddress)
        ));
        assert_eq!(h.scanner.probes.load(Ordering::SeqCst), 0);
        assert_eq!(h.orchestrator.list("u1", 1, 10).await.unwrap().total, 0);
        assert_eq!(h.quota.usage("u1").await.unwrap().used, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_are_classified_deterministically() {
        let cases = [
            (Behaviour::Refused, FailureCategory::Unreachable),
            (Behaviour::DeadlineExceeded, FailureCategory::Timeout),
            (Behaviour::Broken, FailureCategory::Unexpected),
        ];
        for (behaviour, category) in cases {
            for _ in 0..2 {
                let h = harness(FakeScanner::new(behaviour.clone()));
                let job = h.orchestrator.submit("u1", "https://example.com").await.unwrap();
                let done = wait_for_terminal(&h.orchestrator, job.id, "u1").await;
                assert_eq!(done.state, ScanState::Failed);
                assert_eq!(done.error_message.as_deref(), Some(category.message()));
                assert_eq!(done.result, None);
                assert_eq!(done.duration_seconds, None);
                assert!(done.completed_at.is_some());
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn hung_scanner_fails_at_the_deadline() {
        let h = harness(FakeScanner::new(Behaviour::Hang(Duration::from_secs(150))));
        let job = h.orchestrator.submit("u1", "https://example.com").await.unwrap();

        let started = tokio::time::Instant::now();
        let done = wait_for_terminal(&h.orchestrator, job.id, "u1").await;
        assert_eq!(done.state, ScanState::Failed);
        assert_eq!(
            done.error_message.as_deref(),
            Some(FailureCategory::Timeout.message())
        );
        assert!(started.elapsed() < Duration::from_secs(150));
    }

    #[tokio::test(start_paused = true)]
    async fn other_owners_cannot_see_a_job() {
        let h = harness(FakeScanner::new(Behaviour::Report(report(82, &[]))));
        let job = h.orchestrator.submit("u1", "https://example.com").await.unwrap();
        assert!(matches!(
            h.orchestrator.get(job.id, "u2").await,
            Err(ScanError::NotFound)
        ));
        assert!(matches!(
            h.orchestrator.get(Uuid::new_v4(), "u1").await,
            Err(ScanError::NotFound)
        ));
        assert_eq!(h.orchestrator.list("u2", 1, 10).await.unwrap().total, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn list_pages_newest_first() {
        let h = harness(FakeScanner::new(Behaviour::Report(report(82, &[]))));
        let mut ids = Vec::new();
        for i in 0..3 {
            let job = h
                .orchestrator
                .submit("u1", &format!("https://site{i}.example"))
                .await
                .unwrap();
            ids.push(job.id);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let first = h.orchestrator.list("u1", 1, 2).await.unwrap();
        assert_eq!(first.total, 3);
        assert_eq!(first.pages(), 2);
        assert_eq!(
            first.items.iter().map(|s| s.id).collect::<Vec<_>>(),
            vec![ids[2], ids[1]]
        );
        let second = h.orchestrator.list("u1", 2, 2).await.unwrap();
        assert_eq!(second.items.len(), 1);
        assert_eq!(second.items[0].id, ids[0]);

        let clamped = h.orchestrator.list("u1", 0, 0).await.unwrap();
        assert_eq!((clamped.page, clamped.limit), (1, 1));
    }

    /// Counts nothing: every increment fails.
    struct BrokenCounter(MemoryUsageStore);

    #[async_trait::async_trait]
    impl UsageStore for BrokenCounter {
        async fn find_or_create(
            &self,
            owner_id: &str,
            month: MonthKey,
        ) -> Result<UsageCounter, StoreError> {
            self.0.find_or_create(owner_id, month).await
        }

        async fn find(
            &self,
            owner_id: &str,
            month: MonthKey,
        ) -> Result<Option<UsageCounter>, StoreError> {
            self.0.find(owner_id, month).await
        }

        async fn increment(&self, _counter_id: Uuid) -> Result<(), StoreError> {
            Err(StoreError::Corrupt("disk full".into()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn usage_failure_after_persisting_still_runs_the_scan() {
        let h = harness_with(
            FakeScanner::new(Behaviour::Report(report(70, &[Severity::High]))),
            Arc::new(BrokenCounter(MemoryUsageStore::new())),
            Arc::new(SystemClock),
        );
        let job = h.orchestrator.submit("u1", "https://example.com").await.unwrap();
        let done = wait_for_terminal(&h.orchestrator, job.id, "u1").await;
        assert_eq!(done.state, ScanState::Completed);
        let month = MonthKey::of(Utc::now());
        assert_eq!(h.usage.find("u1", month).await.unwrap().unwrap().count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn redispatching_a_finished_job_changes_nothing() {
        let h = harness(FakeScanner::new(Behaviour::Report(report(82, &[Severity::Low]))));
        let job = h.orchestrator.submit("u1", "https://example.com").await.unwrap();
        let done = wait_for_terminal(&h.orchestrator, job.id, "u1").await;

        h.orchestrator.dispatch(job.id).await;
        h.orchestrator.dispatch(Uuid::new_v4()).await;

        assert_eq!(h.orchestrator.get(job.id, "u1").await.unwrap(), done);
        assert_eq!(h.scanner.analyses.load(Ordering::SeqCst), 1);
        assert_eq!(h.orchestrator.in_flight().await, 0);
    }

    /// Delegates everything except `mark_running`, which always hits a dead pool.
    struct StallingStart(MemoryJobStore);

    #[async_trait::async_trait]
    impl JobStore for StallingStart {
        async fn insert(&self, job: &ScanJob) -> Result<(), StoreError> {
            self.0.insert(job).await
        }

        async fn find(&self, id: Uuid) -> Result<Option<ScanJob>, StoreError> {
            self.0.find(id).await
        }

        async fn find_owned(&self, id: Uuid, owner_id: &str) -> Result<Option<ScanJob>, StoreError> {
            self.0.find_owned(id, owner_id).await
        }

        async fn list_by_owner(
            &self,
            owner_id: &str,
            offset: u64,
            limit: u64,
        ) -> Result<(Vec<ScanJob>, u64), StoreError> {
            self.0.list_by_owner(owner_id, offset, limit).await
        }

        async fn mark_running(&self, _id: Uuid) -> Result<(), StoreError> {
            Err(StoreError::Database(sqlx::Error::PoolTimedOut))
        }

        async fn finish(
            &self,
            id: Uuid,
            outcome: &JobOutcome,
            completed_at: chrono::DateTime<Utc>,
        ) -> Result<(), StoreError> {
            self.0.finish(id, outcome, completed_at).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn job_that_cannot_start_is_failed_not_left_pending() {
        let h = harness_with_jobs(
            FakeScanner::new(Behaviour::Report(report(82, &[]))),
            Arc::new(StallingStart(MemoryJobStore::new())),
            Arc::new(MemoryUsageStore::new()),
            Arc::new(SystemClock),
        );
        let job = h.orchestrator.submit("u1", "https://example.com").await.unwrap();

        let done = wait_for_terminal(&h.orchestrator, job.id, "u1").await;
        assert_eq!(done.state, ScanState::Failed);
        assert_eq!(
            done.error_message.as_deref(),
            Some(FailureCategory::Unexpected.message())
        );
        assert_eq!(h.scanner.analyses.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn created_job_belongs_to_the_reserving_owner() {
        let h = harness(FakeScanner::new(Behaviour::Report(report(82, &[]))));
        let reservation = h.quota.check_and_reserve("u2").await.unwrap();

        let job = h
            .orchestrator
            .create("https://example.com", reservation)
            .await
            .unwrap();
        assert_eq!(job.owner_id, "u2");
        assert_eq!(h.quota.usage("u2").await.unwrap().used, 1);
        assert_eq!(h.quota.usage("u1").await.unwrap().used, 0);
        assert!(h.orchestrator.get(job.id, "u2").await.is_ok());
    }
}
