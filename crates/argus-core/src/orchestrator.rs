//! The central coordinator for scan submissions.
//!
//! On a new request the orchestrator deduplicates by content fingerprint
//! against the store, then against the aggregator's own by-fingerprint
//! report lookup (cheaper than a submission, which may be rate-limited or
//! billed), and only then submits a new job and hands it to the poll
//! scheduler. The synchronous return is always a [`ScanRecord`]; the
//! asynchronous work continues after the caller's request has returned.

use std::time::Duration;

use chrono::{TimeDelta, Utc};
use url::Url;

use crate::bus::{NotificationBus, Subscription};
use crate::error::ScanError;
use crate::fingerprint::Fingerprint;
use crate::poller::{PollConfig, PollScheduler};
use crate::scan::{NewScanRecord, ScanRecord, ScanState, ScanSubject, ScanUpdate};
use crate::traits::{AggregatorClient, ResultStore};
use uuid::Uuid;

/// Cost-control and submission-retry knobs.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// A completed record younger than this is returned without touching
    /// the aggregator. Align with the aggregator's own re-scan cadence.
    pub freshness_window: TimeDelta,
    /// Attempts for the submission call itself (transient errors only).
    pub submit_retries: u32,
    /// Delay before the first submission retry, doubled per attempt.
    pub submit_retry_delay: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            freshness_window: TimeDelta::hours(24),
            submit_retries: 3,
            submit_retry_delay: Duration::from_secs(2),
        }
    }
}

impl OrchestratorConfig {
    pub fn with_freshness_window(mut self, window: TimeDelta) -> Self {
        self.freshness_window = window;
        self
    }

    pub fn with_submit_retries(mut self, retries: u32) -> Self {
        self.submit_retries = retries.max(1);
        self
    }
}

/// Coordinates dedupe, submission, polling hand-off, and notification.
///
/// Generic over the store and aggregator via traits, enabling dependency
/// injection and testability without real HTTP calls.
pub struct ScanOrchestrator<S, A>
where
    S: ResultStore,
    A: AggregatorClient,
{
    store: S,
    client: A,
    bus: NotificationBus,
    scheduler: PollScheduler<S, A>,
    config: OrchestratorConfig,
}

impl<S, A> ScanOrchestrator<S, A>
where
    S: ResultStore + 'static,
    A: AggregatorClient + 'static,
{
    pub fn new(
        store: S,
        client: A,
        bus: NotificationBus,
        poll_config: PollConfig,
        config: OrchestratorConfig,
    ) -> Self {
        let scheduler = PollScheduler::new(store.clone(), client.clone(), bus.clone(), poll_config);
        Self {
            store,
            client,
            bus,
            scheduler,
            config,
        }
    }

    /// Submit file content for scanning.
    ///
    /// Returns the resulting record synchronously: a cached or in-flight
    /// record, a record seeded `completed` from an existing aggregator
    /// report, a fresh `pending` record whose poll loop has started, or a
    /// `failed` record when the aggregator rejected the submission.
    /// Transient upstream errors never surface here.
    pub async fn submit_file(
        &self,
        name: &str,
        bytes: &[u8],
        media_type: Option<&str>,
    ) -> Result<ScanRecord, ScanError> {
        if name.is_empty() {
            return Err(ScanError::Validation("file name must not be empty".into()));
        }
        if bytes.is_empty() {
            return Err(ScanError::Validation("file content must not be empty".into()));
        }

        let fingerprint = Fingerprint::of_bytes(bytes);
        let subject = ScanSubject::File {
            name: name.to_string(),
            size: bytes.len() as u64,
            media_type: media_type.map(str::to_string),
        };
        tracing::info!(
            file = %name,
            size = bytes.len(),
            fingerprint = fingerprint.short(),
            "File scan requested"
        );
        self.start_scan(fingerprint, subject, Some(bytes)).await
    }

    /// Submit a URL for scanning. The normalized URL's digest is the
    /// dedupe key; the derived domain is kept on the subject.
    pub async fn submit_url(&self, raw_url: &str) -> Result<ScanRecord, ScanError> {
        let (normalized, domain) = normalize_url(raw_url)?;
        let fingerprint = Fingerprint::of_bytes(normalized.as_bytes());
        let subject = ScanSubject::Url {
            url: normalized,
            domain,
        };
        tracing::info!(
            url = %subject.label(),
            fingerprint = fingerprint.short(),
            "URL scan requested"
        );
        self.start_scan(fingerprint, subject, None).await
    }

    /// Pure store read; never triggers polling.
    pub async fn get_scan_status(&self, scan_id: Uuid) -> Result<Option<ScanRecord>, ScanError> {
        self.store.get(scan_id).await
    }

    /// Register interest in a scan's push notifications.
    pub fn subscribe(&self, scan_id: Uuid) -> Subscription {
        self.bus.subscribe(scan_id)
    }

    pub fn scheduler(&self) -> &PollScheduler<S, A> {
        &self.scheduler
    }

    async fn start_scan(
        &self,
        fingerprint: Fingerprint,
        subject: ScanSubject,
        bytes: Option<&[u8]>,
    ) -> Result<ScanRecord, ScanError> {
        // 1. Local dedupe: an in-flight scan, or a fresh completed one,
        //    short-circuits without any aggregator traffic.
        if let Some(hit) = self.cached(&fingerprint).await? {
            return Ok(hit);
        }

        // 2. The aggregator may already know this content (files only:
        //    the lookup is keyed by content digest). Best effort; any
        //    error falls through to submission.
        if bytes.is_some() {
            match self.client.fetch_report(&fingerprint.sha256).await {
                Ok(Some(report)) if report.has_verdicts() => {
                    tracing::info!(
                        fingerprint = fingerprint.short(),
                        engines = report.summary.total(),
                        "Content already known to aggregator, seeding completed record"
                    );
                    let seeded = NewScanRecord::completed(fingerprint.clone(), subject, report);
                    let outcome = self.create_or_resolve(seeded, &fingerprint).await?;
                    return Ok(outcome.into_record());
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(
                        fingerprint = fingerprint.short(),
                        error = %e,
                        "Report lookup failed, falling through to submission"
                    );
                }
            }
        }

        // 3. Create the pending record before submitting: the store's
        //    conflict guard is what keeps two near-simultaneous identical
        //    submissions from creating competing aggregator jobs. Only the
        //    call that actually inserted the record may submit; a resolved
        //    record belongs to the race winner, whose submission carries
        //    the scan even if its job id is not bound yet.
        let record = match self
            .create_or_resolve(NewScanRecord::pending(fingerprint.clone(), subject), &fingerprint)
            .await?
        {
            CreateOutcome::Created(record) => record,
            CreateOutcome::Resolved(record) => return Ok(record),
        };

        // 4. Submit, bind the job id, and hand off to the poll scheduler.
        match self.submit_upstream(&record.subject, bytes).await {
            Ok(job_id) => {
                let update = ScanUpdate::state(ScanState::Pending).with_job_id(job_id.clone());
                let record = self.store.update(record.scan_id, update).await?;
                self.scheduler
                    .start(record.scan_id, job_id, fingerprint.clone());
                Ok(record)
            }
            Err(e) => {
                tracing::warn!(
                    scan_id = %record.scan_id,
                    fingerprint = fingerprint.short(),
                    error = %e,
                    "Submission failed, marking scan failed"
                );
                let update = ScanUpdate::state(ScanState::Failed).with_error(e.to_string());
                let record = self.store.update(record.scan_id, update).await?;
                self.bus.publish(
                    record.scan_id,
                    record.state,
                    record.report.clone(),
                    record.error.clone(),
                );
                Ok(record)
            }
        }
    }

    /// Store lookup by fingerprint: reuse in-flight scans unconditionally,
    /// completed ones while they are fresh. Failed and stale records fall
    /// through to a new submission.
    async fn cached(&self, fingerprint: &Fingerprint) -> Result<Option<ScanRecord>, ScanError> {
        let Some(existing) = self.store.get_by_fingerprint(&fingerprint.sha256).await? else {
            return Ok(None);
        };

        if !existing.is_terminal() {
            tracing::info!(
                scan_id = %existing.scan_id,
                fingerprint = fingerprint.short(),
                "Scan already in flight, reusing record"
            );
            return Ok(Some(existing));
        }

        if existing.state == ScanState::Completed
            && existing.age(Utc::now()) < self.config.freshness_window
        {
            tracing::info!(
                scan_id = %existing.scan_id,
                fingerprint = fingerprint.short(),
                "Returning fresh cached result"
            );
            return Ok(Some(existing));
        }

        Ok(None)
    }

    /// Create the record, resolving a duplicate-fingerprint conflict by
    /// returning the existing record instead of erroring. The outcome
    /// distinguishes the two cases: only `Created` entitles the caller to
    /// submit an aggregator job for this fingerprint.
    async fn create_or_resolve(
        &self,
        record: NewScanRecord,
        fingerprint: &Fingerprint,
    ) -> Result<CreateOutcome, ScanError> {
        match self.store.create(record).await {
            Ok(created) => Ok(CreateOutcome::Created(created)),
            Err(ScanError::DuplicateScan { .. }) => {
                tracing::debug!(
                    fingerprint = fingerprint.short(),
                    "Lost creation race, resolving to existing record"
                );
                self.store
                    .get_by_fingerprint(&fingerprint.sha256)
                    .await?
                    .map(CreateOutcome::Resolved)
                    .ok_or_else(|| {
                        ScanError::Store("conflicting record disappeared during resolution".into())
                    })
            }
            Err(e) => Err(e),
        }
    }

    /// Submission with a small bounded retry for transient errors only.
    async fn submit_upstream(
        &self,
        subject: &ScanSubject,
        bytes: Option<&[u8]>,
    ) -> Result<String, ScanError> {
        let mut delay = self.config.submit_retry_delay;
        let mut attempt: u32 = 1;
        loop {
            let result = match subject {
                ScanSubject::File { name, .. } => {
                    self.client.submit_file(name, bytes.unwrap_or_default()).await
                }
                ScanSubject::Url { url, .. } => self.client.submit_url(url).await,
            };
            match result {
                Ok(job_id) => return Ok(job_id),
                Err(e) if e.is_retryable() && attempt < self.config.submit_retries => {
                    tracing::warn!(
                        subject = %subject.label(),
                        attempt,
                        error = %e,
                        "Transient submission error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Result of a guarded create: either this call inserted the record, or
/// it lost the creation race and resolved to the record already on file.
enum CreateOutcome {
    Created(ScanRecord),
    Resolved(ScanRecord),
}

impl CreateOutcome {
    fn into_record(self) -> ScanRecord {
        match self {
            CreateOutcome::Created(record) | CreateOutcome::Resolved(record) => record,
        }
    }
}

/// Canonicalize a URL (lowercased scheme/host, default port and fragment
/// stripped) and derive its domain.
fn normalize_url(raw: &str) -> Result<(String, String), ScanError> {
    let mut url = Url::parse(raw)
        .map_err(|e| ScanError::Validation(format!("invalid URL '{raw}': {e}")))?;

    match url.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(ScanError::Validation(format!(
                "URL scheme '{scheme}' is not scannable (only http/https)"
            )));
        }
    }

    let domain = url
        .host_str()
        .ok_or_else(|| ScanError::Validation(format!("URL '{raw}' has no host")))?
        .to_string();

    url.set_fragment(None);
    Ok((url.to_string(), domain))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::*;

    fn orchestrator(
        store: MockResultStore,
        client: MockAggregator,
    ) -> ScanOrchestrator<MockResultStore, MockAggregator> {
        ScanOrchestrator::new(
            store,
            client,
            NotificationBus::new(),
            PollConfig::default().with_initial_delay(Duration::from_secs(1)),
            OrchestratorConfig::default(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn idempotent_submission_reuses_active_scan() {
        let store = MockResultStore::empty();
        let client = MockAggregator::new();
        let orch = orchestrator(store, client.clone());

        let first = orch
            .submit_file("sample.bin", b"hello world", None)
            .await
            .unwrap();
        let second = orch
            .submit_file("sample.bin", b"hello world", None)
            .await
            .unwrap();

        assert_eq!(first.scan_id, second.scan_id);
        assert_eq!(client.submit_count(), 1);
        assert_eq!(orch.scheduler().live_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_cache_hit_skips_aggregator_entirely() {
        let mut cached = make_test_record(ScanState::Completed);
        cached.report = Some(make_test_report());
        let store = MockResultStore::with_record(cached.clone());
        let client = MockAggregator::new();
        let orch = orchestrator(store, client.clone());

        // make_test_record fingerprints b"hello world".
        let record = orch
            .submit_file("sample.bin", b"hello world", None)
            .await
            .unwrap();

        assert_eq!(record.scan_id, cached.scan_id);
        assert_eq!(client.submit_count(), 0);
        assert!(client.report_calls.lock().unwrap().is_empty());
        assert_eq!(orch.scheduler().live_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_cached_result_triggers_resubmission() {
        let mut stale = make_test_record(ScanState::Completed);
        stale.updated_at = Utc::now() - TimeDelta::hours(48);
        let store = MockResultStore::with_record(stale.clone());
        let client = MockAggregator::new();
        let orch = orchestrator(store, client.clone());

        let record = orch
            .submit_file("sample.bin", b"hello world", None)
            .await
            .unwrap();

        assert_ne!(record.scan_id, stale.scan_id);
        assert_eq!(client.submit_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_record_is_not_served_from_cache() {
        let failed = make_test_record(ScanState::Failed);
        let store = MockResultStore::with_record(failed.clone());
        let client = MockAggregator::new();
        let orch = orchestrator(store, client.clone());

        let record = orch
            .submit_file("sample.bin", b"hello world", None)
            .await
            .unwrap();

        assert_ne!(record.scan_id, failed.scan_id);
        assert_eq!(client.submit_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn known_content_seeds_completed_record_without_submission() {
        let store = MockResultStore::empty();
        let client = MockAggregator::new().with_reports(vec![Ok(Some(make_test_report()))]);
        let orch = orchestrator(store, client.clone());

        let record = orch
            .submit_file("sample.bin", b"hello world", None)
            .await
            .unwrap();

        assert_eq!(record.state, ScanState::Completed);
        assert!(record.report.is_some());
        assert_eq!(client.submit_count(), 0);
        assert_eq!(orch.scheduler().live_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_rejection_returns_failed_record() {
        let store = MockResultStore::empty();
        let client = MockAggregator::new().with_submit_responses(vec![Err(ScanError::Upstream {
            message: "unsupported file type".into(),
            status_code: 400,
            retryable: false,
        })]);
        let orch = orchestrator(store, client.clone());

        let record = orch
            .submit_file("sample.bin", b"hello world", None)
            .await
            .unwrap();

        assert_eq!(record.state, ScanState::Failed);
        assert!(record.error.as_deref().unwrap().contains("unsupported file type"));
        assert_eq!(orch.scheduler().live_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_submission_errors_are_retried() {
        let store = MockResultStore::empty();
        let client = MockAggregator::new()
            .with_submit_responses(vec![Err(ScanError::Network("connection reset".into()))]);
        let orch = orchestrator(store, client.clone());

        let record = orch
            .submit_file("sample.bin", b"hello world", None)
            .await
            .unwrap();

        assert_eq!(record.state, ScanState::Pending);
        assert!(record.job_id.is_some());
        assert_eq!(client.submit_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_submission_retries_fail_the_scan() {
        let store = MockResultStore::empty();
        let client = MockAggregator::new().with_submit_responses(vec![
            Err(ScanError::Network("reset".into())),
            Err(ScanError::Network("reset".into())),
        ]);
        let orch = ScanOrchestrator::new(
            store,
            client.clone(),
            NotificationBus::new(),
            PollConfig::default(),
            OrchestratorConfig::default().with_submit_retries(2),
        );

        let record = orch
            .submit_file("sample.bin", b"hello world", None)
            .await
            .unwrap();

        assert_eq!(record.state, ScanState::Failed);
        assert_eq!(client.submit_count(), 2);
        assert_eq!(orch.scheduler().live_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn creation_race_loser_resolves_to_existing_record() {
        let winner = make_test_record(ScanState::Failed);
        let store = MockResultStore::with_create_error(ScanError::DuplicateScan {
            fingerprint: winner.fingerprint.sha256.clone(),
        });
        store.insert(winner.clone());
        let orch = orchestrator(store, MockAggregator::new());

        let record = orch
            .submit_file("sample.bin", b"hello world", None)
            .await
            .unwrap();

        // Resolved to the record on file instead of erroring.
        assert_eq!(record.scan_id, winner.scan_id);
    }

    #[tokio::test(start_paused = true)]
    async fn race_loser_never_submits_even_before_winner_binds_job_id() {
        // Tightest interleaving: the loser's dedupe lookup runs before the
        // winner's insert (scripted miss), its create then conflicts, and
        // the winner is still mid-submission (pending, no job id bound).
        let mut winner = make_test_record(ScanState::Pending);
        winner.job_id = None;
        let store = MockResultStore::with_create_error(ScanError::DuplicateScan {
            fingerprint: winner.fingerprint.sha256.clone(),
        })
        .with_fingerprint_miss();
        store.insert(winner.clone());
        let client = MockAggregator::new();
        let orch = orchestrator(store, client.clone());

        let record = orch
            .submit_file("sample.bin", b"hello world", None)
            .await
            .unwrap();

        // The loser resolves to the winner's record and must not create a
        // second, competing aggregator job.
        assert_eq!(record.scan_id, winner.scan_id);
        assert_eq!(client.submit_count(), 0);
        assert_eq!(orch.scheduler().live_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn url_submission_normalizes_and_dedupes() {
        let store = MockResultStore::empty();
        let client = MockAggregator::new();
        let orch = orchestrator(store, client.clone());

        let first = orch
            .submit_url("HTTP://Example.com/path#fragment")
            .await
            .unwrap();
        let second = orch.submit_url("http://example.com/path").await.unwrap();

        assert_eq!(first.scan_id, second.scan_id);
        assert_eq!(client.submit_count(), 1);
        match &first.subject {
            ScanSubject::Url { url, domain } => {
                assert_eq!(url, "http://example.com/path");
                assert_eq!(domain, "example.com");
            }
            other => panic!("expected URL subject, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn validation_errors_propagate_synchronously() {
        let orch = orchestrator(MockResultStore::empty(), MockAggregator::new());

        let err = orch.submit_file("", b"content", None).await.unwrap_err();
        assert!(matches!(err, ScanError::Validation(_)));

        let err = orch.submit_file("sample.bin", b"", None).await.unwrap_err();
        assert!(matches!(err, ScanError::Validation(_)));

        let err = orch.submit_url("not a url").await.unwrap_err();
        assert!(matches!(err, ScanError::Validation(_)));

        let err = orch.submit_url("ftp://example.com/file").await.unwrap_err();
        assert!(matches!(err, ScanError::Validation(_)));
    }

    #[tokio::test]
    async fn get_scan_status_is_a_pure_read() {
        let record = make_test_record(ScanState::Scanning);
        let store = MockResultStore::with_record(record.clone());
        let client = MockAggregator::new();
        let orch = orchestrator(store, client.clone());

        let found = orch.get_scan_status(record.scan_id).await.unwrap().unwrap();
        assert_eq!(found.scan_id, record.scan_id);
        assert_eq!(client.status_count(), 0);
        assert_eq!(orch.scheduler().live_count(), 0);

        let missing = orch.get_scan_status(Uuid::new_v4()).await.unwrap();
        assert!(missing.is_none());
    }

    #[test]
    fn normalize_url_strips_fragment_and_lowercases() {
        let (url, domain) = normalize_url("HTTPS://EXAMPLE.com/Path?q=1#frag").unwrap();
        assert_eq!(url, "https://example.com/Path?q=1");
        assert_eq!(domain, "example.com");
    }
}
