use std::future::Future;

use uuid::Uuid;

use crate::error::ScanError;
use crate::scan::{JobSnapshot, NewScanRecord, ScanRecord, ScanReport, ScanUpdate};

/// Persists and retrieves scan records.
///
/// The store is the single source of truth and the only shared mutable
/// resource: all scan-state mutation funnels through `create`/`update`,
/// which own the conflict and staleness guards.
pub trait ResultStore: Send + Sync + Clone {
    /// Insert a new record and assign its scan id.
    ///
    /// Fails with [`ScanError::DuplicateScan`] if an active (non-terminal)
    /// record already exists for the same fingerprint — callers must
    /// resolve the conflict by returning the existing record.
    fn create(
        &self,
        record: NewScanRecord,
    ) -> impl Future<Output = Result<ScanRecord, ScanError>> + Send;

    fn get(
        &self,
        scan_id: Uuid,
    ) -> impl Future<Output = Result<Option<ScanRecord>, ScanError>> + Send;

    /// Look up by primary content digest, most recent first if duplicates exist.
    fn get_by_fingerprint(
        &self,
        digest: &str,
    ) -> impl Future<Output = Result<Option<ScanRecord>, ScanError>> + Send;

    fn get_by_job_id(
        &self,
        job_id: &str,
    ) -> impl Future<Output = Result<Option<ScanRecord>, ScanError>> + Send;

    /// Apply an idempotent snapshot patch and return the stored record.
    ///
    /// A no-op on records already in a terminal state, and on patches whose
    /// `observed_at` is older than the stored `updated_at` (stale-write
    /// rejection); both return the stored record unchanged.
    fn update(
        &self,
        scan_id: Uuid,
        update: ScanUpdate,
    ) -> impl Future<Output = Result<ScanRecord, ScanError>> + Send;
}

/// Abstracts the external threat-intelligence aggregator.
///
/// All calls are remote and may fail transiently; retry policy lives in
/// the poll scheduler, not here. Implementations map transport failures
/// onto [`ScanError`] so that [`ScanError::is_retryable`] distinguishes
/// transient from permanent upstream errors.
pub trait AggregatorClient: Send + Sync + Clone {
    /// Submit file content for analysis. Returns the aggregator's job id.
    fn submit_file(
        &self,
        name: &str,
        bytes: &[u8],
    ) -> impl Future<Output = Result<String, ScanError>> + Send;

    /// Submit a URL for analysis. Returns the aggregator's job id.
    fn submit_url(&self, url: &str) -> impl Future<Output = Result<String, ScanError>> + Send;

    /// Fetch the current status (and any partial results) of a job.
    fn fetch_status(
        &self,
        job_id: &str,
    ) -> impl Future<Output = Result<JobSnapshot, ScanError>> + Send;

    /// Cheap by-fingerprint lookup for content the aggregator already knows.
    ///
    /// `Ok(None)` means the content is not known; that is not an error.
    fn fetch_report(
        &self,
        digest: &str,
    ) -> impl Future<Output = Result<Option<ScanReport>, ScanError>> + Send;
}
