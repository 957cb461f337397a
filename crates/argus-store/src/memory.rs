use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use argus_core::error::ScanError;
use argus_core::scan::{NewScanRecord, ScanRecord, ScanUpdate};
use argus_core::traits::ResultStore;

#[derive(Default)]
struct Inner {
    records: HashMap<Uuid, ScanRecord>,
    /// Primary digest → scan ids, newest first.
    by_digest: HashMap<String, Vec<Uuid>>,
    by_job: HashMap<String, Uuid>,
}

/// In-memory keyed record store with secondary indexes on content
/// fingerprint and aggregator job id.
///
/// The single writer lock serializes all mutation, which is what makes
/// the conflict guard in `create` and the staleness guard in `update`
/// race-free across concurrent scans.
#[derive(Clone, Default)]
pub struct MemoryResultStore {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.records.is_empty()
    }
}

impl ResultStore for MemoryResultStore {
    async fn create(&self, record: NewScanRecord) -> Result<ScanRecord, ScanError> {
        let mut inner = self.inner.write().await;

        let digest = record.fingerprint.sha256.clone();
        if let Some(ids) = inner.by_digest.get(&digest) {
            let active = ids
                .iter()
                .filter_map(|id| inner.records.get(id))
                .any(|r| !r.is_terminal());
            if active {
                return Err(ScanError::DuplicateScan {
                    fingerprint: digest,
                });
            }
        }

        let now = Utc::now();
        let stored = ScanRecord {
            scan_id: Uuid::new_v4(),
            job_id: record.job_id,
            fingerprint: record.fingerprint,
            subject: record.subject,
            state: record.state,
            report: record.report,
            error: None,
            submitted_at: now,
            updated_at: now,
        };

        tracing::debug!(
            scan_id = %stored.scan_id,
            fingerprint = stored.fingerprint.short(),
            state = %stored.state,
            "Scan record created"
        );

        if let Some(job_id) = &stored.job_id {
            inner.by_job.insert(job_id.clone(), stored.scan_id);
        }
        inner
            .by_digest
            .entry(digest)
            .or_default()
            .insert(0, stored.scan_id);
        inner.records.insert(stored.scan_id, stored.clone());
        Ok(stored)
    }

    async fn get(&self, scan_id: Uuid) -> Result<Option<ScanRecord>, ScanError> {
        Ok(self.inner.read().await.records.get(&scan_id).cloned())
    }

    async fn get_by_fingerprint(&self, digest: &str) -> Result<Option<ScanRecord>, ScanError> {
        let inner = self.inner.read().await;
        Ok(inner
            .by_digest
            .get(digest)
            .and_then(|ids| ids.first())
            .and_then(|id| inner.records.get(id))
            .cloned())
    }

    async fn get_by_job_id(&self, job_id: &str) -> Result<Option<ScanRecord>, ScanError> {
        let inner = self.inner.read().await;
        Ok(inner
            .by_job
            .get(job_id)
            .and_then(|id| inner.records.get(id))
            .cloned())
    }

    async fn update(&self, scan_id: Uuid, update: ScanUpdate) -> Result<ScanRecord, ScanError> {
        let mut inner = self.inner.write().await;

        // Split borrow: the job index may need updating alongside the record.
        let Inner {
            records, by_job, ..
        } = &mut *inner;
        let record = records
            .get_mut(&scan_id)
            .ok_or(ScanError::NotFound(scan_id))?;

        // Terminal records never change (idempotent guard against
        // duplicated completion events).
        if record.is_terminal() {
            tracing::debug!(scan_id = %scan_id, state = %record.state, "Update ignored, record is terminal");
            return Ok(record.clone());
        }

        // Stale-write rejection: a slower, older poll result must not
        // overwrite a newer one.
        if record.updated_at > update.observed_at {
            tracing::debug!(scan_id = %scan_id, "Update ignored, stale snapshot");
            return Ok(record.clone());
        }

        record.state = update.state;
        if record.job_id.is_none()
            && let Some(job_id) = update.job_id
        {
            by_job.insert(job_id.clone(), scan_id);
            record.job_id = Some(job_id);
        }
        if update.report.is_some() {
            record.report = update.report;
        }
        if update.error.is_some() {
            record.error = update.error;
        }
        record.updated_at = update.observed_at;

        tracing::debug!(scan_id = %scan_id, state = %record.state, "Scan record updated");
        Ok(record.clone())
    }
}
