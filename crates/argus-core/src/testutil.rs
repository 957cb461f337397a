//! Test utilities: mock implementations of the core traits.
//!
//! Handwritten mocks for dependency injection in unit and integration
//! tests. All mocks use `Arc<Mutex<_>>` for interior mutability, allowing
//! assertions on recorded calls.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use uuid::Uuid;

use crate::error::ScanError;
use crate::fingerprint::Fingerprint;
use crate::scan::{
    EngineVerdict, JobSnapshot, JobState, NewScanRecord, ScanRecord, ScanReport, ScanSubject,
    ScanUpdate, VerdictCategory,
};
use crate::traits::{AggregatorClient, ResultStore};

// ---------------------------------------------------------------------------
// MockAggregator
// ---------------------------------------------------------------------------

/// Mock aggregator with scripted responses and recorded calls.
///
/// Each scripted queue pops front-first; when a queue runs dry the mock
/// falls back to a benign default (`Ok(job id)`, in-progress status,
/// content unknown) so long-running poll loops keep turning.
#[derive(Clone, Default)]
pub struct MockAggregator {
    submit_responses: Arc<Mutex<Vec<Result<String, ScanError>>>>,
    status_responses: Arc<Mutex<Vec<Result<JobSnapshot, ScanError>>>>,
    report_responses: Arc<Mutex<Vec<Result<Option<ScanReport>, ScanError>>>>,
    /// Names/URLs passed to submit calls, in order.
    pub submitted: Arc<Mutex<Vec<String>>>,
    /// Job ids passed to fetch_status calls, in order.
    pub status_calls: Arc<Mutex<Vec<String>>>,
    /// Digests passed to fetch_report calls, in order.
    pub report_calls: Arc<Mutex<Vec<String>>>,
}

impl MockAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_statuses(self, responses: Vec<Result<JobSnapshot, ScanError>>) -> Self {
        *self.status_responses.lock().unwrap() = responses;
        self
    }

    pub fn with_reports(self, responses: Vec<Result<Option<ScanReport>, ScanError>>) -> Self {
        *self.report_responses.lock().unwrap() = responses;
        self
    }

    pub fn with_submit_responses(self, responses: Vec<Result<String, ScanError>>) -> Self {
        *self.submit_responses.lock().unwrap() = responses;
        self
    }

    pub fn submit_count(&self) -> usize {
        self.submitted.lock().unwrap().len()
    }

    pub fn status_count(&self) -> usize {
        self.status_calls.lock().unwrap().len()
    }
}

impl AggregatorClient for MockAggregator {
    async fn submit_file(&self, name: &str, _bytes: &[u8]) -> Result<String, ScanError> {
        let mut submitted = self.submitted.lock().unwrap();
        submitted.push(name.to_string());
        let n = submitted.len();
        drop(submitted);

        let mut responses = self.submit_responses.lock().unwrap();
        if responses.is_empty() {
            Ok(format!("job-{n}"))
        } else {
            responses.remove(0)
        }
    }

    async fn submit_url(&self, url: &str) -> Result<String, ScanError> {
        let mut submitted = self.submitted.lock().unwrap();
        submitted.push(url.to_string());
        let n = submitted.len();
        drop(submitted);

        let mut responses = self.submit_responses.lock().unwrap();
        if responses.is_empty() {
            Ok(format!("job-{n}"))
        } else {
            responses.remove(0)
        }
    }

    async fn fetch_status(&self, job_id: &str) -> Result<JobSnapshot, ScanError> {
        self.status_calls.lock().unwrap().push(job_id.to_string());

        let mut responses = self.status_responses.lock().unwrap();
        if responses.is_empty() {
            Ok(JobSnapshot {
                state: JobState::InProgress,
                report: None,
            })
        } else {
            responses.remove(0)
        }
    }

    async fn fetch_report(&self, digest: &str) -> Result<Option<ScanReport>, ScanError> {
        self.report_calls.lock().unwrap().push(digest.to_string());

        let mut responses = self.report_responses.lock().unwrap();
        if responses.is_empty() {
            Ok(None)
        } else {
            responses.remove(0)
        }
    }
}

// ---------------------------------------------------------------------------
// MockResultStore
// ---------------------------------------------------------------------------

/// Vec-backed store implementing the full create/update contract,
/// including the duplicate-fingerprint and stale-write guards.
#[derive(Clone, Default)]
pub struct MockResultStore {
    records: Arc<Mutex<Vec<ScanRecord>>>,
    create_errors: Arc<Mutex<Vec<ScanError>>>,
    /// Scripted misses: the next N fingerprint lookups return `Ok(None)`
    /// regardless of contents, to stage lookup/create interleavings.
    fingerprint_misses: Arc<Mutex<u32>>,
    /// Every update patch passed in, applied or not.
    pub updates: Arc<Mutex<Vec<ScanUpdate>>>,
}

impl MockResultStore {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Store pre-seeded with an existing record (e.g. a cached result).
    pub fn with_record(record: ScanRecord) -> Self {
        let store = Self::default();
        store.records.lock().unwrap().push(record);
        store
    }

    /// Store whose next create call fails with the given error.
    pub fn with_create_error(error: ScanError) -> Self {
        let store = Self::default();
        store.create_errors.lock().unwrap().push(error);
        store
    }

    /// Make the next fingerprint lookup miss even if a record exists.
    pub fn with_fingerprint_miss(self) -> Self {
        *self.fingerprint_misses.lock().unwrap() += 1;
        self
    }

    pub fn insert(&self, record: ScanRecord) {
        self.records.lock().unwrap().push(record);
    }

    pub fn record_count(&self) -> usize {
        self.records.lock().unwrap().len()
    }
}

impl ResultStore for MockResultStore {
    async fn create(&self, record: NewScanRecord) -> Result<ScanRecord, ScanError> {
        let mut errors = self.create_errors.lock().unwrap();
        if !errors.is_empty() {
            return Err(errors.remove(0));
        }
        drop(errors);

        let mut records = self.records.lock().unwrap();
        if records
            .iter()
            .any(|r| r.fingerprint.sha256 == record.fingerprint.sha256 && !r.is_terminal())
        {
            return Err(ScanError::DuplicateScan {
                fingerprint: record.fingerprint.sha256,
            });
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
        records.push(stored.clone());
        Ok(stored)
    }

    async fn get(&self, scan_id: Uuid) -> Result<Option<ScanRecord>, ScanError> {
        let records = self.records.lock().unwrap();
        Ok(records.iter().find(|r| r.scan_id == scan_id).cloned())
    }

    async fn get_by_fingerprint(&self, digest: &str) -> Result<Option<ScanRecord>, ScanError> {
        let mut misses = self.fingerprint_misses.lock().unwrap();
        if *misses > 0 {
            *misses -= 1;
            return Ok(None);
        }
        drop(misses);

        let records = self.records.lock().unwrap();
        Ok(records
            .iter()
            .rev()
            .find(|r| r.fingerprint.sha256 == digest)
            .cloned())
    }

    async fn get_by_job_id(&self, job_id: &str) -> Result<Option<ScanRecord>, ScanError> {
        let records = self.records.lock().unwrap();
        Ok(records
            .iter()
            .find(|r| r.job_id.as_deref() == Some(job_id))
            .cloned())
    }

    async fn update(&self, scan_id: Uuid, update: ScanUpdate) -> Result<ScanRecord, ScanError> {
        self.updates.lock().unwrap().push(update.clone());

        let mut records = self.records.lock().unwrap();
        let record = records
            .iter_mut()
            .find(|r| r.scan_id == scan_id)
            .ok_or(ScanError::NotFound(scan_id))?;

        if record.is_terminal() || record.updated_at > update.observed_at {
            return Ok(record.clone());
        }

        record.state = update.state;
        if record.job_id.is_none() {
            record.job_id = update.job_id;
        }
        if update.report.is_some() {
            record.report = update.report;
        }
        if update.error.is_some() {
            record.error = update.error;
        }
        record.updated_at = update.observed_at;
        Ok(record.clone())
    }
}

// ---------------------------------------------------------------------------
// Test helpers
// ---------------------------------------------------------------------------

/// A finished report with one malicious and one harmless verdict.
pub fn make_test_report() -> ScanReport {
    let mut verdicts = BTreeMap::new();
    verdicts.insert(
        "EngineA".to_string(),
        EngineVerdict {
            category: VerdictCategory::Malicious,
            result: Some("Trojan.Test".into()),
            method: Some("blacklist".into()),
        },
    );
    verdicts.insert(
        "EngineB".to_string(),
        EngineVerdict {
            category: VerdictCategory::Harmless,
            result: None,
            method: Some("signature".into()),
        },
    );
    ScanReport::from_verdicts(verdicts)
}

pub fn make_file_subject() -> ScanSubject {
    ScanSubject::File {
        name: "sample.bin".to_string(),
        size: 11,
        media_type: Some("application/octet-stream".to_string()),
    }
}

/// Create a stored record directly, bypassing the orchestrator.
pub fn make_test_record(state: crate::scan::ScanState) -> ScanRecord {
    let now = Utc::now();
    ScanRecord {
        scan_id: Uuid::new_v4(),
        job_id: Some("job-1".to_string()),
        fingerprint: Fingerprint::of_bytes(b"hello world"),
        subject: make_file_subject(),
        state,
        report: None,
        error: None,
        submitted_at: now,
        updated_at: now,
    }
}

/// Status snapshot helpers for scripting [`MockAggregator`].
pub fn queued() -> Result<JobSnapshot, ScanError> {
    Ok(JobSnapshot {
        state: JobState::Queued,
        report: None,
    })
}

pub fn in_progress() -> Result<JobSnapshot, ScanError> {
    Ok(JobSnapshot {
        state: JobState::InProgress,
        report: None,
    })
}

pub fn completed(report: ScanReport) -> Result<JobSnapshot, ScanError> {
    Ok(JobSnapshot {
        state: JobState::Completed,
        report: Some(report),
    })
}

pub fn job_failed(reason: &str) -> Result<JobSnapshot, ScanError> {
    Ok(JobSnapshot {
        state: JobState::Failed {
            reason: reason.to_string(),
        },
        report: None,
    })
}

pub fn transient_error() -> Result<JobSnapshot, ScanError> {
    Err(ScanError::Network("connection reset".into()))
}
