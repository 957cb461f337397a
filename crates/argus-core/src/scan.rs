use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::fingerprint::Fingerprint;

/// State of a scan in its lifecycle.
///
/// `Completed` and `Failed` are terminal; transitions are monotonic and
/// nothing moves a record out of a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanState {
    Pending,
    Scanning,
    Completed,
    Failed,
}

impl ScanState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanState::Pending => "pending",
            ScanState::Scanning => "scanning",
            ScanState::Completed => "completed",
            ScanState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ScanState::Completed | ScanState::Failed)
    }
}

impl fmt::Display for ScanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ScanState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(ScanState::Pending),
            "scanning" => Ok(ScanState::Scanning),
            "completed" => Ok(ScanState::Completed),
            "failed" => Ok(ScanState::Failed),
            _ => Err(format!("Unknown scan state: {}", s)),
        }
    }
}

/// What was submitted for scanning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ScanSubject {
    File {
        name: String,
        size: u64,
        media_type: Option<String>,
    },
    Url {
        url: String,
        domain: String,
    },
}

impl ScanSubject {
    /// Short label for log fields.
    pub fn label(&self) -> &str {
        match self {
            ScanSubject::File { name, .. } => name,
            ScanSubject::Url { url, .. } => url,
        }
    }
}

/// Category assigned by a single engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VerdictCategory {
    Harmless,
    Undetected,
    Suspicious,
    Malicious,
    Timeout,
    Failure,
    #[serde(other)]
    Unknown,
}

impl VerdictCategory {
    pub fn from_wire(s: &str) -> Self {
        match s {
            "harmless" => VerdictCategory::Harmless,
            "undetected" => VerdictCategory::Undetected,
            "suspicious" => VerdictCategory::Suspicious,
            "malicious" => VerdictCategory::Malicious,
            "timeout" | "confirmed-timeout" => VerdictCategory::Timeout,
            "failure" | "type-unsupported" => VerdictCategory::Failure,
            _ => VerdictCategory::Unknown,
        }
    }
}

/// One engine's verdict, validated at the client boundary into a single
/// well-typed shape (no downstream "does this field exist" checks).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineVerdict {
    pub category: VerdictCategory,
    /// Engine-specific detail string (e.g. the malware family name).
    pub result: Option<String>,
    /// Detection method reported by the engine.
    pub method: Option<String>,
}

/// Aggregate counts per verdict category.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerdictSummary {
    pub harmless: u32,
    pub undetected: u32,
    pub suspicious: u32,
    pub malicious: u32,
    pub timeout: u32,
    pub failure: u32,
}

impl VerdictSummary {
    /// Tally a verdict map. The aggregator also ships pre-computed stats,
    /// but the local tally over the validated map is authoritative.
    pub fn tally(verdicts: &BTreeMap<String, EngineVerdict>) -> Self {
        let mut summary = Self::default();
        for verdict in verdicts.values() {
            match verdict.category {
                VerdictCategory::Harmless => summary.harmless += 1,
                VerdictCategory::Undetected => summary.undetected += 1,
                VerdictCategory::Suspicious => summary.suspicious += 1,
                VerdictCategory::Malicious => summary.malicious += 1,
                VerdictCategory::Timeout => summary.timeout += 1,
                VerdictCategory::Failure | VerdictCategory::Unknown => summary.failure += 1,
            }
        }
        summary
    }

    pub fn total(&self) -> u32 {
        self.harmless + self.undetected + self.suspicious + self.malicious + self.timeout
            + self.failure
    }
}

/// Full result payload for a scan: per-engine verdicts plus aggregates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanReport {
    pub verdicts: BTreeMap<String, EngineVerdict>,
    pub summary: VerdictSummary,
    /// Threat signatures extracted by the aggregator, if any.
    #[serde(default)]
    pub signatures: Vec<String>,
    /// Link to the aggregator's hosted report.
    pub permalink: Option<String>,
}

impl ScanReport {
    pub fn from_verdicts(verdicts: BTreeMap<String, EngineVerdict>) -> Self {
        let summary = VerdictSummary::tally(&verdicts);
        Self {
            verdicts,
            summary,
            signatures: Vec::new(),
            permalink: None,
        }
    }

    /// A report with at least one engine verdict counts as finished work
    /// (the aggregator sometimes returns known-content stubs with none).
    pub fn has_verdicts(&self) -> bool {
        !self.verdicts.is_empty()
    }
}

/// The central entity: one scan of one piece of content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanRecord {
    /// Caller-visible id, immutable for the life of the scan.
    pub scan_id: Uuid,
    /// Aggregator-assigned job id; bound once, after submission succeeds.
    pub job_id: Option<String>,
    /// Immutable once computed.
    pub fingerprint: Fingerprint,
    pub subject: ScanSubject,
    pub state: ScanState,
    pub report: Option<ScanReport>,
    /// Human-readable reason, set only on `failed` records.
    pub error: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScanRecord {
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Age of the record relative to its last update.
    pub fn age(&self, now: DateTime<Utc>) -> chrono::TimeDelta {
        now - self.updated_at
    }
}

/// DTO for inserting a new scan record into the store.
///
/// The store assigns `scan_id` and both timestamps.
#[derive(Debug, Clone)]
pub struct NewScanRecord {
    pub fingerprint: Fingerprint,
    pub subject: ScanSubject,
    pub state: ScanState,
    pub job_id: Option<String>,
    pub report: Option<ScanReport>,
}

impl NewScanRecord {
    /// A freshly submitted scan with no results yet.
    pub fn pending(fingerprint: Fingerprint, subject: ScanSubject) -> Self {
        Self {
            fingerprint,
            subject,
            state: ScanState::Pending,
            job_id: None,
            report: None,
        }
    }

    /// A scan seeded directly from a finished aggregator report,
    /// skipping submission entirely.
    pub fn completed(fingerprint: Fingerprint, subject: ScanSubject, report: ScanReport) -> Self {
        Self {
            fingerprint,
            subject,
            state: ScanState::Completed,
            job_id: None,
            report: Some(report),
        }
    }
}

/// Idempotent snapshot patch applied through `ResultStore::update`.
///
/// Carries the full current payload, not a diff: last-write-wins is safe
/// because a newer snapshot fully supersedes an older one.
#[derive(Debug, Clone)]
pub struct ScanUpdate {
    pub state: ScanState,
    /// Aggregator job id, bound on the first update after submission.
    pub job_id: Option<String>,
    pub report: Option<ScanReport>,
    pub error: Option<String>,
    /// When this snapshot was observed. The store rejects patches older
    /// than the record's `updated_at`.
    pub observed_at: DateTime<Utc>,
}

impl ScanUpdate {
    pub fn state(state: ScanState) -> Self {
        Self {
            state,
            job_id: None,
            report: None,
            error: None,
            observed_at: Utc::now(),
        }
    }

    pub fn with_job_id(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    pub fn with_report(mut self, report: ScanReport) -> Self {
        self.report = Some(report);
        self
    }

    pub fn with_error(mut self, reason: impl Into<String>) -> Self {
        self.error = Some(reason.into());
        self
    }

    pub fn with_observed_at(mut self, at: DateTime<Utc>) -> Self {
        self.observed_at = at;
        self
    }
}

/// Job state as reported by the aggregator's status endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    Queued,
    InProgress,
    Completed,
    Failed { reason: String },
}

/// One fetch of the aggregator's job-status endpoint.
#[derive(Debug, Clone)]
pub struct JobSnapshot {
    pub state: JobState,
    pub report: Option<ScanReport>,
}

impl JobSnapshot {
    /// Map the aggregator's job state onto the scan state machine.
    ///
    /// A queued job that already carries partial engine results counts
    /// as `scanning`, not `pending`.
    pub fn scan_state(&self) -> ScanState {
        match &self.state {
            JobState::Completed => ScanState::Completed,
            JobState::Failed { .. } => ScanState::Failed,
            JobState::InProgress => ScanState::Scanning,
            JobState::Queued => {
                if self.report.as_ref().is_some_and(ScanReport::has_verdicts) {
                    ScanState::Scanning
                } else {
                    ScanState::Pending
                }
            }
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.scan_state().is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_state_roundtrip() {
        for state in [
            ScanState::Pending,
            ScanState::Scanning,
            ScanState::Completed,
            ScanState::Failed,
        ] {
            let s = state.as_str();
            let parsed: ScanState = s.parse().unwrap();
            assert_eq!(parsed, state);
        }
    }

    #[test]
    fn test_terminal_states() {
        assert!(!ScanState::Pending.is_terminal());
        assert!(!ScanState::Scanning.is_terminal());
        assert!(ScanState::Completed.is_terminal());
        assert!(ScanState::Failed.is_terminal());
    }

    #[test]
    fn test_summary_tally() {
        let mut verdicts = BTreeMap::new();
        verdicts.insert(
            "EngineA".to_string(),
            EngineVerdict {
                category: VerdictCategory::Malicious,
                result: Some("Trojan.Generic".into()),
                method: Some("blacklist".into()),
            },
        );
        verdicts.insert(
            "EngineB".to_string(),
            EngineVerdict {
                category: VerdictCategory::Harmless,
                result: None,
                method: None,
            },
        );
        verdicts.insert(
            "EngineC".to_string(),
            EngineVerdict {
                category: VerdictCategory::Undetected,
                result: None,
                method: Some("heuristic".into()),
            },
        );

        let summary = VerdictSummary::tally(&verdicts);
        assert_eq!(summary.malicious, 1);
        assert_eq!(summary.harmless, 1);
        assert_eq!(summary.undetected, 1);
        assert_eq!(summary.total(), 3);
    }

    #[test]
    fn test_category_from_wire() {
        assert_eq!(
            VerdictCategory::from_wire("malicious"),
            VerdictCategory::Malicious
        );
        assert_eq!(
            VerdictCategory::from_wire("confirmed-timeout"),
            VerdictCategory::Timeout
        );
        assert_eq!(
            VerdictCategory::from_wire("type-unsupported"),
            VerdictCategory::Failure
        );
        assert_eq!(
            VerdictCategory::from_wire("something-new"),
            VerdictCategory::Unknown
        );
    }

    #[test]
    fn test_queued_snapshot_with_partial_results_is_scanning() {
        let mut verdicts = BTreeMap::new();
        verdicts.insert(
            "EngineA".to_string(),
            EngineVerdict {
                category: VerdictCategory::Harmless,
                result: None,
                method: None,
            },
        );
        let snapshot = JobSnapshot {
            state: JobState::Queued,
            report: Some(ScanReport::from_verdicts(verdicts)),
        };
        assert_eq!(snapshot.scan_state(), ScanState::Scanning);

        let empty = JobSnapshot {
            state: JobState::Queued,
            report: None,
        };
        assert_eq!(empty.scan_state(), ScanState::Pending);
    }

    #[test]
    fn test_event_payload_serializes() {
        let report = ScanReport::from_verdicts(BTreeMap::new());
        let json = serde_json::to_value(&report).unwrap();
        assert!(json.get("verdicts").is_some());
        assert!(json.get("summary").is_some());
    }
}
