use std::collections::BTreeMap;
use std::time::Duration;

use argus_core::error::ScanError;
use argus_core::scan::{EngineVerdict, JobSnapshot, JobState, ScanReport, VerdictCategory};
use argus_core::traits::AggregatorClient;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, StatusCode};
use serde::Deserialize;

/// HTTP adapter for the threat-intelligence aggregator's REST API.
///
/// Submissions return an opaque job id; results become available only
/// after the aggregator's engines finish. Every call carries its own
/// short request-level timeout — retry policy lives in the poll
/// scheduler, not here.
#[derive(Clone, Debug)]
pub struct HttpAggregatorClient {
    client: Client,
    base_url: String,
    api_key: String,
    timeout_secs: u64,
}

impl HttpAggregatorClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self, ScanError> {
        Self::with_timeout(base_url, api_key, Duration::from_secs(30))
    }

    pub fn with_timeout(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ScanError> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(ScanError::Config("aggregator base URL must not be empty".into()));
        }

        let timeout_secs = timeout.as_secs();
        let client = Client::builder()
            .user_agent("Argus/0.1 (scan orchestrator)")
            .timeout(timeout)
            .build()
            .map_err(|e| ScanError::Network(e.to_string()))?;

        Ok(Self {
            client,
            base_url,
            api_key: api_key.into(),
            timeout_secs,
        })
    }

    fn map_transport_error(&self, e: reqwest::Error) -> ScanError {
        if e.is_timeout() {
            ScanError::Timeout(self.timeout_secs)
        } else if e.is_connect() {
            ScanError::Network(format!("Connection failed: {e}"))
        } else {
            ScanError::Network(e.to_string())
        }
    }

    async fn read_checked(&self, response: reqwest::Response) -> Result<String, ScanError> {
        let status = response.status();
        if !status.is_success() {
            return Err(upstream_error(status.as_u16()));
        }
        response
            .text()
            .await
            .map_err(|e| ScanError::Network(format!("Failed to read response body: {e}")))
    }
}

impl AggregatorClient for HttpAggregatorClient {
    async fn submit_file(&self, name: &str, bytes: &[u8]) -> Result<String, ScanError> {
        let part = Part::bytes(bytes.to_vec()).file_name(name.to_string());
        let form = Form::new().part("file", part);

        tracing::debug!(file = %name, size = bytes.len(), "Submitting file to aggregator");
        let response = self
            .client
            .post(format!("{}/files", self.base_url))
            .header("x-apikey", &self.api_key)
            .multipart(form)
            .send()
            .await
            .map_err(|e| self.map_transport_error(e))?;

        let body = self.read_checked(response).await?;
        parse_submission(&body)
    }

    async fn submit_url(&self, url: &str) -> Result<String, ScanError> {
        tracing::debug!(url = %url, "Submitting URL to aggregator");
        let response = self
            .client
            .post(format!("{}/urls", self.base_url))
            .header("x-apikey", &self.api_key)
            .form(&[("url", url)])
            .send()
            .await
            .map_err(|e| self.map_transport_error(e))?;

        let body = self.read_checked(response).await?;
        parse_submission(&body)
    }

    async fn fetch_status(&self, job_id: &str) -> Result<JobSnapshot, ScanError> {
        let response = self
            .client
            .get(format!("{}/analyses/{}", self.base_url, job_id))
            .header("x-apikey", &self.api_key)
            .send()
            .await
            .map_err(|e| self.map_transport_error(e))?;

        let body = self.read_checked(response).await?;
        parse_analysis(&body)
    }

    async fn fetch_report(&self, digest: &str) -> Result<Option<ScanReport>, ScanError> {
        let response = self
            .client
            .get(format!("{}/files/{}", self.base_url, digest))
            .header("x-apikey", &self.api_key)
            .send()
            .await
            .map_err(|e| self.map_transport_error(e))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body = self.read_checked(response).await?;
        parse_report(&body).map(Some)
    }
}

/// Map an upstream HTTP error status onto the error taxonomy: rate limits
/// and server errors are transient, everything else is a rejection.
fn upstream_error(status_code: u16) -> ScanError {
    match status_code {
        429 => ScanError::RateLimitExceeded,
        code if code >= 500 => ScanError::Upstream {
            message: "aggregator server error".into(),
            status_code: code,
            retryable: true,
        },
        code => ScanError::Upstream {
            message: "aggregator rejected the request".into(),
            status_code: code,
            retryable: false,
        },
    }
}

// ---------------------------------------------------------------------------
// Wire format
//
// The aggregator's per-engine result objects are heterogeneous (fields
// come and go per engine). They are validated here, once, into the core's
// typed verdict shape; nothing downstream inspects raw JSON.
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Deserialize)]
struct SubmissionData {
    id: String,
}

#[derive(Deserialize, Default)]
struct Links {
    #[serde(rename = "self")]
    self_link: Option<String>,
}

#[derive(Deserialize)]
struct AnalysisData {
    attributes: AnalysisAttributes,
    #[serde(default)]
    links: Links,
}

#[derive(Deserialize)]
struct AnalysisAttributes {
    status: String,
    #[serde(default)]
    results: BTreeMap<String, WireVerdict>,
}

#[derive(Deserialize)]
struct WireVerdict {
    category: Option<String>,
    result: Option<String>,
    method: Option<String>,
}

#[derive(Deserialize)]
struct ReportData {
    attributes: ReportAttributes,
    #[serde(default)]
    links: Links,
}

#[derive(Deserialize)]
struct ReportAttributes {
    #[serde(default)]
    last_analysis_results: BTreeMap<String, WireVerdict>,
    #[serde(default)]
    crowdsourced_yara_results: Vec<YaraMatch>,
}

#[derive(Deserialize)]
struct YaraMatch {
    rule_name: Option<String>,
}

fn convert_verdicts(wire: BTreeMap<String, WireVerdict>) -> BTreeMap<String, EngineVerdict> {
    wire.into_iter()
        .map(|(engine, v)| {
            let category = v
                .category
                .as_deref()
                .map(VerdictCategory::from_wire)
                .unwrap_or(VerdictCategory::Unknown);
            (
                engine,
                EngineVerdict {
                    category,
                    result: v.result,
                    method: v.method,
                },
            )
        })
        .collect()
}

fn parse_submission(body: &str) -> Result<String, ScanError> {
    let envelope: Envelope<SubmissionData> = serde_json::from_str(body)?;
    Ok(envelope.data.id)
}

fn parse_analysis(body: &str) -> Result<JobSnapshot, ScanError> {
    let envelope: Envelope<AnalysisData> = serde_json::from_str(body)?;
    let attributes = envelope.data.attributes;

    let state = match attributes.status.as_str() {
        "queued" => JobState::Queued,
        "in-progress" | "inprogress" => JobState::InProgress,
        "completed" => JobState::Completed,
        "failed" => JobState::Failed {
            reason: "aggregator reported the analysis as failed".into(),
        },
        other => {
            // Unknown statuses keep the poll loop alive rather than
            // failing a scan over a vocabulary change upstream.
            tracing::warn!(status = %other, "Unrecognized analysis status, treating as in-progress");
            JobState::InProgress
        }
    };

    let report = if attributes.results.is_empty() {
        None
    } else {
        let mut report = ScanReport::from_verdicts(convert_verdicts(attributes.results));
        report.permalink = envelope.data.links.self_link;
        Some(report)
    };

    Ok(JobSnapshot { state, report })
}

fn parse_report(body: &str) -> Result<ScanReport, ScanError> {
    let envelope: Envelope<ReportData> = serde_json::from_str(body)?;
    let attributes = envelope.data.attributes;

    let mut report = ScanReport::from_verdicts(convert_verdicts(attributes.last_analysis_results));
    report.signatures = attributes
        .crowdsourced_yara_results
        .into_iter()
        .filter_map(|m| m.rule_name)
        .collect();
    report.permalink = envelope.data.links.self_link;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_submission_extracts_job_id() -> anyhow::Result<()> {
        let body = r#"{"data": {"type": "analysis", "id": "MzY1YjRm=="}}"#;
        assert_eq!(parse_submission(body)?, "MzY1YjRm==");
        Ok(())
    }

    #[test]
    fn parse_submission_rejects_malformed_body() {
        let err = parse_submission(r#"{"unexpected": true}"#).unwrap_err();
        assert!(matches!(err, ScanError::Serialization(_)));
    }

    #[test]
    fn parse_analysis_queued_without_results() -> anyhow::Result<()> {
        let body = r#"{"data": {"attributes": {"status": "queued"}}}"#;
        let snapshot = parse_analysis(body)?;
        assert_eq!(snapshot.state, JobState::Queued);
        assert!(snapshot.report.is_none());
        Ok(())
    }

    #[test]
    fn parse_analysis_completed_with_heterogeneous_results() -> anyhow::Result<()> {
        let body = r#"{
            "data": {
                "attributes": {
                    "status": "completed",
                    "results": {
                        "EngineA": {"category": "malicious", "result": "Trojan.Agent", "method": "blacklist"},
                        "EngineB": {"category": "harmless", "result": null},
                        "EngineC": {"category": "brand-new-category"},
                        "EngineD": {}
                    }
                },
                "links": {"self": "https://aggregator.test/analyses/1"}
            }
        }"#;

        let snapshot = parse_analysis(body)?;
        assert_eq!(snapshot.state, JobState::Completed);

        let report = snapshot.report.unwrap();
        assert_eq!(
            report.verdicts["EngineA"].category,
            VerdictCategory::Malicious
        );
        assert_eq!(
            report.verdicts["EngineA"].result.as_deref(),
            Some("Trojan.Agent")
        );
        assert_eq!(
            report.verdicts["EngineB"].category,
            VerdictCategory::Harmless
        );
        // Unknown and missing categories both collapse to Unknown here,
        // so downstream code never re-inspects raw JSON.
        assert_eq!(report.verdicts["EngineC"].category, VerdictCategory::Unknown);
        assert_eq!(report.verdicts["EngineD"].category, VerdictCategory::Unknown);
        assert_eq!(report.summary.malicious, 1);
        assert_eq!(report.summary.harmless, 1);
        assert_eq!(
            report.permalink.as_deref(),
            Some("https://aggregator.test/analyses/1")
        );
        Ok(())
    }

    #[test]
    fn parse_analysis_unknown_status_keeps_polling() -> anyhow::Result<()> {
        let body = r#"{"data": {"attributes": {"status": "reanalyzing"}}}"#;
        let snapshot = parse_analysis(body)?;
        assert_eq!(snapshot.state, JobState::InProgress);
        Ok(())
    }

    #[test]
    fn parse_analysis_failed_status() -> anyhow::Result<()> {
        let body = r#"{"data": {"attributes": {"status": "failed"}}}"#;
        let snapshot = parse_analysis(body)?;
        assert!(matches!(snapshot.state, JobState::Failed { .. }));
        Ok(())
    }

    #[test]
    fn parse_report_collects_signatures_and_permalink() -> anyhow::Result<()> {
        let body = r#"{
            "data": {
                "attributes": {
                    "last_analysis_results": {
                        "EngineA": {"category": "malicious", "result": "Ransom.X", "method": "heuristic"}
                    },
                    "crowdsourced_yara_results": [
                        {"rule_name": "win_ransom_x"},
                        {"rule_name": null}
                    ]
                },
                "links": {"self": "https://aggregator.test/files/abc"}
            }
        }"#;

        let report = parse_report(body)?;
        assert!(report.has_verdicts());
        assert_eq!(report.signatures, vec!["win_ransom_x".to_string()]);
        assert_eq!(
            report.permalink.as_deref(),
            Some("https://aggregator.test/files/abc")
        );
        Ok(())
    }

    #[test]
    fn parse_report_without_results_is_an_unfinished_stub() -> anyhow::Result<()> {
        let body = r#"{"data": {"attributes": {}}}"#;
        let report = parse_report(body)?;
        assert!(!report.has_verdicts());
        Ok(())
    }

    #[test]
    fn upstream_status_classification() {
        assert!(matches!(upstream_error(429), ScanError::RateLimitExceeded));
        assert!(upstream_error(503).is_retryable());
        assert!(upstream_error(500).is_retryable());
        assert!(!upstream_error(400).is_retryable());
        assert!(!upstream_error(401).is_retryable());
    }

    #[test]
    fn client_rejects_empty_base_url() {
        let err = HttpAggregatorClient::new("", "key").unwrap_err();
        assert!(matches!(err, ScanError::Config(_)));
    }

    #[test]
    fn client_trims_trailing_slash() {
        let client = HttpAggregatorClient::new("https://aggregator.test/api/v3/", "key").unwrap();
        assert_eq!(client.base_url, "https://aggregator.test/api/v3");
    }
}
