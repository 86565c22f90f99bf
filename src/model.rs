//! Core data model.
//!
//! A job groups many page audits. Each audit attempt is a run, identified by
//! the transport message id it was triggered by; that id is the idempotency
//! key for everything the worker writes.

use std::collections::BTreeMap;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Attribute carrying the parent job id.
pub const JOB_ID_ATTR: &str = "JobId";
/// Attribute carrying the page URL to audit.
pub const URL_ATTR: &str = "URL";
/// Attribute carrying the JSON-encoded Lighthouse option bag.
pub const OPTIONS_ATTR: &str = "LighthouseOptions";
/// Attribute set on dead-letter notifications.
pub const ERROR_MESSAGE_ATTR: &str = "ErrorMessage";

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Newtype for job ids. Opaque, assigned by whoever created the job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

/// Newtype for run ids. Always the transport message id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub String);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(&self.0)
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<&str> for RunId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ---------------------------------------------------------------------------
// Job counters
// ---------------------------------------------------------------------------

/// Per-job counters. Only ever incremented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CounterName {
    PageCountSuccess,
    PageCountError,
}

impl CounterName {
    /// Column backing this counter in the jobs table.
    pub fn column(self) -> &'static str {
        match self {
            CounterName::PageCountSuccess => "page_count_success",
            CounterName::PageCountError => "page_count_error",
        }
    }
}

impl std::fmt::Display for CounterName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CounterName::PageCountSuccess => "PageCountSuccess",
            CounterName::PageCountError => "PageCountError",
        };
        write!(f, "{s}")
    }
}

/// Snapshot of a job's counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub page_count_success: u64,
    pub page_count_error: u64,
}

impl JobCounts {
    pub fn get(&self, counter: CounterName) -> u64 {
        match counter {
            CounterName::PageCountSuccess => self.page_count_success,
            CounterName::PageCountError => self.page_count_error,
        }
    }

    pub(crate) fn add(&mut self, counter: CounterName, delta: u64) {
        match counter {
            CounterName::PageCountSuccess => self.page_count_success += delta,
            CounterName::PageCountError => self.page_count_error += delta,
        }
    }
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

/// One recorded audit attempt. At most one exists per run id, ever.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Run {
    pub run_id: RunId,
    pub job_id: JobId,
    pub url: Option<String>,
    /// Present only for runs that ended up in the dead-letter queue.
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Run {
    pub fn succeeded(run_id: RunId, job_id: JobId, url: impl Into<String>) -> Self {
        Self {
            run_id,
            job_id,
            url: Some(url.into()),
            error: None,
            created_at: Utc::now(),
        }
    }

    pub fn dead_lettered(
        run_id: RunId,
        job_id: JobId,
        url: Option<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            run_id,
            job_id,
            url,
            error: Some(error.into()),
            created_at: Utc::now(),
        }
    }

    /// The counter this run contributes to.
    pub fn counter(&self) -> CounterName {
        if self.error.is_some() {
            CounterName::PageCountError
        } else {
            CounterName::PageCountSuccess
        }
    }
}

// ---------------------------------------------------------------------------
// Notification
// ---------------------------------------------------------------------------

/// Inbound pub/sub envelope.
///
/// Primary notifications carry `JobId`, `URL` and `LighthouseOptions`
/// attributes. Dead-letter notifications carry the original envelope,
/// JSON-encoded, in `Message` plus an `ErrorMessage` attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Notification {
    pub topic_arn: String,
    pub message_id: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub message_attributes: BTreeMap<String, String>,
}

impl Notification {
    /// Build a fresh audit request for `topic` with a new message id.
    pub fn audit_request(
        topic: impl Into<String>,
        job_id: &JobId,
        url: impl Into<String>,
        options: &serde_json::Value,
    ) -> Self {
        let mut message_attributes = BTreeMap::new();
        message_attributes.insert(JOB_ID_ATTR.to_string(), job_id.0.clone());
        message_attributes.insert(URL_ATTR.to_string(), url.into());
        message_attributes.insert(OPTIONS_ATTR.to_string(), options.to_string());
        Self {
            topic_arn: topic.into(),
            message_id: uuid::Uuid::new_v4().to_string(),
            message: String::new(),
            message_attributes,
        }
    }

    /// Wrap an original envelope (raw JSON) into a dead-letter notification
    /// published on `topic`.
    pub fn dead_letter(
        topic: impl Into<String>,
        original_envelope: impl Into<String>,
        error_message: impl Into<String>,
    ) -> Self {
        let mut message_attributes = BTreeMap::new();
        message_attributes.insert(ERROR_MESSAGE_ATTR.to_string(), error_message.into());
        Self {
            topic_arn: topic.into(),
            message_id: uuid::Uuid::new_v4().to_string(),
            message: original_envelope.into(),
            message_attributes,
        }
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.message_attributes.get(name).map(String::as_str)
    }

    pub fn run_id(&self) -> RunId {
        RunId(self.message_id.clone())
    }
}

// ---------------------------------------------------------------------------
// Audit request
// ---------------------------------------------------------------------------

/// Unit of work extracted from a primary notification. Never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditRequest {
    pub job_id: JobId,
    pub run_id: RunId,
    pub url: String,
    pub options: serde_json::Map<String, serde_json::Value>,
}

impl AuditRequest {
    /// Extract the request. Missing or malformed attributes are an error;
    /// an absent option bag means "engine defaults".
    pub fn from_notification(notification: &Notification) -> Result<Self> {
        let job_id = non_empty(notification, JOB_ID_ATTR)?;
        let url = non_empty(notification, URL_ATTR)?;
        if notification.message_id.is_empty() {
            return Err(Error::MalformedNotification(
                "notification has an empty message id".to_string(),
            ));
        }

        let options = match notification.attribute(OPTIONS_ATTR) {
            None | Some("") => serde_json::Map::new(),
            Some(raw) => match serde_json::from_str::<serde_json::Value>(raw) {
                Ok(serde_json::Value::Object(map)) => map,
                Ok(serde_json::Value::Null) => serde_json::Map::new(),
                Ok(other) => {
                    return Err(Error::MalformedNotification(format!(
                        "{OPTIONS_ATTR} must be a JSON object, got {other}"
                    )));
                }
                Err(e) => {
                    return Err(Error::MalformedNotification(format!(
                        "{OPTIONS_ATTR} is not valid JSON: {e}"
                    )));
                }
            },
        };

        Ok(Self {
            job_id: JobId(job_id.to_string()),
            run_id: notification.run_id(),
            url: url.to_string(),
            options,
        })
    }
}

fn non_empty<'a>(notification: &'a Notification, name: &str) -> Result<&'a str> {
    match notification.attribute(name) {
        Some(value) if !value.is_empty() => Ok(value),
        _ => Err(Error::MalformedNotification(format!(
            "missing {name} attribute on message {}",
            notification.message_id
        ))),
    }
}

// ---------------------------------------------------------------------------
// Dead letter
// ---------------------------------------------------------------------------

/// Contents of a dead-letter notification.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetter {
    /// The original notification, if its envelope could be decoded.
    pub original: Option<Notification>,
    pub error_message: Option<String>,
}

impl DeadLetter {
    pub fn from_notification(notification: &Notification) -> Self {
        Self {
            original: serde_json::from_str(&notification.message).ok(),
            error_message: notification
                .attribute(ERROR_MESSAGE_ATTR)
                .map(str::to_string),
        }
    }

    /// The original notification and its job id, if both are usable.
    pub fn original_job(&self) -> Option<(&Notification, JobId)> {
        let original = self.original.as_ref()?;
        let job_id = original
            .attribute(JOB_ID_ATTR)
            .filter(|id| !id.is_empty() && !original.message_id.is_empty())?;
        Some((original, JobId(job_id.to_string())))
    }

    /// Error text stored on the run record. Never empty.
    pub fn run_error(&self) -> String {
        let message = self.error_message.as_deref().unwrap_or("unknown error");
        format!(
            "ended up in dlq: {}",
            serde_json::Value::String(message.to_string())
        )
    }
}

// ---------------------------------------------------------------------------
// Report artifacts
// ---------------------------------------------------------------------------

/// Output formats requested from the audit engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReportFormat {
    Json,
    Html,
}

impl ReportFormat {
    pub const ALL: [ReportFormat; 2] = [ReportFormat::Json, ReportFormat::Html];

    pub fn extension(self) -> &'static str {
        match self {
            ReportFormat::Json => "json",
            ReportFormat::Html => "html",
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            ReportFormat::Json => "application/json",
            ReportFormat::Html => "text/html",
        }
    }

    /// Deterministic object key: `reports/<fmt>/jobs/<job>/runs/<run>.<fmt>`.
    pub fn object_key(self, job_id: &JobId, run_id: &RunId) -> String {
        let ext = self.extension();
        format!("reports/{ext}/jobs/{job_id}/runs/{run_id}.{ext}")
    }
}

/// Structured and human-readable reports for one audit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportArtifacts {
    pub json: Bytes,
    pub html: Bytes,
}

impl ReportArtifacts {
    pub fn get(&self, format: ReportFormat) -> &Bytes {
        match format {
            ReportFormat::Json => &self.json,
            ReportFormat::Html => &self.html,
        }
    }
}

// ---------------------------------------------------------------------------
// Processing stage
// ---------------------------------------------------------------------------

/// Stages of the primary path for one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Attributes extracted.
    Received,
    /// Cheap (eventually-consistent) dedup read passed.
    DedupChecked1,
    /// Audit engine running.
    AuditRunning,
    /// Strongly-consistent dedup read passed.
    DedupChecked2,
    /// Artifacts uploaded (or upload failure logged).
    Persisted,
    /// Counter incremented and run inserted. Terminal.
    Recorded,
    /// Duplicate detected at either dedup check. Terminal.
    Skipped,
}

impl Stage {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: Stage) -> bool {
        use Stage::*;
        matches!(
            (self, to),
            (Received, DedupChecked1)
                | (Received, Skipped)
                | (DedupChecked1, AuditRunning)
                | (AuditRunning, DedupChecked2)
                | (AuditRunning, Skipped)
                | (DedupChecked2, Persisted)
                | (Persisted, Recorded)
                | (Persisted, Skipped) // conditional insert lost
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Recorded | Stage::Skipped)
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Stage::Received => "received",
            Stage::DedupChecked1 => "dedup_checked_1",
            Stage::AuditRunning => "audit_running",
            Stage::DedupChecked2 => "dedup_checked_2",
            Stage::Persisted => "persisted",
            Stage::Recorded => "recorded",
            Stage::Skipped => "skipped",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Disposition
// ---------------------------------------------------------------------------

/// Why a delivery was skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The cheap pre-check already saw a run record.
    AlreadyRecorded,
    /// Another delivery recorded the run while this one was auditing.
    LostRace,
}

/// Outcome of one successfully handled notification. Every variant means
/// "acknowledge, do not redeliver".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Recorded,
    Skipped(SkipReason),
    DeadLettered,
    /// Dead letter without a usable job id; nothing to attach bookkeeping to.
    Dropped,
}

impl Disposition {
    pub fn as_str(self) -> &'static str {
        match self {
            Disposition::Recorded => "recorded",
            Disposition::Skipped(SkipReason::AlreadyRecorded) => "skipped_duplicate",
            Disposition::Skipped(SkipReason::LostRace) => "skipped_race",
            Disposition::DeadLettered => "dead_lettered",
            Disposition::Dropped => "dropped",
        }
    }
}
