//! Audit execution.
//!
//! The audit engine is a black box: give it a URL and an option bag, get
//! back the JSON and HTML reports plus a handle on the resources it holds
//! (a browser process, a scratch directory). The handle must be released
//! whatever happens next, including when the run turns out to be a
//! duplicate and its reports are thrown away.

pub mod lighthouse;

use async_trait::async_trait;
use tracing::warn;

use crate::error::Result;
use crate::model::ReportArtifacts;

pub use lighthouse::{LighthouseConfig, LighthouseEngine};

/// Resources held by a finished audit until they are released.
///
/// Implementations must also release on drop, so early returns and
/// panics between the audit and the explicit release do not leak.
#[async_trait]
pub trait EngineHandle: Send + Sync {
    /// Tear the engine down. Idempotent.
    async fn release(&mut self) -> Result<()>;
}

/// Reports of a finished audit plus the handle on its engine.
pub struct AuditSession {
    pub reports: ReportArtifacts,
    handle: Box<dyn EngineHandle>,
}

impl AuditSession {
    pub fn new(reports: ReportArtifacts, handle: Box<dyn EngineHandle>) -> Self {
        Self { reports, handle }
    }

    /// Release the engine. Failures are logged; there is nothing left to retry.
    pub async fn release(mut self) {
        if let Err(e) = self.handle.release().await {
            warn!(error = %e, "failed to release audit engine");
        }
    }
}

impl std::fmt::Debug for AuditSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditSession")
            .field("json_bytes", &self.reports.json.len())
            .field("html_bytes", &self.reports.html.len())
            .finish_non_exhaustive()
    }
}

/// Performs a network-bound page audit.
#[async_trait]
pub trait AuditEngine: Send + Sync + 'static {
    /// Audit `url`. `options` already includes the requested output formats.
    async fn run(
        &self,
        url: &str,
        options: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<AuditSession>;
}

/// Caller options plus a forced request for JSON and HTML output.
pub fn merge_options(
    options: &serde_json::Map<String, serde_json::Value>,
) -> serde_json::Map<String, serde_json::Value> {
    let mut merged = options.clone();
    merged.insert("output".to_string(), serde_json::json!(["json", "html"]));
    merged
}
