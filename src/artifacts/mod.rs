//! Report artifact storage.
//!
//! Reports are written under deterministic keys, so re-uploading the same
//! run simply overwrites identical objects.

pub mod http;
pub mod local;
pub mod memory;

use async_trait::async_trait;
use bytes::Bytes;
use opentelemetry::KeyValue;
use tracing::debug;

use crate::error::Result;
use crate::model::{JobId, ReportArtifacts, ReportFormat, RunId};
use crate::telemetry::metrics;

pub use http::HttpArtifactStore;
pub use local::LocalArtifactStore;
pub use memory::MemoryArtifactStore;

/// Durable object storage for report artifacts.
#[async_trait]
pub trait ArtifactStore: Send + Sync + 'static {
    /// Write `data` at `key`, replacing any existing object.
    async fn put(&self, key: &str, data: Bytes, content_type: &str) -> Result<()>;
}

/// Upload both reports of a run concurrently.
///
/// Both uploads are attempted even if one fails; the first error is returned.
pub async fn upload_reports(
    store: &dyn ArtifactStore,
    job_id: &JobId,
    run_id: &RunId,
    reports: &ReportArtifacts,
) -> Result<()> {
    let upload = |format: ReportFormat| {
        let key = format.object_key(job_id, run_id);
        let data = reports.get(format).clone();
        async move {
            let result = store.put(&key, data, format.content_type()).await;
            metrics::artifact_uploads().add(
                1,
                &[
                    KeyValue::new("format", format.extension()),
                    KeyValue::new("result", if result.is_ok() { "ok" } else { "error" }),
                ],
            );
            if result.is_ok() {
                debug!(%key, "report uploaded");
            }
            result
        }
    };

    let (json, html) = tokio::join!(upload(ReportFormat::Json), upload(ReportFormat::Html));
    json.and(html)
}
