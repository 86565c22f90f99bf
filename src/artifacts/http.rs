//! HTTP object store client.
//!
//! Speaks the lowest common denominator of S3/GCS-compatible gateways:
//! `PUT {endpoint}/{bucket}/{key}` with the object as the body.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::CONTENT_TYPE;

use super::ArtifactStore;
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct HttpArtifactStore {
    client: reqwest::Client,
    endpoint: String,
    bucket: String,
}

impl HttpArtifactStore {
    pub fn new(endpoint: impl Into<String>, bucket: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            bucket: bucket.into(),
        })
    }

    pub fn object_url(&self, key: &str) -> String {
        format!("{}/{}/{}", self.endpoint, self.bucket, key)
    }
}

#[async_trait]
impl ArtifactStore for HttpArtifactStore {
    async fn put(&self, key: &str, data: Bytes, content_type: &str) -> Result<()> {
        let response = self
            .client
            .put(self.object_url(key))
            .header(CONTENT_TYPE, content_type)
            .body(data)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(Error::Artifact {
                key: key.to_string(),
                reason: format!("object store returned {status}: {body}"),
            })
        }
    }
}
