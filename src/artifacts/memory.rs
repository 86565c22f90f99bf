//! In-memory artifact store with injectable failures, for tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;

use super::ArtifactStore;
use crate::error::{Error, Result};

/// A stored object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub data: Bytes,
    pub content_type: String,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryArtifactStore {
    objects: Arc<Mutex<HashMap<String, StoredObject>>>,
    fail_prefixes: Arc<Mutex<Vec<String>>>,
    puts: Arc<Mutex<usize>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every put whose key starts with `prefix`.
    pub fn inject_failure(&self, prefix: impl Into<String>) {
        lock(&self.fail_prefixes).push(prefix.into());
    }

    pub fn get(&self, key: &str) -> Option<StoredObject> {
        lock(&self.objects).get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = lock(&self.objects).keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Number of put attempts, failed ones included.
    pub fn put_count(&self) -> usize {
        *lock(&self.puts)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn put(&self, key: &str, data: Bytes, content_type: &str) -> Result<()> {
        *lock(&self.puts) += 1;
        if lock(&self.fail_prefixes).iter().any(|p| key.starts_with(p)) {
            return Err(Error::Artifact {
                key: key.to_string(),
                reason: "injected failure".to_string(),
            });
        }
        lock(&self.objects).insert(
            key.to_string(),
            StoredObject {
                data,
                content_type: content_type.to_string(),
            },
        );
        Ok(())
    }
}
