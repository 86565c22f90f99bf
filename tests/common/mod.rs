//! Shared fakes for router and worker tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use audit_worker::artifacts::MemoryArtifactStore;
use audit_worker::audit::{AuditEngine, AuditSession, EngineHandle};
use audit_worker::error::{Error, Result};
use audit_worker::model::{JOB_ID_ATTR, Notification, OPTIONS_ATTR, ReportArtifacts, URL_ATTR};
use audit_worker::router::{MessageRouter, RouterConfig};
use audit_worker::store::MemoryStore;
use bytes::Bytes;
use tokio::sync::Barrier;

pub const AUDIT_TOPIC: &str = "page_audits";
pub const DLQ_TOPIC: &str = "page_audits_dlq";

type RunHook = Box<dyn Fn() + Send + Sync>;

/// Scripted audit engine that counts runs and handle releases.
#[derive(Default)]
pub struct FakeEngine {
    runs: AtomicUsize,
    released: Arc<AtomicUsize>,
    dropped_unreleased: Arc<AtomicUsize>,
    seen_options: Mutex<Vec<serde_json::Map<String, serde_json::Value>>>,
    fail_with: Option<String>,
    barrier: Option<Barrier>,
    on_run: Option<RunHook>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every run fails with an audit error.
    pub fn failing(message: &str) -> Self {
        Self {
            fail_with: Some(message.to_string()),
            ..Self::default()
        }
    }

    /// Runs block until `n` of them are in flight together.
    pub fn rendezvous(n: usize) -> Self {
        Self {
            barrier: Some(Barrier::new(n)),
            ..Self::default()
        }
    }

    /// Call `hook` while the audit is "running".
    pub fn with_hook(hook: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            on_run: Some(Box::new(hook)),
            ..Self::default()
        }
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    pub fn dropped_unreleased(&self) -> usize {
        self.dropped_unreleased.load(Ordering::SeqCst)
    }

    pub fn seen_options(&self) -> Vec<serde_json::Map<String, serde_json::Value>> {
        self.seen_options.lock().unwrap().clone()
    }
}

#[async_trait]
impl AuditEngine for FakeEngine {
    async fn run(
        &self,
        url: &str,
        options: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<AuditSession> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        self.seen_options.lock().unwrap().push(options.clone());
        if let Some(ref barrier) = self.barrier {
            barrier.wait().await;
        }
        if let Some(ref hook) = self.on_run {
            hook();
        }
        if let Some(ref message) = self.fail_with {
            return Err(Error::Audit(message.clone()));
        }
        let reports = ReportArtifacts {
            json: Bytes::from(format!("{{\"requestedUrl\":\"{url}\"}}")),
            html: Bytes::from(format!("<html><body>{url}</body></html>")),
        };
        let handle = FakeHandle {
            released: Arc::clone(&self.released),
            dropped_unreleased: Arc::clone(&self.dropped_unreleased),
            done: false,
        };
        Ok(AuditSession::new(reports, Box::new(handle)))
    }
}

struct FakeHandle {
    released: Arc<AtomicUsize>,
    dropped_unreleased: Arc<AtomicUsize>,
    done: bool,
}

#[async_trait]
impl EngineHandle for FakeHandle {
    async fn release(&mut self) -> Result<()> {
        if !self.done {
            self.done = true;
            self.released.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

impl Drop for FakeHandle {
    fn drop(&mut self) {
        if !self.done {
            self.dropped_unreleased.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Router wired to in-memory collaborators.
pub struct Harness {
    pub store: MemoryStore,
    pub artifacts: MemoryArtifactStore,
    pub engine: Arc<FakeEngine>,
    pub router: MessageRouter,
}

pub fn harness() -> Harness {
    harness_with(MemoryStore::new(), FakeEngine::new(), false)
}

pub fn harness_with(store: MemoryStore, engine: FakeEngine, fault_before_audit: bool) -> Harness {
    let artifacts = MemoryArtifactStore::new();
    let engine = Arc::new(engine);
    let router = MessageRouter::new(
        Arc::new(store.clone()),
        Arc::new(artifacts.clone()),
        engine.clone(),
        RouterConfig {
            dead_letter_topic: DLQ_TOPIC.to_string(),
            simulate_fault_before_audit: fault_before_audit,
        },
    );
    Harness {
        store,
        artifacts,
        engine,
        router,
    }
}

/// Primary notification with a fixed message id.
pub fn audit_notification(job_id: &str, url: &str, message_id: &str) -> Notification {
    let mut message_attributes = BTreeMap::new();
    message_attributes.insert(JOB_ID_ATTR.to_string(), job_id.to_string());
    message_attributes.insert(URL_ATTR.to_string(), url.to_string());
    message_attributes.insert(OPTIONS_ATTR.to_string(), "{}".to_string());
    Notification {
        topic_arn: AUDIT_TOPIC.to_string(),
        message_id: message_id.to_string(),
        message: String::new(),
        message_attributes,
    }
}

/// Dead-letter notification wrapping `original`.
pub fn dead_letter_for(original: &Notification, error: &str) -> Notification {
    Notification::dead_letter(
        DLQ_TOPIC,
        serde_json::to_string(original).unwrap(),
        error,
    )
}
