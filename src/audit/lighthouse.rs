//! Lighthouse CLI driven against a private headless Chrome.
//!
//! Each audit gets its own scratch directory and its own browser, started
//! with `--remote-debugging-port=0`; the chosen port is read back from the
//! browser's stderr and handed to Lighthouse.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{AuditEngine, AuditSession, EngineHandle};
use crate::error::{Error, Result};
use crate::model::ReportArtifacts;

/// Executables and limits for [`LighthouseEngine`].
#[derive(Debug, Clone)]
pub struct LighthouseConfig {
    pub lighthouse_bin: PathBuf,
    pub chrome_bin: PathBuf,
    /// Base directory for per-audit scratch directories.
    pub work_dir: PathBuf,
    /// How long Chrome may take to print its DevTools endpoint.
    pub launch_timeout: Duration,
    /// Upper bound on a single Lighthouse run.
    pub audit_timeout: Duration,
}

impl Default for LighthouseConfig {
    fn default() -> Self {
        Self {
            lighthouse_bin: PathBuf::from("lighthouse"),
            chrome_bin: PathBuf::from("google-chrome"),
            work_dir: PathBuf::from("/tmp/audit-worker"),
            launch_timeout: Duration::from_secs(30),
            audit_timeout: Duration::from_secs(180),
        }
    }
}

pub struct LighthouseEngine {
    config: LighthouseConfig,
}

impl LighthouseEngine {
    pub fn new(config: LighthouseConfig) -> Self {
        Self { config }
    }

    async fn launch_chrome(&self, dir: &Path) -> Result<(Child, u16)> {
        let mut child = Command::new(&self.config.chrome_bin)
            .arg("--headless=new")
            .arg("--disable-gpu")
            .arg("--no-sandbox")
            .arg("--no-first-run")
            .arg("--remote-debugging-port=0")
            .arg(format!("--user-data-dir={}", dir.join("profile").display()))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Audit("chrome stderr not captured".to_string()))?;
        let mut lines = BufReader::new(stderr).lines();

        let port = tokio::time::timeout(self.config.launch_timeout, async {
            while let Some(line) = lines.next_line().await? {
                if let Some(port) = parse_devtools_port(&line) {
                    return Ok(Some(port));
                }
            }
            Ok::<_, std::io::Error>(None)
        })
        .await
        .map_err(|_| Error::Audit("chrome did not report a DevTools port in time".to_string()))??
        .ok_or_else(|| Error::Audit("chrome exited before reporting a DevTools port".to_string()))?;

        // Keep draining so a chatty browser never blocks on a full pipe.
        tokio::spawn(async move {
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(target: "audit_worker::chrome", "{line}");
            }
        });

        Ok((child, port))
    }

    async fn run_lighthouse(
        &self,
        dir: &Path,
        url: &str,
        port: u16,
        options: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<ReportArtifacts> {
        let flags_path = dir.join("flags.json");
        tokio::fs::write(&flags_path, serde_json::to_vec(options)?).await?;
        let output_path = dir.join("report");

        let run = Command::new(&self.config.lighthouse_bin)
            .arg(url)
            .arg(format!("--port={port}"))
            .arg(format!("--cli-flags-file={}", flags_path.display()))
            .arg("--output=json")
            .arg("--output=html")
            .arg(format!("--output-path={}", output_path.display()))
            .arg("--quiet")
            .current_dir(dir)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.config.audit_timeout, run)
            .await
            .map_err(|_| {
                Error::Audit(format!(
                    "lighthouse exceeded {}s",
                    self.config.audit_timeout.as_secs()
                ))
            })??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: String = stderr
                .lines()
                .rev()
                .take(5)
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect::<Vec<_>>()
                .join("\n");
            return Err(Error::Audit(format!(
                "lighthouse exited with status {}: {tail}",
                output.status.code().unwrap_or(-1)
            )));
        }

        // With several outputs Lighthouse writes `<path>.report.<ext>`.
        let json = read_report(dir, "report.report.json").await?;
        let html = read_report(dir, "report.report.html").await?;
        Ok(ReportArtifacts { json, html })
    }
}

async fn read_report(dir: &Path, name: &str) -> Result<Bytes> {
    tokio::fs::read(dir.join(name))
        .await
        .map(Bytes::from)
        .map_err(|e| Error::Audit(format!("missing report {name}: {e}")))
}

#[async_trait]
impl AuditEngine for LighthouseEngine {
    async fn run(
        &self,
        url: &str,
        options: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<AuditSession> {
        let start = Instant::now();
        let dir = self.config.work_dir.join(Uuid::new_v4().to_string());
        tokio::fs::create_dir_all(&dir).await?;

        // From here on the handle owns the directory; any early return drops
        // it, which kills the browser and removes the directory.
        let mut handle = ChromeHandle {
            child: None,
            dir: dir.clone(),
            released: false,
        };
        let (child, port) = self.launch_chrome(&dir).await?;
        handle.child = Some(child);
        debug!(port, dir = %dir.display(), "chrome launched");

        let reports = self.run_lighthouse(&dir, url, port, options).await?;
        info!(
            url,
            duration_ms = start.elapsed().as_millis() as u64,
            json_bytes = reports.json.len(),
            html_bytes = reports.html.len(),
            "lighthouse run finished"
        );
        Ok(AuditSession::new(reports, Box::new(handle)))
    }
}

/// Browser process and scratch directory of one audit.
struct ChromeHandle {
    child: Option<Child>,
    dir: PathBuf,
    released: bool,
}

#[async_trait]
impl EngineHandle for ChromeHandle {
    async fn release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        if let Some(mut child) = self.child.take() {
            // Already-exited browsers are fine; only report real failures.
            if let Err(e) = child.kill().await {
                warn!(error = %e, "failed to kill chrome");
            }
        }
        match tokio::fs::remove_dir_all(&self.dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        debug!(dir = %self.dir.display(), "audit engine released");
        Ok(())
    }
}

impl Drop for ChromeHandle {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Some(child) = self.child.as_mut() {
            let _ = child.start_kill();
        }
        let dir = std::mem::take(&mut self.dir);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn_blocking(move || {
                    let _ = std::fs::remove_dir_all(dir);
                });
            }
            // No runtime to hand off to; block this thread instead.
            Err(_) => {
                let _ = std::fs::remove_dir_all(&dir);
            }
        }
    }
}

/// Extract the port from Chrome's `DevTools listening on ws://host:port/...` line.
pub fn parse_devtools_port(line: &str) -> Option<u16> {
    let rest = line.split("DevTools listening on ws://").nth(1)?;
    let authority = rest.split('/').next()?;
    authority.rsplit(':').next()?.parse().ok()
}
