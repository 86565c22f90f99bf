//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing.
//! Connection strings are held as `secrecy::SecretString`.

use crate::error::{Error, Result};
use secrecy::SecretString;
use std::path::PathBuf;

/// Where report artifacts are written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactTarget {
    /// Local directory root (dev, single-host deployments).
    Directory(PathBuf),
    /// HTTP object store accepting `PUT {endpoint}/{bucket}/{key}`.
    Http { endpoint: String, bucket: String },
}

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    /// Read replica used for eventually-consistent dedup reads.
    pub database_replica_url: Option<SecretString>,
    pub runs_table: String,
    pub jobs_table: String,
    pub audit_queue: String,
    /// Topic identifier of the dead-letter queue.
    pub dead_letter_queue: String,
    pub max_deliveries: i32,
    pub artifacts: ArtifactTarget,
    pub lighthouse_bin: PathBuf,
    pub chrome_bin: PathBuf,
    pub audit_work_dir: PathBuf,
    /// Test-only: fail every primary delivery right before the audit step.
    pub simulate_fault_before_audit: bool,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let artifacts = match optional_var("ARTIFACT_ENDPOINT") {
            Some(endpoint) => ArtifactTarget::Http {
                endpoint: endpoint.trim_end_matches('/').to_string(),
                bucket: required_var("BUCKET")?,
            },
            None => ArtifactTarget::Directory(
                optional_var("ARTIFACT_DIR")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("./artifacts")),
            ),
        };

        let max_deliveries = match optional_var("MAX_DELIVERIES") {
            Some(raw) => raw
                .parse::<i32>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or_else(|| {
                    Error::Config(format!("MAX_DELIVERIES must be a positive integer, got {raw}"))
                })?,
            None => 3,
        };

        Ok(Self {
            database_url: SecretString::from(required_var("DATABASE_URL")?),
            database_replica_url: optional_var("DATABASE_REPLICA_URL").map(SecretString::from),
            runs_table: identifier_var("RUNS_TABLE_NAME", "runs")?,
            jobs_table: identifier_var("JOBS_TABLE_NAME", "jobs")?,
            audit_queue: identifier_var("AUDIT_QUEUE", "page_audits")?,
            dead_letter_queue: identifier_var("DLQ_QUEUE", "page_audits_dlq")?,
            max_deliveries,
            artifacts,
            lighthouse_bin: optional_var("LIGHTHOUSE_BIN")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("lighthouse")),
            chrome_bin: optional_var("CHROME_BIN")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("google-chrome")),
            audit_work_dir: optional_var("AUDIT_WORK_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/tmp/audit-worker")),
            simulate_fault_before_audit: optional_var("SIMULATE_EXCEPTION_BEFORE_LH_RUN")
                .is_some_and(|v| !matches!(v.as_str(), "0" | "false")),
            otel_endpoint: optional_var("OTEL_ENDPOINT"),
            log_level: optional_var("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        })
    }
}

/// Table and queue names are spliced into SQL, so only plain identifiers pass.
pub fn validate_identifier(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c == '_');
    if valid_start
        && name.len() <= 48
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    {
        Ok(())
    } else {
        Err(Error::Config(format!("{name:?} is not a valid identifier")))
    }
}

fn required_var(name: &str) -> Result<String> {
    optional_var(name)
        .ok_or_else(|| Error::Config(format!("required environment variable {name} is not set")))
}

/// Unset and empty are the same thing.
fn optional_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn identifier_var(name: &str, default: &str) -> Result<String> {
    let value = optional_var(name).unwrap_or_else(|| default.to_string());
    validate_identifier(&value)?;
    Ok(value)
}
