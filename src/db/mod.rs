//! Database connection pools, schema, and health check.
//!
//! Postgres backs the run ledger, the job counters and (through pgmq) the
//! audit and dead-letter queues. Writes and strongly-consistent reads go to
//! the primary; eventually-consistent reads go to the replica when one is
//! configured.

pub mod ledger;
pub mod queue;

use crate::config::validate_identifier;
use crate::error::Result;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

/// Names of the ledger and counter tables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tables {
    pub runs: String,
    pub jobs: String,
}

impl Default for Tables {
    fn default() -> Self {
        Self {
            runs: "runs".to_string(),
            jobs: "jobs".to_string(),
        }
    }
}

/// Database handle. Owns the connection pools shared by every store.
pub struct Db {
    pool: PgPool,
    replica: Option<PgPool>,
    tables: Tables,
}

impl Db {
    /// Connect to the primary (and optional replica) and create pools.
    pub async fn connect(url: &str, replica_url: Option<&str>, tables: Tables) -> Result<Self> {
        validate_identifier(&tables.runs)?;
        validate_identifier(&tables.jobs)?;

        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await?;
        let replica = match replica_url {
            Some(url) => Some(
                PgPoolOptions::new()
                    .max_connections(10)
                    .connect(url)
                    .await?,
            ),
            None => None,
        };
        Ok(Self {
            pool,
            replica,
            tables,
        })
    }

    /// Create the pgmq extension and the ledger/counter tables if missing.
    pub async fn ensure_schema(&self) -> Result<()> {
        let Tables { runs, jobs } = &self.tables;

        sqlx::query("CREATE EXTENSION IF NOT EXISTS pgmq")
            .execute(&self.pool)
            .await?;
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {runs} (
                run_id      TEXT PRIMARY KEY,
                job_id      TEXT NOT NULL,
                url         TEXT,
                error       TEXT,
                created_at  TIMESTAMPTZ NOT NULL DEFAULT now()
            )"
        ))
        .execute(&self.pool)
        .await?;
        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS {runs}_job_id_idx ON {runs} (job_id)"
        ))
        .execute(&self.pool)
        .await?;
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {jobs} (
                job_id              TEXT PRIMARY KEY,
                page_count_success  BIGINT NOT NULL DEFAULT 0,
                page_count_error    BIGINT NOT NULL DEFAULT 0
            )"
        ))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Run `SELECT 1` against every pool.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        if let Some(ref replica) = self.replica {
            sqlx::query("SELECT 1").execute(replica).await?;
        }
        Ok(())
    }

    /// Primary pool (writes, strong reads, queue operations).
    pub(crate) fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Pool for eventually-consistent reads.
    pub(crate) fn read_pool(&self) -> &PgPool {
        self.replica.as_ref().unwrap_or(&self.pool)
    }

    pub(crate) fn tables(&self) -> &Tables {
        &self.tables
    }
}
