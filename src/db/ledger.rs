//! Postgres run ledger and job counters.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use sqlx::PgExecutor;

use crate::error::{Error, Result};
use crate::model::{CounterName, JobCounts, JobId, Run, RunId};
use crate::store::{Consistency, InsertOutcome, JobCounter, RunLedger, RunStore};
use crate::telemetry::metrics;

#[async_trait]
impl RunLedger for super::Db {
    async fn get(&self, run_id: &RunId, consistency: Consistency) -> Result<Option<Run>> {
        let pool = match consistency {
            Consistency::Eventual => self.read_pool(),
            Consistency::Strong => self.pool(),
        };
        let sql = format!(
            "SELECT run_id, job_id, url, error, created_at FROM {} WHERE run_id = $1",
            self.tables().runs
        );
        let row: Option<RunRow> = sqlx::query_as(&sql)
            .bind(&run_id.0)
            .fetch_optional(pool)
            .await?;
        Ok(row.map(Run::from))
    }

    async fn put(&self, run: &Run) -> Result<InsertOutcome> {
        let outcome = insert_run(self.pool(), &self.tables().runs, run).await?;
        record_ledger_write(outcome);
        Ok(outcome)
    }
}

#[async_trait]
impl JobCounter for super::Db {
    async fn increment(&self, job_id: &JobId, counter: CounterName, delta: u64) -> Result<()> {
        let delta = i64::try_from(delta)
            .map_err(|_| Error::Other(format!("counter delta {delta} out of range")))?;
        add_to_counter(self.pool(), &self.tables().jobs, job_id, counter, delta).await
    }
}

#[async_trait]
impl RunStore for super::Db {
    async fn record(&self, run: &Run) -> Result<InsertOutcome> {
        let mut tx = self.pool().begin().await?;
        let outcome = insert_run(&mut *tx, &self.tables().runs, run).await?;
        if outcome == InsertOutcome::Inserted {
            add_to_counter(&mut *tx, &self.tables().jobs, &run.job_id, run.counter(), 1).await?;
        }
        // Dropping the transaction on an error above rolls the insert back.
        tx.commit().await?;
        record_ledger_write(outcome);
        Ok(outcome)
    }
}

/// Conditional insert. The primary key makes this the race arbiter between
/// deliveries.
async fn insert_run<'e>(
    executor: impl PgExecutor<'e>,
    runs: &str,
    run: &Run,
) -> Result<InsertOutcome> {
    let sql = format!(
        "INSERT INTO {runs} (run_id, job_id, url, error, created_at)
         VALUES ($1, $2, $3, $4, $5)
         ON CONFLICT (run_id) DO NOTHING"
    );
    let rows_affected = sqlx::query(&sql)
        .bind(&run.run_id.0)
        .bind(&run.job_id.0)
        .bind(&run.url)
        .bind(&run.error)
        .bind(run.created_at)
        .execute(executor)
        .await?
        .rows_affected();

    Ok(if rows_affected == 1 {
        InsertOutcome::Inserted
    } else {
        InsertOutcome::AlreadyExists
    })
}

async fn add_to_counter<'e>(
    executor: impl PgExecutor<'e>,
    jobs: &str,
    job_id: &JobId,
    counter: CounterName,
    delta: i64,
) -> Result<()> {
    let col = counter.column();
    let sql = format!(
        "INSERT INTO {jobs} (job_id, {col}) VALUES ($1, $2)
         ON CONFLICT (job_id) DO UPDATE SET {col} = {jobs}.{col} + EXCLUDED.{col}"
    );
    sqlx::query(&sql)
        .bind(&job_id.0)
        .bind(delta)
        .execute(executor)
        .await?;
    Ok(())
}

fn record_ledger_write(outcome: InsertOutcome) {
    metrics::ledger_writes().add(
        1,
        &[KeyValue::new(
            "result",
            match outcome {
                InsertOutcome::Inserted => "inserted",
                InsertOutcome::AlreadyExists => "conflict",
            },
        )],
    );
}

impl super::Db {
    /// Current counters for a job.
    pub async fn get_job(&self, job_id: &JobId) -> Result<JobCounts> {
        let sql = format!(
            "SELECT page_count_success, page_count_error FROM {} WHERE job_id = $1",
            self.tables().jobs
        );
        let row: Option<(i64, i64)> = sqlx::query_as(&sql)
            .bind(&job_id.0)
            .fetch_optional(self.pool())
            .await?;
        let (success, error) = row.ok_or_else(|| Error::NotFound(format!("job {job_id}")))?;
        Ok(JobCounts {
            page_count_success: success.max(0) as u64,
            page_count_error: error.max(0) as u64,
        })
    }

    /// Runs recorded against a job, oldest first.
    pub async fn list_runs(&self, job_id: &JobId, limit: i64) -> Result<Vec<Run>> {
        let sql = format!(
            "SELECT run_id, job_id, url, error, created_at FROM {}
             WHERE job_id = $1 ORDER BY created_at LIMIT $2",
            self.tables().runs
        );
        let rows: Vec<RunRow> = sqlx::query_as(&sql)
            .bind(&job_id.0)
            .bind(limit)
            .fetch_all(self.pool())
            .await?;
        Ok(rows.into_iter().map(Run::from).collect())
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct RunRow {
    run_id: String,
    job_id: String,
    url: Option<String>,
    error: Option<String>,
    created_at: DateTime<Utc>,
}

impl From<RunRow> for Run {
    fn from(row: RunRow) -> Self {
        Run {
            run_id: RunId(row.run_id),
            job_id: JobId(row.job_id),
            url: row.url,
            error: row.error,
            created_at: row.created_at,
        }
    }
}
