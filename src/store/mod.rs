//! Run ledger and job counter contracts.
//!
//! Reads and the counter increment are single-record operations. Recording
//! a run inserts it conditionally on key absence and counts it in the same
//! atomic step; that conditional insert is the only ordering primitive the
//! worker relies on between concurrent deliveries of the same run.

pub mod memory;

use async_trait::async_trait;
use tracing::debug;

use crate::error::Result;
use crate::model::{CounterName, JobId, Run, RunId};

pub use memory::MemoryStore;

/// Read consistency for ledger lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Consistency {
    /// Cheap read; may miss very recent writes.
    Eventual,
    /// Sees every write acknowledged before the read started.
    Strong,
}

/// Result of a conditional run insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    AlreadyExists,
}

/// One entry per recorded run, keyed by run id.
#[async_trait]
pub trait RunLedger: Send + Sync + 'static {
    async fn get(&self, run_id: &RunId, consistency: Consistency) -> Result<Option<Run>>;

    /// Insert-only. An existing record is never overwritten.
    async fn put(&self, run: &Run) -> Result<InsertOutcome>;
}

/// Per-job success/failure counters.
#[async_trait]
pub trait JobCounter: Send + Sync + 'static {
    /// Atomically add `delta`, creating the job at `delta` if absent.
    async fn increment(&self, job_id: &JobId, counter: CounterName, delta: u64) -> Result<()>;
}

/// Ledger and counters kept by one backend, so a run and its count can
/// commit together.
#[async_trait]
pub trait RunStore: RunLedger + JobCounter {
    /// Insert `run` if no record with its id exists and, only in that case,
    /// add one to `run.counter()` on its job. Both writes commit or neither
    /// does.
    async fn record(&self, run: &Run) -> Result<InsertOutcome>;
}

/// Record a finished run and count it against its job.
///
/// The counter only moves when the insert wins, so a run id is counted at
/// most once however many deliveries reach this point. A failure leaves
/// neither write behind, so the redelivery can still record and count it.
pub async fn record_run(store: &dyn RunStore, run: &Run) -> Result<InsertOutcome> {
    let outcome = store.record(run).await?;
    if outcome == InsertOutcome::AlreadyExists {
        debug!(run_id = %run.run_id, "run already recorded, counter untouched");
    }
    Ok(outcome)
}
