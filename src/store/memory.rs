//! In-process ledger and counters.
//!
//! Used by tests. Eventual reads can be made stale to open the same race
//! window a lagging replica would, and reads, writes or a single increment
//! can be made to fail.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{Consistency, InsertOutcome, JobCounter, RunLedger, RunStore};
use crate::error::{Error, Result};
use crate::model::{CounterName, JobCounts, JobId, Run, RunId};

#[derive(Debug, Default)]
struct Tables {
    runs: HashMap<RunId, Run>,
    jobs: HashMap<JobId, JobCounts>,
    /// Number of `put`/`record` calls that found an existing record.
    rejected_puts: usize,
}

/// Ledger + counters behind one mutex, so each operation is atomic.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
    stale_eventual_reads: Arc<AtomicBool>,
    fail_reads: Arc<AtomicBool>,
    fail_writes: Arc<AtomicBool>,
    fail_next_increment: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make eventual reads miss every record, as if the replica lagged.
    pub fn with_stale_eventual_reads(self) -> Self {
        self.stale_eventual_reads.store(true, Ordering::SeqCst);
        self
    }

    /// Fail every subsequent read with a storage error.
    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Fail every subsequent write with a storage error.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Fail the next counter increment once, including the one inside
    /// [`RunStore::record`].
    pub fn fail_next_increment(&self) {
        self.fail_next_increment.store(true, Ordering::SeqCst);
    }

    /// Snapshot of a job's counters (zero if never touched).
    pub fn job(&self, job_id: &JobId) -> JobCounts {
        self.lock().jobs.get(job_id).cloned().unwrap_or_default()
    }

    pub fn run(&self, run_id: &RunId) -> Option<Run> {
        self.lock().runs.get(run_id).cloned()
    }

    pub fn run_count(&self) -> usize {
        self.lock().runs.len()
    }

    pub fn rejected_puts(&self) -> usize {
        self.lock().rejected_puts
    }

    /// Seed a run directly, bypassing counters.
    pub fn insert_run(&self, run: Run) {
        self.lock().runs.insert(run.run_id.clone(), run);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Tables> {
        // A poisoned lock only means a test panicked mid-operation.
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_readable(&self) -> Result<()> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(Error::Other("injected store read failure".to_string()));
        }
        Ok(())
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Other("injected store write failure".to_string()));
        }
        Ok(())
    }

    fn check_incrementable(&self) -> Result<()> {
        if self.fail_next_increment.swap(false, Ordering::SeqCst) {
            return Err(Error::Other("injected counter failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl RunLedger for MemoryStore {
    async fn get(&self, run_id: &RunId, consistency: Consistency) -> Result<Option<Run>> {
        self.check_readable()?;
        if consistency == Consistency::Eventual && self.stale_eventual_reads.load(Ordering::SeqCst)
        {
            return Ok(None);
        }
        Ok(self.lock().runs.get(run_id).cloned())
    }

    async fn put(&self, run: &Run) -> Result<InsertOutcome> {
        self.check_writable()?;
        let mut tables = self.lock();
        if tables.runs.contains_key(&run.run_id) {
            tables.rejected_puts += 1;
            return Ok(InsertOutcome::AlreadyExists);
        }
        tables.runs.insert(run.run_id.clone(), run.clone());
        Ok(InsertOutcome::Inserted)
    }
}

#[async_trait]
impl JobCounter for MemoryStore {
    async fn increment(&self, job_id: &JobId, counter: CounterName, delta: u64) -> Result<()> {
        self.check_writable()?;
        self.check_incrementable()?;
        self.lock()
            .jobs
            .entry(job_id.clone())
            .or_default()
            .add(counter, delta);
        Ok(())
    }
}

#[async_trait]
impl RunStore for MemoryStore {
    async fn record(&self, run: &Run) -> Result<InsertOutcome> {
        self.check_writable()?;
        let mut tables = self.lock();
        if tables.runs.contains_key(&run.run_id) {
            tables.rejected_puts += 1;
            return Ok(InsertOutcome::AlreadyExists);
        }
        // Checked before either write so a failure leaves nothing behind.
        self.check_incrementable()?;
        tables.runs.insert(run.run_id.clone(), run.clone());
        tables
            .jobs
            .entry(run.job_id.clone())
            .or_default()
            .add(run.counter(), 1);
        Ok(InsertOutcome::Inserted)
    }
}
