//! Durable run queue.
//!
//! Jobs are delivered at least once. A claimed job whose worker dies stays
//! `claimed` until the next process start releases every claim that does not
//! carry the current incarnation prefix.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;

use crate::db::Db;
use crate::types::{JobState, RunJob};

/// Random identifier for this process. Worker ids are `{incarnation}:{n}`.
pub fn new_incarnation() -> String {
    format!("{:016x}", rand::random::<u64>())
}

pub fn worker_id(incarnation: &str, n: u32) -> String {
    format!("{incarnation}:{n}")
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(&self, run_id: i64) -> Result<()>;

    async fn claim(&self, worker: &str) -> Result<Option<RunJob>>;

    /// Acknowledge a job; it is never delivered again.
    async fn complete(&self, job_id: i64) -> Result<()>;

    /// Hand the job back for redelivery after `delay`.
    async fn retry(&self, job_id: i64, error: &str, delay: Duration) -> Result<()>;

    async fn jobs(&self, state: JobState) -> Result<Vec<RunJob>>;

    /// Return claims held by workers of earlier incarnations to pending.
    async fn release_foreign_claims(&self, incarnation: &str) -> Result<usize>;

    /// Run ids of every job that is pending, awaiting retry, or claimed, as
    /// one consistent snapshot. Workers move jobs between these states at any
    /// time, so the set must not be stitched together from separate reads.
    async fn run_ids(&self) -> Result<BTreeSet<i64>>;
}

/// Queue stored in the `run_jobs` table alongside the runs it drives.
pub struct DbQueue {
    db: Arc<Db>,
}

impl DbQueue {
    pub fn new(db: Arc<Db>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl TaskQueue for DbQueue {
    async fn enqueue(&self, run_id: i64) -> Result<()> {
        self.db.enqueue_job(run_id)?;
        Ok(())
    }

    async fn claim(&self, worker: &str) -> Result<Option<RunJob>> {
        self.db.claim_next_job(worker)
    }

    async fn complete(&self, job_id: i64) -> Result<()> {
        self.db.complete_job(job_id)
    }

    async fn retry(&self, job_id: i64, error: &str, delay: Duration) -> Result<()> {
        let delay = chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        self.db.retry_job(job_id, error, Utc::now() + delay)
    }

    async fn jobs(&self, state: JobState) -> Result<Vec<RunJob>> {
        self.db.list_jobs(state)
    }

    async fn release_foreign_claims(&self, incarnation: &str) -> Result<usize> {
        self.db.release_foreign_claims(incarnation)
    }

    async fn run_ids(&self) -> Result<BTreeSet<i64>> {
        Ok(self.db.queued_run_ids()?.into_iter().collect())
    }
}
