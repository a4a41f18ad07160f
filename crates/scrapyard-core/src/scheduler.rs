//! Run lifecycle: queue, execute, stop, finalize.
//!
//! A run moves queued → running → finished. The only step back is a start
//! the runtime rejected, which returns the run to queued for its retry.
//! `finished_at` is written exactly once through the guarded
//! [`Db::finish_run`]; only the caller that performs that transition
//! dispatches webhooks. Queue jobs are delivered at least once, so
//! [`RunScheduler::process`] is idempotent: a finished run is acknowledged
//! without side effects and a running one is re-attached to its container
//! instead of started again.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use serde::Serialize;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::db::Db;
use crate::dirsize::directory_size;
use crate::executor::{ContainerExecutor, RunSetup};
use crate::git::Git;
use crate::maintenance::ContainerMaintenance;
use crate::queue::TaskQueue;
use crate::types::{OutputLine, Run, RunJob, RunOutcome, RunState, Scraper};
use crate::webhook::WebhookDispatcher;

/// Held shared while a run is created and enqueued, and exclusively while
/// the reconciliation sweep snapshots runs and queue. A run is therefore
/// never observed as unfinished while its job is still on the way.
pub type AdmissionGate = Arc<RwLock<()>>;

const OUTPUT_BATCH: usize = 200;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub read_only: bool,
    pub stop_grace: Duration,
    pub max_attempts: u32,
    pub retry_backoff: Duration,
    pub default_memory_mb: u64,
    pub repo_root: String,
    pub data_root: String,
}

impl SchedulerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            read_only: config.read_only,
            stop_grace: config.stop_grace(),
            max_attempts: config.max_run_attempts.max(1),
            retry_backoff: Duration::from_secs(config.retry_backoff_s.max(0) as u64),
            default_memory_mb: config.default_memory_mb,
            repo_root: config.repo_root.clone(),
            data_root: config.scraper_data_root.clone(),
        }
    }
}

#[derive(Debug)]
pub enum QueueOutcome {
    Queued(Run),
    /// The scraper already has an unfinished run.
    NotRunnable,
    /// The installation is in read-only mode.
    ReadOnly,
}

impl QueueOutcome {
    pub fn run(&self) -> Option<&Run> {
        match self {
            Self::Queued(run) => Some(run),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopOutcome {
    Stopped,
    AlreadyFinished,
}

pub struct RunScheduler {
    db: Arc<Db>,
    queue: Arc<dyn TaskQueue>,
    executor: Arc<dyn ContainerExecutor>,
    maintenance: Arc<ContainerMaintenance>,
    dispatcher: Arc<WebhookDispatcher>,
    config: SchedulerConfig,
    admission: AdmissionGate,
}

impl RunScheduler {
    pub fn new(
        db: Arc<Db>,
        queue: Arc<dyn TaskQueue>,
        executor: Arc<dyn ContainerExecutor>,
        maintenance: Arc<ContainerMaintenance>,
        dispatcher: Arc<WebhookDispatcher>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            db,
            queue,
            executor,
            maintenance,
            dispatcher,
            config,
            admission: Arc::new(RwLock::new(())),
        }
    }

    pub fn admission_gate(&self) -> AdmissionGate {
        Arc::clone(&self.admission)
    }

    // ── Queueing ──────────────────────────────────────────────────────────

    /// Create a run for the scraper and enqueue it, unless one is already
    /// queued or running.
    pub async fn queue(&self, scraper_id: i64) -> Result<QueueOutcome> {
        self.queue_run(scraper_id, false).await
    }

    /// Queue every auto-run scraper that is runnable. Returns how many
    /// runs were created.
    pub async fn queue_auto_runs(&self) -> Result<usize> {
        if self.config.read_only {
            debug!("scheduler: read-only, skipping auto runs");
            return Ok(0);
        }
        let mut queued = 0;
        for scraper in self.db.list_auto_run_scrapers()? {
            match self.queue_run(scraper.id, true).await {
                Ok(QueueOutcome::Queued(_)) => queued += 1,
                Ok(_) => {}
                Err(e) => warn!(scraper_id = scraper.id, "scheduler: auto run failed to queue: {e}"),
            }
        }
        if queued > 0 {
            info!(queued, "scheduler: queued auto runs");
        }
        Ok(queued)
    }

    async fn queue_run(&self, scraper_id: i64, auto: bool) -> Result<QueueOutcome> {
        if self.config.read_only {
            info!(scraper_id, "scheduler: read-only, refusing to queue");
            return Ok(QueueOutcome::ReadOnly);
        }
        let scraper = self
            .db
            .get_scraper(scraper_id)?
            .ok_or_else(|| anyhow!("scraper #{scraper_id} not found"))?;

        let _admit = self.admission.read().await;
        let Some(run) = self.db.create_run_if_runnable(scraper.id, scraper.owner_id, auto)? else {
            debug!(scraper_id, "scheduler: scraper not runnable, run already in flight");
            return Ok(QueueOutcome::NotRunnable);
        };

        if let Err(e) = self.queue.enqueue(run.id).await {
            error!(run_id = run.id, scraper_id, "scheduler: enqueue failed: {e}");
            // Without a job nothing would ever finish the run.
            self.db.finish_run(run.id, RunOutcome::Error, None)?;
            return Err(e);
        }

        info!(run_id = run.id, scraper_id, auto, "scheduler: run queued");
        Ok(QueueOutcome::Queued(run))
    }

    // ── Stopping ──────────────────────────────────────────────────────────

    /// Stop a run. Stopping a finished run is a no-op.
    pub async fn stop(&self, run_id: i64) -> Result<StopOutcome> {
        let run = self
            .db
            .get_run(run_id)?
            .ok_or_else(|| anyhow!("run #{run_id} not found"))?;
        if run.is_finished() {
            return Ok(StopOutcome::AlreadyFinished);
        }

        // Record the stop before signalling, so the worker following the
        // container cannot finish the run as an error first.
        let stopped = self.finalize(&run, RunOutcome::Stopped, None).await?;

        if run.state() == RunState::Running {
            if let Err(e) = self.executor.stop(run_id, self.config.stop_grace).await {
                warn!(run_id, "scheduler: failed to signal container: {e}");
            }
        }

        if stopped {
            info!(run_id, "scheduler: run stopped");
            Ok(StopOutcome::Stopped)
        } else {
            Ok(StopOutcome::AlreadyFinished)
        }
    }

    // ── Execution ─────────────────────────────────────────────────────────

    /// Claim and handle one job. Returns false when the queue was empty.
    pub async fn work_once(&self, worker: &str) -> Result<bool> {
        let Some(job) = self.queue.claim(worker).await? else {
            return Ok(false);
        };
        self.handle(&job).await;
        Ok(true)
    }

    /// Process a claimed job, retrying with backoff or giving up once the
    /// attempt budget is spent.
    pub async fn handle(&self, job: &RunJob) {
        let Err(e) = self.process(job).await else {
            return;
        };
        if job.attempts >= i64::from(self.config.max_attempts) {
            error!(
                run_id = job.run_id,
                attempts = job.attempts,
                "scheduler: giving up on run: {e:#}"
            );
            if let Err(e) = self.abandon(job).await {
                error!(run_id = job.run_id, "scheduler: failed to abandon run: {e:#}");
            }
        } else {
            let delay = self.config.retry_backoff * job.attempts.clamp(1, 32) as u32;
            warn!(
                run_id = job.run_id,
                attempts = job.attempts,
                retry_in_s = delay.as_secs(),
                "scheduler: run attempt failed: {e:#}"
            );
            if let Err(e) = self.queue.retry(job.id, &format!("{e:#}"), delay).await {
                error!(run_id = job.run_id, "scheduler: failed to schedule retry: {e:#}");
            }
        }
    }

    /// Execute the run behind `job` to completion. Safe to call again for a
    /// job that was already (partly) processed.
    pub async fn process(&self, job: &RunJob) -> Result<()> {
        let Some(run) = self.db.get_run(job.run_id)? else {
            warn!(run_id = job.run_id, "scheduler: job for missing run, acknowledging");
            return self.queue.complete(job.id).await;
        };
        if run.is_finished() {
            debug!(run_id = run.id, "scheduler: run already finished, acknowledging");
            return self.queue.complete(job.id).await;
        }
        let Some(scraper) = self.db.get_scraper(run.scraper_id)? else {
            self.finalize(&run, RunOutcome::Error, None).await?;
            return self.queue.complete(job.id).await;
        };

        let container_id = match run.state() {
            RunState::Queued => match self.start(&run, &scraper).await? {
                Some(id) => id,
                None => return self.queue.complete(job.id).await,
            },
            _ => match self.executor.container_for_run(run.id).await? {
                Some(id) => {
                    info!(run_id = run.id, container = %id, "scheduler: re-attaching to run");
                    self.db.set_run_container(run.id, &id)?;
                    self.db.clear_log_lines(run.id)?;
                    id
                }
                None => {
                    warn!(run_id = run.id, "scheduler: running run has no container");
                    self.finalize(&run, RunOutcome::Error, None).await?;
                    return self.queue.complete(job.id).await;
                }
            },
        };

        self.follow(&run, &container_id).await?;
        self.queue.complete(job.id).await
    }

    /// Mark the run started and launch its container. `None` means the run
    /// lost a race and there is nothing to follow. A failed start puts the
    /// run back to queued for the retry.
    async fn start(&self, run: &Run, scraper: &Scraper) -> Result<Option<String>> {
        let repo_path = scraper.repo_path(&self.config.repo_root);
        let revision_path = repo_path.clone();
        let revision = tokio::task::spawn_blocking(move || Git::new(revision_path).rev_parse_head().ok())
            .await
            .unwrap_or(None);
        let variables = self.db.variables(scraper.id)?;

        if !self.db.mark_run_started(run.id, revision.as_deref())? {
            let current = self.db.get_run(run.id)?;
            return match current {
                Some(current) if !current.is_finished() => {
                    Ok(self.executor.container_for_run(run.id).await?)
                }
                _ => Ok(None),
            };
        }

        let setup = RunSetup {
            repo_path,
            data_path: scraper.data_path(&self.config.data_root),
            variables,
        };
        let memory_mb = scraper.memory_mb.unwrap_or(self.config.default_memory_mb);
        let container_id = match self.executor.start(run, memory_mb, &setup).await {
            Ok(id) => id,
            Err(e) => {
                self.db.revert_run_started(run.id)?;
                return Err(e.context("container failed to start"));
            }
        };
        self.db.set_run_container(run.id, &container_id)?;
        info!(run_id = run.id, scraper_id = scraper.id, container = %container_id, "scheduler: run started");

        // A stop that landed while the container was being created found
        // nothing to signal.
        if self.db.get_run(run.id)?.map_or(true, |r| r.is_finished()) {
            info!(run_id = run.id, "scheduler: run stopped during start");
            if let Err(e) = self.executor.stop(run.id, self.config.stop_grace).await {
                warn!(run_id = run.id, "scheduler: failed to signal container: {e}");
            }
        }
        Ok(Some(container_id))
    }

    /// Stream output until the container exits, record metrics, finalize
    /// and delete the container.
    async fn follow(&self, run: &Run, container_id: &str) -> Result<()> {
        let run_id = run.id;
        let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();
        let db = Arc::clone(&self.db);
        let collector = tokio::spawn(async move {
            let mut batch = Vec::with_capacity(OUTPUT_BATCH);
            while let Some(line) = rx.recv().await {
                batch.push(line);
                if batch.len() >= OUTPUT_BATCH {
                    if let Err(e) = db.insert_log_lines(run_id, &batch) {
                        warn!(run_id, "scheduler: failed to store output: {e}");
                    }
                    batch.clear();
                }
            }
            if let Err(e) = db.insert_log_lines(run_id, &batch) {
                warn!(run_id, "scheduler: failed to store output: {e}");
            }
        });

        let followed = self.executor.follow(run_id, tx).await;
        if let Err(e) = collector.await {
            warn!(run_id, "scheduler: output collector failed: {e}");
        }
        let report = followed?;

        self.db.replace_metrics(run_id, &report.metrics)?;
        let outcome = report.outcome();
        self.finalize(run, outcome, report.status_code).await?;
        info!(
            run_id,
            outcome = outcome.as_str(),
            status_code = ?report.status_code,
            wall_time_s = report.wall_time.as_secs_f64(),
            "scheduler: run finished"
        );

        self.maintenance.delete_container(container_id).await;
        Ok(())
    }

    /// Give up on a job: finish the run as an error and clean up whatever
    /// container it may have.
    async fn abandon(&self, job: &RunJob) -> Result<()> {
        if let Some(run) = self.db.get_run(job.run_id)? {
            self.finalize(&run, RunOutcome::Error, None).await?;
            if let Ok(Some(container_id)) = self.executor.container_for_run(run.id).await {
                if let Err(e) = self.executor.stop(run.id, self.config.stop_grace).await {
                    warn!(run_id = run.id, "scheduler: failed to signal container: {e}");
                }
                self.maintenance.delete_container(&container_id).await;
            }
        }
        self.queue.complete(job.id).await
    }

    /// Finish the run once. Returns true only for the call that performed
    /// the transition; that call refreshes the scraper's data size and
    /// dispatches webhooks.
    pub async fn finalize(
        &self,
        run: &Run,
        outcome: RunOutcome,
        status_code: Option<i64>,
    ) -> Result<bool> {
        if !self.db.finish_run(run.id, outcome, status_code)? {
            debug!(run_id = run.id, "scheduler: run already finished");
            return Ok(false);
        }

        if let Some(scraper) = self.db.get_scraper(run.scraper_id)? {
            let data_path = scraper.data_path(&self.config.data_root);
            match tokio::task::spawn_blocking(move || directory_size(data_path)).await {
                Ok(size) => {
                    if let Err(e) = self.db.update_data_size(scraper.id, size) {
                        warn!(run_id = run.id, "scheduler: failed to record data size: {e}");
                    }
                }
                Err(e) => warn!(run_id = run.id, "scheduler: data size task failed: {e}"),
            }
        }

        let dispatcher = Arc::clone(&self.dispatcher);
        let run_id = run.id;
        tokio::spawn(async move {
            if let Err(e) = dispatcher.dispatch(run_id).await {
                warn!(run_id, "scheduler: webhook dispatch failed: {e:#}");
            }
        });
        Ok(true)
    }
}
