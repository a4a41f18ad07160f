//! Periodic repair of drift between the run table, the queue and the
//! container runtime.
//!
//! With D the unfinished runs, Q the run ids with a queued, retrying or
//! claimed job, and C the run ids of labelled containers:
//! - every run in D \ (Q ∪ C) is finished as an error
//! - every container whose run is not in D is deleted
//!
//! Snapshots are taken in the order D, Q, C, D. Any run in the first D read
//! has already been enqueued, so missing from both Q and C means its job and
//! container are really gone. Containers are compared against the second D
//! read, so a run queued and started during the sweep is never mistaken for
//! a leak.

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{info, warn};

use crate::db::Db;
use crate::maintenance::{CleanupOutcome, ContainerMaintenance};
use crate::queue::TaskQueue;
use crate::runtime::ContainerRuntime;
use crate::scheduler::AdmissionGate;
use crate::types::RunOutcome;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Runs finished as errors because nothing was left to finish them.
    pub repaired_runs: Vec<i64>,
    /// Containers deleted because their run is finished or unknown.
    pub deleted_containers: Vec<String>,
}

impl SweepReport {
    pub fn orphans_repaired(&self) -> usize {
        self.repaired_runs.len()
    }

    pub fn containers_deleted(&self) -> usize {
        self.deleted_containers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.repaired_runs.is_empty() && self.deleted_containers.is_empty()
    }
}

pub struct ReconciliationSweep {
    db: Arc<Db>,
    queue: Arc<dyn TaskQueue>,
    maintenance: Arc<ContainerMaintenance>,
    admission: Option<AdmissionGate>,
}

impl ReconciliationSweep {
    pub fn new(db: Arc<Db>, queue: Arc<dyn TaskQueue>, maintenance: Arc<ContainerMaintenance>) -> Self {
        Self {
            db,
            queue,
            maintenance,
            admission: None,
        }
    }

    /// Hold `gate` exclusively while runs and queue are snapshotted.
    pub fn with_admission_gate(mut self, gate: AdmissionGate) -> Self {
        self.admission = Some(gate);
        self
    }

    fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        self.maintenance.runtime()
    }

    /// Run one sweep. Fails without touching anything if a snapshot cannot
    /// be taken.
    pub async fn sweep(&self) -> Result<SweepReport> {
        let (unfinished, queued) = {
            let _gate = match &self.admission {
                Some(gate) => Some(gate.write().await),
                None => None,
            };
            let unfinished: BTreeSet<i64> = self.db.unfinished_run_ids()?.into_iter().collect();
            let queued = self.queue.run_ids().await.context("sweep: queue snapshot")?;
            (unfinished, queued)
        };
        let containers = self
            .runtime()
            .list_run_containers()
            .await
            .context("sweep: container snapshot")?;
        let live: BTreeSet<i64> = self.db.unfinished_run_ids()?.into_iter().collect();

        let backed: BTreeSet<i64> = containers.iter().map(|c| c.run_id).collect();
        let mut report = SweepReport::default();

        for run_id in unfinished
            .iter()
            .filter(|id| !queued.contains(id) && !backed.contains(id))
        {
            match self.db.finish_run(*run_id, RunOutcome::Error, None) {
                Ok(true) => {
                    warn!(run_id, "sweep: run had no job and no container, marked as error");
                    report.repaired_runs.push(*run_id);
                }
                Ok(false) => {}
                Err(e) => warn!(run_id, "sweep: failed to repair run: {e}"),
            }
        }

        for container in containers.iter().filter(|c| !live.contains(&c.run_id)) {
            if container.running {
                warn!(
                    run_id = container.run_id,
                    container = %container.id,
                    "sweep: container still running for a finished or unknown run"
                );
            }
            if self.maintenance.delete_container(&container.id).await == CleanupOutcome::Removed {
                report.deleted_containers.push(container.id.clone());
            }
        }

        if !report.is_empty() {
            info!(
                orphans_repaired = report.orphans_repaired(),
                containers_deleted = report.containers_deleted(),
                "sweep: reconciliation finished"
            );
        }
        Ok(report)
    }
}
