//! Contract for the sandboxed execution engine that runs a scraper.
//!
//! An executor starts one container per run, bound to the run by the
//! [`RUN_LABEL`](crate::runtime::RUN_LABEL) label, streams its output,
//! enforces the memory ceiling and reports how the process ended.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::types::{Metric, OutputLine, Run, RunOutcome, Variable};

/// Marker printed by `/usr/bin/time` on the scraper's stderr.
pub const METRICS_MARKER: &str = "__scrapyard_metrics__";

/// `/usr/bin/time -f` format producing a line [`parse_metrics_line`] understands.
pub const METRICS_FORMAT: &str = "__scrapyard_metrics__ utime=%U stime=%S maxrss=%M";

/// Host paths mounted into the run container, plus the scraper's variables.
#[derive(Debug)]
pub struct RunSetup {
    /// Mirror of the scraper's repository, mounted read-only at `/repo`.
    pub repo_path: String,
    /// Scraper data directory, mounted read-write at `/data`.
    pub data_path: String,
    /// Exported into the container environment. Values must never reach
    /// argv or logs.
    pub variables: Vec<Variable>,
}

/// How a container ended.
#[derive(Debug, Clone, Default)]
pub struct ExecutionReport {
    pub status_code: Option<i64>,
    pub oom_killed: bool,
    pub wall_time: Duration,
    pub metrics: Vec<Metric>,
}

impl ExecutionReport {
    pub fn outcome(&self) -> RunOutcome {
        if self.status_code == Some(0) && !self.oom_killed {
            RunOutcome::Success
        } else {
            RunOutcome::Error
        }
    }
}

#[async_trait]
pub trait ContainerExecutor: Send + Sync {
    /// Create and start the container for `run`. Returns the container id.
    /// On failure no container for the run is left behind.
    async fn start(&self, run: &Run, memory_mb: u64, setup: &RunSetup) -> Result<String>;

    /// Stream the run container's output into `output` until it exits.
    /// Also used to re-attach to a container after a restart.
    async fn follow(
        &self,
        run_id: i64,
        output: mpsc::UnboundedSender<OutputLine>,
    ) -> Result<ExecutionReport>;

    async fn container_for_run(&self, run_id: i64) -> Result<Option<String>>;

    /// Ask the container to terminate; force-kill once `grace` has elapsed.
    /// A missing container is not an error.
    async fn stop(&self, run_id: i64, grace: Duration) -> Result<()>;
}

/// Parse a metrics marker line, e.g.
/// `__scrapyard_metrics__ utime=1.20 stime=0.31 maxrss=20480`.
pub fn parse_metrics_line(line: &str) -> Option<Metric> {
    let rest = line.trim().strip_prefix(METRICS_MARKER)?;
    let mut metric = Metric::default();
    for field in rest.split_whitespace() {
        let (key, value) = field.split_once('=')?;
        match key {
            "utime" => metric.utime = value.parse().ok()?,
            "stime" => metric.stime = value.parse().ok()?,
            "maxrss" => metric.maxrss_kb = value.parse().ok()?,
            _ => {}
        }
    }
    Some(metric)
}
