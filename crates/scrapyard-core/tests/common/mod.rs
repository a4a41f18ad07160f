#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use scrapyard_core::{
    db::Db,
    executor::{ContainerExecutor, ExecutionReport, RunSetup},
    maintenance::ContainerMaintenance,
    queue::DbQueue,
    runtime::{ContainerRuntime, RunContainer, RuntimeError},
    scheduler::{RunScheduler, SchedulerConfig},
    types::{Metric, OutputLine, OutputStream, OwnerKind, Run},
    webhook::WebhookDispatcher,
};
use tempfile::TempDir;
use tokio::sync::mpsc;

// ── store ────────────────────────────────────────────────────────────────────

pub fn open_db() -> Arc<Db> {
    let mut db = Db::open(":memory:").expect("open in-memory db");
    db.migrate().expect("migrate");
    Arc::new(db)
}

pub fn seed_scraper(db: &Db, nickname: &str, name: &str) -> i64 {
    let owner_id = match db.insert_owner(nickname, OwnerKind::User) {
        Ok(id) => id,
        Err(_) => db.find_or_create_user(nickname).expect("owner"),
    };
    db.insert_scraper(owner_id, name, &format!("https://github.com/{nickname}/{name}.git"), None, false)
        .expect("insert_scraper")
}

// ── container fake ───────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug)]
pub enum Failure {
    Conflict,
    NotFound,
    Other,
}

impl Failure {
    fn error(self, what: &str) -> RuntimeError {
        match self {
            Failure::Conflict => RuntimeError::Conflict(format!("{what} is in use")),
            Failure::NotFound => RuntimeError::NotFound(format!("no such {what}")),
            Failure::Other => RuntimeError::Other(format!("daemon exploded removing {what}")),
        }
    }
}

/// In-memory stand-in for the container runtime, playing both the executor
/// and the maintenance/sweep runtime roles.
#[derive(Default)]
pub struct FakeDocker {
    pub containers: Mutex<BTreeMap<String, RunContainer>>,
    pub exit_code: Mutex<Option<i64>>,
    pub output: Mutex<Vec<OutputLine>>,
    pub metrics: Mutex<Vec<Metric>>,
    pub fail_start: AtomicBool,
    pub fail_follows: AtomicUsize,
    pub fail_listing: AtomicBool,
    pub removal_failures: Mutex<BTreeMap<String, Failure>>,
    pub dangling: Mutex<Vec<String>>,
    pub starts: AtomicUsize,
    /// Variable names handed to each start, in order.
    pub started_env: Mutex<Vec<Vec<String>>>,
    pub follows: AtomicUsize,
    pub stops: Mutex<Vec<i64>>,
    pub removed_images: Mutex<Vec<String>>,
}

impl FakeDocker {
    pub fn new() -> Arc<Self> {
        let fake = Self::default();
        *fake.exit_code.lock().unwrap() = Some(0);
        Arc::new(fake)
    }

    pub fn add_container(&self, id: &str, run_id: i64) {
        self.containers.lock().unwrap().insert(
            id.to_string(),
            RunContainer { id: id.to_string(), run_id, running: true },
        );
    }

    pub fn container_ids(&self) -> Vec<String> {
        self.containers.lock().unwrap().keys().cloned().collect()
    }

    pub fn set_output(&self, lines: &[(&str, OutputStream)]) {
        *self.output.lock().unwrap() = lines
            .iter()
            .map(|(text, stream)| OutputLine { stream: *stream, text: text.to_string() })
            .collect();
    }
}

#[async_trait]
impl ContainerExecutor for FakeDocker {
    async fn start(&self, run: &Run, _memory_mb: u64, setup: &RunSetup) -> Result<String> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        self.started_env
            .lock()
            .unwrap()
            .push(setup.variables.iter().map(|v| v.name.clone()).collect());
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(anyhow!("image not found"));
        }
        let id = format!("c-{}", run.id);
        self.add_container(&id, run.id);
        Ok(id)
    }

    async fn follow(
        &self,
        run_id: i64,
        output: mpsc::UnboundedSender<OutputLine>,
    ) -> Result<ExecutionReport> {
        self.follows.fetch_add(1, Ordering::SeqCst);
        if self
            .fail_follows
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(anyhow!("lost connection to runtime"));
        }
        for line in self.output.lock().unwrap().iter() {
            let _ = output.send(line.clone());
        }
        if let Some(c) = self
            .containers
            .lock()
            .unwrap()
            .values_mut()
            .find(|c| c.run_id == run_id)
        {
            c.running = false;
        }
        Ok(ExecutionReport {
            status_code: *self.exit_code.lock().unwrap(),
            oom_killed: false,
            wall_time: Duration::from_millis(25),
            metrics: self.metrics.lock().unwrap().clone(),
        })
    }

    async fn container_for_run(&self, run_id: i64) -> Result<Option<String>> {
        Ok(self
            .containers
            .lock()
            .unwrap()
            .values()
            .find(|c| c.run_id == run_id)
            .map(|c| c.id.clone()))
    }

    async fn stop(&self, run_id: i64, _grace: Duration) -> Result<()> {
        self.stops.lock().unwrap().push(run_id);
        Ok(())
    }
}

#[async_trait]
impl ContainerRuntime for FakeDocker {
    async fn list_run_containers(&self) -> Result<Vec<RunContainer>, RuntimeError> {
        if self.fail_listing.load(Ordering::SeqCst) {
            return Err(RuntimeError::Unavailable("daemon down".into()));
        }
        Ok(self.containers.lock().unwrap().values().cloned().collect())
    }

    async fn delete_container(&self, id: &str) -> Result<(), RuntimeError> {
        if let Some(f) = self.removal_failures.lock().unwrap().get(id) {
            return Err(f.error("container"));
        }
        match self.containers.lock().unwrap().remove(id) {
            Some(_) => Ok(()),
            None => Err(RuntimeError::NotFound(format!("no such container: {id}"))),
        }
    }

    async fn remove_image(&self, id: &str) -> Result<(), RuntimeError> {
        if let Some(f) = self.removal_failures.lock().unwrap().get(id) {
            return Err(f.error("image"));
        }
        self.removed_images.lock().unwrap().push(id.to_string());
        Ok(())
    }

    async fn dangling_images(&self) -> Result<Vec<String>, RuntimeError> {
        Ok(self.dangling.lock().unwrap().clone())
    }
}

// ── scheduler harness ────────────────────────────────────────────────────────

pub struct Harness {
    pub db: Arc<Db>,
    pub docker: Arc<FakeDocker>,
    pub queue: Arc<DbQueue>,
    pub maintenance: Arc<ContainerMaintenance>,
    pub scheduler: Arc<RunScheduler>,
    pub dir: TempDir,
}

pub fn test_config(dir: &TempDir) -> SchedulerConfig {
    SchedulerConfig {
        read_only: false,
        stop_grace: Duration::from_secs(1),
        max_attempts: 3,
        retry_backoff: Duration::ZERO,
        default_memory_mb: 256,
        repo_root: dir.path().join("repos").to_string_lossy().into_owned(),
        data_root: dir.path().join("data").to_string_lossy().into_owned(),
    }
}

pub fn harness() -> Harness {
    harness_with(|_| {})
}

pub fn harness_with(tweak: impl FnOnce(&mut SchedulerConfig)) -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = test_config(&dir);
    tweak(&mut config);

    let db = open_db();
    let docker = FakeDocker::new();
    let queue = Arc::new(DbQueue::new(Arc::clone(&db)));
    let maintenance = Arc::new(ContainerMaintenance::new(docker.clone()));
    let dispatcher = Arc::new(
        WebhookDispatcher::new(Arc::clone(&db), Duration::from_secs(2)).expect("dispatcher"),
    );
    let scheduler = Arc::new(RunScheduler::new(
        Arc::clone(&db),
        queue.clone(),
        docker.clone(),
        Arc::clone(&maintenance),
        dispatcher,
        config,
    ));
    Harness {
        db,
        docker,
        queue,
        maintenance,
        scheduler,
        dir,
    }
}

pub fn git_available() -> bool {
    std::process::Command::new("git")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}
