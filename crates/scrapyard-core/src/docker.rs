//! Docker CLI backend for both the run executor and the runtime used by
//! maintenance and the reconciliation sweep.

use std::process::Stdio;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::DateTime;
use secrecy::ExposeSecret;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::executor::{
    parse_metrics_line, ContainerExecutor, ExecutionReport, RunSetup, METRICS_FORMAT,
    METRICS_MARKER,
};
use crate::runtime::{ContainerRuntime, RunContainer, RuntimeError, RUN_LABEL};
use crate::types::{OutputLine, OutputStream, Run, Variable, RUN_ID_VARIABLE};

pub struct DockerOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl DockerOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

pub struct DockerCli {
    pub image: String,
    /// Shell command run inside the container from `/repo`.
    pub scraper_command: String,
}

impl DockerCli {
    pub fn new(image: impl Into<String>, scraper_command: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            scraper_command: scraper_command.into(),
        }
    }

    pub async fn available() -> bool {
        Command::new("docker")
            .arg("version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }

    pub fn container_name(run_id: i64) -> String {
        format!("scrapyard-run-{run_id}")
    }

    /// Run a docker subcommand with `env` set on the docker client process.
    /// `-e NAME` without a value makes docker copy it from there.
    async fn exec_env(&self, args: &[&str], env: &[Variable]) -> Result<DockerOutput, RuntimeError> {
        let mut cmd = Command::new("docker");
        for var in env {
            cmd.env(&var.name, var.value.expose_secret());
        }
        let output = cmd
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| RuntimeError::Unavailable(format!("failed to spawn docker: {e}")))?;
        Ok(DockerOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(1),
        })
    }

    /// Run a docker subcommand, classifying a non-zero exit into a [`RuntimeError`].
    async fn exec_ok(&self, args: &[&str]) -> Result<String, RuntimeError> {
        self.exec_ok_env(args, &[]).await
    }

    async fn exec_ok_env(&self, args: &[&str], env: &[Variable]) -> Result<String, RuntimeError> {
        let out = self.exec_env(args, env).await?;
        if out.success() {
            Ok(out.stdout)
        } else {
            Err(RuntimeError::classify(&out.stderr))
        }
    }

    /// Arguments for `docker create`, including the sandbox hardening flags
    /// and the metrics wrapper around the scraper command. Variables are
    /// passed by name only.
    pub fn create_args(&self, run: &Run, memory_mb: u64, setup: &RunSetup) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "create".into(),
            "--name".into(),
            Self::container_name(run.id),
            "--label".into(),
            format!("{RUN_LABEL}={}", run.id),
            "--memory".into(),
            format!("{memory_mb}m"),
            "--memory-swap".into(),
            format!("{memory_mb}m"),
            "--pids-limit".into(),
            "256".into(),
        ];

        if cfg!(target_os = "linux") {
            args.extend(
                ["--security-opt", "no-new-privileges:true", "--cap-drop", "ALL"]
                    .map(str::to_string),
            );
        }

        args.push("-v".into());
        args.push(format!("{}:/repo:ro", setup.repo_path));
        args.push("-v".into());
        args.push(format!("{}:/data", setup.data_path));
        args.push("-w".into());
        args.push("/repo".into());
        args.push("-e".into());
        args.push(format!("{RUN_ID_VARIABLE}={}", run.id));
        for var in &setup.variables {
            args.push("-e".into());
            args.push(var.name.clone());
        }
        args.push(self.image.clone());

        args.extend(
            [
                "/usr/bin/time",
                "-f",
                METRICS_FORMAT,
                "sh",
                "-c",
                self.scraper_command.as_str(),
            ]
            .map(str::to_string),
        );
        args
    }

    async fn inspect(&self, name: &str, format: &str) -> Result<String, RuntimeError> {
        let out = self.exec_ok(&["inspect", "-f", format, name]).await?;
        Ok(out.trim().to_string())
    }

    async fn container_wall_time(&self, name: &str) -> Option<Duration> {
        let out = self
            .inspect(name, "{{.State.StartedAt}} {{.State.FinishedAt}}")
            .await
            .ok()?;
        let (started, finished) = out.split_once(' ')?;
        let started = DateTime::parse_from_rfc3339(started).ok()?;
        let finished = DateTime::parse_from_rfc3339(finished).ok()?;
        (finished - started).to_std().ok()
    }
}

#[async_trait]
impl ContainerExecutor for DockerCli {
    async fn start(&self, run: &Run, memory_mb: u64, setup: &RunSetup) -> Result<String> {
        let name = Self::container_name(run.id);
        for dir in [&setup.repo_path, &setup.data_path] {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("failed to create mount dir {dir}"))?;
        }

        let args = self.create_args(run, memory_mb, setup);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let env = setup.variables.as_slice();
        let container_id = match self.exec_ok_env(&args, env).await {
            Ok(out) => out.trim().to_string(),
            Err(RuntimeError::Conflict(msg)) => {
                // Left over from an attempt that never reached `docker start`.
                warn!(run_id = run.id, "docker: replacing stale container {name}: {msg}");
                if let Err(e) = self.exec_ok(&["rm", "--force", &name]).await {
                    warn!(run_id = run.id, "docker: failed to remove stale container {name}: {e}");
                }
                self.exec_ok_env(&args, env)
                    .await
                    .map_err(|e| anyhow!("docker create failed for run #{}: {e}", run.id))?
                    .trim()
                    .to_string()
            }
            Err(e) => return Err(anyhow!("docker create failed for run #{}: {e}", run.id)),
        };

        if let Err(e) = self.exec_ok(&["start", &container_id]).await {
            if let Err(rm) = self.exec_ok(&["rm", "--force", &container_id]).await {
                warn!(
                    run_id = run.id,
                    container = %container_id,
                    "docker: failed to remove container that did not start: {rm}"
                );
            }
            return Err(anyhow!("docker start failed for run #{}: {e}", run.id));
        }

        info!(run_id = run.id, container = %container_id, memory_mb, "docker: container started");
        Ok(container_id)
    }

    async fn follow(
        &self,
        run_id: i64,
        output: mpsc::UnboundedSender<OutputLine>,
    ) -> Result<ExecutionReport> {
        let name = Self::container_name(run_id);
        let started = Instant::now();

        let mut child = Command::new("docker")
            .args(["logs", "--follow", &name])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .context("failed to spawn docker logs")?;

        let stdout = child.stdout.take().context("failed to take stdout")?;
        let stderr = child.stderr.take().context("failed to take stderr")?;
        let mut stdout_reader = BufReader::new(stdout).lines();
        let mut stderr_reader = BufReader::new(stderr).lines();
        let mut metrics = Vec::new();
        let (mut stdout_open, mut stderr_open) = (true, true);

        while stdout_open || stderr_open {
            tokio::select! {
                line = stdout_reader.next_line(), if stdout_open => {
                    match line.context("error reading container stdout")? {
                        Some(text) => {
                            let _ = output.send(OutputLine { stream: OutputStream::Stdout, text });
                        }
                        None => stdout_open = false,
                    }
                }
                line = stderr_reader.next_line(), if stderr_open => {
                    match line {
                        Ok(Some(text)) if text.starts_with(METRICS_MARKER) => {
                            match parse_metrics_line(&text) {
                                Some(m) => metrics.push(m),
                                None => debug!(run_id, "docker: unparseable metrics line: {text}"),
                            }
                        }
                        Ok(Some(text)) => {
                            let _ = output.send(OutputLine { stream: OutputStream::Stderr, text });
                        }
                        Ok(None) | Err(_) => stderr_open = false,
                    }
                }
            }
        }
        let logs_status = child.wait().await.context("failed to wait for docker logs")?;
        if !logs_status.success() {
            debug!(run_id, "docker logs exited with {logs_status}");
        }

        let waited = self
            .exec_ok(&["wait", &name])
            .await
            .map_err(|e| anyhow!("docker wait failed for run #{run_id}: {e}"))?;
        let status_code = waited.trim().parse::<i64>().ok();

        let oom_killed = self
            .inspect(&name, "{{.State.OOMKilled}}")
            .await
            .map(|s| s == "true")
            .unwrap_or(false);
        if oom_killed {
            warn!(run_id, "docker: container exceeded its memory limit");
        }

        let wall_time = self
            .container_wall_time(&name)
            .await
            .unwrap_or_else(|| started.elapsed());

        info!(run_id, ?status_code, oom_killed, "docker: container exited");
        Ok(ExecutionReport {
            status_code,
            oom_killed,
            wall_time,
            metrics,
        })
    }

    async fn container_for_run(&self, run_id: i64) -> Result<Option<String>> {
        let filter = format!("label={RUN_LABEL}={run_id}");
        let out = self
            .exec_ok(&["ps", "-a", "-q", "--no-trunc", "--filter", &filter])
            .await
            .map_err(|e| anyhow!("docker ps failed: {e}"))?;
        Ok(out.lines().map(str::trim).find(|l| !l.is_empty()).map(String::from))
    }

    async fn stop(&self, run_id: i64, grace: Duration) -> Result<()> {
        let name = Self::container_name(run_id);
        let grace = grace.as_secs().to_string();
        match self.exec_ok(&["stop", "--time", &grace, &name]).await {
            Ok(_) => {
                info!(run_id, "docker: container stopped");
                Ok(())
            }
            Err(RuntimeError::NotFound(_)) => Ok(()),
            Err(e) => Err(anyhow!("docker stop failed for run #{run_id}: {e}")),
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn list_run_containers(&self) -> Result<Vec<RunContainer>, RuntimeError> {
        let filter = format!("label={RUN_LABEL}");
        let format = format!("{{{{.ID}}}}\t{{{{.Label \"{RUN_LABEL}\"}}}}\t{{{{.State}}}}");
        let out = self
            .exec_ok(&["ps", "-a", "--no-trunc", "--filter", &filter, "--format", &format])
            .await?;
        Ok(parse_container_list(&out))
    }

    async fn delete_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.exec_ok(&["rm", "--force", "--volumes", id]).await.map(|_| ())
    }

    async fn remove_image(&self, id: &str) -> Result<(), RuntimeError> {
        self.exec_ok(&["rmi", id]).await.map(|_| ())
    }

    async fn dangling_images(&self) -> Result<Vec<String>, RuntimeError> {
        let out = self
            .exec_ok(&["images", "-q", "--no-trunc", "--filter", "dangling=true"])
            .await?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }
}

/// Parse `docker ps --format '{{.ID}}\t{{.Label ...}}\t{{.State}}'` output.
/// Lines whose label is not a run id are skipped.
pub fn parse_container_list(out: &str) -> Vec<RunContainer> {
    out.lines()
        .filter_map(|line| {
            let mut parts = line.trim().split('\t');
            let id = parts.next()?.trim();
            let run_id = parts.next()?.trim().parse::<i64>().ok()?;
            let state = parts.next().unwrap_or("").trim();
            if id.is_empty() {
                return None;
            }
            Some(RunContainer {
                id: id.to_string(),
                run_id,
                running: state == "running",
            })
        })
        .collect()
}
