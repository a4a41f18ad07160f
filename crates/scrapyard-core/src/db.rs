use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use secrecy::{ExposeSecret, SecretString};
use std::sync::Mutex;

use crate::types::{
    is_valid_path_name, is_valid_variable_name, JobState, Metric, OutputLine, OutputStream, Owner,
    OwnerKind, Run, RunJob, RunOutcome, Scraper, Variable, Webhook, WebhookDelivery,
};

const SCHEMA_SQL: &str = include_str!("../../../schema.sql");

pub struct Db {
    conn: Mutex<Connection>,
}

// ── Timestamp helpers ─────────────────────────────────────────────────────

const TS_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

pub(crate) fn parse_ts(s: &str) -> DateTime<Utc> {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f")
        .map(|ndt| ndt.and_utc())
        .unwrap_or_else(|_| Utc::now())
}

fn parse_opt_ts(s: Option<String>) -> Option<DateTime<Utc>> {
    s.as_deref().map(parse_ts)
}

pub(crate) fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.format(TS_FORMAT).to_string()
}

fn now_str() -> String {
    fmt_ts(Utc::now())
}

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _) if err.code == ErrorCode::ConstraintViolation
    )
}

// ── Row mappers ───────────────────────────────────────────────────────────

const SCRAPER_COLUMNS: &str = "s.id, s.owner_id, o.nickname, s.name, s.full_name, s.git_url, \
     s.memory_mb, s.auto_run, s.repo_size, s.data_size";

const RUN_COLUMNS: &str = "id, scraper_id, owner_id, auto, queued_at, started_at, finished_at, \
     outcome, status_code, container_id, git_revision, wall_time";

const JOB_COLUMNS: &str = "id, run_id, state, attempts, claimed_by, available_at, last_error";

fn row_to_owner(row: &rusqlite::Row<'_>) -> rusqlite::Result<Owner> {
    let kind: String = row.get(2)?;
    Ok(Owner {
        id: row.get(0)?,
        nickname: row.get(1)?,
        kind: OwnerKind::from_db(&kind),
    })
}

fn row_to_scraper(row: &rusqlite::Row<'_>) -> rusqlite::Result<Scraper> {
    Ok(Scraper {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        owner_nickname: row.get(2)?,
        name: row.get(3)?,
        full_name: row.get(4)?,
        git_url: row.get(5)?,
        memory_mb: row.get::<_, Option<i64>>(6)?.map(|v| v.max(0) as u64),
        auto_run: row.get::<_, i64>(7)? != 0,
        repo_size: row.get::<_, i64>(8)?.max(0) as u64,
        data_size: row.get::<_, i64>(9)?.max(0) as u64,
    })
}

fn row_to_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<Run> {
    let queued_at: String = row.get(4)?;
    let outcome: Option<String> = row.get(7)?;
    Ok(Run {
        id: row.get(0)?,
        scraper_id: row.get(1)?,
        owner_id: row.get(2)?,
        auto: row.get::<_, i64>(3)? != 0,
        queued_at: parse_ts(&queued_at),
        started_at: parse_opt_ts(row.get(5)?),
        finished_at: parse_opt_ts(row.get(6)?),
        outcome: outcome.as_deref().and_then(RunOutcome::from_db),
        status_code: row.get(8)?,
        container_id: row.get(9)?,
        git_revision: row.get(10)?,
        wall_time: row.get(11)?,
    })
}

fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<RunJob> {
    let state: String = row.get(2)?;
    let available_at: String = row.get(5)?;
    Ok(RunJob {
        id: row.get(0)?,
        run_id: row.get(1)?,
        state: JobState::from_db(&state),
        attempts: row.get(3)?,
        claimed_by: row.get(4)?,
        available_at: parse_ts(&available_at),
        last_error: row.get(6)?,
    })
}

fn row_to_delivery(row: &rusqlite::Row<'_>) -> rusqlite::Result<WebhookDelivery> {
    let created_at: String = row.get(5)?;
    Ok(WebhookDelivery {
        id: row.get(0)?,
        webhook_id: row.get(1)?,
        run_id: row.get(2)?,
        response_code: row.get(3)?,
        sent_at: parse_opt_ts(row.get(4)?),
        created_at: parse_ts(&created_at),
    })
}

fn latest_run_on(conn: &Connection, scraper_id: i64) -> rusqlite::Result<Option<Run>> {
    conn.query_row(
        &format!(
            "SELECT {RUN_COLUMNS} FROM runs WHERE scraper_id = ?1 \
             ORDER BY queued_at DESC, id DESC LIMIT 1"
        ),
        params![scraper_id],
        row_to_run,
    )
    .optional()
}

// ── Db impl ───────────────────────────────────────────────────────────────

impl Db {
    pub fn raw_conn(&self) -> &std::sync::Mutex<Connection> {
        &self.conn
    }

    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open SQLite database at {path:?}"))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .context("failed to set PRAGMAs")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn migrate(&mut self) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute_batch(SCHEMA_SQL)
            .context("failed to apply schema migrations")?;
        Ok(())
    }

    // ── Owners ────────────────────────────────────────────────────────────

    pub fn insert_owner(&self, nickname: &str, kind: OwnerKind) -> Result<i64> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO owners (nickname, kind) VALUES (?1, ?2)",
            params![nickname, kind.as_str()],
        )
        .context("insert_owner")?;
        Ok(conn.last_insert_rowid())
    }

    /// Look up an owner by nickname, creating a minimal user record if absent.
    pub fn find_or_create_user(&self, nickname: &str) -> Result<i64> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT OR IGNORE INTO owners (nickname, kind) VALUES (?1, 'user')",
            params![nickname],
        )
        .context("find_or_create_user insert")?;
        let id = conn
            .query_row(
                "SELECT id FROM owners WHERE nickname = ?1",
                params![nickname],
                |row| row.get(0),
            )
            .context("find_or_create_user select")?;
        Ok(id)
    }

    // ── Scrapers ──────────────────────────────────────────────────────────

    pub fn insert_scraper(
        &self,
        owner_id: i64,
        name: &str,
        git_url: &str,
        memory_mb: Option<u64>,
        auto_run: bool,
    ) -> Result<i64> {
        if !is_valid_path_name(name) {
            bail!("invalid scraper name {name:?}: only letters, digits, '_' and '-' are allowed");
        }
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let nickname: String = conn
            .query_row(
                "SELECT nickname FROM owners WHERE id = ?1",
                params![owner_id],
                |row| row.get(0),
            )
            .with_context(|| format!("owner #{owner_id} not found"))?;
        if !is_valid_path_name(&nickname) {
            bail!(
                "owner nickname {nickname:?} cannot own scrapers: \
                 only letters, digits, '_' and '-' are allowed"
            );
        }
        conn.execute(
            "INSERT INTO scrapers (owner_id, name, full_name, git_url, memory_mb, auto_run) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                owner_id,
                name,
                format!("{nickname}/{name}"),
                git_url,
                memory_mb.map(|m| m as i64),
                auto_run as i64,
            ],
        )
        .context("insert_scraper")?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_scraper(&self, id: i64) -> Result<Option<Scraper>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let scraper = conn
            .query_row(
                &format!(
                    "SELECT {SCRAPER_COLUMNS} FROM scrapers s \
                     JOIN owners o ON o.id = s.owner_id WHERE s.id = ?1"
                ),
                params![id],
                row_to_scraper,
            )
            .optional()
            .context("get_scraper")?;
        Ok(scraper)
    }

    pub fn list_auto_run_scrapers(&self) -> Result<Vec<Scraper>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(&format!(
            "SELECT {SCRAPER_COLUMNS} FROM scrapers s \
             JOIN owners o ON o.id = s.owner_id WHERE s.auto_run = 1 ORDER BY s.id ASC"
        ))?;
        let scrapers = stmt
            .query_map([], row_to_scraper)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list_auto_run_scrapers")?;
        Ok(scrapers)
    }

    pub fn update_repo_size(&self, scraper_id: i64, size: u64) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE scrapers SET repo_size = ?1 WHERE id = ?2",
            params![size as i64, scraper_id],
        )
        .context("update_repo_size")?;
        Ok(())
    }

    pub fn update_data_size(&self, scraper_id: i64, size: u64) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE scrapers SET data_size = ?1 WHERE id = ?2",
            params![size as i64, scraper_id],
        )
        .context("update_data_size")?;
        Ok(())
    }

    /// Replace the scraper's contributor set in one transaction.
    pub fn replace_contributors(&self, scraper_id: i64, owner_ids: &[i64]) -> Result<()> {
        let mut conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let tx = conn.transaction().context("replace_contributors begin")?;
        tx.execute(
            "DELETE FROM contributions WHERE scraper_id = ?1",
            params![scraper_id],
        )?;
        for owner_id in owner_ids {
            tx.execute(
                "INSERT OR IGNORE INTO contributions (scraper_id, owner_id) VALUES (?1, ?2)",
                params![scraper_id, owner_id],
            )?;
        }
        tx.commit().context("replace_contributors commit")?;
        Ok(())
    }

    pub fn list_contributors(&self, scraper_id: i64) -> Result<Vec<Owner>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT o.id, o.nickname, o.kind FROM contributions c \
             JOIN owners o ON o.id = c.owner_id WHERE c.scraper_id = ?1 ORDER BY o.nickname",
        )?;
        let owners = stmt
            .query_map(params![scraper_id], row_to_owner)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list_contributors")?;
        Ok(owners)
    }

    // ── Variables ─────────────────────────────────────────────────────────

    /// Insert or overwrite a scraper variable.
    pub fn set_variable(&self, scraper_id: i64, name: &str, value: &SecretString) -> Result<i64> {
        if !is_valid_variable_name(name) {
            bail!("invalid variable name {name:?}: expected SCRAPYARD_ followed by [A-Z0-9_]");
        }
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let id = conn
            .query_row(
                "INSERT INTO variables (scraper_id, name, value) VALUES (?1, ?2, ?3) \
                 ON CONFLICT(scraper_id, name) DO UPDATE SET value = excluded.value, \
                 updated_at = datetime('now') \
                 RETURNING id",
                params![scraper_id, name, value.expose_secret()],
                |row| row.get(0),
            )
            .with_context(|| format!("set_variable {name} for scraper #{scraper_id}"))?;
        Ok(id)
    }

    pub fn variables(&self, scraper_id: i64) -> Result<Vec<Variable>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT id, scraper_id, name, value FROM variables WHERE scraper_id = ?1 \
             ORDER BY name ASC",
        )?;
        let vars = stmt
            .query_map(params![scraper_id], |row| {
                Ok(Variable {
                    id: row.get(0)?,
                    scraper_id: row.get(1)?,
                    name: row.get(2)?,
                    value: SecretString::from(row.get::<_, String>(3)?),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("variables")?;
        Ok(vars)
    }

    /// Returns false if no such variable existed.
    pub fn delete_variable(&self, scraper_id: i64, name: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let n = conn
            .execute(
                "DELETE FROM variables WHERE scraper_id = ?1 AND name = ?2",
                params![scraper_id, name],
            )
            .context("delete_variable")?;
        Ok(n > 0)
    }

    // ── Runs ──────────────────────────────────────────────────────────────

    pub fn get_run(&self, id: i64) -> Result<Option<Run>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let run = conn
            .query_row(
                &format!("SELECT {RUN_COLUMNS} FROM runs WHERE id = ?1"),
                params![id],
                row_to_run,
            )
            .optional()
            .context("get_run")?;
        Ok(run)
    }

    pub fn latest_run(&self, scraper_id: i64) -> Result<Option<Run>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        latest_run_on(&conn, scraper_id).context("latest_run")
    }

    /// No run yet, or the latest run has finished.
    pub fn is_runnable(&self, scraper_id: i64) -> Result<bool> {
        Ok(self
            .latest_run(scraper_id)?
            .map_or(true, |run| run.is_finished()))
    }

    pub fn list_runs(&self, scraper_id: i64, limit: i64) -> Result<Vec<Run>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(&format!(
            "SELECT {RUN_COLUMNS} FROM runs WHERE scraper_id = ?1 \
             ORDER BY queued_at DESC, id DESC LIMIT ?2"
        ))?;
        let runs = stmt
            .query_map(params![scraper_id, limit], row_to_run)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list_runs")?;
        Ok(runs)
    }

    /// Create a queued run unless the scraper already has an unfinished run.
    /// Check and insert share one immediate transaction; the
    /// `runs_single_flight` index catches anything that slips past the check.
    pub fn create_run_if_runnable(
        &self,
        scraper_id: i64,
        owner_id: i64,
        auto: bool,
    ) -> Result<Option<Run>> {
        let mut conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("create_run begin")?;

        if let Some(latest) = latest_run_on(&tx, scraper_id)? {
            if !latest.is_finished() {
                return Ok(None);
            }
        }

        let inserted = tx.execute(
            "INSERT INTO runs (scraper_id, owner_id, auto, queued_at) VALUES (?1, ?2, ?3, ?4)",
            params![scraper_id, owner_id, auto as i64, now_str()],
        );
        match inserted {
            Ok(_) => {}
            Err(e) if is_constraint_violation(&e) => return Ok(None),
            Err(e) => return Err(e).context("create_run insert"),
        }
        let run_id = tx.last_insert_rowid();

        let run = tx
            .query_row(
                &format!("SELECT {RUN_COLUMNS} FROM runs WHERE id = ?1"),
                params![run_id],
                row_to_run,
            )
            .context("create_run reload")?;
        tx.commit().context("create_run commit")?;
        Ok(Some(run))
    }

    /// Transition a queued run to running. Returns false if the run was
    /// already started or finished.
    pub fn mark_run_started(&self, id: i64, git_revision: Option<&str>) -> Result<bool> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let now = now_str();
        let n = conn
            .execute(
                "UPDATE runs SET started_at = MAX(?1, queued_at), git_revision = ?2 \
                 WHERE id = ?3 AND started_at IS NULL AND finished_at IS NULL",
                params![now, git_revision, id],
            )
            .context("mark_run_started")?;
        Ok(n == 1)
    }

    /// Return a started but unfinished run to queued, so the next attempt
    /// can start it again.
    pub fn revert_run_started(&self, id: i64) -> Result<bool> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let n = conn
            .execute(
                "UPDATE runs SET started_at = NULL, git_revision = NULL, container_id = NULL \
                 WHERE id = ?1 AND finished_at IS NULL",
                params![id],
            )
            .context("revert_run_started")?;
        Ok(n == 1)
    }

    pub fn set_run_container(&self, id: i64, container_id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE runs SET container_id = ?1 WHERE id = ?2",
            params![container_id, id],
        )
        .context("set_run_container")?;
        Ok(())
    }

    /// Set `finished_at` exactly once. Returns true only for the caller that
    /// performed the transition.
    pub fn finish_run(
        &self,
        id: i64,
        outcome: RunOutcome,
        status_code: Option<i64>,
    ) -> Result<bool> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let Some(run) = conn
            .query_row(
                &format!("SELECT {RUN_COLUMNS} FROM runs WHERE id = ?1"),
                params![id],
                row_to_run,
            )
            .optional()
            .context("finish_run load")?
        else {
            return Ok(false);
        };
        if run.is_finished() {
            return Ok(false);
        }

        let floor = run.started_at.unwrap_or(run.queued_at);
        let finished_at = Utc::now().max(floor);
        let wall_time = run
            .started_at
            .map(|s| (finished_at - s).num_milliseconds() as f64 / 1000.0)
            .unwrap_or(0.0);

        let n = conn
            .execute(
                "UPDATE runs SET finished_at = ?1, outcome = ?2, status_code = ?3, wall_time = ?4 \
                 WHERE id = ?5 AND finished_at IS NULL",
                params![fmt_ts(finished_at), outcome.as_str(), status_code, wall_time, id],
            )
            .context("finish_run")?;
        Ok(n == 1)
    }

    pub fn unfinished_run_ids(&self) -> Result<Vec<i64>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt =
            conn.prepare("SELECT id FROM runs WHERE finished_at IS NULL ORDER BY id ASC")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()
            .context("unfinished_run_ids")?;
        Ok(ids)
    }

    pub fn count_unfinished_runs(&self, scraper_id: i64) -> Result<i64> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let n = conn
            .query_row(
                "SELECT COUNT(*) FROM runs WHERE scraper_id = ?1 AND finished_at IS NULL",
                params![scraper_id],
                |row| row.get(0),
            )
            .context("count_unfinished_runs")?;
        Ok(n)
    }

    /// Delete a finished run with its metrics, output and queue job.
    /// Webhook deliveries survive with their run detached. Returns false if
    /// the run does not exist; an unfinished run is refused.
    pub fn delete_run(&self, id: i64) -> Result<bool> {
        let mut conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("delete_run begin")?;
        let finished: Option<bool> = tx
            .query_row(
                "SELECT finished_at IS NOT NULL FROM runs WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()
            .context("delete_run lookup")?;
        match finished {
            None => return Ok(false),
            Some(false) => bail!("run #{id} is still unfinished"),
            Some(true) => {}
        }
        tx.execute("DELETE FROM run_jobs WHERE run_id = ?1", params![id])?;
        tx.execute("DELETE FROM runs WHERE id = ?1", params![id])?;
        tx.commit().context("delete_run commit")?;
        Ok(true)
    }

    // ── Metrics / output ──────────────────────────────────────────────────

    /// Replace the run's metrics, so a re-processed run records them once.
    pub fn replace_metrics(&self, run_id: i64, metrics: &[Metric]) -> Result<()> {
        let mut conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let tx = conn.transaction().context("replace_metrics begin")?;
        tx.execute("DELETE FROM metrics WHERE run_id = ?1", params![run_id])?;
        for m in metrics {
            tx.execute(
                "INSERT INTO metrics (run_id, utime, stime, maxrss_kb) VALUES (?1, ?2, ?3, ?4)",
                params![run_id, m.utime, m.stime, m.maxrss_kb],
            )?;
        }
        tx.commit().context("replace_metrics commit")?;
        Ok(())
    }

    pub fn metrics_for_run(&self, run_id: i64) -> Result<Vec<Metric>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT utime, stime, maxrss_kb FROM metrics WHERE run_id = ?1 ORDER BY id ASC",
        )?;
        let metrics = stmt
            .query_map(params![run_id], |row| {
                Ok(Metric {
                    utime: row.get(0)?,
                    stime: row.get(1)?,
                    maxrss_kb: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("metrics_for_run")?;
        Ok(metrics)
    }

    pub fn insert_log_lines(&self, run_id: i64, lines: &[OutputLine]) -> Result<()> {
        if lines.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let tx = conn.transaction().context("insert_log_lines begin")?;
        for line in lines {
            tx.execute(
                "INSERT INTO log_lines (run_id, stream, text) VALUES (?1, ?2, ?3)",
                params![run_id, line.stream.as_str(), line.text],
            )?;
        }
        tx.commit().context("insert_log_lines commit")?;
        Ok(())
    }

    /// Drop captured output before re-attaching, since the runtime replays it.
    pub fn clear_log_lines(&self, run_id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute("DELETE FROM log_lines WHERE run_id = ?1", params![run_id])
            .context("clear_log_lines")?;
        Ok(())
    }

    pub fn log_lines(&self, run_id: i64) -> Result<Vec<OutputLine>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt =
            conn.prepare("SELECT stream, text FROM log_lines WHERE run_id = ?1 ORDER BY id ASC")?;
        let lines = stmt
            .query_map(params![run_id], |row| {
                let stream: String = row.get(0)?;
                Ok(OutputLine {
                    stream: if stream == "stderr" {
                        OutputStream::Stderr
                    } else {
                        OutputStream::Stdout
                    },
                    text: row.get(1)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("log_lines")?;
        Ok(lines)
    }

    // ── Webhooks ──────────────────────────────────────────────────────────

    pub fn insert_webhook(&self, scraper_id: i64, url: &str) -> Result<i64> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        match conn.execute(
            "INSERT INTO webhooks (scraper_id, url) VALUES (?1, ?2)",
            params![scraper_id, url],
        ) {
            Ok(_) => Ok(conn.last_insert_rowid()),
            Err(e) if is_constraint_violation(&e) => Err(anyhow!(
                "webhook {url} already registered for scraper #{scraper_id}"
            )),
            Err(e) => Err(e).context("insert_webhook"),
        }
    }

    pub fn list_webhooks(&self, scraper_id: i64) -> Result<Vec<Webhook>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT id, scraper_id, url FROM webhooks WHERE scraper_id = ?1 ORDER BY id ASC",
        )?;
        let hooks = stmt
            .query_map(params![scraper_id], |row| {
                Ok(Webhook {
                    id: row.get(0)?,
                    scraper_id: row.get(1)?,
                    url: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list_webhooks")?;
        Ok(hooks)
    }

    /// Create the delivery row for (webhook, run). Returns `None` if one
    /// already exists.
    pub fn create_delivery(&self, webhook_id: i64, run_id: i64) -> Result<Option<i64>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let n = conn
            .execute(
                "INSERT OR IGNORE INTO webhook_deliveries (webhook_id, run_id, created_at) \
                 VALUES (?1, ?2, ?3)",
                params![webhook_id, run_id, now_str()],
            )
            .context("create_delivery")?;
        Ok((n == 1).then(|| conn.last_insert_rowid()))
    }

    pub fn record_delivery_response(&self, id: i64, response_code: u16) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE webhook_deliveries SET response_code = ?1, sent_at = ?2 WHERE id = ?3",
            params![response_code as i64, now_str(), id],
        )
        .context("record_delivery_response")?;
        Ok(())
    }

    pub fn deliveries_for_run(&self, run_id: i64) -> Result<Vec<WebhookDelivery>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT id, webhook_id, run_id, response_code, sent_at, created_at \
             FROM webhook_deliveries WHERE run_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt
            .query_map(params![run_id], row_to_delivery)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("deliveries_for_run")?;
        Ok(rows)
    }

    /// Most recently sent delivery for a webhook.
    pub fn last_delivery(&self, webhook_id: i64) -> Result<Option<WebhookDelivery>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let row = conn
            .query_row(
                "SELECT id, webhook_id, run_id, response_code, sent_at, created_at \
                 FROM webhook_deliveries WHERE webhook_id = ?1 AND sent_at IS NOT NULL \
                 ORDER BY sent_at DESC, id DESC LIMIT 1",
                params![webhook_id],
                row_to_delivery,
            )
            .optional()
            .context("last_delivery")?;
        Ok(row)
    }

    // ── Run queue ─────────────────────────────────────────────────────────

    pub fn enqueue_job(&self, run_id: i64) -> Result<i64> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO run_jobs (run_id, state, available_at) VALUES (?1, 'pending', ?2) \
             ON CONFLICT(run_id) DO UPDATE SET state = 'pending', claimed_by = NULL, \
             available_at = excluded.available_at",
            params![run_id, now_str()],
        )
        .context("enqueue_job")?;
        let id = conn
            .query_row(
                "SELECT id FROM run_jobs WHERE run_id = ?1",
                params![run_id],
                |row| row.get(0),
            )
            .context("enqueue_job reload")?;
        Ok(id)
    }

    /// Claim the oldest available job for `worker`.
    pub fn claim_next_job(&self, worker: &str) -> Result<Option<RunJob>> {
        let mut conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("claim_next_job begin")?;
        let job = tx
            .query_row(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM run_jobs \
                     WHERE state IN ('pending', 'retry') AND available_at <= ?1 \
                     ORDER BY available_at ASC, id ASC LIMIT 1"
                ),
                params![now_str()],
                row_to_job,
            )
            .optional()
            .context("claim_next_job select")?;
        let Some(mut job) = job else {
            return Ok(None);
        };
        tx.execute(
            "UPDATE run_jobs SET state = 'claimed', claimed_by = ?1, attempts = attempts + 1 \
             WHERE id = ?2",
            params![worker, job.id],
        )
        .context("claim_next_job update")?;
        tx.commit().context("claim_next_job commit")?;
        job.state = JobState::Claimed;
        job.claimed_by = Some(worker.to_string());
        job.attempts += 1;
        Ok(Some(job))
    }

    pub fn complete_job(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute("DELETE FROM run_jobs WHERE id = ?1", params![id])
            .context("complete_job")?;
        Ok(())
    }

    pub fn retry_job(&self, id: i64, error: &str, available_at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE run_jobs SET state = 'retry', claimed_by = NULL, last_error = ?1, \
             available_at = ?2 WHERE id = ?3",
            params![error, fmt_ts(available_at), id],
        )
        .context("retry_job")?;
        Ok(())
    }

    pub fn list_jobs(&self, state: JobState) -> Result<Vec<RunJob>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM run_jobs WHERE state = ?1 ORDER BY id ASC"
        ))?;
        let jobs = stmt
            .query_map(params![state.as_str()], row_to_job)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list_jobs")?;
        Ok(jobs)
    }

    /// Run ids of every job still owed processing, read in one statement so a
    /// job moving between states is never missed.
    pub fn queued_run_ids(&self) -> Result<Vec<i64>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT run_id FROM run_jobs WHERE state IN ('pending', 'retry', 'claimed') \
             ORDER BY run_id ASC",
        )?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()
            .context("queued_run_ids")?;
        Ok(ids)
    }

    /// Return claims not held by a worker of the current process to pending.
    pub fn release_foreign_claims(&self, incarnation: &str) -> Result<usize> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let n = conn
            .execute(
                "UPDATE run_jobs SET state = 'pending', claimed_by = NULL \
                 WHERE state = 'claimed' AND (claimed_by IS NULL OR claimed_by NOT LIKE ?1)",
                params![format!("{incarnation}:%")],
            )
            .context("release_foreign_claims")?;
        Ok(n)
    }

    // ── Config ────────────────────────────────────────────────────────────

    pub fn get_config(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let value = conn
            .query_row(
                "SELECT value FROM config WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .context("get_config")?;
        Ok(value)
    }

    pub fn set_config(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO config (key, value, updated_at) VALUES (?1, ?2, datetime('now')) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value],
        )
        .context("set_config")?;
        Ok(())
    }
}
