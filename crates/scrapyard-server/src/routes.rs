use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use scrapyard_core::{
    reconcile::SweepReport, scheduler::QueueOutcome, types::is_valid_variable_name, JobState,
};
use secrecy::SecretString;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio_stream::{wrappers::UnboundedReceiverStream, StreamExt};
use tracing::{info, warn};

use crate::AppState;

pub(crate) fn internal(e: impl std::fmt::Display) -> StatusCode {
    tracing::error!("internal error: {e}");
    StatusCode::INTERNAL_SERVER_ERROR
}

// ── Request types ─────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub(crate) struct RunsQuery {
    limit: Option<i64>,
}

#[derive(Deserialize)]
pub(crate) struct VariableBody {
    value: SecretString,
}

// ── Sweep ─────────────────────────────────────────────────────────────────

/// Run one reconciliation sweep and notify webhooks for every run it
/// repaired.
pub(crate) async fn sweep_and_notify(state: &AppState) -> anyhow::Result<SweepReport> {
    let report = state.sweep.sweep().await?;
    for &run_id in &report.repaired_runs {
        if let Err(e) = state.dispatcher.dispatch(run_id).await {
            warn!(run_id, "webhook: dispatch for repaired run failed: {e:#}");
        }
    }
    Ok(report)
}

pub(crate) async fn run_sweep(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Value>, StatusCode> {
    let report = sweep_and_notify(&state).await.map_err(internal)?;
    Ok(Json(json!(report)))
}

pub(crate) async fn run_gc(State(state): State<Arc<AppState>>) -> Json<Value> {
    let report = state.maintenance.collect_garbage().await;
    Json(json!(report))
}

// ── Health ────────────────────────────────────────────────────────────────

pub(crate) async fn health(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Value>, StatusCode> {
    let unfinished = state.db.unfinished_run_ids().map_err(internal)?;
    let claimed = state
        .queue
        .jobs(JobState::Claimed)
        .await
        .map_err(internal)?;
    Ok(Json(json!({
        "status": "ok",
        "incarnation": state.incarnation,
        "uptime_s": state.start_time.elapsed().as_secs(),
        "now": chrono::Utc::now().to_rfc3339(),
        "read_only": state.config.read_only,
        "unfinished_runs": unfinished.len(),
        "claimed_jobs": claimed.len(),
        "sync_enabled": state.sync.is_some(),
    })))
}

// Scrapers

pub(crate) async fn queue_scraper(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<(StatusCode, Json<Value>), StatusCode> {
    if state.db.get_scraper(id).map_err(internal)?.is_none() {
        return Err(StatusCode::NOT_FOUND);
    }
    match state.scheduler.queue(id).await.map_err(internal)? {
        QueueOutcome::Queued(run) => Ok((StatusCode::CREATED, Json(json!(run)))),
        QueueOutcome::NotRunnable => Ok((
            StatusCode::CONFLICT,
            Json(json!({ "error": "scraper already has a queued or running run" })),
        )),
        QueueOutcome::ReadOnly => Ok((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "read-only mode" })),
        )),
    }
}

pub(crate) async fn sync_scraper(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, StatusCode> {
    let Some(sync) = state.sync.as_ref() else {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    };
    if state.db.get_scraper(id).map_err(internal)?.is_none() {
        return Err(StatusCode::NOT_FOUND);
    }
    let outcome = sync.sync(id).await.map_err(internal)?;
    Ok(Json(json!({ "outcome": outcome, "succeeded": outcome.succeeded() })))
}

pub(crate) async fn list_runs(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Query(q): Query<RunsQuery>,
) -> Result<Json<Value>, StatusCode> {
    let limit = q.limit.unwrap_or(20).clamp(1, 500);
    let runs = state.db.list_runs(id, limit).map_err(internal)?;
    Ok(Json(json!(runs)))
}

// Variables

/// Names only; values never leave the server.
pub(crate) async fn list_variables(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, StatusCode> {
    if state.db.get_scraper(id).map_err(internal)?.is_none() {
        return Err(StatusCode::NOT_FOUND);
    }
    let names: Vec<String> = state
        .db
        .variables(id)
        .map_err(internal)?
        .into_iter()
        .map(|v| v.name)
        .collect();
    Ok(Json(json!(names)))
}

pub(crate) async fn put_variable(
    State(state): State<Arc<AppState>>,
    Path((id, name)): Path<(i64, String)>,
    Json(body): Json<VariableBody>,
) -> Result<StatusCode, StatusCode> {
    if !is_valid_variable_name(&name) {
        return Err(StatusCode::UNPROCESSABLE_ENTITY);
    }
    if state.db.get_scraper(id).map_err(internal)?.is_none() {
        return Err(StatusCode::NOT_FOUND);
    }
    state
        .db
        .set_variable(id, &name, &body.value)
        .map_err(internal)?;
    info!(scraper_id = id, variable = %name, "variable set via api");
    Ok(StatusCode::NO_CONTENT)
}

pub(crate) async fn delete_variable(
    State(state): State<Arc<AppState>>,
    Path((id, name)): Path<(i64, String)>,
) -> Result<StatusCode, StatusCode> {
    if state.db.delete_variable(id, &name).map_err(internal)? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(StatusCode::NOT_FOUND)
    }
}

// Runs

pub(crate) async fn get_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, StatusCode> {
    let run = state
        .db
        .get_run(id)
        .map_err(internal)?
        .ok_or(StatusCode::NOT_FOUND)?;
    let metrics = state.db.metrics_for_run(id).map_err(internal)?;
    let output = state.db.log_lines(id).map_err(internal)?;
    let deliveries = state.db.deliveries_for_run(id).map_err(internal)?;
    Ok(Json(json!({
        "run": run,
        "state": run.state(),
        "metrics": metrics,
        "output": output,
        "webhook_deliveries": deliveries,
    })))
}

/// Remove a finished run with its metrics and output. Webhook deliveries
/// are kept, detached from the run.
pub(crate) async fn delete_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<StatusCode, StatusCode> {
    let run = state
        .db
        .get_run(id)
        .map_err(internal)?
        .ok_or(StatusCode::NOT_FOUND)?;
    if !run.is_finished() {
        return Err(StatusCode::CONFLICT);
    }
    if !state.db.delete_run(id).map_err(internal)? {
        return Err(StatusCode::NOT_FOUND);
    }
    info!(run_id = id, "run deleted via api");
    Ok(StatusCode::NO_CONTENT)
}

pub(crate) async fn stop_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, StatusCode> {
    if state.db.get_run(id).map_err(internal)?.is_none() {
        return Err(StatusCode::NOT_FOUND);
    }
    let outcome = state.scheduler.stop(id).await.map_err(internal)?;
    info!(run_id = id, "stop requested via api");
    Ok(Json(json!({ "outcome": outcome })))
}

/// Redeliver webhooks for a finished run. Webhooks already notified for this
/// run are skipped.
pub(crate) async fn dispatch_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, StatusCode> {
    let run = state
        .db
        .get_run(id)
        .map_err(internal)?
        .ok_or(StatusCode::NOT_FOUND)?;
    if !run.is_finished() {
        return Err(StatusCode::CONFLICT);
    }
    let report = state.dispatcher.dispatch(id).await.map_err(internal)?;
    Ok(Json(json!(report)))
}

// Queue

pub(crate) async fn list_queue(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Value>, StatusCode> {
    let mut out = serde_json::Map::new();
    for job_state in [JobState::Pending, JobState::Retry, JobState::Claimed] {
        let jobs = state.queue.jobs(job_state).await.map_err(internal)?;
        out.insert(job_state.as_str().to_string(), json!(jobs));
    }
    Ok(Json(Value::Object(out)))
}

// ── SSE logs ──────────────────────────────────────────────────────────────

pub(crate) async fn sse_logs(
    State(state): State<Arc<AppState>>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, std::convert::Infallible>>> {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<String>();
    // Subscribe before snapshotting the ring so nothing falls in between.
    let mut live_rx = state.log_tx.subscribe();
    let history: Vec<String> = state
        .log_ring
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .iter()
        .cloned()
        .collect();
    tokio::spawn(async move {
        for line in history {
            if tx.send(line).is_err() {
                return;
            }
        }
        loop {
            match live_rx.recv().await {
                Ok(line) => {
                    if tx.send(line).is_err() {
                        return;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
    });
    let stream = UnboundedReceiverStream::new(rx)
        .map(|data| Ok::<_, std::convert::Infallible>(Event::default().data(data)));
    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(std::time::Duration::from_secs(15))
            .text("ping"),
    )
}
