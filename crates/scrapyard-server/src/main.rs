mod logging;
mod routes;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::{
    routing::{get, post, put},
    Router,
};
use scrapyard_core::{
    config::Config,
    db::Db,
    docker::DockerCli,
    github::GitHubApp,
    maintenance::ContainerMaintenance,
    queue::{new_incarnation, worker_id, DbQueue, TaskQueue},
    reconcile::ReconciliationSweep,
    scheduler::{RunScheduler, SchedulerConfig},
    sync::RepoSync,
    webhook::WebhookDispatcher,
};
use tokio::sync::broadcast;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;

use crate::logging::BroadcastLayer;

// ── AppState ──────────────────────────────────────────────────────────────

pub struct AppState {
    pub db: Arc<Db>,
    pub config: Arc<Config>,
    pub queue: Arc<dyn TaskQueue>,
    pub scheduler: Arc<RunScheduler>,
    pub sweep: Arc<ReconciliationSweep>,
    pub dispatcher: Arc<WebhookDispatcher>,
    pub maintenance: Arc<ContainerMaintenance>,
    /// `None` when no source-host app is configured.
    pub sync: Option<Arc<RepoSync>>,
    pub incarnation: String,
    pub start_time: Instant,
    pub log_tx: broadcast::Sender<String>,
    pub log_ring: Arc<Mutex<VecDeque<String>>>,
}

// ── main ──────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let (log_tx, _) = broadcast::channel::<String>(1024);
    let log_ring = Arc::new(Mutex::new(VecDeque::new()));
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "scrapyard_server=info,scrapyard_core=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(BroadcastLayer {
            tx: log_tx.clone(),
            ring: Arc::clone(&log_ring),
        })
        .init();

    let config = Config::from_env()?;

    std::fs::create_dir_all(&config.data_dir)?;
    let db_path = format!("{}/scrapyard.db", config.data_dir);
    let mut db = Db::open(&db_path)?;
    db.migrate()?;
    config.seed_db(&db)?;
    let config = config.load_from_db(&db);

    let db = Arc::new(db);
    let config = Arc::new(config);

    if !DockerCli::available().await {
        warn!("docker is not reachable; runs will fail to start until it is");
    }
    let docker = Arc::new(DockerCli::new(&config.container_image, &config.scraper_command));
    let queue: Arc<dyn TaskQueue> = Arc::new(DbQueue::new(Arc::clone(&db)));
    let maintenance = Arc::new(ContainerMaintenance::new(docker.clone()));
    let dispatcher = Arc::new(WebhookDispatcher::new(
        Arc::clone(&db),
        config.webhook_timeout(),
    )?);
    let scheduler = Arc::new(RunScheduler::new(
        Arc::clone(&db),
        Arc::clone(&queue),
        docker.clone(),
        Arc::clone(&maintenance),
        Arc::clone(&dispatcher),
        SchedulerConfig::from_config(&config),
    ));
    let sweep = Arc::new(
        ReconciliationSweep::new(Arc::clone(&db), Arc::clone(&queue), Arc::clone(&maintenance))
            .with_admission_gate(scheduler.admission_gate()),
    );
    let sync = match GitHubApp::from_config(&config)? {
        Some(app) => Some(Arc::new(RepoSync::new(
            Arc::clone(&db),
            Arc::new(app),
            config.repo_root.clone(),
        ))),
        None => {
            warn!("GITHUB_APP_ID not set; repository sync disabled");
            None
        }
    };

    // Jobs claimed by a previous process will never be acknowledged by it.
    let incarnation = new_incarnation();
    let released = queue.release_foreign_claims(&incarnation).await?;
    if released > 0 {
        info!(released, "requeued jobs claimed before restart");
    }

    let state = Arc::new(AppState {
        db: Arc::clone(&db),
        config: Arc::clone(&config),
        queue,
        scheduler: Arc::clone(&scheduler),
        sweep: Arc::clone(&sweep),
        dispatcher: Arc::clone(&dispatcher),
        maintenance: Arc::clone(&maintenance),
        sync,
        incarnation: incarnation.clone(),
        start_time: Instant::now(),
        log_tx,
        log_ring,
    });

    // Startup recovery, then the periodic sweep.
    {
        let state = Arc::clone(&state);
        let interval = config.sweep_interval_s.max(1);
        tokio::spawn(async move {
            loop {
                if let Err(e) = routes::sweep_and_notify(&state).await {
                    error!("sweep failed: {e:#}");
                }
                tokio::time::sleep(Duration::from_secs(interval)).await;
            }
        });
    }

    // Run workers
    for n in 0..config.worker_count.max(1) {
        let scheduler = Arc::clone(&scheduler);
        let worker = worker_id(&incarnation, n);
        let poll = Duration::from_millis(config.worker_poll_ms.max(10));
        tokio::spawn(async move {
            info!(worker = %worker, "worker started");
            loop {
                match scheduler.work_once(&worker).await {
                    Ok(true) => {}
                    Ok(false) => tokio::time::sleep(poll).await,
                    Err(e) => {
                        error!(worker = %worker, "worker error: {e:#}");
                        tokio::time::sleep(poll).await;
                    }
                }
            }
        });
    }

    // Image garbage collection
    {
        let maintenance = Arc::clone(&maintenance);
        let interval = config.gc_interval_s.max(60);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(interval)).await;
                maintenance.collect_garbage().await;
            }
        });
    }

    // Auto runs
    if config.auto_run_interval_s > 0 {
        let scheduler = Arc::clone(&scheduler);
        let interval = config.auto_run_interval_s;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(interval)).await;
                if let Err(e) = scheduler.queue_auto_runs().await {
                    error!("auto-run queueing failed: {e:#}");
                }
            }
        });
    }

    let app = Router::new()
        // Health
        .route("/api/health", get(routes::health))
        // Scrapers
        .route("/api/scrapers/:id/queue", post(routes::queue_scraper))
        .route("/api/scrapers/:id/sync", post(routes::sync_scraper))
        .route("/api/scrapers/:id/runs", get(routes::list_runs))
        .route("/api/scrapers/:id/variables", get(routes::list_variables))
        .route(
            "/api/scrapers/:id/variables/:name",
            put(routes::put_variable).delete(routes::delete_variable),
        )
        // Runs
        .route("/api/runs/:id", get(routes::get_run).delete(routes::delete_run))
        .route("/api/runs/:id/stop", post(routes::stop_run))
        .route("/api/runs/:id/dispatch", post(routes::dispatch_run))
        // Queue / maintenance
        .route("/api/queue", get(routes::list_queue))
        .route("/api/sweep", post(routes::run_sweep))
        .route("/api/gc", post(routes::run_gc))
        // SSE logs
        .route("/api/logs", get(routes::sse_logs))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state);

    let addr = format!("{}:{}", config.web_bind, config.web_port);
    info!(incarnation = %incarnation, "Listening on {addr}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
