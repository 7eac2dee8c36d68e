/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::config::BridgyConfig;
use crate::endpoint_cache::EndpointCache;
use crate::engine::Engine;
use crate::http_fetch::HttpFetcher;
use crate::models::now_ms;
use crate::silo::SiloRegistry;
use crate::store::BridgyDb;
use crate::task_queue::{TaskHandler, TaskOutcome, TaskQueue};
use crate::urls::TargetFilter;
use anyhow::{Context, Result};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use bridgy_protocol::{QueueName, QueueTask};
use serde_json::json;
use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    thread,
    time::Duration,
};
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

static HANDLE_SEQ: AtomicU64 = AtomicU64::new(1);

struct RunningService {
    shutdown_tx: watch::Sender<bool>,
    join: Option<thread::JoinHandle<()>>,
}

static REGISTRY: Mutex<Vec<(u64, RunningService)>> = Mutex::new(Vec::new());

/// Opens the database and wires the engine for `cfg`. Silo domains are
/// added to the target blocklist.
pub fn build_engine(cfg: &BridgyConfig, silos: SiloRegistry) -> Result<Engine> {
    let db_path = cfg.db_path()?;
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create data dir: {}", parent.display()))?;
    }
    let db = BridgyDb::open(&db_path)?;
    let queue = TaskQueue::open(&db_path)?;

    let mut blocklist = cfg.domain_blocklist()?;
    blocklist.extend(silos.domains());
    let filter = TargetFilter::new(blocklist, cfg.production);
    let fetcher = HttpFetcher::new(cfg.http_timeout(), filter, cfg.conneg_domains.clone())?;

    let engine = Engine::new(
        db,
        queue,
        fetcher,
        silos,
        EndpointCache::shared(),
        cfg.host_url.clone(),
    )?;
    Ok(engine.with_beta_users(cfg.beta_users()?))
}

/// Task queue push endpoints plus the cron sweep.
pub fn router(engine: Arc<Engine>) -> Router {
    Router::new()
        .route("/queue/:name", post(handle_task))
        .route("/cron/replace_poll_tasks", get(replace_poll_tasks))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(engine)
        .layer(TraceLayer::new_for_http())
}

async fn handle_task(
    State(engine): State<Arc<Engine>>,
    Path(name): Path<String>,
    body: String,
) -> (StatusCode, String) {
    let Some(queue) = QueueName::from_str(&name) else {
        return (StatusCode::NOT_FOUND, format!("no queue {name}"));
    };
    let task = match QueueTask::from_form(queue, &body) {
        Ok(task) => task,
        Err(e) => {
            warn!("bad {queue} task: {e}");
            return (StatusCode::BAD_REQUEST, e.to_string());
        }
    };
    let outcome = engine.handle(task).await;
    let status = StatusCode::from_u16(outcome.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = match outcome {
        TaskOutcome::Done => "OK".to_string(),
        TaskOutcome::Retry(reason) => reason,
        TaskOutcome::Failed(e) => format!("{e:#}"),
    };
    (status, body)
}

async fn replace_poll_tasks(State(engine): State<Arc<Engine>>) -> (StatusCode, Json<serde_json::Value>) {
    match engine.scheduler.sweep(now_ms()).await {
        Ok(queued) => (StatusCode::OK, Json(json!({ "queued": queued }))),
        Err(e) => {
            error!("sweep failed: {e:#}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": format!("{e:#}") })),
            )
        }
    }
}

pub fn start_sweep_worker(engine: Arc<Engine>, every: Duration, mut shutdown: watch::Receiver<bool>) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(every);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() { break; }
                }
                _ = tick.tick() => {}
            }

            if *shutdown.borrow() {
                break;
            }

            if let Err(e) = engine.scheduler.sweep(now_ms()).await {
                warn!("sweep error: {e:#}");
            }
        }
    });
}

/// Starts a service with no silo adapters registered; tasks for unknown
/// silos complete as no-ops.
pub fn start(cfg: BridgyConfig) -> Result<u64> {
    start_with_silos(cfg, SiloRegistry::new())
}

pub fn start_with_silos(cfg: BridgyConfig, silos: SiloRegistry) -> Result<u64> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("info".parse().expect("valid directive")),
        )
        .try_init()
        .ok();

    let handle = HANDLE_SEQ.fetch_add(1, Ordering::Relaxed);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let join = thread::spawn(move || {
        if let Err(e) = run_service(cfg, silos, shutdown_rx) {
            error!("bridgy runtime failed: {e:#}");
        }
    });

    let mut reg = REGISTRY.lock().unwrap_or_else(|e| e.into_inner());
    reg.push((
        handle,
        RunningService {
            shutdown_tx,
            join: Some(join),
        },
    ));

    Ok(handle)
}

pub fn stop(handle: u64) -> Result<()> {
    let running = {
        let mut reg = REGISTRY.lock().unwrap_or_else(|e| e.into_inner());
        let idx = reg
            .iter()
            .position(|(h, _)| *h == handle)
            .context("invalid handle")?;
        let (_, mut running) = reg.swap_remove(idx);
        let _ = running.shutdown_tx.send(true);
        running.join.take()
    };

    if let Some(j) = running {
        thread::spawn(move || {
            let _ = j.join();
        });
    }
    Ok(())
}

fn run_service(
    cfg: BridgyConfig,
    silos: SiloRegistry,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<()> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("build tokio runtime")?;

    rt.block_on(async move {
        if silos.is_empty() {
            warn!("no silo adapters registered; poll tasks will be no-ops");
        }
        let engine = Arc::new(build_engine(&cfg, silos)?);
        info!("bridgy db: {}", engine.db.path().display());

        let handler: Arc<dyn TaskHandler> = engine.clone();
        engine
            .queue
            .start_worker(shutdown_rx.clone(), handler, cfg.queue);
        start_sweep_worker(engine.clone(), cfg.sweep_interval(), shutdown_rx.clone());

        let addr: SocketAddr = cfg.bind.parse().context("parse bind")?;
        let listener = tokio::net::TcpListener::bind(addr).await.context("bind")?;
        info!("bridgy local server http://{}", listener.local_addr()?);

        let (server_shutdown_tx, mut server_shutdown_rx) = watch::channel(false);
        let app = router(engine);
        let server = tokio::spawn(async move {
            let shutdown = async move {
                let _ = server_shutdown_rx.changed().await;
            };
            axum::serve(listener, app.into_make_service())
                .with_graceful_shutdown(shutdown)
                .await
        });

        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            if shutdown_rx.changed().await.is_err() {
                break;
            }
        }
        let _ = server_shutdown_tx.send(true);
        let _ = server.await;
        info!("bridgy runtime stopped");
        Ok::<(), anyhow::Error>(())
    })
}
