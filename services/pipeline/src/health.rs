//! Liveness, readiness and the health/metrics HTTP surface.

use crate::config::HealthConfig;
use crate::inference::Detector;
use crate::metrics::PipelineMetrics;
use crate::storage::ObjectStore;
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// Shared view of process health.
///
/// Liveness needs a heartbeat ticked from the runtime and recent progress from
/// every registered channel worker. Readiness additionally requires the
/// inference endpoint and the object store to have been reachable recently,
/// either through a probe or a real call.
#[derive(Debug)]
pub struct HealthState {
    heartbeat: Mutex<Instant>,
    workers: Mutex<HashMap<String, Instant>>,
    inference_ok: Mutex<Option<Instant>>,
    storage_ok: Mutex<Option<Instant>>,
    liveness_window: Duration,
    readiness_window: Duration,
    requires_dependencies: bool,
}

/// JSON body of `/health` and `/ready`.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct HealthReport {
    pub status: &'static str,
    pub live: bool,
    pub inference_reachable: bool,
    pub storage_reachable: bool,
    pub heartbeat_age_ms: u64,
    /// Workers with no progress inside the liveness window
    pub stalled_workers: Vec<String>,
}

impl HealthState {
    pub fn new(config: &HealthConfig) -> Self {
        Self {
            heartbeat: Mutex::new(Instant::now()),
            workers: Mutex::new(HashMap::new()),
            inference_ok: Mutex::new(None),
            storage_ok: Mutex::new(None),
            liveness_window: config.liveness_window(),
            readiness_window: config.readiness_window(),
            requires_dependencies: true,
        }
    }

    /// Readiness follows liveness alone. Used when this process neither
    /// runs inference nor writes to storage.
    pub fn without_dependencies(mut self) -> Self {
        self.requires_dependencies = false;
        self
    }

    pub fn tick(&self) {
        *self.heartbeat.lock() = Instant::now();
    }

    /// Record that `worker` is still making progress, registering it on the
    /// first call.
    pub fn worker_progress(&self, worker: &str) {
        let now = Instant::now();
        let mut workers = self.workers.lock();
        match workers.get_mut(worker) {
            Some(at) => *at = now,
            None => {
                workers.insert(worker.to_string(), now);
            }
        }
    }

    /// Forget a worker that stopped on purpose.
    pub fn worker_stopped(&self, worker: &str) {
        self.workers.lock().remove(worker);
    }

    /// Registered workers whose last progress is older than the liveness
    /// window, sorted by name.
    pub fn stalled_workers(&self) -> Vec<String> {
        let mut stalled: Vec<String> = self
            .workers
            .lock()
            .iter()
            .filter(|(_, at)| at.elapsed() > self.liveness_window)
            .map(|(name, _)| name.clone())
            .collect();
        stalled.sort();
        stalled
    }

    pub fn mark_inference_ok(&self) {
        *self.inference_ok.lock() = Some(Instant::now());
    }

    pub fn mark_storage_ok(&self) {
        *self.storage_ok.lock() = Some(Instant::now());
    }

    fn recent(&self, at: Option<Instant>) -> bool {
        at.map_or(false, |t| t.elapsed() <= self.readiness_window)
    }

    pub fn inference_reachable(&self) -> bool {
        self.recent(*self.inference_ok.lock())
    }

    pub fn storage_reachable(&self) -> bool {
        self.recent(*self.storage_ok.lock())
    }

    pub fn is_live(&self) -> bool {
        self.heartbeat.lock().elapsed() <= self.liveness_window && self.stalled_workers().is_empty()
    }

    fn dependencies_reachable(&self) -> bool {
        !self.requires_dependencies || (self.inference_reachable() && self.storage_reachable())
    }

    pub fn is_ready(&self) -> bool {
        self.is_live() && self.dependencies_reachable()
    }

    pub fn report(&self) -> HealthReport {
        let stalled_workers = self.stalled_workers();
        let live = self.heartbeat.lock().elapsed() <= self.liveness_window && stalled_workers.is_empty();
        let inference_reachable = self.inference_reachable();
        let storage_reachable = self.storage_reachable();
        let status = match (live, self.dependencies_reachable()) {
            (true, true) => "ready",
            (true, false) => "not_ready",
            (false, _) => "unhealthy",
        };

        HealthReport {
            status,
            live,
            inference_reachable,
            storage_reachable,
            heartbeat_age_ms: self.heartbeat.lock().elapsed().as_millis() as u64,
            stalled_workers,
        }
    }
}

/// Probes the dependencies readiness depends on.
#[derive(Clone)]
pub struct DependencyProbe {
    detector: Arc<dyn Detector>,
    store: Arc<dyn ObjectStore>,
    buckets: Vec<String>,
}

impl DependencyProbe {
    pub fn new(detector: Arc<dyn Detector>, store: Arc<dyn ObjectStore>, buckets: Vec<String>) -> Self {
        Self {
            detector,
            store,
            buckets,
        }
    }

    /// Probe everything once, recording successes in `state`.
    pub async fn probe_once(&self, state: &HealthState) {
        match self.detector.probe().await {
            Ok(()) => state.mark_inference_ok(),
            Err(e) => warn!(error = %e, "Inference endpoint probe failed"),
        }

        let mut storage_ok = true;
        for bucket in &self.buckets {
            if let Err(e) = self.store.probe(bucket).await {
                warn!(bucket = %bucket, error = %e, "Storage probe failed");
                storage_ok = false;
            }
        }
        if storage_ok {
            state.mark_storage_ok();
        }
    }

    /// Probe until both dependencies are reachable or `timeout` passes.
    pub async fn wait_ready(
        &self,
        state: &HealthState,
        interval: Duration,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            self.probe_once(state).await;
            if state.inference_reachable() && state.storage_reachable() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }

            let wake = (Instant::now() + interval).min(deadline);
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep_until(wake) => {}
            }
        }
    }

    /// Probe every `interval` until cancelled.
    pub async fn run(self, state: Arc<HealthState>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.probe_once(&state).await;
                    debug!(ready = state.is_ready(), "Dependency probe finished");
                }
            }
        }
    }
}

/// Tick the liveness heartbeat until cancelled. Stops ticking if the runtime
/// stops scheduling this task.
pub async fn run_heartbeat(state: Arc<HealthState>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => state.tick(),
        }
    }
}

/// State shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub health: Arc<HealthState>,
    pub metrics: Arc<PipelineMetrics>,
}

/// Create the health and metrics router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn status_for(ok: bool) -> StatusCode {
    if ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Liveness endpoint
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let report = state.health.report();
    (status_for(report.live), Json(report))
}

/// Readiness endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let report = state.health.report();
    (status_for(report.status == "ready"), Json(report))
}

/// Prometheus text exposition
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

/// Serve the router on `listener` until cancelled.
pub async fn serve(listener: TcpListener, state: AppState, cancel: CancellationToken) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(address = %addr, "Starting health server");
    }

    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
}
