use crate::client::DelayClient;
use crate::config::FanOutConfig;
use crate::fanout;
use crate::watchdog::{self, Watchdog};
use axum::{
    extract::{Path, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::Response,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::trace::TraceLayer;

pub type ServeError = Box<dyn std::error::Error + Send + Sync>;

/// Counters for the delay endpoint.
#[derive(Debug, Default)]
pub struct DelayStats {
    invocations: AtomicU64,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl DelayStats {
    fn enter(&self) -> InFlight<'_> {
        self.invocations.fetch_add(1, Ordering::Relaxed);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        InFlight(self)
    }
}

/// Decrements the in-flight gauge when the request ends, including on cancellation.
struct InFlight<'a>(&'a DelayStats);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub invocations: u64,
    pub in_flight: usize,
    pub peak_in_flight: usize,
    pub blocking_reports: u64,
}

#[derive(Clone)]
pub struct AppState {
    client: DelayClient,
    fanout: FanOutConfig,
    stats: Arc<DelayStats>,
    watchdog: Option<Watchdog>,
}

impl AppState {
    pub fn new(client: DelayClient, fanout: FanOutConfig, watchdog: Option<Watchdog>) -> Self {
        Self {
            client,
            fanout,
            stats: Arc::new(DelayStats::default()),
            watchdog,
        }
    }

    fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            invocations: self.stats.invocations.load(Ordering::Relaxed),
            in_flight: self.stats.in_flight.load(Ordering::SeqCst),
            peak_in_flight: self.stats.peak_in_flight.load(Ordering::SeqCst),
            blocking_reports: self.watchdog.as_ref().map_or(0, Watchdog::reports),
        }
    }
}

/// Build the application router. With a watchdog, every handler runs in its context.
pub fn router(state: AppState) -> Router {
    let watchdog = state.watchdog.clone();

    let app = Router::new()
        .route("/health", get(health))
        .route("/test", get(fan_out_test))
        .route("/test/delay/{id}", get(delay))
        .route("/test/stats", get(stats))
        .with_state(state);

    let app = match watchdog {
        Some(watchdog) => app.layer(middleware::from_fn_with_state(watchdog, watchdog_scope)),
        None => app,
    };
    app.layer(TraceLayer::new_for_http())
}

/// Bind the configured address and serve until the listener fails.
pub async fn run(
    bind: &str,
    port: u16,
    fanout: FanOutConfig,
    watchdog: Option<Watchdog>,
) -> Result<(), ServeError> {
    let addr = format!("{}:{}", bind, port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    serve(listener, fanout, watchdog).await
}

/// Serve on an already bound listener. Sub-requests target the bound port.
pub async fn serve(
    listener: tokio::net::TcpListener,
    fanout: FanOutConfig,
    watchdog: Option<Watchdog>,
) -> Result<(), ServeError> {
    let local_addr = listener.local_addr()?;
    let client = DelayClient::for_listener(local_addr)?;
    tracing::info!(
        base_url = client.base_url(),
        watchdog = watchdog.is_some(),
        "serve listening on {local_addr}"
    );

    let app = router(AppState::new(client, fanout, watchdog));
    axum::serve(listener, app).await?;
    Ok(())
}

async fn watchdog_scope(
    State(watchdog): State<Watchdog>,
    request: Request,
    next: Next,
) -> Response {
    watchdog.scope(next.run(request)).await
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({"ok": true, "watchdog": state.watchdog.is_some()}))
}

async fn stats(State(state): State<AppState>) -> Json<StatsSnapshot> {
    Json(state.snapshot())
}

/// Fan out `total` delay sub-requests and answer once every one has finished.
async fn fan_out_test(
    State(state): State<AppState>,
) -> Result<&'static str, (StatusCode, String)> {
    let FanOutConfig {
        total, concurrency, ..
    } = state.fanout;
    let client = state.client.clone();
    let watchdog = state.watchdog.clone();
    let start = Instant::now();

    let summary = fanout::fan_out(0..total, concurrency, move |id| {
        let client = client.clone();
        let request = async move { client.delay(id).await.map(drop) };
        watchdog::scope_with(watchdog.as_ref(), request)
    })
    .await
    .map_err(|e| {
        tracing::warn!(error = %e, "fan-out failed");
        (StatusCode::BAD_GATEWAY, e.to_string())
    })?;

    tracing::info!(
        completed = summary.completed,
        concurrency,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "fan-out complete"
    );
    Ok("ok")
}

/// Wait on a timer (never a thread sleep), log, and echo the id.
async fn delay(State(state): State<AppState>, Path(id): Path<String>) -> String {
    let _in_flight = state.stats.enter();
    tokio::time::sleep(Duration::from_millis(state.fanout.delay_ms)).await;
    tracing::info!("complete delay id: {id}");
    id
}
