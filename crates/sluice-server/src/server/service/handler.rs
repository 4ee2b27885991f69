use super::work::WorkOutput;
use crate::server::telemetry::{
    decrement_requests_inflight, increment_request_errors, increment_requests,
    increment_requests_inflight, record_request_duration,
};
use axum::Router;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{any, get};
use bytes::Bytes;
use chrono::{SecondsFormat, Utc};
use core::convert::Infallible;
use core::time::Duration;
use futures::{Stream, StreamExt};
use portable_atomic::{AtomicU64, Ordering};
use serde::Serialize;
use sluice::{Error, Job, JobId, MetricsSnapshot, Priority, WorkerPool};
use std::sync::Arc;
use std::time::Instant;
use tokio::time::MissedTickBehavior;
use tokio_stream::wrappers::IntervalStream;
use tokio_util::sync::CancellationToken;
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::RequestBodyTimeoutLayer;

pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const PRIORITY_HEADER: &str = "x-priority";

/// Cadence of `/sse/metrics` events.
const SSE_INTERVAL: Duration = Duration::from_secs(1);

/// Connection-level counters, kept apart from the pool's own job counters:
/// a request rejected at submission never becomes a job.
#[derive(Debug, Default)]
pub struct RequestMetrics {
    active: AtomicU64,
    total: AtomicU64,
    completed: AtomicU64,
    errors: AtomicU64,
}

impl RequestMetrics {
    fn begin(&self) -> InFlight<'_> {
        self.active.fetch_add(1, Ordering::Relaxed);
        self.total.fetch_add(1, Ordering::Relaxed);
        increment_requests();
        increment_requests_inflight();
        InFlight { metrics: self }
    }

    fn record_error(&self, status: StatusCode) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        increment_request_errors(status.as_u16());
    }

    pub fn stats(&self) -> RequestStats {
        RequestStats {
            active_connections: self.active.load(Ordering::Relaxed),
            total_requests: self.total.load(Ordering::Relaxed),
            completed_requests: self.completed.load(Ordering::Relaxed),
            error_count: self.errors.load(Ordering::Relaxed),
        }
    }
}

struct InFlight<'a> {
    metrics: &'a RequestMetrics,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.metrics.active.fetch_sub(1, Ordering::Relaxed);
        self.metrics.completed.fetch_add(1, Ordering::Relaxed);
        decrement_requests_inflight();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RequestStats {
    pub active_connections: u64,
    pub total_requests: u64,
    pub completed_requests: u64,
    pub error_count: u64,
}

/// Body of `/metrics` and of every `/sse/metrics` event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerStats {
    #[serde(flatten)]
    pub requests: RequestStats,
    #[serde(flatten)]
    pub pool: MetricsSnapshot,
}

/// Transport limits applied to every route.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HttpLimits {
    /// Requests handled at once across all connections; later ones wait for
    /// a slot.
    pub max_connections: usize,
    /// Time allowed to receive a request body.
    pub read_timeout: Duration,
}

impl Default for HttpLimits {
    fn default() -> Self {
        Self {
            max_connections: 100_000,
            read_timeout: Duration::from_secs(15),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pool: WorkerPool<Bytes, WorkOutput>,
    requests: Arc<RequestMetrics>,
    request_timeout: Duration,
    limits: HttpLimits,
    shutdown: CancellationToken,
}

impl AppState {
    pub fn new(
        pool: WorkerPool<Bytes, WorkOutput>,
        request_timeout: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            pool,
            requests: Arc::new(RequestMetrics::default()),
            request_timeout,
            limits: HttpLimits::default(),
            shutdown,
        }
    }

    pub fn with_limits(mut self, limits: HttpLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn stats(&self) -> ServerStats {
        ServerStats {
            requests: self.requests.stats(),
            pool: self.pool.metrics(),
        }
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }
}

/// HTTP rendering of a failed job or submission.
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            Error::PoolSaturated { .. } | Error::PoolShuttingDown | Error::CircuitOpen => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Error::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Error::Timeout { .. } => StatusCode::REQUEST_TIMEOUT,
            Error::WorkerPanic { .. }
            | Error::JobFailed { .. }
            | Error::Abandoned
            | Error::InvalidConfig { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self.0 {
            Error::PoolSaturated { .. } | Error::PoolShuttingDown | Error::CircuitOpen => {
                "Server overloaded".to_owned()
            }
            Error::Timeout { .. } => "Request timeout".to_owned(),
            other => other.to_string(),
        };
        (status, message).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    let limits = state.limits;
    Router::new()
        .route("/", any(process))
        .route("/metrics", get(metrics))
        .route("/health", get(health))
        .route("/sse/metrics", get(sse_metrics))
        .fallback(not_found)
        .layer(RequestBodyTimeoutLayer::new(limits.read_timeout))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(GlobalConcurrencyLimitLayer::new(limits.max_connections))
        .with_state(state)
}

/// Runs the request body through the worker pool and answers with the job's
/// output.
async fn process(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WorkOutput>, ApiError> {
    let _in_flight = state.requests.begin();
    let started = Instant::now();

    let request_id = headers
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map_or_else(JobId::generate, JobId::from);
    let priority = headers
        .get(PRIORITY_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<Priority>().ok())
        .unwrap_or_default();

    let job = Job::new(body).with_id(request_id).with_priority(priority);
    let outcome = state.pool.submit_and_await(job, state.request_timeout).await;
    record_request_duration(started.elapsed().as_secs_f64() * 1000.0);

    outcome.map(Json).map_err(|err| {
        let err = ApiError::from(err);
        state.requests.record_error(err.status());
        #[cfg(feature = "tracing")]
        if err.0.is_rejection() {
            tracing::debug!("Request rejected: {}", err.0);
        } else {
            tracing::warn!("Request failed: {}", err.0);
        }
        err
    })
}

async fn metrics(State(state): State<AppState>) -> Json<ServerStats> {
    Json(state.stats())
}

#[derive(Debug, Serialize)]
struct Health {
    status: &'static str,
    time: String,
}

async fn health() -> Json<Health> {
    Json(Health {
        status: "healthy",
        time: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
    })
}

/// Streams one stats snapshot per second until the client goes away or the
/// server starts shutting down.
async fn sse_metrics(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut ticker = tokio::time::interval(SSE_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let stopped = state.shutdown.clone().cancelled_owned();
    let stream = IntervalStream::new(ticker)
        .map(move |_| {
            let data =
                serde_json::to_string(&state.stats()).unwrap_or_else(|_| "{}".to_owned());
            Ok(Event::default().data(data))
        })
        .take_until(stopped);

    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn not_found() -> (StatusCode, &'static str) {
    (StatusCode::NOT_FOUND, "Not found")
}
