//! HTTP server assembly
//!
//! Middleware runs outermost first: CORS, request logging, panic capture,
//! rate limiting, then API-key authentication in front of the route handlers.

use crate::{
    auth_middleware, rate_limit_middleware, routes, ApiKeyGate, CrawlError, CrawlService,
    SlidingWindowLimiter,
};
use axum::extract::Request;
use axum::http::HeaderValue;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use std::any::Any;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::CorsLayer;
use tracing::info;

/// State shared by every handler and middleware
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<CrawlService>,
    pub limiter: Arc<SlidingWindowLimiter>,
    pub api_keys: Arc<ApiKeyGate>,
    pub prometheus: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(service: Arc<CrawlService>, prometheus: Option<PrometheusHandle>) -> Self {
        let config = service.config();
        let limiter = Arc::new(SlidingWindowLimiter::from_config(&config.rate_limit));
        let api_keys = Arc::new(ApiKeyGate::from_config(&config.auth));

        Self {
            service,
            limiter,
            api_keys,
            prometheus,
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    routes::router()
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware))
        .layer(middleware::from_fn_with_state(state.clone(), rate_limit_middleware))
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(middleware::from_fn(request_logger))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Log every request and stamp `X-Response-Time` (seconds) on the response.
pub async fn request_logger(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let started = Instant::now();

    info!("Request: {} {}", method, path);
    let mut response = next.run(request).await;
    let elapsed = started.elapsed().as_secs_f64();

    info!(
        "Response: {} {} - Status: {} - Duration: {:.3}s",
        method,
        path,
        response.status().as_u16(),
        elapsed
    );
    if let Ok(value) = HeaderValue::from_str(&format!("{elapsed:.3}")) {
        response.headers_mut().insert("x-response-time", value);
    }

    response
}

fn panic_response(panic: Box<dyn Any + Send + 'static>) -> Response {
    let detail = if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else {
        "unknown panic payload".to_string()
    };

    CrawlError::Internal(format!("handler panicked: {detail}")).into_response()
}

/// Resolves once `signal` does, after the service has stopped taking work.
///
/// Requests arriving on open connections while the server drains see
/// `503` and an unhealthy probe instead of new crawls.
pub fn drain_on<F>(
    service: Arc<CrawlService>,
    signal: F,
) -> impl Future<Output = ()> + Send + 'static
where
    F: Future<Output = ()> + Send + 'static,
{
    async move {
        signal.await;
        service.begin_shutdown();
    }
}

/// Serve until `shutdown` resolves, then let in-flight requests finish.
///
/// The service stops accepting work as soon as `shutdown` fires. Pooled
/// workers are left running; callers dispose them with
/// `CrawlService::shutdown` after this returns.
pub async fn serve<F>(state: AppState, addr: SocketAddr, shutdown: F) -> Result<(), CrawlError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let sweeper = state
        .limiter
        .is_enabled()
        .then(|| state.limiter.spawn_sweeper(state.limiter.period()));

    let listener = TcpListener::bind(addr).await?;
    info!("Listening on http://{}", listener.local_addr()?);

    let shutdown = drain_on(state.service.clone(), shutdown);
    let app = build_router(state);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;

    if let Some(task) = sweeper {
        task.abort();
    }
    info!("HTTP server stopped");
    Ok(())
}
