use crate::server::AppState;
use crate::{check_health, CrawlError, CrawlOptions, DeepCrawlRequest, JobResult};
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::convert::Infallible;
use std::time::Duration;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(root))
        .route("/api/version", get(version))
        .route("/api/crawl/health", get(health))
        .route("/api/crawl/url", post(crawl_url))
        .route("/api/crawl/batch", post(crawl_batch))
        .route("/api/crawl/deep", post(crawl_deep))
        .route("/metrics", get(metrics))
}

/// Per-request job options shared by every crawl endpoint
#[derive(Debug, Default, Deserialize)]
pub struct RequestOptions {
    #[serde(default)]
    pub bypass_cache: bool,
    pub js_enabled: Option<bool>,
    pub timeout_ms: Option<u64>,
    pub admission_timeout_ms: Option<u64>,
    pub wait_for_ms: Option<u64>,
}

impl From<RequestOptions> for CrawlOptions {
    fn from(options: RequestOptions) -> Self {
        CrawlOptions {
            bypass_cache: options.bypass_cache,
            js_enabled: options.js_enabled.unwrap_or(true),
            timeout: options.timeout_ms.map(Duration::from_millis),
            admission_timeout: options.admission_timeout_ms.map(Duration::from_millis),
            wait_for: options.wait_for_ms.map(Duration::from_millis),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CrawlUrlBody {
    pub url: String,
    #[serde(flatten)]
    pub options: RequestOptions,
}

#[derive(Debug, Deserialize)]
pub struct CrawlBatchBody {
    pub urls: Vec<String>,
    #[serde(default)]
    pub stream: bool,
    #[serde(flatten)]
    pub options: RequestOptions,
}

#[derive(Debug, Deserialize)]
pub struct DeepCrawlBody {
    pub start_url: String,
    pub max_depth: Option<usize>,
    pub max_pages: Option<usize>,
    pub include_patterns: Option<Vec<String>>,
    pub exclude_patterns: Option<Vec<String>>,
    #[serde(default)]
    pub stream: bool,
    #[serde(flatten)]
    pub options: RequestOptions,
}

impl From<DeepCrawlBody> for DeepCrawlRequest {
    fn from(body: DeepCrawlBody) -> Self {
        let defaults = DeepCrawlRequest::new(body.start_url);
        DeepCrawlRequest {
            max_depth: body.max_depth.unwrap_or(defaults.max_depth),
            max_pages: body.max_pages.unwrap_or(defaults.max_pages),
            include_patterns: body.include_patterns.unwrap_or_default(),
            exclude_patterns: body.exclude_patterns.unwrap_or_default(),
            options: body.options.into(),
            ..defaults
        }
    }
}

#[derive(Debug, Serialize)]
pub struct BatchResponse {
    pub results: Vec<JobResult>,
}

fn parse_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, CrawlError> {
    payload
        .map(|Json(body)| body)
        .map_err(|rejection| CrawlError::InvalidRequest(rejection.body_text()))
}

async fn root() -> Json<Value> {
    Json(json!({
        "message": "Crawl gateway API",
        "health_url": "/api/crawl/health",
        "version_url": "/api/version",
    }))
}

async fn version() -> Json<Value> {
    Json(json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "description": "Admission-controlled crawl gateway over pooled headless browsers",
    }))
}

async fn health(State(state): State<AppState>) -> Response {
    let report = check_health(&state.service).await;
    let status = if report.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status, Json(report)).into_response()
}

async fn crawl_url(
    State(state): State<AppState>,
    payload: Result<Json<CrawlUrlBody>, JsonRejection>,
) -> Result<Json<JobResult>, CrawlError> {
    let body = parse_body(payload)?;
    let result = state.service.crawl(&body.url, body.options.into()).await?;
    Ok(Json(result))
}

async fn crawl_batch(
    State(state): State<AppState>,
    payload: Result<Json<CrawlBatchBody>, JsonRejection>,
) -> Result<Response, CrawlError> {
    let body = parse_body(payload)?;
    let options: CrawlOptions = body.options.into();

    if body.stream {
        let results = state.service.crawl_batch_stream(body.urls, options)?;
        Ok(sse_results(results).into_response())
    } else {
        let results = state.service.crawl_batch(body.urls, options).await?;
        Ok(Json(BatchResponse { results }).into_response())
    }
}

async fn crawl_deep(
    State(state): State<AppState>,
    payload: Result<Json<DeepCrawlBody>, JsonRejection>,
) -> Result<Response, CrawlError> {
    let body = parse_body(payload)?;
    let stream = body.stream;
    let request = DeepCrawlRequest::from(body);

    if stream {
        let results = state.service.deep_crawl_stream(&request)?;
        Ok(sse_results(results).into_response())
    } else {
        let results = state.service.deep_crawl(&request).await?;
        Ok(Json(BatchResponse { results }).into_response())
    }
}

async fn metrics(State(state): State<AppState>) -> Response {
    match &state.prometheus {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "Metrics are disabled" })),
        )
            .into_response(),
    }
}

/// One `result` event per job, then a closing `done` event.
fn sse_results<S>(results: S) -> Sse<impl Stream<Item = Result<Event, Infallible>>>
where
    S: Stream<Item = JobResult> + Send + 'static,
{
    let events = results
        .map(|result| {
            let event = Event::default()
                .event("result")
                .json_data(&result)
                .unwrap_or_else(|e| Event::default().event("error").data(e.to_string()));
            Ok(event)
        })
        .chain(futures::stream::once(async {
            Ok(Event::default().event("done").data("done"))
        }));

    Sse::new(events).keep_alive(KeepAlive::default())
}
