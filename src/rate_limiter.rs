//! Per-client sliding-window rate limiting
//!
//! Each client identity owns a queue of request timestamps covering the
//! trailing `period`. A request is admitted while fewer than `calls`
//! timestamps remain in the window. Windows live in a `DashMap`, so prune and
//! append for one client happen under that client's shard lock only.

use crate::server::AppState;
use crate::CrawlError;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderMap, HeaderValue};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Outcome of an admitted request
#[derive(Debug, Clone)]
pub struct RateLimitDecision {
    pub limit: usize,
    pub remaining: usize,
    pub reset_after: Duration,
    pub reset_at: DateTime<Utc>,
}

pub struct SlidingWindowLimiter {
    windows: DashMap<String, VecDeque<Instant>>,
    calls: usize,
    period: Duration,
    enabled: bool,
}

impl SlidingWindowLimiter {
    pub fn new(calls: usize, period: Duration, enabled: bool) -> Self {
        Self {
            windows: DashMap::new(),
            calls,
            period,
            enabled,
        }
    }

    pub fn from_config(settings: &crate::RateLimitSettings) -> Self {
        Self::new(settings.calls, settings.period, settings.enabled)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn limit(&self) -> usize {
        self.calls
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Record one request from `client`.
    ///
    /// Returns `Ok(None)` when limiting is disabled, the admission metadata
    /// when the request fits in the window, and `RateLimitExceeded` otherwise.
    /// Rejected requests are not recorded.
    pub fn check(&self, client: &str) -> Result<Option<RateLimitDecision>, CrawlError> {
        if !self.enabled {
            return Ok(None);
        }

        let now = Instant::now();
        let mut window = self.windows.entry(client.to_string()).or_default();

        while let Some(&oldest) = window.front() {
            if now.duration_since(oldest) > self.period {
                window.pop_front();
            } else {
                break;
            }
        }

        if window.len() >= self.calls {
            // Non-empty: calls > 0 is enforced by Config::validate
            let oldest = window.front().copied().unwrap_or(now);
            let retry_after = (oldest + self.period).saturating_duration_since(now);
            return Err(CrawlError::RateLimitExceeded {
                retry_after,
                limit: self.calls,
            });
        }

        window.push_back(now);
        let remaining = self.calls - window.len();

        Ok(Some(RateLimitDecision {
            limit: self.calls,
            remaining,
            reset_after: self.period,
            reset_at: Utc::now()
                + chrono::Duration::from_std(self.period).unwrap_or(chrono::Duration::zero()),
        }))
    }

    /// Drop windows whose timestamps have all expired.
    ///
    /// Returns the number of client entries removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.windows.len();

        self.windows.retain(|_, window| {
            while let Some(&oldest) = window.front() {
                if now.duration_since(oldest) > self.period {
                    window.pop_front();
                } else {
                    break;
                }
            }
            !window.is_empty()
        });

        before.saturating_sub(self.windows.len())
    }

    /// Number of clients currently holding a window
    pub fn tracked_clients(&self) -> usize {
        self.windows.len()
    }

    /// Periodically sweep empty windows until the task is aborted.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await;
            loop {
                interval.tick().await;
                let removed = limiter.sweep();
                if removed > 0 {
                    debug!("Rate limiter swept {} idle client windows", removed);
                }
            }
        })
    }
}

/// Seconds a rejected client should wait: rounded up, never below 1.
pub fn retry_after_secs(retry_after: Duration) -> u64 {
    let mut secs = retry_after.as_secs();
    if retry_after.subsec_nanos() > 0 {
        secs += 1;
    }
    secs.max(1)
}

/// Identity used to key rate-limit windows.
///
/// Bearer token first, then the first `X-Forwarded-For` hop, then the peer
/// address of the connection.
pub fn client_identity(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    if let Some(token) = bearer_token(headers) {
        return format!("key:{token}");
    }

    if let Some(forwarded) = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        return format!("ip:{forwarded}");
    }

    match peer {
        Some(addr) => format!("ip:{}", addr.ip()),
        None => "unknown".to_string(),
    }
}

/// Token from an `Authorization: Bearer <token>` header
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

pub async fn rate_limit_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    if !state.limiter.is_enabled() {
        return next.run(request).await;
    }

    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let client = client_identity(request.headers(), peer);

    match state.limiter.check(&client) {
        Ok(decision) => {
            let mut response = next.run(request).await;
            if let Some(decision) = decision {
                let headers = response.headers_mut();
                headers.insert("x-ratelimit-limit", HeaderValue::from(decision.limit));
                headers.insert("x-ratelimit-remaining", HeaderValue::from(decision.remaining));
                headers.insert(
                    "x-ratelimit-reset",
                    HeaderValue::from(decision.reset_at.timestamp()),
                );
            }
            response
        }
        Err(err) => {
            warn!(
                "Rate limit exceeded for {} on {}",
                redact_client(&client),
                request.uri().path()
            );
            state.service.metrics().record_rate_limited();
            err.into_response()
        }
    }
}

fn redact_client(client: &str) -> String {
    match client.strip_prefix("key:") {
        Some(token) => format!("key:{}...", token.chars().take(8).collect::<String>()),
        None => client.to_string(),
    }
}
