use crate::server::AppState;
use crate::{bearer_token, AuthSettings, CrawlError};
use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::collections::HashSet;
use tracing::{debug, warn};

/// The key a request authenticated with, available to handlers as an
/// extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiKey(pub String);

/// Bearer-token check against a fixed set of API keys
#[derive(Debug, Clone)]
pub struct ApiKeyGate {
    enabled: bool,
    keys: HashSet<String>,
    exempt_paths: HashSet<String>,
}

impl ApiKeyGate {
    pub fn new<K, P>(enabled: bool, keys: K, exempt_paths: P) -> Self
    where
        K: IntoIterator<Item = String>,
        P: IntoIterator<Item = String>,
    {
        Self {
            enabled,
            keys: keys.into_iter().collect(),
            exempt_paths: exempt_paths.into_iter().collect(),
        }
    }

    pub fn from_config(settings: &AuthSettings) -> Self {
        Self::new(
            settings.enabled,
            settings.api_keys.iter().cloned(),
            settings.exempt_paths.iter().cloned(),
        )
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_exempt(&self, path: &str) -> bool {
        self.exempt_paths.contains(path)
    }

    /// `Ok(None)` when no credential is required, `Ok(Some(key))` for a
    /// registered key, `Authentication` otherwise.
    pub fn authorize(&self, path: &str, headers: &HeaderMap) -> Result<Option<ApiKey>, CrawlError> {
        if !self.enabled || self.is_exempt(path) {
            return Ok(None);
        }

        let token = bearer_token(headers).ok_or_else(|| {
            CrawlError::Authentication("Missing or invalid authorization header".to_string())
        })?;

        if !self.keys.contains(token) {
            let prefix: String = token.chars().take(8).collect();
            warn!("Invalid API key used: {}...", prefix);
            return Err(CrawlError::Authentication("Invalid API key".to_string()));
        }

        Ok(Some(ApiKey(token.to_string())))
    }
}

pub async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    match state.api_keys.authorize(request.uri().path(), request.headers()) {
        Ok(Some(key)) => {
            request.extensions_mut().insert(key);
            next.run(request).await
        }
        Ok(None) => next.run(request).await,
        Err(err) => {
            debug!("Rejected {} {}: {}", request.method(), request.uri().path(), err);
            state.service.metrics().record_unauthorized();
            err.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{header, HeaderValue};

    fn gate() -> ApiKeyGate {
        ApiKeyGate::from_config(&AuthSettings {
            enabled: true,
            api_keys: vec!["valid-key-123".to_string()],
            ..Default::default()
        })
    }

    fn bearer(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
        );
        headers
    }

    #[test]
    fn test_exempt_paths_pass_without_credentials() {
        let gate = gate();
        assert_eq!(gate.authorize("/api/crawl/health", &HeaderMap::new()).unwrap(), None);
        assert_eq!(gate.authorize("/", &HeaderMap::new()).unwrap(), None);
    }

    #[test]
    fn test_missing_and_invalid_credentials() {
        let gate = gate();

        match gate.authorize("/api/crawl/url", &HeaderMap::new()) {
            Err(CrawlError::Authentication(message)) => {
                assert_eq!(message, "Missing or invalid authorization header")
            }
            other => panic!("unexpected {other:?}"),
        }

        let mut basic = HeaderMap::new();
        basic.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert!(gate.authorize("/api/crawl/url", &basic).is_err());

        match gate.authorize("/api/crawl/url", &bearer("wrong-key")) {
            Err(CrawlError::Authentication(message)) => assert_eq!(message, "Invalid API key"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_registered_key_is_returned() {
        let key = gate()
            .authorize("/api/crawl/url", &bearer("valid-key-123"))
            .unwrap();
        assert_eq!(key, Some(ApiKey("valid-key-123".to_string())));
    }

    #[test]
    fn test_disabled_gate_admits_everything() {
        let gate = ApiKeyGate::new(false, Vec::new(), Vec::new());
        assert_eq!(gate.authorize("/api/crawl/url", &HeaderMap::new()).unwrap(), None);
    }
}
