//! Configuration management with serde serialization/deserialization
//!
//! This module holds every tunable of the gateway: pool and concurrency bounds,
//! timeouts, rate limiting, API-key authentication, browser launch settings and
//! the HTTP bind address. Values are layered: defaults, then environment
//! variables (optionally from a `.env` file), then a JSON config file, then
//! command-line flags.

use crate::CrawlError;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Main configuration structure for the gateway
///
/// # Examples
///
/// ```rust
/// use crawl_gateway::Config;
///
/// // Use default configuration
/// let config = Config::default();
///
/// // Create custom configuration
/// let config = Config {
///     worker_pool_size: 4,
///     max_concurrent_jobs: 8,
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Maximum number of idle browser workers kept warm (default: 10)
    ///
    /// This bounds idle storage only. Workers above this count are still
    /// created on demand and disposed when they are returned.
    pub worker_pool_size: usize,

    /// Maximum number of crawl jobs executing at once (default: 5)
    pub max_concurrent_jobs: usize,

    /// Execution timeout for a single job (default: 60 seconds)
    ///
    /// A worker whose job times out is disposed, never pooled again.
    pub job_timeout: Duration,

    /// How long a job may wait for a crawl slot (default: no limit)
    pub admission_timeout: Option<Duration>,

    /// Idle workers older than this are closed by the pool maintenance task
    /// (default: 5 minutes)
    pub worker_idle_timeout: Option<Duration>,

    pub rate_limit: RateLimitSettings,

    pub auth: AuthSettings,

    pub browser: BrowserSettings,

    pub server: ServerSettings,

    /// Log level used when `--verbose` is not given (default: "info")
    pub log_level: String,

    /// Install the Prometheus recorder and serve `/metrics` (default: false)
    pub metrics_enabled: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            worker_pool_size: 10,
            max_concurrent_jobs: 5,
            job_timeout: Duration::from_secs(60),
            admission_timeout: None,
            worker_idle_timeout: Some(Duration::from_secs(300)),
            rate_limit: RateLimitSettings::default(),
            auth: AuthSettings::default(),
            browser: BrowserSettings::default(),
            server: ServerSettings::default(),
            log_level: "info".to_string(),
            metrics_enabled: false,
        }
    }
}

/// Sliding-window rate limiting, applied per client
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitSettings {
    pub enabled: bool,
    /// Requests allowed per window (default: 100)
    pub calls: usize,
    /// Window length (default: 60 seconds)
    pub period: Duration,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            calls: 100,
            period: Duration::from_secs(60),
        }
    }
}

/// Bearer-token authentication
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AuthSettings {
    pub enabled: bool,
    pub api_keys: Vec<String>,
    /// Paths reachable without a token even when auth is enabled
    pub exempt_paths: Vec<String>,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            api_keys: Vec::new(),
            exempt_paths: [
                "/",
                "/docs",
                "/redoc",
                "/openapi.json",
                "/api/version",
                "/api/crawl/health",
            ]
            .iter()
            .map(|p| p.to_string())
            .collect(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
        }
    }
}

/// Browser launch settings shared by every pooled worker
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BrowserSettings {
    /// Run Chrome without a window (default: true)
    pub headless: bool,

    pub viewport: Viewport,

    /// Path to Chrome/Chromium executable (default: auto-detect)
    pub chrome_path: Option<String>,

    /// Custom User-Agent string (default: Chrome default)
    pub user_agent: Option<String>,

    /// Additional command-line switches appended to the generated ones
    pub extra_args: Vec<String>,
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            headless: true,
            viewport: Viewport::default(),
            chrome_path: None,
            user_agent: None,
            extra_args: Vec::new(),
        }
    }
}

/// Browser window size used for every page
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Viewport {
    /// Viewport width in pixels (default: 1280)
    pub width: u32,

    /// Viewport height in pixels (default: 800)
    pub height: u32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 800,
        }
    }
}

impl Config {
    /// Defaults overlaid with the process environment.
    ///
    /// Call `dotenvy::dotenv()` first to pick up a `.env` file.
    pub fn from_env() -> Result<Self, CrawlError> {
        let mut config = Self::default();
        config.apply_env(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Overlay settings found through `lookup` (an environment accessor).
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), CrawlError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(size) = parse_var(&lookup, "CRAWLER_POOL_SIZE")? {
            self.worker_pool_size = size;
        }
        if let Some(limit) = parse_var(&lookup, "MAX_CONCURRENT_CRAWLS")? {
            self.max_concurrent_jobs = limit;
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "PAGE_TIMEOUT")? {
            self.job_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "ADMISSION_TIMEOUT")? {
            self.admission_timeout = (ms > 0).then(|| Duration::from_millis(ms));
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, "WORKER_IDLE_TIMEOUT")? {
            self.worker_idle_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }

        if let Some(enabled) = parse_bool(&lookup, "RATE_LIMIT_ENABLED")? {
            self.rate_limit.enabled = enabled;
        }
        if let Some(calls) = parse_var(&lookup, "RATE_LIMIT_CALLS")? {
            self.rate_limit.calls = calls;
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, "RATE_LIMIT_PERIOD")? {
            self.rate_limit.period = Duration::from_secs(secs);
        }

        if let Some(enabled) = parse_bool(&lookup, "API_KEY_ENABLED")? {
            self.auth.enabled = enabled;
        }
        if let Some(keys) = lookup("API_KEYS") {
            self.auth.api_keys = parse_list(&keys)?;
        }
        if let Some(paths) = lookup("AUTH_EXEMPT_PATHS") {
            self.auth.exempt_paths = parse_list(&paths)?;
        }

        if let Some(host) = lookup("HOST") {
            self.server.host = host;
        }
        if let Some(port) = parse_var(&lookup, "PORT")? {
            self.server.port = port;
        }
        if let Some(level) = lookup("LOG_LEVEL") {
            self.log_level = level.to_lowercase();
        }
        if let Some(enabled) = parse_bool(&lookup, "PROMETHEUS_ENABLED")? {
            self.metrics_enabled = enabled;
        }

        if let Some(headless) = parse_bool(&lookup, "BROWSER_HEADLESS")? {
            self.browser.headless = headless;
        }
        if let Some(width) = parse_var(&lookup, "VIEWPORT_WIDTH")? {
            self.browser.viewport.width = width;
        }
        if let Some(height) = parse_var(&lookup, "VIEWPORT_HEIGHT")? {
            self.browser.viewport.height = height;
        }
        if let Some(path) = lookup("CHROME_PATH") {
            self.browser.chrome_path = Some(path);
        }
        if let Some(agent) = lookup("USER_AGENT") {
            self.browser.user_agent = Some(agent);
        }

        Ok(())
    }

    /// Overlay a (possibly partial) JSON document onto this configuration.
    ///
    /// Objects merge key by key; any other value replaces the current one.
    pub fn merge_json(self, overlay: serde_json::Value) -> Result<Self, CrawlError> {
        let mut base = serde_json::to_value(&self)?;
        merge_values(&mut base, overlay);
        Ok(serde_json::from_value(base)?)
    }

    pub fn validate(&self) -> Result<(), CrawlError> {
        if self.worker_pool_size == 0 {
            return Err(CrawlError::ConfigurationError(
                "Worker pool size must be greater than 0".to_string(),
            ));
        }

        if self.max_concurrent_jobs == 0 {
            return Err(CrawlError::ConfigurationError(
                "Max concurrent jobs must be greater than 0".to_string(),
            ));
        }

        if self.job_timeout.is_zero() {
            return Err(CrawlError::ConfigurationError(
                "Job timeout must be greater than 0".to_string(),
            ));
        }

        if self.rate_limit.enabled && (self.rate_limit.calls == 0 || self.rate_limit.period.is_zero())
        {
            return Err(CrawlError::ConfigurationError(
                "Rate limit calls and period must be greater than 0".to_string(),
            ));
        }

        if self.auth.enabled && self.auth.api_keys.is_empty() {
            return Err(CrawlError::ConfigurationError(
                "API key auth is enabled but no API keys are configured".to_string(),
            ));
        }

        if self.browser.viewport.width == 0 || self.browser.viewport.height == 0 {
            return Err(CrawlError::ConfigurationError(
                "Viewport dimensions must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

fn merge_values(base: &mut serde_json::Value, overlay: serde_json::Value) {
    match (base, overlay) {
        (serde_json::Value::Object(base), serde_json::Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(slot) => merge_values(slot, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

fn parse_var<T, F>(lookup: &F, name: &str) -> Result<Option<T>, CrawlError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|e| {
            CrawlError::ConfigurationError(format!("{name}={raw:?} is not valid: {e}"))
        }),
        None => Ok(None),
    }
}

fn parse_bool<F>(lookup: &F, name: &str) -> Result<Option<bool>, CrawlError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(name).map(|raw| raw.trim().to_lowercase()) {
        Some(raw) => match raw.as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => Err(CrawlError::ConfigurationError(format!(
                "{name}={raw:?} is not a boolean"
            ))),
        },
        None => Ok(None),
    }
}

/// Accepts a JSON array (`["a","b"]`) or a comma-separated list (`a,b`).
fn parse_list(raw: &str) -> Result<Vec<String>, CrawlError> {
    let trimmed = raw.trim();
    if trimmed.starts_with('[') {
        return Ok(serde_json::from_str(trimmed)?);
    }

    Ok(trimmed
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect())
}

/// Generate Chrome command-line arguments for one pooled worker
///
/// Each worker gets its own user data directory so that concurrently running
/// browsers never trip over Chrome's singleton lock. The debugging port is
/// left to chromiumoxide, which lets Chrome pick a free one.
///
/// # Examples
///
/// ```rust
/// use crawl_gateway::{BrowserSettings, get_chrome_args, user_data_dir};
///
/// let args = get_chrome_args(&BrowserSettings::default(), 3);
/// let profile = format!("--user-data-dir={}", user_data_dir(3).display());
/// assert!(args.contains(&profile));
/// ```
pub fn get_chrome_args(settings: &BrowserSettings, instance_id: usize) -> Vec<String> {
    let unique_id = format!("{}-{}", std::process::id(), instance_id);

    let mut args = vec![
        "--no-sandbox".to_string(),
        "--disable-dev-shm-usage".to_string(),
        "--disable-gpu".to_string(),
        "--disable-background-timer-throttling".to_string(),
        "--disable-backgrounding-occluded-windows".to_string(),
        "--disable-renderer-backgrounding".to_string(),
        "--disable-blink-features=AutomationControlled".to_string(),
        "--disable-extensions".to_string(),
        "--disable-default-apps".to_string(),
        "--disable-sync".to_string(),
        "--no-first-run".to_string(),
        "--ignore-certificate-errors".to_string(),
        format!(
            "--window-size={},{}",
            settings.viewport.width, settings.viewport.height
        ),
        format!("--user-data-dir={}", user_data_dir(instance_id).display()),
        format!("--temp-dir=/tmp/crawl-gateway-temp-{unique_id}"),
    ];

    if let Some(user_agent) = &settings.user_agent {
        args.push(format!("--user-agent={user_agent}"));
    }

    args.extend(settings.extra_args.iter().cloned());
    args
}

/// Per-worker Chrome profile directory
pub fn user_data_dir(instance_id: usize) -> std::path::PathBuf {
    std::env::temp_dir().join(format!(
        "crawl-gateway-profile-{}-{}",
        std::process::id(),
        instance_id
    ))
}

pub fn create_browser_config(
    settings: &BrowserSettings,
    instance_id: usize,
) -> Result<chromiumoxide::browser::BrowserConfig, CrawlError> {
    use chromiumoxide::browser::BrowserConfig;

    let mut builder = BrowserConfig::builder()
        .window_size(settings.viewport.width, settings.viewport.height)
        .args(get_chrome_args(settings, instance_id));

    if !settings.headless {
        builder = builder.with_head();
    }

    if let Some(chrome_path) = &settings.chrome_path {
        builder = builder.chrome_executable(chrome_path);
    }

    builder.build().map_err(CrawlError::WorkerInit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.worker_pool_size, 10);
        assert_eq!(config.max_concurrent_jobs, 5);
        assert_eq!(config.job_timeout, Duration::from_secs(60));
        assert!(config.admission_timeout.is_none());
        assert!(config.rate_limit.enabled);
        assert_eq!(config.rate_limit.calls, 100);
        assert!(!config.auth.enabled);
        assert!(config.auth.exempt_paths.contains(&"/api/crawl/health".to_string()));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config
            .apply_env(lookup_from(&[
                ("CRAWLER_POOL_SIZE", "3"),
                ("MAX_CONCURRENT_CRAWLS", "2"),
                ("PAGE_TIMEOUT", "15000"),
                ("RATE_LIMIT_ENABLED", "false"),
                ("API_KEY_ENABLED", "true"),
                ("API_KEYS", "[\"valid-key-123\", \"valid-key-456\"]"),
                ("PORT", "9000"),
            ]))
            .unwrap();

        assert_eq!(config.worker_pool_size, 3);
        assert_eq!(config.max_concurrent_jobs, 2);
        assert_eq!(config.job_timeout, Duration::from_secs(15));
        assert!(!config.rate_limit.enabled);
        assert!(config.auth.enabled);
        assert_eq!(config.auth.api_keys, vec!["valid-key-123", "valid-key-456"]);
        assert_eq!(config.server.port, 9000);
    }

    #[test]
    fn test_comma_separated_keys() {
        let mut config = Config::default();
        config
            .apply_env(lookup_from(&[("API_KEYS", "alpha, beta,,gamma")]))
            .unwrap();
        assert_eq!(config.auth.api_keys, vec!["alpha", "beta", "gamma"]);
    }

    #[test]
    fn test_bad_env_value_is_reported() {
        let mut config = Config::default();
        let err = config
            .apply_env(lookup_from(&[("RATE_LIMIT_CALLS", "lots")]))
            .unwrap_err();
        assert!(matches!(err, CrawlError::ConfigurationError(_)));
    }

    #[test]
    fn test_validation() {
        let config = Config {
            max_concurrent_jobs: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.auth.enabled = true;
        assert!(config.validate().is_err());
        config.auth.api_keys.push("k".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_config() {
        let config: Config =
            serde_json::from_str(r#"{"worker_pool_size": 2, "auth": {"enabled": true, "api_keys": ["k"]}}"#)
                .unwrap();
        assert_eq!(config.worker_pool_size, 2);
        assert_eq!(config.max_concurrent_jobs, 5);
        assert!(config.auth.enabled);
        assert!(!config.auth.exempt_paths.is_empty());
    }

    #[test]
    fn test_file_overlay_keeps_env_values() {
        let mut config = Config::default();
        config
            .apply_env(lookup_from(&[("RATE_LIMIT_CALLS", "7"), ("PORT", "9001")]))
            .unwrap();

        let overlay = serde_json::json!({
            "max_concurrent_jobs": 2,
            "rate_limit": { "period": { "secs": 10, "nanos": 0 } },
            "admission_timeout": { "secs": 5, "nanos": 0 }
        });
        let config = config.merge_json(overlay).unwrap();

        assert_eq!(config.max_concurrent_jobs, 2);
        assert_eq!(config.rate_limit.calls, 7);
        assert_eq!(config.rate_limit.period, Duration::from_secs(10));
        assert_eq!(config.admission_timeout, Some(Duration::from_secs(5)));
        assert_eq!(config.server.port, 9001);
    }

    #[test]
    fn test_chrome_args_generation() {
        let settings = BrowserSettings {
            user_agent: Some("crawler/1.0".to_string()),
            extra_args: vec!["--lang=en-US".to_string()],
            ..Default::default()
        };
        let args = get_chrome_args(&settings, 0);

        assert!(args.contains(&"--no-sandbox".to_string()));
        assert!(args.contains(&"--window-size=1280,800".to_string()));
        assert!(args.contains(&"--user-agent=crawler/1.0".to_string()));
        assert!(args.contains(&"--lang=en-US".to_string()));
        assert!(args.iter().any(|a| a.starts_with("--user-data-dir=")));
        assert!(!args.iter().any(|a| a.starts_with("--remote-debugging-port")));
    }
}
