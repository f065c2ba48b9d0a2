use crate::{
    format_duration, parse_url_list, serve, AppState, Config, CrawlOptions, CrawlService,
    DeepCrawlRequest, JobResult, Metrics,
};
use anyhow::Context;
use clap::{Parser, Subcommand};
use metrics_exporter_prometheus::PrometheusHandle;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs;
use tokio::sync::broadcast;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "crawl-gateway")]
#[command(about = "Admission-controlled crawl gateway over pooled headless browsers")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(long, help = "Configuration file path (JSON)")]
    pub config: Option<PathBuf>,

    #[arg(long, help = "Idle worker pool size")]
    pub pool_size: Option<usize>,

    #[arg(long, help = "Maximum concurrent crawl jobs")]
    pub max_concurrent: Option<usize>,

    #[arg(long, help = "Per-job timeout in seconds")]
    pub timeout: Option<u64>,

    #[arg(long, help = "Enable verbose logging")]
    pub verbose: bool,

    #[arg(long, help = "Chrome executable path")]
    pub chrome_path: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP API
    Serve {
        #[arg(long, help = "Bind host")]
        host: Option<String>,

        #[arg(short, long, help = "Bind port")]
        port: Option<u16>,

        #[arg(long, help = "Expose Prometheus metrics on /metrics")]
        metrics: bool,
    },

    /// Crawl a single URL and print the result as JSON
    Crawl {
        #[arg(short, long)]
        url: String,

        #[arg(long, help = "Skip the browser cache")]
        bypass_cache: bool,

        #[arg(long, help = "Disable page JavaScript")]
        no_js: bool,

        #[arg(long, help = "Extra wait after navigation, in milliseconds")]
        wait: Option<u64>,
    },

    /// Crawl URLs from a file (one per line), writing JSON lines
    Batch {
        #[arg(short, long, help = "Input file containing URLs (one per line)")]
        input: PathBuf,

        #[arg(short, long, help = "Output file (default: stdout)")]
        output: Option<PathBuf>,

        #[arg(long, help = "Skip the browser cache")]
        bypass_cache: bool,
    },

    /// Breadth-first crawl from a start URL
    Deep {
        #[arg(short, long)]
        url: String,

        #[arg(long, default_value = "1")]
        max_depth: usize,

        #[arg(long, default_value = "10")]
        max_pages: usize,

        #[arg(long, help = "Glob a followed URL must match (repeatable)")]
        include: Vec<String>,

        #[arg(long, help = "Glob a followed URL must not match (repeatable)")]
        exclude: Vec<String>,
    },

    /// Validate a configuration file
    Validate {
        #[arg(short, long, help = "Configuration file to validate")]
        config: PathBuf,
    },
}

impl Cli {
    /// Apply global flags on top of an already layered configuration.
    pub fn apply_overrides(&self, config: &mut Config) {
        if let Some(pool_size) = self.pool_size {
            config.worker_pool_size = pool_size;
        }
        if let Some(max_concurrent) = self.max_concurrent {
            config.max_concurrent_jobs = max_concurrent;
        }
        if let Some(timeout) = self.timeout {
            config.job_timeout = Duration::from_secs(timeout);
        }
        if let Some(chrome_path) = &self.chrome_path {
            config.browser.chrome_path = Some(chrome_path.clone());
        }
        if let Commands::Serve {
            host,
            port,
            metrics,
        } = &self.command
        {
            if let Some(host) = host {
                config.server.host = host.clone();
            }
            if let Some(port) = port {
                config.server.port = *port;
            }
            if *metrics {
                config.metrics_enabled = true;
            }
        }
    }
}

/// Defaults, then the environment, then `path`, then CLI flags.
pub async fn load_config(args: &Cli) -> anyhow::Result<Config> {
    let mut config = Config::from_env()?;

    if let Some(path) = &args.config {
        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let overlay: serde_json::Value = serde_json::from_str(&content)
            .with_context(|| format!("parsing {}", path.display()))?;
        config = config.merge_json(overlay)?;
    }

    args.apply_overrides(&mut config);
    config.validate()?;
    Ok(config)
}

pub struct CliRunner {
    pub config: Config,
    pub service: Arc<CrawlService>,
    prometheus: Option<PrometheusHandle>,
}

impl CliRunner {
    pub fn new(
        config: Config,
        metrics: Arc<Metrics>,
        prometheus: Option<PrometheusHandle>,
    ) -> anyhow::Result<Self> {
        let service = Arc::new(CrawlService::with_chrome(config.clone(), metrics)?);

        Ok(Self {
            config,
            service,
            prometheus,
        })
    }

    pub async fn run(
        &self,
        command: Commands,
        shutdown: broadcast::Receiver<()>,
    ) -> anyhow::Result<()> {
        match command {
            Commands::Serve { .. } => self.run_server(shutdown).await,
            Commands::Crawl {
                url,
                bypass_cache,
                no_js,
                wait,
            } => {
                let options = CrawlOptions {
                    bypass_cache,
                    js_enabled: !no_js,
                    wait_for: wait.map(Duration::from_millis),
                    ..Default::default()
                };
                self.run_crawl(&url, options).await
            }
            Commands::Batch {
                input,
                output,
                bypass_cache,
            } => {
                let options = CrawlOptions {
                    bypass_cache,
                    ..Default::default()
                };
                self.run_batch(input, output, options).await
            }
            Commands::Deep {
                url,
                max_depth,
                max_pages,
                include,
                exclude,
            } => {
                let request = DeepCrawlRequest {
                    max_depth,
                    max_pages,
                    include_patterns: include,
                    exclude_patterns: exclude,
                    ..DeepCrawlRequest::new(url)
                };
                self.run_deep(request).await
            }
            Commands::Validate { config } => self.validate_config(config).await,
        }
    }

    pub async fn run_server(&self, mut shutdown: broadcast::Receiver<()>) -> anyhow::Result<()> {
        let addr: SocketAddr = format!("{}:{}", self.config.server.host, self.config.server.port)
            .parse()
            .context("invalid bind address")?;

        let state = AppState::new(self.service.clone(), self.prometheus.clone());
        serve(state, addr, async move {
            let _ = shutdown.recv().await;
            info!("Shutdown signal received, finishing in-flight requests");
        })
        .await?;

        Ok(())
    }

    pub async fn run_crawl(&self, url: &str, options: CrawlOptions) -> anyhow::Result<()> {
        let result = self.service.crawl(url, options).await?;
        println!("{}", serde_json::to_string_pretty(&result)?);
        Ok(())
    }

    pub async fn run_batch(
        &self,
        input: PathBuf,
        output: Option<PathBuf>,
        options: CrawlOptions,
    ) -> anyhow::Result<()> {
        let content = fs::read_to_string(&input)
            .await
            .with_context(|| format!("reading {}", input.display()))?;
        let urls = parse_url_list(&content);
        info!("Loaded {} URLs from {}", urls.len(), input.display());

        let started = Instant::now();
        let results = self.service.crawl_batch(urls, options).await?;
        self.write_results(&results, output).await?;
        report_summary(&results, started.elapsed());

        Ok(())
    }

    pub async fn run_deep(&self, request: DeepCrawlRequest) -> anyhow::Result<()> {
        let started = Instant::now();
        let results = self.service.deep_crawl(&request).await?;
        self.write_results(&results, None).await?;
        report_summary(&results, started.elapsed());

        Ok(())
    }

    async fn write_results(
        &self,
        results: &[JobResult],
        output: Option<PathBuf>,
    ) -> anyhow::Result<()> {
        let mut lines = String::new();
        for result in results {
            lines.push_str(&serde_json::to_string(result)?);
            lines.push('\n');
        }

        match output {
            Some(path) => {
                fs::write(&path, lines)
                    .await
                    .with_context(|| format!("writing {}", path.display()))?;
                info!("Results written to {}", path.display());
            }
            None => print!("{lines}"),
        }

        Ok(())
    }

    pub async fn validate_config(&self, config_path: PathBuf) -> anyhow::Result<()> {
        println!("Validating configuration: {}", config_path.display());

        let content = fs::read_to_string(&config_path).await?;
        let overlay: serde_json::Value = serde_json::from_str(&content)?;
        let config = Config::default().merge_json(overlay)?;
        config.validate()?;

        println!("Configuration is valid:");
        println!("  Worker pool size: {}", config.worker_pool_size);
        println!("  Max concurrent jobs: {}", config.max_concurrent_jobs);
        println!("  Job timeout: {:?}", config.job_timeout);
        println!(
            "  Rate limit: {} ({} calls per {:?})",
            if config.rate_limit.enabled { "on" } else { "off" },
            config.rate_limit.calls,
            config.rate_limit.period
        );
        println!(
            "  API key auth: {} ({} keys)",
            if config.auth.enabled { "on" } else { "off" },
            config.auth.api_keys.len()
        );
        println!(
            "  Viewport: {}x{}",
            config.browser.viewport.width, config.browser.viewport.height
        );

        Ok(())
    }
}

fn report_summary(results: &[JobResult], elapsed: Duration) {
    let succeeded = results.iter().filter(|r| r.is_success()).count();
    let failed = results.len() - succeeded;

    info!(
        "Crawled {} URLs in {}: {} succeeded, {} failed",
        results.len(),
        format_duration(elapsed),
        succeeded,
        failed
    );
    if failed > 0 {
        warn!("{} jobs failed", failed);
    }
}

pub fn setup_logging(verbose: bool, level: &str) -> anyhow::Result<()> {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        level.parse().unwrap_or(tracing::Level::INFO)
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .init();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_overrides_config() {
        let args = Cli::parse_from([
            "crawl-gateway",
            "--pool-size",
            "3",
            "--timeout",
            "15",
            "serve",
            "--port",
            "9100",
            "--metrics",
        ]);
        let mut config = Config::default();
        args.apply_overrides(&mut config);

        assert_eq!(config.worker_pool_size, 3);
        assert_eq!(config.job_timeout, Duration::from_secs(15));
        assert_eq!(config.server.port, 9100);
        assert!(config.metrics_enabled);
        assert_eq!(config.max_concurrent_jobs, 5);
    }

    #[test]
    fn test_deep_command_parsing() {
        let args = Cli::parse_from([
            "crawl-gateway",
            "deep",
            "--url",
            "https://example.com",
            "--max-depth",
            "2",
            "--include",
            "https://example.com/docs/*",
            "--include",
            "https://example.com/blog/*",
        ]);

        match args.command {
            Commands::Deep {
                max_depth,
                max_pages,
                include,
                ..
            } => {
                assert_eq!(max_depth, 2);
                assert_eq!(max_pages, 10);
                assert_eq!(include.len(), 2);
            }
            _ => panic!("expected deep command"),
        }
    }
}
