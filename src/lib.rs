//! # Crawl Gateway
//!
//! An admission and resource-pooling layer in front of headless Chrome. Every
//! crawl request passes through the same chain before it touches a browser:
//!
//! 1. **Rate limiting**: a per-client sliding window (`calls` per `period`),
//!    answering `429` with `Retry-After` once the window is full.
//! 2. **Authentication**: bearer-token check against the configured API keys,
//!    skipped for exempt paths such as the health probe.
//! 3. **Concurrency gate**: at most `max_concurrent_jobs` crawls execute at
//!    once; the rest wait, optionally bounded by an admission timeout.
//! 4. **Worker pool**: idle browsers are reused, missing ones are created on
//!    demand, and broken or timed-out browsers are disposed instead of being
//!    pooled again.
//!
//! Batches run concurrently under the same gate and return one result per
//! URL in input order, or stream results as they complete. Deep crawls walk
//! same-domain links breadth-first within a depth and page budget.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use crawl_gateway::{Config, CrawlOptions, CrawlService, Metrics};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config {
//!         max_concurrent_jobs: 4,
//!         ..Default::default()
//!     };
//!     let service = CrawlService::with_chrome(config, Arc::new(Metrics::new()))?;
//!
//!     let results = service
//!         .crawl_batch(
//!             vec!["https://example.com".into(), "https://example.org".into()],
//!             CrawlOptions::default(),
//!         )
//!         .await?;
//!     for result in &results {
//!         println!("{} -> success: {}", result.url, result.is_success());
//!     }
//!
//!     service.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## CLI Usage
//!
//! ### HTTP API
//! ```bash
//! crawl-gateway serve --port 8000 --metrics
//! ```
//!
//! ### Batch Processing
//! ```bash
//! crawl-gateway --max-concurrent 8 batch --input urls.txt --output results.jsonl
//! ```
//!
//! ### Deep Crawl
//! ```bash
//! crawl-gateway deep --url https://example.com --max-depth 2 --max-pages 25
//! ```

/// Configuration layering: defaults, environment, JSON file, CLI flags
pub mod config;

/// Error types and their HTTP mapping
pub mod error;

/// Crawl jobs, options and per-job results
pub mod job;

/// Concurrency gate bounding in-flight jobs
pub mod gate;

/// Per-client sliding-window rate limiting
pub mod rate_limiter;

/// Bearer-token authentication
pub mod auth;

/// Bounded pool of reusable workers
pub mod worker_pool;

/// Job execution through the gate and the pool, single and batched
pub mod dispatcher;

/// Headless Chrome worker implementation
pub mod browser_worker;

/// Breadth-first same-domain crawling
pub mod deep_crawl;

/// Crawl service owning the pool, gate and dispatcher
pub mod service;

/// Health probe
pub mod health;

/// Prometheus metrics
pub mod metrics;

/// HTTP server assembly and middleware
pub mod server;

/// HTTP route handlers
pub mod routes;

/// Command-line interface implementation
pub mod cli;

/// Utility functions and helpers
pub mod utils;


pub use self::metrics::*;
pub use auth::*;
pub use browser_worker::*;
pub use cli::*;
pub use config::*;
pub use deep_crawl::*;
pub use dispatcher::*;
pub use error::*;
pub use gate::*;
pub use health::*;
pub use job::*;
pub use rate_limiter::*;
pub use server::*;
pub use service::*;
pub use utils::*;
pub use worker_pool::*;
