//! Breadth-first crawling from a start URL
//!
//! Each depth level is dispatched as one batch through the `Dispatcher`, so a
//! deep crawl obeys the same concurrency gate and worker pool as everything
//! else. Links found on successful pages feed the next level.

use crate::{
    is_same_domain, normalize_link, validate_url, CrawlError, CrawlJob, CrawlOptions, Dispatcher,
    JobResult,
};
use regex::Regex;
use std::collections::HashSet;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info};
use url::Url;

#[derive(Debug, Clone)]
pub struct DeepCrawlRequest {
    pub start_url: String,
    /// Levels of links to follow beyond the start page (default: 1)
    pub max_depth: usize,
    /// Upper bound on pages crawled, start page included (default: 10)
    pub max_pages: usize,
    pub include_patterns: Vec<String>,
    pub exclude_patterns: Vec<String>,
    pub options: CrawlOptions,
}

impl DeepCrawlRequest {
    pub fn new(start_url: impl Into<String>) -> Self {
        Self {
            start_url: start_url.into(),
            max_depth: 1,
            max_pages: 10,
            include_patterns: Vec::new(),
            exclude_patterns: Vec::new(),
            options: CrawlOptions::default(),
        }
    }
}

/// Glob include/exclude filter over full URLs. `*` matches any run of
/// characters.
#[derive(Debug, Clone, Default)]
pub struct UrlFilter {
    include: Vec<Regex>,
    exclude: Vec<Regex>,
}

impl UrlFilter {
    pub fn new(include: &[String], exclude: &[String]) -> Result<Self, CrawlError> {
        Ok(Self {
            include: include.iter().map(|p| glob_to_regex(p)).collect::<Result<_, _>>()?,
            exclude: exclude.iter().map(|p| glob_to_regex(p)).collect::<Result<_, _>>()?,
        })
    }

    pub fn allows(&self, url: &str) -> bool {
        let included = self.include.is_empty() || self.include.iter().any(|re| re.is_match(url));
        included && !self.exclude.iter().any(|re| re.is_match(url))
    }
}

fn glob_to_regex(pattern: &str) -> Result<Regex, CrawlError> {
    let body = regex::escape(pattern).replace(r"\*", ".*");
    Regex::new(&format!("^{body}$"))
        .map_err(|e| CrawlError::InvalidRequest(format!("bad pattern {pattern:?}: {e}")))
}

/// A validated deep crawl, ready to run.
struct DeepCrawlPlan {
    start: String,
    filter: UrlFilter,
    max_depth: usize,
    max_pages: usize,
    options: CrawlOptions,
}

impl DeepCrawlPlan {
    fn new(request: &DeepCrawlRequest) -> Result<Self, CrawlError> {
        let mut start = validate_url(&request.start_url)?;
        start.set_fragment(None);

        if request.max_pages == 0 {
            return Err(CrawlError::InvalidRequest(
                "max_pages must be greater than 0".to_string(),
            ));
        }

        Ok(Self {
            start: start.to_string(),
            filter: UrlFilter::new(&request.include_patterns, &request.exclude_patterns)?,
            max_depth: request.max_depth,
            max_pages: request.max_pages,
            options: request.options.clone(),
        })
    }

    fn follows(&self, link: &str) -> bool {
        is_same_domain(&self.start, link) && self.filter.allows(link)
    }

    /// Crawl level by level, handing each finished level to `on_level`.
    /// Stops early when `on_level` returns false.
    async fn run<F>(self, dispatcher: &Dispatcher, mut on_level: F)
    where
        F: FnMut(Vec<JobResult>) -> bool,
    {
        let mut visited = HashSet::from([self.start.clone()]);
        let mut frontier = vec![self.start.clone()];
        let mut crawled = 0;

        for depth in 0..=self.max_depth {
            if frontier.is_empty() || crawled >= self.max_pages {
                break;
            }

            frontier.truncate(self.max_pages - crawled);
            debug!("Deep crawl level {}: {} pages", depth, frontier.len());

            let jobs = frontier
                .drain(..)
                .map(|url| CrawlJob::new(url, self.options.clone()))
                .collect();
            let results = dispatcher.run_batch(jobs).await;
            crawled += results.len();

            if depth < self.max_depth {
                frontier = self.next_frontier(&results, &mut visited);
            }

            if !on_level(results) {
                return;
            }
        }

        info!("Deep crawl from {} finished after {} pages", self.start, crawled);
    }

    fn next_frontier(&self, results: &[JobResult], visited: &mut HashSet<String>) -> Vec<String> {
        let mut next = Vec::new();

        for result in results {
            let Some(output) = result.output() else {
                continue;
            };
            let page_url = output.final_url.as_deref().unwrap_or(&result.url);
            let Ok(base) = Url::parse(page_url) else {
                continue;
            };

            for href in &output.links {
                if let Some(link) = normalize_link(&base, href) {
                    if self.follows(&link) && visited.insert(link.clone()) {
                        next.push(link);
                    }
                }
            }
        }

        next
    }
}

/// Run a deep crawl to completion. Results come level by level, in dispatch
/// order within a level.
pub async fn deep_crawl(
    dispatcher: &Dispatcher,
    request: &DeepCrawlRequest,
) -> Result<Vec<JobResult>, CrawlError> {
    let plan = DeepCrawlPlan::new(request)?;

    let mut results = Vec::new();
    plan.run(dispatcher, |level| {
        results.extend(level);
        true
    })
    .await;

    Ok(results)
}

/// Run a deep crawl in the background, yielding each level as it completes.
///
/// The request is validated before anything is spawned. Dropping the stream
/// cancels the level in progress.
pub fn deep_crawl_stream(
    dispatcher: Dispatcher,
    request: &DeepCrawlRequest,
) -> Result<UnboundedReceiverStream<JobResult>, CrawlError> {
    let plan = DeepCrawlPlan::new(request)?;
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let crawl = plan.run(&dispatcher, |level| {
            level.into_iter().all(|result| tx.send(result).is_ok())
        });

        tokio::select! {
            _ = crawl => {}
            _ = tx.closed() => {
                debug!("Deep crawl stream dropped, cancelling");
            }
        }
    });

    Ok(UnboundedReceiverStream::new(rx))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_globs() {
        let filter = UrlFilter::new(
            &["https://example.com/docs/*".to_string()],
            &["*.pdf".to_string(), "*/private/*".to_string()],
        )
        .unwrap();

        assert!(filter.allows("https://example.com/docs/intro"));
        assert!(!filter.allows("https://example.com/blog/post"));
        assert!(!filter.allows("https://example.com/docs/manual.pdf"));
        assert!(!filter.allows("https://example.com/docs/private/keys"));
    }

    #[test]
    fn test_empty_filter_allows_everything() {
        let filter = UrlFilter::default();
        assert!(filter.allows("https://example.com/anything?q=1"));
    }

    #[test]
    fn test_pattern_metacharacters_are_literal() {
        let filter = UrlFilter::new(&["https://example.com/a?b=*".to_string()], &[]).unwrap();
        assert!(filter.allows("https://example.com/a?b=1"));
        assert!(!filter.allows("https://example.com/ab=1"));
    }

    #[test]
    fn test_plan_rejects_bad_start_url() {
        let request = DeepCrawlRequest::new("not a url");
        assert!(matches!(
            DeepCrawlPlan::new(&request),
            Err(CrawlError::InvalidUrl(_))
        ));

        let request = DeepCrawlRequest {
            max_pages: 0,
            ..DeepCrawlRequest::new("https://example.com")
        };
        assert!(matches!(
            DeepCrawlPlan::new(&request),
            Err(CrawlError::InvalidRequest(_))
        ));
    }
}
