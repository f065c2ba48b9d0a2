//! Chrome-backed crawl workers
//!
//! Every worker owns one headless Chrome process driven over CDP by
//! chromiumoxide, with its own profile directory so that several browsers can
//! run side by side. Debugging ports are picked by Chrome.

use crate::{
    create_browser_config, user_data_dir, BrowserSettings, CrawlError, CrawlJob, CrawlOutput,
    Worker, WorkerFactory,
};
use async_trait::async_trait;
use chromiumoxide::browser::Browser;
use chromiumoxide::cdp::browser_protocol::emulation::SetScriptExecutionDisabledParams;
use chromiumoxide::cdp::browser_protocol::network::{
    EventResponseReceived, ResourceType, SetCacheDisabledParams,
};
use chromiumoxide::listeners::EventStream;
use chromiumoxide::page::Page;
use futures::{FutureExt, StreamExt};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const TEXT_SCRIPT: &str = "document.body ? document.body.innerText : ''";
const LINKS_SCRIPT: &str =
    "Array.from(document.querySelectorAll('a[href]')).map(a => a.href).filter(h => h)";

pub struct ChromeWorkerFactory {
    settings: BrowserSettings,
    next_instance: AtomicUsize,
}

impl ChromeWorkerFactory {
    pub fn new(settings: BrowserSettings) -> Self {
        Self {
            settings,
            next_instance: AtomicUsize::new(0),
        }
    }

    /// Instance ids never repeat, so a new worker can't share a profile
    /// directory with one that is still alive or being disposed.
    fn next_instance_id(&self) -> usize {
        self.next_instance.fetch_add(1, Ordering::Relaxed)
    }
}

#[async_trait]
impl WorkerFactory for ChromeWorkerFactory {
    async fn create(&self) -> Result<Box<dyn Worker>, CrawlError> {
        let instance_id = self.next_instance_id();
        let worker = ChromeWorker::launch(&self.settings, instance_id).await?;
        Ok(Box::new(worker))
    }
}

pub struct ChromeWorker {
    instance_id: usize,
    browser: Browser,
    handler: JoinHandle<()>,
    profile_dir: PathBuf,
    closed: bool,
}

impl ChromeWorker {
    pub async fn launch(settings: &BrowserSettings, instance_id: usize) -> Result<Self, CrawlError> {
        let profile_dir = user_data_dir(instance_id);
        tokio::fs::create_dir_all(&profile_dir).await.map_err(|e| {
            CrawlError::WorkerInit(format!("Failed to create user data dir: {e}"))
        })?;

        let config = create_browser_config(settings, instance_id)?;
        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| CrawlError::WorkerInit(e.to_string()))?;

        // The CDP handler is a stream that must be polled for the browser to work
        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    error!("Browser {} handler error: {}", instance_id, e);
                    break;
                }
            }
            debug!("Browser {} handler stream ended", instance_id);
        });

        info!("Browser worker {} launched", instance_id);
        Ok(Self {
            instance_id,
            browser,
            handler,
            profile_dir,
            closed: false,
        })
    }
}

async fn load_page(page: &Page, job: &CrawlJob) -> Result<CrawlOutput, CrawlError> {
    if job.options.bypass_cache {
        page.execute(SetCacheDisabledParams::new(true))
            .await
            .map_err(execution)?;
    }
    if !job.options.js_enabled {
        page.execute(SetScriptExecutionDisabledParams::new(true))
            .await
            .map_err(execution)?;
    }

    let mut responses = page
        .event_listener::<EventResponseReceived>()
        .await
        .map_err(execution)?;

    page.goto(job.url.as_str()).await.map_err(execution)?;
    page.wait_for_navigation().await.map_err(execution)?;
    let status_code = document_status(page, &mut responses).await?;

    if let Some(settle) = job.options.wait_for {
        tokio::time::sleep(settle).await;
    }

    let final_url = page.url().await.map_err(execution)?;
    let title = page.get_title().await.map_err(execution)?;
    let html = page.content().await.map_err(execution)?;
    let text: String = page
        .evaluate(TEXT_SCRIPT)
        .await
        .map_err(execution)?
        .into_value()
        .unwrap_or_default();
    let links: Vec<String> = page
        .evaluate(LINKS_SCRIPT)
        .await
        .map_err(execution)?
        .into_value()
        .unwrap_or_default();

    Ok(CrawlOutput {
        status_code,
        final_url,
        title,
        html,
        text,
        links,
    })
}

/// Status of the last main-frame document response seen during navigation.
/// Pages that never touch the network (`data:` URLs) have none.
async fn document_status(
    page: &Page,
    responses: &mut EventStream<EventResponseReceived>,
) -> Result<Option<u16>, CrawlError> {
    let main_frame = page.mainframe().await.map_err(execution)?;
    let mut status = None;

    // Navigation has finished, so its events are already queued
    while let Some(Some(event)) = responses.next().now_or_never() {
        let same_frame = match (&main_frame, &event.frame_id) {
            (Some(main), Some(frame)) => main == frame,
            _ => true,
        };
        if event.r#type == ResourceType::Document && same_frame {
            status = u16::try_from(event.response.status).ok();
        }
    }

    Ok(status)
}

fn execution(err: chromiumoxide::error::CdpError) -> CrawlError {
    CrawlError::Execution(err.to_string())
}

#[async_trait]
impl Worker for ChromeWorker {
    async fn execute(&mut self, job: &CrawlJob) -> Result<CrawlOutput, CrawlError> {
        let page = self
            .browser
            .new_page("about:blank")
            .await
            .map_err(|e| CrawlError::WorkerCrashed(format!("Failed to open page: {e}")))?;

        let result = load_page(&page, job).await;

        if let Err(e) = page.close().await {
            debug!("Browser {} failed to close page: {}", self.instance_id, e);
        }

        result.map_err(|e| match e {
            CrawlError::Execution(message) if self.handler.is_finished() => {
                CrawlError::WorkerCrashed(message)
            }
            other => other,
        })
    }

    async fn shutdown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        if let Err(e) = self.browser.close().await {
            debug!("Browser {} close failed: {}", self.instance_id, e);
        }
        if let Err(e) = self.browser.wait().await {
            debug!("Browser {} wait failed: {}", self.instance_id, e);
        }
        self.handler.abort();

        if let Err(e) = tokio::fs::remove_dir_all(&self.profile_dir).await {
            warn!(
                "Failed to remove profile dir {}: {}",
                self.profile_dir.display(),
                e
            );
        }
        info!("Browser worker {} shut down", self.instance_id);
    }

    fn is_alive(&self) -> bool {
        !self.closed && !self.handler.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_instance_ids_never_wrap() {
        let factory = ChromeWorkerFactory::new(BrowserSettings::default());

        let ids: Vec<usize> = (0..1500).map(|_| factory.next_instance_id()).collect();
        let profiles: HashSet<PathBuf> = ids.iter().map(|id| user_data_dir(*id)).collect();

        assert_eq!(ids.first(), Some(&0));
        assert_eq!(ids.last(), Some(&1499));
        assert_eq!(profiles.len(), 1500);
        assert_ne!(user_data_dir(0), user_data_dir(1000));
    }

    #[cfg(feature = "chrome-integration")]
    #[tokio::test]
    async fn test_crawl_inline_page() {
        use crate::CrawlOptions;

        let factory = ChromeWorkerFactory::new(BrowserSettings::default());
        let mut worker = factory.create().await.expect("chrome should launch");

        let job = CrawlJob::new(
            "data:text/html,<title>Inline</title><p>hello</p><a href='https://example.com/next'>next</a>",
            CrawlOptions::default(),
        );
        let output = worker.execute(&job).await.expect("page should load");

        assert_eq!(output.title.as_deref(), Some("Inline"));
        assert!(output.status_code.map_or(true, |status| status == 200));
        assert!(output.text.contains("hello"));
        assert_eq!(output.links, vec!["https://example.com/next"]);
        assert!(worker.is_alive());

        worker.shutdown().await;
        assert!(!worker.is_alive());
    }
}
