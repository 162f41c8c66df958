use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::compat::{CompatShim, SchedulerUnsupported};
use crate::config::{CrawlerSection, WebsiteSection};
use crate::crawler::{
    html, CrawlEngine, CrawlOptions, CrawlPageResult, CrawlRequest, CrawlerError,
    ExtractionConfig, IsolatedCrawlerWorker,
};
use crate::model::{AgentResult, Post};

use super::{PlatformAgent, BROWSER, WEBSITE};

const EXCERPT_CHARS: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrawlKind {
    /// Renders pages in headless Chromium.
    Browser,
    /// Plain HTTP fetch with schema-guided extraction.
    Website,
}

impl CrawlKind {
    pub fn platform(&self) -> &'static str {
        match self {
            CrawlKind::Browser => BROWSER,
            CrawlKind::Website => WEBSITE,
        }
    }

    pub fn engine(&self) -> CrawlEngine {
        match self {
            CrawlKind::Browser => CrawlEngine::Browser,
            CrawlKind::Website => CrawlEngine::Http,
        }
    }
}

/// Crawls a competitor's URLs through the isolated crawler worker.
pub struct CrawlAgent {
    kind: CrawlKind,
    urls: Vec<String>,
    worker: Result<IsolatedCrawlerWorker, String>,
    options: CrawlOptions,
    extraction: ExtractionConfig,
}

impl CrawlAgent {
    pub fn new(
        kind: CrawlKind,
        urls: Vec<String>,
        worker: IsolatedCrawlerWorker,
        options: CrawlOptions,
        extraction: ExtractionConfig,
    ) -> Self {
        Self {
            kind,
            urls,
            worker: Ok(worker),
            options,
            extraction,
        }
    }

    pub fn from_config(
        kind: CrawlKind,
        urls: Vec<String>,
        crawler: &CrawlerSection,
        website: &WebsiteSection,
        shim: Arc<CompatShim>,
    ) -> Self {
        let extraction = match kind {
            CrawlKind::Browser => ExtractionConfig::default(),
            CrawlKind::Website => ExtractionConfig {
                use_llm: website.use_llm,
                schema: website.schema.clone(),
                instruction: website.instruction.clone(),
            },
        };
        Self {
            kind,
            urls,
            worker: IsolatedCrawlerWorker::from_config(crawler, shim).map_err(|err| err.to_string()),
            options: CrawlOptions::from(crawler),
            extraction,
        }
    }

    fn page_post(page: &CrawlPageResult) -> Post {
        let excerpt = page
            .content
            .clone()
            .map(|content| html::truncate(content, EXCERPT_CHARS));
        let mut post = Post::new()
            .with("url", page.url.clone())
            .with("title", page.title.clone())
            .with("excerpt", excerpt);
        if let Some(data) = &page.extracted_data {
            post.insert("extracted", data.clone());
        }
        post
    }

    fn summarize(&self, pages: &[CrawlPageResult]) -> Result<(Vec<Post>, String), String> {
        let posts = pages
            .iter()
            .filter(|page| page.is_success())
            .map(Self::page_post)
            .collect::<Vec<_>>();
        if posts.is_empty() {
            let first_error = pages
                .iter()
                .find_map(|page| page.error.as_deref())
                .unwrap_or("no page retrieved");
            return Err(format!("all {} pages failed: {first_error}", pages.len()));
        }
        let summary = format!(
            "{} of {} pages crawled with the {} engine",
            posts.len(),
            pages.len(),
            self.kind.engine()
        );
        Ok((posts, summary))
    }
}

#[async_trait]
impl PlatformAgent for CrawlAgent {
    fn platform(&self) -> &str {
        self.kind.platform()
    }

    async fn analyze_competitor(
        &self,
        competitor_id: &str,
        _competitor_name: &str,
        _deadline: Instant,
    ) -> Result<AgentResult, SchedulerUnsupported> {
        let platform = self.kind.platform();
        if self.urls.is_empty() {
            return Ok(AgentResult::failed(
                platform,
                competitor_id,
                format!("no {platform} target configured for {competitor_id}"),
            ));
        }
        let worker = match &self.worker {
            Ok(worker) => worker,
            Err(err) => return Ok(AgentResult::failed(platform, competitor_id, err.clone())),
        };

        let request = CrawlRequest::new(self.urls.clone())
            .with_engine(self.kind.engine())
            .with_extraction(self.extraction.clone())
            .with_options(self.options.clone());
        match worker.crawl(&request).await {
            Ok(pages) => match self.summarize(&pages) {
                Ok((posts, summary)) => {
                    info!(platform, competitor_id, posts = posts.len(), "crawl analysis completed");
                    Ok(AgentResult::completed(platform, competitor_id, posts, summary))
                }
                Err(error) => Ok(AgentResult::failed(platform, competitor_id, error)),
            },
            Err(CrawlerError::SchedulerUnsupported(signal)) => Err(signal),
            Err(err) => {
                warn!(platform, competitor_id, error = %err, "crawler worker failed");
                Ok(AgentResult::failed(platform, competitor_id, err.to_string()))
            }
        }
    }

    async fn close(&self) {
        if let Ok(worker) = &self.worker {
            worker.cleanup();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::compat::{HostProfile, OsFamily};
    use crate::crawler::{WorkerCommand, WorkerLimits};

    fn agent(kind: CrawlKind, urls: Vec<String>, program: &str) -> CrawlAgent {
        let worker = IsolatedCrawlerWorker::new(
            WorkerCommand::new(program),
            WorkerLimits {
                crawl_timeout: Duration::from_secs(5),
                launch_timeout: Duration::from_secs(5),
            },
            Arc::new(CompatShim::new(HostProfile::new(OsFamily::Unix))),
        );
        CrawlAgent::new(
            kind,
            urls,
            worker,
            CrawlOptions::default(),
            ExtractionConfig::default(),
        )
    }

    #[tokio::test]
    async fn no_urls_is_a_failed_result() {
        let result = agent(CrawlKind::Website, Vec::new(), "/nonexistent")
            .analyze_competitor("acme", "Acme", Instant::now())
            .await
            .unwrap();
        assert!(!result.is_completed());
        assert_eq!(result.platform, "website");
        assert_eq!(
            result.error.as_deref(),
            Some("no website target configured for acme")
        );
    }

    #[tokio::test]
    async fn spawn_failure_is_a_failed_result() {
        let agent = agent(
            CrawlKind::Browser,
            vec!["https://acme.example/".into()],
            "/nonexistent/rivalwatch-crawler",
        );
        let result = agent
            .analyze_competitor("acme", "Acme", Instant::now())
            .await
            .unwrap();
        assert_eq!(result.platform, "browser");
        assert!(result
            .error
            .as_deref()
            .unwrap()
            .starts_with("failed to spawn crawler worker"));
        agent.close().await;
        agent.close().await;
    }

    #[test]
    fn summary_requires_one_successful_page() {
        let agent = agent(CrawlKind::Website, vec![], "/nonexistent");
        let pages = vec![
            CrawlPageResult::failed("https://a.example/", "http status 500"),
            CrawlPageResult::timeout("https://b.example/", "crawl deadline exceeded"),
        ];
        assert_eq!(
            agent.summarize(&pages).unwrap_err(),
            "all 2 pages failed: http status 500"
        );

        let pages = vec![
            CrawlPageResult::success(
                "https://a.example/",
                Some("Home".into()),
                "Hello".into(),
                Some(serde_json::json!({ "plans": 3 })),
            ),
            CrawlPageResult::failed("https://b.example/", "http status 404"),
        ];
        let (posts, summary) = agent.summarize(&pages).unwrap();
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].get("extracted").unwrap()["plans"], 3);
        assert_eq!(summary, "1 of 2 pages crawled with the http engine");
    }
}
