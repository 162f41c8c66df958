//! In-process crawl execution, run inside the `rivalwatch-crawler` child.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};
use url::Url;

use super::error::{FetchError, FetchResult};
use super::extract::{ExtractionRequest, Extractor};
use super::html::{extract_text, extract_title, truncate};
use super::protocol::{CrawlOptions, CrawlPageResult, CrawlRequest, ExtractionConfig};

#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub final_url: String,
    pub status: Option<u16>,
    pub html: String,
}

/// Retrieves the raw document for a URL.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &Url) -> FetchResult<FetchedPage>;

    async fn shutdown(&self) {}
}

pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(options: &CrawlOptions) -> FetchResult<Self> {
        let mut builder = reqwest::Client::builder()
            .timeout(options.page_timeout())
            .redirect(reqwest::redirect::Policy::limited(10));
        if let Some(agent) = &options.user_agent {
            builder = builder.user_agent(agent.clone());
        }
        let client = builder
            .build()
            .map_err(|err| FetchError::Transport(err.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch(&self, url: &Url) -> FetchResult<FetchedPage> {
        let response = self.client.get(url.clone()).send().await?;
        let status = response.status();
        if status.is_client_error() || status.is_server_error() {
            return Err(FetchError::Status {
                status: status.as_u16(),
            });
        }
        let final_url = response.url().to_string();
        let html = response.text().await?;
        Ok(FetchedPage {
            final_url,
            status: Some(status.as_u16()),
            html,
        })
    }
}

enum AttemptError {
    Timeout,
    Fetch(FetchError),
}

/// Crawls a batch of URLs concurrently, isolating each URL's outcome.
pub struct CrawlRunner {
    fetcher: Arc<dyn PageFetcher>,
    extractor: Option<Arc<dyn Extractor>>,
}

impl CrawlRunner {
    pub fn new(fetcher: Arc<dyn PageFetcher>) -> Self {
        Self {
            fetcher,
            extractor: None,
        }
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn Extractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    /// Invokes `on_result` with the input index of each URL as soon as it
    /// finishes, in completion order.
    pub async fn crawl_each<F>(&self, request: &CrawlRequest, mut on_result: F)
    where
        F: FnMut(usize, CrawlPageResult),
    {
        let parallel = request.options.max_parallel_pages.max(1);
        info!(
            urls = request.urls.len(),
            engine = %request.engine,
            use_llm = request.extraction_config.use_llm,
            parallel,
            "crawl batch started"
        );
        let mut pages = stream::iter(request.urls.iter().enumerate())
            .map(|(index, url)| async move {
                let result = self
                    .crawl_one(url, &request.extraction_config, &request.options)
                    .await;
                (index, result)
            })
            .buffer_unordered(parallel);
        while let Some((index, result)) = pages.next().await {
            debug!(index, url = %result.url, status = %result.status, "page finished");
            on_result(index, result);
        }
    }

    /// Crawls the batch and returns one result per URL in input order.
    pub async fn crawl(&self, request: &CrawlRequest) -> Vec<CrawlPageResult> {
        let mut slots: Vec<Option<CrawlPageResult>> = vec![None; request.urls.len()];
        self.crawl_each(request, |index, result| {
            if let Some(slot) = slots.get_mut(index) {
                *slot = Some(result);
            }
        })
        .await;
        slots
            .into_iter()
            .zip(&request.urls)
            .map(|(slot, url)| slot.unwrap_or_else(|| CrawlPageResult::failed(url, "not crawled")))
            .collect()
    }

    pub async fn shutdown(&self) {
        self.fetcher.shutdown().await;
    }

    async fn crawl_one(
        &self,
        url: &str,
        extraction: &ExtractionConfig,
        options: &CrawlOptions,
    ) -> CrawlPageResult {
        let parsed = match parse_target(url) {
            Ok(parsed) => parsed,
            Err(err) => return CrawlPageResult::failed(url, err.to_string()),
        };

        let page = match self.fetch_with_retry(&parsed, options).await {
            Ok(page) => page,
            Err(AttemptError::Timeout) => {
                return CrawlPageResult::timeout(
                    url,
                    format!("page timed out after {}ms", options.page_timeout().as_millis()),
                )
            }
            Err(AttemptError::Fetch(err)) => return CrawlPageResult::failed(url, err.to_string()),
        };

        let title = extract_title(&page.html);
        let content = truncate(extract_text(&page.html), options.max_content_chars);
        if content.is_empty() {
            return CrawlPageResult::failed(url, "no content retrieved");
        }
        if !extraction.use_llm {
            return CrawlPageResult::success(url, title, content, None);
        }

        let Some(extractor) = &self.extractor else {
            return CrawlPageResult::failed(url, "extraction requested but no extractor configured");
        };
        let request = ExtractionRequest::new(&page.final_url, title.as_deref(), &content, extraction);
        match extractor.extract(request).await {
            Ok(data) => CrawlPageResult::success(url, title, content, Some(data)),
            Err(err) => {
                warn!(url, error = %err, "extraction failed");
                CrawlPageResult::failed(url, format!("extraction failed: {err}"))
            }
        }
    }

    async fn fetch_with_retry(
        &self,
        url: &Url,
        options: &CrawlOptions,
    ) -> Result<FetchedPage, AttemptError> {
        let attempts = options.retry_count.saturating_add(1);
        let mut last_error = AttemptError::Timeout;
        for attempt in 1..=attempts {
            let outcome = timeout(options.page_timeout(), self.fetcher.fetch(url)).await;
            last_error = match outcome {
                Ok(Ok(page)) => return Ok(page),
                Ok(Err(err)) if !err.is_retryable() => return Err(AttemptError::Fetch(err)),
                Ok(Err(err)) => {
                    debug!(url = %url, attempt, error = %err, "fetch attempt failed");
                    AttemptError::Fetch(err)
                }
                Err(_) => {
                    debug!(url = %url, attempt, "fetch attempt timed out");
                    AttemptError::Timeout
                }
            };
            if attempt < attempts {
                let delay = options.retry_delay();
                if delay > Duration::ZERO {
                    sleep(delay).await;
                }
            }
        }
        Err(last_error)
    }
}

fn parse_target(url: &str) -> FetchResult<Url> {
    let parsed = Url::parse(url.trim()).map_err(|err| FetchError::InvalidUrl {
        url: url.to_string(),
        reason: err.to_string(),
    })?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        other => Err(FetchError::InvalidUrl {
            url: url.to_string(),
            reason: format!("unsupported scheme {other}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use serde_json::{json, Value};

    use super::*;
    use crate::crawler::error::ExtractionError;
    use crate::crawler::protocol::CrawlStatus;

    enum Behaviour {
        Html(&'static str),
        Status(u16),
        Hang,
        FlakyThenHtml(&'static str),
    }

    struct StubFetcher {
        pages: HashMap<String, Behaviour>,
        calls: Mutex<HashMap<String, usize>>,
    }

    impl StubFetcher {
        fn new(pages: Vec<(&str, Behaviour)>) -> Self {
            Self {
                pages: pages
                    .into_iter()
                    .map(|(url, behaviour)| (url.to_string(), behaviour))
                    .collect(),
                calls: Mutex::new(HashMap::new()),
            }
        }

        fn calls(&self, url: &str) -> usize {
            self.calls.lock().unwrap().get(url).copied().unwrap_or(0)
        }
    }

    #[async_trait]
    impl PageFetcher for StubFetcher {
        async fn fetch(&self, url: &Url) -> FetchResult<FetchedPage> {
            let key = url.to_string();
            let call = {
                let mut calls = self.calls.lock().unwrap();
                let entry = calls.entry(key.clone()).or_insert(0);
                *entry += 1;
                *entry
            };
            let page = |html: &str| FetchedPage {
                final_url: key.clone(),
                status: Some(200),
                html: html.to_string(),
            };
            match self.pages.get(&key) {
                Some(Behaviour::Html(html)) => Ok(page(html)),
                Some(Behaviour::Status(status)) => Err(FetchError::Status { status: *status }),
                Some(Behaviour::FlakyThenHtml(html)) if call > 1 => Ok(page(html)),
                Some(Behaviour::FlakyThenHtml(_)) => {
                    Err(FetchError::Transport("connection reset".into()))
                }
                Some(Behaviour::Hang) => {
                    futures::future::pending::<()>().await;
                    unreachable!()
                }
                None => Err(FetchError::Status { status: 404 }),
            }
        }
    }

    struct StubExtractor {
        fail: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Extractor for StubExtractor {
        async fn extract(&self, request: ExtractionRequest<'_>) -> Result<Value, ExtractionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(ExtractionError::Empty)
            } else {
                Ok(json!({ "title": request.title, "schema": request.schema.is_some() }))
            }
        }
    }

    fn request(urls: &[&str]) -> CrawlRequest {
        let mut request = CrawlRequest::new(urls.iter().map(|url| url.to_string()).collect());
        request.options.retry_count = 1;
        request.options.retry_delay_ms = 10;
        request.options.page_timeout_ms = 1_000;
        request
    }

    const PAGE: &str = "<html><head><title>Home</title></head><body><p>Hello</p></body></html>";

    #[tokio::test]
    async fn failing_url_does_not_affect_siblings() {
        let fetcher = Arc::new(StubFetcher::new(vec![
            ("https://a.example/", Behaviour::Html(PAGE)),
            ("https://b.example/", Behaviour::Status(404)),
            ("https://c.example/", Behaviour::Html(PAGE)),
        ]));
        let runner = CrawlRunner::new(fetcher.clone());
        let results = runner
            .crawl(&request(&["https://a.example/", "https://b.example/", "https://c.example/"]))
            .await;

        let statuses: Vec<_> = results.iter().map(|r| r.status).collect();
        assert_eq!(
            statuses,
            vec![CrawlStatus::Success, CrawlStatus::Failed, CrawlStatus::Success]
        );
        assert_eq!(results[1].url, "https://b.example/");
        assert_eq!(results[1].error.as_deref(), Some("http status 404"));
        assert_eq!(results[0].title.as_deref(), Some("Home"));
        assert_eq!(fetcher.calls("https://b.example/"), 1);
    }

    #[tokio::test]
    async fn invalid_urls_fail_without_fetching() {
        let fetcher = Arc::new(StubFetcher::new(vec![]));
        let runner = CrawlRunner::new(fetcher);
        let results = runner.crawl(&request(&["not a url", "ftp://x.example/"])).await;
        assert!(results.iter().all(|r| r.status == CrawlStatus::Failed));
        assert_eq!(results[0].url, "not a url");
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_retried() {
        let fetcher = Arc::new(StubFetcher::new(vec![(
            "https://flaky.example/",
            Behaviour::FlakyThenHtml(PAGE),
        )]));
        let runner = CrawlRunner::new(fetcher.clone());
        let results = runner.crawl(&request(&["https://flaky.example/"])).await;
        assert!(results[0].is_success());
        assert_eq!(fetcher.calls("https://flaky.example/"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_page_times_out() {
        let fetcher = Arc::new(StubFetcher::new(vec![
            ("https://slow.example/", Behaviour::Hang),
            ("https://fast.example/", Behaviour::Html(PAGE)),
        ]));
        let runner = CrawlRunner::new(fetcher.clone());
        let results = runner
            .crawl(&request(&["https://slow.example/", "https://fast.example/"]))
            .await;
        assert_eq!(results[0].status, CrawlStatus::Timeout);
        assert_eq!(results[1].status, CrawlStatus::Success);
        assert_eq!(fetcher.calls("https://slow.example/"), 2);
    }

    #[tokio::test]
    async fn extraction_controls_success_when_requested() {
        let fetcher = Arc::new(StubFetcher::new(vec![("https://a.example/", Behaviour::Html(PAGE))]));
        let mut req = request(&["https://a.example/"]);
        req.extraction_config = ExtractionConfig {
            use_llm: true,
            schema: Some(json!({ "type": "object" })),
            instruction: None,
        };

        let without_extractor = CrawlRunner::new(fetcher.clone()).crawl(&req).await;
        assert_eq!(without_extractor[0].status, CrawlStatus::Failed);

        let ok = CrawlRunner::new(fetcher.clone())
            .with_extractor(Arc::new(StubExtractor {
                fail: false,
                calls: AtomicUsize::new(0),
            }))
            .crawl(&req)
            .await;
        assert!(ok[0].is_success());
        assert_eq!(ok[0].extracted_data.as_ref().unwrap()["schema"], true);

        let failing = CrawlRunner::new(fetcher)
            .with_extractor(Arc::new(StubExtractor {
                fail: true,
                calls: AtomicUsize::new(0),
            }))
            .crawl(&req)
            .await;
        assert_eq!(failing[0].status, CrawlStatus::Failed);
        assert!(failing[0]
            .error
            .as_deref()
            .unwrap()
            .starts_with("extraction failed"));
    }

    #[tokio::test]
    async fn empty_batch_yields_empty_response() {
        let runner = CrawlRunner::new(Arc::new(StubFetcher::new(vec![])));
        assert!(runner.crawl(&request(&[])).await.is_empty());
    }
}
