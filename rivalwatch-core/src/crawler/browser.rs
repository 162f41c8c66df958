use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use futures::StreamExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use url::Url;

use super::engine::{FetchedPage, PageFetcher};
use super::error::{FetchError, FetchResult};
use super::protocol::CrawlOptions;

struct Session {
    browser: Browser,
    handler_task: JoinHandle<()>,
}

/// Renders pages in headless Chromium. The browser is launched on first use
/// and shared by every page of the batch.
pub struct BrowserFetcher {
    executable: Option<String>,
    user_agent: Option<String>,
    launch_timeout: Duration,
    page_timeout: Duration,
    session: Mutex<Option<Session>>,
}

impl BrowserFetcher {
    pub fn new(options: &CrawlOptions) -> Self {
        Self {
            executable: options.chromium_path.clone(),
            user_agent: options.user_agent.clone(),
            launch_timeout: options.launch_timeout(),
            page_timeout: options.page_timeout(),
            session: Mutex::new(None),
        }
    }

    fn chromium_config(&self) -> FetchResult<BrowserConfig> {
        let mut builder = BrowserConfig::builder()
            .no_sandbox()
            .request_timeout(self.page_timeout);
        if let Some(path) = &self.executable {
            builder = builder.chrome_executable(path);
        }
        let mut args = vec![
            "--disable-gpu".to_string(),
            "--mute-audio".to_string(),
            "--no-first-run".to_string(),
            "--disable-background-timer-throttling".to_string(),
            "--password-store=basic".to_string(),
        ];
        if let Some(agent) = &self.user_agent {
            args.push(format!("--user-agent={agent}"));
        }
        builder = builder.args(args);
        builder.build().map_err(FetchError::Browser)
    }

    async fn launch(&self) -> FetchResult<Session> {
        let config = self.chromium_config()?;
        info!(executable = ?self.executable, "launching chromium");
        let (browser, mut handler) = timeout(self.launch_timeout, Browser::launch(config))
            .await
            .map_err(|_| FetchError::LaunchTimeout)??;
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(err) = event {
                    debug!(error = %err, "chromium handler reported error");
                }
            }
        });
        Ok(Session {
            browser,
            handler_task,
        })
    }

    async fn open_page(&self) -> FetchResult<chromiumoxide::page::Page> {
        let mut guard = self.session.lock().await;
        if guard.is_none() {
            *guard = Some(self.launch().await?);
        }
        match guard.as_ref() {
            Some(session) => Ok(session.browser.new_page("about:blank").await?),
            None => Err(FetchError::Browser("browser session unavailable".into())),
        }
    }
}

#[async_trait]
impl PageFetcher for BrowserFetcher {
    async fn fetch(&self, url: &Url) -> FetchResult<FetchedPage> {
        let page = self.open_page().await?;
        let rendered = async {
            page.goto(url.as_str()).await?;
            page.wait_for_navigation().await?;
            let final_url = page.url().await?.unwrap_or_else(|| url.to_string());
            let title = page.get_title().await?.unwrap_or_default();
            let mut html = page.content().await?;
            if !title.is_empty() && !html.contains("<title") {
                html = format!("<title>{title}</title>{html}");
            }
            Ok::<_, FetchError>(FetchedPage {
                final_url,
                status: None,
                html,
            })
        }
        .await;
        if let Err(err) = page.close().await {
            debug!(error = %err, "failed to close page");
        }
        rendered
    }

    async fn shutdown(&self) {
        let Some(mut session) = self.session.lock().await.take() else {
            return;
        };
        info!("shutting down chromium");
        if let Err(err) = session.browser.close().await {
            warn!(error = %err, "failed to close browser gracefully");
        }
        if let Err(err) = session.browser.wait().await {
            debug!(error = %err, "browser wait failed");
        }
        session.handler_task.abort();
    }
}
