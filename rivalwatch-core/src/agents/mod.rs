//! Platform agents: one implementation per monitored platform, resolved by
//! name through an [`AgentRegistry`].

pub mod crawl;
pub mod retry;
pub mod social;
pub mod youtube;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::Instant;
use tracing::warn;

use crate::compat::{CompatShim, SchedulerUnsupported};
use crate::config::MonitorConfig;
use crate::model::{AgentResult, CompetitorTarget, Post};

pub use crawl::{CrawlAgent, CrawlKind};
pub use retry::RetryPolicy;
pub use social::{SocialAgent, SocialNetwork};
pub use youtube::YoutubeAgent;

pub const YOUTUBE: &str = "youtube";
pub const INSTAGRAM: &str = "instagram";
pub const FACEBOOK: &str = "facebook";
pub const BROWSER: &str = "browser";
pub const WEBSITE: &str = "website";

pub type Result<T> = std::result::Result<T, AgentError>;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("missing credential: {0}")]
    MissingCredential(&'static str),
    #[error("no {platform} target configured for {competitor_id}")]
    MissingTarget {
        platform: String,
        competitor_id: String,
    },
    #[error("network error: {0}")]
    Transport(String),
    #[error("api error (status {status}): {message}")]
    Api { status: u16, message: String },
    #[error("quota exceeded: {0}")]
    Quota(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("scraper run failed with status {0}")]
    RunFailed(String),
    #[error("deadline exceeded")]
    Deadline,
}

impl AgentError {
    /// Errors worth another attempt under the agent's retry policy.
    pub fn is_transient(&self) -> bool {
        match self {
            AgentError::Transport(_) => true,
            AgentError::Api { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for AgentError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            AgentError::Parse(err.to_string())
        } else {
            AgentError::Transport(err.to_string())
        }
    }
}

impl From<serde_json::Error> for AgentError {
    fn from(err: serde_json::Error) -> Self {
        AgentError::Parse(err.to_string())
    }
}

/// Analyzes one competitor on one platform.
///
/// Every internal failure is reported as a `failed` [`AgentResult`]. The only
/// error allowed to escape is [`SchedulerUnsupported`], so the compatibility
/// shim can intercept it.
#[async_trait]
pub trait PlatformAgent: Send + Sync {
    fn platform(&self) -> &str;

    async fn analyze_competitor(
        &self,
        competitor_id: &str,
        competitor_name: &str,
        deadline: Instant,
    ) -> std::result::Result<AgentResult, SchedulerUnsupported>;

    /// Releases held resources. Called after every analysis, successful or not.
    async fn close(&self) {}
}

/// Builds an agent bound to a competitor's handles and URLs.
pub trait AgentFactory: Send + Sync {
    fn create(&self, target: &CompetitorTarget) -> Arc<dyn PlatformAgent>;
}

impl<F> AgentFactory for F
where
    F: Fn(&CompetitorTarget) -> Arc<dyn PlatformAgent> + Send + Sync,
{
    fn create(&self, target: &CompetitorTarget) -> Arc<dyn PlatformAgent> {
        self(target)
    }
}

#[derive(Clone, Default)]
pub struct AgentRegistry {
    factories: BTreeMap<String, Arc<dyn AgentFactory>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in platform wired from configuration.
    pub fn with_defaults(config: &MonitorConfig, shim: Arc<CompatShim>) -> Self {
        let mut registry = Self::new();
        let client = reqwest::Client::new();
        let retry = RetryPolicy::new(&config.agents.retry);

        let youtube = config.agents.youtube.clone();
        let (yt_client, yt_retry) = (client.clone(), retry.clone());
        registry.register(YOUTUBE, move |target: &CompetitorTarget| {
            Arc::new(YoutubeAgent::new(
                yt_client.clone(),
                youtube.clone(),
                yt_retry.clone(),
                target.handle(YOUTUBE).map(str::to_string),
            )) as Arc<dyn PlatformAgent>
        });

        for network in [SocialNetwork::Instagram, SocialNetwork::Facebook] {
            let social = config.agents.social.clone();
            let (sn_client, sn_retry) = (client.clone(), retry.clone());
            registry.register(network.platform(), move |target: &CompetitorTarget| {
                Arc::new(SocialAgent::new(
                    network,
                    sn_client.clone(),
                    social.clone(),
                    sn_retry.clone(),
                    network.account(target),
                )) as Arc<dyn PlatformAgent>
            });
        }

        for kind in [CrawlKind::Browser, CrawlKind::Website] {
            let crawler = config.crawler.clone();
            let website = config.agents.website.clone();
            let shim = Arc::clone(&shim);
            registry.register(kind.platform(), move |target: &CompetitorTarget| {
                Arc::new(CrawlAgent::from_config(
                    kind,
                    target.urls.clone(),
                    &crawler,
                    &website,
                    Arc::clone(&shim),
                )) as Arc<dyn PlatformAgent>
            });
        }

        registry
    }

    pub fn register<F>(&mut self, platform: impl Into<String>, factory: F) -> &mut Self
    where
        F: AgentFactory + 'static,
    {
        self.factories.insert(platform.into(), Arc::new(factory));
        self
    }

    pub fn resolve(&self, platform: &str, target: &CompetitorTarget) -> Option<Arc<dyn PlatformAgent>> {
        self.factories
            .get(platform)
            .map(|factory| factory.create(target))
    }

    pub fn contains(&self, platform: &str) -> bool {
        self.factories.contains_key(platform)
    }

    pub fn platforms(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }
}

/// Converts an agent's internal outcome into the result contract.
pub(crate) fn into_agent_result(
    platform: &str,
    competitor_id: &str,
    outcome: Result<(Vec<Post>, String)>,
) -> AgentResult {
    match outcome {
        Ok((posts, summary)) => AgentResult::completed(platform, competitor_id, posts, summary),
        Err(err) => {
            warn!(platform, competitor_id, error = %err, "agent analysis failed");
            AgentResult::failed(platform, competitor_id, err.to_string())
        }
    }
}

/// Reads a response body for an error, capped so a large HTML error page
/// does not end up in reports.
pub(crate) async fn error_body(response: reqwest::Response) -> String {
    let body = response.text().await.unwrap_or_default();
    crate::crawler::html::truncate(body.trim().to_string(), 300)
}

#[cfg(test)]
pub(crate) mod test_support {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serves canned JSON responses. The first route whose pattern is
    /// contained in the request target wins; unmatched requests get a 404.
    pub async fn serve(routes: Vec<(&'static str, u16, String)>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let routes = routes.clone();
                tokio::spawn(async move {
                    let mut buf = Vec::new();
                    let mut chunk = [0u8; 4096];
                    let head_end = loop {
                        let n = socket.read(&mut chunk).await.unwrap_or(0);
                        if n == 0 {
                            return;
                        }
                        buf.extend_from_slice(&chunk[..n]);
                        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                            break pos + 4;
                        }
                    };
                    let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
                    let content_length = head
                        .lines()
                        .find_map(|line| {
                            let (key, value) = line.split_once(':')?;
                            if key.eq_ignore_ascii_case("content-length") {
                                value.trim().parse::<usize>().ok()
                            } else {
                                None
                            }
                        })
                        .unwrap_or(0);
                    while buf.len() < head_end + content_length {
                        let n = socket.read(&mut chunk).await.unwrap_or(0);
                        if n == 0 {
                            break;
                        }
                        buf.extend_from_slice(&chunk[..n]);
                    }
                    let target = head.split_whitespace().nth(1).unwrap_or("/").to_string();
                    let (status, body) = routes
                        .iter()
                        .find(|(pattern, _, _)| target.contains(pattern))
                        .map(|(_, status, body)| (*status, body.clone()))
                        .unwrap_or((404, "{}".to_string()));
                    let response = format!(
                        "HTTP/1.1 {status} Canned\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                        body.len()
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });
        format!("http://{addr}")
    }
}
