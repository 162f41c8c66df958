//! Instagram and Facebook through a hosted scraping-actor API: start a run,
//! wait for it to finish, then read the run's dataset items.

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::compat::SchedulerUnsupported;
use crate::config::SocialSection;
use crate::model::{AgentResult, CompetitorTarget, Post};

use super::{
    error_body, into_agent_result, AgentError, PlatformAgent, Result, RetryPolicy, FACEBOOK,
    INSTAGRAM,
};

const MAX_WAIT_SECONDS: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocialNetwork {
    Instagram,
    Facebook,
}

impl SocialNetwork {
    pub fn platform(&self) -> &'static str {
        match self {
            SocialNetwork::Instagram => INSTAGRAM,
            SocialNetwork::Facebook => FACEBOOK,
        }
    }

    /// The account reference the scraper expects: a username for Instagram,
    /// a page URL for Facebook.
    pub fn account(&self, target: &CompetitorTarget) -> Option<String> {
        let handle = target.handle(self.platform())?.trim();
        if handle.is_empty() {
            return None;
        }
        match self {
            SocialNetwork::Instagram => Some(handle.trim_start_matches('@').to_string()),
            SocialNetwork::Facebook if handle.starts_with("http") => Some(handle.to_string()),
            SocialNetwork::Facebook => Some(format!("https://www.facebook.com/{handle}")),
        }
    }

    fn actor<'a>(&self, config: &'a SocialSection) -> &'a str {
        match self {
            SocialNetwork::Instagram => &config.instagram_actor,
            SocialNetwork::Facebook => &config.facebook_actor,
        }
    }

    fn input(&self, account: &str, limit: u32) -> Value {
        match self {
            SocialNetwork::Instagram => serde_json::to_value(InstagramInput {
                username: vec![account.to_string()],
                results_limit: limit,
            }),
            SocialNetwork::Facebook => serde_json::to_value(FacebookInput {
                start_urls: vec![StartUrl {
                    url: account.to_string(),
                }],
                results_limit: limit,
            }),
        }
        .unwrap_or(Value::Null)
    }

    fn to_post(&self, item: &Map<String, Value>) -> Post {
        let mut post = Post::new();
        let fields: &[(&str, &str)] = match self {
            SocialNetwork::Instagram => &[
                ("id", "id"),
                ("shortCode", "short_code"),
                ("url", "url"),
                ("caption", "caption"),
                ("likesCount", "likes"),
                ("commentsCount", "comments"),
                ("timestamp", "published_at"),
                ("type", "type"),
            ],
            SocialNetwork::Facebook => &[
                ("postId", "id"),
                ("url", "url"),
                ("text", "text"),
                ("likes", "likes"),
                ("comments", "comments"),
                ("shares", "shares"),
                ("time", "published_at"),
            ],
        };
        for (source, target) in fields {
            if let Some(value) = item.get(*source) {
                if matches!(value, Value::String(_) | Value::Number(_) | Value::Bool(_)) {
                    post.insert(*target, value.clone());
                }
            }
        }
        post
    }
}

#[derive(Debug, Serialize)]
struct InstagramInput {
    username: Vec<String>,
    #[serde(rename = "resultsLimit")]
    results_limit: u32,
}

#[derive(Debug, Serialize)]
struct FacebookInput {
    #[serde(rename = "startUrls")]
    start_urls: Vec<StartUrl>,
    #[serde(rename = "resultsLimit")]
    results_limit: u32,
}

#[derive(Debug, Serialize)]
struct StartUrl {
    url: String,
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunData {
    id: String,
    status: String,
    default_dataset_id: String,
}

pub struct SocialAgent {
    network: SocialNetwork,
    client: reqwest::Client,
    config: SocialSection,
    retry: RetryPolicy,
    account: Option<String>,
}

impl SocialAgent {
    pub fn new(
        network: SocialNetwork,
        client: reqwest::Client,
        config: SocialSection,
        retry: RetryPolicy,
        account: Option<String>,
    ) -> Self {
        Self {
            network,
            client,
            config,
            retry,
            account,
        }
    }

    async fn analyze(
        &self,
        competitor_id: &str,
        deadline: Instant,
    ) -> Result<(Vec<Post>, String)> {
        let token = self
            .config
            .token
            .as_deref()
            .filter(|token| !token.is_empty())
            .ok_or(AgentError::MissingCredential("scraper api token"))?;
        let account = self
            .account
            .as_deref()
            .ok_or_else(|| AgentError::MissingTarget {
                platform: self.network.platform().to_string(),
                competitor_id: competitor_id.to_string(),
            })?;

        let base = self.config.base_url.trim_end_matches('/');
        let actor = self.network.actor(&self.config);
        let input = self.network.input(account, self.config.results_limit);
        info!(platform = self.network.platform(), account, "starting scraper run");

        let run: ApiResponse<RunData> = self
            .send(token, deadline, |client| {
                client
                    .post(format!("{base}/acts/{actor}/runs"))
                    .json(&input)
            })
            .await?;
        let completed = self.wait_for_run(base, token, run.data, deadline).await?;

        let items: Vec<Map<String, Value>> = self
            .send(token, deadline, |client| {
                client
                    .get(format!(
                        "{base}/datasets/{}/items",
                        completed.default_dataset_id
                    ))
                    .query(&[("format", "json")])
            })
            .await?;
        let posts = items
            .iter()
            .map(|item| self.network.to_post(item))
            .filter(|post| !post.is_empty())
            .collect::<Vec<_>>();

        let summary = format!(
            "{} recent {} posts from {}",
            posts.len(),
            self.network.platform(),
            account
        );
        Ok((posts, summary))
    }

    async fn wait_for_run(
        &self,
        base: &str,
        token: &str,
        mut run: RunData,
        deadline: Instant,
    ) -> Result<RunData> {
        loop {
            match run.status.as_str() {
                "SUCCEEDED" => return Ok(run),
                "FAILED" | "ABORTED" | "TIMED-OUT" => return Err(AgentError::RunFailed(run.status)),
                _ => {}
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(AgentError::Deadline);
            }
            let wait = remaining
                .min(Duration::from_secs(MAX_WAIT_SECONDS))
                .as_secs()
                .max(1)
                .to_string();
            debug!(run_id = %run.id, status = %run.status, "scraper run still in progress");
            let run_id = run.id.clone();
            let polled: ApiResponse<RunData> = self
                .send(token, deadline, |client| {
                    client
                        .get(format!("{base}/actor-runs/{run_id}"))
                        .query(&[("waitForFinish", wait.as_str())])
                })
                .await?;
            run = polled.data;
        }
    }

    async fn send<T, B>(&self, token: &str, deadline: Instant, build: B) -> Result<T>
    where
        T: DeserializeOwned,
        B: Fn(&reqwest::Client) -> reqwest::RequestBuilder + Send + Sync,
    {
        let build = &build;
        self.retry
            .run(self.network.platform(), deadline, move |_| async move {
                let response = build(&self.client).bearer_auth(token).send().await?;
                let status = response.status();
                if !status.is_success() {
                    let message = error_body(response).await;
                    return Err(AgentError::Api {
                        status: status.as_u16(),
                        message,
                    });
                }
                let body = response.bytes().await?;
                Ok(serde_json::from_slice::<T>(&body)?)
            })
            .await
    }
}

#[async_trait]
impl PlatformAgent for SocialAgent {
    fn platform(&self) -> &str {
        self.network.platform()
    }

    async fn analyze_competitor(
        &self,
        competitor_id: &str,
        _competitor_name: &str,
        deadline: Instant,
    ) -> std::result::Result<AgentResult, SchedulerUnsupported> {
        let outcome = self.analyze(competitor_id, deadline).await;
        Ok(into_agent_result(
            self.network.platform(),
            competitor_id,
            outcome,
        ))
    }
}
