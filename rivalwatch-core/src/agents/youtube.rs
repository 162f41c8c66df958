use async_trait::async_trait;
use serde::Deserialize;
use tokio::time::Instant;
use tracing::info;

use crate::compat::SchedulerUnsupported;
use crate::config::YoutubeSection;
use crate::model::{AgentResult, Post};

use super::{error_body, into_agent_result, AgentError, PlatformAgent, Result, RetryPolicy, YOUTUBE};

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    items: Vec<SearchItem>,
}

#[derive(Debug, Deserialize)]
struct SearchItem {
    id: SearchId,
    #[serde(default)]
    snippet: Snippet,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchId {
    video_id: Option<String>,
    channel_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Snippet {
    title: Option<String>,
    description: Option<String>,
    published_at: Option<String>,
    channel_title: Option<String>,
    channel_id: Option<String>,
}

/// Recent uploads of a competitor's channel through the YouTube Data API v3.
pub struct YoutubeAgent {
    client: reqwest::Client,
    config: YoutubeSection,
    retry: RetryPolicy,
    handle: Option<String>,
}

impl YoutubeAgent {
    pub fn new(
        client: reqwest::Client,
        config: YoutubeSection,
        retry: RetryPolicy,
        handle: Option<String>,
    ) -> Self {
        Self {
            client,
            config,
            retry,
            handle,
        }
    }

    async fn analyze(&self, competitor_name: &str, deadline: Instant) -> Result<(Vec<Post>, String)> {
        let api_key = self
            .config
            .api_key
            .as_deref()
            .filter(|key| !key.is_empty())
            .ok_or(AgentError::MissingCredential("youtube api key"))?;
        let query = self.handle.as_deref().unwrap_or(competitor_name);

        let channels = self
            .search(
                &[
                    ("part", "snippet"),
                    ("type", "channel"),
                    ("maxResults", "1"),
                    ("q", query),
                    ("key", api_key),
                ],
                deadline,
            )
            .await?;
        let channel = channels
            .items
            .into_iter()
            .find_map(|item| {
                let id = item.id.channel_id.or(item.snippet.channel_id)?;
                Some((id, item.snippet.title))
            })
            .ok_or_else(|| AgentError::MissingTarget {
                platform: YOUTUBE.to_string(),
                competitor_id: query.to_string(),
            })?;
        let (channel_id, channel_title) = channel;

        let max_results = self.config.max_results.clamp(1, 50).to_string();
        let videos = self
            .search(
                &[
                    ("part", "snippet"),
                    ("type", "video"),
                    ("order", "date"),
                    ("channelId", channel_id.as_str()),
                    ("maxResults", max_results.as_str()),
                    ("key", api_key),
                ],
                deadline,
            )
            .await?;

        let posts = videos
            .items
            .into_iter()
            .filter_map(|item| {
                let video_id = item.id.video_id?;
                let snippet = item.snippet;
                Some(
                    Post::new()
                        .with("url", format!("https://www.youtube.com/watch?v={video_id}"))
                        .with("id", video_id)
                        .with("title", snippet.title)
                        .with("description", snippet.description)
                        .with("published_at", snippet.published_at)
                        .with("channel", snippet.channel_title),
                )
            })
            .collect::<Vec<_>>();

        let channel_name = channel_title.unwrap_or_else(|| competitor_name.to_string());
        info!(channel_id = %channel_id, videos = posts.len(), "youtube channel analyzed");
        let summary = format!("{} recent videos from {}", posts.len(), channel_name);
        Ok((posts, summary))
    }

    async fn search(&self, params: &[(&str, &str)], deadline: Instant) -> Result<SearchResponse> {
        let url = format!("{}/search", self.config.base_url.trim_end_matches('/'));
        let url = url.as_str();
        self.retry
            .run("youtube.search", deadline, move |_| async move {
                let response = self.client.get(url).query(params).send().await?;
                let status = response.status();
                if !status.is_success() {
                    let message = error_body(response).await;
                    if status.as_u16() == 403 && message.contains("quotaExceeded") {
                        return Err(AgentError::Quota(message));
                    }
                    return Err(AgentError::Api {
                        status: status.as_u16(),
                        message,
                    });
                }
                Ok(response.json::<SearchResponse>().await?)
            })
            .await
    }
}

#[async_trait]
impl PlatformAgent for YoutubeAgent {
    fn platform(&self) -> &str {
        YOUTUBE
    }

    async fn analyze_competitor(
        &self,
        competitor_id: &str,
        competitor_name: &str,
        deadline: Instant,
    ) -> std::result::Result<AgentResult, SchedulerUnsupported> {
        let outcome = self.analyze(competitor_name, deadline).await;
        Ok(into_agent_result(YOUTUBE, competitor_id, outcome))
    }
}
