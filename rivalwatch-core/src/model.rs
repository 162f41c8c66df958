use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::time::Instant;
use uuid::Uuid;

/// The subject of a monitoring job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompetitorTarget {
    pub competitor_id: String,
    pub display_name: String,
    /// Account handles keyed by platform name.
    #[serde(default)]
    pub handles: BTreeMap<String, String>,
    /// Websites and landing pages crawled by the browser and website agents.
    #[serde(default)]
    pub urls: Vec<String>,
}

impl CompetitorTarget {
    pub fn new(competitor_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            competitor_id: competitor_id.into(),
            display_name: display_name.into(),
            handles: BTreeMap::new(),
            urls: Vec::new(),
        }
    }

    pub fn with_handle(mut self, platform: impl Into<String>, handle: impl Into<String>) -> Self {
        self.handles.insert(platform.into(), handle.into());
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.urls.push(url.into());
        self
    }

    pub fn handle(&self, platform: &str) -> Option<&str> {
        self.handles.get(platform).map(String::as_str)
    }
}

/// One unit of dispatched work for a (competitor, platform) pair.
#[derive(Debug, Clone)]
pub struct AgentJob {
    pub job_id: Uuid,
    pub competitor: CompetitorTarget,
    pub platform: String,
    pub deadline: Instant,
}

impl AgentJob {
    pub fn new(competitor: CompetitorTarget, platform: impl Into<String>, deadline: Instant) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            competitor,
            platform: platform.into(),
            deadline,
        }
    }

    pub fn cache_key(&self) -> String {
        format!("{}::{}", self.competitor.competitor_id, self.platform)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Completed,
    Failed,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Completed => "completed",
            AgentStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AgentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("invalid agent status: {other}")),
        }
    }
}

/// Opaque per-platform payload. Only the owning agent knows its shape.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Post(Map<String, Value>);

impl Post {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        let value = value.into();
        if !value.is_null() {
            self.0.insert(key.into(), value);
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Stable identity used to spot the same item fetched twice.
    pub fn identity(&self) -> Option<String> {
        ["id", "url"].iter().find_map(|key| match self.0.get(*key)? {
            Value::String(text) if !text.is_empty() => Some(format!("{key}:{text}")),
            Value::Number(number) => Some(format!("{key}:{number}")),
            _ => None,
        })
    }
}

impl From<Map<String, Value>> for Post {
    fn from(fields: Map<String, Value>) -> Self {
        Self(fields)
    }
}

/// The value every platform agent returns for a job, successful or not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResult {
    pub platform: String,
    pub competitor_id: String,
    pub status: AgentStatus,
    #[serde(default)]
    pub posts: Vec<Post>,
    #[serde(default)]
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub const TIMEOUT_ERROR: &str = "timeout";

impl AgentResult {
    pub fn completed(
        platform: impl Into<String>,
        competitor_id: impl Into<String>,
        posts: Vec<Post>,
        summary: impl Into<String>,
    ) -> Self {
        Self {
            platform: platform.into(),
            competitor_id: competitor_id.into(),
            status: AgentStatus::Completed,
            posts,
            summary: summary.into(),
            error: None,
        }
    }

    pub fn failed(
        platform: impl Into<String>,
        competitor_id: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        let error = error.into();
        Self {
            platform: platform.into(),
            competitor_id: competitor_id.into(),
            status: AgentStatus::Failed,
            posts: Vec::new(),
            summary: format!("analysis failed: {error}"),
            error: Some(error),
        }
    }

    pub fn timed_out(platform: impl Into<String>, competitor_id: impl Into<String>) -> Self {
        Self::failed(platform, competitor_id, TIMEOUT_ERROR)
    }

    pub fn is_completed(&self) -> bool {
        self.status == AgentStatus::Completed
    }

    pub fn is_timeout(&self) -> bool {
        self.error.as_deref() == Some(TIMEOUT_ERROR)
    }
}
