//! Wire types shared by the host and the `rivalwatch-crawler` child.
//!
//! The host writes one [`CrawlRequest`] as a single JSON line on the child's
//! stdin. The child answers with newline-delimited [`WorkerMessage`] records
//! on stdout.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::CrawlerSection;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractionConfig {
    #[serde(default)]
    pub use_llm: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instruction: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrawlEngine {
    #[default]
    Http,
    Browser,
}

impl fmt::Display for CrawlEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CrawlEngine::Http => f.write_str("http"),
            CrawlEngine::Browser => f.write_str("browser"),
        }
    }
}

impl std::str::FromStr for CrawlEngine {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "http" => Ok(Self::Http),
            "browser" => Ok(Self::Browser),
            other => Err(format!("unknown crawl engine: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlOptions {
    pub page_timeout_ms: u64,
    pub retry_count: u32,
    pub retry_delay_ms: u64,
    pub max_parallel_pages: usize,
    pub max_content_chars: usize,
    pub user_agent: Option<String>,
    pub chromium_path: Option<String>,
    pub launch_timeout_ms: u64,
    /// Endpoint of the structured extraction service.
    pub extractor_url: Option<String>,
}

impl Default for CrawlOptions {
    fn default() -> Self {
        Self::from(&CrawlerSection::default())
    }
}

impl From<&CrawlerSection> for CrawlOptions {
    fn from(section: &CrawlerSection) -> Self {
        Self {
            page_timeout_ms: section.page_timeout_seconds.max(1) * 1_000,
            retry_count: section.retry_count,
            retry_delay_ms: section.retry_delay_ms,
            max_parallel_pages: section.max_parallel_pages.max(1),
            max_content_chars: section.max_content_chars,
            user_agent: Some(section.user_agent.clone()),
            chromium_path: section.chromium_path.clone(),
            launch_timeout_ms: section.launch_timeout_seconds.max(1) * 1_000,
            extractor_url: section.extractor_url.clone(),
        }
    }
}

impl CrawlOptions {
    pub fn page_timeout(&self) -> Duration {
        Duration::from_millis(self.page_timeout_ms.max(1))
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn launch_timeout(&self) -> Duration {
        Duration::from_millis(self.launch_timeout_ms.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrawlRequest {
    pub urls: Vec<String>,
    #[serde(default)]
    pub extraction_config: ExtractionConfig,
    #[serde(default)]
    pub engine: CrawlEngine,
    #[serde(default)]
    pub options: CrawlOptions,
}

impl CrawlRequest {
    pub fn new(urls: Vec<String>) -> Self {
        Self {
            urls,
            extraction_config: ExtractionConfig::default(),
            engine: CrawlEngine::default(),
            options: CrawlOptions::default(),
        }
    }

    pub fn with_engine(mut self, engine: CrawlEngine) -> Self {
        self.engine = engine;
        self
    }

    pub fn with_extraction(mut self, extraction: ExtractionConfig) -> Self {
        self.extraction_config = extraction;
        self
    }

    pub fn with_options(mut self, options: CrawlOptions) -> Self {
        self.options = options;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrawlStatus {
    Success,
    Failed,
    Timeout,
}

impl CrawlStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CrawlStatus::Success => "success",
            CrawlStatus::Failed => "failed",
            CrawlStatus::Timeout => "timeout",
        }
    }
}

impl fmt::Display for CrawlStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome for a single URL of a crawl batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrawlPageResult {
    pub url: String,
    pub status: CrawlStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extracted_data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CrawlPageResult {
    pub fn success(
        url: impl Into<String>,
        title: Option<String>,
        content: String,
        extracted_data: Option<Value>,
    ) -> Self {
        Self {
            url: url.into(),
            status: CrawlStatus::Success,
            title,
            content: Some(content),
            extracted_data,
            error: None,
        }
    }

    pub fn failed(url: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            status: CrawlStatus::Failed,
            title: None,
            content: None,
            extracted_data: None,
            error: Some(error.into()),
        }
    }

    pub fn timeout(url: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            status: CrawlStatus::Timeout,
            ..Self::failed(url, error)
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == CrawlStatus::Success
    }
}

/// One NDJSON record written by the child on stdout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    Ready { pid: u32 },
    Page { index: usize, result: CrawlPageResult },
    Done,
    Fatal { error: String },
}

impl WorkerMessage {
    pub fn to_line(&self) -> serde_json::Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}
