use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

use crate::error::{ConfigError, Result};
use crate::model::CompetitorTarget;

pub const ENV_CRAWL_TIMEOUT: &str = "RIVALWATCH_CRAWL_TIMEOUT_SECS";
pub const ENV_CRAWL_RETRY_COUNT: &str = "RIVALWATCH_CRAWL_RETRY_COUNT";
pub const ENV_CRAWL_RETRY_DELAY: &str = "RIVALWATCH_CRAWL_RETRY_DELAY_MS";
pub const ENV_LAUNCH_TIMEOUT: &str = "RIVALWATCH_LAUNCH_TIMEOUT_SECS";
pub const ENV_PAGE_TIMEOUT: &str = "RIVALWATCH_PAGE_TIMEOUT_SECS";
pub const ENV_MAX_CONCURRENT_JOBS: &str = "RIVALWATCH_MAX_CONCURRENT_JOBS";
pub const ENV_YOUTUBE_API_KEY: &str = "RIVALWATCH_YOUTUBE_API_KEY";
pub const ENV_SCRAPER_TOKEN: &str = "RIVALWATCH_SCRAPER_TOKEN";
pub const ENV_EXTRACTOR_URL: &str = "RIVALWATCH_EXTRACTOR_URL";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct MonitorConfig {
    pub orchestrator: OrchestratorSection,
    pub crawler: CrawlerSection,
    pub agents: AgentsSection,
    pub storage: StorageSection,
}

impl MonitorConfig {
    /// Applies `RIVALWATCH_*` variables from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = parse_override::<u64, _>(&lookup, ENV_CRAWL_TIMEOUT)? {
            self.crawler.crawl_timeout_seconds = value;
        }
        if let Some(value) = parse_override::<u32, _>(&lookup, ENV_CRAWL_RETRY_COUNT)? {
            self.crawler.retry_count = value;
        }
        if let Some(value) = parse_override::<u64, _>(&lookup, ENV_CRAWL_RETRY_DELAY)? {
            self.crawler.retry_delay_ms = value;
        }
        if let Some(value) = parse_override::<u64, _>(&lookup, ENV_LAUNCH_TIMEOUT)? {
            self.crawler.launch_timeout_seconds = value;
        }
        if let Some(value) = parse_override::<u64, _>(&lookup, ENV_PAGE_TIMEOUT)? {
            self.crawler.page_timeout_seconds = value;
        }
        if let Some(value) = parse_override::<usize, _>(&lookup, ENV_MAX_CONCURRENT_JOBS)? {
            if value == 0 {
                return Err(ConfigError::InvalidOverride {
                    key: ENV_MAX_CONCURRENT_JOBS.to_string(),
                    value: value.to_string(),
                });
            }
            self.orchestrator.max_concurrent_jobs = value;
        }
        if let Some(key) = lookup(ENV_YOUTUBE_API_KEY).filter(|v| !v.is_empty()) {
            self.agents.youtube.api_key = Some(key);
        }
        if let Some(token) = lookup(ENV_SCRAPER_TOKEN).filter(|v| !v.is_empty()) {
            self.agents.social.token = Some(token);
        }
        if let Some(url) = lookup(ENV_EXTRACTOR_URL).filter(|v| !v.is_empty()) {
            self.crawler.extractor_url = Some(url);
        }
        Ok(())
    }
}

fn parse_override<T, F>(lookup: &F, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    trimmed
        .parse::<T>()
        .map(Some)
        .map_err(|_| ConfigError::InvalidOverride {
            key: key.to_string(),
            value: raw.clone(),
        })
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorSection {
    pub max_concurrent_jobs: usize,
    pub per_job_timeout_seconds: u64,
    /// Zero disables the result cache.
    pub cache_ttl_seconds: u64,
    pub event_buffer: usize,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 4,
            per_job_timeout_seconds: 120,
            cache_ttl_seconds: 300,
            event_buffer: 64,
        }
    }
}

impl OrchestratorSection {
    pub fn per_job_timeout(&self) -> Duration {
        Duration::from_secs(self.per_job_timeout_seconds.max(1))
    }

    pub fn cache_ttl(&self) -> Option<Duration> {
        (self.cache_ttl_seconds > 0).then(|| Duration::from_secs(self.cache_ttl_seconds))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CrawlerSection {
    /// Path to the `rivalwatch-crawler` binary; resolved next to the current
    /// executable when unset.
    pub worker_path: Option<String>,
    pub crawl_timeout_seconds: u64,
    pub launch_timeout_seconds: u64,
    pub page_timeout_seconds: u64,
    pub retry_count: u32,
    pub retry_delay_ms: u64,
    pub max_parallel_pages: usize,
    pub max_content_chars: usize,
    pub user_agent: String,
    pub chromium_path: Option<String>,
    pub extractor_url: Option<String>,
}

impl Default for CrawlerSection {
    fn default() -> Self {
        Self {
            worker_path: None,
            crawl_timeout_seconds: 90,
            launch_timeout_seconds: 15,
            page_timeout_seconds: 30,
            retry_count: 2,
            retry_delay_ms: 1_000,
            max_parallel_pages: 4,
            max_content_chars: 20_000,
            user_agent: "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) rivalwatch/0.1".to_string(),
            chromium_path: None,
            extractor_url: None,
        }
    }
}

impl CrawlerSection {
    pub fn crawl_timeout(&self) -> Duration {
        Duration::from_secs(self.crawl_timeout_seconds.max(1))
    }

    pub fn launch_timeout(&self) -> Duration {
        Duration::from_secs(self.launch_timeout_seconds.max(1))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AgentsSection {
    pub retry: RetrySection,
    pub youtube: YoutubeSection,
    pub social: SocialSection,
    pub website: WebsiteSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_attempts: usize,
    pub delay_ms: u64,
    pub jitter_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay_ms: 1_000,
            jitter_ms: 250,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct YoutubeSection {
    pub api_key: Option<String>,
    pub base_url: String,
    pub max_results: u32,
}

impl Default for YoutubeSection {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://www.googleapis.com/youtube/v3".to_string(),
            max_results: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SocialSection {
    pub token: Option<String>,
    pub base_url: String,
    pub results_limit: u32,
    pub instagram_actor: String,
    pub facebook_actor: String,
}

impl Default for SocialSection {
    fn default() -> Self {
        Self {
            token: None,
            base_url: "https://api.apify.com/v2".to_string(),
            results_limit: 20,
            instagram_actor: "nH2AHrwxeTRJoN5hX".to_string(),
            facebook_actor: "KoJrdxJCTtpon81KY".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebsiteSection {
    pub use_llm: bool,
    pub schema: Option<Value>,
    pub instruction: Option<String>,
}

impl Default for WebsiteSection {
    fn default() -> Self {
        Self {
            use_llm: true,
            schema: None,
            instruction: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    pub reports_db: Option<String>,
}

/// A monitoring job described on disk: which competitors to watch and on
/// which platforms.
#[derive(Debug, Clone, Deserialize)]
pub struct JobSpec {
    pub platforms: Vec<String>,
    pub competitors: Vec<CompetitorTarget>,
}

pub fn load_monitor_config<P: AsRef<Path>>(path: P) -> Result<MonitorConfig> {
    load_toml(path)
}

pub fn load_job_spec<P: AsRef<Path>>(path: P) -> Result<JobSpec> {
    load_toml(path)
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: PathBuf::from(path),
    })
}
