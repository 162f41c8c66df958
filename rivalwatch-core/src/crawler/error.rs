use std::io;

use thiserror::Error;

use crate::compat::{SchedulerSignal, SchedulerUnsupported};

pub type CrawlerResult<T> = Result<T, CrawlerError>;

/// Failures of the worker process as a whole. Per-URL failures are reported
/// inside the response instead.
#[derive(Debug, Error)]
pub enum CrawlerError {
    #[error("failed to spawn crawler worker {program}: {source}")]
    Spawn { program: String, source: io::Error },
    #[error("crawler worker io error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    SchedulerUnsupported(#[from] SchedulerUnsupported),
    #[error("crawler worker protocol error: {0}")]
    Protocol(String),
    #[error("failed to encode crawl request: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("crawler worker binary not found: {0}")]
    WorkerNotFound(String),
}

impl CrawlerError {
    /// Maps a spawn failure, keeping the scheduler signal distinguishable.
    pub fn spawn(program: impl Into<String>, source: io::Error) -> Self {
        if source.is_scheduler_unsupported() {
            CrawlerError::SchedulerUnsupported(SchedulerUnsupported(source.to_string()))
        } else {
            CrawlerError::Spawn {
                program: program.into(),
                source,
            }
        }
    }
}

impl SchedulerSignal for CrawlerError {
    fn is_scheduler_unsupported(&self) -> bool {
        match self {
            CrawlerError::SchedulerUnsupported(_) => true,
            CrawlerError::Io(err) => err.is_scheduler_unsupported(),
            _ => false,
        }
    }
}

pub type FetchResult<T> = Result<T, FetchError>;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("http status {status}")]
    Status { status: u16 },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("browser error: {0}")]
    Browser(String),
    #[error("browser launch timed out")]
    LaunchTimeout,
}

impl FetchError {
    /// Whether another attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Transport(_) | FetchError::Browser(_) => true,
            FetchError::Status { status } => *status == 429 || *status >= 500,
            FetchError::InvalidUrl { .. } | FetchError::LaunchTimeout => false,
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => FetchError::Status {
                status: status.as_u16(),
            },
            None => FetchError::Transport(err.to_string()),
        }
    }
}

impl From<chromiumoxide::error::CdpError> for FetchError {
    fn from(err: chromiumoxide::error::CdpError) -> Self {
        FetchError::Browser(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("no extractor configured")]
    Unconfigured,
    #[error("extractor request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("extractor returned status {0}")]
    Status(u16),
    #[error("extractor returned no structured data")]
    Empty,
}
