pub mod browser;
pub mod engine;
pub mod error;
pub mod extract;
pub mod html;
pub mod metrics;
pub mod protocol;
pub mod worker;

pub use browser::BrowserFetcher;
pub use engine::{CrawlRunner, FetchedPage, HttpFetcher, PageFetcher};
pub use error::{CrawlerError, CrawlerResult, ExtractionError, FetchError, FetchResult};
pub use extract::{ExtractionRequest, Extractor, HttpExtractor};
pub use metrics::CrawlMetrics;
pub use protocol::{
    CrawlEngine, CrawlOptions, CrawlPageResult, CrawlRequest, CrawlStatus, ExtractionConfig,
    WorkerMessage,
};
pub use worker::{IsolatedCrawlerWorker, WorkerCommand, WorkerLimits, WORKER_BINARY};
