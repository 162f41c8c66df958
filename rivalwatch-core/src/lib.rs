pub mod agents;
pub mod cache;
pub mod compat;
pub mod config;
pub mod crawler;
pub mod error;
pub mod events;
pub mod model;
pub mod orchestrator;
pub mod report;
pub mod sqlite;
pub mod store;

pub use agents::{AgentError, AgentFactory, AgentRegistry, PlatformAgent, RetryPolicy};
pub use cache::TtlCache;
pub use compat::{CompatShim, HostProfile, OsFamily, SchedulerUnsupported, SpawnPolicy};
pub use config::{
    load_job_spec, load_monitor_config, AgentsSection, CrawlerSection, JobSpec, MonitorConfig,
    OrchestratorSection, StorageSection,
};
pub use crawler::{
    CrawlEngine, CrawlOptions, CrawlPageResult, CrawlRequest, CrawlStatus, CrawlerError,
    ExtractionConfig, IsolatedCrawlerWorker,
};
pub use error::{ConfigError, Result};
pub use events::{EventBroadcaster, EventMessage, Subscription};
pub use model::{AgentJob, AgentResult, AgentStatus, CompetitorTarget, Post};
pub use orchestrator::AgentOrchestrator;
pub use report::{AggregatedReport, JobFailure, ResultAggregator, TaggedPost};
pub use store::{
    MemoryReportStore, ReportFilter, ReportStore, SqliteReportStore, SqliteReportStoreBuilder,
    StoreError, StoreResult, StoredReport,
};
