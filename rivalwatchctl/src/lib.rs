use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::SecondsFormat;
use clap::{Args, Parser, Subcommand, ValueEnum};
use rivalwatch_core::crawler::CrawlMetrics;
use rivalwatch_core::{
    load_job_spec, load_monitor_config, AgentOrchestrator, AgentRegistry, AggregatedReport,
    CompatShim, CrawlEngine, CrawlOptions, CrawlPageResult, CrawlRequest, EventBroadcaster,
    ExtractionConfig, IsolatedCrawlerWorker, MonitorConfig, ReportFilter, ReportStore,
    SqliteReportStore, StoredReport, TtlCache,
};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

pub const DEFAULT_CONFIG: &str = "rivalwatch.toml";
pub const DEFAULT_REPORTS_DB: &str = "rivalwatch-reports.sqlite";

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] rivalwatch_core::ConfigError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("report store error: {0}")]
    Store(#[from] rivalwatch_core::StoreError),
    #[error("crawler error: {0}")]
    Crawler(#[from] rivalwatch_core::CrawlerError),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Competitor monitoring control interface", long_about = None)]
pub struct Cli {
    /// Path to rivalwatch.toml (defaults apply when absent)
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Overrides storage.reports_db
    #[arg(long)]
    pub reports_db: Option<PathBuf>,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Runs a monitoring job across competitors and platforms
    Run(RunArgs),
    /// Crawls URLs through the isolated crawler worker
    Crawl(CrawlArgs),
    /// Lists stored monitoring reports
    History(HistoryArgs),
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Job file listing competitors and platforms
    #[arg(long)]
    pub job: PathBuf,
    /// Restricts the run to these platforms (repeatable)
    #[arg(long = "platform")]
    pub platforms: Vec<String>,
    /// Maximum number of jobs in flight
    #[arg(long)]
    pub concurrency: Option<usize>,
    /// Per-job deadline in seconds
    #[arg(long)]
    pub timeout_secs: Option<u64>,
    /// Streams progress events to stdout as NDJSON
    #[arg(long, default_value_t = false)]
    pub events: bool,
    /// Saves the report to the report database
    #[arg(long, default_value_t = false)]
    pub save: bool,
}

#[derive(Args, Debug)]
pub struct CrawlArgs {
    #[arg(required = true)]
    pub urls: Vec<String>,
    #[arg(long, default_value_t = CrawlEngine::Http)]
    pub engine: CrawlEngine,
    /// Requests schema-guided extraction for every page
    #[arg(long, default_value_t = false)]
    pub use_llm: bool,
    /// JSON file with the extraction schema
    #[arg(long)]
    pub schema: Option<PathBuf>,
    #[arg(long)]
    pub instruction: Option<String>,
}

#[derive(Args, Debug)]
pub struct HistoryArgs {
    #[arg(long)]
    pub competitor: Option<String>,
    #[arg(long, default_value_t = 10)]
    pub limit: usize,
}

pub fn run(cli: Cli) -> Result<()> {
    let context = AppContext::new(&cli)?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    match &cli.command {
        Commands::Run(args) => {
            let output = runtime.block_on(context.run_job(args))?;
            render(&output, cli.format)?;
        }
        Commands::Crawl(args) => {
            let output = runtime.block_on(context.crawl(args))?;
            render(&output, cli.format)?;
        }
        Commands::History(args) => {
            let output = runtime.block_on(context.history(args))?;
            render(&output, cli.format)?;
        }
    }

    Ok(())
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

#[derive(Debug)]
struct AppContext {
    config: MonitorConfig,
    reports_db: PathBuf,
}

impl AppContext {
    fn new(cli: &Cli) -> Result<Self> {
        let mut config = match &cli.config {
            Some(path) => load_monitor_config(path)?,
            None if Path::new(DEFAULT_CONFIG).is_file() => load_monitor_config(DEFAULT_CONFIG)?,
            None => MonitorConfig::default(),
        };
        config.apply_env_overrides()?;

        let reports_db = cli
            .reports_db
            .clone()
            .or_else(|| config.storage.reports_db.as_ref().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_REPORTS_DB));

        Ok(Self { config, reports_db })
    }

    fn report_store(&self) -> Result<SqliteReportStore> {
        Ok(SqliteReportStore::new(&self.reports_db)?)
    }

    async fn run_job(&self, args: &RunArgs) -> Result<RunOutput> {
        let job = load_job_spec(&args.job)?;
        let platforms = if args.platforms.is_empty() {
            job.platforms.clone()
        } else {
            args.platforms.clone()
        };
        let orchestration = &self.config.orchestrator;
        let concurrency = args.concurrency.unwrap_or(orchestration.max_concurrent_jobs);
        if concurrency == 0 {
            return Err(AppError::InvalidArgument(
                "--concurrency must be at least 1".to_string(),
            ));
        }
        let timeout = args
            .timeout_secs
            .map(|secs| Duration::from_secs(secs.max(1)))
            .unwrap_or_else(|| orchestration.per_job_timeout());

        let shim = CompatShim::global();
        let registry = AgentRegistry::with_defaults(&self.config, Arc::clone(&shim));
        let events = EventBroadcaster::new(orchestration.event_buffer);
        let printer = args.events.then(|| {
            let mut subscription = events.subscribe();
            tokio::spawn(async move {
                while let Some(message) = subscription.recv().await {
                    match message.to_ndjson() {
                        Ok(line) => print!("{line}"),
                        Err(err) => debug!(error = %err, "failed to encode event"),
                    }
                }
            })
        });

        let mut orchestrator = AgentOrchestrator::new(registry, shim, events);
        if let Some(ttl) = orchestration.cache_ttl() {
            orchestrator = orchestrator.with_cache(Arc::new(TtlCache::new()), ttl);
        }

        let report = orchestrator
            .run_monitoring_job(&job.competitors, &platforms, concurrency, timeout)
            .await;
        drop(orchestrator);
        if let Some(printer) = printer {
            if let Err(err) = printer.await {
                debug!(error = %err, "event printer stopped");
            }
        }

        let saved_to = if args.save {
            let store = self.report_store()?;
            store.initialize()?;
            store.save(&report).await?;
            info!(run_id = %report.run_id, path = %self.reports_db.display(), "report saved");
            Some(self.reports_db.display().to_string())
        } else {
            None
        };

        Ok(RunOutput { report, saved_to })
    }

    async fn crawl(&self, args: &CrawlArgs) -> Result<CrawlOutput> {
        let schema = match &args.schema {
            Some(path) => Some(serde_json::from_str(&fs::read_to_string(path)?)?),
            None => None,
        };
        let request = CrawlRequest::new(args.urls.clone())
            .with_engine(args.engine)
            .with_extraction(ExtractionConfig {
                use_llm: args.use_llm,
                schema,
                instruction: args.instruction.clone(),
            })
            .with_options(CrawlOptions::from(&self.config.crawler));

        let worker = IsolatedCrawlerWorker::from_config(&self.config.crawler, CompatShim::global())?;
        let outcome = worker.crawl(&request).await;
        worker.cleanup();
        Ok(CrawlOutput {
            pages: outcome?,
            metrics: worker.metrics(),
        })
    }

    async fn history(&self, args: &HistoryArgs) -> Result<HistoryOutput> {
        let store = SqliteReportStore::builder()
            .path(&self.reports_db)
            .create_if_missing(false)
            .build()?;
        let mut filter = ReportFilter::default().limit(args.limit);
        if let Some(competitor) = &args.competitor {
            filter = filter.competitor(competitor.clone());
        }
        let reports = store.load(&filter).await?;
        Ok(HistoryOutput { reports })
    }
}

#[derive(Debug, Serialize)]
struct RunOutput {
    report: AggregatedReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    saved_to: Option<String>,
}

impl DisplayFallback for RunOutput {
    fn display(&self) -> String {
        let report = &self.report;
        let mut lines = vec![format!(
            "Run {}: {}/{} jobs completed, {} posts",
            report.run_id,
            report.completed,
            report.total_jobs,
            report.posts.len()
        )];
        for result in &report.results {
            let detail = if result.is_completed() {
                result.summary.as_str()
            } else {
                result.error.as_deref().unwrap_or("unknown error")
            };
            lines.push(format!(
                "  - {} / {}: {} ({})",
                result.competitor_id,
                result.platform,
                result.status.as_str(),
                detail
            ));
        }
        if let Some(path) = &self.saved_to {
            lines.push(format!("Saved to {path}"));
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
struct CrawlOutput {
    pages: Vec<CrawlPageResult>,
    metrics: CrawlMetrics,
}

impl DisplayFallback for CrawlOutput {
    fn display(&self) -> String {
        if self.pages.is_empty() {
            return "No URLs crawled".to_string();
        }
        let mut lines = Vec::new();
        for (index, page) in self.pages.iter().enumerate() {
            let detail = if page.is_success() {
                page.title.as_deref().unwrap_or("<untitled>")
            } else {
                page.error.as_deref().unwrap_or("-")
            };
            lines.push(format!(
                "[{index}] {:?} {} | {}",
                page.status, page.url, detail
            ));
        }
        lines.push(format!(
            "ok={} failed={} timed_out={}",
            self.metrics.pages_ok, self.metrics.pages_failed, self.metrics.pages_timed_out
        ));
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
struct HistoryOutput {
    reports: Vec<StoredReport>,
}

impl DisplayFallback for HistoryOutput {
    fn display(&self) -> String {
        if self.reports.is_empty() {
            return "No reports stored".to_string();
        }
        self.reports
            .iter()
            .map(|stored| {
                format!(
                    "{} | {} | completed={}/{} failed={}",
                    stored.run_id,
                    stored
                        .generated_at
                        .to_rfc3339_opts(SecondsFormat::Secs, true),
                    stored.completed,
                    stored.total_jobs,
                    stored.failed
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn context(temp: &TempDir) -> AppContext {
        AppContext {
            config: MonitorConfig::default(),
            reports_db: temp.path().join("reports.sqlite"),
        }
    }

    fn write_job(temp: &TempDir) -> PathBuf {
        let path = temp.path().join("job.toml");
        fs::write(
            &path,
            r#"
            platforms = ["tiktok"]

            [[competitors]]
            competitor_id = "acme"
            display_name = "Acme"
            "#,
        )
        .unwrap();
        path
    }

    #[test]
    fn parses_run_arguments() {
        let cli = Cli::try_parse_from([
            "rivalwatchctl",
            "--format",
            "json",
            "run",
            "--job",
            "job.toml",
            "--platform",
            "youtube",
            "--platform",
            "website",
            "--concurrency",
            "2",
            "--events",
        ])
        .unwrap();
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.platforms, vec!["youtube", "website"]);
                assert_eq!(args.concurrency, Some(2));
                assert!(args.events);
                assert!(!args.save);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn crawl_requires_urls_and_known_engine() {
        assert!(Cli::try_parse_from(["rivalwatchctl", "crawl"]).is_err());
        assert!(Cli::try_parse_from([
            "rivalwatchctl",
            "crawl",
            "--engine",
            "gecko",
            "https://a.example/"
        ])
        .is_err());
        let cli = Cli::try_parse_from([
            "rivalwatchctl",
            "crawl",
            "--engine",
            "browser",
            "https://a.example/",
        ])
        .unwrap();
        match cli.command {
            Commands::Crawl(args) => assert_eq!(args.engine, CrawlEngine::Browser),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[tokio::test]
    async fn run_saves_report_and_history_lists_it() {
        let temp = TempDir::new().unwrap();
        let context = context(&temp);
        let args = RunArgs {
            job: write_job(&temp),
            platforms: Vec::new(),
            concurrency: None,
            timeout_secs: Some(5),
            events: false,
            save: true,
        };

        let output = context.run_job(&args).await.unwrap();
        assert_eq!(output.report.total_jobs, 1);
        assert_eq!(
            output.report.results[0].error.as_deref(),
            Some("unsupported platform: tiktok")
        );
        assert!(output.saved_to.is_some());
        assert!(output.display().contains("acme / tiktok: failed"));

        let history = context
            .history(&HistoryArgs {
                competitor: Some("acme".to_string()),
                limit: 5,
            })
            .await
            .unwrap();
        assert_eq!(history.reports.len(), 1);
        assert_eq!(history.reports[0].run_id, output.report.run_id);

        let other = context
            .history(&HistoryArgs {
                competitor: Some("globex".to_string()),
                limit: 5,
            })
            .await
            .unwrap();
        assert_eq!(other.display(), "No reports stored");
    }

    #[tokio::test]
    async fn zero_concurrency_is_rejected() {
        let temp = TempDir::new().unwrap();
        let args = RunArgs {
            job: write_job(&temp),
            platforms: Vec::new(),
            concurrency: Some(0),
            timeout_secs: None,
            events: false,
            save: false,
        };
        assert!(matches!(
            context(&temp).run_job(&args).await,
            Err(AppError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn history_without_database_is_an_error() {
        let temp = TempDir::new().unwrap();
        let result = context(&temp)
            .history(&HistoryArgs {
                competitor: None,
                limit: 10,
            })
            .await;
        assert!(matches!(result, Err(AppError::Store(_))));
    }
}
