//! Isolated crawler process. Reads one JSON crawl request from stdin and
//! writes newline-delimited protocol records to stdout. Logs go to stderr.

use std::io::{self, BufRead, Write};
use std::process::ExitCode;
use std::sync::Arc;

use rivalwatch_core::config::ENV_EXTRACTOR_URL;
use rivalwatch_core::crawler::{
    BrowserFetcher, CrawlEngine, CrawlRequest, CrawlRunner, HttpExtractor, HttpFetcher,
    PageFetcher, WorkerMessage,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "RIVALWATCH_LOG";

fn main() -> ExitCode {
    init_tracing();
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            let _ = emit(&WorkerMessage::Fatal {
                error: format!("failed to start runtime: {err}"),
            });
            return ExitCode::from(2);
        }
    };
    runtime.block_on(run())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_ansi(false)
        .try_init();
}

async fn run() -> ExitCode {
    if emit(&WorkerMessage::Ready {
        pid: std::process::id(),
    })
    .is_err()
    {
        return ExitCode::FAILURE;
    }

    let request = match read_request() {
        Ok(request) => request,
        Err(message) => {
            error!(error = %message, "rejecting crawl request");
            let _ = emit(&WorkerMessage::Fatal { error: message });
            return ExitCode::from(2);
        }
    };

    let fetcher: Arc<dyn PageFetcher> = match request.engine {
        CrawlEngine::Http => match HttpFetcher::new(&request.options) {
            Ok(fetcher) => Arc::new(fetcher),
            Err(err) => {
                let _ = emit(&WorkerMessage::Fatal {
                    error: err.to_string(),
                });
                return ExitCode::from(2);
            }
        },
        CrawlEngine::Browser => Arc::new(BrowserFetcher::new(&request.options)),
    };

    let mut runner = CrawlRunner::new(fetcher);
    let extractor_url = request
        .options
        .extractor_url
        .clone()
        .or_else(|| std::env::var(ENV_EXTRACTOR_URL).ok())
        .filter(|url| !url.trim().is_empty());
    if let Some(url) = extractor_url {
        runner = runner.with_extractor(Arc::new(HttpExtractor::new(url)));
    }

    let mut write_failed = false;
    runner
        .crawl_each(&request, |index, result| {
            if !write_failed && emit(&WorkerMessage::Page { index, result }).is_err() {
                write_failed = true;
            }
        })
        .await;
    runner.shutdown().await;

    if write_failed || emit(&WorkerMessage::Done).is_err() {
        return ExitCode::FAILURE;
    }
    info!(urls = request.urls.len(), "crawl batch finished");
    ExitCode::SUCCESS
}

fn read_request() -> Result<CrawlRequest, String> {
    let mut line = String::new();
    io::stdin()
        .lock()
        .read_line(&mut line)
        .map_err(|err| format!("failed to read crawl request: {err}"))?;
    let line = line.trim();
    if line.is_empty() {
        return Err("empty crawl request".to_string());
    }
    serde_json::from_str(line).map_err(|err| format!("invalid crawl request: {err}"))
}

fn emit(message: &WorkerMessage) -> io::Result<()> {
    let line = message
        .to_line()
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    let mut stdout = io::stdout().lock();
    stdout.write_all(line.as_bytes())?;
    stdout.flush()
}
