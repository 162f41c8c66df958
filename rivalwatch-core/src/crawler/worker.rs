//! Host side of the isolated crawler: spawns `rivalwatch-crawler`, streams the
//! request in and the per-URL records out, and guarantees the child is torn
//! down whatever happens to the batch.

use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::compat::{CompatShim, SpawnPolicy};
use crate::config::CrawlerSection;

use super::error::{CrawlerError, CrawlerResult};
use super::metrics::CrawlMetrics;
use super::protocol::{CrawlPageResult, CrawlRequest, WorkerMessage};

pub const WORKER_BINARY: &str = "rivalwatch-crawler";

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Uses the configured path, or looks for the worker binary next to the
    /// running executable.
    pub fn locate(configured: Option<&str>) -> CrawlerResult<Self> {
        if let Some(path) = configured.filter(|path| !path.trim().is_empty()) {
            return Ok(Self::new(path));
        }
        let exe = std::env::current_exe()?;
        let file_name = format!("{WORKER_BINARY}{}", std::env::consts::EXE_SUFFIX);
        let candidates = exe
            .ancestors()
            .skip(1)
            .take(2)
            .map(|dir| dir.join(&file_name))
            .collect::<Vec<_>>();
        candidates
            .into_iter()
            .find(|candidate| candidate.is_file())
            .map(Self::new)
            .ok_or_else(|| CrawlerError::WorkerNotFound(file_name))
    }

    fn display(&self) -> String {
        self.program.display().to_string()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WorkerLimits {
    pub crawl_timeout: Duration,
    pub launch_timeout: Duration,
}

impl From<&CrawlerSection> for WorkerLimits {
    fn from(section: &CrawlerSection) -> Self {
        Self {
            crawl_timeout: section.crawl_timeout(),
            launch_timeout: section.launch_timeout(),
        }
    }
}

enum WorkerChild {
    Async(tokio::process::Child),
    Blocking(std::process::Child),
}

impl WorkerChild {
    fn id(&self) -> Option<u32> {
        match self {
            WorkerChild::Async(child) => child.id(),
            WorkerChild::Blocking(child) => Some(child.id()),
        }
    }

    fn is_running(&mut self) -> bool {
        let status = match self {
            WorkerChild::Async(child) => child.try_wait(),
            WorkerChild::Blocking(child) => child.try_wait(),
        };
        matches!(status, Ok(None))
    }

    fn start_kill(&mut self) -> io::Result<()> {
        match self {
            WorkerChild::Async(child) => child.start_kill(),
            WorkerChild::Blocking(child) => child.kill(),
        }
    }

    /// Kills the child if it is still alive. A blocking child that has not
    /// exited yet is reaped off the calling thread.
    fn terminate(mut self) -> bool {
        if !self.is_running() {
            return false;
        }
        if let Err(err) = self.start_kill() {
            debug!(error = %err, "crawler worker already gone");
        }
        match self {
            WorkerChild::Async(mut child) => {
                if let Err(err) = child.try_wait() {
                    debug!(error = %err, "failed to reap crawler worker");
                }
            }
            WorkerChild::Blocking(mut child) => match child.try_wait() {
                Ok(Some(_)) => {}
                Ok(None) => reap_in_background(child),
                Err(err) => debug!(error = %err, "failed to reap crawler worker"),
            },
        }
        true
    }
}

fn reap_in_background(mut child: std::process::Child) {
    let reap = move || {
        if let Err(err) = child.wait() {
            debug!(error = %err, "failed to reap crawler worker");
        }
    };
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn_blocking(reap);
        }
        Err(_) => {
            std::thread::spawn(reap);
        }
    }
}

enum StreamEvent {
    Line(String),
    Closed,
    Failed(io::Error),
}

enum BatchEnd {
    Completed,
    AllReported,
    Exited,
    Fatal(String),
    LaunchTimeout,
    Deadline,
}

impl BatchEnd {
    fn missing_entry(&self, url: &str) -> CrawlPageResult {
        match self {
            BatchEnd::Deadline => CrawlPageResult::timeout(url, "crawl deadline exceeded"),
            BatchEnd::LaunchTimeout => CrawlPageResult::timeout(url, "crawler worker launch timed out"),
            BatchEnd::Exited => CrawlPageResult::failed(url, "crawler worker exited before reporting"),
            BatchEnd::Fatal(error) => CrawlPageResult::failed(url, format!("crawler worker failed: {error}")),
            BatchEnd::Completed | BatchEnd::AllReported => {
                CrawlPageResult::failed(url, "missing from crawler worker response")
            }
        }
    }

    fn kills_child(&self) -> bool {
        matches!(self, BatchEnd::Deadline | BatchEnd::LaunchTimeout)
    }
}

/// Runs crawl batches in a dedicated child process, one child per batch.
pub struct IsolatedCrawlerWorker {
    command: WorkerCommand,
    limits: WorkerLimits,
    shim: Arc<CompatShim>,
    child: Mutex<Option<WorkerChild>>,
    metrics: Mutex<CrawlMetrics>,
}

impl IsolatedCrawlerWorker {
    pub fn new(command: WorkerCommand, limits: WorkerLimits, shim: Arc<CompatShim>) -> Self {
        Self {
            command,
            limits,
            shim,
            child: Mutex::new(None),
            metrics: Mutex::new(CrawlMetrics::default()),
        }
    }

    pub fn from_config(section: &CrawlerSection, shim: Arc<CompatShim>) -> CrawlerResult<Self> {
        let command = WorkerCommand::locate(section.worker_path.as_deref())?;
        Ok(Self::new(command, WorkerLimits::from(section), shim))
    }

    pub fn program(&self) -> &Path {
        &self.command.program
    }

    pub fn metrics(&self) -> CrawlMetrics {
        self.metrics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_running(&self) -> bool {
        let mut guard = self.child.lock().unwrap_or_else(PoisonError::into_inner);
        guard.as_mut().map(WorkerChild::is_running).unwrap_or(false)
    }

    /// Crawls the batch in a fresh child. Always returns one entry per input
    /// URL, in input order; only failures to start the child are errors.
    pub async fn crawl(&self, request: &CrawlRequest) -> CrawlerResult<Vec<CrawlPageResult>> {
        if request.urls.is_empty() {
            return Ok(Vec::new());
        }
        self.cleanup();

        let started = Instant::now();
        let deadline = started + self.limits.crawl_timeout;
        let launch_deadline = (started + self.limits.launch_timeout).min(deadline);

        let mut payload = serde_json::to_string(request)?;
        payload.push('\n');

        let (tx, mut rx) = mpsc::unbounded_channel();
        let policy = self.shim.policy();
        let child = match policy {
            SpawnPolicy::Async => self.spawn_async(payload, tx)?,
            SpawnPolicy::Blocking => self.spawn_blocking(payload, tx)?,
        };
        info!(
            pid = ?child.id(),
            policy = %policy,
            urls = request.urls.len(),
            engine = %request.engine,
            "crawler worker spawned"
        );
        *self.child.lock().unwrap_or_else(PoisonError::into_inner) = Some(child);

        let total = request.urls.len();
        let mut slots: Vec<Option<CrawlPageResult>> = vec![None; total];
        let mut reported = 0usize;
        let mut ready = false;

        let end = loop {
            let wait_until = if ready { deadline } else { launch_deadline };
            let event = match timeout_at(wait_until, rx.recv()).await {
                Ok(event) => event,
                Err(_) if ready => break BatchEnd::Deadline,
                Err(_) => break BatchEnd::LaunchTimeout,
            };
            let line = match event {
                Some(StreamEvent::Line(line)) => line,
                Some(StreamEvent::Failed(err)) => {
                    warn!(error = %err, "failed to read crawler worker output");
                    break BatchEnd::Exited;
                }
                Some(StreamEvent::Closed) | None => break BatchEnd::Exited,
            };
            match serde_json::from_str::<WorkerMessage>(&line) {
                Ok(WorkerMessage::Ready { pid }) => {
                    debug!(pid, "crawler worker ready");
                    ready = true;
                }
                Ok(WorkerMessage::Page { index, result }) => {
                    ready = true;
                    match slots.get_mut(index) {
                        Some(slot) if slot.is_none() => {
                            *slot = Some(result);
                            reported += 1;
                        }
                        Some(_) => warn!(index, "duplicate page record ignored"),
                        None => warn!(index, total, "page record index out of range"),
                    }
                    if reported == total {
                        break BatchEnd::AllReported;
                    }
                }
                Ok(WorkerMessage::Done) => break BatchEnd::Completed,
                Ok(WorkerMessage::Fatal { error }) => break BatchEnd::Fatal(error),
                Err(err) => warn!(error = %err, line = %line, "ignoring malformed worker record"),
            }
        };

        if matches!(end, BatchEnd::AllReported) {
            // let the worker close its browser before it is torn down
            let grace = (Instant::now() + SHUTDOWN_GRACE).min(deadline);
            while let Ok(Some(StreamEvent::Line(line))) = timeout_at(grace, rx.recv()).await {
                if matches!(serde_json::from_str::<WorkerMessage>(&line), Ok(WorkerMessage::Done)) {
                    break;
                }
            }
        }

        if end.kills_child() {
            warn!(
                reported,
                total,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "crawler worker exceeded its deadline, terminating"
            );
        }
        let killed = self.terminate_child();

        let results = slots
            .into_iter()
            .zip(&request.urls)
            .map(|(slot, url)| slot.unwrap_or_else(|| end.missing_entry(url)))
            .collect::<Vec<_>>();

        {
            let mut metrics = self.metrics.lock().unwrap_or_else(PoisonError::into_inner);
            metrics.record_batch(&results);
            if killed && end.kills_child() {
                metrics.record_kill();
            }
        }
        Ok(results)
    }

    /// Terminates any running child and releases its handles. Safe to call
    /// any number of times.
    pub fn cleanup(&self) {
        self.terminate_child();
    }

    fn terminate_child(&self) -> bool {
        let child = self
            .child
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match child {
            Some(child) => {
                let pid = child.id();
                let killed = child.terminate();
                if killed {
                    info!(pid = ?pid, "crawler worker terminated");
                }
                killed
            }
            None => false,
        }
    }

    fn spawn_async(
        &self,
        payload: String,
        tx: mpsc::UnboundedSender<StreamEvent>,
    ) -> CrawlerResult<WorkerChild> {
        let mut command = tokio::process::Command::new(&self.command.program);
        command
            .args(&self.command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        let mut child = command
            .spawn()
            .map_err(|err| CrawlerError::spawn(self.command.display(), err))?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| CrawlerError::Protocol("worker stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CrawlerError::Protocol("worker stdout unavailable".into()))?;

        tokio::spawn(async move {
            if let Err(err) = stdin.write_all(payload.as_bytes()).await {
                debug!(error = %err, "failed to write crawl request");
            }
            if let Err(err) = stdin.shutdown().await {
                debug!(error = %err, "failed to close worker stdin");
            }
        });
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                let event = match lines.next_line().await {
                    Ok(Some(line)) => StreamEvent::Line(line),
                    Ok(None) => StreamEvent::Closed,
                    Err(err) => StreamEvent::Failed(err),
                };
                let finished = !matches!(event, StreamEvent::Line(_));
                if tx.send(event).is_err() || finished {
                    break;
                }
            }
        });
        Ok(WorkerChild::Async(child))
    }

    fn spawn_blocking(
        &self,
        payload: String,
        tx: mpsc::UnboundedSender<StreamEvent>,
    ) -> CrawlerResult<WorkerChild> {
        let mut command = std::process::Command::new(&self.command.program);
        command
            .args(&self.command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        let mut child = command
            .spawn()
            .map_err(|err| CrawlerError::spawn(self.command.display(), err))?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| CrawlerError::Protocol("worker stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CrawlerError::Protocol("worker stdout unavailable".into()))?;

        std::thread::spawn(move || {
            if let Err(err) = stdin.write_all(payload.as_bytes()) {
                debug!(error = %err, "failed to write crawl request");
            }
        });
        std::thread::spawn(move || {
            let reader = io::BufReader::new(stdout);
            for line in reader.lines() {
                let event = match line {
                    Ok(line) => StreamEvent::Line(line),
                    Err(err) => {
                        let _ = tx.send(StreamEvent::Failed(err));
                        return;
                    }
                };
                if tx.send(event).is_err() {
                    return;
                }
            }
            let _ = tx.send(StreamEvent::Closed);
        });
        Ok(WorkerChild::Blocking(child))
    }
}

impl Drop for IsolatedCrawlerWorker {
    fn drop(&mut self) {
        let child = self
            .child
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(child) = child {
            if child.terminate() {
                debug!("crawler worker killed on drop");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_worker_path_wins() {
        let command = WorkerCommand::locate(Some("/opt/rivalwatch/bin/rivalwatch-crawler")).unwrap();
        assert_eq!(
            command.program,
            PathBuf::from("/opt/rivalwatch/bin/rivalwatch-crawler")
        );
        assert!(command.args.is_empty());
    }

    #[test]
    fn missing_entries_follow_batch_end() {
        let url = "https://a.example/";
        assert_eq!(
            BatchEnd::Deadline.missing_entry(url).status,
            crate::crawler::CrawlStatus::Timeout
        );
        assert_eq!(
            BatchEnd::LaunchTimeout.missing_entry(url).status,
            crate::crawler::CrawlStatus::Timeout
        );
        assert_eq!(
            BatchEnd::Exited.missing_entry(url).status,
            crate::crawler::CrawlStatus::Failed
        );
        let fatal = BatchEnd::Fatal("bad request".into()).missing_entry(url);
        assert_eq!(fatal.error.as_deref(), Some("crawler worker failed: bad request"));
    }

    #[tokio::test]
    async fn empty_batch_does_not_spawn() {
        let worker = IsolatedCrawlerWorker::new(
            WorkerCommand::new("/nonexistent/rivalwatch-crawler"),
            WorkerLimits {
                crawl_timeout: Duration::from_secs(1),
                launch_timeout: Duration::from_secs(1),
            },
            CompatShim::global(),
        );
        let results = worker.crawl(&CrawlRequest::new(Vec::new())).await.unwrap();
        assert!(results.is_empty());
        assert!(!worker.is_running());
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let worker = IsolatedCrawlerWorker::new(
            WorkerCommand::new("/nonexistent/rivalwatch-crawler"),
            WorkerLimits {
                crawl_timeout: Duration::from_secs(1),
                launch_timeout: Duration::from_secs(1),
            },
            Arc::new(CompatShim::new(crate::compat::HostProfile::new(
                crate::compat::OsFamily::Unix,
            ))),
        );
        let err = worker
            .crawl(&CrawlRequest::new(vec!["https://a.example/".into()]))
            .await
            .unwrap_err();
        assert!(matches!(err, CrawlerError::Spawn { .. }));
    }
}
