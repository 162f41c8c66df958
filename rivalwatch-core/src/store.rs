//! Persistent history of aggregated monitoring reports.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::report::AggregatedReport;
use crate::sqlite::configure_connection;

const REPORT_SCHEMA: &str = include_str!("../../sql/reports.sql");

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to open report database {path}: {source}")]
    OpenDatabase {
        path: PathBuf,
        source: rusqlite::Error,
    },
    #[error("report database error: {0}")]
    Execute(#[from] rusqlite::Error),
    #[error("failed to (de)serialize report: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("report store task failed: {0}")]
    Join(String),
    #[error("report store path not configured")]
    MissingStore,
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(err: tokio::task::JoinError) -> Self {
        StoreError::Join(err.to_string())
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Selects stored reports, newest first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReportFilter {
    /// Only reports containing a result for this competitor.
    pub competitor_id: Option<String>,
    pub limit: Option<usize>,
}

impl ReportFilter {
    pub fn competitor(mut self, competitor_id: impl Into<String>) -> Self {
        self.competitor_id = Some(competitor_id.into());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn matches(&self, report: &AggregatedReport) -> bool {
        match &self.competitor_id {
            Some(id) => report.results.iter().any(|result| &result.competitor_id == id),
            None => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredReport {
    pub run_id: Uuid,
    pub generated_at: DateTime<Utc>,
    pub total_jobs: usize,
    pub completed: usize,
    pub failed: usize,
    pub report: AggregatedReport,
}

impl From<AggregatedReport> for StoredReport {
    fn from(report: AggregatedReport) -> Self {
        Self {
            run_id: report.run_id,
            generated_at: report.generated_at,
            total_jobs: report.total_jobs,
            completed: report.completed,
            failed: report.failed,
            report,
        }
    }
}

#[async_trait]
pub trait ReportStore: Send + Sync {
    /// Saves a report. Saving the same run twice replaces the earlier copy.
    async fn save(&self, report: &AggregatedReport) -> StoreResult<()>;
    async fn load(&self, filter: &ReportFilter) -> StoreResult<Vec<StoredReport>>;
}

#[derive(Debug, Default)]
pub struct MemoryReportStore {
    reports: Mutex<Vec<AggregatedReport>>,
}

impl MemoryReportStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ReportStore for MemoryReportStore {
    async fn save(&self, report: &AggregatedReport) -> StoreResult<()> {
        let mut reports = self.reports.lock().unwrap_or_else(PoisonError::into_inner);
        reports.retain(|existing| existing.run_id != report.run_id);
        reports.push(report.clone());
        Ok(())
    }

    async fn load(&self, filter: &ReportFilter) -> StoreResult<Vec<StoredReport>> {
        let reports = self.reports.lock().unwrap_or_else(PoisonError::into_inner);
        let mut matching: Vec<AggregatedReport> = reports
            .iter()
            .filter(|report| filter.matches(report))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.generated_at.cmp(&a.generated_at));
        if let Some(limit) = filter.limit {
            matching.truncate(limit);
        }
        Ok(matching.into_iter().map(StoredReport::from).collect())
    }
}

#[derive(Debug, Clone)]
pub struct SqliteReportStoreBuilder {
    path: Option<PathBuf>,
    read_only: bool,
    create_if_missing: bool,
}

impl Default for SqliteReportStoreBuilder {
    fn default() -> Self {
        Self {
            path: None,
            read_only: false,
            create_if_missing: true,
        }
    }
}

impl SqliteReportStoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    pub fn build(self) -> StoreResult<SqliteReportStore> {
        let path = self.path.ok_or(StoreError::MissingStore)?;
        let mut flags = if self.read_only {
            OpenFlags::SQLITE_OPEN_READ_ONLY
        } else {
            OpenFlags::SQLITE_OPEN_READ_WRITE
        };

        if !self.read_only && self.create_if_missing {
            flags |= OpenFlags::SQLITE_OPEN_CREATE;
        }

        Ok(SqliteReportStore { path, flags })
    }
}

/// SQLite-backed [`ReportStore`]. Every call opens its own connection on a
/// blocking thread.
#[derive(Debug, Clone)]
pub struct SqliteReportStore {
    path: PathBuf,
    flags: OpenFlags,
}

impl SqliteReportStore {
    pub fn builder() -> SqliteReportStoreBuilder {
        SqliteReportStoreBuilder::new()
    }

    pub fn new(path: impl AsRef<Path>) -> StoreResult<Self> {
        SqliteReportStoreBuilder::new().path(path).build()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> StoreResult<Connection> {
        let conn = Connection::open_with_flags(&self.path, self.flags).map_err(|source| {
            StoreError::OpenDatabase {
                path: self.path.clone(),
                source,
            }
        })?;
        configure_connection(&conn).map_err(|source| StoreError::OpenDatabase {
            path: self.path.clone(),
            source,
        })?;
        Ok(conn)
    }

    pub fn initialize(&self) -> StoreResult<()> {
        let conn = self.open()?;
        conn.execute_batch(REPORT_SCHEMA)?;
        Ok(())
    }

    pub fn save_blocking(&self, report: &AggregatedReport) -> StoreResult<()> {
        let report_json = serde_json::to_string(report)?;
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        let run_id = report.run_id.to_string();
        tx.execute("DELETE FROM run_results WHERE run_id = ?1", params![run_id])?;
        tx.execute(
            "INSERT OR REPLACE INTO monitoring_runs \
             (run_id, generated_at, total_jobs, completed, failed, report_json) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                run_id,
                report.generated_at,
                report.total_jobs as i64,
                report.completed as i64,
                report.failed as i64,
                report_json,
            ],
        )?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO run_results \
                 (run_id, competitor_id, platform, status, posts, error) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for result in &report.results {
                stmt.execute(params![
                    run_id,
                    result.competitor_id,
                    result.platform,
                    result.status.as_str(),
                    result.posts.len() as i64,
                    result.error,
                ])?;
            }
        }
        tx.commit()?;
        debug!(run_id = %report.run_id, results = report.results.len(), "report saved");
        Ok(())
    }

    pub fn load_blocking(&self, filter: &ReportFilter) -> StoreResult<Vec<StoredReport>> {
        let conn = self.open()?;
        let limit = filter.limit.map(|limit| limit as i64).unwrap_or(-1);
        let mut stmt = conn.prepare(
            "SELECT report_json FROM monitoring_runs \
             WHERE ?1 IS NULL \
                OR run_id IN (SELECT run_id FROM run_results WHERE competitor_id = ?1) \
             ORDER BY generated_at DESC \
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![filter.competitor_id, limit], |row| {
            row.get::<_, String>(0)
        })?;

        let mut reports = Vec::new();
        for row in rows {
            let report: AggregatedReport = serde_json::from_str(&row?)?;
            reports.push(StoredReport::from(report));
        }
        Ok(reports)
    }
}

#[async_trait]
impl ReportStore for SqliteReportStore {
    async fn save(&self, report: &AggregatedReport) -> StoreResult<()> {
        let store = self.clone();
        let report = report.clone();
        tokio::task::spawn_blocking(move || store.save_blocking(&report)).await?
    }

    async fn load(&self, filter: &ReportFilter) -> StoreResult<Vec<StoredReport>> {
        let store = self.clone();
        let filter = filter.clone();
        tokio::task::spawn_blocking(move || store.load_blocking(&filter)).await?
    }
}
