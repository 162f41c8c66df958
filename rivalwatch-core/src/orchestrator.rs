//! Fan-out of (competitor, platform) jobs to platform agents.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::json;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::AbortHandle;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::agents::AgentRegistry;
use crate::cache::TtlCache;
use crate::compat::CompatShim;
use crate::events::{
    EventBroadcaster, JOB_COMPLETED, JOB_FAILED, JOB_STARTED, MONITORING_COMPLETED,
    MONITORING_STARTED,
};
use crate::model::{AgentJob, AgentResult, CompetitorTarget};
use crate::report::{AggregatedReport, ResultAggregator};

struct ResultCache {
    entries: Arc<TtlCache<AgentResult>>,
    ttl: Duration,
}

struct OrchestratorInner {
    registry: AgentRegistry,
    shim: Arc<CompatShim>,
    events: EventBroadcaster,
    cache: Option<ResultCache>,
}

/// Aborts still-running jobs when a monitoring run is dropped midway.
struct AbortOnDrop(Vec<AbortHandle>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        for handle in &self.0 {
            handle.abort();
        }
    }
}

#[derive(Clone)]
pub struct AgentOrchestrator {
    inner: Arc<OrchestratorInner>,
}

impl AgentOrchestrator {
    pub fn new(registry: AgentRegistry, shim: Arc<CompatShim>, events: EventBroadcaster) -> Self {
        Self {
            inner: Arc::new(OrchestratorInner {
                registry,
                shim,
                events,
                cache: None,
            }),
        }
    }

    /// Serves completed results from `cache` and stores new ones for `ttl`.
    pub fn with_cache(self, cache: Arc<TtlCache<AgentResult>>, ttl: Duration) -> Self {
        let inner = OrchestratorInner {
            registry: self.inner.registry.clone(),
            shim: Arc::clone(&self.inner.shim),
            events: self.inner.events.clone(),
            cache: Some(ResultCache {
                entries: cache,
                ttl,
            }),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn events(&self) -> &EventBroadcaster {
        &self.inner.events
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.inner.registry
    }

    /// Runs every (competitor, platform) pair once and returns the
    /// aggregated report. Never fails as a whole: each job contributes
    /// exactly one result, successful or not.
    pub async fn run_monitoring_job(
        &self,
        targets: &[CompetitorTarget],
        platforms: &[String],
        concurrency_limit: usize,
        per_job_timeout: Duration,
    ) -> AggregatedReport {
        let run_id = Uuid::new_v4();
        let mut seen = HashSet::new();
        let pairs = targets
            .iter()
            .flat_map(|target| platforms.iter().map(move |platform| (target, platform)))
            .filter(|(target, platform)| {
                seen.insert((target.competitor_id.clone(), platform.to_string()))
            })
            .map(|(target, platform)| (target.clone(), platform.clone()))
            .collect::<Vec<_>>();

        let permits = concurrency_limit.max(1);
        info!(
            run_id = %run_id,
            jobs = pairs.len(),
            concurrency = permits,
            timeout_ms = per_job_timeout.as_millis() as u64,
            "monitoring run started"
        );
        self.inner.events.publish(
            MONITORING_STARTED,
            json!({
                "run_id": run_id,
                "jobs": pairs.len(),
                "competitors": targets.iter().map(|t| t.competitor_id.as_str()).collect::<Vec<_>>(),
                "platforms": platforms,
            }),
        );

        let semaphore = Arc::new(Semaphore::new(permits));
        let mut guard = AbortOnDrop(Vec::with_capacity(pairs.len()));
        let mut pending = FuturesUnordered::new();
        for (target, platform) in pairs {
            let inner = Arc::clone(&self.inner);
            let semaphore = Arc::clone(&semaphore);
            let (competitor_id, job_platform) = (target.competitor_id.clone(), platform.clone());
            let handle = tokio::spawn(async move {
                let permit = semaphore.acquire_owned().await;
                inner
                    .run_job(run_id, permit.ok(), target, platform, per_job_timeout)
                    .await
            });
            guard.0.push(handle.abort_handle());
            pending.push(async move {
                match handle.await {
                    Ok(result) => result,
                    Err(err) => {
                        warn!(competitor_id = %competitor_id, platform = %job_platform, error = %err, "job task aborted");
                        AgentResult::failed(job_platform, competitor_id, format!("job aborted: {err}"))
                    }
                }
            });
        }

        let mut results = Vec::with_capacity(pending.len());
        while let Some(result) = pending.next().await {
            results.push(result);
        }
        drop(guard);

        let report = ResultAggregator::aggregate(run_id, results);
        info!(
            run_id = %run_id,
            total = report.total_jobs,
            completed = report.completed,
            failed = report.failed,
            "monitoring run completed"
        );
        self.inner.events.publish(
            MONITORING_COMPLETED,
            json!({
                "run_id": run_id,
                "total_jobs": report.total_jobs,
                "completed": report.completed,
                "failed": report.failed,
            }),
        );
        report
    }
}

impl OrchestratorInner {
    async fn run_job(
        &self,
        run_id: Uuid,
        permit: Option<OwnedSemaphorePermit>,
        target: CompetitorTarget,
        platform: String,
        per_job_timeout: Duration,
    ) -> AgentResult {
        let job = AgentJob::new(target, platform, Instant::now() + per_job_timeout);
        let competitor_id = job.competitor.competitor_id.clone();
        self.events.publish(
            JOB_STARTED,
            json!({
                "run_id": run_id,
                "job_id": job.job_id,
                "competitor_id": competitor_id,
                "platform": job.platform,
            }),
        );

        let mut result = if permit.is_some() {
            self.execute(&job).await
        } else {
            AgentResult::failed(&job.platform, &competitor_id, "job scheduler closed")
        };
        drop(permit);

        result.platform = job.platform.clone();
        result.competitor_id = competitor_id.clone();

        if result.is_completed() {
            if let Some(cache) = &self.cache {
                cache
                    .entries
                    .set(job.cache_key(), result.clone(), cache.ttl);
            }
        }

        let event = if result.is_completed() {
            JOB_COMPLETED
        } else {
            JOB_FAILED
        };
        self.events.publish(
            event,
            json!({
                "run_id": run_id,
                "job_id": job.job_id,
                "competitor_id": competitor_id,
                "platform": job.platform,
                "status": result.status,
                "posts": result.posts.len(),
                "error": result.error,
            }),
        );
        result
    }

    async fn execute(&self, job: &AgentJob) -> AgentResult {
        let competitor = &job.competitor;
        let platform = job.platform.as_str();

        if let Some(cache) = &self.cache {
            if let Some(hit) = cache.entries.get(&job.cache_key()) {
                debug!(competitor_id = %competitor.competitor_id, platform, "serving cached result");
                return hit;
            }
        }

        let Some(agent) = self.registry.resolve(platform, competitor) else {
            warn!(platform, "no agent registered for platform");
            return AgentResult::failed(
                platform,
                &competitor.competitor_id,
                format!("unsupported platform: {platform}"),
            );
        };

        let agent_ref = &agent;
        let deadline = job.deadline;
        let fallback_platform = platform.to_string();
        let fallback_competitor = competitor.competitor_id.clone();
        let outcome = timeout_at(
            deadline,
            self.shim.guarded_call(
                move || {
                    agent_ref.analyze_competitor(
                        &competitor.competitor_id,
                        &competitor.display_name,
                        deadline,
                    )
                },
                move |signal| async move {
                    AgentResult::failed(
                        fallback_platform,
                        fallback_competitor,
                        format!("subprocess unsupported on this host: {signal}"),
                    )
                },
            ),
        )
        .await;
        agent.close().await;

        match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(signal)) => {
                AgentResult::failed(platform, &competitor.competitor_id, signal.to_string())
            }
            Err(_) => {
                warn!(
                    competitor_id = %competitor.competitor_id,
                    platform,
                    "job exceeded its deadline"
                );
                AgentResult::timed_out(platform, &competitor.competitor_id)
            }
        }
    }
}
