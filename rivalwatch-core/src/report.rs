use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{AgentResult, Post};

/// A post tagged with where it came from. Posts are never merged across
/// platforms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaggedPost {
    pub platform: String,
    pub competitor_id: String,
    pub post: Post,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobFailure {
    pub platform: String,
    pub competitor_id: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedReport {
    pub run_id: Uuid,
    pub generated_at: DateTime<Utc>,
    pub total_jobs: usize,
    pub completed: usize,
    pub failed: usize,
    pub results: Vec<AgentResult>,
    pub posts: Vec<TaggedPost>,
    pub failures: Vec<JobFailure>,
}

impl AggregatedReport {
    pub fn result_for(&self, competitor_id: &str, platform: &str) -> Option<&AgentResult> {
        self.results
            .iter()
            .find(|result| result.competitor_id == competitor_id && result.platform == platform)
    }

    pub fn competitors(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self
            .results
            .iter()
            .map(|result| result.competitor_id.as_str())
            .collect();
        ids.dedup();
        ids
    }
}

pub struct ResultAggregator;

impl ResultAggregator {
    /// Builds the report. Results are ordered by `(competitor_id, platform)`.
    /// Posts with the same identity within one competitor and platform are
    /// kept once; posts without an identity are always kept.
    pub fn aggregate(run_id: Uuid, mut results: Vec<AgentResult>) -> AggregatedReport {
        results.sort_by(|a, b| {
            (a.competitor_id.as_str(), a.platform.as_str())
                .cmp(&(b.competitor_id.as_str(), b.platform.as_str()))
        });

        let mut seen: HashSet<(String, String, String)> = HashSet::new();
        let mut posts = Vec::new();
        let mut failures = Vec::new();
        for result in &results {
            if !result.is_completed() {
                failures.push(JobFailure {
                    platform: result.platform.clone(),
                    competitor_id: result.competitor_id.clone(),
                    error: result
                        .error
                        .clone()
                        .unwrap_or_else(|| "unknown error".to_string()),
                });
                continue;
            }
            for post in &result.posts {
                if let Some(identity) = post.identity() {
                    let key = (
                        result.competitor_id.clone(),
                        result.platform.clone(),
                        identity,
                    );
                    if !seen.insert(key) {
                        continue;
                    }
                }
                posts.push(TaggedPost {
                    platform: result.platform.clone(),
                    competitor_id: result.competitor_id.clone(),
                    post: post.clone(),
                });
            }
        }

        let completed = results.iter().filter(|result| result.is_completed()).count();
        AggregatedReport {
            run_id,
            generated_at: Utc::now(),
            total_jobs: results.len(),
            completed,
            failed: results.len() - completed,
            results,
            posts,
            failures,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn post(id: &str) -> Post {
        Post::new().with("id", id)
    }

    #[test]
    fn counts_and_order() {
        let results = vec![
            AgentResult::completed("youtube", "globex", vec![post("g1")], "1 video"),
            AgentResult::timed_out("instagram", "acme"),
            AgentResult::completed("facebook", "acme", vec![post("a1")], "1 post"),
        ];
        let report = ResultAggregator::aggregate(Uuid::new_v4(), results);
        assert_eq!(report.total_jobs, 3);
        assert_eq!(report.completed, 2);
        assert_eq!(report.failed, 1);
        let order: Vec<_> = report
            .results
            .iter()
            .map(|r| (r.competitor_id.as_str(), r.platform.as_str()))
            .collect();
        assert_eq!(
            order,
            vec![("acme", "facebook"), ("acme", "instagram"), ("globex", "youtube")]
        );
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].error, "timeout");
        assert_eq!(report.competitors(), vec!["acme", "globex"]);
    }

    #[test]
    fn duplicates_are_dropped_only_within_platform() {
        let results = vec![
            AgentResult::completed(
                "instagram",
                "acme",
                vec![post("x"), post("x"), Post::new().with("caption", "no id"), Post::new().with("caption", "no id")],
                "",
            ),
            AgentResult::completed("facebook", "acme", vec![post("x")], ""),
            AgentResult::completed("instagram", "globex", vec![post("x")], ""),
        ];
        let report = ResultAggregator::aggregate(Uuid::new_v4(), results);
        let tagged: Vec<_> = report
            .posts
            .iter()
            .map(|p| (p.competitor_id.as_str(), p.platform.as_str()))
            .collect();
        assert_eq!(
            tagged,
            vec![
                ("acme", "facebook"),
                ("acme", "instagram"),
                ("acme", "instagram"),
                ("acme", "instagram"),
                ("globex", "instagram"),
            ]
        );
    }

    #[test]
    fn empty_run_is_a_valid_report() {
        let report = ResultAggregator::aggregate(Uuid::new_v4(), Vec::new());
        assert_eq!(report.total_jobs, 0);
        assert!(report.posts.is_empty());
        assert!(report.result_for("acme", "youtube").is_none());
    }
}
