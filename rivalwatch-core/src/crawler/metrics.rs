use serde::{Deserialize, Serialize};

use super::protocol::{CrawlPageResult, CrawlStatus};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrawlMetrics {
    pub batches: u64,
    pub pages_ok: u64,
    pub pages_failed: u64,
    pub pages_timed_out: u64,
    pub worker_kills: u64,
}

impl CrawlMetrics {
    pub fn record_batch(&mut self, pages: &[CrawlPageResult]) {
        self.batches = self.batches.saturating_add(1);
        for page in pages {
            self.record_page(page.status);
        }
    }

    pub fn record_page(&mut self, status: CrawlStatus) {
        match status {
            CrawlStatus::Success => self.pages_ok = self.pages_ok.saturating_add(1),
            CrawlStatus::Failed => self.pages_failed = self.pages_failed.saturating_add(1),
            CrawlStatus::Timeout => self.pages_timed_out = self.pages_timed_out.saturating_add(1),
        }
    }

    pub fn record_kill(&mut self) {
        self.worker_kills = self.worker_kills.saturating_add(1);
    }

    pub fn success_rate(&self) -> f64 {
        let total = self.pages_ok + self.pages_failed + self.pages_timed_out;
        if total == 0 {
            0.0
        } else {
            (self.pages_ok as f64 / total as f64) * 100.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_counts_each_status() {
        let mut metrics = CrawlMetrics::default();
        metrics.record_batch(&[
            CrawlPageResult::success("a", None, "text".into(), None),
            CrawlPageResult::failed("b", "http status 404"),
            CrawlPageResult::timeout("c", "timeout"),
            CrawlPageResult::success("d", None, "text".into(), None),
        ]);
        metrics.record_kill();
        assert_eq!(metrics.batches, 1);
        assert_eq!(metrics.pages_ok, 2);
        assert_eq!(metrics.pages_failed, 1);
        assert_eq!(metrics.pages_timed_out, 1);
        assert_eq!(metrics.worker_kills, 1);
        assert!((metrics.success_rate() - 50.0).abs() < f64::EPSILON);
    }
}
