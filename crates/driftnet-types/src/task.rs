use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::status::{StageStatus, TaskStage, TaskStatus};

/// Maximum automatic retries for a failed scan task.
pub const MAX_TASK_RETRIES: i32 = 5;

/// Result of one pipeline stage (sitemap discovery or page parsing).
///
/// The success/failed counters are driven by atomic increments in the store;
/// terminal writes only touch status, error and finished_at.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StageResult {
    pub status: StageStatus,
    #[serde(default)]
    pub total: i64,
    #[serde(default)]
    pub success: i64,
    #[serde(default)]
    pub failed: i64,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl StageResult {
    /// Stage just started.
    pub fn processing(now: DateTime<Utc>) -> Self {
        Self {
            status: StageStatus::Processing,
            started_at: Some(now),
            ..Default::default()
        }
    }

    /// Stage started with a known amount of work.
    pub fn processing_with_total(now: DateTime<Utc>, total: i64) -> Self {
        Self {
            total,
            ..Self::processing(now)
        }
    }

    pub fn is_settled(&self) -> bool {
        matches!(self.status, StageStatus::Completed | StageStatus::Failed)
    }

    /// All accounted work is done (only meaningful with a non-zero total).
    pub fn is_exhausted(&self) -> bool {
        self.total > 0 && self.success + self.failed >= self.total
    }
}

/// One complete attempt to refresh a site: sitemap stage, then page stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanTask {
    pub id: Uuid,
    pub site_id: Uuid,
    pub domain: String,
    pub status: TaskStatus,
    pub stage: TaskStage,
    pub sitemap_result: StageResult,
    pub page_result: StageResult,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub version: i64,
}

impl ScanTask {
    /// Fresh task starting at the sitemap stage.
    pub fn new(site_id: Uuid, domain: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            site_id,
            domain: domain.into(),
            status: TaskStatus::Processing,
            stage: TaskStage::Sitemap,
            sitemap_result: StageResult::processing(now),
            page_result: StageResult::default(),
            created_at: now,
            finished_at: None,
            retry_count: 0,
            next_retry_at: None,
            version: 0,
        }
    }

    /// Task that reuses an earlier sitemap and starts directly at the page
    /// stage with a known backlog.
    pub fn new_for_page_stage(
        site_id: Uuid,
        domain: impl Into<String>,
        pending_urls: i64,
    ) -> Self {
        let now = Utc::now();
        let mut task = Self::new(site_id, domain);
        task.stage = TaskStage::Page;
        task.sitemap_result = StageResult {
            status: StageStatus::Completed,
            started_at: Some(now),
            finished_at: Some(now),
            ..Default::default()
        };
        task.page_result = StageResult::processing_with_total(now, pending_urls);
        task
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    /// The stage result currently in flight, if any.
    pub fn current_stage_result(&self) -> Option<&StageResult> {
        match self.stage {
            TaskStage::Sitemap => Some(&self.sitemap_result),
            TaskStage::Page => Some(&self.page_result),
            TaskStage::Done => None,
        }
    }
}

/// Retry delay for a failed task: exponential from 30 s, capped at 60 min.
pub fn retry_backoff(retry_count: i32) -> Duration {
    const BASE_SECS: i64 = 30;
    const CAP_SECS: i64 = 60 * 60;

    let exp = retry_count.clamp(0, 30) as u32;
    let delay = BASE_SECS.saturating_mul(1i64 << exp);
    Duration::seconds(delay.min(CAP_SECS))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_task_starts_processing_sitemap() {
        let task = ScanTask::new(Uuid::new_v4(), "x.example");
        assert_eq!(task.status, TaskStatus::Processing);
        assert_eq!(task.stage, TaskStage::Sitemap);
        assert_eq!(task.sitemap_result.status, StageStatus::Processing);
        assert!(task.sitemap_result.started_at.is_some());
        assert_eq!(task.page_result.status, StageStatus::Pending);
        assert_eq!(task.version, 0);
    }

    #[test]
    fn test_page_stage_task_skips_sitemap() {
        let task = ScanTask::new_for_page_stage(Uuid::new_v4(), "x.example", 120);
        assert_eq!(task.stage, TaskStage::Page);
        assert_eq!(task.sitemap_result.status, StageStatus::Completed);
        assert_eq!(task.page_result.status, StageStatus::Processing);
        assert_eq!(task.page_result.total, 120);
    }

    #[test]
    fn test_stage_result_exhaustion() {
        let mut result = StageResult::processing_with_total(Utc::now(), 3);
        assert!(!result.is_exhausted());
        result.success = 2;
        result.failed = 1;
        assert!(result.is_exhausted());

        // Zero total never reads as exhausted.
        let empty = StageResult::processing(Utc::now());
        assert!(!empty.is_exhausted());
    }

    #[test]
    fn test_retry_backoff_doubles_and_caps() {
        assert_eq!(retry_backoff(0), Duration::seconds(30));
        assert_eq!(retry_backoff(1), Duration::seconds(60));
        assert_eq!(retry_backoff(2), Duration::seconds(120));
        assert_eq!(retry_backoff(3), Duration::seconds(240));
        // Past the cap everything is one hour.
        assert_eq!(retry_backoff(7), Duration::minutes(60));
        assert_eq!(retry_backoff(30), Duration::minutes(60));
    }

    #[test]
    fn test_current_stage_result() {
        let mut task = ScanTask::new(Uuid::new_v4(), "x.example");
        assert_eq!(
            task.current_stage_result().map(|r| r.status),
            Some(StageStatus::Processing)
        );
        task.stage = TaskStage::Done;
        assert!(task.current_stage_result().is_none());
    }
}
