//! Recovery loops: the only rescue path for work lost to crashed workers.
//!
//! Stale tasks are failed (and thereby become retryable), failed tasks are
//! retried with exponential backoff, and expired URL leases go back to
//! Pending.

use tracing::{debug, info, instrument, warn};

use std::sync::Arc;

use driftnet_persistence::{ScanTaskRepository, SitemapUrlRepository, SiteRepository};
use driftnet_types::TaskStage;

use crate::config::CrawlTunables;
use crate::metrics::OrchestratorMetrics;
use crate::processors::PipelineError;
use crate::publisher::Publisher;

/// Failure note for a task that never left Pending.
const STUCK_PENDING: &str = "task stuck in pending state";
/// Failure note for a task whose worker vanished mid-flight.
const STUCK_PROCESSING: &str = "task stuck in processing state (possible worker crash or DLQ)";

#[derive(Clone)]
pub struct Recovery {
    sites: SiteRepository,
    tasks: ScanTaskRepository,
    urls: SitemapUrlRepository,
    publisher: Publisher,
    tunables: CrawlTunables,
    metrics: Arc<OrchestratorMetrics>,
}

impl Recovery {
    pub fn new(
        sites: SiteRepository,
        tasks: ScanTaskRepository,
        urls: SitemapUrlRepository,
        publisher: Publisher,
        tunables: CrawlTunables,
        metrics: Arc<OrchestratorMetrics>,
    ) -> Self {
        Self {
            sites,
            tasks,
            urls,
            publisher,
            tunables,
            metrics,
        }
    }

    /// Fail tasks abandoned beyond the pending/processing thresholds. The
    /// failure message distinguishes the two, and the stage substatus is
    /// promoted to Failed alongside.
    #[instrument(skip(self))]
    pub async fn recover_stale_tasks(&self) -> Result<usize, PipelineError> {
        let stale = self
            .tasks
            .find_stale(
                self.tunables.stale_task_pending,
                self.tunables.stale_task_processing,
            )
            .await?;
        let mut failed = 0;

        for task in stale {
            let message = if task.status == driftnet_types::TaskStatus::Pending {
                STUCK_PENDING
            } else {
                STUCK_PROCESSING
            };

            match self.tasks.mark_failed(task.id, message).await {
                Ok(()) => {
                    warn!(task_id = %task.id, site_id = %task.site_id, message, "stale task failed");
                    failed += 1;
                }
                Err(err) if err.is_concurrent_update() => {
                    debug!(task_id = %task.id, "stale task settled concurrently, skipping");
                }
                Err(err) => return Err(err.into()),
            }
        }

        self.metrics.record_stale_tasks_failed(failed as u64);
        Ok(failed)
    }

    /// Give failed tasks with remaining budget another attempt: reset the
    /// task, then republish the message for the stage that failed. Tasks
    /// whose site left the rotation are cancelled instead of retried.
    #[instrument(skip(self))]
    pub async fn retry_failed_tasks(&self) -> Result<usize, PipelineError> {
        let candidates = self
            .tasks
            .find_failed_for_retry(self.tunables.max_task_retries)
            .await?;
        let mut retried = 0;

        for candidate in candidates {
            let Some(site) = self.sites.find_by_id(candidate.site_id).await? else {
                debug!(task_id = %candidate.id, "site gone, leaving task failed");
                continue;
            };

            if !site.is_scannable() {
                match self.tasks.mark_cancelled(candidate.id).await {
                    Ok(()) => {
                        debug!(
                            task_id = %candidate.id,
                            site_status = %site.status,
                            "site left rotation, task cancelled instead of retried"
                        );
                    }
                    Err(err) if err.is_concurrent_update() => {}
                    Err(err) => return Err(err.into()),
                }
                continue;
            }

            let task = match self.tasks.increment_retry_and_reset(candidate.id).await {
                Ok(task) => task,
                Err(err) if err.is_concurrent_update() => {
                    debug!(task_id = %candidate.id, "retry raced, skipping");
                    continue;
                }
                Err(err) => return Err(err.into()),
            };

            match task.stage {
                TaskStage::Sitemap => {
                    self.publisher.sitemap_crawl_task(task.id, &site, true).await?;
                }
                TaskStage::Page => {
                    self.publisher
                        .page_crawl_task(task.id, &site, self.tunables.page_batch_size)
                        .await?;
                }
                TaskStage::Done => {
                    // A done-stage task should never read as failed.
                    warn!(task_id = %task.id, "failed task at done stage, not republishing");
                    continue;
                }
            }

            info!(
                task_id = %task.id,
                retry = task.retry_count,
                stage = %task.stage,
                "failed task retried"
            );
            retried += 1;
        }

        self.metrics.record_tasks_retried(retried as u64);
        Ok(retried)
    }

    /// Reclaim URL leases whose deadline passed.
    pub async fn recover_stale_urls(&self) -> Result<usize, PipelineError> {
        let recovered = self.urls.recover_stale().await?;
        if recovered > 0 {
            info!(recovered, "stale url leases reclaimed");
        }
        self.metrics.record_url_leases_recovered(recovered);
        Ok(recovered as usize)
    }

    /// Daily sweep: ask the violation matcher to rebuild its derived indexes
    /// for the whole fleet.
    pub async fn refresh_derived_indexes(&self) -> Result<usize, PipelineError> {
        self.publisher.violations_refresh(None).await?;
        Ok(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stuck_messages_are_distinct() {
        assert_ne!(STUCK_PENDING, STUCK_PROCESSING);
        assert!(STUCK_PROCESSING.contains("worker crash or DLQ"));
        assert!(STUCK_PENDING.contains("pending"));
    }
}
