//! Task-progress service: the single writer for scan-task state derived from
//! the URL work queue.
//!
//! The authoritative sitemap total comes from the URL repository, not from
//! the crawler's self-reported count, because URL batches are consumed
//! asynchronously and may still be landing when the sitemap crawl reports
//! done. The count is polled until it reads stable.

use std::future::Future;
use std::time::Duration as StdDuration;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use driftnet_persistence::{PageProgress, ScanTaskRepository, SitemapUrlRepository};
use driftnet_types::Site;

use crate::processors::PipelineError;
use crate::publisher::Publisher;

/// Poll cadence for the sitemap-total stability read.
const STABILITY_POLL_INTERVAL: StdDuration = StdDuration::from_millis(300);
/// Poll attempts before settling for the last observation.
const STABILITY_POLL_ATTEMPTS: usize = 10;

#[derive(Clone)]
pub struct TaskProgress {
    tasks: ScanTaskRepository,
    urls: SitemapUrlRepository,
    publisher: Publisher,
    page_batch_size: u32,
}

impl TaskProgress {
    pub fn new(
        tasks: ScanTaskRepository,
        urls: SitemapUrlRepository,
        publisher: Publisher,
        page_batch_size: u32,
    ) -> Self {
        Self {
            tasks,
            urls,
            publisher,
            page_batch_size,
        }
    }

    /// Authoritative URL count for a site: the first total observed twice in
    /// consecutive reads, or the last observation once the attempts run out.
    pub async fn sitemap_url_count(&self, site_id: Uuid) -> Result<i64, PipelineError> {
        let urls = self.urls.clone();
        poll_until_stable(
            || {
                let urls = urls.clone();
                async move { Ok(urls.get_stats(site_id).await?.total) }
            },
            STABILITY_POLL_ATTEMPTS,
            STABILITY_POLL_INTERVAL,
        )
        .await
    }

    /// Sitemap stage finished for `task_id`. Advances into the page stage and
    /// kicks the page workers when a backlog exists, otherwise finalizes the
    /// task at the sitemap stage.
    #[instrument(skip(self, site), fields(task_id = %task_id, site_id = %site.id))]
    pub async fn complete_sitemap_stage(
        &self,
        task_id: Uuid,
        site: &Site,
    ) -> Result<(), PipelineError> {
        let total = self.sitemap_url_count(site.id).await?;
        let stats = self.urls.get_stats(site.id).await?;

        if stats.pending > 0 {
            match self.tasks.complete_sitemap_stage(task_id, total).await {
                Ok(()) => {}
                Err(err) if err.is_concurrent_update() => {
                    debug!(task_id = %task_id, "sitemap completion raced, skipping");
                    return Ok(());
                }
                Err(err) => return Err(err.into()),
            }
            self.publisher
                .page_crawl_task(task_id, site, self.page_batch_size)
                .await?;
            info!(
                task_id = %task_id,
                total,
                pending = stats.pending,
                "sitemap stage complete, page stage started"
            );
        } else {
            match self.tasks.complete_sitemap_stage_only(task_id, total).await {
                Ok(()) => {}
                Err(err) if err.is_concurrent_update() => {
                    debug!(task_id = %task_id, "sitemap completion raced, skipping");
                    return Ok(());
                }
                Err(err) => return Err(err.into()),
            }
            info!(task_id = %task_id, total, "task complete at sitemap stage, no page backlog");
        }
        Ok(())
    }

    pub async fn fail_sitemap_stage(
        &self,
        task_id: Uuid,
        error: &str,
    ) -> Result<(), PipelineError> {
        match self.tasks.fail_sitemap_stage(task_id, error).await {
            Ok(()) => Ok(()),
            Err(err) if err.is_concurrent_update() => {
                debug!(task_id = %task_id, "sitemap failure raced, skipping");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Record one per-URL outcome and finalize the page stage once every
    /// accounted URL has reported, or once the queue has drained (skipped
    /// URLs never report, so the counters alone can undershoot the total).
    #[instrument(skip(self), fields(task_id = %task_id, site_id = %site_id, success))]
    pub async fn record_page_result(
        &self,
        task_id: Uuid,
        site_id: Uuid,
        success: bool,
    ) -> Result<(), PipelineError> {
        let progress = match self.tasks.increment_page_progress(task_id, success).await {
            Ok(progress) => progress,
            Err(err) if err.is_concurrent_update() => {
                // Task cancelled or already terminal; progress is frozen.
                debug!(task_id = %task_id, "progress increment on inactive task, skipping");
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        if self.page_stage_finished(site_id, progress).await? {
            match self.tasks.complete_page_stage(task_id).await {
                Ok(()) => {
                    info!(
                        task_id = %task_id,
                        success = progress.success,
                        failed = progress.failed,
                        total = progress.total,
                        "page stage complete"
                    );
                }
                Err(err) if err.is_concurrent_update() => {
                    debug!(task_id = %task_id, "page completion raced, skipping");
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    pub async fn fail_page_stage(&self, task_id: Uuid, error: &str) -> Result<(), PipelineError> {
        match self.tasks.fail_page_stage(task_id, error).await {
            Ok(()) => Ok(()),
            Err(err) if err.is_concurrent_update() => {
                debug!(task_id = %task_id, "page failure raced, skipping");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn page_stage_finished(
        &self,
        site_id: Uuid,
        progress: PageProgress,
    ) -> Result<bool, PipelineError> {
        if progress.is_complete() {
            return Ok(true);
        }
        let stats = self.urls.get_stats(site_id).await?;
        if stats.pending == 0 && stats.processing == 0 && stats.total > 0 {
            warn!(
                site_id = %site_id,
                reported = progress.success + progress.failed,
                total = progress.total,
                "queue drained below the accounted total, finalizing page stage"
            );
            return Ok(true);
        }
        Ok(false)
    }
}

/// Poll `read` until two consecutive reads agree, up to `attempts`; returns
/// the last observation otherwise.
pub async fn poll_until_stable<F, Fut, E>(
    mut read: F,
    attempts: usize,
    interval: StdDuration,
) -> Result<i64, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<i64, E>>,
{
    let mut previous: Option<i64> = None;

    for attempt in 0..attempts {
        let current = read().await?;
        if previous == Some(current) {
            return Ok(current);
        }
        previous = Some(current);
        if attempt + 1 < attempts {
            tokio::time::sleep(interval).await;
        }
    }

    Ok(previous.unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    async fn poll_sequence(values: &'static [i64], attempts: usize) -> i64 {
        let cursor = Arc::new(AtomicUsize::new(0));
        poll_until_stable::<_, _, Infallible>(
            move || {
                let cursor = cursor.clone();
                async move {
                    let i = cursor.fetch_add(1, Ordering::Relaxed);
                    Ok(values[i.min(values.len() - 1)])
                }
            },
            attempts,
            StdDuration::ZERO,
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_returns_first_repeated_value() {
        // 120 is the first value seen twice in a row.
        assert_eq!(poll_sequence(&[100, 110, 120, 120, 130], 10).await, 120);
    }

    #[tokio::test]
    async fn test_returns_last_observation_when_never_stable() {
        assert_eq!(poll_sequence(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10], 5).await, 5);
    }

    #[tokio::test]
    async fn test_stable_immediately() {
        assert_eq!(poll_sequence(&[42, 42], 10).await, 42);
    }

    #[tokio::test]
    async fn test_zero_attempts_reads_nothing() {
        assert_eq!(poll_sequence(&[7], 0).await, 0);
    }
}
