//! Crawl-result processor: ingests sitemap batches and crawl outcomes,
//! updates the URL queue and the site, then refreshes task progress.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use driftnet_bus::{decode, Disposition, StreamHandler};
use driftnet_persistence::{
    PageRepository, ScanTaskRepository, SitemapUrlRepository, SiteRepository,
};
use driftnet_types::messages::{STREAM_CRAWL_RESULTS, STREAM_SITEMAP_URL_BATCHES};
use driftnet_types::{CrawlResult, SitemapUrlBatch, SitemapUrlEntry, TaskStage};

use crate::config::CrawlTunables;
use crate::metrics::OrchestratorMetrics;
use crate::processors::{dispose, PipelineError};
use crate::progress::TaskProgress;
use crate::publisher::Publisher;

/// Freeze reason recorded when a remote started rejecting the crawl.
pub fn blocked_reason(blocked_count: i64) -> String {
    format!("Blocked {blocked_count} requests (403/429/503)")
}

pub struct CrawlResultProcessor {
    sites: SiteRepository,
    tasks: ScanTaskRepository,
    urls: SitemapUrlRepository,
    pages: PageRepository,
    progress: TaskProgress,
    publisher: Publisher,
    tunables: CrawlTunables,
    metrics: Arc<OrchestratorMetrics>,
}

impl CrawlResultProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sites: SiteRepository,
        tasks: ScanTaskRepository,
        urls: SitemapUrlRepository,
        pages: PageRepository,
        progress: TaskProgress,
        publisher: Publisher,
        tunables: CrawlTunables,
        metrics: Arc<OrchestratorMetrics>,
    ) -> Self {
        Self {
            sites,
            tasks,
            urls,
            pages,
            progress,
            publisher,
            tunables,
            metrics,
        }
    }

    #[instrument(skip(self, result), fields(task_id = %result.task_id, site_id = %result.site_id, success = result.success))]
    async fn process(&self, result: CrawlResult) -> Result<(), PipelineError> {
        self.ingest_discoveries(&result).await?;
        self.update_site(&result).await?;
        self.refresh_task(&result).await
    }

    /// Sitemap stats, discovered URLs and cookies land regardless of the
    /// crawl verdict: partial progress is still progress.
    async fn ingest_discoveries(&self, result: &CrawlResult) -> Result<(), PipelineError> {
        if !result.sitemap_stats.is_empty() {
            match self
                .sites
                .update_sitemap_stats(result.site_id, &result.sitemap_stats)
                .await
            {
                Ok(()) => {}
                Err(err) if err.is_concurrent_update() => {
                    debug!(site_id = %result.site_id, "sitemap stats merge lost, skipping");
                }
                Err(err) => return Err(err.into()),
            }
        }

        if !result.parsed_urls.is_empty() {
            let mut by_source: HashMap<&str, Vec<SitemapUrlEntry>> = HashMap::new();
            for parsed in &result.parsed_urls {
                by_source
                    .entry(parsed.source.as_str())
                    .or_default()
                    .push(parsed.entry());
            }
            for (source, entries) in by_source {
                self.urls
                    .upsert_batch(result.site_id, source, &entries)
                    .await?;
            }
        }

        if !result.new_cookies.is_empty() {
            self.sites
                .update_cookies(result.site_id, &result.new_cookies)
                .await?;
        }

        Ok(())
    }

    async fn update_site(&self, result: &CrawlResult) -> Result<(), PipelineError> {
        if result.is_blocked {
            let reason = blocked_reason(result.blocked_count);
            match self.sites.mark_frozen(result.site_id, &reason).await {
                Ok(()) => {
                    info!(site_id = %result.site_id, %reason, "site frozen by remote block");
                }
                Err(err) if err.is_concurrent_update() => {
                    debug!(site_id = %result.site_id, "block freeze raced, skipping");
                }
                Err(err) => return Err(err.into()),
            }
            self.tasks.cancel_by_site(result.site_id).await?;
            return Ok(());
        }

        if result.success {
            match self
                .sites
                .mark_success(result.site_id, result.scan_interval_h)
                .await
            {
                Ok(()) => {}
                Err(err) if err.is_concurrent_update() => {
                    debug!(site_id = %result.site_id, "success mark raced, skipping");
                }
                Err(err) => return Err(err.into()),
            }

            self.refresh_totals(result).await?;

            if result.pages_saved > 0 {
                // Fire-and-forget: the daily refresh catches a lost trigger.
                if let Err(err) = self.publisher.violations_refresh(Some(result.site_id)).await {
                    warn!(site_id = %result.site_id, error = %err, "violations refresh trigger lost");
                }
            }
            return Ok(());
        }

        if result.is_domain_expired {
            match self.sites.mark_dead(result.site_id, "domain expired").await {
                Ok(()) => {
                    info!(site_id = %result.site_id, "site dead, domain expired");
                }
                Err(err) if err.is_concurrent_update() => {
                    debug!(site_id = %result.site_id, "dead mark raced, skipping");
                }
                Err(err) => return Err(err.into()),
            }
            self.tasks.cancel_by_site(result.site_id).await?;
            return Ok(());
        }

        match self
            .sites
            .mark_failure(
                result.site_id,
                self.tunables.site_dead_threshold,
                self.tunables.failure_cooldown,
            )
            .await
        {
            Ok((failures, status)) => {
                debug!(site_id = %result.site_id, failures, %status, "crawl failure recorded");
            }
            Err(err) if err.is_concurrent_update() => {
                debug!(site_id = %result.site_id, "failure mark raced, skipping");
            }
            Err(err) => return Err(err.into()),
        }
        Ok(())
    }

    async fn refresh_totals(&self, result: &CrawlResult) -> Result<(), PipelineError> {
        let stats = self.urls.get_stats(result.site_id).await?;
        let pages = self.pages.count_by_site(result.site_id).await?;
        self.sites
            .update_totals(result.site_id, stats.total, pages)
            .await?;
        Ok(())
    }

    /// Move the owning task forward. Stage is read from the task itself: a
    /// result arriving for the sitemap stage settles that stage, a result in
    /// the page stage is one URL's outcome.
    async fn refresh_task(&self, result: &CrawlResult) -> Result<(), PipelineError> {
        let Some(task) = self.tasks.find_by_id(result.task_id).await? else {
            debug!(task_id = %result.task_id, "result for unknown task, dropping");
            return Ok(());
        };
        if !task.status.is_active() {
            debug!(task_id = %task.id, status = %task.status, "result for settled task, dropping");
            return Ok(());
        }

        match task.stage {
            TaskStage::Sitemap => {
                if result.is_blocked {
                    // cancel_by_site already settled the task.
                    Ok(())
                } else if result.success {
                    let Some(site) = self.sites.find_by_id(result.site_id).await? else {
                        return Ok(());
                    };
                    self.progress.complete_sitemap_stage(task.id, &site).await
                } else {
                    let error = if result.error.is_empty() {
                        "sitemap crawl failed".to_string()
                    } else {
                        result.error.clone()
                    };
                    self.progress.fail_sitemap_stage(task.id, &error).await
                }
            }
            TaskStage::Page => {
                if result.is_blocked {
                    Ok(())
                } else {
                    self.progress
                        .record_page_result(task.id, result.site_id, result.success)
                        .await
                }
            }
            TaskStage::Done => Ok(()),
        }
    }
}

#[async_trait]
impl StreamHandler for CrawlResultProcessor {
    fn stream(&self) -> &'static str {
        STREAM_CRAWL_RESULTS
    }

    fn name(&self) -> &'static str {
        "crawl-results"
    }

    async fn handle(&self, payload: &[u8]) -> Disposition {
        let disposition = match decode::<CrawlResult>(payload) {
            Ok(result) => dispose(STREAM_CRAWL_RESULTS, self.process(result).await),
            Err(err) => Disposition::Drop(err.to_string()),
        };
        self.metrics
            .record_disposition(STREAM_CRAWL_RESULTS, &disposition)
            .await;
        disposition
    }
}

/// Ingests URL batches streamed out of running sitemap crawls.
pub struct SitemapBatchProcessor {
    urls: SitemapUrlRepository,
    metrics: Arc<OrchestratorMetrics>,
}

impl SitemapBatchProcessor {
    pub fn new(urls: SitemapUrlRepository, metrics: Arc<OrchestratorMetrics>) -> Self {
        Self { urls, metrics }
    }

    #[instrument(skip(self, batch), fields(site_id = %batch.site_id, batch = batch.batch_number, count = batch.urls.len()))]
    async fn process(&self, batch: SitemapUrlBatch) -> Result<(), PipelineError> {
        let outcome = self
            .urls
            .upsert_batch(batch.site_id, &batch.sitemap_source, &batch.urls)
            .await?;
        debug!(
            inserted = outcome.inserted,
            updated = outcome.updated,
            "sitemap batch ingested"
        );
        Ok(())
    }
}

#[async_trait]
impl StreamHandler for SitemapBatchProcessor {
    fn stream(&self) -> &'static str {
        STREAM_SITEMAP_URL_BATCHES
    }

    fn name(&self) -> &'static str {
        "sitemap-batches"
    }

    async fn handle(&self, payload: &[u8]) -> Disposition {
        let disposition = match decode::<SitemapUrlBatch>(payload) {
            Ok(batch) => dispose(STREAM_SITEMAP_URL_BATCHES, self.process(batch).await),
            Err(err) => Disposition::Drop(err.to_string()),
        };
        self.metrics
            .record_disposition(STREAM_SITEMAP_URL_BATCHES, &disposition)
            .await;
        disposition
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocked_reason_encodes_count() {
        assert_eq!(blocked_reason(7), "Blocked 7 requests (403/429/503)");
        assert_eq!(blocked_reason(0), "Blocked 0 requests (403/429/503)");
    }
}
