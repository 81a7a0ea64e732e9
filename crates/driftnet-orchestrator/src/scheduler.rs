//! Periodic scheduling jobs: enqueue due sites and re-emit lost detections.
//!
//! Every job is idempotent: the active-task gate and the CAS writes in the
//! repositories make an overlapping tick a no-op rather than a double
//! schedule.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument};

use driftnet_persistence::{ScanTaskRepository, SiteRepository};

use crate::config::CrawlTunables;
use crate::metrics::OrchestratorMetrics;
use crate::processors::PipelineError;
use crate::publisher::Publisher;

#[derive(Clone)]
pub struct Scheduler {
    sites: SiteRepository,
    tasks: ScanTaskRepository,
    publisher: Publisher,
    tunables: CrawlTunables,
    metrics: Arc<OrchestratorMetrics>,
}

impl Scheduler {
    pub fn new(
        sites: SiteRepository,
        tasks: ScanTaskRepository,
        publisher: Publisher,
        tunables: CrawlTunables,
        metrics: Arc<OrchestratorMetrics>,
    ) -> Self {
        Self {
            sites,
            tasks,
            publisher,
            tunables,
            metrics,
        }
    }

    /// Pick due scannable sites and start a scan for each, skipping sites
    /// that already have one in flight. `mark_queued` pushes the next pick
    /// out so an overlapping tick cannot double-schedule.
    #[instrument(skip(self))]
    pub async fn queue_due_sites(&self) -> Result<usize, PipelineError> {
        let due = self.sites.find_due(self.tunables.queue_batch).await?;
        let mut queued = 0;

        for site in due {
            if self.tasks.has_active_task(site.id).await? {
                debug!(site_id = %site.id, "scan already in flight, skipping");
                continue;
            }

            let task = match self.tasks.create(site.id, &site.domain).await {
                Ok(task) => task,
                Err(err) if err.is_concurrent_update() => {
                    debug!(site_id = %site.id, "another writer scheduled this site first");
                    continue;
                }
                Err(err) => return Err(err.into()),
            };
            self.publisher.sitemap_crawl_task(task.id, &site, true).await?;
            self.sites
                .mark_queued(site.id, self.tunables.queue_hold)
                .await?;

            info!(site_id = %site.id, task_id = %task.id, domain = %site.domain, "site queued for scan");
            queued += 1;
        }

        self.metrics.record_sites_queued(queued as u64);
        Ok(queued)
    }

    /// Re-emit DetectTasks for sites stuck in Pending: the original task or
    /// its result was lost somewhere in the fleet.
    #[instrument(skip(self))]
    pub async fn recover_pending_sites(&self) -> Result<usize, PipelineError> {
        let stuck = self
            .sites
            .find_stuck_pending(self.tunables.detect_recovery_age)
            .await?;
        let count = stuck.len();

        for site in stuck {
            self.publisher.detect_task(&site).await?;
            debug!(site_id = %site.id, domain = %site.domain, "detect task re-emitted");
        }

        if count > 0 {
            info!(count, "pending sites recovered");
        }
        self.metrics.record_detects_reemitted(count as u64);
        Ok(count)
    }
}

/// Run `job` every `period` until `running` flips off. Job errors are logged
/// and never stop the loop.
pub fn spawn_job<F, Fut>(
    name: &'static str,
    period: Duration,
    running: Arc<AtomicBool>,
    job: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<usize, PipelineError>> + Send,
{
    tokio::spawn(async move {
        info!(job = name, period_secs = period.as_secs(), "job loop started");
        while running.load(Ordering::Relaxed) {
            match job().await {
                Ok(0) => {}
                Ok(count) => debug!(job = name, count, "job tick"),
                Err(err) => error!(job = name, error = %err, "job tick failed"),
            }
            tokio::time::sleep(period).await;
        }
        info!(job = name, "job loop stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test(start_paused = true)]
    async fn test_spawn_job_stops_on_flag() {
        let running = Arc::new(AtomicBool::new(true));
        let ticks = Arc::new(AtomicUsize::new(0));

        let handle = spawn_job("test", Duration::from_secs(60), running.clone(), {
            let ticks = ticks.clone();
            move || {
                let ticks = ticks.clone();
                async move {
                    ticks.fetch_add(1, Ordering::Relaxed);
                    Ok(1)
                }
            }
        });

        // Let a few ticks elapse on the paused clock, then stop.
        tokio::time::sleep(Duration::from_secs(150)).await;
        running.store(false, Ordering::Relaxed);
        tokio::time::sleep(Duration::from_secs(61)).await;
        handle.await.unwrap();

        let observed = ticks.load(Ordering::Relaxed);
        assert!(observed >= 2, "expected at least 2 ticks, got {observed}");
    }
}
