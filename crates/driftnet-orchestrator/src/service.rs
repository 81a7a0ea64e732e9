//! Service wiring: connects the store and the bus, builds the processors,
//! and owns the lifecycle of every loop.

use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use driftnet_bus::{ConsumerLoop, MessageBus, StreamHandler};
use driftnet_persistence::{
    PageRepository, ScanTaskRepository, SitemapUrlRepository, SiteRepository,
};
use driftnet_types::messages::{STREAM_CRAWL_RESULTS, STREAM_DETECT_RESULTS};

use crate::config::OrchestratorConfig;
use crate::metrics::OrchestratorMetrics;
use crate::processors::{CrawlResultProcessor, DetectResultProcessor, SitemapBatchProcessor};
use crate::progress::TaskProgress;
use crate::publisher::Publisher;
use crate::recovery::Recovery;
use crate::scheduler::{spawn_job, Scheduler};

pub struct OrchestratorService {
    config: OrchestratorConfig,
    bus: MessageBus,
    consumers: Vec<Arc<ConsumerLoop>>,
    scheduler: Scheduler,
    recovery: Recovery,
    metrics: Arc<OrchestratorMetrics>,
    running: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl OrchestratorService {
    /// Connect everything. Failing to reach the store or the broker is fatal
    /// and bubbles out to a non-zero exit.
    pub async fn new(config: OrchestratorConfig) -> Result<Self> {
        info!("initializing orchestrator service");

        let pool = driftnet_persistence::connect(&config.database_url)
            .await
            .context("failed to connect to document store")?;
        let bus = MessageBus::connect(&config.redis_url)
            .await
            .context("failed to connect to message broker")?;

        let sites = SiteRepository::new(pool.clone());
        let tasks = ScanTaskRepository::new(pool.clone());
        let urls = SitemapUrlRepository::new(pool.clone());
        let pages = PageRepository::new(pool);

        let publisher = Publisher::new(bus.clone());
        let metrics = Arc::new(OrchestratorMetrics::new());
        let progress = TaskProgress::new(
            tasks.clone(),
            urls.clone(),
            publisher.clone(),
            config.tunables.page_batch_size,
        );

        let detect_processor: Arc<dyn StreamHandler> = Arc::new(DetectResultProcessor::new(
            sites.clone(),
            tasks.clone(),
            publisher.clone(),
            config.tunables.clone(),
            metrics.clone(),
        ));
        let crawl_processor: Arc<dyn StreamHandler> = Arc::new(CrawlResultProcessor::new(
            sites.clone(),
            tasks.clone(),
            urls.clone(),
            pages,
            progress,
            publisher.clone(),
            config.tunables.clone(),
            metrics.clone(),
        ));
        let batch_processor: Arc<dyn StreamHandler> =
            Arc::new(SitemapBatchProcessor::new(urls.clone(), metrics.clone()));

        let consumers = vec![
            Arc::new(ConsumerLoop::new(
                bus.clone(),
                detect_processor,
                config.consumer.clone(),
            )),
            Arc::new(ConsumerLoop::new(
                bus.clone(),
                crawl_processor,
                config.consumer.clone(),
            )),
            Arc::new(ConsumerLoop::new(
                bus.clone(),
                batch_processor,
                config.consumer.clone(),
            )),
        ];

        let scheduler = Scheduler::new(
            sites.clone(),
            tasks.clone(),
            publisher.clone(),
            config.tunables.clone(),
            metrics.clone(),
        );
        let recovery = Recovery::new(
            sites,
            tasks,
            urls,
            publisher,
            config.tunables.clone(),
            metrics.clone(),
        );

        Ok(Self {
            config,
            bus,
            consumers,
            scheduler,
            recovery,
            metrics,
            running: Arc::new(AtomicBool::new(false)),
            handles: Vec::new(),
        })
    }

    /// Point-in-time metrics, for operators and tests.
    pub async fn metrics_snapshot(&self) -> crate::metrics::MetricsSnapshot {
        self.metrics.get_snapshot().await
    }

    /// Start every consumer and periodic job.
    pub async fn start(&mut self) -> Result<()> {
        if self.running.swap(true, Ordering::Relaxed) {
            warn!("orchestrator service already running");
            return Ok(());
        }
        info!("starting orchestrator service");

        for consumer in &self.consumers {
            let consumer = consumer.clone();
            self.handles.push(tokio::spawn(async move {
                if let Err(err) = consumer.run().await {
                    tracing::error!(error = %err, "consumer loop exited with error");
                }
            }));
        }

        let cadence = &self.config.cadence;

        let scheduler = self.scheduler.clone();
        self.handles.push(spawn_job(
            "queue-due-sites",
            cadence.queue_due_sites,
            self.running.clone(),
            move || {
                let scheduler = scheduler.clone();
                async move { scheduler.queue_due_sites().await }
            },
        ));

        let scheduler = self.scheduler.clone();
        self.handles.push(spawn_job(
            "recover-pending-sites",
            cadence.recover_pending_sites,
            self.running.clone(),
            move || {
                let scheduler = scheduler.clone();
                async move { scheduler.recover_pending_sites().await }
            },
        ));

        let recovery = self.recovery.clone();
        self.handles.push(spawn_job(
            "recover-stale-tasks",
            cadence.recover_stale_tasks,
            self.running.clone(),
            move || {
                let recovery = recovery.clone();
                async move { recovery.recover_stale_tasks().await }
            },
        ));

        let recovery = self.recovery.clone();
        self.handles.push(spawn_job(
            "retry-failed-tasks",
            cadence.retry_failed_tasks,
            self.running.clone(),
            move || {
                let recovery = recovery.clone();
                async move { recovery.retry_failed_tasks().await }
            },
        ));

        let recovery = self.recovery.clone();
        self.handles.push(spawn_job(
            "recover-stale-urls",
            cadence.recover_stale_urls,
            self.running.clone(),
            move || {
                let recovery = recovery.clone();
                async move { recovery.recover_stale_urls().await }
            },
        ));

        let recovery = self.recovery.clone();
        self.handles.push(spawn_job(
            "refresh-derived-indexes",
            cadence.refresh_derived_indexes,
            self.running.clone(),
            move || {
                let recovery = recovery.clone();
                async move { recovery.refresh_derived_indexes().await }
            },
        ));

        let health = self.spawn_health_log();
        self.handles.push(health);

        info!(
            consumers = self.consumers.len(),
            "orchestrator service started"
        );
        Ok(())
    }

    /// Stop the loops. Already-dispatched handlers finish on their own;
    /// unacked deliveries are redelivered on the next start.
    pub async fn stop(&mut self) {
        info!("stopping orchestrator service");
        self.running.store(false, Ordering::Relaxed);
        for consumer in &self.consumers {
            consumer.stop();
        }
        for handle in self.handles.drain(..) {
            handle.abort();
        }
        info!("orchestrator service stopped");
    }

    /// Periodic backlog report, mirrors the queue-depth telemetry loop.
    fn spawn_health_log(&self) -> JoinHandle<()> {
        let bus = self.bus.clone();
        let group = self.config.consumer.group.clone();
        let running = self.running.clone();
        let metrics = self.metrics.clone();

        tokio::spawn(async move {
            while running.load(Ordering::Relaxed) {
                for stream in [STREAM_DETECT_RESULTS, STREAM_CRAWL_RESULTS] {
                    match bus.pending_count(stream, &group).await {
                        Ok(pending) => {
                            metrics.update_backlog(stream, pending).await;
                            if pending > 0 {
                                info!(stream, pending, "unacked backlog");
                            }
                        }
                        Err(err) => {
                            warn!(stream, error = %err, "failed to read backlog depth");
                        }
                    }
                }

                let snapshot = metrics.get_snapshot().await;
                if !snapshot.is_healthy() {
                    warn!(
                        drop_rate = snapshot.drop_rate,
                        backlog = snapshot.total_backlog(),
                        "orchestrator health degraded"
                    );
                }

                tokio::time::sleep(std::time::Duration::from_secs(30)).await;
            }
        })
    }
}
