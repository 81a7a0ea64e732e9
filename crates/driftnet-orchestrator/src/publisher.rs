//! Orchestration publisher: builds and emits the task messages consumed by
//! the detect and crawl worker fleets.

use driftnet_bus::{MessageBus, Result};
use driftnet_types::messages::{
    STREAM_DETECT_TASKS, STREAM_PAGE_CRAWL_TASKS, STREAM_SITEMAP_CRAWL_TASKS,
    STREAM_VIOLATIONS_REFRESH,
};
use driftnet_types::{DetectTask, PageCrawlTask, Site, SiteRef, SitemapCrawlTask, ViolationsRefresh};
use tracing::{debug, instrument};
use uuid::Uuid;

#[derive(Clone)]
pub struct Publisher {
    bus: MessageBus,
}

impl Publisher {
    pub fn new(bus: MessageBus) -> Self {
        Self { bus }
    }

    #[instrument(skip(self, site), fields(site_id = %site.id, domain = %site.domain))]
    pub async fn detect_task(&self, site: &Site) -> Result<()> {
        let task = DetectTask::for_site(site);
        self.bus.publish(STREAM_DETECT_TASKS, &task).await?;
        debug!(detect_id = %task.id, "detect task published");
        Ok(())
    }

    #[instrument(skip(self, site), fields(task_id = %task_id, site_id = %site.id))]
    pub async fn sitemap_crawl_task(
        &self,
        task_id: Uuid,
        site: &Site,
        auto_continue: bool,
    ) -> Result<()> {
        let message = SitemapCrawlTask {
            task_id,
            site: SiteRef::from(site),
            auto_continue,
        };
        self.bus.publish(STREAM_SITEMAP_CRAWL_TASKS, &message).await?;
        Ok(())
    }

    #[instrument(skip(self, site), fields(task_id = %task_id, site_id = %site.id))]
    pub async fn page_crawl_task(&self, task_id: Uuid, site: &Site, batch_size: u32) -> Result<()> {
        let message = PageCrawlTask {
            task_id,
            site: SiteRef::from(site),
            batch_size,
        };
        self.bus.publish(STREAM_PAGE_CRAWL_TASKS, &message).await?;
        Ok(())
    }

    /// Best-effort trigger for the violation matcher; losing one is fine,
    /// the daily sweep catches omissions.
    pub async fn violations_refresh(&self, site_id: Option<Uuid>) -> Result<()> {
        self.bus
            .publish(STREAM_VIOLATIONS_REFRESH, &ViolationsRefresh { site_id })
            .await?;
        Ok(())
    }
}
