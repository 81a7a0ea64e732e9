//! Detect-result processor: drives the site state machine off detection
//! outcomes, including the domain-redirect fork and the permanent-error
//! freeze.

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use driftnet_bus::{decode, Disposition, StreamHandler};
use driftnet_persistence::{PersistenceError, ScanTaskRepository, SiteRepository};
use driftnet_types::messages::STREAM_DETECT_RESULTS;
use driftnet_types::{
    is_permanent_remote_error, DetectResult, DetectionUpdate, ScannerType, Site, SiteStatus,
};

use std::sync::Arc;

use crate::config::CrawlTunables;
use crate::metrics::OrchestratorMetrics;
use crate::processors::{dispose, PipelineError};
use crate::publisher::Publisher;

pub struct DetectResultProcessor {
    sites: SiteRepository,
    tasks: ScanTaskRepository,
    publisher: Publisher,
    tunables: CrawlTunables,
    metrics: Arc<OrchestratorMetrics>,
}

impl DetectResultProcessor {
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

    #[instrument(skip(self, result), fields(site_id = %result.site_id, success = result.success))]
    async fn process(&self, result: DetectResult) -> Result<(), PipelineError> {
        // Rule order matters: a redirect outranks everything else.
        if result.success && result.has_domain_redirect && !result.redirect_to_domain.is_empty() {
            return self.handle_domain_redirect(&result).await;
        }

        if !result.success {
            if is_permanent_remote_error(&result.error) {
                return self.freeze_permanently(&result).await;
            }
            return self.record_transient_failure(&result).await;
        }

        self.apply_detection(&result).await
    }

    /// Rule 1: the domain moved. Mark the old site terminal and, unless the
    /// new domain is already tracked, fork a successor and start its
    /// detection.
    async fn handle_domain_redirect(&self, result: &DetectResult) -> Result<(), PipelineError> {
        let Some(site) = self.sites.find_by_id(result.site_id).await? else {
            warn!(site_id = %result.site_id, "redirect for unknown site, dropping");
            return Ok(());
        };

        let to_domain = result.redirect_to_domain.as_str();
        match self.sites.mark_moved(site.id, to_domain).await {
            Ok(()) => {
                info!(site_id = %site.id, from = %site.domain, to = %to_domain, "site moved");
            }
            Err(err) if err.is_concurrent_update() => {
                debug!(site_id = %site.id, "move raced, another writer won");
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        }

        if self.sites.find_by_domain(to_domain).await?.is_some() {
            debug!(domain = %to_domain, "successor domain already tracked");
            return Ok(());
        }

        let successor = Site::successor_of(&site, to_domain);
        match self.sites.create(&successor).await {
            Ok(()) => {
                info!(site_id = %successor.id, domain = %to_domain, "successor site created");
                self.publisher.detect_task(&successor).await?;
            }
            Err(PersistenceError::DuplicateDomain(_)) => {
                // Another replica created it between the lookup and the insert.
                debug!(domain = %to_domain, "successor creation raced");
            }
            Err(err) => return Err(err.into()),
        }
        Ok(())
    }

    /// Rule 2: DNS-level failures freeze the site immediately.
    async fn freeze_permanently(&self, result: &DetectResult) -> Result<(), PipelineError> {
        match self.sites.mark_frozen(result.site_id, &result.error).await {
            Ok(()) => {
                info!(site_id = %result.site_id, reason = %result.error, "site frozen on permanent detection failure");
            }
            Err(err) if err.is_concurrent_update() => {
                debug!(site_id = %result.site_id, "freeze raced, skipping");
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        }

        self.tasks.cancel_by_site(result.site_id).await?;
        Ok(())
    }

    /// Rule 3: transient failures burn the detection budget; the site
    /// freezes when the budget runs out.
    async fn record_transient_failure(&self, result: &DetectResult) -> Result<(), PipelineError> {
        let outcome = self
            .sites
            .record_detect_failure(
                result.site_id,
                self.tunables.max_detect_failures,
                &result.error,
            )
            .await;

        match outcome {
            Ok((failures, status)) => {
                debug!(site_id = %result.site_id, failures, %status, "detection failure recorded");
                if status == SiteStatus::Frozen {
                    self.tasks.cancel_by_site(result.site_id).await?;
                }
                Ok(())
            }
            Err(err) if err.is_concurrent_update() => {
                debug!(site_id = %result.site_id, "failure record raced, skipping");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Rule 4: success. Apply the fingerprint and, when no task is already in
    /// flight, schedule an immediate scan.
    async fn apply_detection(&self, result: &DetectResult) -> Result<(), PipelineError> {
        let update = DetectionUpdate {
            cms: non_empty(&result.cms),
            has_sitemap: result.has_sitemap,
            sitemap_status: result.sitemap_status,
            crawl_strategy: result.crawl_strategy,
            sitemap_urls: result.sitemap_urls.clone(),
            scanner_type: if result.needs_spa {
                ScannerType::Spa
            } else {
                ScannerType::Http
            },
            captcha_type: non_empty(&result.captcha_type),
            cookies: result.cookies.clone(),
        };

        match self.sites.update_from_detection(result.site_id, &update).await {
            Ok(()) => {}
            Err(err) if err.is_concurrent_update() => {
                debug!(site_id = %result.site_id, "detection apply raced, skipping");
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        }

        if self.tasks.has_active_task(result.site_id).await? {
            debug!(site_id = %result.site_id, "scan already in flight, not scheduling another");
            return Ok(());
        }

        let Some(site) = self.sites.find_by_id(result.site_id).await? else {
            return Ok(());
        };

        let task = match self.tasks.create(site.id, &site.domain).await {
            Ok(task) => task,
            Err(err) if err.is_concurrent_update() => {
                debug!(site_id = %site.id, "scan scheduling raced, skipping");
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };
        self.publisher.sitemap_crawl_task(task.id, &site, true).await?;
        info!(site_id = %site.id, task_id = %task.id, "detection applied, scan scheduled");
        Ok(())
    }
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

#[async_trait]
impl StreamHandler for DetectResultProcessor {
    fn stream(&self) -> &'static str {
        STREAM_DETECT_RESULTS
    }

    fn name(&self) -> &'static str {
        "detect-results"
    }

    async fn handle(&self, payload: &[u8]) -> Disposition {
        let disposition = match decode::<DetectResult>(payload) {
            Ok(result) => dispose(STREAM_DETECT_RESULTS, self.process(result).await),
            Err(err) => Disposition::Drop(err.to_string()),
        };
        self.metrics
            .record_disposition(STREAM_DETECT_RESULTS, &disposition)
            .await;
        disposition
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_empty_helper() {
        assert_eq!(non_empty(""), None);
        assert_eq!(non_empty("DLE"), Some("DLE".to_string()));
    }

    #[test]
    fn test_redirect_outranks_failure_classification() {
        // A successful detection with a redirect must be treated as a move
        // even when the error field carries leftovers.
        let result = DetectResult {
            success: true,
            has_domain_redirect: true,
            redirect_to_domain: "y.example".into(),
            error: "domain not resolvable".into(),
            ..Default::default()
        };
        assert!(result.success && result.has_domain_redirect);
        assert!(!result.redirect_to_domain.is_empty());
    }
}
