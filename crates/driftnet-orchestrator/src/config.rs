//! Service configuration: broker and store endpoints, crawl tunables and job
//! cadences. Everything is env-overridable with the contractual defaults.

use chrono::Duration;
use std::time::Duration as StdDuration;

use driftnet_bus::ConsumerConfig;

/// Crawl tunables shared by the repositories, processors and recovery loops.
#[derive(Debug, Clone)]
pub struct CrawlTunables {
    /// Per-URL retry delay before a failed URL becomes leasable again.
    pub url_retry_delay: Duration,
    /// Soft-lease duration granted to a page worker per URL.
    pub url_lease: Duration,
    /// Pending tasks older than this are considered abandoned.
    pub stale_task_pending: Duration,
    /// Processing tasks older than this are considered abandoned.
    pub stale_task_processing: Duration,
    /// Pending sites older than this get their DetectTask re-emitted.
    pub detect_recovery_age: Duration,
    /// Detection failures before a site freezes.
    pub max_detect_failures: i32,
    /// Crawl failures before a site dies.
    pub site_dead_threshold: i32,
    /// Next-scan delay applied after a crawl failure, until Dead.
    pub failure_cooldown: Duration,
    /// Retry budget for failed scan tasks.
    pub max_task_retries: i32,
    /// Due sites picked per scheduler tick.
    pub queue_batch: i64,
    /// Re-pick guard applied when a site is queued for scanning.
    pub queue_hold: Duration,
    /// URL lease batch suggested to page workers.
    pub page_batch_size: u32,
}

impl Default for CrawlTunables {
    fn default() -> Self {
        Self {
            url_retry_delay: Duration::minutes(5),
            url_lease: Duration::minutes(5),
            stale_task_pending: Duration::minutes(30),
            stale_task_processing: Duration::hours(2),
            detect_recovery_age: Duration::minutes(5),
            max_detect_failures: 3,
            site_dead_threshold: 3,
            failure_cooldown: Duration::hours(12),
            max_task_retries: driftnet_types::MAX_TASK_RETRIES,
            queue_batch: 50,
            queue_hold: Duration::hours(1),
            page_batch_size: 100,
        }
    }
}

/// How often each background job fires.
#[derive(Debug, Clone)]
pub struct JobCadence {
    pub queue_due_sites: StdDuration,
    pub recover_pending_sites: StdDuration,
    pub recover_stale_tasks: StdDuration,
    pub recover_stale_urls: StdDuration,
    pub retry_failed_tasks: StdDuration,
    pub refresh_derived_indexes: StdDuration,
}

impl Default for JobCadence {
    fn default() -> Self {
        Self {
            queue_due_sites: StdDuration::from_secs(5 * 60),
            recover_pending_sites: StdDuration::from_secs(2 * 60),
            recover_stale_tasks: StdDuration::from_secs(5 * 60),
            recover_stale_urls: StdDuration::from_secs(5 * 60),
            retry_failed_tasks: StdDuration::from_secs(5 * 60),
            refresh_derived_indexes: StdDuration::from_secs(24 * 60 * 60),
        }
    }
}

/// Top-level orchestrator configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Message broker URL.
    pub redis_url: String,
    /// Document store URL.
    pub database_url: String,
    /// Consumer-loop tuning (group, batch sizes, claim threshold).
    pub consumer: ConsumerConfig,
    pub tunables: CrawlTunables,
    pub cadence: JobCadence,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        let mut consumer = ConsumerConfig::default();
        consumer.max_concurrency = num_cpus::get().max(2);

        Self {
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgres://localhost:5432/driftnet".to_string()),
            consumer,
            tunables: CrawlTunables::default(),
            cadence: JobCadence::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tunables_carry_contract_defaults() {
        let t = CrawlTunables::default();
        assert_eq!(t.url_retry_delay, Duration::minutes(5));
        assert_eq!(t.url_lease, Duration::minutes(5));
        assert_eq!(t.stale_task_pending, Duration::minutes(30));
        assert_eq!(t.stale_task_processing, Duration::hours(2));
        assert_eq!(t.detect_recovery_age, Duration::minutes(5));
        assert_eq!(t.max_detect_failures, 3);
        assert_eq!(t.site_dead_threshold, 3);
        assert_eq!(t.failure_cooldown, Duration::hours(12));
        assert_eq!(t.max_task_retries, 5);
        assert_eq!(t.queue_batch, 50);
        assert_eq!(t.queue_hold, Duration::hours(1));
    }

    #[test]
    fn test_cadence_defaults() {
        let c = JobCadence::default();
        assert_eq!(c.queue_due_sites, StdDuration::from_secs(300));
        assert_eq!(c.recover_pending_sites, StdDuration::from_secs(120));
        assert_eq!(c.recover_stale_tasks, StdDuration::from_secs(300));
        assert_eq!(c.recover_stale_urls, StdDuration::from_secs(300));
        assert_eq!(c.refresh_derived_indexes, StdDuration::from_secs(86_400));
    }

    #[test]
    fn test_config_default_urls() {
        let config = OrchestratorConfig::default();
        assert!(config.redis_url.starts_with("redis://"));
        assert!(config.database_url.starts_with("postgres://"));
        assert!(config.consumer.max_concurrency >= 2);
    }
}
