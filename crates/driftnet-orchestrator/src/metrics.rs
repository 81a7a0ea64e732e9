//! Orchestrator metrics: message dispositions per stream, scheduling and
//! recovery counters, and stream backlog tracking.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

use driftnet_bus::Disposition;

/// Metrics collector shared by the processors and loops.
pub struct OrchestratorMetrics {
    /// Message disposition counters
    pub messages_processed: AtomicU64,
    pub messages_dropped: AtomicU64,
    pub messages_retried: AtomicU64,

    /// Scheduling and recovery counters
    pub sites_queued: AtomicU64,
    pub detects_reemitted: AtomicU64,
    pub stale_tasks_failed: AtomicU64,
    pub tasks_retried: AtomicU64,
    pub url_leases_recovered: AtomicU64,

    /// Per-stream disposition breakdown
    stream_stats: Arc<RwLock<HashMap<&'static str, StreamStats>>>,

    /// Unacked backlog per stream, refreshed by the health loop
    backlogs: Arc<RwLock<HashMap<String, u64>>>,

    started_at: DateTime<Utc>,
}

impl OrchestratorMetrics {
    pub fn new() -> Self {
        Self {
            messages_processed: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
            messages_retried: AtomicU64::new(0),
            sites_queued: AtomicU64::new(0),
            detects_reemitted: AtomicU64::new(0),
            stale_tasks_failed: AtomicU64::new(0),
            tasks_retried: AtomicU64::new(0),
            url_leases_recovered: AtomicU64::new(0),
            stream_stats: Arc::new(RwLock::new(HashMap::new())),
            backlogs: Arc::new(RwLock::new(HashMap::new())),
            started_at: Utc::now(),
        }
    }

    /// Record the outcome of one message-handling pass.
    pub async fn record_disposition(&self, stream: &'static str, disposition: &Disposition) {
        match disposition {
            Disposition::Ack => {
                self.messages_processed.fetch_add(1, Ordering::Relaxed);
            }
            Disposition::Drop(_) => {
                self.messages_dropped.fetch_add(1, Ordering::Relaxed);
            }
            Disposition::Retry(_) => {
                self.messages_retried.fetch_add(1, Ordering::Relaxed);
            }
        }

        let mut stats = self.stream_stats.write().await;
        let entry = stats.entry(stream).or_default();
        match disposition {
            Disposition::Ack => entry.processed += 1,
            Disposition::Drop(_) => entry.dropped += 1,
            Disposition::Retry(_) => entry.retried += 1,
        }
    }

    pub fn record_sites_queued(&self, count: u64) {
        self.sites_queued.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_detects_reemitted(&self, count: u64) {
        self.detects_reemitted.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_stale_tasks_failed(&self, count: u64) {
        self.stale_tasks_failed.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_tasks_retried(&self, count: u64) {
        self.tasks_retried.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_url_leases_recovered(&self, count: u64) {
        self.url_leases_recovered.fetch_add(count, Ordering::Relaxed);
    }

    pub async fn update_backlog(&self, stream: &str, pending: u64) {
        let mut backlogs = self.backlogs.write().await;
        backlogs.insert(stream.to_string(), pending);
    }

    pub async fn get_snapshot(&self) -> MetricsSnapshot {
        let processed = self.messages_processed.load(Ordering::Relaxed);
        let dropped = self.messages_dropped.load(Ordering::Relaxed);
        let retried = self.messages_retried.load(Ordering::Relaxed);
        let handled = processed + dropped + retried;

        let drop_rate = if handled > 0 {
            (dropped as f64 / handled as f64) * 100.0
        } else {
            0.0
        };

        MetricsSnapshot {
            messages_processed: processed,
            messages_dropped: dropped,
            messages_retried: retried,
            sites_queued: self.sites_queued.load(Ordering::Relaxed),
            detects_reemitted: self.detects_reemitted.load(Ordering::Relaxed),
            stale_tasks_failed: self.stale_tasks_failed.load(Ordering::Relaxed),
            tasks_retried: self.tasks_retried.load(Ordering::Relaxed),
            url_leases_recovered: self.url_leases_recovered.load(Ordering::Relaxed),
            stream_stats: self
                .stream_stats
                .read()
                .await
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
            backlogs: self.backlogs.read().await.clone(),
            drop_rate,
            uptime_seconds: (Utc::now() - self.started_at).num_seconds() as u64,
            timestamp: Utc::now(),
        }
    }
}

impl Default for OrchestratorMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-stream disposition counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamStats {
    pub processed: u64,
    pub dropped: u64,
    pub retried: u64,
}

/// Point-in-time metrics snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub messages_processed: u64,
    pub messages_dropped: u64,
    pub messages_retried: u64,
    pub sites_queued: u64,
    pub detects_reemitted: u64,
    pub stale_tasks_failed: u64,
    pub tasks_retried: u64,
    pub url_leases_recovered: u64,
    pub stream_stats: HashMap<String, StreamStats>,
    pub backlogs: HashMap<String, u64>,
    pub drop_rate: f64,
    pub uptime_seconds: u64,
    pub timestamp: DateTime<Utc>,
}

impl MetricsSnapshot {
    pub fn total_backlog(&self) -> u64 {
        self.backlogs.values().sum()
    }

    /// Rough health heuristic: few drops and no stream severely backed up.
    pub fn is_healthy(&self) -> bool {
        let acceptable_drops = self.drop_rate < 10.0;
        let reasonable_backlog = self.backlogs.values().all(|&pending| pending < 10_000);
        acceptable_drops && reasonable_backlog
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_disposition_recording() {
        let metrics = OrchestratorMetrics::new();

        metrics
            .record_disposition("crawl.results", &Disposition::Ack)
            .await;
        metrics
            .record_disposition("crawl.results", &Disposition::Ack)
            .await;
        metrics
            .record_disposition("crawl.results", &Disposition::Drop("bad json".into()))
            .await;

        let snapshot = metrics.get_snapshot().await;
        assert_eq!(snapshot.messages_processed, 2);
        assert_eq!(snapshot.messages_dropped, 1);

        let stream = &snapshot.stream_stats["crawl.results"];
        assert_eq!(stream.processed, 2);
        assert_eq!(stream.dropped, 1);
    }

    #[tokio::test]
    async fn test_backlog_health() {
        let metrics = OrchestratorMetrics::new();
        metrics.update_backlog("detect.results", 12).await;

        let snapshot = metrics.get_snapshot().await;
        assert_eq!(snapshot.total_backlog(), 12);
        assert!(snapshot.is_healthy());

        metrics.update_backlog("crawl.results", 50_000).await;
        let snapshot = metrics.get_snapshot().await;
        assert!(!snapshot.is_healthy());
    }

    #[tokio::test]
    async fn test_fresh_snapshot_is_zeroed() {
        let metrics = OrchestratorMetrics::new();
        let snapshot = metrics.get_snapshot().await;
        assert_eq!(snapshot.messages_processed, 0);
        assert_eq!(snapshot.drop_rate, 0.0);
        assert!(snapshot.is_healthy());
    }
}
