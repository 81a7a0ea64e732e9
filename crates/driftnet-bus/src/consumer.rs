//! Consumer loop: drains one stream through a handler with bounded
//! concurrency and at-least-once delivery semantics.
//!
//! Disposition contract: `Ack` on success; `Drop` for poison payloads (acked
//! so they never redeliver); `Retry` for transient infrastructure failures
//! (left unacked, redelivered once the idle threshold passes).

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::stream::{Delivery, MessageBus};

/// What to do with a delivery after handling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Handled; remove from the pending list.
    Ack,
    /// Poison message; ack and forget.
    Drop(String),
    /// Transient failure; leave pending for redelivery.
    Retry(String),
}

/// A message handler bound to one stream.
#[async_trait]
pub trait StreamHandler: Send + Sync {
    /// Stream this handler consumes.
    fn stream(&self) -> &'static str;

    /// Short name used in consumer ids and logs.
    fn name(&self) -> &'static str;

    /// Process one payload. Must not panic on malformed input; decode
    /// failures are a `Drop`, store races are an `Ack` (the winner is
    /// authoritative), infrastructure errors are a `Retry`.
    async fn handle(&self, payload: &[u8]) -> Disposition;
}

/// Tuning for one consumer loop.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Consumer-group name shared by all orchestrator replicas.
    pub group: String,
    /// This process's consumer name within the group.
    pub consumer: String,
    /// Max messages per read.
    pub batch_size: usize,
    /// Blocking read timeout.
    pub block_ms: u64,
    /// Idle time before an unacked delivery is stolen from its consumer.
    pub claim_min_idle_ms: u64,
    /// Concurrent handler invocations.
    pub max_concurrency: usize,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            group: "driftnet".to_string(),
            consumer: format!("orchestrator-{}", std::process::id()),
            batch_size: 16,
            block_ms: 5_000,
            claim_min_idle_ms: 60_000,
            max_concurrency: 8,
        }
    }
}

/// Runs a `StreamHandler` against its stream until stopped.
pub struct ConsumerLoop {
    bus: MessageBus,
    handler: Arc<dyn StreamHandler>,
    config: ConsumerConfig,
    running: Arc<AtomicBool>,
    semaphore: Arc<Semaphore>,
}

impl ConsumerLoop {
    pub fn new(bus: MessageBus, handler: Arc<dyn StreamHandler>, config: ConsumerConfig) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrency));
        Self {
            bus,
            handler,
            config,
            running: Arc::new(AtomicBool::new(false)),
            semaphore,
        }
    }

    pub async fn run(&self) -> Result<()> {
        let stream = self.handler.stream();
        let group = &self.config.group;

        self.bus.ensure_group(stream, group).await?;
        self.running.store(true, Ordering::Relaxed);
        info!(
            stream,
            group,
            handler = self.handler.name(),
            "consumer loop started"
        );

        while self.running.load(Ordering::Relaxed) {
            // Abandoned deliveries first, then fresh ones.
            let claimed = match self
                .bus
                .claim_abandoned(
                    stream,
                    group,
                    &self.config.consumer,
                    self.config.claim_min_idle_ms,
                    self.config.batch_size,
                )
                .await
            {
                Ok(deliveries) => deliveries,
                Err(err) => {
                    warn!(stream, error = %err, "failed to claim abandoned deliveries");
                    Vec::new()
                }
            };

            let fresh = match self
                .bus
                .read_group(
                    stream,
                    group,
                    &self.config.consumer,
                    self.config.batch_size,
                    self.config.block_ms,
                )
                .await
            {
                Ok(deliveries) => deliveries,
                Err(err) => {
                    error!(stream, error = %err, "stream read failed");
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                    continue;
                }
            };

            for delivery in claimed.into_iter().chain(fresh) {
                self.dispatch(delivery).await;
            }
        }

        info!(stream, handler = self.handler.name(), "consumer loop stopped");
        Ok(())
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    async fn dispatch(&self, delivery: Delivery) {
        let permit = match self.semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return, // semaphore closed during shutdown
        };

        let bus = self.bus.clone();
        let handler = self.handler.clone();
        let stream = self.handler.stream();
        let group = self.config.group.clone();

        tokio::spawn(async move {
            let _permit = permit;
            let outcome = handler.handle(&delivery.payload).await;

            match outcome {
                Disposition::Ack => {
                    if let Err(err) = bus.ack(stream, &group, &delivery.id).await {
                        warn!(stream, entry_id = %delivery.id, error = %err, "ack failed");
                    }
                }
                Disposition::Drop(reason) => {
                    warn!(
                        stream,
                        entry_id = %delivery.id,
                        reason,
                        "dropping undecodable message"
                    );
                    if let Err(err) = bus.ack(stream, &group, &delivery.id).await {
                        warn!(stream, entry_id = %delivery.id, error = %err, "ack failed");
                    }
                }
                Disposition::Retry(reason) => {
                    debug!(
                        stream,
                        entry_id = %delivery.id,
                        reason,
                        "leaving message pending for redelivery"
                    );
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consumer_config_defaults() {
        let config = ConsumerConfig::default();
        assert_eq!(config.group, "driftnet");
        assert!(config.consumer.starts_with("orchestrator-"));
        assert_eq!(config.batch_size, 16);
        assert_eq!(config.claim_min_idle_ms, 60_000);
        assert!(config.max_concurrency > 0);
    }

    #[test]
    fn test_dispositions_compare() {
        assert_eq!(Disposition::Ack, Disposition::Ack);
        assert_ne!(
            Disposition::Drop("a".into()),
            Disposition::Retry("a".into())
        );
    }
}
