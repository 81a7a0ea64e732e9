//! Message-driven result processors.
//!
//! A processor never crashes on a single bad message: undecodable payloads
//! are dropped, lost CAS races are acked (the winning writer is
//! authoritative), and only infrastructure failures leave the message
//! pending for redelivery.

mod crawl;
mod detect;

pub use crawl::{blocked_reason, CrawlResultProcessor, SitemapBatchProcessor};
pub use detect::DetectResultProcessor;

use driftnet_bus::{BusError, Disposition};
use driftnet_persistence::PersistenceError;
use thiserror::Error;
use tracing::warn;

/// Failure of one message-handling pass.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Store(#[from] PersistenceError),

    #[error(transparent)]
    Bus(#[from] BusError),
}

impl PipelineError {
    /// Infrastructure failures are worth a redelivery; everything else is
    /// deterministic and would fail again.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PipelineError::Store(PersistenceError::Database(_))
                | PipelineError::Bus(BusError::Redis(_))
        )
    }
}

/// Map a processing outcome onto a delivery disposition.
pub(crate) fn dispose(stream: &'static str, result: Result<(), PipelineError>) -> Disposition {
    match result {
        Ok(()) => Disposition::Ack,
        Err(err) if err.is_transient() => Disposition::Retry(err.to_string()),
        Err(err) => {
            warn!(stream, error = %err, "non-retryable processing failure, dropping message");
            Disposition::Drop(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use driftnet_types::StateError;

    #[test]
    fn test_concurrent_update_is_not_transient() {
        let err = PipelineError::Store(PersistenceError::State(StateError::ConcurrentUpdate {
            entity: "site",
            id: "x".into(),
        }));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_dispose_maps_ok_to_ack() {
        assert_eq!(dispose("crawl.results", Ok(())), Disposition::Ack);
    }

    #[test]
    fn test_dispose_maps_codec_error_to_drop() {
        let err: BusError = serde_json::from_slice::<i64>(b"not-json").unwrap_err().into();
        match dispose("crawl.results", Err(PipelineError::Bus(err))) {
            Disposition::Drop(_) => {}
            other => panic!("expected drop, got {other:?}"),
        }
    }
}
