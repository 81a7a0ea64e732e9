//! Crawl orchestration engine.
//!
//! Consumes detect and crawl results off the bus, drives the site and task
//! state machines through CAS writes, schedules due sites, and recovers work
//! lost to crashed workers. All coordination happens through the document
//! store and the message streams; processors share no in-process state.

pub mod config;
pub mod metrics;
pub mod processors;
pub mod progress;
pub mod publisher;
pub mod recovery;
pub mod scheduler;
pub mod service;

pub use config::{CrawlTunables, JobCadence, OrchestratorConfig};
pub use metrics::{MetricsSnapshot, OrchestratorMetrics};
pub use processors::{
    blocked_reason, CrawlResultProcessor, DetectResultProcessor, PipelineError,
    SitemapBatchProcessor,
};
pub use progress::{poll_until_stable, TaskProgress};
pub use publisher::Publisher;
pub use recovery::Recovery;
pub use scheduler::Scheduler;
pub use service::OrchestratorService;
