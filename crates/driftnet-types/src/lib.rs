//! Domain types for the driftnet crawl control plane.
//!
//! This crate owns the status algebra (closed enums plus their transition
//! tables), the persisted document models, the wire messages shared with the
//! worker fleet, and the core error kinds. It has no I/O: repositories and
//! the bus live in sibling crates.

pub mod errors;
pub mod messages;
pub mod page;
pub mod site;
pub mod status;
pub mod task;
pub mod url;

pub use errors::{is_permanent_remote_error, StateError, PERMANENT_FAILURE_MARKERS};
pub use messages::{
    CrawlResult, DetectResult, DetectTask, PageCrawlTask, ParsedUrl, SiteRef, SitemapCrawlTask,
    SitemapUrlBatch, SitemapUrlEntry, ViolationsRefresh,
};
pub use page::Page;
pub use site::{Cookie, DetectionUpdate, Site, SitemapSource, SitemapSourceReport};
pub use status::{
    CrawlStrategy, ScannerType, SitemapStatus, SiteStatus, StageStatus, TaskStage, TaskStatus,
    UrlStatus,
};
pub use task::{retry_backoff, ScanTask, StageResult, MAX_TASK_RETRIES};
pub use url::{is_xml_url, SitemapUrl, UrlStats, MAX_URL_RETRIES, SITEMAP_MAX_DEPTH};
