//! Wire messages exchanged with the fetch/detect worker fleet.
//!
//! Field names are part of the wire contract and must not change. Every
//! incoming field that a worker may omit carries `#[serde(default)]` so a
//! partial payload still decodes; undecodable payloads are dropped by the
//! consumer loop.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::site::{Cookie, Site, SitemapSourceReport};
use crate::status::{CrawlStrategy, ScannerType, SitemapStatus};

/// Streams carried by the message bus. Durable, at-least-once, consumer-group
/// based.
pub const STREAM_DETECT_TASKS: &str = "detect.tasks";
pub const STREAM_DETECT_RESULTS: &str = "detect.results";
pub const STREAM_SITEMAP_CRAWL_TASKS: &str = "sitemap.crawl.tasks";
pub const STREAM_SITEMAP_URL_BATCHES: &str = "sitemap.url.batches";
pub const STREAM_PAGE_CRAWL_TASKS: &str = "page.crawl.tasks";
pub const STREAM_CRAWL_RESULTS: &str = "crawl.results";
/// Fire-and-forget sink for the downstream violation matcher.
pub const STREAM_VIOLATIONS_REFRESH: &str = "violations.refresh";

/// Ask a detect worker to fingerprint a site.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DetectTask {
    pub id: Uuid,
    pub site_id: Uuid,
    pub domain: String,
}

impl DetectTask {
    pub fn for_site(site: &Site) -> Self {
        Self {
            id: Uuid::new_v4(),
            site_id: site.id,
            domain: site.domain.clone(),
        }
    }
}

/// What the detect worker found out about a site.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DetectResult {
    pub site_id: Uuid,
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub cms: String,
    #[serde(default)]
    pub has_sitemap: bool,
    #[serde(default)]
    pub sitemap_status: SitemapStatus,
    #[serde(default)]
    pub crawl_strategy: CrawlStrategy,
    #[serde(default)]
    pub sitemap_urls: Vec<String>,
    #[serde(default)]
    pub needs_spa: bool,
    #[serde(default)]
    pub cookies: Vec<Cookie>,
    #[serde(default)]
    pub captcha_type: String,
    #[serde(default)]
    pub has_domain_redirect: bool,
    #[serde(default)]
    pub redirect_to_domain: String,
}

/// Site summary embedded into crawl task messages so workers need no store
/// access to start fetching.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SiteRef {
    pub id: Uuid,
    pub domain: String,
    pub scanner_type: ScannerType,
    pub crawl_strategy: CrawlStrategy,
    #[serde(default)]
    pub sitemap_urls: Vec<String>,
    #[serde(default)]
    pub cookies: Vec<Cookie>,
    #[serde(default)]
    pub captcha_type: Option<String>,
}

impl From<&Site> for SiteRef {
    fn from(site: &Site) -> Self {
        Self {
            id: site.id,
            domain: site.domain.clone(),
            scanner_type: site.scanner_type,
            crawl_strategy: site.crawl_strategy,
            sitemap_urls: site.sitemap_sources.iter().map(|s| s.url.clone()).collect(),
            cookies: site.cookies.clone(),
            captcha_type: site.captcha_type.clone(),
        }
    }
}

/// Kick off the sitemap stage of a scan task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SitemapCrawlTask {
    pub task_id: Uuid,
    pub site: SiteRef,
    pub auto_continue: bool,
}

/// Kick off the page stage; the worker leases URLs from the queue itself.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PageCrawlTask {
    pub task_id: Uuid,
    pub site: SiteRef,
    #[serde(default)]
    pub batch_size: u32,
}

/// One URL inside a sitemap batch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SitemapUrlEntry {
    pub url: String,
    #[serde(default)]
    pub lastmod: Option<String>,
    #[serde(default)]
    pub priority: Option<f32>,
    #[serde(default)]
    pub changefreq: Option<String>,
    #[serde(default)]
    pub depth: i32,
}

/// A chunk of URLs streamed out of one sitemap source while the crawl is
/// still running.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SitemapUrlBatch {
    pub site_id: Uuid,
    pub task_id: Uuid,
    pub sitemap_source: String,
    #[serde(default)]
    pub batch_number: u32,
    #[serde(default)]
    pub urls: Vec<SitemapUrlEntry>,
}

/// A URL discovered while parsing a page (depth > 0) or re-reported by a
/// crawler, grouped by source on ingest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParsedUrl {
    pub url: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub lastmod: Option<String>,
    #[serde(default)]
    pub priority: Option<f32>,
    #[serde(default)]
    pub changefreq: Option<String>,
    #[serde(default)]
    pub depth: i32,
}

impl ParsedUrl {
    pub fn entry(&self) -> SitemapUrlEntry {
        SitemapUrlEntry {
            url: self.url.clone(),
            lastmod: self.lastmod.clone(),
            priority: self.priority,
            changefreq: self.changefreq.clone(),
            depth: self.depth,
        }
    }
}

/// Outcome of a sitemap crawl or of one page fetch, reported by the workers.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CrawlResult {
    pub task_id: Uuid,
    pub site_id: Uuid,
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub pages_saved: i64,
    #[serde(default)]
    pub parsed_urls: Vec<ParsedUrl>,
    #[serde(default)]
    pub sitemap_stats: Vec<SitemapSourceReport>,
    #[serde(default)]
    pub new_cookies: Vec<Cookie>,
    #[serde(default)]
    pub is_blocked: bool,
    #[serde(default)]
    pub blocked_count: i64,
    #[serde(default)]
    pub is_domain_expired: bool,
    #[serde(default)]
    pub scan_interval_h: i64,
}

/// Best-effort trigger for the downstream violation matcher. Losing one is
/// acceptable; the daily refresh sweeps up omissions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ViolationsRefresh {
    /// Refresh a single site, or everything when absent.
    #[serde(default)]
    pub site_id: Option<Uuid>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_result_decodes_partial_payload() {
        let raw = format!(r#"{{"site_id":"{}","success":true}}"#, Uuid::new_v4());
        let result: DetectResult = serde_json::from_str(&raw).unwrap();
        assert!(result.success);
        assert!(result.error.is_empty());
        assert!(!result.has_domain_redirect);
        assert_eq!(result.sitemap_status, SitemapStatus::Unknown);
    }

    #[test]
    fn test_crawl_result_wire_field_names() {
        let result = CrawlResult {
            task_id: Uuid::new_v4(),
            site_id: Uuid::new_v4(),
            success: true,
            pages_saved: 3,
            is_blocked: false,
            blocked_count: 0,
            is_domain_expired: false,
            scan_interval_h: 24,
            ..Default::default()
        };
        let json = serde_json::to_value(&result).unwrap();
        for field in [
            "task_id",
            "site_id",
            "success",
            "pages_saved",
            "parsed_urls",
            "sitemap_stats",
            "new_cookies",
            "is_blocked",
            "blocked_count",
            "is_domain_expired",
            "scan_interval_h",
        ] {
            assert!(json.get(field).is_some(), "missing wire field {field}");
        }
    }

    #[test]
    fn test_sitemap_batch_round_trip() {
        let batch = SitemapUrlBatch {
            site_id: Uuid::new_v4(),
            task_id: Uuid::new_v4(),
            sitemap_source: "https://x.example/sitemap.xml".into(),
            batch_number: 2,
            urls: vec![SitemapUrlEntry {
                url: "https://x.example/films/matrix".into(),
                lastmod: Some("2024-01-15".into()),
                priority: Some(0.8),
                changefreq: Some("weekly".into()),
                depth: 0,
            }],
        };
        let json = serde_json::to_string(&batch).unwrap();
        let back: SitemapUrlBatch = serde_json::from_str(&json).unwrap();
        assert_eq!(back.urls.len(), 1);
        assert_eq!(back.urls[0].lastmod.as_deref(), Some("2024-01-15"));
    }

    #[test]
    fn test_site_ref_from_site() {
        let mut site = Site::new("x.example");
        site.sitemap_sources = vec![crate::site::SitemapSource {
            url: "https://x.example/sitemap.xml".into(),
            ..Default::default()
        }];
        let site_ref = SiteRef::from(&site);
        assert_eq!(site_ref.domain, "x.example");
        assert_eq!(site_ref.sitemap_urls.len(), 1);
    }

    #[test]
    fn test_stream_names() {
        assert_eq!(STREAM_DETECT_TASKS, "detect.tasks");
        assert_eq!(STREAM_DETECT_RESULTS, "detect.results");
        assert_eq!(STREAM_SITEMAP_CRAWL_TASKS, "sitemap.crawl.tasks");
        assert_eq!(STREAM_SITEMAP_URL_BATCHES, "sitemap.url.batches");
        assert_eq!(STREAM_PAGE_CRAWL_TASKS, "page.crawl.tasks");
        assert_eq!(STREAM_CRAWL_RESULTS, "crawl.results");
    }
}
