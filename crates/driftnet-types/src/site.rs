use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::status::{CrawlStrategy, ScannerType, SitemapStatus, SiteStatus};

/// Default scan interval for a freshly detected site, in hours.
pub const DEFAULT_SCAN_INTERVAL_HOURS: i64 = 24;

/// One cookie captured by the fetch workers, replayed on later requests.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub path: String,
}

/// Per-source sitemap statistics, refreshed after every sitemap crawl.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SitemapSource {
    pub url: String,
    #[serde(default)]
    pub urls_found: i64,
    #[serde(default)]
    pub last_parsed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
}

/// An observed third-party domain and everything the control plane knows
/// about it. Identity is the globally-unique `domain`; every write bumps
/// `version`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Site {
    pub id: Uuid,
    pub domain: String,
    pub owner_id: Option<Uuid>,
    pub status: SiteStatus,
    pub cms: Option<String>,
    pub has_sitemap: bool,
    pub sitemap_status: SitemapStatus,
    pub crawl_strategy: CrawlStrategy,
    pub sitemap_sources: Vec<SitemapSource>,
    pub total_urls: i64,
    pub total_pages: i64,
    pub last_scan_at: Option<DateTime<Utc>>,
    pub next_scan_at: Option<DateTime<Utc>>,
    pub failure_count: i32,
    pub scan_interval_hours: i64,
    pub scanner_type: ScannerType,
    pub captcha_type: Option<String>,
    pub cookies: Vec<Cookie>,
    pub cookies_updated_at: Option<DateTime<Utc>>,
    pub freeze_reason: Option<String>,
    pub moved_to_domain: Option<String>,
    pub moved_at: Option<DateTime<Utc>>,
    pub original_domain: Option<String>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
}

impl Site {
    /// New site awaiting detection.
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            domain: domain.into(),
            owner_id: None,
            status: SiteStatus::Pending,
            cms: None,
            has_sitemap: false,
            sitemap_status: SitemapStatus::Unknown,
            crawl_strategy: CrawlStrategy::default(),
            sitemap_sources: Vec::new(),
            total_urls: 0,
            total_pages: 0,
            last_scan_at: None,
            next_scan_at: None,
            failure_count: 0,
            scan_interval_hours: DEFAULT_SCAN_INTERVAL_HOURS,
            scanner_type: ScannerType::default(),
            captcha_type: None,
            cookies: Vec::new(),
            cookies_updated_at: None,
            freeze_reason: None,
            moved_to_domain: None,
            moved_at: None,
            original_domain: None,
            version: 0,
            created_at: Utc::now(),
        }
    }

    /// Successor site created when `from` redirected to a new domain.
    ///
    /// Carries over the scan interval and keeps the chain's original domain
    /// so the history stays traceable across any number of hops.
    pub fn successor_of(from: &Site, new_domain: impl Into<String>) -> Self {
        let mut site = Site::new(new_domain);
        site.owner_id = from.owner_id;
        site.scan_interval_hours = from.scan_interval_hours;
        site.original_domain = Some(
            from.original_domain
                .clone()
                .unwrap_or_else(|| from.domain.clone()),
        );
        site
    }

    pub fn is_scannable(&self) -> bool {
        self.status.is_scannable()
    }
}

/// Fields written by a successful detection, applied with a CAS against
/// `Pending`.
#[derive(Debug, Clone, Default)]
pub struct DetectionUpdate {
    pub cms: Option<String>,
    pub has_sitemap: bool,
    pub sitemap_status: SitemapStatus,
    pub crawl_strategy: CrawlStrategy,
    pub sitemap_urls: Vec<String>,
    pub scanner_type: ScannerType,
    pub captcha_type: Option<String>,
    pub cookies: Vec<Cookie>,
}

impl DetectionUpdate {
    /// Seed sitemap sources from the detected sitemap URLs, stats zeroed.
    pub fn sources(&self) -> Vec<SitemapSource> {
        self.sitemap_urls
            .iter()
            .map(|url| SitemapSource {
                url: url.clone(),
                ..Default::default()
            })
            .collect()
    }
}

/// Merge freshly reported per-source stats into the stored source list.
///
/// Sources already on the site are updated in place; previously unseen
/// sources are appended. A report with an error keeps the last good
/// `urls_found` counter.
pub fn merge_sitemap_stats(
    existing: &mut Vec<SitemapSource>,
    reports: &[SitemapSourceReport],
    now: DateTime<Utc>,
) {
    for report in reports {
        match existing.iter_mut().find(|s| s.url == report.url) {
            Some(source) => {
                if report.error.is_none() {
                    source.urls_found = report.urls_found;
                }
                source.last_parsed_at = Some(now);
                source.last_error = report.error.clone();
            }
            None => existing.push(SitemapSource {
                url: report.url.clone(),
                urls_found: if report.error.is_none() {
                    report.urls_found
                } else {
                    0
                },
                last_parsed_at: Some(now),
                last_error: report.error.clone(),
            }),
        }
    }
}

/// One sitemap source as reported back by a crawl worker.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SitemapSourceReport {
    pub url: String,
    #[serde(default)]
    pub urls_found: i64,
    #[serde(default)]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_site_defaults() {
        let site = Site::new("x.example");
        assert_eq!(site.status, SiteStatus::Pending);
        assert_eq!(site.failure_count, 0);
        assert_eq!(site.scan_interval_hours, DEFAULT_SCAN_INTERVAL_HOURS);
        assert_eq!(site.version, 0);
        assert!(site.sitemap_sources.is_empty());
        assert!(site.next_scan_at.is_none());
    }

    #[test]
    fn test_successor_carries_chain_origin() {
        let mut first = Site::new("x.example");
        first.scan_interval_hours = 48;

        let second = Site::successor_of(&first, "y.example");
        assert_eq!(second.domain, "y.example");
        assert_eq!(second.original_domain.as_deref(), Some("x.example"));
        assert_eq!(second.scan_interval_hours, 48);
        assert_eq!(second.status, SiteStatus::Pending);

        // A second hop keeps pointing at the first domain in the chain.
        let third = Site::successor_of(&second, "z.example");
        assert_eq!(third.original_domain.as_deref(), Some("x.example"));
    }

    #[test]
    fn test_merge_sitemap_stats_updates_and_appends() {
        let now = Utc::now();
        let mut sources = vec![SitemapSource {
            url: "https://x.example/sitemap.xml".into(),
            urls_found: 10,
            last_parsed_at: None,
            last_error: None,
        }];

        merge_sitemap_stats(
            &mut sources,
            &[
                SitemapSourceReport {
                    url: "https://x.example/sitemap.xml".into(),
                    urls_found: 25,
                    error: None,
                },
                SitemapSourceReport {
                    url: "https://x.example/news.xml".into(),
                    urls_found: 7,
                    error: None,
                },
            ],
            now,
        );

        assert_eq!(sources.len(), 2);
        assert_eq!(sources[0].urls_found, 25);
        assert_eq!(sources[0].last_parsed_at, Some(now));
        assert_eq!(sources[1].url, "https://x.example/news.xml");
        assert_eq!(sources[1].urls_found, 7);
    }

    #[test]
    fn test_merge_sitemap_stats_keeps_counter_on_error() {
        let now = Utc::now();
        let mut sources = vec![SitemapSource {
            url: "https://x.example/sitemap.xml".into(),
            urls_found: 42,
            last_parsed_at: None,
            last_error: None,
        }];

        merge_sitemap_stats(
            &mut sources,
            &[SitemapSourceReport {
                url: "https://x.example/sitemap.xml".into(),
                urls_found: 0,
                error: Some("HTTP 500".into()),
            }],
            now,
        );

        assert_eq!(sources[0].urls_found, 42);
        assert_eq!(sources[0].last_error.as_deref(), Some("HTTP 500"));
    }

    #[test]
    fn test_detection_update_sources() {
        let update = DetectionUpdate {
            sitemap_urls: vec![
                "https://x.example/sitemap.xml".into(),
                "https://x.example/news.xml".into(),
            ],
            ..Default::default()
        };
        let sources = update.sources();
        assert_eq!(sources.len(), 2);
        assert_eq!(sources[0].urls_found, 0);
    }
}
