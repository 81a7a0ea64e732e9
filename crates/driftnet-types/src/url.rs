use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::status::UrlStatus;

/// Retry budget for a single URL before it terminates to Error.
pub const MAX_URL_RETRIES: i32 = 5;

/// Maximum nesting depth for URLs discovered during page parsing
/// (0 = straight from a sitemap).
pub const SITEMAP_MAX_DEPTH: i32 = 3;

/// One URL discovered for a site, tracked through the page work queue.
///
/// Composite identity is `(site_id, url)`. `locked_until` is the soft lease:
/// a worker owns the URL while `status = Processing` and the lease has not
/// expired.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SitemapUrl {
    pub site_id: Uuid,
    pub url: String,
    pub sitemap_source: Option<String>,
    pub lastmod: Option<String>,
    pub priority: Option<f32>,
    pub changefreq: Option<String>,
    pub status: UrlStatus,
    pub discovered_at: DateTime<Utc>,
    pub indexed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub is_xml: bool,
    pub retry_count: i32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub locked_until: Option<DateTime<Utc>>,
    pub depth: i32,
}

/// Per-status breakdown of a site's URL queue.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UrlStats {
    pub pending: i64,
    pub processing: i64,
    pub indexed: i64,
    pub error: i64,
    pub skipped: i64,
    pub total: i64,
}

/// Heuristic for references to nested sitemaps: those are classified Skipped
/// on upsert so the page workers never fetch them as content.
pub fn is_xml_url(url: &str) -> bool {
    let path = url
        .split('?')
        .next()
        .unwrap_or(url)
        .split('#')
        .next()
        .unwrap_or(url)
        .to_lowercase();

    path.ends_with(".xml")
        || path.ends_with(".xml.gz")
        || path.ends_with("/sitemap")
        || path.contains("/sitemap/")
        || path
            .rsplit('/')
            .next()
            .map(|seg| seg.starts_with("sitemap"))
            .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_xml_urls_are_recognized() {
        assert!(is_xml_url("https://x.example/sitemap.xml"));
        assert!(is_xml_url("https://x.example/sitemap_index.xml"));
        assert!(is_xml_url("https://x.example/news.XML"));
        assert!(is_xml_url("https://x.example/sitemap.xml.gz"));
        assert!(is_xml_url("https://x.example/sitemap/2024-01"));
        assert!(is_xml_url("https://x.example/sitemap"));
        assert!(is_xml_url("https://x.example/sitemap.xml?page=2"));
    }

    #[test]
    fn test_content_urls_are_not_xml() {
        assert!(!is_xml_url("https://x.example/films/matrix-1999"));
        assert!(!is_xml_url("https://x.example/anime/naruto.html"));
        assert!(!is_xml_url("https://x.example/xml-tutorial"));
        assert!(!is_xml_url("https://x.example/"));
    }

    #[test]
    fn test_url_stats_default_is_zeroed() {
        let stats = UrlStats::default();
        assert_eq!(stats.total, 0);
        assert_eq!(stats.pending, 0);
    }
}
