//! Site repository: every state-dependent write is a compare-and-set against
//! the expected source statuses, and every write bumps `version`.

use chrono::{Duration, Utc};
use driftnet_types::site::DEFAULT_SCAN_INTERVAL_HOURS;
use driftnet_types::{
    Cookie, DetectionUpdate, Site, SitemapSource, SitemapSourceReport, SiteStatus,
};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use std::str::FromStr;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::error::{map_insert_error, PersistenceError, Result};

/// Source states a crawl-outcome write may move away from.
const SCANNABLE: &[&str] = &["active", "down"];
/// Source states a freeze or domain move may interrupt.
const INTERRUPTIBLE: &[&str] = &["pending", "active", "down"];

/// Attempts for the optimistic merge of sitemap stats.
const MERGE_ATTEMPTS: usize = 3;

#[derive(Clone)]
pub struct SiteRepository {
    pool: PgPool,
}

impl SiteRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    #[instrument(skip(self, site), fields(domain = %site.domain))]
    pub async fn create(&self, site: &Site) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sites (
                id, domain, owner_id, status, cms, has_sitemap, sitemap_status,
                crawl_strategy, sitemap_sources, total_urls, total_pages,
                last_scan_at, next_scan_at, failure_count, scan_interval_hours,
                scanner_type, captcha_type, cookies, cookies_updated_at,
                freeze_reason, moved_to_domain, moved_at, original_domain,
                version, created_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14,
                $15, $16, $17, $18, $19, $20, $21, $22, $23, $24, $25
            )
            "#,
        )
        .bind(site.id)
        .bind(&site.domain)
        .bind(site.owner_id)
        .bind(site.status.as_str())
        .bind(&site.cms)
        .bind(site.has_sitemap)
        .bind(site.sitemap_status.as_str())
        .bind(site.crawl_strategy.as_str())
        .bind(Json(&site.sitemap_sources))
        .bind(site.total_urls)
        .bind(site.total_pages)
        .bind(site.last_scan_at)
        .bind(site.next_scan_at)
        .bind(site.failure_count)
        .bind(site.scan_interval_hours)
        .bind(site.scanner_type.as_str())
        .bind(&site.captcha_type)
        .bind(Json(&site.cookies))
        .bind(site.cookies_updated_at)
        .bind(&site.freeze_reason)
        .bind(&site.moved_to_domain)
        .bind(site.moved_at)
        .bind(&site.original_domain)
        .bind(site.version)
        .bind(site.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_insert_error(e, &site.domain))?;

        debug!(site_id = %site.id, "site created");
        Ok(())
    }

    pub async fn find_by_id(&self, id: Uuid) -> Result<Option<Site>> {
        let row = sqlx::query("SELECT * FROM sites WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(site_from_row).transpose()
    }

    pub async fn find_by_domain(&self, domain: &str) -> Result<Option<Site>> {
        let row = sqlx::query("SELECT * FROM sites WHERE domain = $1")
            .bind(domain)
            .fetch_optional(&self.pool)
            .await?;
        row.map(site_from_row).transpose()
    }

    /// Apply a successful detection. CAS against Pending; the site enters the
    /// scan rotation immediately.
    #[instrument(skip(self, update), fields(site_id = %id))]
    pub async fn update_from_detection(&self, id: Uuid, update: &DetectionUpdate) -> Result<()> {
        let now = Utc::now();
        let cookies_stamp = (!update.cookies.is_empty()).then_some(now);

        let result = sqlx::query(
            r#"
            UPDATE sites SET
                status = 'active',
                cms = $2,
                has_sitemap = $3,
                sitemap_status = $4,
                crawl_strategy = $5,
                sitemap_sources = $6,
                scanner_type = $7,
                captcha_type = $8,
                cookies = $9,
                cookies_updated_at = COALESCE($10, cookies_updated_at),
                freeze_reason = NULL,
                failure_count = 0,
                next_scan_at = $11,
                version = version + 1
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(id)
        .bind(&update.cms)
        .bind(update.has_sitemap)
        .bind(update.sitemap_status.as_str())
        .bind(update.crawl_strategy.as_str())
        .bind(Json(update.sources()))
        .bind(update.scanner_type.as_str())
        .bind(&update.captcha_type)
        .bind(Json(&update.cookies))
        .bind(cookies_stamp)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(PersistenceError::concurrent("site", id));
        }
        Ok(())
    }

    /// Terminal domain move. Preserves the first domain in a redirect chain.
    #[instrument(skip(self), fields(site_id = %id, to = %to_domain))]
    pub async fn mark_moved(&self, id: Uuid, to_domain: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE sites SET
                status = 'moved',
                moved_to_domain = $2,
                moved_at = $3,
                original_domain = COALESCE(original_domain, domain),
                version = version + 1
            WHERE id = $1 AND status = ANY($4)
            "#,
        )
        .bind(id)
        .bind(to_domain)
        .bind(Utc::now())
        .bind(INTERRUPTIBLE)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(PersistenceError::concurrent("site", id));
        }
        Ok(())
    }

    /// Take the site out of rotation after a remote block or a permanent
    /// detection failure. Requires an administrative unfreeze.
    #[instrument(skip(self), fields(site_id = %id))]
    pub async fn mark_frozen(&self, id: Uuid, reason: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE sites SET
                status = 'frozen',
                freeze_reason = $2,
                version = version + 1
            WHERE id = $1 AND status = ANY($3)
            "#,
        )
        .bind(id)
        .bind(reason)
        .bind(INTERRUPTIBLE)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(PersistenceError::concurrent("site", id));
        }
        Ok(())
    }

    /// Administrative: frozen site back to detection.
    pub async fn unfreeze(&self, id: Uuid) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE sites SET
                status = 'pending',
                freeze_reason = NULL,
                failure_count = 0,
                version = version + 1
            WHERE id = $1 AND status = 'frozen'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(PersistenceError::concurrent("site", id));
        }
        Ok(())
    }

    /// Administrative: dead site back to detection.
    pub async fn revive(&self, id: Uuid) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE sites SET
                status = 'pending',
                failure_count = 0,
                version = version + 1
            WHERE id = $1 AND status = 'dead'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(PersistenceError::concurrent("site", id));
        }
        Ok(())
    }

    /// Successful crawl: reset the failure budget and schedule the next scan
    /// no sooner than the default interval.
    #[instrument(skip(self), fields(site_id = %id))]
    pub async fn mark_success(&self, id: Uuid, scan_interval_h: i64) -> Result<()> {
        let now = Utc::now();
        let interval = scan_interval_h.max(DEFAULT_SCAN_INTERVAL_HOURS);
        let next_scan = now + Duration::hours(interval);

        let result = sqlx::query(
            r#"
            UPDATE sites SET
                status = 'active',
                failure_count = 0,
                last_scan_at = $2,
                next_scan_at = $3,
                version = version + 1
            WHERE id = $1 AND status = ANY($4)
            "#,
        )
        .bind(id)
        .bind(now)
        .bind(next_scan)
        .bind(SCANNABLE)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(PersistenceError::concurrent("site", id));
        }
        Ok(())
    }

    /// Failed crawl: one conditional statement increments the failure counter
    /// and flips the site to Dead at the threshold, so a racing mark_success
    /// can never leave a half-applied counter.
    ///
    /// Returns the post-increment counter and status.
    #[instrument(skip(self), fields(site_id = %id))]
    pub async fn mark_failure(
        &self,
        id: Uuid,
        dead_threshold: i32,
        cooldown: Duration,
    ) -> Result<(i32, SiteStatus)> {
        let now = Utc::now();

        let row = sqlx::query(
            r#"
            UPDATE sites SET
                failure_count = failure_count + 1,
                status = CASE WHEN failure_count + 1 >= $2 THEN 'dead' ELSE 'down' END,
                last_scan_at = $3,
                next_scan_at = CASE WHEN failure_count + 1 >= $2 THEN next_scan_at ELSE $4 END,
                version = version + 1
            WHERE id = $1 AND status = ANY($5)
            RETURNING failure_count, status
            "#,
        )
        .bind(id)
        .bind(dead_threshold)
        .bind(now)
        .bind(now + cooldown)
        .bind(SCANNABLE)
        .fetch_optional(&self.pool)
        .await?;

        let row = row.ok_or_else(|| PersistenceError::concurrent("site", id))?;
        let count: i32 = row.try_get("failure_count")?;
        let status = parse_status::<SiteStatus>("sites", row.try_get::<String, _>("status")?)?;
        Ok((count, status))
    }

    /// Domain no longer registered: straight to Dead.
    pub async fn mark_dead(&self, id: Uuid, reason: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE sites SET
                status = 'dead',
                freeze_reason = $2,
                last_scan_at = $3,
                version = version + 1
            WHERE id = $1 AND status = ANY($4)
            "#,
        )
        .bind(id)
        .bind(reason)
        .bind(Utc::now())
        .bind(SCANNABLE)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(PersistenceError::concurrent("site", id));
        }
        Ok(())
    }

    /// Transient detection failure: bump the counter, freeze at the limit.
    /// Returns the post-increment counter and status so the caller can cancel
    /// tasks when the freeze landed.
    #[instrument(skip(self, error), fields(site_id = %id))]
    pub async fn record_detect_failure(
        &self,
        id: Uuid,
        max_failures: i32,
        error: &str,
    ) -> Result<(i32, SiteStatus)> {
        let reason = format!("detection failed after {max_failures} retries: {error}");

        let row = sqlx::query(
            r#"
            UPDATE sites SET
                failure_count = failure_count + 1,
                status = CASE WHEN failure_count + 1 >= $2 THEN 'frozen' ELSE status END,
                freeze_reason = CASE WHEN failure_count + 1 >= $2 THEN $3 ELSE freeze_reason END,
                version = version + 1
            WHERE id = $1 AND status = 'pending'
            RETURNING failure_count, status
            "#,
        )
        .bind(id)
        .bind(max_failures)
        .bind(&reason)
        .fetch_optional(&self.pool)
        .await?;

        let row = row.ok_or_else(|| PersistenceError::concurrent("site", id))?;
        let count: i32 = row.try_get("failure_count")?;
        let status = parse_status::<SiteStatus>("sites", row.try_get::<String, _>("status")?)?;
        Ok((count, status))
    }

    /// Guard against re-picking while a scan is in flight.
    pub async fn mark_queued(&self, id: Uuid, hold: Duration) -> Result<()> {
        sqlx::query(
            "UPDATE sites SET next_scan_at = $2, version = version + 1 WHERE id = $1",
        )
        .bind(id)
        .bind(Utc::now() + hold)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update_cookies(&self, id: Uuid, cookies: &[Cookie]) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE sites SET
                cookies = $2,
                cookies_updated_at = $3,
                version = version + 1
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(Json(cookies))
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Merge freshly reported per-source sitemap stats. Optimistic loop on
    /// `version`; a handful of attempts is plenty because contention on one
    /// site's stats is rare.
    #[instrument(skip(self, reports), fields(site_id = %id))]
    pub async fn update_sitemap_stats(
        &self,
        id: Uuid,
        reports: &[SitemapSourceReport],
    ) -> Result<()> {
        let now = Utc::now();

        for _ in 0..MERGE_ATTEMPTS {
            let Some(site) = self.find_by_id(id).await? else {
                return Err(PersistenceError::concurrent("site", id));
            };

            let mut sources: Vec<SitemapSource> = site.sitemap_sources;
            driftnet_types::site::merge_sitemap_stats(&mut sources, reports, now);
            let total_urls: i64 = sources.iter().map(|s| s.urls_found).sum();

            let result = sqlx::query(
                r#"
                UPDATE sites SET
                    sitemap_sources = $2,
                    total_urls = $3,
                    version = version + 1
                WHERE id = $1 AND version = $4
                "#,
            )
            .bind(id)
            .bind(Json(&sources))
            .bind(total_urls)
            .bind(site.version)
            .execute(&self.pool)
            .await?;

            if result.rows_affected() > 0 {
                return Ok(());
            }
            warn!(site_id = %id, "sitemap stats merge raced, retrying");
        }

        Err(PersistenceError::concurrent("site", id))
    }

    /// Refresh the running totals from queue and page counts.
    pub async fn update_totals(&self, id: Uuid, total_urls: i64, total_pages: i64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE sites SET
                total_urls = $2,
                total_pages = $3,
                version = version + 1
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(total_urls)
        .bind(total_pages)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Scannable sites whose next scan is due, oldest first.
    pub async fn find_due(&self, limit: i64) -> Result<Vec<Site>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM sites
            WHERE status = ANY($1) AND next_scan_at IS NOT NULL AND next_scan_at <= $2
            ORDER BY next_scan_at ASC
            LIMIT $3
            "#,
        )
        .bind(SCANNABLE)
        .bind(Utc::now())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(site_from_row).collect()
    }

    /// Pending sites whose detection never came back.
    pub async fn find_stuck_pending(&self, older_than: Duration) -> Result<Vec<Site>> {
        let cutoff = Utc::now() - older_than;
        let rows = sqlx::query(
            "SELECT * FROM sites WHERE status = 'pending' AND created_at < $1 ORDER BY created_at ASC",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(site_from_row).collect()
    }
}

pub(crate) fn parse_status<T>(table: &'static str, raw: String) -> Result<T>
where
    T: FromStr<Err = driftnet_types::StateError>,
{
    raw.parse().map_err(|_| PersistenceError::CorruptRow {
        table,
        reason: format!("unknown status tag: {raw}"),
    })
}

fn site_from_row(row: PgRow) -> Result<Site> {
    Ok(Site {
        id: row.try_get("id")?,
        domain: row.try_get("domain")?,
        owner_id: row.try_get("owner_id")?,
        status: parse_status("sites", row.try_get::<String, _>("status")?)?,
        cms: row.try_get("cms")?,
        has_sitemap: row.try_get("has_sitemap")?,
        sitemap_status: parse_status("sites", row.try_get::<String, _>("sitemap_status")?)?,
        crawl_strategy: parse_status("sites", row.try_get::<String, _>("crawl_strategy")?)?,
        sitemap_sources: row
            .try_get::<Json<Vec<SitemapSource>>, _>("sitemap_sources")?
            .0,
        total_urls: row.try_get("total_urls")?,
        total_pages: row.try_get("total_pages")?,
        last_scan_at: row.try_get("last_scan_at")?,
        next_scan_at: row.try_get("next_scan_at")?,
        failure_count: row.try_get("failure_count")?,
        scan_interval_hours: row.try_get("scan_interval_hours")?,
        scanner_type: parse_status("sites", row.try_get::<String, _>("scanner_type")?)?,
        captcha_type: row.try_get("captcha_type")?,
        cookies: row.try_get::<Json<Vec<Cookie>>, _>("cookies")?.0,
        cookies_updated_at: row.try_get("cookies_updated_at")?,
        freeze_reason: row.try_get("freeze_reason")?,
        moved_to_domain: row.try_get("moved_to_domain")?,
        moved_at: row.try_get("moved_at")?,
        original_domain: row.try_get("original_domain")?,
        version: row.try_get("version")?,
        created_at: row.try_get("created_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_status_maps_unknown_tags() {
        let ok = parse_status::<SiteStatus>("sites", "frozen".to_string()).unwrap();
        assert_eq!(ok, SiteStatus::Frozen);

        let err = parse_status::<SiteStatus>("sites", "zombie".to_string()).unwrap_err();
        assert!(matches!(err, PersistenceError::CorruptRow { .. }));
    }

    #[test]
    fn test_expected_status_sets() {
        assert!(SCANNABLE.iter().all(|s| {
            s.parse::<SiteStatus>().map(|v| v.is_scannable()).unwrap_or(false)
        }));
        assert!(INTERRUPTIBLE.contains(&"pending"));
        assert!(!INTERRUPTIBLE.contains(&"moved"));
    }
}
