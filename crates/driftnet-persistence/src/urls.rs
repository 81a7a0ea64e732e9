//! Sitemap-URL repository with work-queue semantics: upsert, atomic lease,
//! retry accounting and stale-lease recovery.

use chrono::{Duration, Utc};
use driftnet_types::messages::SitemapUrlEntry;
use driftnet_types::url::{is_xml_url, MAX_URL_RETRIES, SITEMAP_MAX_DEPTH};
use driftnet_types::{SitemapUrl, UrlStats, UrlStatus};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::error::Result;
use crate::sites::parse_status;

/// Counts returned by a batch upsert.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub inserted: u64,
    pub updated: u64,
    /// Entries rejected for exceeding the discovery depth limit.
    pub dropped: u64,
}

#[derive(Clone)]
pub struct SitemapUrlRepository {
    pool: PgPool,
}

impl SitemapUrlRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert newly discovered URLs, refreshing the mutable sitemap fields on
    /// already-known ones. References to nested sitemaps are classified
    /// Skipped on insert so page workers never fetch them.
    #[instrument(skip(self, entries), fields(site_id = %site_id, source, count = entries.len()))]
    pub async fn upsert_batch(
        &self,
        site_id: Uuid,
        source: &str,
        entries: &[SitemapUrlEntry],
    ) -> Result<UpsertOutcome> {
        let now = Utc::now();
        let mut outcome = UpsertOutcome::default();

        for entry in entries {
            if entry.depth > SITEMAP_MAX_DEPTH {
                outcome.dropped += 1;
                continue;
            }

            let xml = is_xml_url(&entry.url);
            let status = if xml {
                UrlStatus::Skipped
            } else {
                UrlStatus::Pending
            };

            let row = sqlx::query(
                r#"
                INSERT INTO sitemap_urls (
                    site_id, url, sitemap_source, lastmod, priority, changefreq,
                    status, discovered_at, is_xml, depth
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                ON CONFLICT (site_id, url) DO UPDATE SET
                    sitemap_source = EXCLUDED.sitemap_source,
                    lastmod = EXCLUDED.lastmod,
                    priority = EXCLUDED.priority,
                    changefreq = EXCLUDED.changefreq
                RETURNING (xmax = 0) AS inserted
                "#,
            )
            .bind(site_id)
            .bind(&entry.url)
            .bind(source)
            .bind(&entry.lastmod)
            .bind(entry.priority)
            .bind(&entry.changefreq)
            .bind(status.as_str())
            .bind(now)
            .bind(xml)
            .bind(entry.depth)
            .fetch_one(&self.pool)
            .await?;

            if row.try_get::<bool, _>("inserted")? {
                outcome.inserted += 1;
            } else {
                outcome.updated += 1;
            }
        }

        debug!(
            inserted = outcome.inserted,
            updated = outcome.updated,
            dropped = outcome.dropped,
            "url batch upserted"
        );
        Ok(outcome)
    }

    /// Lease up to `limit` pending URLs for a worker.
    ///
    /// One statement selects the eligible candidates (pending, retry budget
    /// left, past the retry delay, lease free), locks them and flips them to
    /// Processing with a fresh `locked_until`. `FOR UPDATE SKIP LOCKED`
    /// makes the statement the serialization point between racing leasers;
    /// no two callers can receive the same row.
    #[instrument(skip(self), fields(site_id = %site_id, limit))]
    pub async fn find_pending_and_lock(
        &self,
        site_id: Uuid,
        limit: i64,
        lease: Duration,
        retry_delay: Duration,
    ) -> Result<Vec<SitemapUrl>> {
        let now = Utc::now();
        let rows = sqlx::query(
            r#"
            UPDATE sitemap_urls SET
                status = 'processing',
                locked_until = $3
            WHERE (site_id, url) IN (
                SELECT site_id, url FROM sitemap_urls
                WHERE site_id = $1
                  AND status = 'pending'
                  AND retry_count < $4
                  AND (last_attempt_at IS NULL OR last_attempt_at < $5)
                  AND (locked_until IS NULL OR locked_until < $6)
                ORDER BY discovered_at ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING *
            "#,
        )
        .bind(site_id)
        .bind(limit)
        .bind(now + lease)
        .bind(MAX_URL_RETRIES)
        .bind(now - retry_delay)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(url_from_row).collect()
    }

    /// Terminal success for one URL. Duplicate deliveries are harmless: the
    /// first call wins the `indexed_at` stamp, later calls re-assert the
    /// same terminal state.
    pub async fn mark_indexed(&self, site_id: Uuid, url: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE sitemap_urls SET
                status = 'indexed',
                indexed_at = COALESCE(indexed_at, $3),
                last_error = NULL,
                locked_until = NULL
            WHERE site_id = $1 AND url = $2 AND status <> 'skipped'
            "#,
        )
        .bind(site_id)
        .bind(url)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record a fetch failure: bump the retry counter, release the lease and
    /// re-pend the URL. A follow-up conditional update terminates the URL to
    /// Error once the retry budget is spent.
    pub async fn mark_error(&self, site_id: Uuid, url: &str, message: &str) -> Result<()> {
        let now = Utc::now();

        sqlx::query(
            r#"
            UPDATE sitemap_urls SET
                status = 'pending',
                retry_count = retry_count + 1,
                last_error = $3,
                last_attempt_at = $4,
                locked_until = NULL
            WHERE site_id = $1 AND url = $2 AND status <> 'skipped'
            "#,
        )
        .bind(site_id)
        .bind(url)
        .bind(message)
        .bind(now)
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            UPDATE sitemap_urls SET status = 'error'
            WHERE site_id = $1 AND url = $2 AND status = 'pending' AND retry_count >= $3
            "#,
        )
        .bind(site_id)
        .bind(url)
        .bind(MAX_URL_RETRIES)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Reclaim leases whose deadline passed (worker died mid-batch).
    /// Returns how many URLs went back to Pending.
    pub async fn recover_stale(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE sitemap_urls SET
                status = 'pending',
                locked_until = NULL
            WHERE status = 'processing' AND locked_until < $1
            "#,
        )
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Administrative: give errored URLs a fresh retry budget.
    pub async fn reset_errors_to_pending(&self, site_id: Uuid) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE sitemap_urls SET
                status = 'pending',
                retry_count = 0,
                last_error = NULL
            WHERE site_id = $1 AND status = 'error'
            "#,
        )
        .bind(site_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Administrative: clear the per-URL retry delay so pending URLs become
    /// leasable immediately.
    pub async fn reset_pending_retry_delay(&self, site_id: Uuid) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE sitemap_urls SET last_attempt_at = NULL WHERE site_id = $1 AND status = 'pending'",
        )
        .bind(site_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Administrative: full re-crawl of a site's queue (skipped sitemap
    /// references stay skipped).
    pub async fn reset_all_to_pending(&self, site_id: Uuid) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE sitemap_urls SET
                status = 'pending',
                retry_count = 0,
                last_error = NULL,
                last_attempt_at = NULL,
                locked_until = NULL,
                indexed_at = NULL
            WHERE site_id = $1 AND status <> 'skipped'
            "#,
        )
        .bind(site_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Administrative: drop the remaining backlog of a site.
    pub async fn skip_pending_by_site(&self, site_id: Uuid) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE sitemap_urls SET status = 'skipped', locked_until = NULL WHERE site_id = $1 AND status = 'pending'",
        )
        .bind(site_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn delete_by_site(&self, site_id: Uuid) -> Result<u64> {
        let result = sqlx::query("DELETE FROM sitemap_urls WHERE site_id = $1")
            .bind(site_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Per-status breakdown of a site's queue.
    pub async fn get_stats(&self, site_id: Uuid) -> Result<UrlStats> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM sitemap_urls WHERE site_id = $1 GROUP BY status",
        )
        .bind(site_id)
        .fetch_all(&self.pool)
        .await?;

        let mut stats = UrlStats::default();
        for (status, count) in rows {
            match parse_status::<UrlStatus>("sitemap_urls", status)? {
                UrlStatus::Pending => stats.pending = count,
                UrlStatus::Processing => stats.processing = count,
                UrlStatus::Indexed => stats.indexed = count,
                UrlStatus::Error => stats.error = count,
                UrlStatus::Skipped => stats.skipped = count,
            }
            stats.total += count;
        }
        Ok(stats)
    }
}

fn url_from_row(row: PgRow) -> Result<SitemapUrl> {
    Ok(SitemapUrl {
        site_id: row.try_get("site_id")?,
        url: row.try_get("url")?,
        sitemap_source: row.try_get("sitemap_source")?,
        lastmod: row.try_get("lastmod")?,
        priority: row.try_get("priority")?,
        changefreq: row.try_get("changefreq")?,
        status: parse_status("sitemap_urls", row.try_get::<String, _>("status")?)?,
        discovered_at: row.try_get("discovered_at")?,
        indexed_at: row.try_get("indexed_at")?,
        last_error: row.try_get("last_error")?,
        is_xml: row.try_get("is_xml")?,
        retry_count: row.try_get("retry_count")?,
        last_attempt_at: row.try_get("last_attempt_at")?,
        locked_until: row.try_get("locked_until")?,
        depth: row.try_get("depth")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upsert_outcome_default() {
        let outcome = UpsertOutcome::default();
        assert_eq!(outcome.inserted, 0);
        assert_eq!(outcome.updated, 0);
        assert_eq!(outcome.dropped, 0);
    }

    #[test]
    fn test_depth_limit_is_contractual() {
        // Depth 0 comes straight from a sitemap; 1-3 from page discovery.
        assert_eq!(SITEMAP_MAX_DEPTH, 3);
        assert_eq!(MAX_URL_RETRIES, 5);
    }
}
