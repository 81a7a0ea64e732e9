//! Schema bootstrap: tables, unique keys and secondary indexes.
//!
//! Idempotent `IF NOT EXISTS` statements run once at service start; the
//! index list is part of the persistence contract.

use sqlx::PgPool;
use tracing::info;

use crate::error::Result;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS sites (
        id UUID PRIMARY KEY,
        domain TEXT NOT NULL UNIQUE,
        owner_id UUID,
        status TEXT NOT NULL,
        cms TEXT,
        has_sitemap BOOLEAN NOT NULL DEFAULT FALSE,
        sitemap_status TEXT NOT NULL DEFAULT 'unknown',
        crawl_strategy TEXT NOT NULL DEFAULT 'sitemap',
        sitemap_sources JSONB NOT NULL DEFAULT '[]',
        total_urls BIGINT NOT NULL DEFAULT 0,
        total_pages BIGINT NOT NULL DEFAULT 0,
        last_scan_at TIMESTAMPTZ,
        next_scan_at TIMESTAMPTZ,
        failure_count INTEGER NOT NULL DEFAULT 0,
        scan_interval_hours BIGINT NOT NULL DEFAULT 24,
        scanner_type TEXT NOT NULL DEFAULT 'http',
        captcha_type TEXT,
        cookies JSONB NOT NULL DEFAULT '[]',
        cookies_updated_at TIMESTAMPTZ,
        freeze_reason TEXT,
        moved_to_domain TEXT,
        moved_at TIMESTAMPTZ,
        original_domain TEXT,
        version BIGINT NOT NULL DEFAULT 0,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_sites_status_next_scan ON sites (status, next_scan_at)",
    "CREATE INDEX IF NOT EXISTS idx_sites_status_created ON sites (status, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_sites_owner ON sites (owner_id)",
    r#"
    CREATE TABLE IF NOT EXISTS scan_tasks (
        id UUID PRIMARY KEY,
        site_id UUID NOT NULL,
        domain TEXT NOT NULL,
        status TEXT NOT NULL,
        stage TEXT NOT NULL,
        sitemap_status TEXT NOT NULL DEFAULT 'pending',
        sitemap_total BIGINT NOT NULL DEFAULT 0,
        sitemap_success BIGINT NOT NULL DEFAULT 0,
        sitemap_failed BIGINT NOT NULL DEFAULT 0,
        sitemap_error TEXT,
        sitemap_started_at TIMESTAMPTZ,
        sitemap_finished_at TIMESTAMPTZ,
        page_status TEXT NOT NULL DEFAULT 'pending',
        page_total BIGINT NOT NULL DEFAULT 0,
        page_success BIGINT NOT NULL DEFAULT 0,
        page_failed BIGINT NOT NULL DEFAULT 0,
        page_error TEXT,
        page_started_at TIMESTAMPTZ,
        page_finished_at TIMESTAMPTZ,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        finished_at TIMESTAMPTZ,
        retry_count INTEGER NOT NULL DEFAULT 0,
        next_retry_at TIMESTAMPTZ,
        version BIGINT NOT NULL DEFAULT 0
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_scan_tasks_created ON scan_tasks (created_at DESC)",
    "CREATE INDEX IF NOT EXISTS idx_scan_tasks_site_created ON scan_tasks (site_id, created_at DESC)",
    "CREATE INDEX IF NOT EXISTS idx_scan_tasks_status_created ON scan_tasks (status, created_at DESC)",
    "CREATE INDEX IF NOT EXISTS idx_scan_tasks_site_status ON scan_tasks (site_id, status)",
    "CREATE INDEX IF NOT EXISTS idx_scan_tasks_stage_created ON scan_tasks (stage, created_at DESC)",
    "CREATE INDEX IF NOT EXISTS idx_scan_tasks_status_retry ON scan_tasks (status, next_retry_at)",
    // One active task per site, enforced by the store rather than by the
    // best-effort has_active_task gate alone.
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_scan_tasks_one_active ON scan_tasks (site_id) WHERE status IN ('pending', 'processing')",
    r#"
    CREATE TABLE IF NOT EXISTS sitemap_urls (
        site_id UUID NOT NULL,
        url TEXT NOT NULL,
        sitemap_source TEXT,
        lastmod TEXT,
        priority REAL,
        changefreq TEXT,
        status TEXT NOT NULL DEFAULT 'pending',
        discovered_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        indexed_at TIMESTAMPTZ,
        last_error TEXT,
        is_xml BOOLEAN NOT NULL DEFAULT FALSE,
        retry_count INTEGER NOT NULL DEFAULT 0,
        last_attempt_at TIMESTAMPTZ,
        locked_until TIMESTAMPTZ,
        depth INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (site_id, url)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_sitemap_urls_site_status_discovered ON sitemap_urls (site_id, status, discovered_at)",
    "CREATE INDEX IF NOT EXISTS idx_sitemap_urls_site_status_retry ON sitemap_urls (site_id, status, retry_count, last_attempt_at)",
    "CREATE INDEX IF NOT EXISTS idx_sitemap_urls_source ON sitemap_urls (sitemap_source)",
    r#"
    CREATE TABLE IF NOT EXISTS pages (
        site_id UUID NOT NULL,
        url TEXT NOT NULL,
        title TEXT,
        year INTEGER,
        description TEXT,
        main_text TEXT,
        external_ids JSONB NOT NULL DEFAULT '{}',
        player_url TEXT,
        link_texts JSONB NOT NULL DEFAULT '[]',
        http_status INTEGER,
        indexed_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        PRIMARY KEY (site_id, url)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_pages_external_ids ON pages USING gin (external_ids)",
];

/// Create tables and indexes if missing. Safe to run on every start.
pub async fn ensure_schema(pool: &PgPool) -> Result<()> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    info!(statements = SCHEMA.len(), "database schema ensured");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_carries_contractual_keys() {
        let all = SCHEMA.join("\n");
        // Unique keys.
        assert!(all.contains("domain TEXT NOT NULL UNIQUE"));
        assert!(all.contains("PRIMARY KEY (site_id, url)"));
        // Work-queue and scheduler indexes.
        assert!(all.contains("idx_sites_status_next_scan"));
        assert!(all.contains("idx_sitemap_urls_site_status_discovered"));
        assert!(all.contains("idx_scan_tasks_status_retry"));
        assert!(all.contains("idx_scan_tasks_one_active"));
        assert!(all.contains("USING gin (external_ids)"));
    }
}
