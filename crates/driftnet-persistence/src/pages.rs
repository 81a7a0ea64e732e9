//! Extracted-page storage. Append/upsert on `(site_id, url)`; only the page
//! processor writes here.

use driftnet_types::Page;
use sqlx::types::Json;
use sqlx::PgPool;
use tracing::instrument;
use uuid::Uuid;

use crate::error::Result;

#[derive(Clone)]
pub struct PageRepository {
    pool: PgPool,
}

impl PageRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    #[instrument(skip(self, page), fields(site_id = %page.site_id, url = %page.url))]
    pub async fn upsert(&self, page: &Page) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO pages (
                site_id, url, title, year, description, main_text,
                external_ids, player_url, link_texts, http_status, indexed_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (site_id, url) DO UPDATE SET
                title = EXCLUDED.title,
                year = EXCLUDED.year,
                description = EXCLUDED.description,
                main_text = EXCLUDED.main_text,
                external_ids = EXCLUDED.external_ids,
                player_url = EXCLUDED.player_url,
                link_texts = EXCLUDED.link_texts,
                http_status = EXCLUDED.http_status,
                indexed_at = EXCLUDED.indexed_at
            "#,
        )
        .bind(page.site_id)
        .bind(&page.url)
        .bind(&page.title)
        .bind(page.year)
        .bind(&page.description)
        .bind(&page.main_text)
        .bind(Json(&page.external_ids))
        .bind(&page.player_url)
        .bind(Json(&page.link_texts))
        .bind(page.http_status)
        .bind(page.indexed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn count_by_site(&self, site_id: Uuid) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM pages WHERE site_id = $1")
            .bind(site_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}
