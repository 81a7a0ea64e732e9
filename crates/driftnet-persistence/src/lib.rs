//! PostgreSQL persistence layer for driftnet.
//!
//! Optimistic concurrency is the universal coordination primitive: every
//! document carries a monotonic `version` bumped on each write, and every
//! state-dependent write is a compare-and-set against the expected statuses.
//! A CAS that matches zero rows surfaces as `ConcurrentUpdate`; the winning
//! writer is authoritative and callers drop the losing operation.

pub mod error;
pub mod pages;
pub mod schema;
pub mod sites;
pub mod tasks;
pub mod urls;

pub use error::{PersistenceError, Result};
pub use pages::PageRepository;
pub use schema::ensure_schema;
pub use sites::SiteRepository;
pub use tasks::{PageProgress, ScanTaskRepository};
pub use urls::{SitemapUrlRepository, UpsertOutcome};

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;
use tracing::info;

/// Connect to the document store and bootstrap the schema.
pub async fn connect(database_url: &str) -> Result<PgPool> {
    info!("connecting to document store");
    let pool = PgPoolOptions::new()
        .max_connections(16)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await?;

    ensure_schema(&pool).await?;
    Ok(pool)
}
