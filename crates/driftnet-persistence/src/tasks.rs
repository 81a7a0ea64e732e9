//! Scan-task repository: the two-stage lifecycle with idempotent stage
//! completion, atomic progress counters and retry accounting.
//!
//! Stage results are flattened to columns so `increment_page_progress` is a
//! plain SQL increment that terminal writes never overwrite: completion and
//! failure only touch status, error and finished_at.

use chrono::{Duration, Utc};
use driftnet_types::{ScanTask, StageResult};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::error::{PersistenceError, Result};
use crate::sites::parse_status;

/// Statuses a cancel or stale-failure may interrupt.
const ACTIVE: &[&str] = &["pending", "processing"];

/// Retry window computed in SQL from the row's own attempt count:
/// exponential from 30 s, capped at one hour. Mirrors
/// `driftnet_types::retry_backoff`.
const NEXT_RETRY_SQL: &str =
    "make_interval(secs => LEAST(3600, 30 * power(2, LEAST(retry_count, 20))))";

/// Post-increment snapshot of the page-stage counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageProgress {
    pub success: i64,
    pub failed: i64,
    pub total: i64,
}

impl PageProgress {
    /// Every accounted URL has reported back.
    pub fn is_complete(&self) -> bool {
        self.total > 0 && self.success + self.failed >= self.total
    }
}

#[derive(Clone)]
pub struct ScanTaskRepository {
    pool: PgPool,
}

impl ScanTaskRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Start a fresh task at the sitemap stage.
    #[instrument(skip(self), fields(site_id = %site_id))]
    pub async fn create(&self, site_id: Uuid, domain: &str) -> Result<ScanTask> {
        let task = ScanTask::new(site_id, domain);
        self.insert(&task).await?;
        Ok(task)
    }

    /// Start a task directly at the page stage against an existing backlog.
    #[instrument(skip(self), fields(site_id = %site_id, pending_urls))]
    pub async fn create_for_page_stage(
        &self,
        site_id: Uuid,
        domain: &str,
        pending_urls: i64,
    ) -> Result<ScanTask> {
        let task = ScanTask::new_for_page_stage(site_id, domain, pending_urls);
        self.insert(&task).await?;
        Ok(task)
    }

    async fn insert(&self, task: &ScanTask) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO scan_tasks (
                id, site_id, domain, status, stage,
                sitemap_status, sitemap_total, sitemap_success, sitemap_failed,
                sitemap_error, sitemap_started_at, sitemap_finished_at,
                page_status, page_total, page_success, page_failed,
                page_error, page_started_at, page_finished_at,
                created_at, finished_at, retry_count, next_retry_at, version
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12,
                $13, $14, $15, $16, $17, $18, $19, $20, $21, $22, $23, $24
            )
            "#,
        )
        .bind(task.id)
        .bind(task.site_id)
        .bind(&task.domain)
        .bind(task.status.as_str())
        .bind(task.stage.as_str())
        .bind(task.sitemap_result.status.as_str())
        .bind(task.sitemap_result.total)
        .bind(task.sitemap_result.success)
        .bind(task.sitemap_result.failed)
        .bind(&task.sitemap_result.error)
        .bind(task.sitemap_result.started_at)
        .bind(task.sitemap_result.finished_at)
        .bind(task.page_result.status.as_str())
        .bind(task.page_result.total)
        .bind(task.page_result.success)
        .bind(task.page_result.failed)
        .bind(&task.page_result.error)
        .bind(task.page_result.started_at)
        .bind(task.page_result.finished_at)
        .bind(task.created_at)
        .bind(task.finished_at)
        .bind(task.retry_count)
        .bind(task.next_retry_at)
        .bind(task.version)
        .execute(&self.pool)
        .await
        .map_err(|err| match &err {
            // The one-active-task-per-site unique gate fired: another writer
            // scheduled a scan first.
            sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some("23505") => {
                PersistenceError::concurrent("scan_task", task.site_id)
            }
            _ => PersistenceError::Database(err),
        })?;

        debug!(task_id = %task.id, stage = %task.stage, "scan task created");
        Ok(())
    }

    pub async fn find_by_id(&self, id: Uuid) -> Result<Option<ScanTask>> {
        let row = sqlx::query("SELECT * FROM scan_tasks WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(task_from_row).transpose()
    }

    /// Gate used everywhere before creating a new task for a site.
    pub async fn has_active_task(&self, site_id: Uuid) -> Result<bool> {
        let (exists,): (bool,) = sqlx::query_as(
            "SELECT EXISTS(SELECT 1 FROM scan_tasks WHERE site_id = $1 AND status = ANY($2))",
        )
        .bind(site_id)
        .bind(ACTIVE)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    /// Finish the sitemap stage and advance into the page stage with the
    /// authoritative URL total.
    #[instrument(skip(self), fields(task_id = %id, total))]
    pub async fn complete_sitemap_stage(&self, id: Uuid, total: i64) -> Result<()> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            UPDATE scan_tasks SET
                sitemap_status = 'completed',
                sitemap_total = $2,
                sitemap_success = $2,
                sitemap_finished_at = $3,
                stage = 'page',
                page_status = 'processing',
                page_started_at = $3,
                page_total = $2,
                version = version + 1
            WHERE id = $1 AND status = 'processing' AND stage = 'sitemap'
            "#,
        )
        .bind(id)
        .bind(total)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(PersistenceError::concurrent("scan_task", id));
        }
        Ok(())
    }

    /// Finish the sitemap stage and the task in one step, when there is no
    /// page backlog to continue into.
    #[instrument(skip(self), fields(task_id = %id, total))]
    pub async fn complete_sitemap_stage_only(&self, id: Uuid, total: i64) -> Result<()> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            UPDATE scan_tasks SET
                sitemap_status = 'completed',
                sitemap_total = $2,
                sitemap_success = $2,
                sitemap_finished_at = $3,
                stage = 'done',
                status = 'completed',
                finished_at = $3,
                version = version + 1
            WHERE id = $1 AND status = 'processing' AND stage = 'sitemap'
            "#,
        )
        .bind(id)
        .bind(total)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(PersistenceError::concurrent("scan_task", id));
        }
        Ok(())
    }

    #[instrument(skip(self, error), fields(task_id = %id))]
    pub async fn fail_sitemap_stage(&self, id: Uuid, error: &str) -> Result<()> {
        let now = Utc::now();
        let result = sqlx::query(&format!(
            r#"
            UPDATE scan_tasks SET
                sitemap_status = 'failed',
                sitemap_error = $2,
                sitemap_finished_at = $3,
                status = 'failed',
                finished_at = $3,
                next_retry_at = $3 + {NEXT_RETRY_SQL},
                version = version + 1
            WHERE id = $1 AND status = 'processing' AND stage = 'sitemap'
            "#
        ))
        .bind(id)
        .bind(error)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(PersistenceError::concurrent("scan_task", id));
        }
        Ok(())
    }

    /// Atomic per-URL progress increment. Rejected once the task left the
    /// page stage, so terminal counters never move.
    pub async fn increment_page_progress(&self, id: Uuid, success: bool) -> Result<PageProgress> {
        let (ok, fail) = if success { (1i64, 0i64) } else { (0i64, 1i64) };
        let row = sqlx::query(
            r#"
            UPDATE scan_tasks SET
                page_success = page_success + $2,
                page_failed = page_failed + $3,
                version = version + 1
            WHERE id = $1 AND status = 'processing' AND stage = 'page'
            RETURNING page_success, page_failed, page_total
            "#,
        )
        .bind(id)
        .bind(ok)
        .bind(fail)
        .fetch_optional(&self.pool)
        .await?;

        let row = row.ok_or_else(|| PersistenceError::concurrent("scan_task", id))?;
        Ok(PageProgress {
            success: row.try_get("page_success")?,
            failed: row.try_get("page_failed")?,
            total: row.try_get("page_total")?,
        })
    }

    /// Terminal page-stage success. Only sets status and timestamps; the
    /// accumulated counters stay untouched.
    #[instrument(skip(self), fields(task_id = %id))]
    pub async fn complete_page_stage(&self, id: Uuid) -> Result<()> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            UPDATE scan_tasks SET
                page_status = 'completed',
                page_finished_at = $2,
                stage = 'done',
                status = 'completed',
                finished_at = $2,
                version = version + 1
            WHERE id = $1 AND status = 'processing' AND stage = 'page'
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(PersistenceError::concurrent("scan_task", id));
        }
        Ok(())
    }

    #[instrument(skip(self, error), fields(task_id = %id))]
    pub async fn fail_page_stage(&self, id: Uuid, error: &str) -> Result<()> {
        let now = Utc::now();
        let result = sqlx::query(&format!(
            r#"
            UPDATE scan_tasks SET
                page_status = 'failed',
                page_error = $2,
                page_finished_at = $3,
                status = 'failed',
                finished_at = $3,
                next_retry_at = $3 + {NEXT_RETRY_SQL},
                version = version + 1
            WHERE id = $1 AND status = 'processing' AND stage = 'page'
            "#
        ))
        .bind(id)
        .bind(error)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(PersistenceError::concurrent("scan_task", id));
        }
        Ok(())
    }

    /// Cancel one task if it is still active.
    pub async fn mark_cancelled(&self, id: Uuid) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE scan_tasks SET
                status = 'cancelled',
                finished_at = $2,
                version = version + 1
            WHERE id = $1 AND status = ANY($3)
            "#,
        )
        .bind(id)
        .bind(Utc::now())
        .bind(ACTIVE)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(PersistenceError::concurrent("scan_task", id));
        }
        Ok(())
    }

    /// Bulk cancel; returns how many tasks were actually cancelled.
    pub async fn cancel_many(&self, ids: &[Uuid]) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE scan_tasks SET
                status = 'cancelled',
                finished_at = $2,
                version = version + 1
            WHERE id = ANY($1) AND status = ANY($3)
            "#,
        )
        .bind(ids)
        .bind(Utc::now())
        .bind(ACTIVE)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Cancel every active task of a site.
    #[instrument(skip(self), fields(site_id = %site_id))]
    pub async fn cancel_by_site(&self, site_id: Uuid) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE scan_tasks SET
                status = 'cancelled',
                finished_at = $2,
                version = version + 1
            WHERE site_id = $1 AND status = ANY($3)
            "#,
        )
        .bind(site_id)
        .bind(Utc::now())
        .bind(ACTIVE)
        .execute(&self.pool)
        .await?;

        let cancelled = result.rows_affected();
        if cancelled > 0 {
            debug!(site_id = %site_id, cancelled, "cancelled active tasks");
        }
        Ok(cancelled)
    }

    /// Tasks abandoned by their workers: Pending beyond the pending timeout,
    /// or Processing beyond the processing timeout.
    pub async fn find_stale(
        &self,
        pending_timeout: Duration,
        processing_timeout: Duration,
    ) -> Result<Vec<ScanTask>> {
        let now = Utc::now();
        let rows = sqlx::query(
            r#"
            SELECT * FROM scan_tasks
            WHERE (status = 'pending' AND created_at < $1)
               OR (status = 'processing' AND created_at < $2)
            ORDER BY created_at ASC
            "#,
        )
        .bind(now - pending_timeout)
        .bind(now - processing_timeout)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(task_from_row).collect()
    }

    /// Fail an abandoned task, promoting any in-flight stage substatus to
    /// Failed with the same error and timestamp.
    ///
    /// All CASE expressions read the pre-update row, so the promotion sees
    /// the original substatuses.
    #[instrument(skip(self, error), fields(task_id = %id))]
    pub async fn mark_failed(&self, id: Uuid, error: &str) -> Result<()> {
        let now = Utc::now();
        let result = sqlx::query(&format!(
            r#"
            UPDATE scan_tasks SET
                status = 'failed',
                finished_at = $2,
                next_retry_at = $2 + {NEXT_RETRY_SQL},
                sitemap_status = CASE WHEN sitemap_status = 'processing' THEN 'failed' ELSE sitemap_status END,
                sitemap_error = CASE WHEN sitemap_status = 'processing' THEN $3 ELSE sitemap_error END,
                sitemap_finished_at = CASE WHEN sitemap_status = 'processing' THEN $2 ELSE sitemap_finished_at END,
                page_status = CASE WHEN page_status = 'processing' THEN 'failed' ELSE page_status END,
                page_error = CASE WHEN page_status = 'processing' THEN $3 ELSE page_error END,
                page_finished_at = CASE WHEN page_status = 'processing' THEN $2 ELSE page_finished_at END,
                version = version + 1
            WHERE id = $1 AND status = ANY($4)
            "#
        ))
        .bind(id)
        .bind(now)
        .bind(error)
        .bind(ACTIVE)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(PersistenceError::concurrent("scan_task", id));
        }
        Ok(())
    }

    /// Failed tasks whose retry window has opened and whose budget remains.
    pub async fn find_failed_for_retry(&self, max_retries: i32) -> Result<Vec<ScanTask>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM scan_tasks
            WHERE status = 'failed'
              AND retry_count < $1
              AND (next_retry_at IS NULL OR next_retry_at <= $2)
            ORDER BY finished_at ASC
            "#,
        )
        .bind(max_retries)
        .bind(Utc::now())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(task_from_row).collect()
    }

    /// Revive a failed task for another attempt: back to Processing, the
    /// failed stage result reset to a fresh in-flight state, retry counter
    /// bumped. Returns the revived task for republishing.
    #[instrument(skip(self), fields(task_id = %id))]
    pub async fn increment_retry_and_reset(&self, id: Uuid) -> Result<ScanTask> {
        let now = Utc::now();
        let row = sqlx::query(
            r#"
            UPDATE scan_tasks SET
                status = 'processing',
                finished_at = NULL,
                retry_count = retry_count + 1,
                next_retry_at = NULL,
                sitemap_status = CASE WHEN sitemap_status = 'failed' THEN 'processing' ELSE sitemap_status END,
                sitemap_started_at = CASE WHEN sitemap_status = 'failed' THEN $2 ELSE sitemap_started_at END,
                sitemap_finished_at = CASE WHEN sitemap_status = 'failed' THEN NULL ELSE sitemap_finished_at END,
                sitemap_error = CASE WHEN sitemap_status = 'failed' THEN NULL ELSE sitemap_error END,
                page_status = CASE WHEN page_status = 'failed' THEN 'processing' ELSE page_status END,
                page_started_at = CASE WHEN page_status = 'failed' THEN $2 ELSE page_started_at END,
                page_finished_at = CASE WHEN page_status = 'failed' THEN NULL ELSE page_finished_at END,
                page_error = CASE WHEN page_status = 'failed' THEN NULL ELSE page_error END,
                version = version + 1
            WHERE id = $1 AND status = 'failed'
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        let row = row.ok_or_else(|| PersistenceError::concurrent("scan_task", id))?;
        task_from_row(row)
    }
}

fn stage_result_from_row(row: &PgRow, prefix: &str) -> Result<StageResult> {
    let col = |name: &str| format!("{prefix}_{name}");
    Ok(StageResult {
        status: parse_status("scan_tasks", row.try_get::<String, _>(col("status").as_str())?)?,
        total: row.try_get(col("total").as_str())?,
        success: row.try_get(col("success").as_str())?,
        failed: row.try_get(col("failed").as_str())?,
        error: row.try_get(col("error").as_str())?,
        started_at: row.try_get(col("started_at").as_str())?,
        finished_at: row.try_get(col("finished_at").as_str())?,
    })
}

fn task_from_row(row: PgRow) -> Result<ScanTask> {
    Ok(ScanTask {
        id: row.try_get("id")?,
        site_id: row.try_get("site_id")?,
        domain: row.try_get("domain")?,
        status: parse_status("scan_tasks", row.try_get::<String, _>("status")?)?,
        stage: parse_status("scan_tasks", row.try_get::<String, _>("stage")?)?,
        sitemap_result: stage_result_from_row(&row, "sitemap")?,
        page_result: stage_result_from_row(&row, "page")?,
        created_at: row.try_get("created_at")?,
        finished_at: row.try_get("finished_at")?,
        retry_count: row.try_get("retry_count")?,
        next_retry_at: row.try_get("next_retry_at")?,
        version: row.try_get("version")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use driftnet_types::TaskStatus;

    #[test]
    fn test_page_progress_completion() {
        let progress = PageProgress {
            success: 2,
            failed: 1,
            total: 3,
        };
        assert!(progress.is_complete());

        let in_flight = PageProgress {
            success: 1,
            failed: 0,
            total: 3,
        };
        assert!(!in_flight.is_complete());

        // Zero total never completes through counters.
        let empty = PageProgress {
            success: 0,
            failed: 0,
            total: 0,
        };
        assert!(!empty.is_complete());
    }

    #[test]
    fn test_sql_backoff_matches_typed_backoff() {
        // The SQL formula and driftnet_types::retry_backoff must agree on
        // base and cap.
        assert!(NEXT_RETRY_SQL.contains("LEAST(3600"));
        assert!(NEXT_RETRY_SQL.contains("30 * power(2"));
        assert_eq!(
            driftnet_types::retry_backoff(0),
            chrono::Duration::seconds(30)
        );
        assert_eq!(
            driftnet_types::retry_backoff(10),
            chrono::Duration::seconds(3600)
        );
    }

    #[test]
    fn test_active_status_set_matches_predicate() {
        for s in ACTIVE {
            assert!(s.parse::<TaskStatus>().unwrap().is_active());
        }
    }
}
