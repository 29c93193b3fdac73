use sqlx::PgPool;
use time::PrimitiveDateTime;

use crate::db::models::AnalyticsSnapshot;

const COLUMNS: &str = "owner_id, total_sheets_processed, average_score, \
                       total_processing_seconds, total_sheets_failed, version, last_updated";

pub(crate) struct SnapshotUpdate {
    pub(crate) total_sheets_processed: i64,
    pub(crate) average_score: f64,
    pub(crate) total_processing_seconds: f64,
    pub(crate) total_sheets_failed: i64,
    pub(crate) last_updated: PrimitiveDateTime,
}

pub(crate) async fn find_by_owner(
    pool: &PgPool,
    owner_id: &str,
) -> Result<Option<AnalyticsSnapshot>, sqlx::Error> {
    sqlx::query_as::<_, AnalyticsSnapshot>(&format!(
        "SELECT {COLUMNS}
         FROM analytics_snapshots
         WHERE owner_id = $1"
    ))
    .bind(owner_id)
    .fetch_optional(pool)
    .await
}

/// First write for an owner. Loses the race gracefully: a concurrent insert
/// leaves this one a no-op and the caller falls back to the versioned update.
pub(crate) async fn insert_initial(
    pool: &PgPool,
    owner_id: &str,
    update: SnapshotUpdate,
) -> Result<bool, sqlx::Error> {
    let inserted = sqlx::query(
        "INSERT INTO analytics_snapshots (owner_id, total_sheets_processed, average_score, \
         total_processing_seconds, total_sheets_failed, version, last_updated)
         VALUES ($1, $2, $3, $4, $5, 0, $6)
         ON CONFLICT (owner_id) DO NOTHING",
    )
    .bind(owner_id)
    .bind(update.total_sheets_processed)
    .bind(update.average_score)
    .bind(update.total_processing_seconds)
    .bind(update.total_sheets_failed)
    .bind(update.last_updated)
    .execute(pool)
    .await?;

    Ok(inserted.rows_affected() > 0)
}

/// Optimistic write: only applies when nobody bumped the version since the
/// caller read the snapshot.
pub(crate) async fn update_versioned(
    pool: &PgPool,
    owner_id: &str,
    expected_version: i64,
    update: SnapshotUpdate,
) -> Result<bool, sqlx::Error> {
    let updated = sqlx::query(
        "UPDATE analytics_snapshots
         SET total_sheets_processed = $1,
             average_score = $2,
             total_processing_seconds = $3,
             total_sheets_failed = $4,
             version = version + 1,
             last_updated = $5
         WHERE owner_id = $6 AND version = $7",
    )
    .bind(update.total_sheets_processed)
    .bind(update.average_score)
    .bind(update.total_processing_seconds)
    .bind(update.total_sheets_failed)
    .bind(update.last_updated)
    .bind(owner_id)
    .bind(expected_version)
    .execute(pool)
    .await?;

    Ok(updated.rows_affected() > 0)
}
