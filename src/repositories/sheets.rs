use sqlx::PgPool;
use time::PrimitiveDateTime;

use crate::db::models::AnswerSheet;
use crate::db::types::SheetStatus;
use crate::repositories::results::CreateResult;

const COLUMNS: &str = "id, owner_id, title, file_name, artifact_key, file_size, mime_type, \
                       status, failure_reason, processing_started_at, uploaded_at, processed_at, \
                       updated_at";

pub(crate) struct CreateSheet<'a> {
    pub(crate) id: &'a str,
    pub(crate) owner_id: &'a str,
    pub(crate) title: &'a str,
    pub(crate) file_name: &'a str,
    pub(crate) artifact_key: &'a str,
    pub(crate) file_size: i64,
    pub(crate) mime_type: &'a str,
    pub(crate) uploaded_at: PrimitiveDateTime,
}

pub(crate) async fn insert(pool: &PgPool, params: CreateSheet<'_>) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO answer_sheets (id, owner_id, title, file_name, artifact_key, file_size, \
         mime_type, status, uploaded_at, updated_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $9)",
    )
    .bind(params.id)
    .bind(params.owner_id)
    .bind(params.title)
    .bind(params.file_name)
    .bind(params.artifact_key)
    .bind(params.file_size)
    .bind(params.mime_type)
    .bind(SheetStatus::Pending)
    .bind(params.uploaded_at)
    .execute(pool)
    .await?;
    Ok(())
}

pub(crate) async fn find_by_id(
    pool: &PgPool,
    id: &str,
) -> Result<Option<AnswerSheet>, sqlx::Error> {
    sqlx::query_as::<_, AnswerSheet>(&format!(
        "SELECT {COLUMNS}
         FROM answer_sheets
         WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await
}

pub(crate) async fn list_by_owner(
    pool: &PgPool,
    owner_id: &str,
    limit: i64,
) -> Result<Vec<AnswerSheet>, sqlx::Error> {
    sqlx::query_as::<_, AnswerSheet>(&format!(
        "SELECT {COLUMNS}
         FROM answer_sheets
         WHERE owner_id = $1
         ORDER BY uploaded_at DESC
         LIMIT $2"
    ))
    .bind(owner_id)
    .bind(limit)
    .fetch_all(pool)
    .await
}

/// Atomically claims the oldest pending sheet for processing. Rows already
/// processing or terminal are never candidates, so a duplicate trigger for
/// the same sheet is a no-op.
pub(crate) async fn claim_next_for_processing(
    pool: &PgPool,
    now: PrimitiveDateTime,
) -> Result<Option<String>, sqlx::Error> {
    sqlx::query_scalar::<_, String>(
        "WITH candidate AS (
            SELECT id
            FROM answer_sheets
            WHERE status = $1
            ORDER BY uploaded_at
            FOR UPDATE SKIP LOCKED
            LIMIT 1
        )
        UPDATE answer_sheets
        SET status = $2,
            processing_started_at = $3,
            updated_at = $3
        FROM candidate
        WHERE answer_sheets.id = candidate.id
        RETURNING answer_sheets.id",
    )
    .bind(SheetStatus::Pending)
    .bind(SheetStatus::Processing)
    .bind(now)
    .fetch_optional(pool)
    .await
}

/// Processing -> Completed together with the result insert, in one
/// transaction. Returns false when the sheet already left Processing (a
/// watchdog fail or a duplicate worker won), in which case nothing is
/// written and the late result must be discarded.
pub(crate) async fn complete_with_result(
    pool: &PgPool,
    sheet_id: &str,
    processed_at: PrimitiveDateTime,
    result: CreateResult<'_>,
) -> Result<bool, sqlx::Error> {
    let mut tx = pool.begin().await?;

    let updated = sqlx::query(
        "UPDATE answer_sheets
         SET status = $1,
             processed_at = $2,
             failure_reason = NULL,
             updated_at = $2
         WHERE id = $3 AND status = $4",
    )
    .bind(SheetStatus::Completed)
    .bind(processed_at)
    .bind(sheet_id)
    .bind(SheetStatus::Processing)
    .execute(&mut *tx)
    .await?;

    if updated.rows_affected() == 0 {
        tx.rollback().await?;
        return Ok(false);
    }

    sqlx::query(
        "INSERT INTO grading_results (id, sheet_id, owner_id, score, total_score, percentage, \
         feedback, extracted_text, created_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
    )
    .bind(result.id)
    .bind(result.sheet_id)
    .bind(result.owner_id)
    .bind(result.score)
    .bind(result.total_score)
    .bind(result.percentage)
    .bind(result.feedback)
    .bind(result.extracted_text)
    .bind(result.created_at)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(true)
}

/// Processing -> Failed. Status-guarded like completion, so a sheet that
/// already completed keeps its result untouched.
pub(crate) async fn mark_failed(
    pool: &PgPool,
    sheet_id: &str,
    reason: &str,
    now: PrimitiveDateTime,
) -> Result<bool, sqlx::Error> {
    let updated = sqlx::query(
        "UPDATE answer_sheets
         SET status = $1,
             failure_reason = $2,
             processed_at = $3,
             updated_at = $3
         WHERE id = $4 AND status = $5",
    )
    .bind(SheetStatus::Failed)
    .bind(reason)
    .bind(now)
    .bind(sheet_id)
    .bind(SheetStatus::Processing)
    .execute(pool)
    .await?;

    Ok(updated.rows_affected() > 0)
}

/// Withdraw is only honored while the sheet is still pending.
pub(crate) async fn delete_pending(
    pool: &PgPool,
    owner_id: &str,
    sheet_id: &str,
) -> Result<Option<String>, sqlx::Error> {
    sqlx::query_scalar::<_, String>(
        "DELETE FROM answer_sheets
         WHERE id = $1 AND owner_id = $2 AND status = $3
         RETURNING artifact_key",
    )
    .bind(sheet_id)
    .bind(owner_id)
    .bind(SheetStatus::Pending)
    .fetch_optional(pool)
    .await
}

pub(crate) async fn list_stale_processing(
    pool: &PgPool,
    started_before: PrimitiveDateTime,
) -> Result<Vec<(String, String)>, sqlx::Error> {
    sqlx::query_as::<_, (String, String)>(
        "SELECT id, owner_id
         FROM answer_sheets
         WHERE status = $1
           AND processing_started_at IS NOT NULL
           AND processing_started_at < $2",
    )
    .bind(SheetStatus::Processing)
    .bind(started_before)
    .fetch_all(pool)
    .await
}

pub(crate) async fn count_by_owner(pool: &PgPool, owner_id: &str) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM answer_sheets WHERE owner_id = $1")
        .bind(owner_id)
        .fetch_one(pool)
        .await
}
