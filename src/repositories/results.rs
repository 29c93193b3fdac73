use sqlx::PgPool;
use time::PrimitiveDateTime;

use crate::db::models::GradingResult;

pub(crate) struct CreateResult<'a> {
    pub(crate) id: &'a str,
    pub(crate) sheet_id: &'a str,
    pub(crate) owner_id: &'a str,
    pub(crate) score: f64,
    pub(crate) total_score: f64,
    pub(crate) percentage: f64,
    pub(crate) feedback: Option<&'a str>,
    pub(crate) extracted_text: Option<&'a str>,
    pub(crate) created_at: PrimitiveDateTime,
}

pub(crate) async fn find_by_sheet(
    pool: &PgPool,
    sheet_id: &str,
) -> Result<Option<GradingResult>, sqlx::Error> {
    sqlx::query_as::<_, GradingResult>(
        "SELECT id, sheet_id, owner_id, score, total_score, percentage, feedback, \
         extracted_text, created_at
         FROM grading_results
         WHERE sheet_id = $1",
    )
    .bind(sheet_id)
    .fetch_optional(pool)
    .await
}

pub(crate) async fn count_by_owner(pool: &PgPool, owner_id: &str) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM grading_results WHERE owner_id = $1")
        .bind(owner_id)
        .fetch_one(pool)
        .await
}
