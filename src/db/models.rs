use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::PrimitiveDateTime;

use crate::db::types::SheetStatus;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub(crate) struct AnswerSheet {
    pub(crate) id: String,
    pub(crate) owner_id: String,
    pub(crate) title: String,
    pub(crate) file_name: String,
    pub(crate) artifact_key: String,
    pub(crate) file_size: i64,
    pub(crate) mime_type: String,
    pub(crate) status: SheetStatus,
    pub(crate) failure_reason: Option<String>,
    pub(crate) processing_started_at: Option<PrimitiveDateTime>,
    pub(crate) uploaded_at: PrimitiveDateTime,
    pub(crate) processed_at: Option<PrimitiveDateTime>,
    pub(crate) updated_at: PrimitiveDateTime,
}

/// Outcome of one evaluation. sheet_id is unique, so a sheet can never carry
/// more than one result.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub(crate) struct GradingResult {
    pub(crate) id: String,
    pub(crate) sheet_id: String,
    pub(crate) owner_id: String,
    pub(crate) score: f64,
    pub(crate) total_score: f64,
    pub(crate) percentage: f64,
    pub(crate) feedback: Option<String>,
    pub(crate) extracted_text: Option<String>,
    pub(crate) created_at: PrimitiveDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub(crate) struct AnalyticsSnapshot {
    pub(crate) owner_id: String,
    pub(crate) total_sheets_processed: i64,
    pub(crate) average_score: f64,
    pub(crate) total_processing_seconds: f64,
    pub(crate) total_sheets_failed: i64,
    pub(crate) version: i64,
    pub(crate) last_updated: PrimitiveDateTime,
}
