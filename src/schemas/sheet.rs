use serde::{Deserialize, Serialize};
use validator::Validate;

pub(crate) use crate::core::time::format_primitive;
use crate::db::models::{AnalyticsSnapshot, AnswerSheet, GradingResult};
use crate::db::types::SheetStatus;

#[derive(Debug, Serialize)]
pub(crate) struct SubmitSheetResponse {
    pub(crate) id: String,
    pub(crate) status: SheetStatus,
}

#[derive(Debug, Serialize)]
pub(crate) struct SheetResponse {
    pub(crate) id: String,
    pub(crate) title: String,
    pub(crate) file_name: String,
    pub(crate) file_size: i64,
    pub(crate) mime_type: String,
    pub(crate) status: SheetStatus,
    pub(crate) failure_reason: Option<String>,
    pub(crate) uploaded_at: String,
    pub(crate) processed_at: Option<String>,
}

impl From<AnswerSheet> for SheetResponse {
    fn from(sheet: AnswerSheet) -> Self {
        Self {
            id: sheet.id,
            title: sheet.title,
            file_name: sheet.file_name,
            file_size: sheet.file_size,
            mime_type: sheet.mime_type,
            status: sheet.status,
            failure_reason: sheet.failure_reason,
            uploaded_at: format_primitive(sheet.uploaded_at),
            processed_at: sheet.processed_at.map(format_primitive),
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct GradingResultResponse {
    pub(crate) id: String,
    pub(crate) sheet_id: String,
    pub(crate) score: f64,
    pub(crate) total_score: f64,
    pub(crate) percentage: f64,
    pub(crate) feedback: Option<String>,
    pub(crate) extracted_text: Option<String>,
    pub(crate) created_at: String,
}

impl From<GradingResult> for GradingResultResponse {
    fn from(result: GradingResult) -> Self {
        Self {
            id: result.id,
            sheet_id: result.sheet_id,
            score: result.score,
            total_score: result.total_score,
            percentage: result.percentage,
            feedback: result.feedback,
            extracted_text: result.extracted_text,
            created_at: format_primitive(result.created_at),
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct SheetDetailResponse {
    pub(crate) sheet: SheetResponse,
    pub(crate) artifact_url: Option<String>,
    pub(crate) result: Option<GradingResultResponse>,
}

#[derive(Debug, Deserialize, Validate)]
pub(crate) struct ListSheetsQuery {
    #[validate(range(min = 1, max = 100, message = "limit must be between 1 and 100"))]
    pub(crate) limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub(crate) struct AnalyticsResponse {
    pub(crate) total_sheets_processed: i64,
    pub(crate) average_score: f64,
    pub(crate) total_processing_seconds: f64,
    pub(crate) total_sheets_failed: i64,
    pub(crate) last_updated: Option<String>,
}

impl AnalyticsResponse {
    /// Owners with no completions yet read as an all-zero aggregate, not an
    /// error.
    pub(crate) fn empty() -> Self {
        Self {
            total_sheets_processed: 0,
            average_score: 0.0,
            total_processing_seconds: 0.0,
            total_sheets_failed: 0,
            last_updated: None,
        }
    }
}

impl From<AnalyticsSnapshot> for AnalyticsResponse {
    fn from(snapshot: AnalyticsSnapshot) -> Self {
        Self {
            total_sheets_processed: snapshot.total_sheets_processed,
            average_score: snapshot.average_score,
            total_processing_seconds: snapshot.total_processing_seconds,
            total_sheets_failed: snapshot.total_sheets_failed,
            last_updated: Some(format_primitive(snapshot.last_updated)),
        }
    }
}
