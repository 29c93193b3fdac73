use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::core::state::AppState;
use crate::core::time::primitive_now_utc as now_primitive;
use crate::db::models::AnswerSheet;
use crate::db::types::SheetStatus;
use crate::repositories;
use crate::services::analytics;
use crate::services::grading::{EvaluateRequest, GradingEngine};

const ARTIFACT_URL_TTL: Duration = Duration::from_secs(3600);

pub(crate) async fn claim_next_sheet(pool: &PgPool) -> Result<Option<String>> {
    repositories::sheets::claim_next_for_processing(pool, now_primitive())
        .await
        .context("Failed to claim sheet")
}

/// Drives one claimed sheet to a terminal state. The engine call runs under
/// the processing deadline; whichever of completion, failure or the watchdog
/// wins the status transition decides the outcome, the rest are no-ops.
pub(crate) async fn process_sheet(
    state: &AppState,
    engine: &Arc<dyn GradingEngine>,
    sheet_id: &str,
) -> Result<()> {
    let sheet = repositories::sheets::find_by_id(state.db(), sheet_id)
        .await
        .context("Failed to fetch sheet")?
        .context("Sheet not found")?;

    if sheet.status != SheetStatus::Processing {
        tracing::info!(sheet_id, status = ?sheet.status, "Skipping evaluation");
        return Ok(());
    }

    let storage = state.storage().ok_or_else(|| anyhow::anyhow!("S3 storage not configured"))?;
    let artifact_url = storage
        .presign_get(&sheet.artifact_key, ARTIFACT_URL_TTL)
        .await
        .context("Failed to generate presigned URL")?;

    let request = EvaluateRequest { sheet_id: sheet.id.clone(), artifact_url };
    let deadline = Duration::from_secs(state.settings().pipeline().max_processing_seconds);

    let started_at = sheet.processing_started_at.unwrap_or_else(now_primitive);
    let queue_latency =
        (started_at.assume_utc() - sheet.uploaded_at.assume_utc()).as_seconds_f64();

    let evaluation = match tokio::time::timeout(deadline, engine.evaluate(&request)).await {
        Ok(Ok(evaluation)) => evaluation,
        Ok(Err(err)) => {
            tracing::error!(sheet_id, error = %err, "Evaluation failed");
            metrics::counter!("grading_jobs_total", "status" => "failed").increment(1);
            return fail_sheet(state, &sheet, &err.to_string()).await;
        }
        Err(_) => {
            tracing::warn!(sheet_id, "Evaluation exceeded the processing deadline");
            metrics::counter!("grading_jobs_total", "status" => "timeout").increment(1);
            return fail_sheet(state, &sheet, "Evaluation exceeded the processing deadline").await;
        }
    };

    if evaluation.total_score <= 0.0 {
        metrics::counter!("grading_jobs_total", "status" => "failed").increment(1);
        return fail_sheet(state, &sheet, "Engine returned a non-positive total score").await;
    }

    let percentage = evaluation.percentage();
    let completed_at = now_primitive();
    let elapsed = (completed_at.assume_utc() - started_at.assume_utc()).as_seconds_f64();

    let result_id = Uuid::new_v4().to_string();
    let transitioned = repositories::sheets::complete_with_result(
        state.db(),
        &sheet.id,
        completed_at,
        repositories::results::CreateResult {
            id: &result_id,
            sheet_id: &sheet.id,
            owner_id: &sheet.owner_id,
            score: evaluation.score,
            total_score: evaluation.total_score,
            percentage,
            feedback: evaluation.feedback.as_deref(),
            extracted_text: evaluation.extracted_text.as_deref(),
            created_at: completed_at,
        },
    )
    .await
    .context("Failed to complete sheet")?;

    if !transitioned {
        tracing::warn!(sheet_id, "Discarding late evaluation; sheet already left processing");
        metrics::counter!("grading_results_discarded_total").increment(1);
        return Ok(());
    }

    metrics::counter!("grading_jobs_total", "status" => "success").increment(1);
    metrics::histogram!("grading_duration_seconds").record(elapsed);
    metrics::histogram!("grading_queue_latency_seconds").record(queue_latency);

    if let Err(err) = analytics::record_completion(
        state.db(),
        state.settings(),
        &sheet.owner_id,
        percentage,
        elapsed,
    )
    .await
    {
        // Non-fatal: the persisted result stays valid without the aggregate.
        tracing::warn!(sheet_id, owner_id = %sheet.owner_id, error = %err, "Analytics update failed");
    }

    tracing::info!(sheet_id, percentage, "Evaluation succeeded");

    Ok(())
}

/// Last-resort path for worker panics and infrastructure errors: the sheet
/// must still reach a terminal state.
pub(crate) async fn recover_sheet_on_unexpected_error(
    state: &AppState,
    sheet_id: &str,
    error: &str,
) -> Result<()> {
    let reason = format!("Worker error: {error}");
    repositories::sheets::mark_failed(state.db(), sheet_id, &reason, now_primitive())
        .await
        .context("Failed to recover sheet after worker error")?;
    Ok(())
}

async fn fail_sheet(state: &AppState, sheet: &AnswerSheet, reason: &str) -> Result<()> {
    let transitioned =
        repositories::sheets::mark_failed(state.db(), &sheet.id, reason, now_primitive())
            .await
            .context("Failed to mark sheet failed")?;

    if transitioned && state.settings().pipeline().analytics_track_failures {
        if let Err(err) =
            analytics::record_failure(state.db(), state.settings(), &sheet.owner_id).await
        {
            tracing::warn!(sheet_id = %sheet.id, error = %err, "Failure-count update failed");
        }
    }

    Ok(())
}
