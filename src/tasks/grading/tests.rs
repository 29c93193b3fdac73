use std::sync::Arc;
use std::time::Duration;

use crate::db::types::SheetStatus;
use crate::repositories;
use crate::services::grading::{GradingEngine, StubGradingEngine, StubOutcome};
use crate::tasks::grading::{claim_next_sheet, process_sheet, recover_stale_processing_sheets};
use crate::test_support;

fn fixed_engine(score: f64, total_score: f64) -> Arc<dyn GradingEngine> {
    Arc::new(StubGradingEngine::fixed(score, total_score))
}

#[tokio::test]
async fn claim_moves_pending_sheet_to_processing_exactly_once() {
    let ctx = test_support::setup_test_context_with_storage().await;

    let sheet_id =
        test_support::insert_sheet(ctx.state.db(), "owner-a", "Algebra", test_support::now())
            .await;

    let claimed = claim_next_sheet(ctx.state.db()).await.expect("claim");
    assert_eq!(claimed.as_deref(), Some(sheet_id.as_str()));

    let sheet = repositories::sheets::find_by_id(ctx.state.db(), &sheet_id)
        .await
        .expect("fetch")
        .expect("sheet");
    assert_eq!(sheet.status, SheetStatus::Processing);
    assert!(sheet.processing_started_at.is_some());

    // The sheet is no longer pending, so a second trigger finds nothing.
    let second = claim_next_sheet(ctx.state.db()).await.expect("claim again");
    assert!(second.is_none());
}

#[tokio::test]
async fn completion_persists_result_and_updates_analytics_once() {
    let ctx = test_support::setup_test_context_with_storage().await;
    let engine = fixed_engine(82.0, 100.0);

    let sheet_id =
        test_support::insert_sheet(ctx.state.db(), "owner-a", "Algebra", test_support::now())
            .await;
    claim_next_sheet(ctx.state.db()).await.expect("claim").expect("claimed");

    process_sheet(&ctx.state, &engine, &sheet_id).await.expect("process");

    let sheet = repositories::sheets::find_by_id(ctx.state.db(), &sheet_id)
        .await
        .expect("fetch")
        .expect("sheet");
    assert_eq!(sheet.status, SheetStatus::Completed);
    assert!(sheet.processed_at.is_some());

    let result = repositories::results::find_by_sheet(ctx.state.db(), &sheet_id)
        .await
        .expect("fetch result")
        .expect("result");
    assert_eq!(result.score, 82.0);
    assert_eq!(result.total_score, 100.0);
    assert!((result.percentage - 82.0).abs() < 1e-9);

    let snapshot = repositories::analytics::find_by_owner(ctx.state.db(), "owner-a")
        .await
        .expect("fetch snapshot")
        .expect("snapshot");
    assert_eq!(snapshot.total_sheets_processed, 1);
    assert!((snapshot.average_score - 82.0).abs() < 1e-9);

    // A retried trigger sees a terminal sheet and changes nothing.
    process_sheet(&ctx.state, &engine, &sheet_id).await.expect("reprocess");

    let snapshot = repositories::analytics::find_by_owner(ctx.state.db(), "owner-a")
        .await
        .expect("fetch snapshot")
        .expect("snapshot");
    assert_eq!(snapshot.total_sheets_processed, 1);
    assert!((snapshot.average_score - 82.0).abs() < 1e-9);
}

#[tokio::test]
async fn engine_failure_marks_sheet_failed_with_no_result() {
    let ctx = test_support::setup_test_context_with_storage().await;
    let engine: Arc<dyn GradingEngine> = Arc::new(StubGradingEngine::failing("model unavailable"));

    let sheet_id =
        test_support::insert_sheet(ctx.state.db(), "owner-a", "Algebra", test_support::now())
            .await;
    claim_next_sheet(ctx.state.db()).await.expect("claim").expect("claimed");

    process_sheet(&ctx.state, &engine, &sheet_id).await.expect("process");

    let sheet = repositories::sheets::find_by_id(ctx.state.db(), &sheet_id)
        .await
        .expect("fetch")
        .expect("sheet");
    assert_eq!(sheet.status, SheetStatus::Failed);
    assert!(sheet.processed_at.is_some());
    assert!(sheet.failure_reason.unwrap_or_default().contains("model unavailable"));

    let result =
        repositories::results::find_by_sheet(ctx.state.db(), &sheet_id).await.expect("fetch");
    assert!(result.is_none());

    // Failures stay out of the aggregate unless the counter is enabled.
    let snapshot =
        repositories::analytics::find_by_owner(ctx.state.db(), "owner-a").await.expect("fetch");
    assert!(snapshot.is_none());
}

#[tokio::test]
async fn failure_counter_is_tracked_when_enabled() {
    let ctx = test_support::setup_test_context_with_storage_and_env(&[(
        "ANALYTICS_TRACK_FAILURES",
        "1",
    )])
    .await;
    let engine: Arc<dyn GradingEngine> = Arc::new(StubGradingEngine::failing("model unavailable"));

    let sheet_id =
        test_support::insert_sheet(ctx.state.db(), "owner-a", "Algebra", test_support::now())
            .await;
    claim_next_sheet(ctx.state.db()).await.expect("claim").expect("claimed");

    process_sheet(&ctx.state, &engine, &sheet_id).await.expect("process");

    let snapshot = repositories::analytics::find_by_owner(ctx.state.db(), "owner-a")
        .await
        .expect("fetch")
        .expect("snapshot");
    assert_eq!(snapshot.total_sheets_failed, 1);
    assert_eq!(snapshot.total_sheets_processed, 0);
    assert_eq!(snapshot.average_score, 0.0);
}

#[tokio::test]
async fn deadline_timeout_fails_sheet_and_discards_late_result() {
    let ctx = test_support::setup_test_context_with_storage_and_env(&[(
        "MAX_PROCESSING_SECONDS",
        "1",
    )])
    .await;
    let engine: Arc<dyn GradingEngine> = Arc::new(StubGradingEngine::new(
        Duration::from_millis(1500),
        StubOutcome::Fixed { score: 90.0, total_score: 100.0 },
    ));

    let sheet_id =
        test_support::insert_sheet(ctx.state.db(), "owner-a", "Slow engine", test_support::now())
            .await;
    claim_next_sheet(ctx.state.db()).await.expect("claim").expect("claimed");

    process_sheet(&ctx.state, &engine, &sheet_id).await.expect("process");

    let sheet = repositories::sheets::find_by_id(ctx.state.db(), &sheet_id)
        .await
        .expect("fetch")
        .expect("sheet");
    assert_eq!(sheet.status, SheetStatus::Failed);
    assert!(sheet.failure_reason.unwrap_or_default().contains("deadline"));

    let result =
        repositories::results::find_by_sheet(ctx.state.db(), &sheet_id).await.expect("fetch");
    assert!(result.is_none());

    // The engine answering after the watchdog already failed the sheet must
    // not resurrect it.
    let late_at = test_support::now();
    let transitioned = repositories::sheets::complete_with_result(
        ctx.state.db(),
        &sheet_id,
        late_at,
        repositories::results::CreateResult {
            id: "late-result",
            sheet_id: &sheet_id,
            owner_id: "owner-a",
            score: 90.0,
            total_score: 100.0,
            percentage: 90.0,
            feedback: None,
            extracted_text: None,
            created_at: late_at,
        },
    )
    .await
    .expect("late completion");
    assert!(!transitioned);

    let sheet = repositories::sheets::find_by_id(ctx.state.db(), &sheet_id)
        .await
        .expect("fetch")
        .expect("sheet");
    assert_eq!(sheet.status, SheetStatus::Failed);

    let result =
        repositories::results::find_by_sheet(ctx.state.db(), &sheet_id).await.expect("fetch");
    assert!(result.is_none());
}

#[tokio::test]
async fn watchdog_sweep_recovers_stale_processing_sheets() {
    let ctx = test_support::setup_test_context_with_storage().await;

    let sheet_id =
        test_support::insert_sheet(ctx.state.db(), "owner-a", "Lost worker", test_support::now())
            .await;
    claim_next_sheet(ctx.state.db()).await.expect("claim").expect("claimed");

    // Simulate a worker that died hours ago.
    sqlx::query(
        "UPDATE answer_sheets SET processing_started_at = processing_started_at - INTERVAL '2 hours' WHERE id = $1",
    )
    .bind(&sheet_id)
    .execute(ctx.state.db())
    .await
    .expect("backdate");

    recover_stale_processing_sheets(&ctx.state).await.expect("sweep");

    let sheet = repositories::sheets::find_by_id(ctx.state.db(), &sheet_id)
        .await
        .expect("fetch")
        .expect("sheet");
    assert_eq!(sheet.status, SheetStatus::Failed);
    assert!(sheet.failure_reason.unwrap_or_default().contains("timed out"));
    assert!(sheet.processed_at.is_some());
}

#[tokio::test]
async fn concurrent_completions_for_one_owner_keep_the_exact_mean() {
    let ctx = test_support::setup_test_context_with_storage().await;

    let scores = [60.0, 75.0, 90.0, 82.5];
    let base = test_support::now();
    for (index, _) in scores.iter().enumerate() {
        test_support::insert_sheet(
            ctx.state.db(),
            "owner-a",
            &format!("Sheet {index}"),
            base - time::Duration::seconds((scores.len() - index) as i64),
        )
        .await;
    }

    let mut tasks = Vec::new();
    for score in scores {
        let state = ctx.state.clone();
        tasks.push(tokio::spawn(async move {
            let engine = fixed_engine(score, 100.0);
            let sheet_id = claim_next_sheet(state.db())
                .await
                .expect("claim")
                .expect("a pending sheet is available");
            process_sheet(&state, &engine, &sheet_id).await.expect("process");
        }));
    }
    for task in tasks {
        task.await.expect("join");
    }

    let snapshot = repositories::analytics::find_by_owner(ctx.state.db(), "owner-a")
        .await
        .expect("fetch snapshot")
        .expect("snapshot");

    let expected = scores.iter().sum::<f64>() / scores.len() as f64;
    assert_eq!(snapshot.total_sheets_processed, scores.len() as i64);
    assert!(
        (snapshot.average_score - expected).abs() < 1e-9,
        "average drifted: {}",
        snapshot.average_score
    );

    let results = repositories::results::count_by_owner(ctx.state.db(), "owner-a")
        .await
        .expect("count results");
    assert_eq!(results, scores.len() as i64);
}
