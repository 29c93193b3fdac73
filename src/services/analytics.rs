use std::time::Duration;

use sqlx::PgPool;
use thiserror::Error;

use crate::core::config::Settings;
use crate::core::time::primitive_now_utc;
use crate::repositories::analytics as snapshots;
use crate::repositories::analytics::SnapshotUpdate;

#[derive(Debug, Error)]
pub(crate) enum AnalyticsError {
    #[error("snapshot update for owner {owner_id} lost {attempts} races")]
    Conflict { owner_id: String, attempts: u32 },
    #[error(transparent)]
    Persistence(#[from] sqlx::Error),
}

/// Running-mean fold. Commutative over completions, so concurrent sheets of
/// one owner may land in any order and still produce the same aggregate.
pub(crate) fn fold_completion(
    count: i64,
    average: f64,
    total_seconds: f64,
    percentage: f64,
    elapsed_seconds: f64,
) -> (i64, f64, f64) {
    let new_count = count + 1;
    let new_average = (average * count as f64 + percentage) / new_count as f64;
    (new_count, new_average, total_seconds + elapsed_seconds)
}

/// Applies one completed evaluation to the owner's snapshot.
///
/// Writers for the same owner are serialized through the snapshot version:
/// read, fold, compare-and-swap, retry with exponential backoff on a lost
/// race. The caller treats exhaustion as non-fatal; the grading result this
/// update derives from is already persisted and stays valid.
pub(crate) async fn record_completion(
    pool: &PgPool,
    settings: &Settings,
    owner_id: &str,
    percentage: f64,
    elapsed_seconds: f64,
) -> Result<(), AnalyticsError> {
    let max_attempts = settings.pipeline().analytics_max_retries.max(1);

    for attempt in 0..max_attempts {
        let now = primitive_now_utc();

        let applied = match snapshots::find_by_owner(pool, owner_id).await? {
            None => {
                snapshots::insert_initial(
                    pool,
                    owner_id,
                    SnapshotUpdate {
                        total_sheets_processed: 1,
                        average_score: percentage,
                        total_processing_seconds: elapsed_seconds,
                        total_sheets_failed: 0,
                        last_updated: now,
                    },
                )
                .await?
            }
            Some(snapshot) => {
                let (count, average, total_seconds) = fold_completion(
                    snapshot.total_sheets_processed,
                    snapshot.average_score,
                    snapshot.total_processing_seconds,
                    percentage,
                    elapsed_seconds,
                );
                snapshots::update_versioned(
                    pool,
                    owner_id,
                    snapshot.version,
                    SnapshotUpdate {
                        total_sheets_processed: count,
                        average_score: average,
                        total_processing_seconds: total_seconds,
                        total_sheets_failed: snapshot.total_sheets_failed,
                        last_updated: now,
                    },
                )
                .await?
            }
        };

        if applied {
            metrics::counter!("analytics_updates_total", "kind" => "completion").increment(1);
            return Ok(());
        }

        metrics::counter!("analytics_update_conflicts_total").increment(1);
        backoff(settings, attempt).await;
    }

    Err(AnalyticsError::Conflict { owner_id: owner_id.to_string(), attempts: max_attempts })
}

/// Failure counter, enabled via ANALYTICS_TRACK_FAILURES. Failures never
/// enter the running mean.
pub(crate) async fn record_failure(
    pool: &PgPool,
    settings: &Settings,
    owner_id: &str,
) -> Result<(), AnalyticsError> {
    let max_attempts = settings.pipeline().analytics_max_retries.max(1);

    for attempt in 0..max_attempts {
        let now = primitive_now_utc();

        let applied = match snapshots::find_by_owner(pool, owner_id).await? {
            None => {
                snapshots::insert_initial(
                    pool,
                    owner_id,
                    SnapshotUpdate {
                        total_sheets_processed: 0,
                        average_score: 0.0,
                        total_processing_seconds: 0.0,
                        total_sheets_failed: 1,
                        last_updated: now,
                    },
                )
                .await?
            }
            Some(snapshot) => {
                snapshots::update_versioned(
                    pool,
                    owner_id,
                    snapshot.version,
                    SnapshotUpdate {
                        total_sheets_processed: snapshot.total_sheets_processed,
                        average_score: snapshot.average_score,
                        total_processing_seconds: snapshot.total_processing_seconds,
                        total_sheets_failed: snapshot.total_sheets_failed + 1,
                        last_updated: now,
                    },
                )
                .await?
            }
        };

        if applied {
            metrics::counter!("analytics_updates_total", "kind" => "failure").increment(1);
            return Ok(());
        }

        metrics::counter!("analytics_update_conflicts_total").increment(1);
        backoff(settings, attempt).await;
    }

    Err(AnalyticsError::Conflict { owner_id: owner_id.to_string(), attempts: max_attempts })
}

async fn backoff(settings: &Settings, attempt: u32) {
    let base = settings.pipeline().analytics_retry_backoff_ms.max(1);
    let delay = base.saturating_mul(1_u64 << attempt.min(10));
    tokio::time::sleep(Duration::from_millis(delay)).await;
}
