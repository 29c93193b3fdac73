use anyhow::{Context, Result};
use time::Duration;

use crate::core::state::AppState;
use crate::core::time::primitive_now_utc as now_primitive;
use crate::repositories;
use crate::services::analytics;

const STALE_GRACE_SECONDS: u64 = 120;

/// Watchdog sweep: any sheet still processing past the deadline (plus a
/// grace margin for in-flight completions) is failed, so a dead worker can
/// never strand a sheet in Processing.
pub(crate) async fn recover_stale_processing_sheets(state: &AppState) -> Result<()> {
    let now = now_primitive();
    let timeout_seconds =
        state.settings().pipeline().max_processing_seconds.saturating_add(STALE_GRACE_SECONDS);
    let stale_before = now - seconds_as_duration(timeout_seconds);

    let stale = repositories::sheets::list_stale_processing(state.db(), stale_before)
        .await
        .context("Failed to list stale processing sheets")?;

    let mut recovered = 0;

    for (sheet_id, owner_id) in stale {
        let reason = "Processing timed out while waiting for evaluation";
        let transitioned =
            repositories::sheets::mark_failed(state.db(), &sheet_id, reason, now_primitive())
                .await
                .context("Failed to mark stale sheet as failed")?;

        if !transitioned {
            continue;
        }

        if state.settings().pipeline().analytics_track_failures {
            if let Err(err) =
                analytics::record_failure(state.db(), state.settings(), &owner_id).await
            {
                tracing::warn!(sheet_id, error = %err, "Failure-count update failed");
            }
        }

        recovered += 1;
    }

    if recovered > 0 {
        tracing::warn!(recovered, "Recovered stale processing sheets");
    }

    metrics::counter!("processing_stale_recovered_total").increment(recovered as u64);

    Ok(())
}

fn seconds_as_duration(seconds: u64) -> Duration {
    Duration::seconds(seconds.min(i64::MAX as u64) as i64)
}
