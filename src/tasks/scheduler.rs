use std::sync::Arc;

use anyhow::Result;
use tokio::sync::watch;
use tokio::time::{interval, sleep, Duration};

use crate::core::state::AppState;
use crate::services::grading::{self, GradingEngine};
use crate::tasks::grading as jobs;

const WORKER_IDLE_SLEEP: Duration = Duration::from_secs(2);
const STALE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

pub(crate) async fn run(state: AppState) -> Result<()> {
    let engine = grading::engine_from_settings(state.settings())?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let concurrency = state.settings().pipeline().worker_concurrency;
    let mut handles = Vec::with_capacity(concurrency + 1);

    for _ in 0..concurrency {
        handles.push(tokio::spawn(grading_worker(
            state.clone(),
            engine.clone(),
            shutdown_rx.clone(),
        )));
    }

    handles.push(tokio::spawn(watchdog_loop(state.clone(), shutdown_rx.clone())));

    crate::core::shutdown::shutdown_signal().await;
    if shutdown_tx.send(true).is_err() {
        tracing::warn!("Failed to broadcast shutdown signal to background tasks");
    }

    for handle in handles {
        if let Err(err) = handle.await {
            tracing::error!(error = %err, "Background task join failed");
        }
    }

    Ok(())
}

async fn grading_worker(
    state: AppState,
    engine: Arc<dyn GradingEngine>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        match jobs::claim_next_sheet(state.db()).await {
            Ok(Some(sheet_id)) => {
                if let Err(err) = jobs::process_sheet(&state, &engine, &sheet_id).await {
                    if let Err(recovery_err) = jobs::recover_sheet_on_unexpected_error(
                        &state,
                        &sheet_id,
                        &err.to_string(),
                    )
                    .await
                    {
                        tracing::error!(
                            sheet_id,
                            error = %recovery_err,
                            "Failed to recover sheet after worker error"
                        );
                    }
                    tracing::error!(sheet_id, error = %err, "Failed to process sheet");
                }
                continue;
            }
            Ok(None) => {}
            Err(err) => tracing::error!(error = %err, "Failed to claim sheet"),
        }

        tokio::select! {
            _ = shutdown.changed() => break,
            _ = sleep(WORKER_IDLE_SLEEP) => {}
        }
    }
}

async fn watchdog_loop(state: AppState, mut shutdown: watch::Receiver<bool>) {
    let mut tick = interval(STALE_SWEEP_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tick.tick() => {
                if let Err(err) = jobs::recover_stale_processing_sheets(&state).await {
                    tracing::error!(error = %err, "recover_stale_processing_sheets failed");
                }
            }
        }
    }
}
