//! Periodic background tasks: cleanup reclaims idle instances down to one
//! warm spare per challenge, prestart drains the pre-warm queue. Both run for
//! the lifetime of the process and stop cooperatively via a
//! `CancellationToken`.

use crate::core::Scheduler;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument};

const CLEANUP_PERIOD: Duration = Duration::from_secs(30);
const PRESTART_PERIOD: Duration = Duration::from_secs(5);

#[instrument(skip(scheduler, cancel))]
pub async fn run_cleanup_loop(scheduler: Arc<Scheduler>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(CLEANUP_PERIOD);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("cleanup loop shutting down");
                return;
            }
            _ = ticker.tick() => {
                if let Err(e) = cleanup_pass(&scheduler).await {
                    error!(error = %e, "cleanup pass failed");
                }
            }
        }
    }
}

#[instrument(skip(scheduler, cancel))]
pub async fn run_prestart_loop(scheduler: Arc<Scheduler>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(PRESTART_PERIOD);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("prestart loop shutting down");
                return;
            }
            _ = ticker.tick() => {
                if let Err(e) = prestart_pass(&scheduler).await {
                    error!(error = %e, "prestart pass failed");
                }
            }
        }
    }
}

async fn cleanup_pass(scheduler: &Scheduler) -> broker_common::Result<()> {
    scheduler.reap_idle_instances().await
}

async fn prestart_pass(scheduler: &Scheduler) -> broker_common::Result<()> {
    let queue = scheduler.prewarm_queue_snapshot().await?;
    for challenge in queue {
        if let Err(e) = scheduler.start_instance(&challenge, None).await {
            error!(%challenge, error = %e, "prestart: failed to start instance, will retry next tick");
        }
    }
    Ok(())
}
