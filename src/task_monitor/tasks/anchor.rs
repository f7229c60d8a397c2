use std::sync::Arc;

use chrono::Utc;
use tokio::select;
use tokio::time::{self, MissedTickBehavior};
use tracing::{info, instrument};

use crate::app::App;
use crate::database::methods::DbMethods as _;
use crate::task_monitor::TaskMonitor;
use crate::{anchor, database};

/// Drives the anchor pipeline: wakes on the configured interval or as soon
/// as intake accepts a request, sweeps abandoned selections back to PENDING,
/// then runs one batch attempt.
pub async fn run(app: Arc<App>) -> anyhow::Result<()> {
    info!("Starting anchor scheduler.");

    let mut timer = time::interval(app.config.app.anchor_interval);
    timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        select! {
            _ = timer.tick() => {
                tracing::debug!("anchor woken by timer");
            }
            () = app.wake_anchor.notified() => {
                tracing::debug!("anchor woken by intake");
            }
        }

        reset_stale(&app).await?;

        match app.anchor_service.anchor().await {
            Ok(summary) => {
                if summary.anchored > 0 {
                    TaskMonitor::log_batch_size(summary.anchored);
                }
            }
            // Another worker holds the mutex; its batch covers our requests.
            Err(anchor::Error::Database(database::Error::MutexUnavailable { attempts })) => {
                info!(attempts, "anchor mutex held elsewhere, skipping this pass");
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// READY/PROCESSING rows whose worker died (or whose batch aborted at the
/// blockchain) drift back to PENDING once their retention lapses.
#[instrument(level = "debug", skip_all)]
async fn reset_stale(app: &App) -> anyhow::Result<()> {
    let cutoff = Utc::now()
        - chrono::Duration::from_std(app.config.app.ready_retention)
            .unwrap_or_else(|_| chrono::Duration::hours(3));

    let reset = app.database.pool.reset_stale_requests(cutoff).await?;
    if reset > 0 {
        info!(reset, "returned stale selections to PENDING");
    }

    Ok(())
}
