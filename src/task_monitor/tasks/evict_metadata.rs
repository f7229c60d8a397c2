use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::{self, MissedTickBehavior};
use tracing::info;

use crate::app::App;
use crate::database::methods::DbMethods as _;

const SWEEP_INTERVAL: Duration = Duration::from_secs(6 * 60 * 60);

/// Drops metadata cache rows no batch has referenced within the retention
/// horizon; the next request for the stream re-resolves the genesis commit.
pub async fn run(app: Arc<App>) -> anyhow::Result<()> {
    info!("Starting metadata eviction sweeper.");

    let mut timer = time::interval(SWEEP_INTERVAL);
    timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        timer.tick().await;

        let cutoff = Utc::now()
            - chrono::Duration::from_std(app.config.app.metadata_retention)
                .unwrap_or_else(|_| chrono::Duration::days(30));

        let evicted = app.database.pool.evict_metadata(cutoff).await?;
        if evicted > 0 {
            info!(evicted, "evicted unused metadata rows");
        }
    }
}
