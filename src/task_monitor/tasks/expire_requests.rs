use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::{self, MissedTickBehavior};
use tracing::info;

use crate::app::App;
use crate::database::methods::DbMethods as _;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Fails PENDING requests that outlived `app.request_expiry`; clients see
/// FAILED with an explanatory message rather than a request stuck forever.
pub async fn run(app: Arc<App>) -> anyhow::Result<()> {
    info!("Starting request expiry sweeper.");

    let mut timer = time::interval(SWEEP_INTERVAL);
    timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        timer.tick().await;

        let cutoff = Utc::now()
            - chrono::Duration::from_std(app.config.app.request_expiry)
                .unwrap_or_else(|_| chrono::Duration::days(3));

        let expired = app.database.pool.expire_requests(cutoff).await?;
        if expired > 0 {
            info!(expired, "expired old pending requests");
        }
    }
}
