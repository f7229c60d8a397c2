use std::sync::Arc;
use std::time::Duration;

use tokio::time::{self, MissedTickBehavior};

use crate::app::App;
use crate::task_monitor::TaskMonitor;

const REPORT_INTERVAL: Duration = Duration::from_secs(30);

/// Publishes queue-depth gauges for dashboards and alerting.
pub async fn run(app: Arc<App>) -> anyhow::Result<()> {
    let mut timer = time::interval(REPORT_INTERVAL);
    timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        timer.tick().await;
        TaskMonitor::log_pending_requests_count(&app.database).await?;
    }
}
