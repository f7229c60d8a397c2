use std::sync::Arc;
use std::time::Duration;

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use once_cell::sync::Lazy;
use prometheus::{linear_buckets, register_gauge, register_histogram, Gauge, Histogram};
use tokio::select;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

use crate::app::App;
use crate::database::methods::DbMethods as _;
use crate::database::types::RequestStatus;
use crate::database::Database;
use crate::shutdown::Shutdown;

pub mod tasks;

const ANCHOR_BACKOFF: Duration = Duration::from_secs(5);
const EXPIRE_REQUESTS_BACKOFF: Duration = Duration::from_secs(30);
const EVICT_METADATA_BACKOFF: Duration = Duration::from_secs(30);
const QUEUE_MONITOR_BACKOFF: Duration = Duration::from_secs(5);

static PENDING_REQUESTS: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!("pending_requests", "Anchor requests waiting for a batch").unwrap()
});

static BATCH_SIZES: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "anchor_batch_sizes",
        "Leaves per anchored batch",
        linear_buckets(f64::from(1), f64::from(32), 64).unwrap()
    )
    .unwrap()
});

/// A task manager for all long running tasks
///
/// It's assumed that there is only one instance at a time.
/// Spawning multiple `TaskMonitors` will result in undefined behavior,
/// including duplicate batch attempts.
pub struct TaskMonitor;

impl TaskMonitor {
    /// Initialize and run the task monitor
    #[instrument(level = "debug", skip_all)]
    pub async fn init(main_app: Arc<App>, shutdown: Shutdown) {
        let handles = FuturesUnordered::new();

        // Anchor batches
        let app = main_app.clone();
        let anchor = move || tasks::anchor::run(app.clone());
        let anchor_handle = crate::utils::spawn_with_backoff_cancel_on_shutdown(
            anchor,
            ANCHOR_BACKOFF,
            shutdown.clone(),
        );
        handles.push(anchor_handle);

        // Expire old pending requests
        let app = main_app.clone();
        let expire = move || tasks::expire_requests::run(app.clone());
        let expire_handle = crate::utils::spawn_with_backoff_cancel_on_shutdown(
            expire,
            EXPIRE_REQUESTS_BACKOFF,
            shutdown.clone(),
        );
        handles.push(expire_handle);

        // Evict unused metadata
        let app = main_app.clone();
        let evict = move || tasks::evict_metadata::run(app.clone());
        let evict_handle = crate::utils::spawn_with_backoff_cancel_on_shutdown(
            evict,
            EVICT_METADATA_BACKOFF,
            shutdown.clone(),
        );
        handles.push(evict_handle);

        // Report queue depth
        let app = main_app.clone();
        let queue_monitor = move || tasks::monitor_queue::run(app.clone());
        let queue_monitor_handle = crate::utils::spawn_with_backoff_cancel_on_shutdown(
            queue_monitor,
            QUEUE_MONITOR_BACKOFF,
            shutdown.clone(),
        );
        handles.push(queue_monitor_handle);

        tokio::spawn(Self::monitor_shutdown(handles, shutdown.clone()));
    }

    async fn monitor_shutdown(mut handles: FuturesUnordered<JoinHandle<()>>, shutdown: Shutdown) {
        select! {
            // Wait for the shutdown signal
            _ = shutdown.await_shutdown_begin() => {}
            // Or wait for a task to panic
            _ = Self::await_task_panic(&mut handles, shutdown.clone()) => {}
        };
    }

    async fn await_task_panic(handles: &mut FuturesUnordered<JoinHandle<()>>, shutdown: Shutdown) {
        while let Some(result) = handles.next().await {
            if !shutdown.is_shutting_down() {
                match result {
                    Ok(()) => {
                        info!("task exited");
                    }
                    Err(error) => {
                        error!(?error, "task panicked");
                        // Instruct the rest of the app to shutdown
                        shutdown.shutdown();
                        return;
                    }
                }
            }
        }
        warn!("all tasks have returned unexpectedly");
    }

    pub(crate) async fn log_pending_requests_count(database: &Database) -> anyhow::Result<()> {
        let pending = database
            .pool
            .count_requests_by_status(RequestStatus::Pending)
            .await?;
        PENDING_REQUESTS.set(pending as f64);
        Ok(())
    }

    #[allow(clippy::cast_precision_loss)]
    pub(crate) fn log_batch_size(size: usize) {
        BATCH_SIZES.observe(size as f64);
    }
}
