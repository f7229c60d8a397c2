use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::future::Either;
use futures::{FutureExt, StreamExt};
use tokio::select;
use tokio::task::JoinHandle;
use tracing::error;

use crate::shutdown::Shutdown;

pub mod secret;

pub const TX_RETRY_LIMIT: u32 = 10;

/// Runs a transaction body, retrying serialization conflicts (SQLSTATE
/// 40001) with capped exponential backoff. Any other error rolls back and
/// surfaces immediately.
///
/// The body must evaluate to `Result<_, $crate::database::Error>`.
///
/// # Example
/// ```ignore
/// let request = retry_tx!(db.pool, tx, {
///     tx.insert_request(&stream, &cid, None, None).await
/// })
/// .await?;
/// ```
#[macro_export]
macro_rules! retry_tx {
    ($pool:expr, $tx:ident, $expression:expr) => {
        async {
            let mut counter: u32 = 0;
            let limit = $crate::utils::TX_RETRY_LIMIT;
            loop {
                let mut $tx = $pool.begin().await.map_err($crate::database::Error::from)?;
                let res: Result<_, $crate::database::Error> = async { $expression }.await;
                match res {
                    Ok(value) => match $tx.commit().await {
                        Ok(()) => break Ok(value),
                        Err(e) => {
                            let e = $crate::database::Error::from(e);
                            counter += 1;
                            if !e.is_serialization_conflict() || counter > limit {
                                break Err(e);
                            }
                            tracing::warn!(
                                error = ?e,
                                "tx commit hit serialization conflict ({counter}/{limit})"
                            );
                        }
                    },
                    Err(e) => {
                        let _ = $tx.rollback().await;
                        counter += 1;
                        if !e.is_serialization_conflict() || counter > limit {
                            break Err(e);
                        }
                        tracing::warn!(
                            error = ?e,
                            "tx hit serialization conflict ({counter}/{limit})"
                        );
                    }
                }
                tokio::time::sleep(std::time::Duration::from_millis(
                    25u64 << counter.min(8),
                ))
                .await;
            }
        }
    };
}

/// Spawns a future that will retry on failure with a backoff duration
///
/// The future will retry until it succeeds or a shutdown signal is received.
/// During a shutdown, the task will be immediately cancelled
pub fn spawn_with_backoff_cancel_on_shutdown<S, F>(
    future_spawner: S,
    backoff_duration: Duration,
    shutdown: Shutdown,
) -> JoinHandle<()>
where
    F: Future<Output = anyhow::Result<()>> + Send + 'static,
    S: Fn() -> F + Send + Sync + 'static,
{
    // Run task in background, returning a handle.
    tokio::spawn(async move {
        let shutting_down = AtomicBool::new(false);
        select! {
            _ = retry_future(
                future_spawner,
                backoff_duration,
                &shutting_down
            ) => {},
            _ = await_shutdown_begin(shutdown, &shutting_down) => {},
        }
    })
}

/// Spawns a future that will retry on failure with a backoff duration
///
/// The future will retry until it succeeds or a shutdown signal is received.
/// During a shutdown, the task will be allowed to finish until a shutdown
/// timeout occurs. This is useful if the task has custom cleanup logic that
/// needs to be run.
pub fn spawn_with_backoff<S, F>(
    future_spawner: S,
    backoff_duration: Duration,
    shutdown: Shutdown,
) -> JoinHandle<()>
where
    F: Future<Output = anyhow::Result<()>> + Send + 'static,
    S: Fn() -> F + Send + Sync + 'static,
{
    // Run task in background, returning a handle.
    tokio::spawn(async move {
        let shutting_down = AtomicBool::new(false);
        let retry = Either::Left(retry_future(
            future_spawner,
            backoff_duration,
            &shutting_down,
        ));
        let shutdown = Either::Right(await_shutdown_begin(shutdown, &shutting_down));

        // If retry completes then we return
        // If shutdown completes then we still wait for retry
        futures::stream::iter(vec![retry, shutdown])
            .buffered(2)
            .next()
            .await;
    })
}

async fn await_shutdown_begin(shutdown: Shutdown, shutting_down: &AtomicBool) {
    shutdown.await_shutdown_begin().await;
    shutting_down.store(true, Ordering::SeqCst);
}

async fn retry_future<S, F>(
    future_spawner: S,
    backoff_duration: Duration,
    shutting_down: &AtomicBool,
) where
    F: Future<Output = anyhow::Result<()>> + Send + 'static,
    S: Fn() -> F + Send + Sync + 'static,
{
    loop {
        let future = future_spawner();

        // Wrap in `AssertUnwindSafe` so we can call `FuturesExt::catch_unwind` on it.
        let future = std::panic::AssertUnwindSafe(future);
        let result = future.catch_unwind().await;

        match result {
            // Task succeeded or is shutting down gracefully
            Ok(Ok(t)) => return t,
            Ok(Err(e)) => {
                error!("Task failed: {e:?}");

                if shutting_down.load(Ordering::SeqCst) {
                    return;
                }

                tokio::time::sleep(backoff_duration).await;
            }
            Err(e) => {
                error!("Task panicked: {e:?}");

                if shutting_down.load(Ordering::SeqCst) {
                    return;
                }

                tokio::time::sleep(backoff_duration).await;
            }
        }
    }
}
