use std::time::Duration;

use once_cell::sync::Lazy;
use prometheus::{register_int_counter, IntCounter};
use sqlx::{Postgres, Transaction};
use tracing::{debug, instrument, warn};

use super::{Database, Error, TRANSACTION_MUTEX_ID};

/// How many failed acquisitions in one call before the metric fires.
const MUTEX_ATTEMPT_WARNING_THRESHOLD: u32 = 5;

static MANY_ATTEMPTS_TO_ACQUIRE_MUTEX: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "many_attempts_to_acquire_mutex",
        "Calls that needed more than five attempts to take the anchor mutex"
    )
    .unwrap()
});

/// Transaction coordination for the anchor pipeline.
impl Database {
    /// Opens a transaction holding the fleet-wide anchor mutex.
    ///
    /// The advisory lock is transaction-scoped: it releases automatically
    /// when the returned transaction commits, rolls back, or is dropped, so
    /// every pipeline phase that must run under the mutex has to run inside
    /// this transaction (savepoints included).
    #[instrument(skip(self), level = "debug")]
    pub async fn transaction_mutex(
        &self,
        max_attempts: u32,
        delay: Duration,
    ) -> Result<Transaction<'static, Postgres>, Error> {
        for attempt in 1..=max_attempts {
            let mut tx = self.pool.begin().await?;

            let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_xact_lock($1)")
                .bind(TRANSACTION_MUTEX_ID)
                .fetch_one(&mut *tx)
                .await?;

            if acquired {
                debug!(attempt, "acquired anchor transaction mutex");
                return Ok(tx);
            }

            tx.rollback().await?;

            if attempt == MUTEX_ATTEMPT_WARNING_THRESHOLD {
                MANY_ATTEMPTS_TO_ACQUIRE_MUTEX.inc();
                warn!(attempt, "anchor transaction mutex is contended");
            }

            // Every failed attempt waits out the delay, the last included,
            // so exhaustion takes max_attempts delays.
            tokio::time::sleep(delay).await;
        }

        Err(Error::MutexUnavailable {
            attempts: max_attempts,
        })
    }

}
