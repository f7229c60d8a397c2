mod common;

use std::time::Duration;

use common::prelude::*;
use ceramic_anchor_service::database;

#[tokio::test]
async fn mutex_is_exclusive_until_released() -> anyhow::Result<()> {
    let docker = Cli::default();
    let env = spawn_app(&docker, None, |_| {}).await?;

    let held = env
        .db
        .transaction_mutex(3, Duration::from_millis(10))
        .await?;

    // Second caller burns its three attempts (and three delays) against
    // the held lock.
    let started = std::time::Instant::now();
    let err = env
        .db
        .transaction_mutex(3, Duration::from_millis(10))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        database::Error::MutexUnavailable { attempts: 3 }
    ));
    assert!(
        started.elapsed() >= Duration::from_millis(30),
        "each of the three failed attempts waits out the delay"
    );

    // Rolling back the holder releases the advisory lock with it.
    held.rollback().await?;
    let reacquired = env
        .db
        .transaction_mutex(3, Duration::from_millis(10))
        .await?;
    reacquired.commit().await?;

    Ok(())
}

#[tokio::test]
async fn racing_workers_anchor_exactly_once() -> anyhow::Result<()> {
    let docker = Cli::default();
    let env = spawn_app(&docker, None, |_| {}).await?;

    let stream = seed_stream(&env.store, "raced").await;
    env.app
        .create_request(
            &stream.to_string(),
            &commit_cid("raced-tip").to_string(),
            None,
            None,
        )
        .await?;

    // While one worker holds the mutex, an anchor pass either waits it out
    // and then finds an empty selection, or gives up with MutexUnavailable.
    let held = env
        .db
        .transaction_mutex(3, Duration::from_millis(10))
        .await?;

    let blocked = env.app.anchor_service.anchor().await;
    match blocked {
        Err(anchor::Error::Database(database::Error::MutexUnavailable { .. })) => {}
        other => panic!("expected MutexUnavailable while lock is held, got {other:?}"),
    }

    // Nothing moved while the lock was contended.
    assert_eq!(
        env.db
            .pool
            .count_requests_by_status(RequestStatus::Completed)
            .await?,
        0
    );

    held.rollback().await?;

    let summary = env.app.anchor_service.anchor().await?;
    assert_eq!(summary.anchored, 1);

    let second = env.app.anchor_service.anchor().await?;
    assert_eq!(second.selected, 0);

    Ok(())
}
