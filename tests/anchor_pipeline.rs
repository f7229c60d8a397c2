mod common;

use base64::Engine as _;
use common::prelude::*;
use iroh_car::CarReader;

#[tokio::test]
async fn single_request_single_stream_anchors_with_path_zero() -> anyhow::Result<()> {
    let docker = Cli::default();
    let env = spawn_app(&docker, None, |_| {}).await?;

    let stream = seed_stream(&env.store, "solo").await;
    let tip = commit_cid("solo-tip");

    let accepted = env
        .app
        .create_request(&stream.to_string(), &tip.to_string(), None, None)
        .await?;
    assert_eq!(accepted.status, RequestStatus::Pending);

    let summary = env.app.anchor_service.anchor().await?;
    assert_eq!(summary.selected, 1);
    assert_eq!(summary.anchored, 1);
    assert_eq!(summary.failed, 0);
    let root = summary.root.expect("batch produced a root");

    let response = env.app.request_status(&tip.to_string()).await?;
    assert_eq!(response.status, RequestStatus::Completed);

    let anchor_commit = response.anchor_commit.expect("completed carries an anchor");
    let content = anchor_commit.content.expect("anchor content");
    assert_eq!(content.path.as_deref(), Some("0"));
    assert_eq!(content.prev, tip.to_string());

    // The proof row references the published Merkle root.
    let proof_cid: cid::Cid = content.proof.unwrap().parse()?;
    let proof_block = env.store.get_block(&proof_cid).await?;
    let proof: anchor::AnchorProof = ceramic_anchor_service::ipfs::decode_dag_cbor(&proof_block)?;
    assert_eq!(proof.root, root);
    assert_eq!(proof.chain_id, "eip155:1337");

    // The witness CAR decodes and is rooted at the anchor commit.
    let car = base64::engine::general_purpose::STANDARD
        .decode(response.witness_car.expect("completed carries a witness"))?;
    let mut reader = CarReader::new(car.as_slice()).await?;
    assert_eq!(reader.header().roots(), vec![anchor_commit.cid.parse()?]);

    let mut blocks = 0;
    let mut saw_proof = false;
    while let Some((cid, _data)) = reader.next_block().await? {
        blocks += 1;
        saw_proof |= cid == proof_cid;
    }
    assert!(saw_proof, "witness bundles the proof block");
    // Single leaf: anchor commit, proof, and the root node block.
    assert_eq!(blocks, 3);

    Ok(())
}

#[tokio::test]
async fn newer_commit_replaces_older_one_for_the_stream() -> anyhow::Result<()> {
    let docker = Cli::default();
    let env = spawn_app(&docker, None, |_| {}).await?;

    let stream = seed_stream(&env.store, "busy").await;
    let first = commit_cid("busy-a");
    let second = commit_cid("busy-b");

    env.app
        .create_request(&stream.to_string(), &first.to_string(), None, None)
        .await?;
    env.app
        .create_request(&stream.to_string(), &second.to_string(), None, None)
        .await?;

    let summary = env.app.anchor_service.anchor().await?;
    assert_eq!(summary.selected, 2);
    assert_eq!(summary.anchored, 1);
    assert_eq!(summary.replaced, 1);

    let replaced = env.app.request_status(&first.to_string()).await?;
    assert_eq!(replaced.status, RequestStatus::Replaced);
    assert!(replaced.anchor_commit.is_none());

    let completed = env.app.request_status(&second.to_string()).await?;
    assert_eq!(completed.status, RequestStatus::Completed);
    assert_eq!(completed.cid, second.to_string());
    let content = completed.anchor_commit.unwrap().content.unwrap();
    assert_eq!(content.prev, second.to_string());

    Ok(())
}

#[tokio::test]
async fn create_request_is_idempotent_per_pair() -> anyhow::Result<()> {
    let docker = Cli::default();
    let env = spawn_app(&docker, None, |_| {}).await?;

    let stream = seed_stream(&env.store, "dup").await;
    let tip = commit_cid("dup-tip");

    for _ in 0..5 {
        env.app
            .create_request(&stream.to_string(), &tip.to_string(), None, None)
            .await?;
    }

    let pending = env
        .db
        .pool
        .count_requests_by_status(RequestStatus::Pending)
        .await?;
    assert_eq!(pending, 1, "five identical submissions, one pending row");

    // Idempotency ends with the terminal status: resubmitting the pair
    // after anchoring queues a fresh PENDING request.
    env.app.anchor_service.anchor().await?;
    let again = env
        .app
        .create_request(&stream.to_string(), &tip.to_string(), None, None)
        .await?;
    assert_eq!(again.status, RequestStatus::Pending);

    let pending = env
        .db
        .pool
        .count_requests_by_status(RequestStatus::Pending)
        .await?;
    assert_eq!(pending, 1);
    let completed = env
        .db
        .pool
        .count_requests_by_status(RequestStatus::Completed)
        .await?;
    assert_eq!(completed, 1);

    Ok(())
}

#[tokio::test]
async fn anchors_exist_exactly_for_completed_requests() -> anyhow::Result<()> {
    let docker = Cli::default();
    let env = spawn_app(&docker, None, |_| {}).await?;

    let streams = [
        seed_stream(&env.store, "s1").await,
        seed_stream(&env.store, "s2").await,
        seed_stream(&env.store, "s3").await,
    ];
    for (i, stream) in streams.iter().enumerate() {
        env.app
            .create_request(
                &stream.to_string(),
                &commit_cid(&format!("tip-{i}")).to_string(),
                None,
                None,
            )
            .await?;
        // Same stream again with a newer commit; the older one is replaced.
        if i == 0 {
            env.app
                .create_request(
                    &stream.to_string(),
                    &commit_cid("tip-0-newer").to_string(),
                    None,
                    None,
                )
                .await?;
        }
    }

    env.app.anchor_service.anchor().await?;

    let rows: Vec<(i64, String)> =
        sqlx::query_as("SELECT r.id, r.status FROM requests r ORDER BY r.id")
            .fetch_all(&env.db.pool)
            .await?;

    for (id, status) in rows {
        let anchor_row = env.db.pool.get_anchor_for_request(id).await?;
        if status == "COMPLETED" {
            assert!(anchor_row.is_some(), "request {id} completed without anchor");
        } else {
            assert!(anchor_row.is_none(), "request {id} ({status}) has an anchor");
        }
    }

    Ok(())
}

#[tokio::test]
async fn second_pass_on_the_same_snapshot_selects_nothing() -> anyhow::Result<()> {
    let docker = Cli::default();
    let env = spawn_app(&docker, None, |_| {}).await?;

    let stream = seed_stream(&env.store, "once").await;
    env.app
        .create_request(
            &stream.to_string(),
            &commit_cid("once-tip").to_string(),
            None,
            None,
        )
        .await?;

    let first = env.app.anchor_service.anchor().await?;
    assert_eq!(first.anchored, 1);

    let second = env.app.anchor_service.anchor().await?;
    assert_eq!(second.selected, 0);
    assert_eq!(second.anchored, 0);
    assert_eq!(second.root, None);

    Ok(())
}

#[tokio::test]
async fn metadata_failure_fails_the_request_but_not_the_batch() -> anyhow::Result<()> {
    let docker = Cli::default();
    let env = spawn_app(&docker, None, |_| {}).await?;

    let good = seed_stream(&env.store, "resolvable").await;
    // Valid stream id whose genesis block was never stored.
    let orphan = ceramic_anchor_service::stream_id::StreamId::new(0, commit_cid("missing"));

    env.app
        .create_request(
            &good.to_string(),
            &commit_cid("good-tip").to_string(),
            None,
            None,
        )
        .await?;
    env.app
        .create_request(
            &orphan.to_string(),
            &commit_cid("orphan-tip").to_string(),
            None,
            None,
        )
        .await?;

    let summary = env.app.anchor_service.anchor().await?;
    assert_eq!(summary.selected, 2);
    assert_eq!(summary.anchored, 1);
    assert_eq!(summary.failed, 1);

    let failed = env
        .app
        .request_status(&commit_cid("orphan-tip").to_string())
        .await?;
    assert_eq!(failed.status, RequestStatus::Failed);
    assert!(failed.message.contains("metadata unavailable"));

    let completed = env
        .app
        .request_status(&commit_cid("good-tip").to_string())
        .await?;
    assert_eq!(completed.status, RequestStatus::Completed);

    Ok(())
}
