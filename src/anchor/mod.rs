//! The anchor batch pipeline.
//!
//! One pass: select ready requests under the fleet-wide mutex, deduplicate
//! them into per-stream candidates, build the Merkle tree, publish the root,
//! persist anchors and status transitions atomically, then emit per-stream
//! witness CARs. Two workers can race `anchor()`; the advisory lock ensures
//! only one batch is in flight.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use cid::Cid;
use sqlx::{Acquire as _, Postgres, Transaction};
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::blockchain::{self, BlockchainClient};
use crate::config::Config;
use crate::database::methods::DbMethods as _;
use crate::database::types::{RequestEntry, RequestStatus};
use crate::database::{self, Database};
use crate::ipfs::{self, IpldStore, DAG_CBOR};
use crate::merkle::{MerkleTree, MerkleTreeFactory, PathLine};
use crate::metadata::{self, MetadataResolver};
use crate::stream_id::StreamId;

pub mod candidate;
pub mod merge;
pub mod witness;

pub use candidate::{AnchorIndex, Candidate, Disposition, RemoteAnchor, RemoteAnchorStatus};
pub use merge::{CandidateOrder, CollectModels, IpldMerge, TreeMetadata};
pub use witness::{AnchorCommit, AnchorProof};

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Database(#[from] database::Error),

    #[error(transparent)]
    Merkle(#[from] crate::merkle::Error),

    #[error(transparent)]
    Metadata(#[from] metadata::Error),

    #[error(transparent)]
    Blockchain(#[from] blockchain::Error),

    #[error(transparent)]
    Store(#[from] ipfs::Error),

    #[error("car encoding failed: {0}")]
    Car(String),

    #[error("invalid persisted state: {0}")]
    Corrupt(String),
}

impl Error {
    fn is_serialization_conflict(&self) -> bool {
        matches!(self, Self::Database(e) if e.is_serialization_conflict())
    }
}

/// What one `anchor()` pass did.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct AnchorSummary {
    pub selected: usize,
    pub anchored: usize,
    pub already_anchored: usize,
    pub replaced: usize,
    pub failed: usize,
    pub root: Option<Cid>,
}

/// Witness material carried out of the commit for post-commit CAR emission.
#[derive(Debug, Clone)]
struct StreamWitness {
    stream_id: StreamId,
    commit: (Cid, Vec<u8>),
    path: PathLine,
}

pub struct AnchorService {
    database: Arc<Database>,
    ipfs: Arc<dyn IpldStore>,
    blockchain: Arc<dyn BlockchainClient>,
    resolver: MetadataResolver,
    anchor_index: Option<Arc<dyn AnchorIndex>>,
    factory: MerkleTreeFactory<Cid, Candidate, TreeMetadata>,
    config: Config,
}

impl AnchorService {
    pub fn new(
        database: Arc<Database>,
        ipfs: Arc<dyn IpldStore>,
        blockchain: Arc<dyn BlockchainClient>,
        anchor_index: Option<Arc<dyn AnchorIndex>>,
        config: Config,
    ) -> Self {
        let resolver = MetadataResolver::new(database.clone(), ipfs.clone());
        let factory = MerkleTreeFactory::new(
            Arc::new(IpldMerge::new(ipfs.clone())),
            Some(Arc::new(CandidateOrder)),
            Some(Arc::new(CollectModels)),
            config.merkle.depth_limit,
        );

        Self {
            database,
            ipfs,
            blockchain,
            resolver,
            anchor_index,
            factory,
            config,
        }
    }

    /// Runs one anchor pass, retrying the whole locked attempt on
    /// serialization conflicts up to the configured bound.
    #[instrument(skip(self))]
    pub async fn anchor(&self) -> Result<AnchorSummary, Error> {
        const RETRY_BASE: Duration = Duration::from_millis(100);
        const RETRY_CAP: Duration = Duration::from_secs(5);

        let max_retries = self.config.txn.max_serialization_retries;
        let mut attempt: u32 = 0;

        let (summary, witnesses) = loop {
            match self.anchor_batch().await {
                Ok(outcome) => break outcome,
                Err(e) if e.is_serialization_conflict() && attempt < max_retries => {
                    attempt += 1;
                    let delay = RETRY_BASE
                        .checked_mul(1 << attempt.min(16))
                        .unwrap_or(RETRY_CAP)
                        .min(RETRY_CAP);
                    warn!(attempt, ?delay, "anchor batch hit serialization conflict, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        };

        // Witness CARs are emitted only after the batch transaction has
        // committed; everything in them is content-addressed, so repeats
        // after a crash are harmless.
        self.write_witnesses(&witnesses).await?;

        if summary.selected > 0 {
            info!(
                selected = summary.selected,
                anchored = summary.anchored,
                already_anchored = summary.already_anchored,
                replaced = summary.replaced,
                failed = summary.failed,
                root = ?summary.root,
                "anchor pass finished"
            );
        }

        Ok(summary)
    }

    /// One locked attempt: everything up to and including the commit.
    async fn anchor_batch(&self) -> Result<(AnchorSummary, Vec<StreamWitness>), Error> {
        let mut tx = self
            .database
            .transaction_mutex(self.config.mutex.max_attempts, self.config.mutex.delay)
            .await?;

        match self.run_under_mutex(&mut tx).await {
            Ok(outcome) => {
                tx.commit().await.map_err(database::Error::from)?;
                Ok(outcome)
            }
            // The root may already be broadcast, and the selection must
            // survive so these requests are re-attempted (and eventually
            // swept back to PENDING) instead of silently deselected. Commit
            // what phase 1 did; the lock releases with the commit.
            Err(e @ Error::Blockchain(_)) => {
                tx.commit().await.map_err(database::Error::from)?;
                Err(e)
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    warn!(error = ?rollback, "rollback after failed anchor batch also failed");
                }
                Err(e)
            }
        }
    }

    async fn run_under_mutex(
        &self,
        tx: &mut Transaction<'static, Postgres>,
    ) -> Result<(AnchorSummary, Vec<StreamWitness>), Error> {
        // Phase 1: batch selection in its own savepoint. Phase 4 runs in a
        // second savepoint; a failure between the two rolls only itself back
        // while the selection stays intact inside the outer transaction.
        let batch = {
            let mut sp = tx.begin().await.map_err(database::Error::from)?;
            let batch = self.select_batch(&mut sp).await?;
            if !batch.is_empty() {
                let ids: Vec<i64> = batch.iter().map(|r| r.id).collect();
                sp.mark_processing(&ids, &self.config.app.scheduler_id).await?;
            }
            sp.commit().await.map_err(database::Error::from)?;
            batch
        };

        let mut summary = AnchorSummary {
            selected: batch.len(),
            ..AnchorSummary::default()
        };
        if batch.is_empty() {
            return Ok((summary, Vec::new()));
        }

        // Phase 2: deduplicate into candidates and resolve genesis fields.
        // Per-stream failures mark that request FAILED without aborting the
        // batch; infrastructure failures abort.
        let (groups, rejected) = candidate::group_requests(&batch);
        let mut failed: Vec<(i64, String)> = rejected
            .into_iter()
            .map(|r| (r.request_id, r.reason))
            .collect();
        let mut orphaned_replaced: Vec<i64> = Vec::new();
        let mut candidates: Vec<Candidate> = Vec::new();

        for group in groups {
            let genesis = match self.resolver.resolve(&group.stream_id).await {
                Ok(genesis) => genesis,
                Err(metadata::Error::Unavailable { reason, .. }) => {
                    failed.push((group.tip.id, format!("metadata unavailable: {reason}")));
                    orphaned_replaced.extend(group.replaced);
                    continue;
                }
                Err(metadata::Error::Database(e)) => return Err(e.into()),
            };

            let disposition = self.remote_disposition(&group).await;
            candidates.push(Candidate {
                stream_id: group.stream_id,
                genesis,
                cid: group.tip_cid,
                request: group.tip,
                replaced: group.replaced,
                disposition,
            });
        }

        // Phase 3: tree build and root publication, lock still held. A fatal
        // submission failure aborts here; the selected requests stay READY
        // and are reset to PENDING by the stale sweep.
        let to_anchor: Vec<Candidate> = candidates
            .iter()
            .filter(|c| c.should_anchor())
            .cloned()
            .collect();

        let anchored_tree = if to_anchor.is_empty() {
            None
        } else {
            let tree = self.factory.build(to_anchor).await?;
            let root = *tree.root();

            let receipt = blockchain::submit_with_retry(
                &*self.blockchain,
                root,
                self.config.blockchain.submit_retries,
                self.config.blockchain.submit_backoff,
            )
            .await?;

            let proof = AnchorProof::new(root, &receipt);
            let proof_cid = ipfs::put_dag_cbor(&*self.ipfs, &proof).await?;

            summary.root = Some(root);
            Some((tree, proof_cid))
        };

        // Phase 4: anchors and status transitions, atomically.
        let mut witnesses = Vec::new();
        {
            let mut sp = tx.begin().await.map_err(database::Error::from)?;

            if let Some((tree, proof_cid)) = &anchored_tree {
                witnesses = self
                    .persist_anchored(&mut sp, tree, *proof_cid, &mut summary)
                    .await?;
            }

            for cand in &candidates {
                if let Disposition::AlreadyAnchored { existing } = &cand.disposition {
                    self.persist_already_anchored(&mut sp, cand, existing.as_ref())
                        .await?;
                    summary.already_anchored += 1;
                }

                if !cand.replaced.is_empty() {
                    summary.replaced += cand.replaced.len();
                    sp.update_request_statuses(
                        &cand.replaced,
                        RequestStatus::Replaced,
                        Some("replaced by newer commit for the stream"),
                    )
                    .await?;
                }
            }

            if !orphaned_replaced.is_empty() {
                summary.replaced += orphaned_replaced.len();
                sp.update_request_statuses(
                    &orphaned_replaced,
                    RequestStatus::Replaced,
                    Some("replaced by newer commit for the stream"),
                )
                .await?;
            }

            for (id, reason) in &failed {
                summary.failed += 1;
                sp.update_request_statuses(&[*id], RequestStatus::Failed, Some(reason.as_str()))
                    .await?;
            }

            let streams: Vec<String> = candidates
                .iter()
                .map(|c| c.request.stream_id.clone())
                .collect();
            if !streams.is_empty() {
                sp.touch_metadata(&streams).await?;
            }

            sp.commit().await.map_err(database::Error::from)?;
        }

        Ok((summary, witnesses))
    }

    /// Batch selection per the linger policy: below the minimum size the
    /// batch only goes out once the oldest pending request has waited the
    /// full linger.
    async fn select_batch(
        &self,
        sp: &mut Transaction<'_, Postgres>,
    ) -> Result<Vec<RequestEntry>, Error> {
        let count = sp.count_batchable_requests().await?;
        if count == 0 {
            return Ok(Vec::new());
        }

        if (count as usize) < self.config.app.min_batch_size {
            let linger = chrono::Duration::from_std(self.config.app.batch_linger)
                .unwrap_or_else(|_| chrono::Duration::seconds(i64::MAX / 1_000));
            let ripe = match sp.oldest_pending_created_at().await? {
                Some(oldest) => Utc::now() - oldest >= linger,
                // Nothing PENDING means leftovers from an aborted batch;
                // always pick those up.
                None => true,
            };
            if !ripe {
                return Ok(Vec::new());
            }
        }

        let batch = sp
            .select_ready_batch(
                self.config.app.max_batch_size as i64,
                &self.config.app.scheduler_id,
            )
            .await?;
        Ok(batch)
    }

    async fn remote_disposition(&self, group: &candidate::StreamGroup) -> Disposition {
        let Some(index) = &self.anchor_index else {
            return Disposition::Anchor;
        };

        match index.check(&group.stream_id, &group.tip_cid).await {
            Ok(RemoteAnchorStatus::Anchored { existing }) => {
                Disposition::AlreadyAnchored { existing }
            }
            Ok(RemoteAnchorStatus::NotAnchored) => Disposition::Anchor,
            Err(e) => {
                // An unreachable index is no reason to skip anchoring.
                warn!(stream = %group.stream_id, error = ?e, "anchor index check failed");
                Disposition::Anchor
            }
        }
    }

    async fn persist_anchored(
        &self,
        sp: &mut Transaction<'_, Postgres>,
        tree: &MerkleTree<Cid, Candidate, TreeMetadata>,
        proof_cid: Cid,
        summary: &mut AnchorSummary,
    ) -> Result<Vec<StreamWitness>, Error> {
        let mut witnesses = Vec::with_capacity(tree.leaf_count());

        let leaves: Vec<Candidate> = tree.leaves().cloned().collect();
        for (ordinal, leaf) in leaves.iter().enumerate() {
            let path = tree.path(ordinal);

            let row = sp
                .insert_anchor(
                    leaf.request.id,
                    path.as_str(),
                    &leaf.cid.to_string(),
                    &proof_cid.to_string(),
                )
                .await?;
            sp.update_request_statuses(
                &[leaf.request.id],
                RequestStatus::Completed,
                Some("CID successfully anchored"),
            )
            .await?;

            let commit = witness::encode_anchor_commit(&leaf.stream_id, &row)?;
            self.ipfs.put_block(&commit.1, DAG_CBOR).await?;

            summary.anchored += 1;
            witnesses.push(StreamWitness {
                stream_id: leaf.stream_id.clone(),
                commit,
                path,
            });
        }

        Ok(witnesses)
    }

    async fn persist_already_anchored(
        &self,
        sp: &mut Transaction<'_, Postgres>,
        cand: &Candidate,
        existing: Option<&RemoteAnchor>,
    ) -> Result<(), Error> {
        match existing {
            Some(remote) => {
                sp.insert_anchor(
                    cand.request.id,
                    remote.path.as_str(),
                    &cand.cid.to_string(),
                    &remote.proof.to_string(),
                )
                .await?;
                sp.update_request_statuses(
                    &[cand.request.id],
                    RequestStatus::Completed,
                    Some("already anchored; existing proof reused"),
                )
                .await?;
            }
            None => {
                sp.update_request_statuses(
                    &[cand.request.id],
                    RequestStatus::Completed,
                    Some("already anchored remotely; no proof recorded"),
                )
                .await?;
            }
        }
        Ok(())
    }

    /// Post-commit witness emission: assemble each stream's CAR and store
    /// it, with bounded retries per stream.
    async fn write_witnesses(&self, witnesses: &[StreamWitness]) -> Result<(), Error> {
        const PUT_ATTEMPTS: u32 = 3;
        const PUT_BACKOFF: Duration = Duration::from_millis(250);

        for w in witnesses {
            let car = witness::witness_car(&*self.ipfs, w.commit.clone(), &w.path).await?;

            let mut attempt = 1;
            loop {
                match self.ipfs.put_block(&car, ipfs::CAR).await {
                    Ok(cid) => {
                        info!(stream = %w.stream_id, witness = %cid, "stored witness car");
                        break;
                    }
                    Err(e) if attempt < PUT_ATTEMPTS => {
                        warn!(stream = %w.stream_id, attempt, error = %e, "witness car store failed");
                        attempt += 1;
                        tokio::time::sleep(PUT_BACKOFF * attempt).await;
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }

        Ok(())
    }
}
