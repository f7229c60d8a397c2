//! Per-stream inclusion witnesses.
//!
//! A witness is a CAR whose root is the stream's anchor commit and whose
//! blocks are the minimal chain proving inclusion: the anchor commit, the
//! batch proof, and every tree node block from the Merkle root down the
//! leaf's path. Everything is content-addressed, so a witness can be
//! reassembled from the block store at any time.

use cid::Cid;
use ipld_core::ipld::Ipld;
use iroh_car::{CarHeader, CarWriter};
use serde::{Deserialize, Serialize};

use super::Error;
use crate::blockchain::TxReceipt;
use crate::database::types::AnchorEntry;
use crate::ipfs::{self, IpldStore, DAG_CBOR};
use crate::merkle::PathLine;
use crate::stream_id::StreamId;

/// The batch-wide proof block published alongside the on-chain transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnchorProof {
    pub chain_id: String,
    pub root: Cid,
    pub tx_hash: String,
    pub block_number: u64,
    pub block_timestamp: i64,
}

impl AnchorProof {
    pub fn new(root: Cid, receipt: &TxReceipt) -> Self {
        Self {
            chain_id: receipt.chain_id.clone(),
            root,
            tx_hash: receipt.tx_hash.clone(),
            block_number: receipt.block_number,
            block_timestamp: receipt.block_timestamp,
        }
    }
}

/// The per-stream anchor commit: the block a stream appends to its log to
/// record the anchor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnchorCommit {
    /// Genesis commit CID of the stream.
    pub id: Cid,
    /// The commit being witnessed.
    pub prev: Cid,
    /// The batch proof block.
    pub proof: Cid,
    /// Position of `prev` under the proof's Merkle root.
    pub path: String,
}

/// Encodes the anchor commit for `anchor` without touching the store; the
/// block is deterministic given the persisted row.
pub fn encode_anchor_commit(
    stream_id: &StreamId,
    anchor: &AnchorEntry,
) -> Result<(Cid, Vec<u8>), Error> {
    let prev: Cid = anchor
        .cid
        .parse()
        .map_err(|e| Error::Corrupt(format!("anchor cid: {e}")))?;
    let proof: Cid = anchor
        .proof_cid
        .parse()
        .map_err(|e| Error::Corrupt(format!("anchor proof cid: {e}")))?;

    let commit = AnchorCommit {
        id: *stream_id.genesis_cid(),
        prev,
        proof,
        path: anchor.path.clone(),
    };

    let bytes = ipfs::encode_dag_cbor(&commit)?;
    let cid = ipfs::block_cid(&bytes, DAG_CBOR);
    Ok((cid, bytes))
}

/// Assembles the witness CAR for one anchored stream from blocks already in
/// the store.
pub async fn witness_car(
    store: &dyn IpldStore,
    commit: (Cid, Vec<u8>),
    path: &PathLine,
) -> Result<Vec<u8>, Error> {
    let (commit_cid, commit_bytes) = commit;

    let decoded: AnchorCommit = ipfs::decode_dag_cbor(&commit_bytes)?;
    let proof_bytes = store.get_block(&decoded.proof).await?;
    let proof: AnchorProof = ipfs::decode_dag_cbor(&proof_bytes)?;

    let mut blocks = vec![
        (commit_cid, commit_bytes),
        (decoded.proof, proof_bytes),
    ];

    // Walk the tree root-down along the path, collecting each node block.
    // The final link is the tip commit itself, which lives in the stream's
    // own log, not in the witness.
    let bits: Vec<bool> = path.bits().collect();
    let mut current = proof.root;
    for (step, bit) in bits.iter().enumerate() {
        let bytes = store.get_block(&current).await?;
        let node: Ipld = ipfs::decode_dag_cbor(&bytes)?;
        blocks.push((current, bytes));

        let Ipld::List(items) = node else {
            return Err(Error::Corrupt(format!(
                "tree node {current} is not a pair block"
            )));
        };
        let next = match items.get(usize::from(*bit)) {
            Some(Ipld::Link(cid)) => *cid,
            _ => {
                return Err(Error::Corrupt(format!(
                    "tree node {current} has no child at bit {bit}"
                )))
            }
        };

        if step + 1 == bits.len() {
            if next != decoded.prev {
                return Err(Error::Corrupt(format!(
                    "path {path} does not lead to {}, found {next}",
                    decoded.prev
                )));
            }
        } else {
            current = next;
        }
    }

    let header = CarHeader::new_v1(vec![commit_cid]);
    let mut writer = CarWriter::new(header, Vec::new());
    for (cid, data) in blocks {
        writer
            .write(cid, data)
            .await
            .map_err(|e| Error::Car(e.to_string()))?;
    }
    writer.finish().await.map_err(|e| Error::Car(e.to_string()))
}
