use async_trait::async_trait;
use cid::Cid;

use crate::database::types::RequestEntry;
use crate::merkle::PathLine;
use crate::metadata::GenesisFields;
use crate::stream_id::StreamId;

/// An anchor that some other service already published for a stream tip.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteAnchor {
    pub proof: Cid,
    pub path: PathLine,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RemoteAnchorStatus {
    NotAnchored,
    /// The stream is anchored at this tip or a descendant; the proof may or
    /// may not be retrievable.
    Anchored { existing: Option<RemoteAnchor> },
}

/// Reports anchors published outside this service. Wired in optionally; the
/// default deployment runs without one and anchors every candidate itself.
#[async_trait]
pub trait AnchorIndex: Send + Sync {
    async fn check(&self, stream_id: &StreamId, tip: &Cid)
        -> anyhow::Result<RemoteAnchorStatus>;
}

/// Fixed at construction so the candidate never mutates mid-pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    /// Include in the Merkle tree and anchor it here.
    Anchor,
    /// A remote anchor supersedes ours; keep the bookkeeping, skip the tree.
    AlreadyAnchored { existing: Option<RemoteAnchor> },
}

/// Per-stream aggregate for one batch: the stream's genesis fields, the tip
/// commit chosen to represent the stream, the owning request, and the ids of
/// earlier same-stream requests the tip replaces.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub stream_id: StreamId,
    pub genesis: GenesisFields,
    pub cid: Cid,
    pub request: RequestEntry,
    pub replaced: Vec<i64>,
    pub disposition: Disposition,
}

impl Candidate {
    pub fn should_anchor(&self) -> bool {
        matches!(self.disposition, Disposition::Anchor)
    }
}

/// A same-stream request group before metadata resolution: the last request
/// by `(created_at, id)` is the tip, the rest will be marked REPLACED.
#[derive(Debug, Clone)]
pub struct StreamGroup {
    pub stream_id: StreamId,
    pub tip: RequestEntry,
    pub tip_cid: Cid,
    pub replaced: Vec<i64>,
}

/// A request that cannot become a candidate, with the reason recorded in its
/// FAILED message.
#[derive(Debug, Clone)]
pub struct RejectedRequest {
    pub request_id: i64,
    pub reason: String,
}

/// Groups a selected batch by stream and picks each stream's tip.
///
/// The batch must already be sorted by `(created_at, id)`; grouping keeps
/// that order, so the last entry of each group is the newest request.
/// Requests whose identifiers fail to re-parse (the intake validated them,
/// so this means corruption) are rejected rather than aborting the batch.
pub fn group_requests(batch: &[RequestEntry]) -> (Vec<StreamGroup>, Vec<RejectedRequest>) {
    let mut groups: Vec<StreamGroup> = Vec::new();
    let mut rejected = Vec::new();

    for request in batch {
        let stream_id: StreamId = match request.stream_id.parse() {
            Ok(id) => id,
            Err(e) => {
                rejected.push(RejectedRequest {
                    request_id: request.id,
                    reason: format!("unparseable stream id: {e}"),
                });
                continue;
            }
        };
        let tip_cid: Cid = match request.cid.parse() {
            Ok(cid) => cid,
            Err(e) => {
                rejected.push(RejectedRequest {
                    request_id: request.id,
                    reason: format!("unparseable commit cid: {e}"),
                });
                continue;
            }
        };

        match groups.iter_mut().find(|g| g.stream_id == stream_id) {
            Some(group) => {
                // Batch order makes this request the new tip.
                group.replaced.push(group.tip.id);
                group.tip = request.clone();
                group.tip_cid = tip_cid;
            }
            None => groups.push(StreamGroup {
                stream_id,
                tip: request.clone(),
                tip_cid,
                replaced: Vec::new(),
            }),
        }
    }

    (groups, rejected)
}
