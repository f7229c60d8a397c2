use std::cmp::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use cid::Cid;
use serde::{Deserialize, Serialize};

use super::candidate::Candidate;
use crate::ipfs::{put_dag_cbor, IpldStore};
use crate::merkle::{CompareFunction, MergeFunction, MetadataFunction, NodeData};

/// Per-tree metadata linked from the root block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeMetadata {
    /// Distinct models among the batch's streams, as StreamID text.
    pub models: Vec<String>,
}

/// Encodes a node pair as a dag-cbor block `[left, right]` and yields its
/// CID. The root additionally links the tree metadata: `[left, right, meta]`.
/// Blocks go straight into the store; content addressing makes rebuilds
/// idempotent.
pub struct IpldMerge {
    store: Arc<dyn IpldStore>,
}

impl IpldMerge {
    pub fn new(store: Arc<dyn IpldStore>) -> Self {
        Self { store }
    }
}

fn link(data: &NodeData<Cid, Candidate>) -> Cid {
    match data {
        NodeData::Branch(cid) => *cid,
        NodeData::Leaf(candidate) => candidate.cid,
    }
}

#[async_trait]
impl MergeFunction<Cid, Candidate, TreeMetadata> for IpldMerge {
    async fn merge(
        &self,
        left: &NodeData<Cid, Candidate>,
        right: Option<&NodeData<Cid, Candidate>>,
        metadata: Option<&TreeMetadata>,
    ) -> anyhow::Result<Cid> {
        let left = link(left);
        let right = right.map(link);

        let cid = match metadata {
            None => put_dag_cbor(&*self.store, &(left, right)).await?,
            Some(meta) => {
                let meta_cid = put_dag_cbor(&*self.store, meta).await?;
                put_dag_cbor(&*self.store, &(left, right, meta_cid)).await?
            }
        };

        Ok(cid)
    }
}

/// Leaf order: model-bearing streams first (so model instances share
/// subtrees), then stream id lexicographically, ties broken by commit CID.
pub struct CandidateOrder;

impl CompareFunction<Candidate> for CandidateOrder {
    fn compare(&self, a: &Candidate, b: &Candidate) -> Ordering {
        b.genesis
            .model
            .is_some()
            .cmp(&a.genesis.model.is_some())
            .then_with(|| a.request.stream_id.cmp(&b.request.stream_id))
            .then_with(|| a.cid.cmp(&b.cid))
    }
}

/// Collects the distinct models present in a batch.
pub struct CollectModels;

impl MetadataFunction<Candidate, TreeMetadata> for CollectModels {
    fn generate_metadata(&self, leaves: &[Candidate]) -> TreeMetadata {
        let mut models: Vec<String> = leaves
            .iter()
            .filter_map(|c| c.genesis.model_stream())
            .map(|m| m.to_string())
            .collect();
        models.sort();
        models.dedup();
        TreeMetadata { models }
    }
}

#[cfg(test)]
mod tests {
    use multihash_codetable::{Code, MultihashDigest};

    use super::super::candidate::Disposition;
    use super::*;
    use crate::database::types::{RequestEntry, RequestStatus};
    use crate::ipfs::{self, MemoryIpldStore};
    use crate::merkle::MerkleTreeFactory;
    use crate::metadata::GenesisFields;
    use crate::stream_id::StreamId;

    fn commit(tag: &[u8]) -> Cid {
        Cid::new_v1(0x71, Code::Sha2_256.digest(tag))
    }

    fn candidate(tag: &[u8], model: Option<&StreamId>) -> Candidate {
        let stream_id = StreamId::new(0, commit(tag));
        let now = chrono::Utc::now();
        Candidate {
            stream_id: stream_id.clone(),
            genesis: GenesisFields {
                controllers: vec!["did:key:z6MkgYG".to_string()],
                model: model.map(StreamId::to_vec),
                schema: None,
                family: None,
                tags: None,
            },
            cid: commit(&[tag, b"-tip"].concat()),
            request: RequestEntry {
                id: 1,
                stream_id: stream_id.to_string(),
                cid: commit(&[tag, b"-tip"].concat()).to_string(),
                status: RequestStatus::Ready,
                message: None,
                pinned: false,
                created_at: now,
                updated_at: now,
                timestamp: None,
                origin: None,
                scheduler_id: None,
            },
            replaced: Vec::new(),
            disposition: Disposition::Anchor,
        }
    }

    fn factory(
        store: Arc<MemoryIpldStore>,
        depth_limit: usize,
    ) -> MerkleTreeFactory<Cid, Candidate, TreeMetadata> {
        MerkleTreeFactory::new(
            Arc::new(IpldMerge::new(store)),
            Some(Arc::new(CandidateOrder)),
            Some(Arc::new(CollectModels)),
            depth_limit,
        )
    }

    #[tokio::test]
    async fn equal_batches_build_equal_roots() {
        let store = Arc::new(MemoryIpldStore::new());
        let leaves = vec![candidate(b"a", None), candidate(b"b", None), candidate(b"c", None)];

        let one = factory(store.clone(), 3).build(leaves.clone()).await.unwrap();
        let two = factory(store, 3).build(leaves).await.unwrap();

        assert_eq!(one.root(), two.root());
    }

    #[tokio::test]
    async fn node_blocks_are_link_pairs() {
        let store = Arc::new(MemoryIpldStore::new());
        let tree = factory(store.clone(), 2)
            .build(vec![candidate(b"a", None), candidate(b"b", None)])
            .await
            .unwrap();

        let block = store.get_block(tree.root()).await.unwrap();
        let decoded: (Cid, Option<Cid>, Cid) = ipfs::decode_dag_cbor(&block).unwrap();
        // Both children of a two-leaf root are the tip commits themselves,
        // in sorted leaf order.
        let tips: Vec<Cid> = tree.leaves().map(|c| c.cid).collect();
        assert_eq!(decoded.0, tips[0]);
        assert_eq!(decoded.1, Some(tips[1]));
    }

    #[tokio::test]
    async fn model_streams_sort_first() {
        let model = StreamId::new(2, commit(b"model"));
        let with_model = candidate(b"zz", Some(&model));
        let without = candidate(b"aa", None);

        let store = Arc::new(MemoryIpldStore::new());
        let tree = factory(store, 2)
            .build(vec![without.clone(), with_model.clone()])
            .await
            .unwrap();

        let first = tree.leaves().next().unwrap();
        assert_eq!(first.stream_id, with_model.stream_id);
        assert_eq!(
            tree.metadata().unwrap().models,
            vec![model.to_string()]
        );
    }
}
