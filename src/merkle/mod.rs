//! Depth-bounded binary Merkle trees over arbitrary node payloads.
//!
//! The factory is parameterised by three capabilities: a [`MergeFunction`]
//! combining two children into a parent, an optional [`CompareFunction`]
//! fixing the leaf order before the build, and an optional
//! [`MetadataFunction`] producing per-tree metadata handed to the root merge
//! only. The tree shape is fully determined by the sorted leaf sequence, so
//! equal inputs always rebuild to the same root.

use std::cmp::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use thiserror::Error;

pub mod path;

pub use path::PathLine;

#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot build a merkle tree from zero leaves")]
    EmptyLeaves,

    #[error("merkle tree exceeded depth limit {limit} (at most {max} leaves)")]
    DepthExceeded { limit: usize, max: u64 },

    #[error("merge failed: {0}")]
    Merge(anyhow::Error),
}

/// Combines two child nodes into a parent payload. `right` is absent only
/// for the root of a single-leaf tree; `metadata` is passed only to the
/// root merge.
#[async_trait]
pub trait MergeFunction<N, L, M>: Send + Sync {
    async fn merge(
        &self,
        left: &NodeData<N, L>,
        right: Option<&NodeData<N, L>>,
        metadata: Option<&M>,
    ) -> anyhow::Result<N>;
}

/// Total order used to sort leaves before the build. Must be total and
/// stable so that equal leaf sets produce equal trees.
pub trait CompareFunction<L>: Send + Sync {
    fn compare(&self, a: &L, b: &L) -> Ordering;
}

/// Produces the per-tree metadata consumed by the root merge.
pub trait MetadataFunction<L, M>: Send + Sync {
    fn generate_metadata(&self, leaves: &[L]) -> M;
}

/// Payload of a tree position: merged branch value or original leaf.
#[derive(Debug, Clone)]
pub enum NodeData<N, L> {
    Branch(N),
    Leaf(L),
}

impl<N, L> NodeData<N, L> {
    pub fn as_leaf(&self) -> Option<&L> {
        match self {
            Self::Leaf(leaf) => Some(leaf),
            Self::Branch(_) => None,
        }
    }

    pub fn as_branch(&self) -> Option<&N> {
        match self {
            Self::Branch(node) => Some(node),
            Self::Leaf(_) => None,
        }
    }
}

/// A node in the arena. Children are owned downward through indices;
/// `parent` is a back-reference populated after the merge and is never used
/// for ownership.
#[derive(Debug)]
pub struct TreeNode<N, L> {
    pub data: NodeData<N, L>,
    left: Option<usize>,
    right: Option<usize>,
    parent: Option<usize>,
}

impl<N, L> TreeNode<N, L> {
    fn leaf(data: L) -> Self {
        Self {
            data: NodeData::Leaf(data),
            left: None,
            right: None,
            parent: None,
        }
    }

    pub fn left(&self) -> Option<usize> {
        self.left
    }

    pub fn right(&self) -> Option<usize> {
        self.right
    }

    pub fn parent(&self) -> Option<usize> {
        self.parent
    }
}

#[derive(Debug)]
pub struct MerkleTree<N, L, M> {
    nodes: Vec<TreeNode<N, L>>,
    root: usize,
    /// Arena indices of the leaves, in sorted build order.
    leaves: Vec<usize>,
    metadata: Option<M>,
}

impl<N, L, M> MerkleTree<N, L, M> {
    pub fn root(&self) -> &N {
        match &self.nodes[self.root].data {
            NodeData::Branch(node) => node,
            // The build always merges at depth zero, so the root is a branch.
            NodeData::Leaf(_) => unreachable!("root of a built tree is always merged"),
        }
    }

    pub fn metadata(&self) -> Option<&M> {
        self.metadata.as_ref()
    }

    pub fn leaf_count(&self) -> usize {
        self.leaves.len()
    }

    pub fn leaves(&self) -> impl Iterator<Item = &L> {
        self.leaves.iter().map(|&idx| {
            self.nodes[idx]
                .data
                .as_leaf()
                .expect("leaf indices point at leaves")
        })
    }

    pub fn node(&self, index: usize) -> &TreeNode<N, L> {
        &self.nodes[index]
    }

    pub fn root_index(&self) -> usize {
        self.root
    }

    /// Root-to-leaf position of the `ordinal`-th leaf in build order.
    pub fn path(&self, ordinal: usize) -> PathLine {
        let mut index = self.leaves[ordinal];
        let mut bits = Vec::new();
        while let Some(parent) = self.nodes[index].parent {
            bits.push(self.nodes[parent].right == Some(index));
            index = parent;
        }
        bits.reverse();
        PathLine::from_bits(bits).expect("a leaf under a merged root has at least one step")
    }

    /// Follows `path` down from the root, returning every visited node
    /// (root first, leaf last), or `None` if the path walks off the tree.
    pub fn walk(&self, path: &PathLine) -> Option<Vec<&TreeNode<N, L>>> {
        let mut visited = vec![&self.nodes[self.root]];
        for bit in path.bits() {
            let current = visited.last().expect("walk starts at the root");
            let next = if bit { current.right } else { current.left }?;
            visited.push(&self.nodes[next]);
        }
        Some(visited)
    }

    /// Maximum leaf depth.
    pub fn depth(&self) -> usize {
        (0..self.leaves.len())
            .map(|ordinal| self.path(ordinal).depth())
            .max()
            .unwrap_or(0)
    }
}

pub struct MerkleTreeFactory<N, L, M> {
    merge: Arc<dyn MergeFunction<N, L, M>>,
    compare: Option<Arc<dyn CompareFunction<L>>>,
    metadata: Option<Arc<dyn MetadataFunction<L, M>>>,
    depth_limit: usize,
}

impl<N, L, M> MerkleTreeFactory<N, L, M>
where
    N: Send + Sync,
    L: Send + Sync,
    M: Send + Sync,
{
    pub fn new(
        merge: Arc<dyn MergeFunction<N, L, M>>,
        compare: Option<Arc<dyn CompareFunction<L>>>,
        metadata: Option<Arc<dyn MetadataFunction<L, M>>>,
        depth_limit: usize,
    ) -> Self {
        Self {
            merge,
            compare,
            metadata,
            depth_limit,
        }
    }

    pub async fn build(&self, mut leaves: Vec<L>) -> Result<MerkleTree<N, L, M>, Error> {
        if leaves.is_empty() {
            return Err(Error::EmptyLeaves);
        }

        if let Some(compare) = &self.compare {
            // Vec::sort_by is stable, which the deterministic-shape guarantee
            // relies on.
            leaves.sort_by(|a, b| compare.compare(a, b));
        }

        let tree_metadata = self
            .metadata
            .as_ref()
            .map(|gen| gen.generate_metadata(&leaves));

        let mut nodes: Vec<TreeNode<N, L>> = leaves.into_iter().map(TreeNode::leaf).collect();
        let leaf_indices: Vec<usize> = (0..nodes.len()).collect();

        let root = self
            .build_range(&mut nodes, &leaf_indices, 0, tree_metadata.as_ref())
            .await?;

        Ok(MerkleTree {
            nodes,
            root,
            leaves: leaf_indices,
            metadata: tree_metadata,
        })
    }

    fn build_range<'a>(
        &'a self,
        nodes: &'a mut Vec<TreeNode<N, L>>,
        range: &'a [usize],
        depth: usize,
        metadata: Option<&'a M>,
    ) -> BoxFuture<'a, Result<usize, Error>> {
        async move {
            // The merge performed here sits at `depth`; its children land at
            // `depth + 1`, so reaching the limit with leaves still to place
            // means the tree cannot fit.
            if depth >= self.depth_limit {
                return Err(Error::DepthExceeded {
                    limit: self.depth_limit,
                    max: 1u64 << self.depth_limit,
                });
            }

            let (left, right) = match *range {
                // A lone leaf still gets a merge node above it, so a
                // single-leaf tree anchors at path "0" and the odd leaf of
                // a split keeps a well-formed pair block.
                [leaf] => (leaf, None),
                [left, right] => (left, Some(right)),
                _ => {
                    // Split at the middle, larger half left, so undersized
                    // batches fill the leftmost subtrees first.
                    let middle = range.len().div_ceil(2);
                    let left = self
                        .build_range(nodes, &range[..middle], depth + 1, None)
                        .await?;
                    let right = self
                        .build_range(nodes, &range[middle..], depth + 1, None)
                        .await?;
                    (left, Some(right))
                }
            };

            let merged = self
                .merge
                .merge(
                    &nodes[left].data,
                    right.map(|idx| &nodes[idx].data),
                    metadata,
                )
                .await
                .map_err(Error::Merge)?;

            let parent = nodes.len();
            nodes.push(TreeNode {
                data: NodeData::Branch(merged),
                left: Some(left),
                right,
                parent: None,
            });
            nodes[left].parent = Some(parent);
            if let Some(right) = right {
                nodes[right].parent = Some(parent);
            }
            Ok(parent)
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Concatenating merge over strings, bracketing children so the shape is
    /// visible in the root value.
    struct ConcatMerge;

    #[async_trait]
    impl MergeFunction<String, String, Vec<String>> for ConcatMerge {
        async fn merge(
            &self,
            left: &NodeData<String, String>,
            right: Option<&NodeData<String, String>>,
            metadata: Option<&Vec<String>>,
        ) -> anyhow::Result<String> {
            let value = |data: &NodeData<String, String>| match data {
                NodeData::Branch(s) | NodeData::Leaf(s) => s.clone(),
            };
            let mut out = format!(
                "({}:{})",
                value(left),
                right.map(value).unwrap_or_default()
            );
            if let Some(meta) = metadata {
                out.push_str(&format!("[{}]", meta.join(",")));
            }
            Ok(out)
        }
    }

    struct Lexicographic;

    impl CompareFunction<String> for Lexicographic {
        fn compare(&self, a: &String, b: &String) -> Ordering {
            a.cmp(b)
        }
    }

    struct CollectLeaves;

    impl MetadataFunction<String, Vec<String>> for CollectLeaves {
        fn generate_metadata(&self, leaves: &[String]) -> Vec<String> {
            leaves.to_vec()
        }
    }

    fn factory(depth_limit: usize) -> MerkleTreeFactory<String, String, Vec<String>> {
        MerkleTreeFactory::new(
            Arc::new(ConcatMerge),
            Some(Arc::new(Lexicographic)),
            None,
            depth_limit,
        )
    }

    fn leaves(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn empty_leaves_rejected() {
        let err = factory(4).build(Vec::new()).await.unwrap_err();
        assert!(matches!(err, Error::EmptyLeaves));
    }

    #[tokio::test]
    async fn single_leaf_merges_at_root() {
        let tree = factory(4).build(leaves(&["a"])).await.unwrap();
        assert_eq!(tree.root(), "(a:)");
        assert_eq!(tree.leaf_count(), 1);
        assert_eq!(tree.path(0).as_str(), "0");
    }

    #[tokio::test]
    async fn three_leaves_fill_left_subtree() {
        let tree = factory(2).build(leaves(&["a", "b", "c"])).await.unwrap();
        // The odd rightmost leaf is wrapped in a single-child node at depth 1.
        assert_eq!(tree.root(), "((a:b):(c:))");
        let paths: Vec<String> = (0..3).map(|i| tree.path(i).to_string()).collect();
        assert_eq!(paths, vec!["0/0", "0/1", "1/0"]);
        assert_eq!(tree.depth(), 2);
    }

    #[tokio::test]
    async fn leaves_are_sorted_before_build() {
        let sorted = factory(3).build(leaves(&["c", "a", "b"])).await.unwrap();
        let presorted = factory(3).build(leaves(&["a", "b", "c"])).await.unwrap();
        assert_eq!(sorted.root(), presorted.root());
    }

    #[tokio::test]
    async fn rebuild_is_deterministic() {
        let input = leaves(&["d", "b", "a", "c", "e"]);
        let one = factory(3).build(input.clone()).await.unwrap();
        let two = factory(3).build(input).await.unwrap();
        assert_eq!(one.root(), two.root());
    }

    #[tokio::test]
    async fn depth_bound_is_logarithmic() {
        for n in 1..=16usize {
            let input: Vec<String> = (0..n).map(|i| format!("{i:02}")).collect();
            let tree = factory(4).build(input).await.unwrap();
            assert_eq!(tree.leaf_count(), n);
            let bound = (n as f64).log2().ceil() as usize;
            assert!(
                tree.depth() <= bound.max(1),
                "depth {} exceeds bound {} for {} leaves",
                tree.depth(),
                bound,
                n
            );
        }
    }

    #[tokio::test]
    async fn full_tree_at_depth_limit_builds() {
        let input: Vec<String> = (0..4).map(|i| i.to_string()).collect();
        let tree = factory(2).build(input).await.unwrap();
        assert_eq!(tree.leaf_count(), 4);
        assert_eq!(tree.depth(), 2);
    }

    #[tokio::test]
    async fn one_leaf_over_the_limit_fails() {
        let input: Vec<String> = (0..5).map(|i| i.to_string()).collect();
        let err = factory(2).build(input).await.unwrap_err();
        match err {
            Error::DepthExceeded { limit, max } => {
                assert_eq!(limit, 2);
                assert_eq!(max, 4);
            }
            other => panic!("expected DepthExceeded, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn metadata_reaches_only_the_root_merge() {
        let factory = MerkleTreeFactory::new(
            Arc::new(ConcatMerge),
            Some(Arc::new(Lexicographic)),
            Some(Arc::new(CollectLeaves)),
            3,
        );
        let tree = factory.build(leaves(&["a", "b", "c"])).await.unwrap();
        // Only the outermost merge carries the [..] metadata suffix.
        assert_eq!(tree.root(), "((a:b):(c:))[a,b,c]");
        assert_eq!(tree.metadata(), Some(&leaves(&["a", "b", "c"])));
    }

    #[tokio::test]
    async fn walking_a_path_returns_to_the_leaf() {
        let input: Vec<String> = (0..7).map(|i| i.to_string()).collect();
        let tree = factory(3).build(input).await.unwrap();
        for ordinal in 0..tree.leaf_count() {
            let path = tree.path(ordinal);
            let visited = tree.walk(&path).unwrap();
            let leaf = visited.last().unwrap().data.as_leaf().unwrap();
            assert_eq!(leaf, &ordinal.to_string());
        }
    }

    #[tokio::test]
    async fn walk_rejects_paths_off_the_tree() {
        let tree = factory(2).build(leaves(&["a", "b"])).await.unwrap();
        assert!(tree.walk(&"0/0/0".parse().unwrap()).is_none());
    }
}
