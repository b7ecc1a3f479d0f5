//! Dense and sparse tree storage.
//!
//! Both layouts hand out a [`TreeRef`]: a base offset and a pitch into a shared
//! node array. Node `k` of a tree lives at `base + k * pitch`.
//!
//! - Dense trees are complete to the forest's depth. With
//!   [`DenseLayout::TreeMajor`] each tree is contiguous (`base = i * nodes_per_tree`,
//!   `pitch = 1`); with [`DenseLayout::Interleaved`] node `k` of all trees is
//!   stored side by side (`base = i`, `pitch = n_trees`) so that threads walking
//!   different trees read neighbouring nodes.
//! - Sparse trees store only existing nodes, contiguous per tree, and a
//!   root-offset table gives each tree's base (`pitch = 1`).

use serde::{Deserialize, Serialize};

use crate::device::DeviceBuffer;

use super::node::ForestNode;

/// Memory arrangement of a dense forest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DenseLayout {
    /// Each tree's nodes are contiguous.
    TreeMajor,
    /// Corresponding nodes of all trees are adjacent.
    #[default]
    Interleaved,
}

/// Number of nodes of a complete binary tree of the given depth.
#[inline]
pub const fn complete_tree_nodes(depth: u32) -> usize {
    (1usize << (depth + 1)) - 1
}

/// Borrowed view of one tree inside a forest's node array.
#[derive(Debug, Clone, Copy)]
pub struct TreeRef<'a, N> {
    nodes: &'a [N],
    base: usize,
    pitch: usize,
}

impl<'a, N: ForestNode> TreeRef<'a, N> {
    /// Node at in-tree index `idx`.
    ///
    /// Panics if the index lies outside the forest's node array; callers only
    /// follow child links produced at import time.
    #[inline]
    pub fn node(&self, idx: usize) -> &'a N {
        &self.nodes[self.base + idx * self.pitch]
    }

    /// Walk from the root to a leaf and return the leaf's raw payload.
    ///
    /// `value <= threshold` goes left, `value > threshold` goes right and a NaN
    /// value follows the node's default direction.
    #[inline]
    pub fn leaf_payload(&self, row: &[f32]) -> u32 {
        let mut idx = 0usize;
        let mut node = self.node(0);
        while !node.is_leaf() {
            let fvalue = row[node.feature()];
            let go_right = if fvalue.is_nan() {
                !node.default_left()
            } else {
                fvalue > node.threshold()
            };
            idx = node.child(idx, go_right);
            node = self.node(idx);
        }
        node.raw_val()
    }
}

/// Indexed access to the trees of a forest.
pub trait TreeStorage: Send + Sync {
    type Node: ForestNode;

    fn n_trees(&self) -> usize;

    /// Total number of stored nodes.
    fn n_nodes(&self) -> usize;

    fn tree(&self, tree_idx: usize) -> TreeRef<'_, Self::Node>;
}

/// Complete trees of a fixed depth.
#[derive(Debug)]
pub struct DenseStorage<N> {
    nodes: DeviceBuffer<N>,
    n_trees: usize,
    depth: u32,
    layout: DenseLayout,
}

impl<N: ForestNode> DenseStorage<N> {
    /// `nodes` must already be arranged according to `layout`.
    pub(crate) fn new(nodes: DeviceBuffer<N>, n_trees: usize, depth: u32, layout: DenseLayout) -> Self {
        debug_assert_eq!(nodes.len(), n_trees * complete_tree_nodes(depth));
        Self {
            nodes,
            n_trees,
            depth,
            layout,
        }
    }

    #[inline]
    pub fn depth(&self) -> u32 {
        self.depth
    }

    #[inline]
    pub fn layout(&self) -> DenseLayout {
        self.layout
    }

    /// Distance between the roots of consecutive trees.
    #[inline]
    pub fn stride(&self) -> usize {
        match self.layout {
            DenseLayout::TreeMajor => complete_tree_nodes(self.depth),
            DenseLayout::Interleaved => 1,
        }
    }

    /// Distance between consecutive nodes of the same tree.
    #[inline]
    pub fn pitch(&self) -> usize {
        match self.layout {
            DenseLayout::TreeMajor => 1,
            DenseLayout::Interleaved => self.n_trees,
        }
    }

    /// Flat position of node `k` of tree `i` for the given layout.
    #[inline]
    pub(crate) fn position(layout: DenseLayout, n_trees: usize, depth: u32, tree: usize, k: usize) -> usize {
        match layout {
            DenseLayout::TreeMajor => tree * complete_tree_nodes(depth) + k,
            DenseLayout::Interleaved => tree + k * n_trees,
        }
    }

    pub(crate) fn release(self) -> usize {
        self.nodes.release()
    }
}

impl<N: ForestNode> TreeStorage for DenseStorage<N> {
    type Node = N;

    #[inline]
    fn n_trees(&self) -> usize {
        self.n_trees
    }

    #[inline]
    fn n_nodes(&self) -> usize {
        self.nodes.len()
    }

    #[inline]
    fn tree(&self, tree_idx: usize) -> TreeRef<'_, N> {
        TreeRef {
            nodes: self.nodes.as_slice(),
            base: tree_idx * self.stride(),
            pitch: self.pitch(),
        }
    }
}

/// Variable-size trees addressed through a root-offset table.
#[derive(Debug)]
pub struct SparseStorage<N> {
    nodes: DeviceBuffer<N>,
    root_offsets: DeviceBuffer<u32>,
}

impl<N: ForestNode> SparseStorage<N> {
    /// `root_offsets[i]` is the first node of tree `i`; trees are contiguous.
    pub(crate) fn new(nodes: DeviceBuffer<N>, root_offsets: DeviceBuffer<u32>) -> Self {
        debug_assert!(root_offsets.as_slice().windows(2).all(|w| w[0] <= w[1]));
        debug_assert!(root_offsets.as_slice().first().is_none_or(|&o| o == 0));
        Self { nodes, root_offsets }
    }

    #[inline]
    pub fn root_offsets(&self) -> &[u32] {
        self.root_offsets.as_slice()
    }

    /// Number of nodes stored for one tree.
    pub fn tree_len(&self, tree_idx: usize) -> usize {
        let offsets = self.root_offsets.as_slice();
        let start = offsets[tree_idx] as usize;
        let end = offsets
            .get(tree_idx + 1)
            .map_or(self.nodes.len(), |&o| o as usize);
        end - start
    }

    pub(crate) fn release(self) -> usize {
        self.nodes.release() + self.root_offsets.release()
    }
}

impl<N: ForestNode> TreeStorage for SparseStorage<N> {
    type Node = N;

    #[inline]
    fn n_trees(&self) -> usize {
        self.root_offsets.len()
    }

    #[inline]
    fn n_nodes(&self) -> usize {
        self.nodes.len()
    }

    #[inline]
    fn tree(&self, tree_idx: usize) -> TreeRef<'_, N> {
        TreeRef {
            nodes: self.nodes.as_slice(),
            base: self.root_offsets.as_slice()[tree_idx] as usize,
            pitch: 1,
        }
    }
}
