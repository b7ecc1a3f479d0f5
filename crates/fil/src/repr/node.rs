//! Device node encodings.
//!
//! Every encoding stores a 32-bit `val` word and a packed 32-bit `bits` word.
//! For internal nodes `val` holds the split threshold; for leaves it holds the
//! raw leaf payload. Kernels reinterpret that word directly (`f32::from_bits`
//! or a class id) according to the forest's leaf kind; host-side callers get
//! it decoded into a [`LeafOutput`].
//!
//! | encoding         | size | max feature   | child addressing                 |
//! |------------------|------|---------------|----------------------------------|
//! | [`DenseNode`]    | 8 B  | `2^30 - 1`    | implicit: `2i + 1`, `2i + 2`      |
//! | [`SparseNode16`] | 16 B | `2^30 - 1`    | absolute `left_idx`, right = +1   |
//! | [`SparseNode8`]  | 8 B  | `2^14 - 1`    | relative left offset (< `2^16`)   |

use serde::{Deserialize, Serialize};

const IS_LEAF_MASK: u32 = 1 << 31;
const DEF_LEFT_MASK: u32 = 1 << 30;

/// Feature bits of the dense and 16-byte sparse encodings.
pub const WIDE_FEATURE_BITS: u32 = 30;
const WIDE_FEATURE_MASK: u32 = (1 << WIDE_FEATURE_BITS) - 1;

/// Feature bits of the 8-byte sparse encoding.
pub const NARROW_FEATURE_BITS: u32 = 14;
/// Left-offset bits of the 8-byte sparse encoding.
pub const NARROW_OFFSET_BITS: u32 = 16;
const NARROW_FEATURE_MASK: u32 = (1 << NARROW_FEATURE_BITS) - 1;
const NARROW_OFFSET_MASK: u32 = (1 << NARROW_OFFSET_BITS) - 1;

/// Storage kind of a forest. Homogeneous across all trees of one forest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StorageKind {
    /// Complete binary trees, formulaic child addressing.
    Dense,
    /// Compact trees with 16-byte nodes and absolute child indices.
    Sparse16,
    /// Compact trees with 8-byte nodes and relative child offsets.
    Sparse8,
}

impl StorageKind {
    pub const ALL: [StorageKind; 3] = [StorageKind::Dense, StorageKind::Sparse16, StorageKind::Sparse8];

    #[inline]
    pub(crate) fn index(self) -> usize {
        match self {
            StorageKind::Dense => 0,
            StorageKind::Sparse16 => 1,
            StorageKind::Sparse8 => 2,
        }
    }
}

/// Decoded leaf output.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeafOutput {
    /// Margin or regression value.
    Value(f32),
    /// Discrete class id.
    Class(u32),
}

impl LeafOutput {
    /// Payload word stored in a leaf node.
    #[inline]
    pub fn to_bits(self) -> u32 {
        match self {
            LeafOutput::Value(v) => v.to_bits(),
            LeafOutput::Class(c) => c,
        }
    }
}

/// Fields shared by all node encodings, before packing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct NodeFields {
    pub is_leaf: bool,
    pub feature: u32,
    pub default_left: bool,
    /// Threshold bits for splits, payload bits for leaves.
    pub val: u32,
}

impl NodeFields {
    pub(crate) fn leaf(val: u32) -> Self {
        Self {
            is_leaf: true,
            feature: 0,
            default_left: false,
            val,
        }
    }

    fn flag_bits(&self) -> u32 {
        let mut bits = 0;
        if self.is_leaf {
            bits |= IS_LEAF_MASK;
        }
        if self.default_left {
            bits |= DEF_LEFT_MASK;
        }
        bits
    }
}

/// Read access to a node, uniform across encodings.
///
/// `child` resolves the in-tree index of the next node, so traversal code is
/// identical for dense and sparse storage.
pub trait ForestNode: Copy + Send + Sync + std::fmt::Debug + 'static {
    /// Storage kind this encoding belongs to.
    const KIND: StorageKind;

    fn is_leaf(&self) -> bool;

    fn feature(&self) -> usize;

    fn default_left(&self) -> bool;

    /// Raw `val` word (threshold bits or leaf payload).
    fn raw_val(&self) -> u32;

    #[inline]
    fn threshold(&self) -> f32 {
        f32::from_bits(self.raw_val())
    }

    /// In-tree index of the left (`go_right == false`) or right child of the
    /// node stored at in-tree index `node_idx`.
    fn child(&self, node_idx: usize, go_right: bool) -> usize;
}

/// Node of a complete (dense) tree.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DenseNode {
    val: u32,
    bits: u32,
}

impl DenseNode {
    pub(crate) fn encode(fields: &NodeFields) -> Option<Self> {
        if fields.feature > WIDE_FEATURE_MASK {
            return None;
        }
        Some(Self {
            val: fields.val,
            bits: fields.feature | fields.flag_bits(),
        })
    }
}

impl ForestNode for DenseNode {
    const KIND: StorageKind = StorageKind::Dense;

    #[inline]
    fn is_leaf(&self) -> bool {
        self.bits & IS_LEAF_MASK != 0
    }

    #[inline]
    fn feature(&self) -> usize {
        (self.bits & WIDE_FEATURE_MASK) as usize
    }

    #[inline]
    fn default_left(&self) -> bool {
        self.bits & DEF_LEFT_MASK != 0
    }

    #[inline]
    fn raw_val(&self) -> u32 {
        self.val
    }

    #[inline]
    fn child(&self, node_idx: usize, go_right: bool) -> usize {
        2 * node_idx + 1 + go_right as usize
    }
}

/// Sparse node with an absolute left-child index.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SparseNode16 {
    val: u32,
    bits: u32,
    left_idx: u32,
    _pad: u32,
}

impl SparseNode16 {
    pub(crate) fn encode(fields: &NodeFields, left_idx: usize) -> Option<Self> {
        if fields.feature > WIDE_FEATURE_MASK {
            return None;
        }
        let left_idx = u32::try_from(left_idx).ok()?;
        Some(Self {
            val: fields.val,
            bits: fields.feature | fields.flag_bits(),
            left_idx,
            _pad: 0,
        })
    }
}

impl ForestNode for SparseNode16 {
    const KIND: StorageKind = StorageKind::Sparse16;

    #[inline]
    fn is_leaf(&self) -> bool {
        self.bits & IS_LEAF_MASK != 0
    }

    #[inline]
    fn feature(&self) -> usize {
        (self.bits & WIDE_FEATURE_MASK) as usize
    }

    #[inline]
    fn default_left(&self) -> bool {
        self.bits & DEF_LEFT_MASK != 0
    }

    #[inline]
    fn raw_val(&self) -> u32 {
        self.val
    }

    #[inline]
    fn child(&self, _node_idx: usize, go_right: bool) -> usize {
        self.left_idx as usize + go_right as usize
    }
}

/// Sparse node with feature and relative left offset packed into one word.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SparseNode8 {
    val: u32,
    bits: u32,
}

impl SparseNode8 {
    /// Largest representable feature index.
    pub const MAX_FEATURE: usize = NARROW_FEATURE_MASK as usize;
    /// Largest representable distance from a node to its left child.
    pub const MAX_LEFT_OFFSET: usize = NARROW_OFFSET_MASK as usize;

    /// `left_offset` is the distance from this node to its left child (0 for leaves).
    pub(crate) fn encode(fields: &NodeFields, left_offset: usize) -> Option<Self> {
        if fields.feature as usize > Self::MAX_FEATURE || left_offset > Self::MAX_LEFT_OFFSET {
            return None;
        }
        let packed = fields.feature | ((left_offset as u32) << NARROW_FEATURE_BITS);
        Some(Self {
            val: fields.val,
            bits: packed | fields.flag_bits(),
        })
    }

    #[inline]
    fn left_offset(&self) -> usize {
        ((self.bits >> NARROW_FEATURE_BITS) & NARROW_OFFSET_MASK) as usize
    }
}

impl ForestNode for SparseNode8 {
    const KIND: StorageKind = StorageKind::Sparse8;

    #[inline]
    fn is_leaf(&self) -> bool {
        self.bits & IS_LEAF_MASK != 0
    }

    #[inline]
    fn feature(&self) -> usize {
        (self.bits & NARROW_FEATURE_MASK) as usize
    }

    #[inline]
    fn default_left(&self) -> bool {
        self.bits & DEF_LEFT_MASK != 0
    }

    #[inline]
    fn raw_val(&self) -> u32 {
        self.val
    }

    #[inline]
    fn child(&self, node_idx: usize, go_right: bool) -> usize {
        node_idx + self.left_offset() + go_right as usize
    }
}
