//! Model ingestion.
//!
//! A [`ModelDescription`] is the exchange format between a trainer and the
//! engine: an indexed node list per tree plus ensemble metadata. It is plain
//! serde data so it can be loaded from JSON. Import validates the description
//! and encodes it into one of the device storages.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::forest::{ForestStorage, LeafKind};
use super::node::{
    DenseNode, ForestNode, LeafOutput, NodeFields, SparseNode8, SparseNode16, StorageKind, WIDE_FEATURE_BITS,
};
use super::storage::{DenseLayout, DenseStorage, SparseStorage, complete_tree_nodes};
use crate::device::Device;
use crate::transform::{Activation, OutputTransform};
use crate::{FilError, Result};

/// Index of a node within its tree's node list.
pub type NodeId = u32;

/// Deepest tree accepted for dense storage.
pub const MAX_DENSE_DEPTH: u32 = 24;

const WIDE_FEATURE_LIMIT: usize = (1 << WIDE_FEATURE_BITS) - 1;

fn default_threshold() -> f32 {
    0.5
}

/// One node of an exchanged tree.
///
/// For leaves, `leaf` is set and the split fields are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NodeDescription {
    #[serde(default)]
    pub feature: u32,
    #[serde(default)]
    pub threshold: f32,
    #[serde(default)]
    pub left: NodeId,
    #[serde(default)]
    pub right: NodeId,
    /// Direction taken when the feature value is missing (NaN).
    #[serde(default)]
    pub default_left: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leaf: Option<LeafOutput>,
}

impl NodeDescription {
    pub fn split(feature: u32, threshold: f32, left: NodeId, right: NodeId, default_left: bool) -> Self {
        Self {
            feature,
            threshold,
            left,
            right,
            default_left,
            leaf: None,
        }
    }

    pub fn leaf(output: LeafOutput) -> Self {
        Self {
            feature: 0,
            threshold: 0.0,
            left: 0,
            right: 0,
            default_left: false,
            leaf: Some(output),
        }
    }

    #[inline]
    pub fn is_leaf(&self) -> bool {
        self.leaf.is_some()
    }
}

/// One exchanged tree. Node 0 is the root.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TreeDescription {
    pub nodes: Vec<NodeDescription>,
}

impl TreeDescription {
    pub fn new(nodes: Vec<NodeDescription>) -> Self {
        Self { nodes }
    }

    /// Build from `(id, node)` pairs in any order.
    ///
    /// # Panics
    ///
    /// Panics if the ids are not exactly `0..n`.
    pub fn from_indexed_nodes(mut nodes: Vec<(NodeId, NodeDescription)>) -> Self {
        nodes.sort_by_key(|(id, _)| *id);
        for (expected, (id, _)) in nodes.iter().enumerate() {
            assert_eq!(*id as usize, expected, "node ids must be contiguous from 0");
        }
        Self {
            nodes: nodes.into_iter().map(|(_, node)| node).collect(),
        }
    }

    #[inline]
    pub fn n_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// Depth of the deepest leaf. Assumes a validated tree.
    pub fn depth(&self) -> u32 {
        let mut max_depth = 0;
        let mut stack = vec![(0usize, 0u32)];
        while let Some((idx, depth)) = stack.pop() {
            let node = &self.nodes[idx];
            if node.is_leaf() {
                max_depth = max_depth.max(depth);
            } else {
                stack.push((node.left as usize, depth + 1));
                stack.push((node.right as usize, depth + 1));
            }
        }
        max_depth
    }

    /// Check the tree's structure and its nodes against the ensemble metadata.
    fn validate(
        &self,
        num_features: usize,
        num_classes: usize,
        leaf_kind: LeafKind,
    ) -> std::result::Result<(), TreeValidationError> {
        let n_nodes = self.nodes.len();
        if n_nodes == 0 {
            return Err(TreeValidationError::EmptyTree);
        }

        // Iterative DFS with color marking: 0 = unvisited, 1 = visiting, 2 = done.
        let mut color = vec![0u8; n_nodes];
        let mut stack: Vec<(NodeId, bool)> = vec![(0, false)];

        while let Some((node, finished)) = stack.pop() {
            let idx = node as usize;
            if finished {
                color[idx] = 2;
                continue;
            }
            match color[idx] {
                0 => {}
                1 => return Err(TreeValidationError::CycleDetected { node }),
                _ => return Err(TreeValidationError::DuplicateVisit { node }),
            }
            color[idx] = 1;
            stack.push((node, true));

            let desc = &self.nodes[idx];
            match desc.leaf {
                Some(output) => check_leaf(node, output, num_classes, leaf_kind)?,
                None => {
                    if desc.feature as usize >= num_features {
                        return Err(TreeValidationError::FeatureOutOfRange {
                            node,
                            feature: desc.feature,
                            num_features,
                        });
                    }
                    if desc.threshold.is_nan() {
                        return Err(TreeValidationError::NanThreshold { node });
                    }
                    if desc.left == node || desc.right == node {
                        return Err(TreeValidationError::SelfLoop { node });
                    }
                    if desc.left == desc.right {
                        return Err(TreeValidationError::DuplicateVisit { node: desc.left });
                    }
                    for (side, child) in [("left", desc.left), ("right", desc.right)] {
                        if child as usize >= n_nodes {
                            return Err(TreeValidationError::ChildOutOfBounds {
                                node,
                                side,
                                child,
                                n_nodes,
                            });
                        }
                    }
                    stack.push((desc.right, false));
                    stack.push((desc.left, false));
                }
            }
        }

        if let Some(node) = color.iter().position(|&c| c == 0) {
            return Err(TreeValidationError::UnreachableNode { node: node as NodeId });
        }
        Ok(())
    }
}

fn check_leaf(
    node: NodeId,
    output: LeafOutput,
    num_classes: usize,
    leaf_kind: LeafKind,
) -> std::result::Result<(), TreeValidationError> {
    match (leaf_kind, output) {
        (LeafKind::CategoricalLeaf, LeafOutput::Class(class)) => {
            if class as usize >= num_classes {
                return Err(TreeValidationError::ClassOutOfRange {
                    node,
                    class,
                    num_classes,
                });
            }
            Ok(())
        }
        (LeafKind::FloatUnaryBinary | LeafKind::GrovePerClass, LeafOutput::Value(_)) => Ok(()),
        _ => Err(TreeValidationError::LeafKindMismatch { node, leaf_kind }),
    }
}

/// Structural validation errors for a single [`TreeDescription`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TreeValidationError {
    #[error("tree has no nodes")]
    EmptyTree,
    #[error("node {node}: {side} child {child} is out of bounds ({n_nodes} nodes)")]
    ChildOutOfBounds {
        node: NodeId,
        side: &'static str,
        child: NodeId,
        n_nodes: usize,
    },
    #[error("node {node} references itself as a child")]
    SelfLoop { node: NodeId },
    #[error("node {node} is reachable by more than one path")]
    DuplicateVisit { node: NodeId },
    #[error("cycle detected at node {node}")]
    CycleDetected { node: NodeId },
    #[error("node {node} is unreachable from the root")]
    UnreachableNode { node: NodeId },
    #[error("node {node}: feature {feature} is out of range ({num_features} features)")]
    FeatureOutOfRange {
        node: NodeId,
        feature: u32,
        num_features: usize,
    },
    #[error("node {node}: split threshold is NaN")]
    NanThreshold { node: NodeId },
    #[error("node {node}: leaf payload does not match leaf kind {leaf_kind:?}")]
    LeafKindMismatch { node: NodeId, leaf_kind: LeafKind },
    #[error("node {node}: class {class} is out of range ({num_classes} classes)")]
    ClassOutOfRange {
        node: NodeId,
        class: u32,
        num_classes: usize,
    },
}

/// Ensemble-level validation errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ModelValidationError {
    #[error("model has no trees")]
    NoTrees,
    #[error("{leaf_kind:?} forests cannot have {num_classes} class(es)")]
    ClassCount { leaf_kind: LeafKind, num_classes: usize },
    #[error("{activation:?} activation is not supported for {leaf_kind:?} forests")]
    IncompatibleTransform {
        leaf_kind: LeafKind,
        activation: Activation,
    },
    #[error("{field} must be finite, got {value}")]
    NonFinite { field: &'static str, value: f32 },
    #[error("tree {tree}: {error}")]
    InvalidTree {
        tree: usize,
        #[source]
        error: TreeValidationError,
    },
}

/// A trained ensemble in exchange form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescription {
    pub num_features: usize,
    /// 1 for regression, 2 for binary classification, C for multiclass.
    pub num_classes: usize,
    pub leaf_kind: LeafKind,
    #[serde(default)]
    pub transform: OutputTransform,
    #[serde(default)]
    pub global_bias: f32,
    /// Class threshold applied to binary classifiers.
    #[serde(default = "default_threshold")]
    pub threshold: f32,
    pub trees: Vec<TreeDescription>,
}

impl ModelDescription {
    /// Parse a JSON description.
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        Ok(serde_json::from_reader(reader)?)
    }

    pub fn to_writer<W: Write>(&self, writer: W) -> Result<()> {
        serde_json::to_writer(writer, self)?;
        Ok(())
    }

    /// Load a JSON description from disk.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        Self::from_reader(std::io::BufReader::new(file))
    }

    /// Write the description to disk as JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let file = std::fs::File::create(path)?;
        let mut writer = std::io::BufWriter::new(file);
        self.to_writer(&mut writer)?;
        writer.flush()?;
        Ok(())
    }

    #[inline]
    pub fn n_trees(&self) -> usize {
        self.trees.len()
    }

    /// Validate ensemble metadata and every tree.
    pub fn validate(&self) -> std::result::Result<(), ModelValidationError> {
        if self.trees.is_empty() {
            return Err(ModelValidationError::NoTrees);
        }

        let class_count_ok = match self.leaf_kind {
            LeafKind::FloatUnaryBinary => matches!(self.num_classes, 1 | 2),
            LeafKind::GrovePerClass | LeafKind::CategoricalLeaf => self.num_classes >= 2,
        };
        if !class_count_ok {
            return Err(ModelValidationError::ClassCount {
                leaf_kind: self.leaf_kind,
                num_classes: self.num_classes,
            });
        }

        validate_transform(self.leaf_kind, self.transform)?;

        for (field, value) in [("global_bias", self.global_bias), ("threshold", self.threshold)] {
            if !value.is_finite() {
                return Err(ModelValidationError::NonFinite { field, value });
            }
        }

        for (tree, desc) in self.trees.iter().enumerate() {
            desc.validate(self.num_features, self.num_classes, self.leaf_kind)
                .map_err(|error| ModelValidationError::InvalidTree { tree, error })?;
        }
        Ok(())
    }
}

/// Softmax needs several margins per row, so it is limited to grove forests.
pub(crate) fn validate_transform(
    leaf_kind: LeafKind,
    transform: OutputTransform,
) -> std::result::Result<(), ModelValidationError> {
    if transform.activation == Activation::Softmax && leaf_kind != LeafKind::GrovePerClass {
        return Err(ModelValidationError::IncompatibleTransform {
            leaf_kind,
            activation: transform.activation,
        });
    }
    Ok(())
}

/// Node counts of a validated model, used to pick a storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ForestShape {
    pub max_depth: u32,
    pub sparse_nodes: usize,
    pub dense_nodes: usize,
}

impl ForestShape {
    pub(crate) fn of(trees: &[TreeDescription]) -> Self {
        let max_depth = trees.iter().map(TreeDescription::depth).max().unwrap_or(0);
        let sparse_nodes = trees.iter().map(TreeDescription::n_nodes).sum();
        let dense_nodes = complete_tree_nodes(max_depth.min(MAX_DENSE_DEPTH)).saturating_mul(trees.len());
        Self {
            max_depth,
            sparse_nodes,
            dense_nodes,
        }
    }
}

fn fields_of(desc: &NodeDescription) -> NodeFields {
    match desc.leaf {
        Some(output) => NodeFields::leaf(output.to_bits()),
        None => NodeFields {
            is_leaf: false,
            feature: desc.feature,
            default_left: desc.default_left,
            val: desc.threshold.to_bits(),
        },
    }
}

fn overflow(tree: usize, storage: StorageKind, field: &'static str, value: usize, limit: usize) -> FilError {
    FilError::EncodingOverflow {
        tree,
        storage,
        field,
        value,
        limit,
    }
}

/// Encode validated trees into the requested storage and move them to the device.
pub(crate) fn encode_storage(
    device: &Device,
    trees: &[TreeDescription],
    kind: StorageKind,
    layout: DenseLayout,
    shape: ForestShape,
) -> Result<ForestStorage> {
    let storage = match kind {
        StorageKind::Dense => ForestStorage::Dense(encode_dense(device, trees, layout, shape.max_depth)?),
        StorageKind::Sparse16 => ForestStorage::Sparse16(encode_sparse(device, trees, |tree, fields, _, left| {
            SparseNode16::encode(fields, left.unwrap_or(0))
                .ok_or_else(|| overflow(tree, StorageKind::Sparse16, "feature", fields.feature as usize, WIDE_FEATURE_LIMIT))
        })?),
        StorageKind::Sparse8 => ForestStorage::Sparse8(encode_sparse(device, trees, |tree, fields, pos, left| {
            if fields.feature as usize > SparseNode8::MAX_FEATURE {
                return Err(overflow(
                    tree,
                    StorageKind::Sparse8,
                    "feature",
                    fields.feature as usize,
                    SparseNode8::MAX_FEATURE,
                ));
            }
            let offset = left.map_or(0, |l| l - pos);
            SparseNode8::encode(fields, offset).ok_or_else(|| {
                overflow(tree, StorageKind::Sparse8, "left offset", offset, SparseNode8::MAX_LEFT_OFFSET)
            })
        })?),
    };
    Ok(storage)
}

/// Complete trees; slots below shallow leaves hold inert leaves.
fn encode_dense(
    device: &Device,
    trees: &[TreeDescription],
    layout: DenseLayout,
    depth: u32,
) -> Result<DenseStorage<DenseNode>> {
    if depth > MAX_DENSE_DEPTH {
        let deepest = trees.iter().position(|t| t.depth() == depth).unwrap_or(0);
        return Err(overflow(
            deepest,
            StorageKind::Dense,
            "depth",
            depth as usize,
            MAX_DENSE_DEPTH as usize,
        ));
    }

    let n_trees = trees.len();
    let inert = NodeFields::leaf(0);
    let inert = DenseNode::encode(&inert).unwrap_or_default();
    let mut nodes = vec![inert; n_trees * complete_tree_nodes(depth)];

    for (tree_idx, tree) in trees.iter().enumerate() {
        // (description id, dense in-tree index)
        let mut stack = vec![(0usize, 0usize)];
        while let Some((id, k)) = stack.pop() {
            let desc = &tree.nodes[id];
            let fields = fields_of(desc);
            let node = DenseNode::encode(&fields).ok_or_else(|| {
                overflow(tree_idx, StorageKind::Dense, "feature", fields.feature as usize, WIDE_FEATURE_LIMIT)
            })?;
            nodes[DenseStorage::<DenseNode>::position(layout, n_trees, depth, tree_idx, k)] = node;
            if !desc.is_leaf() {
                stack.push((desc.left as usize, node.child(k, false)));
                stack.push((desc.right as usize, node.child(k, true)));
            }
        }
    }

    Ok(DenseStorage::new(device.alloc(nodes), n_trees, depth, layout))
}

/// Breadth-first re-ordering so that siblings are adjacent.
///
/// `encode(tree, fields, position, left_position)` packs one node; leaves get
/// `left_position = None`.
fn encode_sparse<N, F>(device: &Device, trees: &[TreeDescription], encode: F) -> Result<SparseStorage<N>>
where
    N: ForestNode,
    F: Fn(usize, &NodeFields, usize, Option<usize>) -> Result<N>,
{
    let total: usize = trees.iter().map(TreeDescription::n_nodes).sum();
    let mut nodes = Vec::with_capacity(total);
    let mut root_offsets = Vec::with_capacity(trees.len());

    for (tree_idx, tree) in trees.iter().enumerate() {
        let offset = u32::try_from(nodes.len())
            .map_err(|_| overflow(tree_idx, N::KIND, "root offset", nodes.len(), u32::MAX as usize))?;
        root_offsets.push(offset);

        // BFS order: description id of the node at each in-tree position.
        let mut order = vec![0usize];
        let mut left_pos = vec![None; tree.n_nodes()];
        let mut queue = VecDeque::from([(0usize, 0usize)]);
        while let Some((id, pos)) = queue.pop_front() {
            let desc = &tree.nodes[id];
            if !desc.is_leaf() {
                let left = order.len();
                left_pos[pos] = Some(left);
                order.extend([desc.left as usize, desc.right as usize]);
                queue.push_back((desc.left as usize, left));
                queue.push_back((desc.right as usize, left + 1));
            }
        }

        for (pos, &id) in order.iter().enumerate() {
            let fields = fields_of(&tree.nodes[id]);
            nodes.push(encode(tree_idx, &fields, pos, left_pos[pos])?);
        }
    }

    Ok(SparseStorage::new(device.alloc(nodes), device.alloc(root_offsets)))
}
