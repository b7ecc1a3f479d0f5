//! Forest descriptor.
//!
//! A [`Forest`] is the immutable, traversal-ready form of a model: device-resident
//! node storage plus the metadata needed to turn accumulated leaf values into
//! predictions. It is built once by [`Forest::from_model`] and shared by any
//! number of concurrent predictions (wrap it in an `Arc` for streams).

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use super::import::{ForestShape, ModelDescription, encode_storage, validate_transform};
use super::node::{DenseNode, LeafOutput, SparseNode8, SparseNode16, StorageKind};
use super::storage::{DenseStorage, SparseStorage, TreeStorage};
use crate::Result;
use crate::config::{ForestConfig, PlanOptions};
use crate::device::Device;
use crate::transform::OutputTransform;

static NEXT_FOREST_ID: AtomicU64 = AtomicU64::new(0);

/// Process-unique forest identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ForestId(u64);

impl ForestId {
    fn next() -> Self {
        Self(NEXT_FOREST_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// What a leaf stores and how leaves of different trees combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeafKind {
    /// Float leaves summed into one margin per row.
    FloatUnaryBinary,
    /// Float leaves; tree `j` contributes to class `j % num_classes`.
    GrovePerClass,
    /// Class-id leaves; each tree casts one vote.
    CategoricalLeaf,
}

impl LeafKind {
    /// Decode a leaf's payload word.
    #[inline]
    pub fn decode(self, raw: u32) -> LeafOutput {
        match self {
            LeafKind::FloatUnaryBinary | LeafKind::GrovePerClass => LeafOutput::Value(f32::from_bits(raw)),
            LeafKind::CategoricalLeaf => LeafOutput::Class(raw),
        }
    }
}

/// Ensemble metadata shared by all trees.
#[derive(Debug, Clone, PartialEq)]
pub struct ForestMeta {
    pub n_trees: usize,
    pub n_features: usize,
    /// 1 for regression, 2 for binary, C for multiclass.
    pub num_classes: usize,
    pub leaf_kind: LeafKind,
    pub transform: OutputTransform,
    pub global_bias: f32,
    /// Class threshold for binary classifiers.
    pub threshold: f32,
    pub max_depth: u32,
}

impl ForestMeta {
    /// Number of trees contributing to `class` in a grove forest.
    #[inline]
    pub fn trees_per_class(&self, class: usize) -> usize {
        let c = self.num_classes.max(1);
        self.n_trees / c + usize::from(class < self.n_trees % c)
    }
}

/// Device storage of a forest, one variant per node encoding.
#[derive(Debug)]
pub enum ForestStorage {
    Dense(DenseStorage<DenseNode>),
    Sparse16(SparseStorage<SparseNode16>),
    Sparse8(SparseStorage<SparseNode8>),
}

impl ForestStorage {
    pub fn kind(&self) -> StorageKind {
        match self {
            ForestStorage::Dense(_) => StorageKind::Dense,
            ForestStorage::Sparse16(_) => StorageKind::Sparse16,
            ForestStorage::Sparse8(_) => StorageKind::Sparse8,
        }
    }

    pub fn n_nodes(&self) -> usize {
        match self {
            ForestStorage::Dense(s) => s.n_nodes(),
            ForestStorage::Sparse16(s) => s.n_nodes(),
            ForestStorage::Sparse8(s) => s.n_nodes(),
        }
    }

    /// Raw leaf payload of every tree for one row.
    fn leaf_payloads(&self, row: &[f32]) -> Vec<u32> {
        fn walk<S: TreeStorage>(storage: &S, row: &[f32]) -> Vec<u32> {
            (0..storage.n_trees()).map(|t| storage.tree(t).leaf_payload(row)).collect()
        }
        match self {
            ForestStorage::Dense(s) => walk(s, row),
            ForestStorage::Sparse16(s) => walk(s, row),
            ForestStorage::Sparse8(s) => walk(s, row),
        }
    }

    fn release(self) -> usize {
        match self {
            ForestStorage::Dense(s) => s.release(),
            ForestStorage::Sparse16(s) => s.release(),
            ForestStorage::Sparse8(s) => s.release(),
        }
    }
}

/// Typed access to one storage variant.
///
/// Kernels are monomorphized per storage type; the dispatcher only hands a
/// forest to an entry point whose storage type matches.
pub trait StorageSelect: TreeStorage + Sized + 'static {
    const KIND: StorageKind;

    fn select(storage: &ForestStorage) -> Option<&Self>;
}

impl StorageSelect for DenseStorage<DenseNode> {
    const KIND: StorageKind = StorageKind::Dense;

    fn select(storage: &ForestStorage) -> Option<&Self> {
        match storage {
            ForestStorage::Dense(s) => Some(s),
            _ => None,
        }
    }
}

impl StorageSelect for SparseStorage<SparseNode16> {
    const KIND: StorageKind = StorageKind::Sparse16;

    fn select(storage: &ForestStorage) -> Option<&Self> {
        match storage {
            ForestStorage::Sparse16(s) => Some(s),
            _ => None,
        }
    }
}

impl StorageSelect for SparseStorage<SparseNode8> {
    const KIND: StorageKind = StorageKind::Sparse8;

    fn select(storage: &ForestStorage) -> Option<&Self> {
        match storage {
            ForestStorage::Sparse8(s) => Some(s),
            _ => None,
        }
    }
}

/// Traversal-ready ensemble resident on a device.
#[derive(Debug)]
pub struct Forest {
    id: ForestId,
    meta: ForestMeta,
    storage: ForestStorage,
    plan_options: PlanOptions,
    device: Device,
}

impl Forest {
    /// Validate a model description and move its trees to the device.
    ///
    /// # Errors
    ///
    /// - [`FilError::InvalidModel`](crate::FilError::InvalidModel) if the
    ///   description violates a structural invariant
    /// - [`FilError::EncodingOverflow`](crate::FilError::EncodingOverflow) if a
    ///   tree does not fit the chosen node encoding
    pub fn from_model(device: &Device, model: &ModelDescription, config: &ForestConfig) -> Result<Self> {
        model.validate()?;

        let transform = config.transform.unwrap_or(model.transform);
        validate_transform(model.leaf_kind, transform)?;

        let shape = ForestShape::of(&model.trees);
        let kind = config
            .storage
            .resolve(shape.max_depth, shape.dense_nodes, shape.sparse_nodes);
        let storage = encode_storage(device, &model.trees, kind, config.dense_layout, shape)?;

        let meta = ForestMeta {
            n_trees: model.n_trees(),
            n_features: model.num_features,
            num_classes: model.num_classes,
            leaf_kind: model.leaf_kind,
            transform,
            global_bias: config.global_bias.unwrap_or(model.global_bias),
            threshold: config.threshold.unwrap_or(model.threshold),
            max_depth: shape.max_depth,
        };

        let forest = Self {
            id: ForestId::next(),
            meta,
            storage,
            plan_options: config.plan_options(),
            device: device.clone(),
        };
        tracing::info!(
            forest = ?forest.id,
            storage = ?kind,
            n_trees = forest.meta.n_trees,
            n_nodes = forest.storage.n_nodes(),
            max_depth = shape.max_depth,
            leaf_kind = ?forest.meta.leaf_kind,
            "forest loaded"
        );
        Ok(forest)
    }

    #[inline]
    pub fn id(&self) -> ForestId {
        self.id
    }

    #[inline]
    pub fn meta(&self) -> &ForestMeta {
        &self.meta
    }

    #[inline]
    pub fn storage(&self) -> &ForestStorage {
        &self.storage
    }

    #[inline]
    pub fn storage_kind(&self) -> StorageKind {
        self.storage.kind()
    }

    #[inline]
    pub fn n_trees(&self) -> usize {
        self.meta.n_trees
    }

    #[inline]
    pub fn n_features(&self) -> usize {
        self.meta.n_features
    }

    #[inline]
    pub fn num_classes(&self) -> usize {
        self.meta.num_classes
    }

    #[inline]
    pub fn plan_options(&self) -> PlanOptions {
        self.plan_options
    }

    #[inline]
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Leaf reached in every tree by one row, in tree order.
    ///
    /// Host-side walk over the device storage; useful for explaining a
    /// prediction tree by tree.
    ///
    /// # Panics
    ///
    /// Panics if `row` is shorter than the forest's feature count.
    pub fn leaf_outputs(&self, row: &[f32]) -> Vec<LeafOutput> {
        assert!(row.len() >= self.meta.n_features, "row has too few features");
        self.storage
            .leaf_payloads(row)
            .into_iter()
            .map(|raw| self.meta.leaf_kind.decode(raw))
            .collect()
    }

    /// Free the forest's device storage, returning the bytes released.
    ///
    /// Consumes the forest, so it cannot be predicted against afterwards.
    /// Plans a [`Predictor`](crate::Predictor) cached for this forest stay in
    /// its cache; release through [`Predictor::release`](crate::Predictor::release)
    /// to drop them as well. Forest ids are never reused, so stale entries are
    /// never served to another forest.
    pub fn release(self) -> usize {
        let id = self.id;
        let bytes = self.storage.release();
        tracing::info!(forest = ?id, bytes, "forest released");
        bytes
    }
}
