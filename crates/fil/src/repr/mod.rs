//! Forest representation.
//!
//! - [`node`]: packed node encodings
//! - [`storage`]: dense and sparse tree storage
//! - [`forest`]: the forest descriptor and its metadata
//! - [`import`]: model descriptions, validation and encoding

pub mod forest;
pub mod import;
pub mod node;
pub mod storage;

pub use forest::{Forest, ForestId, ForestMeta, ForestStorage, LeafKind, StorageSelect};
pub use import::{
    MAX_DENSE_DEPTH, ModelDescription, ModelValidationError, NodeDescription, NodeId, TreeDescription,
    TreeValidationError,
};
pub use node::{DenseNode, ForestNode, LeafOutput, SparseNode8, SparseNode16, StorageKind};
pub use storage::{DenseLayout, DenseStorage, SparseStorage, TreeRef, TreeStorage, complete_tree_nodes};
