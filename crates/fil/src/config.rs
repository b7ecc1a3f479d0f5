//! Forest construction and launch configuration.
//!
//! [`ForestConfig`] controls how a model description is laid out on the device
//! and which launch choices the plan builder may make for it. It is built with
//! `bon` and validated when the builder finishes.
//!
//! # Example
//!
//! ```
//! use fil::config::{ForestConfig, StorageType};
//! use fil::repr::DenseLayout;
//!
//! let config = ForestConfig::builder()
//!     .storage(StorageType::Dense)
//!     .dense_layout(DenseLayout::TreeMajor)
//!     .max_n_items(2)
//!     .build()
//!     .unwrap();
//! assert_eq!(config.plan_options().max_n_items, 2);
//! ```

use bon::Builder;
use serde::{Deserialize, Serialize};

use crate::plan::MAX_N_ITEMS;
use crate::repr::{DenseLayout, StorageKind};
use crate::transform::OutputTransform;

/// Deepest forest that [`StorageType::Auto`] will store densely.
pub const AUTO_DENSE_MAX_DEPTH: u32 = 10;

/// Errors raised while validating a [`ForestConfig`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("max_n_items must be in 1..={MAX_N_ITEMS}, got {0}")]
    InvalidMaxNItems(usize),
    #[error("{field} must be finite, got {value}")]
    NonFinite { field: &'static str, value: f32 },
}

/// Requested storage for a forest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageType {
    /// Dense for shallow, well-filled forests; 16-byte sparse otherwise.
    #[default]
    Auto,
    Dense,
    /// Sparse with 16-byte nodes.
    Sparse,
    /// Sparse with 8-byte nodes. Import fails if a tree does not fit.
    Sparse8,
}

impl StorageType {
    /// Resolve to a concrete storage kind given the shape of a forest.
    ///
    /// `dense_nodes` is the node count the forest would occupy as complete trees,
    /// `sparse_nodes` the count of nodes that actually exist.
    pub fn resolve(self, max_depth: u32, dense_nodes: usize, sparse_nodes: usize) -> StorageKind {
        match self {
            StorageType::Dense => StorageKind::Dense,
            StorageType::Sparse => StorageKind::Sparse16,
            StorageType::Sparse8 => StorageKind::Sparse8,
            StorageType::Auto => {
                if max_depth <= AUTO_DENSE_MAX_DEPTH && dense_nodes <= 2 * sparse_nodes {
                    StorageKind::Dense
                } else {
                    StorageKind::Sparse16
                }
            }
        }
    }
}

/// Launch choices the plan builder honours for one forest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PlanOptions {
    /// Blocks per SM; 0 launches one block per row group.
    pub blocks_per_sm: usize,
    /// Upper bound for rows per thread, in `1..=4`.
    pub max_n_items: usize,
    /// Allow caching the block's input rows in shared memory.
    pub column_cache: bool,
}

impl Default for PlanOptions {
    fn default() -> Self {
        Self {
            blocks_per_sm: 0,
            max_n_items: MAX_N_ITEMS,
            column_cache: true,
        }
    }
}

/// Configuration for building a [`Forest`](crate::Forest).
///
/// Overrides (`transform`, `threshold`, `global_bias`) replace the values
/// carried by the model description when set.
#[derive(Debug, Clone, Builder)]
#[builder(
    derive(Clone, Debug),
    finish_fn(vis = "", name = __build_internal)
)]
pub struct ForestConfig {
    /// Tree storage. Default: [`StorageType::Auto`].
    #[builder(default)]
    pub storage: StorageType,

    /// Node arrangement for dense storage. Default: interleaved.
    #[builder(default)]
    pub dense_layout: DenseLayout,

    /// Output transform override.
    pub transform: Option<OutputTransform>,

    /// Class threshold override for binary classifiers.
    pub threshold: Option<f32>,

    /// Global bias override.
    pub global_bias: Option<f32>,

    /// Blocks per SM. Default: 0 (one block per row group).
    #[builder(default)]
    pub blocks_per_sm: usize,

    /// Cap on rows per thread. Default: 4.
    #[builder(default = MAX_N_ITEMS)]
    pub max_n_items: usize,

    /// Allow shared-memory column caching. Default: true.
    #[builder(default = true)]
    pub column_cache: bool,
}

impl<S: forest_config_builder::IsComplete> ForestConfigBuilder<S> {
    /// Build and validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `max_n_items` is outside `1..=4` or an
    /// override is not finite.
    pub fn build(self) -> Result<ForestConfig, ConfigError> {
        let config = self.__build_internal();
        config.validate()?;
        Ok(config)
    }
}

impl Default for ForestConfig {
    fn default() -> Self {
        Self::builder().__build_internal()
    }
}

impl ForestConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=MAX_N_ITEMS).contains(&self.max_n_items) {
            return Err(ConfigError::InvalidMaxNItems(self.max_n_items));
        }
        let overrides = [("threshold", self.threshold), ("global_bias", self.global_bias)];
        for (field, value) in overrides {
            match value {
                Some(value) if !value.is_finite() => return Err(ConfigError::NonFinite { field, value }),
                _ => {}
            }
        }
        Ok(())
    }

    pub fn plan_options(&self) -> PlanOptions {
        PlanOptions {
            blocks_per_sm: self.blocks_per_sm,
            max_n_items: self.max_n_items,
            column_cache: self.column_cache,
        }
    }
}
