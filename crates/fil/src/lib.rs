//! Batched decision-forest inference.
//!
//! `fil` runs trained tree ensembles over large row-major batches on a
//! SIMT-shaped device. A model is imported once into a device-resident
//! [`Forest`]; each prediction resolves an execution plan from the forest's
//! shape and the device's shared-memory limit and dispatches one of a closed set
//! of specialized kernels.
//!
//! # Key types
//!
//! - [`Device`], [`DeviceProperties`], [`Stream`]: the execution substrate
//! - [`ModelDescription`]: the model exchange format (JSON-loadable)
//! - [`Forest`]: immutable, device-resident ensemble
//! - [`ForestConfig`]: storage and launch options
//! - [`Predictor`]: synchronous and stream-ordered prediction
//!
//! # Example
//!
//! ```
//! use fil::testing::{RandomForestParams, random_dense_f32, random_model};
//! use fil::{Device, Forest, ForestConfig, Predictor};
//!
//! let device = Device::default();
//! let model = random_model(&RandomForestParams::multiclass(10, 3, 6, 4));
//! let forest = Forest::from_model(&device, &model, &ForestConfig::default()).unwrap();
//!
//! let rows = random_dense_f32(100, 6, 0, -1.0, 1.0);
//! let proba = Predictor::new(&device).predict_proba(&forest, rows.view()).unwrap();
//! assert_eq!(proba.dim(), (100, 3));
//! ```

pub mod config;
pub mod device;
pub mod dispatch;
pub mod error;
mod kernel;
pub mod plan;
pub mod predict;
pub mod repr;
pub mod testing;
pub mod transform;
pub mod utils;

pub use config::{ConfigError, ForestConfig, PlanOptions, StorageType};
pub use device::{Device, DeviceProperties, PendingPrediction, Stream};
pub use error::{FilError, Result};
pub use plan::{ExecutionPlan, LaunchShape, LeafAlgo, PlanBuilder, PlanCache};
pub use predict::Predictor;
pub use repr::{
    DenseLayout, Forest, ForestId, ForestMeta, LeafKind, LeafOutput, ModelDescription, ModelValidationError,
    NodeDescription, StorageKind, TreeDescription, TreeValidationError,
};
pub use transform::{Activation, OutputTransform};
pub use utils::Parallelism;

// Re-export approx for downstream float comparisons in tests.
pub use approx;
