//! Error taxonomy for forest import, planning and prediction.
//!
//! Input-contract and configuration failures are returned as [`FilError`] so the
//! caller can retry with adjusted parameters. Internal inconsistencies between
//! the plan builder and the kernel table are programming bugs and panic instead.

use crate::config::ConfigError;
use crate::plan::LeafAlgo;
use crate::repr::{ModelValidationError, StorageKind};

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, FilError>;

/// Errors surfaced to callers of the inference engine.
#[derive(Debug, thiserror::Error)]
pub enum FilError {
    /// Input matrix is stored column-major (Fortran order).
    #[error("input must be row-major; got a column-major matrix of shape {rows}x{cols}")]
    ColumnMajorInput { rows: usize, cols: usize },

    /// Input matrix is neither row-major nor column-major contiguous.
    #[error("input must be a contiguous row-major matrix; got strides {strides:?}")]
    NonContiguousInput { strides: Vec<isize> },

    /// Input has a different number of columns than the forest was built for.
    #[error("input has {actual} columns but the forest expects {expected}")]
    FeatureCountMismatch { expected: usize, actual: usize },

    /// Caller-provided output buffer has the wrong shape.
    #[error("output buffer has shape {actual:?}, expected {expected:?}")]
    OutputShapeMismatch {
        expected: (usize, usize),
        actual: (usize, usize),
    },

    /// Probabilities were requested from a regression forest.
    #[error("predict_proba requires a classifier; forest has {num_classes} output class(es)")]
    ProbaNotSupported { num_classes: usize },

    /// No launch configuration fits into the device's shared memory.
    #[error(
        "shared memory footprint of {required} bytes exceeds the device limit of {limit} bytes \
         ({columns} columns, {algo:?}, even with n_items=1 and column caching disabled)"
    )]
    SharedMemoryExceeded {
        required: usize,
        limit: usize,
        columns: usize,
        algo: LeafAlgo,
    },

    /// Invalid forest configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The model description violates a structural invariant.
    #[error("invalid model: {0}")]
    InvalidModel(#[from] ModelValidationError),

    /// A tree does not fit the addressable range of the chosen node encoding.
    #[error("tree {tree}: {field} {value} exceeds the {storage:?} limit of {limit}")]
    EncodingOverflow {
        tree: usize,
        storage: StorageKind,
        field: &'static str,
        value: usize,
        limit: usize,
    },

    /// A model description could not be parsed.
    #[error("failed to parse model description: {0}")]
    Parse(#[from] serde_json::Error),

    /// A model description could not be read.
    #[error("failed to read model description: {0}")]
    Io(#[from] std::io::Error),

    /// The stream's worker thread could not be started.
    #[error("failed to spawn stream worker: {0}")]
    StreamSpawn(#[source] std::io::Error),

    /// The stream's worker thread has exited (a previous job panicked).
    #[error("stream {0} is no longer accepting work")]
    StreamClosed(u64),

    /// The stream was created on a different device than the predictor's.
    #[error("stream {0} belongs to another device")]
    StreamDeviceMismatch(u64),
}
