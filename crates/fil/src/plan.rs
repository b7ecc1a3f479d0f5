//! Execution plan builder.
//!
//! For every predict call the builder resolves how the kernel is launched:
//!
//! 1. the leaf algorithm, from the forest's leaf kind and class count
//! 2. the block width, `FIL_TPB` or, for few-class groves, the largest
//!    multiple of the class count that fits in it
//! 3. rows per thread (`n_items`) and whether the block's input rows are cached
//!    in shared memory, chosen so the shared-memory footprint fits the device's
//!    opt-in limit
//! 4. the grid size, from the row count and the `blocks_per_sm` option
//!
//! Steps 1-3 do not depend on the row count; their result is a [`LaunchShape`]
//! that [`PlanCache`] memoizes per (forest, columns, proba).

use std::collections::HashMap;
use std::sync::Mutex;

use crate::config::PlanOptions;
use crate::device::DeviceProperties;
use crate::dispatch::VariantKey;
use crate::repr::{ForestId, ForestMeta, LeafKind, StorageKind};
use crate::{FilError, Forest, Result};

/// Threads per block.
pub const FIL_TPB: usize = 256;

/// Largest number of rows a thread processes per pass.
pub const MAX_N_ITEMS: usize = 4;

const F32_BYTES: usize = std::mem::size_of::<f32>();

/// How leaf outputs of different trees are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LeafAlgo {
    /// One running sum per row.
    UnaryBinary,
    /// One running total per class, classes fit within a block.
    GroveFewClasses,
    /// One running total per class, more classes than threads in a block.
    GroveManyClasses,
    /// Per-class vote counts.
    Categorical,
}

impl LeafAlgo {
    pub const ALL: [LeafAlgo; 4] = [
        LeafAlgo::UnaryBinary,
        LeafAlgo::GroveFewClasses,
        LeafAlgo::GroveManyClasses,
        LeafAlgo::Categorical,
    ];

    #[inline]
    pub(crate) fn index(self) -> usize {
        match self {
            LeafAlgo::UnaryBinary => 0,
            LeafAlgo::GroveFewClasses => 1,
            LeafAlgo::GroveManyClasses => 2,
            LeafAlgo::Categorical => 3,
        }
    }

    pub fn for_forest(leaf_kind: LeafKind, num_classes: usize) -> Self {
        match leaf_kind {
            LeafKind::FloatUnaryBinary => LeafAlgo::UnaryBinary,
            LeafKind::GrovePerClass if num_classes <= FIL_TPB => LeafAlgo::GroveFewClasses,
            LeafKind::GrovePerClass => LeafAlgo::GroveManyClasses,
            LeafKind::CategoricalLeaf => LeafAlgo::Categorical,
        }
    }

    /// Threads per block for this algorithm.
    pub fn block_threads(self, num_classes: usize) -> usize {
        match self {
            LeafAlgo::GroveFewClasses => FIL_TPB - FIL_TPB % num_classes.max(1),
            _ => FIL_TPB,
        }
    }

    /// Accumulator floats kept in shared memory per row.
    pub fn accumulator_len(self, block_threads: usize, num_classes: usize, warp_size: usize) -> usize {
        match self {
            LeafAlgo::UnaryBinary => block_threads.div_ceil(warp_size.max(1)),
            LeafAlgo::GroveFewClasses => block_threads,
            LeafAlgo::GroveManyClasses | LeafAlgo::Categorical => num_classes,
        }
    }
}

/// Shared-memory bytes needed by one block.
pub fn shmem_footprint(
    algo: LeafAlgo,
    cols_in_shmem: bool,
    n_items: usize,
    columns: usize,
    num_classes: usize,
    warp_size: usize,
) -> usize {
    let block_threads = algo.block_threads(num_classes);
    let cols = if cols_in_shmem { n_items * columns * F32_BYTES } else { 0 };
    cols + n_items * algo.accumulator_len(block_threads, num_classes, warp_size) * F32_BYTES
}

/// Row-independent part of an execution plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LaunchShape {
    pub storage: StorageKind,
    pub algo: LeafAlgo,
    pub cols_in_shmem: bool,
    pub n_items: usize,
    pub block_threads: usize,
    /// Shared memory per block, in bytes.
    pub shmem_size: usize,
    pub columns: usize,
    pub num_classes: usize,
    /// Output values per row.
    pub n_outputs: usize,
    pub predict_proba: bool,
}

impl LaunchShape {
    /// Key of the kernel variant this shape runs.
    #[inline]
    pub fn variant(&self) -> VariantKey {
        VariantKey {
            storage: self.storage,
            cols_in_shmem: self.cols_in_shmem,
            algo: self.algo,
            n_items: self.n_items,
        }
    }

    /// Shared-memory floats reserved for cached input rows.
    #[inline]
    pub(crate) fn cached_cols_len(&self) -> usize {
        if self.cols_in_shmem { self.n_items * self.columns } else { 0 }
    }

    /// Complete the plan for a batch of `rows`.
    pub fn with_rows(self, rows: usize, sm_count: usize, blocks_per_sm: usize) -> ExecutionPlan {
        let row_groups = rows.div_ceil(self.n_items);
        let grid = if blocks_per_sm > 0 {
            row_groups.min(sm_count * blocks_per_sm).max(1)
        } else {
            row_groups.max(1)
        };
        ExecutionPlan {
            shape: self,
            rows,
            grid,
        }
    }
}

/// Fully resolved launch configuration for one call. Owns nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionPlan {
    pub shape: LaunchShape,
    pub rows: usize,
    /// Number of blocks; blocks loop over row groups grid-stride.
    pub grid: usize,
}

impl ExecutionPlan {
    #[inline]
    pub fn row_groups(&self) -> usize {
        self.rows.div_ceil(self.shape.n_items)
    }
}

/// Resolves launch shapes against a device's limits.
#[derive(Debug, Clone, Copy)]
pub struct PlanBuilder {
    properties: DeviceProperties,
    options: PlanOptions,
}

impl PlanBuilder {
    pub fn new(properties: DeviceProperties, options: PlanOptions) -> Self {
        Self { properties, options }
    }

    /// Resolve the launch shape for a forest and batch width.
    ///
    /// # Errors
    ///
    /// - [`FilError::ProbaNotSupported`] if probabilities are requested from a
    ///   single-output forest
    /// - [`FilError::SharedMemoryExceeded`] if even one row per thread without
    ///   column caching exceeds the device limit
    pub fn launch_shape(
        &self,
        meta: &ForestMeta,
        storage: StorageKind,
        columns: usize,
        predict_proba: bool,
    ) -> Result<LaunchShape> {
        let num_classes = meta.num_classes;
        if predict_proba && num_classes < 2 {
            return Err(FilError::ProbaNotSupported { num_classes });
        }

        let algo = LeafAlgo::for_forest(meta.leaf_kind, num_classes);
        let block_threads = algo.block_threads(num_classes);
        let n_outputs = match (predict_proba, algo) {
            (false, _) => 1,
            (true, LeafAlgo::UnaryBinary) => 2,
            (true, _) => num_classes,
        };

        let limit = self.properties.max_shared_mem_per_block_optin;
        let warp_size = self.properties.warp_size;
        let max_n_items = self.options.max_n_items.clamp(1, MAX_N_ITEMS);
        let caching: &[bool] = if self.options.column_cache { &[true, false] } else { &[false] };

        for &cols_in_shmem in caching {
            for n_items in (1..=max_n_items).rev() {
                let shmem_size = shmem_footprint(algo, cols_in_shmem, n_items, columns, num_classes, warp_size);
                if shmem_size <= limit {
                    let shape = LaunchShape {
                        storage,
                        algo,
                        cols_in_shmem,
                        n_items,
                        block_threads,
                        shmem_size,
                        columns,
                        num_classes,
                        n_outputs,
                        predict_proba,
                    };
                    tracing::debug!(?shape, limit, "resolved launch shape");
                    return Ok(shape);
                }
            }
        }

        Err(FilError::SharedMemoryExceeded {
            required: shmem_footprint(algo, false, 1, columns, num_classes, warp_size),
            limit,
            columns,
            algo,
        })
    }

    /// Resolve a complete plan for a forest and batch.
    pub fn build(&self, forest: &Forest, columns: usize, rows: usize, predict_proba: bool) -> Result<ExecutionPlan> {
        let shape = self.launch_shape(forest.meta(), forest.storage_kind(), columns, predict_proba)?;
        Ok(self.complete(shape, rows))
    }

    /// Attach a row count to a resolved shape.
    pub fn complete(&self, shape: LaunchShape, rows: usize) -> ExecutionPlan {
        shape.with_rows(rows, self.properties.sm_count, self.options.blocks_per_sm)
    }
}

type PlanKey = (ForestId, usize, bool);

/// Memoized launch shapes keyed by forest identity, batch width and proba.
#[derive(Debug, Default)]
pub struct PlanCache {
    shapes: Mutex<HashMap<PlanKey, LaunchShape>>,
}

impl PlanCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached shape for this forest and batch width, resolving it on a miss.
    pub fn launch_shape(
        &self,
        builder: &PlanBuilder,
        forest: &Forest,
        columns: usize,
        predict_proba: bool,
    ) -> Result<LaunchShape> {
        let key = (forest.id(), columns, predict_proba);
        if let Some(shape) = self.lock().get(&key) {
            return Ok(*shape);
        }
        let shape = builder.launch_shape(forest.meta(), forest.storage_kind(), columns, predict_proba)?;
        self.lock().insert(key, shape);
        Ok(shape)
    }

    /// Drop every entry of one forest.
    pub fn evict(&self, forest: ForestId) {
        self.lock().retain(|(id, _, _), _| *id != forest);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<PlanKey, LaunchShape>> {
        // Entries are plain data, so a poisoned map is still consistent.
        self.shapes.lock().unwrap_or_else(|e| e.into_inner())
    }
}
