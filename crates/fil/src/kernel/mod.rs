//! Traversal and aggregation kernel.
//!
//! One launch runs `plan.grid` blocks. Row group `g` (rows `g * N .. g * N + N`)
//! belongs to block `g % grid`, so a block walks its row groups grid-stride.
//! For each row group a block:
//!
//! 1. optionally copies the group's rows into its shared-memory column cache
//! 2. zeroes its shared accumulators
//! 3. runs `block_threads` logical threads in order; thread `t` walks trees
//!    `t, t + block_threads, ...` for every row of the group and folds the leaf
//!    outputs into the accumulators as its [`LeafAlgorithm`] prescribes
//! 4. finalizes each row's accumulators into the output
//!
//! Threads run in a fixed order inside a block, so the floating-point
//! accumulation order is fixed for a given plan and output is bit-reproducible.

mod algo;

pub(crate) use algo::{Categorical, GroveFewClasses, GroveManyClasses, LeafAlgorithm, UnaryBinary};

use std::iter::StepBy;
use std::ops::Range;

use crate::Forest;
use crate::device::Device;
use crate::plan::ExecutionPlan;
use crate::repr::{StorageSelect, TreeRef, TreeStorage};

const F32_BYTES: usize = std::mem::size_of::<f32>();

/// Buffers of one kernel launch.
#[derive(Debug)]
pub(crate) struct LaunchArgs<'a> {
    pub device: &'a Device,
    pub forest: &'a Forest,
    pub plan: &'a ExecutionPlan,
    /// Row-major `rows x columns`.
    pub input: &'a [f32],
    /// Row-major `rows x n_outputs`.
    pub output: &'a mut [f32],
}

/// Entry point of one kernel variant.
pub(crate) type KernelFn = fn(LaunchArgs<'_>);

/// View of the rows a block is processing and the forest it walks.
pub(crate) struct Block<'a, S, const N: usize> {
    storage: &'a S,
    rows: [&'a [f32]; N],
    items: usize,
    block_threads: usize,
    warp_size: usize,
    acc_len: usize,
}

impl<'a, S: TreeStorage, const N: usize> Block<'a, S, N> {
    /// Trees walked by logical thread `thread`.
    #[inline]
    pub fn trees(&self, thread: usize) -> StepBy<Range<usize>> {
        (thread..self.storage.n_trees()).step_by(self.block_threads)
    }

    #[inline]
    pub fn tree(&self, tree: usize) -> TreeRef<'a, S::Node> {
        self.storage.tree(tree)
    }

    /// Row of item `item`; only the first [`items`](Self::items) are valid.
    #[inline]
    pub fn row(&self, item: usize) -> &'a [f32] {
        self.rows[item]
    }

    /// Number of valid rows in this group (at most `N`).
    #[inline]
    pub fn items(&self) -> usize {
        self.items
    }

    #[inline]
    pub fn warp_size(&self) -> usize {
        self.warp_size
    }

    /// Accumulator floats per row.
    #[inline]
    pub fn acc_len(&self) -> usize {
        self.acc_len
    }
}

/// Kernel body, monomorphized over storage, column caching, leaf algorithm and
/// rows per thread.
pub(crate) fn launch<S, const COLS: bool, A, const N: usize>(args: LaunchArgs<'_>)
where
    S: StorageSelect,
    A: LeafAlgorithm,
{
    let LaunchArgs {
        device,
        forest,
        plan,
        input,
        output,
    } = args;
    let shape = &plan.shape;
    assert!(
        shape.n_items == N && shape.cols_in_shmem == COLS && shape.algo == A::ALGO,
        "kernel variant does not match plan: {:?}",
        shape.variant()
    );
    let storage = S::select(forest.storage())
        .unwrap_or_else(|| panic!("kernel for {:?} launched on {:?} storage", S::KIND, forest.storage_kind()));

    let meta = forest.meta();
    let columns = shape.columns;
    let n_outputs = shape.n_outputs;
    let grid = plan.grid;
    let warp_size = device.properties().warp_size;
    let acc_len = A::ALGO.accumulator_len(shape.block_threads, shape.num_classes, warp_size);
    let cached_len = shape.cached_cols_len();
    debug_assert_eq!((cached_len + N * acc_len) * F32_BYTES, shape.shmem_size);

    // Grid-stride assignment of row groups to blocks.
    let mut blocks: Vec<Vec<(&[f32], &mut [f32])>> = (0..grid).map(|_| Vec::new()).collect();
    for (g, rows_out) in output.chunks_mut(N * n_outputs).enumerate() {
        let items = rows_out.len() / n_outputs;
        let start = g * N * columns;
        blocks[g % grid].push((&input[start..start + items * columns], rows_out));
    }

    device.parallelism().maybe_par_for_each_init(
        blocks,
        || vec![0f32; shape.shmem_size / F32_BYTES],
        |shmem, groups| {
            for (rows_in, rows_out) in groups {
                let items = rows_out.len() / n_outputs;
                let (cache, acc) = shmem.split_at_mut(cached_len);
                if COLS {
                    cache[..rows_in.len()].copy_from_slice(rows_in);
                }
                let source: &[f32] = if COLS { cache } else { rows_in };
                let block = Block::<S, N> {
                    storage,
                    rows: std::array::from_fn(|i| {
                        let i = i.min(items - 1);
                        &source[i * columns..(i + 1) * columns]
                    }),
                    items,
                    block_threads: shape.block_threads,
                    warp_size,
                    acc_len,
                };

                acc.fill(0.0);
                for thread in 0..shape.block_threads {
                    A::thread_pass(&block, thread, acc);
                }
                for (item, out) in rows_out.chunks_mut(n_outputs).enumerate() {
                    A::finalize(meta, shape, &mut acc[item * acc_len..(item + 1) * acc_len], out);
                }
            }
        },
    );
}

/// Index of the largest value; ties resolve to the lowest index.
#[inline]
pub(crate) fn argmax(values: &[f32]) -> usize {
    let mut best = 0;
    for (i, &v) in values.iter().enumerate().skip(1) {
        if v > values[best] {
            best = i;
        }
    }
    best
}
