//! Leaf aggregation algorithms.
//!
//! Each algorithm decides what a logical thread keeps in registers, where it
//! folds its partial results in the block's shared accumulators, and how one
//! row's accumulators become output values. Accumulator layout per row:
//!
//! | algorithm           | slots             | slot written by thread `t`, tree `j` |
//! |---------------------|-------------------|--------------------------------------|
//! | [`UnaryBinary`]     | warps per block   | `t / warp_size`                      |
//! | [`GroveFewClasses`] | `block_threads`   | `t` (class `t % C`)                  |
//! | [`GroveManyClasses`]| `C`               | `j % C`                              |
//! | [`Categorical`]     | `C`               | leaf class id (vote count)           |

use super::{Block, argmax};
use crate::plan::{LaunchShape, LeafAlgo};
use crate::repr::{ForestMeta, TreeStorage};
use crate::transform::Activation;

pub(crate) trait LeafAlgorithm: Send + Sync + 'static {
    const ALGO: LeafAlgo;

    /// Walk the trees of logical thread `thread` for every row of the block and
    /// fold the leaf outputs into `acc` (`N * acc_len` floats).
    fn thread_pass<S: TreeStorage, const N: usize>(block: &Block<'_, S, N>, thread: usize, acc: &mut [f32]);

    /// Turn one row's accumulators into its `n_outputs` output values.
    fn finalize(meta: &ForestMeta, shape: &LaunchShape, acc: &mut [f32], out: &mut [f32]);
}

/// Float leaves summed into one margin per row.
pub(crate) struct UnaryBinary;

impl LeafAlgorithm for UnaryBinary {
    const ALGO: LeafAlgo = LeafAlgo::UnaryBinary;

    #[inline]
    fn thread_pass<S: TreeStorage, const N: usize>(block: &Block<'_, S, N>, thread: usize, acc: &mut [f32]) {
        let mut partial = [0f32; N];
        for tree_idx in block.trees(thread) {
            let tree = block.tree(tree_idx);
            for (item, sum) in partial.iter_mut().enumerate().take(block.items()) {
                *sum += f32::from_bits(tree.leaf_payload(block.row(item)));
            }
        }
        let warp = thread / block.warp_size();
        for (item, sum) in partial.iter().enumerate().take(block.items()) {
            acc[item * block.acc_len() + warp] += sum;
        }
    }

    fn finalize(meta: &ForestMeta, shape: &LaunchShape, acc: &mut [f32], out: &mut [f32]) {
        let margin: f32 = acc.iter().sum();
        let mut value = [meta.transform.scale(margin, meta.n_trees) + meta.global_bias];
        // Softmax is rejected for unary forests at import.
        if meta.transform.activation == Activation::Sigmoid {
            Activation::Sigmoid.apply_inplace(&mut value);
        }
        let [value] = value;

        if shape.predict_proba {
            out[0] = 1.0 - value;
            out[1] = value;
        } else if meta.num_classes == 2 {
            out[0] = if value > meta.threshold { 1.0 } else { 0.0 };
        } else {
            out[0] = value;
        }
    }
}

/// Per-class margins to outputs: average, add bias, then argmax or activation.
fn finalize_grove(meta: &ForestMeta, shape: &LaunchShape, margins: &mut [f32], out: &mut [f32]) {
    for (class, m) in margins.iter_mut().enumerate() {
        *m = meta.transform.scale(*m, meta.trees_per_class(class)) + meta.global_bias;
    }
    if shape.predict_proba {
        meta.transform.activation.apply_inplace(margins);
        out.copy_from_slice(margins);
    } else {
        out[0] = argmax(margins) as f32;
    }
}

/// Grove whose classes fit in one block: each thread owns a slot and always
/// sees trees of the same class.
pub(crate) struct GroveFewClasses;

impl LeafAlgorithm for GroveFewClasses {
    const ALGO: LeafAlgo = LeafAlgo::GroveFewClasses;

    #[inline]
    fn thread_pass<S: TreeStorage, const N: usize>(block: &Block<'_, S, N>, thread: usize, acc: &mut [f32]) {
        let mut partial = [0f32; N];
        for tree_idx in block.trees(thread) {
            let tree = block.tree(tree_idx);
            for (item, sum) in partial.iter_mut().enumerate().take(block.items()) {
                *sum += f32::from_bits(tree.leaf_payload(block.row(item)));
            }
        }
        for (item, sum) in partial.iter().enumerate().take(block.items()) {
            acc[item * block.acc_len() + thread] = *sum;
        }
    }

    fn finalize(meta: &ForestMeta, shape: &LaunchShape, acc: &mut [f32], out: &mut [f32]) {
        // In-block reduction: slot `s` holds a partial for class `s % C`.
        let num_classes = shape.num_classes;
        for slot in num_classes..acc.len() {
            acc[slot % num_classes] += acc[slot];
        }
        finalize_grove(meta, shape, &mut acc[..num_classes], out);
    }
}

/// Grove with more classes than threads: leaves go straight to their class.
pub(crate) struct GroveManyClasses;

impl LeafAlgorithm for GroveManyClasses {
    const ALGO: LeafAlgo = LeafAlgo::GroveManyClasses;

    #[inline]
    fn thread_pass<S: TreeStorage, const N: usize>(block: &Block<'_, S, N>, thread: usize, acc: &mut [f32]) {
        let num_classes = block.acc_len();
        for tree_idx in block.trees(thread) {
            let tree = block.tree(tree_idx);
            let class = tree_idx % num_classes;
            for item in 0..block.items() {
                acc[item * num_classes + class] += f32::from_bits(tree.leaf_payload(block.row(item)));
            }
        }
    }

    fn finalize(meta: &ForestMeta, shape: &LaunchShape, acc: &mut [f32], out: &mut [f32]) {
        finalize_grove(meta, shape, acc, out);
    }
}

/// Class-id leaves; every tree casts one vote.
pub(crate) struct Categorical;

impl LeafAlgorithm for Categorical {
    const ALGO: LeafAlgo = LeafAlgo::Categorical;

    #[inline]
    fn thread_pass<S: TreeStorage, const N: usize>(block: &Block<'_, S, N>, thread: usize, acc: &mut [f32]) {
        let num_classes = block.acc_len();
        for tree_idx in block.trees(thread) {
            let tree = block.tree(tree_idx);
            for item in 0..block.items() {
                let class = tree.leaf_payload(block.row(item)) as usize;
                acc[item * num_classes + class] += 1.0;
            }
        }
    }

    fn finalize(meta: &ForestMeta, shape: &LaunchShape, acc: &mut [f32], out: &mut [f32]) {
        if shape.predict_proba {
            let n_trees = meta.n_trees.max(1) as f32;
            for (p, votes) in out.iter_mut().zip(acc.iter()) {
                *p = votes / n_trees;
            }
        } else {
            out[0] = argmax(acc) as f32;
        }
    }
}
