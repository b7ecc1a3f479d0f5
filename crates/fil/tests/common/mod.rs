//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::sync::Once;

use fil::{Forest, LeafKind, LeafOutput};
use ndarray::{Array2, ArrayView2};

static TRACING: Once = Once::new();

/// Install a test-friendly subscriber once per test binary.
///
/// Honours `RUST_LOG`; silent by default.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

fn leaf_value(leaf: LeafOutput) -> f32 {
    match leaf {
        LeafOutput::Value(v) => v,
        LeafOutput::Class(c) => c as f32,
    }
}

/// Lowest index of the maximum.
pub fn argmax(values: &[f32]) -> usize {
    let mut best = 0;
    for (i, v) in values.iter().enumerate() {
        if *v > values[best] {
            best = i;
        }
    }
    best
}

/// Per-class grove margins for one row, averaged and biased as the forest is
/// configured to do.
pub fn grove_margins(forest: &Forest, row: &[f32]) -> Vec<f32> {
    let meta = forest.meta();
    let mut margins = vec![0.0f32; meta.num_classes];
    for (tree, leaf) in forest.leaf_outputs(row).into_iter().enumerate() {
        margins[tree % meta.num_classes] += leaf_value(leaf);
    }
    for (class, m) in margins.iter_mut().enumerate() {
        *m = meta.transform.scale(*m, meta.trees_per_class(class)) + meta.global_bias;
    }
    margins
}

/// Straightforward host prediction, one row at a time.
pub fn reference_predict(forest: &Forest, input: ArrayView2<f32>, predict_proba: bool) -> Array2<f32> {
    let meta = forest.meta();
    let rows: Vec<Vec<f32>> = input
        .rows()
        .into_iter()
        .map(|row| {
            let row = row.to_vec();
            match meta.leaf_kind {
                LeafKind::FloatUnaryBinary => {
                    let sum: f32 = forest.leaf_outputs(&row).into_iter().map(leaf_value).sum();
                    let mut value = [meta.transform.scale(sum, meta.n_trees) + meta.global_bias];
                    meta.transform.activation.apply_inplace(&mut value);
                    let [value] = value;
                    if predict_proba {
                        vec![1.0 - value, value]
                    } else if meta.num_classes == 2 {
                        vec![if value > meta.threshold { 1.0 } else { 0.0 }]
                    } else {
                        vec![value]
                    }
                }
                LeafKind::GrovePerClass => {
                    let mut margins = grove_margins(forest, &row);
                    if predict_proba {
                        meta.transform.activation.apply_inplace(&mut margins);
                        margins
                    } else {
                        vec![argmax(&margins) as f32]
                    }
                }
                LeafKind::CategoricalLeaf => {
                    let mut votes = vec![0.0f32; meta.num_classes];
                    for leaf in forest.leaf_outputs(&row) {
                        votes[leaf_value(leaf) as usize] += 1.0;
                    }
                    if predict_proba {
                        votes.iter().map(|v| v / meta.n_trees as f32).collect()
                    } else {
                        vec![argmax(&votes) as f32]
                    }
                }
            }
        })
        .collect();

    let width = rows.first().map_or(1, Vec::len);
    Array2::from_shape_vec((rows.len(), width), rows.into_iter().flatten().collect())
        .expect("rows have equal width")
}

/// Plain `exp(x) / sum(exp)` in f64.
pub fn softmax(values: &[f32]) -> Vec<f32> {
    let exps: Vec<f64> = values.iter().map(|&v| f64::from(v).exp()).collect();
    let total: f64 = exps.iter().sum();
    exps.iter().map(|e| (e / total) as f32).collect()
}
