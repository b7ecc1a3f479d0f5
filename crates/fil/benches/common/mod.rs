//! Shared setup for prediction benchmarks.

#![allow(dead_code)]

use std::fmt;

use fil::testing::{RandomForestParams, random_model};
use fil::{Device, Forest, ForestConfig, ModelDescription};

/// Forest sizes used across suites.
#[derive(Debug, Clone, Copy)]
pub struct ForestShape {
    pub name: &'static str,
    pub n_trees: usize,
    pub max_depth: u32,
}

pub const FOREST_SHAPES: &[ForestShape] = &[
    ForestShape {
        name: "small",
        n_trees: 50,
        max_depth: 4,
    },
    ForestShape {
        name: "medium",
        n_trees: 200,
        max_depth: 6,
    },
    ForestShape {
        name: "large",
        n_trees: 500,
        max_depth: 8,
    },
];

pub const BATCH_SIZES: &[usize] = &[1, 100, 1_000, 10_000];

pub const N_FEATURES: usize = 32;

pub fn regression_model(shape: ForestShape) -> ModelDescription {
    random_model(&RandomForestParams::regression(shape.n_trees, N_FEATURES, shape.max_depth))
}

pub fn load(device: &Device, model: &ModelDescription, config: &ForestConfig) -> Forest {
    Forest::from_model(device, model, config).expect("benchmark model must load")
}

/// Benchmark id component for a batch shape.
#[derive(Clone, Copy)]
pub struct ShapeId {
    pub rows: usize,
    pub cols: usize,
}

impl fmt::Display for ShapeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rows={} cols={}", self.rows, self.cols)
    }
}
