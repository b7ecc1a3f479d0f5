//! Synthetic model descriptions.

use rand::prelude::*;

use crate::repr::{LeafKind, LeafOutput, ModelDescription, NodeDescription, NodeId, TreeDescription};
use crate::transform::OutputTransform;

/// Single depth-1 regression tree on feature 0: `<= threshold` gives 0.0,
/// otherwise 1.0.
pub fn stump_model(threshold: f32) -> ModelDescription {
    ModelDescription {
        num_features: 1,
        num_classes: 1,
        leaf_kind: LeafKind::FloatUnaryBinary,
        transform: OutputTransform::IDENTITY,
        global_bias: 0.0,
        threshold: 0.5,
        trees: vec![crate::model_tree! {
            0 => num(0, threshold, L) -> 1, 2,
            1 => leaf(0.0),
            2 => leaf(1.0),
        }],
    }
}

/// Shape of a randomly generated forest.
#[derive(Debug, Clone)]
pub struct RandomForestParams {
    pub n_trees: usize,
    pub n_features: usize,
    pub max_depth: u32,
    pub leaf_kind: LeafKind,
    pub num_classes: usize,
    /// Probability that a node above `max_depth` becomes a leaf. The root
    /// always splits when `max_depth > 0`.
    pub leaf_probability: f64,
    pub transform: OutputTransform,
    pub seed: u64,
}

impl Default for RandomForestParams {
    fn default() -> Self {
        Self {
            n_trees: 20,
            n_features: 8,
            max_depth: 5,
            leaf_kind: LeafKind::FloatUnaryBinary,
            num_classes: 1,
            leaf_probability: 0.2,
            transform: OutputTransform::IDENTITY,
            seed: 42,
        }
    }
}

impl RandomForestParams {
    pub fn regression(n_trees: usize, n_features: usize, max_depth: u32) -> Self {
        Self {
            n_trees,
            n_features,
            max_depth,
            ..Self::default()
        }
    }

    /// Grove forest with one tree per class per round.
    pub fn multiclass(rounds: usize, num_classes: usize, n_features: usize, max_depth: u32) -> Self {
        Self {
            n_trees: rounds * num_classes,
            n_features,
            max_depth,
            leaf_kind: LeafKind::GrovePerClass,
            num_classes,
            transform: OutputTransform::averaged_softmax(),
            ..Self::default()
        }
    }

    /// Voting forest with class-id leaves.
    pub fn categorical(n_trees: usize, num_classes: usize, n_features: usize, max_depth: u32) -> Self {
        Self {
            n_trees,
            n_features,
            max_depth,
            leaf_kind: LeafKind::CategoricalLeaf,
            num_classes,
            ..Self::default()
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

/// Random model with thresholds in `[-1, 1]` and, for float leaves, leaf
/// values in `[-1, 1]`.
pub fn random_model(params: &RandomForestParams) -> ModelDescription {
    let mut rng = StdRng::seed_from_u64(params.seed);
    let trees = (0..params.n_trees)
        .map(|_| random_tree(&mut rng, params))
        .collect();
    ModelDescription {
        num_features: params.n_features,
        num_classes: params.num_classes,
        leaf_kind: params.leaf_kind,
        transform: params.transform,
        global_bias: 0.0,
        threshold: 0.5,
        trees,
    }
}

fn random_tree(rng: &mut StdRng, params: &RandomForestParams) -> TreeDescription {
    // Nodes are numbered in creation order; children get ids when their parent splits.
    let mut nodes = vec![NodeDescription::leaf(LeafOutput::Value(0.0))];
    let mut pending = vec![(0usize, 0u32)];

    while let Some((id, depth)) = pending.pop() {
        let split = depth < params.max_depth && (depth == 0 || !rng.gen_bool(params.leaf_probability));
        nodes[id] = if split {
            let left = nodes.len();
            nodes.push(NodeDescription::leaf(LeafOutput::Value(0.0)));
            nodes.push(NodeDescription::leaf(LeafOutput::Value(0.0)));
            pending.push((left, depth + 1));
            pending.push((left + 1, depth + 1));
            NodeDescription::split(
                rng.gen_range(0..params.n_features as u32),
                rng.gen_range(-1.0..=1.0),
                left as NodeId,
                (left + 1) as NodeId,
                rng.r#gen(),
            )
        } else {
            NodeDescription::leaf(random_leaf(rng, params))
        };
    }
    TreeDescription::new(nodes)
}

fn random_leaf(rng: &mut StdRng, params: &RandomForestParams) -> LeafOutput {
    match params.leaf_kind {
        LeafKind::CategoricalLeaf => LeafOutput::Class(rng.gen_range(0..params.num_classes as u32)),
        LeafKind::FloatUnaryBinary | LeafKind::GrovePerClass => LeafOutput::Value(rng.gen_range(-1.0..=1.0)),
    }
}
