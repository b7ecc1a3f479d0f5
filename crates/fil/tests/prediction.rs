//! End-to-end prediction tests.
//!
//! Covers the leaf algorithms against a host-side reference walk:
//! - split routing (`<=` left, NaN follows the default direction)
//! - storage and layout equivalence
//! - grove-per-class softmax normalization
//! - categorical voting and tie-breaking
//! - determinism across repeated launches

mod common;

use approx::{assert_abs_diff_eq, assert_relative_eq};
use ndarray::{Array2, array};
use rstest::rstest;

use common::{argmax, grove_margins, init_tracing, reference_predict, softmax};
use fil::config::StorageType;
use fil::repr::DenseLayout;
use fil::testing::{RandomForestParams, inject_missing, random_dense_f32, random_model, stump_model};
use fil::{
    Device, DeviceProperties, FilError, Forest, ForestConfig, LeafAlgo, LeafKind, LeafOutput, ModelDescription,
    OutputTransform, Parallelism, Predictor, StorageKind, model_tree,
};

fn storage_configs() -> Vec<(&'static str, ForestConfig)> {
    let config = |storage, dense_layout| {
        ForestConfig::builder()
            .storage(storage)
            .dense_layout(dense_layout)
            .build()
            .unwrap()
    };
    vec![
        ("dense/tree_major", config(StorageType::Dense, DenseLayout::TreeMajor)),
        ("dense/interleaved", config(StorageType::Dense, DenseLayout::Interleaved)),
        ("sparse16", config(StorageType::Sparse, DenseLayout::default())),
        ("sparse8", config(StorageType::Sparse8, DenseLayout::default())),
    ]
}

// =============================================================================
// Routing
// =============================================================================

#[rstest]
#[case(StorageType::Dense)]
#[case(StorageType::Sparse)]
#[case(StorageType::Sparse8)]
fn depth_one_stump(#[case] storage: StorageType) {
    init_tracing();
    let device = Device::default();
    let config = ForestConfig::builder().storage(storage).build().unwrap();
    let forest = Forest::from_model(&device, &stump_model(0.5), &config).unwrap();

    let preds = Predictor::new(&device)
        .predict(&forest, array![[0.3f32], [0.7], [0.5]].view(), false)
        .unwrap();
    // Equal to the threshold goes left.
    assert_eq!(preds, array![[0.0], [1.0], [0.0]]);
}

#[test]
fn missing_values_follow_default_direction() {
    let device = Device::default();
    let model = |default_left| ModelDescription {
        trees: vec![if default_left {
            model_tree! {
                0 => num(0, 0.5, L) -> 1, 2,
                1 => leaf(-1.0),
                2 => leaf(1.0),
            }
        } else {
            model_tree! {
                0 => num(0, 0.5, R) -> 1, 2,
                1 => leaf(-1.0),
                2 => leaf(1.0),
            }
        }],
        ..stump_model(0.5)
    };

    let predictor = Predictor::new(&device);
    let input = array![[f32::NAN], [0.0], [1.0]];
    for (default_left, expected) in [(true, -1.0), (false, 1.0)] {
        for (_, config) in storage_configs() {
            let forest = Forest::from_model(&device, &model(default_left), &config).unwrap();
            let preds = predictor.predict(&forest, input.view(), false).unwrap();
            assert_eq!(preds, array![[expected], [-1.0], [1.0]]);
        }
    }
}

#[test]
fn deeper_tree_routes_on_multiple_features() {
    let device = Device::default();
    let model = ModelDescription {
        num_features: 2,
        trees: vec![model_tree! {
            0 => num(0, 0.0, L) -> 1, 2,
            1 => num(1, 10.0, L) -> 3, 4,
            2 => leaf(3.0),
            3 => leaf(1.0),
            4 => leaf(2.0),
        }],
        ..stump_model(0.0)
    };
    let input = array![[-1.0f32, 5.0], [-1.0, 20.0], [1.0, 5.0], [0.0, 10.0]];
    for (name, config) in storage_configs() {
        let forest = Forest::from_model(&device, &model, &config).unwrap();
        let preds = Predictor::new(&device).predict(&forest, input.view(), false).unwrap();
        assert_eq!(preds, array![[1.0], [2.0], [3.0], [1.0]], "{name}");
    }
}

// =============================================================================
// Storage equivalence
// =============================================================================

#[rstest]
#[case::regression(RandomForestParams::regression(37, 6, 5))]
#[case::multiclass(RandomForestParams::multiclass(6, 4, 5, 4))]
#[case::categorical(RandomForestParams::categorical(25, 5, 7, 6))]
fn storages_agree(#[case] params: RandomForestParams) {
    init_tracing();
    let device = Device::default();
    let predictor = Predictor::new(&device);
    let model = random_model(&params);

    let mut input = random_dense_f32(300, params.n_features, 7, -1.5, 1.5);
    inject_missing(&mut input, 0.1, 11);

    let proba_modes: &[bool] = if params.num_classes >= 2 { &[false, true] } else { &[false] };
    for &proba in proba_modes {
        let mut outputs = Vec::new();
        for (name, config) in storage_configs() {
            let forest = Forest::from_model(&device, &model, &config).unwrap();
            let preds = predictor.predict(&forest, input.view(), proba).unwrap();
            outputs.push((name, preds));
        }
        let (_, baseline) = &outputs[0];
        for (name, preds) in &outputs[1..] {
            assert_eq!(preds, baseline, "{name} diverges (proba={proba})");
        }
    }
}

#[rstest]
#[case::regression(RandomForestParams::regression(50, 8, 6))]
#[case::averaged(RandomForestParams { transform: OutputTransform::averaged(), ..RandomForestParams::regression(20, 3, 3) })]
#[case::few_classes(RandomForestParams::multiclass(5, 3, 6, 4))]
#[case::categorical(RandomForestParams::categorical(40, 4, 6, 5))]
fn matches_host_reference(#[case] params: RandomForestParams, #[values(false, true)] proba: bool) {
    let device = Device::default();
    let forest = Forest::from_model(&device, &random_model(&params), &ForestConfig::default()).unwrap();
    let input = random_dense_f32(257, params.n_features, 3, -1.0, 1.0);

    let result = Predictor::new(&device).predict(&forest, input.view(), proba);
    if proba && params.num_classes < 2 {
        assert!(matches!(result, Err(FilError::ProbaNotSupported { num_classes: 1 })));
        return;
    }
    let preds = result.unwrap();
    let expected = reference_predict(&forest, input.view(), proba);
    assert_eq!(preds.dim(), expected.dim());

    if params.leaf_kind == LeafKind::GrovePerClass && !proba {
        // Class decisions can only differ where two margins are within rounding.
        let mismatches = preds.iter().zip(expected.iter()).filter(|(a, b)| a != b).count();
        assert!(mismatches <= 1, "{mismatches} class decisions differ");
    } else {
        assert_abs_diff_eq!(preds, expected, epsilon = 1e-4);
    }
}

/// Forests wider than a block, so each logical thread walks several trees.
#[rstest]
#[case::regression(RandomForestParams::regression(600, 6, 4), LeafAlgo::UnaryBinary)]
#[case::binary(
    RandomForestParams { num_classes: 2, transform: OutputTransform::sigmoid(), ..RandomForestParams::regression(600, 6, 4) },
    LeafAlgo::UnaryBinary
)]
#[case::few_classes(RandomForestParams::multiclass(200, 3, 6, 4), LeafAlgo::GroveFewClasses)]
#[case::categorical(RandomForestParams::categorical(700, 4, 6, 4), LeafAlgo::Categorical)]
fn many_trees_per_thread_match_host_reference(
    #[case] params: RandomForestParams,
    #[case] algo: LeafAlgo,
    #[values(false, true)] proba: bool,
) {
    init_tracing();
    let device = Device::default();
    let predictor = Predictor::new(&device);
    let forest = Forest::from_model(&device, &random_model(&params), &ForestConfig::default()).unwrap();
    let mut input = random_dense_f32(130, params.n_features, 8, -1.0, 1.0);
    inject_missing(&mut input, 0.05, 2);

    if proba && params.num_classes < 2 {
        assert!(predictor.predict(&forest, input.view(), true).is_err());
        return;
    }

    let plan = predictor.plan(&forest, params.n_features, 130, proba).unwrap();
    assert_eq!(plan.shape.algo, algo);
    assert!(forest.meta().n_trees > 2 * plan.shape.block_threads);

    let preds = predictor.predict(&forest, input.view(), proba).unwrap();
    let expected = reference_predict(&forest, input.view(), proba);
    assert_eq!(preds.dim(), expected.dim());

    let decides_class = !proba && params.num_classes >= 2;
    if decides_class && params.leaf_kind != LeafKind::CategoricalLeaf {
        // Summation order differs from the host walk; allow one margin flip.
        let mismatches = preds.iter().zip(expected.iter()).filter(|(a, b)| a != b).count();
        assert!(mismatches <= 1, "{mismatches} class decisions differ");
    } else {
        // Vote counts are exact; float sums over hundreds of trees are not.
        assert_relative_eq!(preds, expected, epsilon = 1e-3, max_relative = 1e-4);
    }
}

// =============================================================================
// Grove per class
// =============================================================================

#[test]
fn grove_softmax_matches_hand_computation() {
    let device = Device::default();
    let tree = |v: f32| model_tree! {
        0 => num(0, 0.0, L) -> 1, 2,
        1 => leaf(-v),
        2 => leaf(v),
    };
    // 7 trees over 3 classes: class 0 gets trees {0, 3, 6}, 1 gets {1, 4}, 2 gets {2, 5}.
    let values = [1.0f32, 2.0, 0.5, 3.0, -1.0, 0.25, 2.0];
    let model = ModelDescription {
        num_features: 1,
        num_classes: 3,
        leaf_kind: LeafKind::GrovePerClass,
        transform: OutputTransform::averaged_softmax(),
        global_bias: 0.0,
        threshold: 0.5,
        trees: values.iter().map(|&v| tree(v)).collect(),
    };
    let forest = Forest::from_model(&device, &model, &ForestConfig::default()).unwrap();

    let proba = Predictor::new(&device)
        .predict_proba(&forest, array![[1.0f32], [-1.0]].view())
        .unwrap();

    let right: [f32; 3] = [(1.0 + 3.0 + 2.0) / 3.0, (2.0 - 1.0) / 2.0, (0.5 + 0.25) / 2.0];
    let left = right.map(|m| -m);
    assert_abs_diff_eq!(proba.row(0).as_slice().unwrap(), softmax(&right).as_slice(), epsilon = 1e-6);
    assert_abs_diff_eq!(proba.row(1).as_slice().unwrap(), softmax(&left).as_slice(), epsilon = 1e-6);
    for row in proba.rows() {
        assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-6);
    }

    let classes = Predictor::new(&device)
        .predict(&forest, array![[1.0f32], [-1.0]].view(), false)
        .unwrap();
    assert_eq!(classes, array![[0.0f32], [2.0]]);
}

#[test]
fn grove_with_many_classes() {
    let device = Device::default();
    let params = RandomForestParams::multiclass(2, 300, 4, 3);
    let forest = Forest::from_model(&device, &random_model(&params), &ForestConfig::default()).unwrap();
    let input = random_dense_f32(40, 4, 5, -1.0, 1.0);
    let predictor = Predictor::new(&device);

    let plan = predictor.plan(&forest, 4, 40, true).unwrap();
    assert_eq!(plan.shape.algo, fil::LeafAlgo::GroveManyClasses);

    let proba = predictor.predict_proba(&forest, input.view()).unwrap();
    assert_eq!(proba.dim(), (40, 300));
    for (row, input_row) in proba.rows().into_iter().zip(input.rows()) {
        let expected = softmax(&grove_margins(&forest, input_row.as_slice().unwrap()));
        assert_abs_diff_eq!(row.as_slice().unwrap(), expected.as_slice(), epsilon = 1e-5);
    }

    let classes = predictor.predict(&forest, input.view(), false).unwrap();
    for (class, row) in classes.iter().zip(proba.rows()) {
        let best = argmax(row.as_slice().unwrap());
        assert_abs_diff_eq!(row[*class as usize], row[best], epsilon = 1e-6);
    }
}

// =============================================================================
// Categorical voting
// =============================================================================

fn vote_model(trees: Vec<fil::TreeDescription>) -> ModelDescription {
    ModelDescription {
        num_features: 1,
        num_classes: 3,
        leaf_kind: LeafKind::CategoricalLeaf,
        transform: OutputTransform::IDENTITY,
        global_bias: 0.0,
        threshold: 0.5,
        trees,
    }
}

#[test]
fn categorical_majority_vote() {
    let device = Device::default();
    let model = vote_model(vec![
        model_tree! { 0 => num(0, 0.5, L) -> 1, 2, 1 => class(0), 2 => class(1) },
        model_tree! { 0 => num(0, 0.5, L) -> 1, 2, 1 => class(1), 2 => class(1) },
        model_tree! { 0 => num(0, 0.5, L) -> 1, 2, 1 => class(0), 2 => class(2) },
    ]);
    let forest = Forest::from_model(&device, &model, &ForestConfig::default()).unwrap();
    assert_eq!(
        forest.leaf_outputs(&[0.3]),
        vec![LeafOutput::Class(0), LeafOutput::Class(1), LeafOutput::Class(0)]
    );

    let predictor = Predictor::new(&device);
    let input = array![[0.3f32], [0.7]];
    let classes = predictor.predict(&forest, input.view(), false).unwrap();
    assert_eq!(classes, array![[0.0], [1.0]]);

    let proba = predictor.predict_proba(&forest, input.view()).unwrap();
    let third = 1.0f32 / 3.0;
    assert_abs_diff_eq!(proba, array![[2.0 * third, third, 0.0], [0.0, 2.0 * third, third]], epsilon = 1e-6);
}

#[test]
fn categorical_ties_go_to_lowest_class() {
    let device = Device::default();
    let model = vote_model(vec![
        model_tree! { 0 => num(0, 0.5, L) -> 1, 2, 1 => class(2), 2 => class(0) },
        model_tree! { 0 => num(0, 0.5, L) -> 1, 2, 1 => class(1), 2 => class(2) },
    ]);
    let forest = Forest::from_model(&device, &model, &ForestConfig::default()).unwrap();
    let classes = Predictor::new(&device)
        .predict(&forest, array![[0.3f32], [0.7]].view(), false)
        .unwrap();
    assert_eq!(classes, array![[1.0], [0.0]]);
}

// =============================================================================
// Unary binary classification
// =============================================================================

fn binary_stump() -> ModelDescription {
    ModelDescription {
        num_classes: 2,
        transform: OutputTransform::sigmoid(),
        trees: vec![model_tree! {
            0 => num(0, 0.5, L) -> 1, 2,
            1 => leaf(-2.0),
            2 => leaf(2.0),
        }],
        ..stump_model(0.5)
    }
}

#[test]
fn binary_classifier_thresholds_sigmoid() {
    let device = Device::default();
    let forest = Forest::from_model(&device, &binary_stump(), &ForestConfig::default()).unwrap();
    let predictor = Predictor::new(&device);
    let input = array![[0.3f32], [0.7]];

    let classes = predictor.predict(&forest, input.view(), false).unwrap();
    assert_eq!(classes, array![[0.0], [1.0]]);

    let p = 1.0 / (1.0 + (-2.0f32).exp());
    let proba = predictor.predict_proba(&forest, input.view()).unwrap();
    assert_abs_diff_eq!(proba, array![[p, 1.0 - p], [1.0 - p, p]], epsilon = 1e-6);
}

#[test]
fn config_overrides_threshold_and_bias() {
    let device = Device::default();
    let predictor = Predictor::new(&device);
    let input = array![[0.3f32], [0.7]];

    let strict = ForestConfig::builder().threshold(0.95).build().unwrap();
    let forest = Forest::from_model(&device, &binary_stump(), &strict).unwrap();
    assert_eq!(predictor.predict(&forest, input.view(), false).unwrap(), array![[0.0], [0.0]]);

    let biased = ForestConfig::builder().global_bias(10.0).build().unwrap();
    let forest = Forest::from_model(&device, &stump_model(0.5), &biased).unwrap();
    assert_eq!(predictor.predict(&forest, input.view(), false).unwrap(), array![[10.0], [11.0]]);
}

// =============================================================================
// Determinism and launch shapes
// =============================================================================

#[test]
fn repeated_predictions_are_bit_identical() {
    let device = Device::new(DeviceProperties::default().with_sm_count(3));
    let model = random_model(&RandomForestParams::multiclass(8, 5, 10, 6).with_seed(9));
    let config = ForestConfig::builder().blocks_per_sm(2).build().unwrap();
    let forest = Forest::from_model(&device, &model, &config).unwrap();
    let predictor = Predictor::new(&device);
    let input = random_dense_f32(1000, 10, 1, -1.0, 1.0);

    let first = predictor.predict_proba(&forest, input.view()).unwrap();
    for _ in 0..3 {
        let again = predictor.predict_proba(&forest, input.view()).unwrap();
        assert_eq!(
            first.iter().map(|v| v.to_bits()).collect::<Vec<_>>(),
            again.iter().map(|v| v.to_bits()).collect::<Vec<_>>()
        );
    }
}

#[test]
fn sequential_and_parallel_devices_agree() {
    let model = random_model(&RandomForestParams::regression(64, 12, 7));
    let input = random_dense_f32(513, 12, 2, -1.0, 1.0);
    let run = |parallelism| {
        let device = Device::with_parallelism(DeviceProperties::default(), parallelism);
        let forest = Forest::from_model(&device, &model, &ForestConfig::default()).unwrap();
        Predictor::new(&device).predict(&forest, input.view(), false).unwrap()
    };
    assert_eq!(run(Parallelism::Sequential), run(Parallelism::Parallel));
}

#[rstest]
fn launch_choices_do_not_change_results(
    #[values(1, 2, 3, 4)] max_n_items: usize,
    #[values(true, false)] column_cache: bool,
    #[values(0, 1)] blocks_per_sm: usize,
) {
    let device = Device::default();
    let model = random_model(&RandomForestParams::multiclass(4, 3, 9, 5));
    let input = random_dense_f32(150, 9, 4, -1.0, 1.0);
    let predictor = Predictor::new(&device);

    let baseline = Forest::from_model(&device, &model, &ForestConfig::default()).unwrap();
    let expected = predictor.predict_proba(&baseline, input.view()).unwrap();

    let config = ForestConfig::builder()
        .max_n_items(max_n_items)
        .column_cache(column_cache)
        .blocks_per_sm(blocks_per_sm)
        .build()
        .unwrap();
    let forest = Forest::from_model(&device, &model, &config).unwrap();
    let plan = predictor.plan(&forest, 9, 150, true).unwrap();
    assert_eq!(plan.shape.n_items, max_n_items);
    assert_eq!(plan.shape.cols_in_shmem, column_cache);

    let preds = predictor.predict_proba(&forest, input.view()).unwrap();
    assert_abs_diff_eq!(preds, expected, epsilon = 1e-6);
}

#[test]
fn auto_storage_picks_by_shape() {
    let device = Device::default();
    let shallow = random_model(&RandomForestParams {
        leaf_probability: 0.0,
        ..RandomForestParams::regression(4, 3, 4)
    });
    let forest = Forest::from_model(&device, &shallow, &ForestConfig::default()).unwrap();
    assert_eq!(forest.storage_kind(), StorageKind::Dense);

    let deep = random_model(&RandomForestParams {
        leaf_probability: 0.0,
        ..RandomForestParams::regression(4, 3, 11)
    });
    let forest = Forest::from_model(&device, &deep, &ForestConfig::default()).unwrap();
    assert_eq!(forest.storage_kind(), StorageKind::Sparse16);
}

#[test]
fn release_frees_device_memory() {
    let device = Device::default();
    let predictor = Predictor::new(&device);
    let forest = Forest::from_model(&device, &stump_model(0.5), &ForestConfig::default()).unwrap();
    predictor.predict(&forest, Array2::zeros((2, 1)).view(), false).unwrap();

    let held = device.allocated_bytes();
    assert!(held > 0);
    assert_eq!(predictor.release(forest), held);
    assert_eq!(device.allocated_bytes(), 0);
    assert!(predictor.plan_cache().is_empty());
}

#[test]
fn releasing_forest_directly_keeps_plans_apart() {
    let device = Device::default();
    let predictor = Predictor::new(&device);
    let input = array![[0.3f32], [0.7]];

    let first = Forest::from_model(&device, &stump_model(0.5), &ForestConfig::default()).unwrap();
    predictor.predict(&first, input.view(), false).unwrap();
    let stale = first.id();
    first.release();
    assert_eq!(predictor.plan_cache().len(), 1);

    let model = ModelDescription {
        trees: vec![model_tree! {
            0 => num(0, 0.5, L) -> 1, 2,
            1 => leaf(5.0),
            2 => leaf(6.0),
        }],
        ..stump_model(0.5)
    };
    let second = Forest::from_model(&device, &model, &ForestConfig::default()).unwrap();
    assert_ne!(second.id(), stale);
    assert_eq!(predictor.predict(&second, input.view(), false).unwrap(), array![[5.0], [6.0]]);
    assert_eq!(predictor.plan_cache().len(), 2);

    predictor.release(second);
    assert_eq!(predictor.plan_cache().len(), 1);
}
