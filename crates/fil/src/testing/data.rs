//! Synthetic input matrices.

use ndarray::Array2;
use rand::prelude::*;

/// Random row-major features, uniform in `[min, max]`.
pub fn random_dense_f32(rows: usize, cols: usize, seed: u64, min: f32, max: f32) -> Array2<f32> {
    assert!(max >= min);
    let mut rng = StdRng::seed_from_u64(seed);
    let width = max - min;
    Array2::from_shape_simple_fn((rows, cols), || min + rng.r#gen::<f32>() * width)
}

/// Replace roughly `fraction` of the entries with NaN.
pub fn inject_missing(features: &mut Array2<f32>, fraction: f64, seed: u64) {
    assert!((0.0..=1.0).contains(&fraction));
    let mut rng = StdRng::seed_from_u64(seed);
    for x in features.iter_mut() {
        if rng.gen_bool(fraction) {
            *x = f32::NAN;
        }
    }
}

/// Clustered features: each row is a uniformly jittered copy of one of
/// `centers` random centers. Returns the features and each row's center id.
pub fn synthetic_blobs(rows: usize, cols: usize, centers: usize, seed: u64) -> (Array2<f32>, Vec<usize>) {
    assert!(centers > 0);
    let mut rng = StdRng::seed_from_u64(seed);
    let means: Vec<Vec<f32>> = (0..centers)
        .map(|_| (0..cols).map(|_| rng.gen_range(-5.0..5.0)).collect())
        .collect();

    let labels: Vec<usize> = (0..rows).map(|_| rng.gen_range(0..centers)).collect();
    let mut features = Array2::zeros((rows, cols));
    for (mut row, &label) in features.rows_mut().into_iter().zip(&labels) {
        for (x, mean) in row.iter_mut().zip(&means[label]) {
            *x = mean + rng.gen_range(-0.5..0.5);
        }
    }
    (features, labels)
}
