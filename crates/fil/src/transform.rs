//! Output transforms applied when a row's accumulators are finalized.
//!
//! An [`OutputTransform`] is stored with the forest so that prediction never
//! needs to know how the trees were trained. It has two parts:
//!
//! - `average`: divide each accumulated margin by the number of trees that
//!   contributed to it, normalizing scale before the activation
//! - [`Activation`]: identity, elementwise sigmoid or per-row softmax

use serde::{Deserialize, Serialize};

/// Elementwise or per-row activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    /// Output equals the margin.
    #[default]
    Identity,
    /// Logistic sigmoid, `1 / (1 + exp(-margin))`.
    Sigmoid,
    /// Softmax across the classes of one row.
    Softmax,
}

impl Activation {
    /// Apply the activation to the margins of a single row.
    ///
    /// NaN and Inf inputs propagate without panicking.
    #[inline]
    pub fn apply_inplace(self, row: &mut [f32]) {
        match self {
            Activation::Identity => {}
            Activation::Sigmoid => {
                for x in row.iter_mut() {
                    *x = sigmoid(*x);
                }
            }
            Activation::Softmax => softmax_inplace(row),
        }
    }
}

/// How accumulated leaf values become final outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct OutputTransform {
    /// Divide margins by the number of contributing trees.
    #[serde(default)]
    pub average: bool,
    #[serde(default)]
    pub activation: Activation,
}

impl OutputTransform {
    pub const IDENTITY: Self = Self {
        average: false,
        activation: Activation::Identity,
    };

    /// Random-forest style: mean of the tree outputs.
    pub const fn averaged() -> Self {
        Self {
            average: true,
            activation: Activation::Identity,
        }
    }

    /// Gradient-boosted binary classifier.
    pub const fn sigmoid() -> Self {
        Self {
            average: false,
            activation: Activation::Sigmoid,
        }
    }

    /// Softmax over per-class margins, each averaged by its tree count first.
    pub const fn averaged_softmax() -> Self {
        Self {
            average: true,
            activation: Activation::Softmax,
        }
    }

    /// Scale a margin accumulated over `n_trees` trees.
    #[inline]
    pub fn scale(&self, margin: f32, n_trees: usize) -> f32 {
        if self.average {
            margin / n_trees.max(1) as f32
        } else {
            margin
        }
    }
}

/// Numerically stable sigmoid.
/// Clamps input to [-500, 500] to prevent overflow.
#[inline]
pub(crate) fn sigmoid(x: f32) -> f32 {
    let clamped = x.clamp(-500.0, 500.0);
    if clamped >= 0.0 {
        1.0 / (1.0 + (-clamped).exp())
    } else {
        let e = clamped.exp();
        e / (1.0 + e)
    }
}

/// Softmax in-place, shifted by the row max.
#[inline]
pub(crate) fn softmax_inplace(row: &mut [f32]) {
    if row.is_empty() {
        return;
    }

    let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);

    let mut sum = 0.0f32;
    for x in row.iter_mut() {
        *x = (*x - max).exp();
        sum += *x;
    }

    if sum > 0.0 {
        for x in row.iter_mut() {
            *x /= sum;
        }
    }
}
