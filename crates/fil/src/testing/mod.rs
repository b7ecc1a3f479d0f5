//! Test and benchmark tooling: synthetic inputs and forests.

mod data;
mod forests;

pub use data::{inject_missing, random_dense_f32, synthetic_blobs};
pub use forests::{RandomForestParams, random_model, stump_model};

/// Build a [`TreeDescription`](crate::repr::TreeDescription) from a node list.
///
/// ```
/// let tree = fil::model_tree! {
///     0 => num(0, 0.5, L) -> 1, 2,
///     1 => leaf(1.0),
///     2 => num(1, -0.25, R) -> 3, 4,
///     3 => leaf(2.0),
///     4 => leaf(3.0),
/// };
/// assert_eq!(tree.n_nodes(), 5);
/// assert_eq!(tree.depth(), 2);
/// ```
///
/// `num(feature, threshold, L|R)` is a split whose missing values go left or
/// right; `leaf(value)` and `class(id)` are float and class-id leaves.
#[macro_export]
macro_rules! model_tree {
    (@node num($feature:expr, $threshold:expr, L) -> $left:expr, $right:expr) => {
        $crate::repr::NodeDescription::split($feature, $threshold, $left, $right, true)
    };
    (@node num($feature:expr, $threshold:expr, R) -> $left:expr, $right:expr) => {
        $crate::repr::NodeDescription::split($feature, $threshold, $left, $right, false)
    };
    (@node leaf($value:expr)) => {
        $crate::repr::NodeDescription::leaf($crate::repr::LeafOutput::Value($value))
    };
    (@node class($class:expr)) => {
        $crate::repr::NodeDescription::leaf($crate::repr::LeafOutput::Class($class))
    };
    ($($id:literal => $kind:ident ( $($args:tt)* ) $(-> $left:expr, $right:expr)?),* $(,)?) => {
        $crate::repr::TreeDescription::from_indexed_nodes(vec![
            $(($id, $crate::model_tree!(@node $kind($($args)*) $(-> $left, $right)?))),*
        ])
    };
}
