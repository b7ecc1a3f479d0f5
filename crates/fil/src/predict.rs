//! Batch prediction.
//!
//! [`Predictor`] validates the input contract, resolves an execution plan
//! (through its [`PlanCache`]) and dispatches the matching kernel variant.
//!
//! # Example
//!
//! ```
//! use fil::testing::stump_model;
//! use fil::{Device, Forest, ForestConfig, Predictor};
//! use ndarray::array;
//!
//! let device = Device::default();
//! let forest = Forest::from_model(&device, &stump_model(0.5), &ForestConfig::default()).unwrap();
//! let predictor = Predictor::new(&device);
//!
//! let preds = predictor.predict(&forest, array![[0.3f32], [0.5], [0.7]].view(), false).unwrap();
//! assert_eq!(preds.column(0).to_vec(), vec![0.0, 0.0, 1.0]);
//! ```

use std::sync::{Arc, mpsc};

use ndarray::{Array2, ArrayView2, ArrayViewMut2};

use crate::device::{Device, PendingPrediction, Stream};
use crate::dispatch::dispatch;
use crate::kernel::LaunchArgs;
use crate::plan::{ExecutionPlan, PlanBuilder, PlanCache};
use crate::{FilError, Forest, Result};

/// Runs predictions for forests on one device.
///
/// Cheap to clone; clones share the plan cache.
#[derive(Debug, Clone)]
pub struct Predictor {
    device: Device,
    plans: Arc<PlanCache>,
}

impl Predictor {
    pub fn new(device: &Device) -> Self {
        Self {
            device: device.clone(),
            plans: Arc::new(PlanCache::new()),
        }
    }

    #[inline]
    pub fn device(&self) -> &Device {
        &self.device
    }

    #[inline]
    pub fn plan_cache(&self) -> &PlanCache {
        &self.plans
    }

    /// Resolve the execution plan a batch would run with.
    pub fn plan(&self, forest: &Forest, columns: usize, rows: usize, predict_proba: bool) -> Result<ExecutionPlan> {
        let builder = PlanBuilder::new(*self.device.properties(), forest.plan_options());
        let shape = self.plans.launch_shape(&builder, forest, columns, predict_proba)?;
        Ok(builder.complete(shape, rows))
    }

    /// Predict a row-major batch.
    ///
    /// The output has one column per row (value or class id), or one column per
    /// class when `predict_proba` is set (two for binary unary forests).
    ///
    /// # Errors
    ///
    /// - [`FilError::ColumnMajorInput`] / [`FilError::NonContiguousInput`] for
    ///   inputs that are not row-major contiguous
    /// - [`FilError::FeatureCountMismatch`] if the column count differs from
    ///   the forest's feature count
    /// - [`FilError::ProbaNotSupported`] and [`FilError::SharedMemoryExceeded`]
    ///   from plan resolution
    ///
    /// All of these are raised before any kernel is launched.
    pub fn predict(&self, forest: &Forest, input: ArrayView2<f32>, predict_proba: bool) -> Result<Array2<f32>> {
        let data = row_major(&input)?;
        let (rows, columns) = input.dim();
        let plan = self.checked_plan(forest, columns, rows, predict_proba)?;
        let mut output = Array2::zeros((rows, plan.shape.n_outputs));
        if let Some(out) = output.as_slice_mut() {
            self.run(forest, &plan, data, out);
        }
        Ok(output)
    }

    /// Class probabilities; shorthand for `predict(forest, input, true)`.
    pub fn predict_proba(&self, forest: &Forest, input: ArrayView2<f32>) -> Result<Array2<f32>> {
        self.predict(forest, input, true)
    }

    /// Predict into a caller-provided buffer of shape `rows x n_outputs`.
    pub fn predict_into(
        &self,
        forest: &Forest,
        input: ArrayView2<f32>,
        predict_proba: bool,
        mut output: ArrayViewMut2<f32>,
    ) -> Result<()> {
        let data = row_major(&input)?;
        let (rows, columns) = input.dim();
        let plan = self.checked_plan(forest, columns, rows, predict_proba)?;
        let expected = (rows, plan.shape.n_outputs);
        if output.dim() != expected {
            return Err(FilError::OutputShapeMismatch {
                expected,
                actual: output.dim(),
            });
        }

        match output.as_slice_mut() {
            Some(out) => self.run(forest, &plan, data, out),
            None => {
                let mut staging = Array2::zeros(expected);
                if let Some(out) = staging.as_slice_mut() {
                    self.run(forest, &plan, data, out);
                }
                output.assign(&staging);
            }
        }
        Ok(())
    }

    /// Enqueue a prediction on `stream`.
    ///
    /// The input contract and the plan are checked before enqueueing, so those
    /// errors are returned here; the returned handle yields the output once the
    /// stream reaches the job. `stream` must belong to this predictor's device.
    pub fn predict_async(
        &self,
        stream: &Stream,
        forest: Arc<Forest>,
        input: Array2<f32>,
        predict_proba: bool,
    ) -> Result<PendingPrediction> {
        if !stream.device().same_device(&self.device) {
            return Err(FilError::StreamDeviceMismatch(stream.id()));
        }
        row_major(&input.view())?;
        let (rows, columns) = input.dim();
        self.checked_plan(&forest, columns, rows, predict_proba)?;

        let (sender, receiver) = mpsc::sync_channel(1);
        let predictor = self.clone();
        stream.enqueue(move || {
            let result = predictor.predict(&forest, input.view(), predict_proba);
            // The caller may have dropped the handle.
            let _ = sender.send(result);
        })?;
        Ok(PendingPrediction::new(stream.id(), receiver))
    }

    /// Release a forest and forget its cached plans.
    pub fn release(&self, forest: Forest) -> usize {
        self.plans.evict(forest.id());
        forest.release()
    }

    fn checked_plan(&self, forest: &Forest, columns: usize, rows: usize, predict_proba: bool) -> Result<ExecutionPlan> {
        if columns != forest.n_features() {
            return Err(FilError::FeatureCountMismatch {
                expected: forest.n_features(),
                actual: columns,
            });
        }
        self.plan(forest, columns, rows, predict_proba)
    }

    fn run(&self, forest: &Forest, plan: &ExecutionPlan, input: &[f32], output: &mut [f32]) {
        if plan.rows == 0 {
            return;
        }
        dispatch(LaunchArgs {
            device: &self.device,
            forest,
            plan,
            input,
            output,
        });
    }
}

/// Borrow a row-major contiguous matrix as a flat slice.
fn row_major<'a>(input: &'a ArrayView2<'_, f32>) -> Result<&'a [f32]> {
    if let Some(data) = input.as_slice() {
        return Ok(data);
    }
    let (rows, cols) = input.dim();
    if input.t().as_slice().is_some() {
        Err(FilError::ColumnMajorInput { rows, cols })
    } else {
        Err(FilError::NonContiguousInput {
            strides: input.strides().to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ForestConfig;
    use crate::testing::stump_model;
    use ndarray::{Array2, ShapeBuilder, array, s};

    fn setup() -> (Device, Forest, Predictor) {
        let device = Device::default();
        let forest = Forest::from_model(&device, &stump_model(0.5), &ForestConfig::default()).unwrap();
        let predictor = Predictor::new(&device);
        (device, forest, predictor)
    }

    #[test]
    fn rejects_column_major_without_launch() {
        let (device, forest, predictor) = setup();
        let input = Array2::<f32>::zeros((4, 1).f());
        // A single column is contiguous in both orders.
        assert!(predictor.predict(&forest, input.view(), false).is_ok());
        let launches = device.launch_count();

        let wide = Array2::<f32>::zeros((4, 2).f());
        let err = predictor.predict(&forest, wide.view(), false).unwrap_err();
        assert!(matches!(err, FilError::ColumnMajorInput { rows: 4, cols: 2 }));
        assert_eq!(device.launch_count(), launches);
    }

    #[test]
    fn rejects_strided_input() {
        let (_, forest, predictor) = setup();
        let base = Array2::<f32>::zeros((8, 2));
        let strided = base.slice(s![..;2, ..1]);
        let err = predictor.predict(&forest, strided, false).unwrap_err();
        assert!(matches!(err, FilError::NonContiguousInput { .. }));
    }

    #[test]
    fn rejects_feature_count_mismatch() {
        let (device, forest, predictor) = setup();
        let err = predictor
            .predict(&forest, Array2::zeros((2, 3)).view(), false)
            .unwrap_err();
        assert!(matches!(
            err,
            FilError::FeatureCountMismatch {
                expected: 1,
                actual: 3
            }
        ));
        assert_eq!(device.launch_count(), 0);
    }

    #[test]
    fn empty_batch_issues_no_launch() {
        let (device, forest, predictor) = setup();
        let preds = predictor
            .predict(&forest, Array2::zeros((0, 1)).view(), false)
            .unwrap();
        assert_eq!(preds.dim(), (0, 1));
        assert_eq!(device.launch_count(), 0);
    }

    #[test]
    fn predict_into_checks_shape_and_fills_strided_output() {
        let (_, forest, predictor) = setup();
        let input = array![[0.3f32], [0.7]];

        let mut wrong = Array2::<f32>::zeros((3, 1));
        let err = predictor
            .predict_into(&forest, input.view(), false, wrong.view_mut())
            .unwrap_err();
        assert!(matches!(err, FilError::OutputShapeMismatch { .. }));

        let mut wide = Array2::<f32>::from_elem((2, 2), -1.0);
        predictor
            .predict_into(&forest, input.view(), false, wide.slice_mut(s![.., 1..]))
            .unwrap();
        assert_eq!(wide, array![[-1.0, 0.0], [-1.0, 1.0]]);
    }

    #[test]
    fn plans_are_cached_per_forest() {
        let (_, forest, predictor) = setup();
        let input = array![[0.1f32]];
        predictor.predict(&forest, input.view(), false).unwrap();
        predictor.predict(&forest, input.view(), false).unwrap();
        assert_eq!(predictor.plan_cache().len(), 1);

        predictor.release(forest);
        assert!(predictor.plan_cache().is_empty());
    }
}
