//! Evaluation of masked inputs with the embedding model.

use std::ops::Range;

use distex_core::{EmbeddingModel, InputLayout};
use ndarray::{Array2, ArrayD, ArrayView2, Axis, IxDyn, Zip};
use tracing::debug;

use crate::error::{ExplainError, Result};
use crate::masks::MaskSet;
use crate::progress::{CancellationToken, ProgressSender};

/// Why an evaluation stopped before all masks were processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The configured mask limit was reached.
    MaskLimit,
    /// The cancellation token was set.
    Cancelled,
}

/// Embeddings of the evaluated masks.
#[derive(Debug, Clone)]
pub struct Evaluation {
    /// One embedding per evaluated mask, in mask order.
    pub embeddings: Array2<f32>,
    /// Number of masks evaluated (a prefix of the mask set).
    pub masks_processed: usize,
    /// Set when the evaluation stopped early.
    pub stopped: Option<StopReason>,
}

/// Applies masks to an input and runs the model over batches of the results.
///
/// A perturbed sample is `input * mask + baseline * (1 - mask)`, with the
/// mask broadcast across the channel axis. Batches are independent of each
/// other; they are evaluated in order and their embeddings concatenated.
pub struct PerturbationEvaluator<'a> {
    layout: &'a InputLayout,
    batch_size: usize,
    expected_dim: Option<usize>,
    mask_limit: Option<usize>,
    progress: Option<&'a ProgressSender>,
    cancellation: Option<&'a CancellationToken>,
}

impl<'a> PerturbationEvaluator<'a> {
    /// Create an evaluator for inputs of `layout`.
    pub fn new(layout: &'a InputLayout, batch_size: usize) -> Self {
        Self {
            layout,
            batch_size,
            expected_dim: None,
            mask_limit: None,
            progress: None,
            cancellation: None,
        }
    }

    /// Require embeddings of this dimensionality.
    #[must_use]
    pub fn with_expected_dim(mut self, dim: Option<usize>) -> Self {
        self.expected_dim = dim;
        self
    }

    /// Evaluate at most `limit` masks. The batch that reaches the limit is cut short.
    #[must_use]
    pub fn with_mask_limit(mut self, limit: Option<usize>) -> Self {
        self.mask_limit = limit;
        self
    }

    /// Report progress after every batch.
    #[must_use]
    pub fn with_progress(mut self, progress: Option<&'a ProgressSender>) -> Self {
        self.progress = progress;
        self
    }

    /// Check this token between batches.
    #[must_use]
    pub fn with_cancellation(mut self, token: Option<&'a CancellationToken>) -> Self {
        self.cancellation = token;
        self
    }

    /// Mask index ranges of the batches for `num_masks` masks.
    pub fn batches(&self, num_masks: usize) -> impl Iterator<Item = Range<usize>> {
        let batch_size = self.batch_size.max(1);
        (0..num_masks)
            .step_by(batch_size)
            .map(move |start| start..(start + batch_size).min(num_masks))
    }

    /// Build the perturbed samples for the masks in `range`.
    ///
    /// The result has a leading batch axis followed by the input axes.
    pub fn perturb_batch(
        &self,
        input: &ArrayD<f32>,
        baseline: &ArrayD<f32>,
        masks: &MaskSet,
        range: Range<usize>,
    ) -> ArrayD<f32> {
        let mut batch = ArrayD::<f32>::zeros(IxDyn(&self.layout.batch_shape(range.len())));
        for (mut sample, index) in batch.axis_iter_mut(Axis(0)).zip(range) {
            let mask = masks.mask(index);
            let mask = match self.layout.channel_axis() {
                Some(axis) => mask.insert_axis(Axis(axis)),
                None => mask,
            };
            Zip::from(&mut sample)
                .and(input)
                .and(baseline)
                .and_broadcast(&mask)
                .for_each(|out, &x, &b, &m| *out = x * m + b * (1.0 - m));
        }
        batch
    }

    /// Evaluate the model on every mask, or on a prefix when stopped early.
    ///
    /// # Errors
    ///
    /// - [`ExplainError::Configuration`] if the input, baseline or masks do not
    ///   match the layout, or the batch size is zero.
    /// - [`ExplainError::ModelOutput`] if the model returns the wrong number of
    ///   embeddings, non-finite values, or an inconsistent dimensionality.
    /// - [`ExplainError::Model`] if the model call fails.
    pub fn evaluate<M: EmbeddingModel + ?Sized>(
        &self,
        model: &mut M,
        input: &ArrayD<f32>,
        baseline: &ArrayD<f32>,
        masks: &MaskSet,
    ) -> Result<Evaluation> {
        self.check_inputs(input, baseline, masks)?;

        let total = masks.len();
        let mut dim = self.expected_dim;
        let mut outputs: Vec<Array2<f32>> = Vec::new();
        let mut processed = 0;
        let mut stopped = None;

        let planned = self.mask_limit.map_or(total, |limit| limit.min(total));

        for range in self.batches(planned) {
            if self.cancellation.is_some_and(CancellationToken::is_cancelled) {
                stopped = Some(StopReason::Cancelled);
                break;
            }

            let end = range.end;
            let embeddings = self.evaluate_batch(model, input, baseline, masks, range, &mut dim)?;
            outputs.push(embeddings);
            processed = end;

            debug!("Evaluated {}/{} masks", processed, total);
            if let Some(progress) = self.progress {
                progress.notify(processed, total);
            }
        }
        if stopped.is_none() && processed < total {
            stopped = Some(StopReason::MaskLimit);
        }

        let embeddings = if outputs.is_empty() {
            Array2::zeros((0, dim.unwrap_or(0)))
        } else {
            let views: Vec<ArrayView2<'_, f32>> = outputs.iter().map(|e| e.view()).collect();
            ndarray::concatenate(Axis(0), &views).map_err(|e| {
                ExplainError::ModelOutput(format!("Failed to concatenate embeddings: {e}"))
            })?
        };

        Ok(Evaluation {
            embeddings,
            masks_processed: processed,
            stopped,
        })
    }

    fn check_inputs(
        &self,
        input: &ArrayD<f32>,
        baseline: &ArrayD<f32>,
        masks: &MaskSet,
    ) -> Result<()> {
        if self.batch_size == 0 {
            return Err(ExplainError::Configuration(
                "batch_size must be positive".to_string(),
            ));
        }
        self.layout
            .check(input.shape())
            .map_err(|e| ExplainError::Configuration(format!("input: {e}")))?;
        self.layout
            .check(baseline.shape())
            .map_err(|e| ExplainError::Configuration(format!("baseline: {e}")))?;
        if masks.spatial_shape() != self.layout.spatial_shape().as_slice() {
            return Err(ExplainError::Configuration(format!(
                "mask spatial shape {:?} does not match input spatial shape {:?}",
                masks.spatial_shape(),
                self.layout.spatial_shape()
            )));
        }
        Ok(())
    }

    fn evaluate_batch<M: EmbeddingModel + ?Sized>(
        &self,
        model: &mut M,
        input: &ArrayD<f32>,
        baseline: &ArrayD<f32>,
        masks: &MaskSet,
        range: Range<usize>,
        dim: &mut Option<usize>,
    ) -> Result<Array2<f32>> {
        let start = range.start;
        let batch_len = range.len();
        let batch = self.perturb_batch(input, baseline, masks, range);
        let embeddings = model.embed(&batch)?;

        if embeddings.nrows() != batch_len {
            return Err(ExplainError::ModelOutput(format!(
                "model returned {} embeddings for a batch of {batch_len} samples",
                embeddings.nrows()
            )));
        }
        if embeddings.ncols() == 0 {
            return Err(ExplainError::ModelOutput(
                "model returned empty embeddings".to_string(),
            ));
        }
        match *dim {
            Some(expected) if expected != embeddings.ncols() => {
                return Err(ExplainError::ModelOutput(format!(
                    "expected embeddings of dimensionality {expected}, got {}",
                    embeddings.ncols()
                )));
            }
            Some(_) => {}
            None => *dim = Some(embeddings.ncols()),
        }
        if let Some((row, _)) = embeddings
            .outer_iter()
            .enumerate()
            .find(|(_, e)| e.iter().any(|v| !v.is_finite()))
        {
            return Err(ExplainError::ModelOutput(format!(
                "embedding of mask {} contains non-finite values",
                start + row
            )));
        }

        Ok(embeddings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use distex_core::{AxisRoles, CoreError};

    use crate::progress::progress_channel;

    /// Embeds every sample as `[sum, calls]` and records batch sizes.
    struct RecordingModel {
        batch_sizes: Vec<usize>,
    }

    impl EmbeddingModel for RecordingModel {
        fn embed(&mut self, batch: &ArrayD<f32>) -> distex_core::Result<Array2<f32>> {
            let n = batch.shape()[0];
            self.batch_sizes.push(n);
            let calls = self.batch_sizes.len() as f32;
            let mut out = Array2::zeros((n, 2));
            for (i, sample) in batch.axis_iter(Axis(0)).enumerate() {
                out[[i, 0]] = sample.sum();
                out[[i, 1]] = calls;
            }
            Ok(out)
        }
    }

    fn ramp_masks(n: usize, shape: &[usize]) -> MaskSet {
        let mut dims = vec![n];
        dims.extend_from_slice(shape);
        let masks = ArrayD::from_shape_fn(IxDyn(&dims), |idx| idx[0] as f32 / n as f32);
        MaskSet::new(masks).unwrap()
    }

    #[test]
    fn test_perturb_batch_broadcasts_over_channels() {
        let layout = AxisRoles::channels_at(2).resolve(&[2, 2, 3]).unwrap();
        let input = ArrayD::from_elem(IxDyn(&[2, 2, 3]), 1.0f32);
        let baseline = ArrayD::from_elem(IxDyn(&[2, 2, 3]), 0.5f32);

        let mut masks = ArrayD::<f32>::zeros(IxDyn(&[1, 2, 2]));
        masks[[0, 0, 0]] = 1.0;
        masks[[0, 1, 1]] = 0.5;
        let masks = MaskSet::new(masks).unwrap();

        let evaluator = PerturbationEvaluator::new(&layout, 4);
        let batch = evaluator.perturb_batch(&input, &baseline, &masks, 0..1);

        assert_eq!(batch.shape(), &[1, 2, 2, 3]);
        for c in 0..3 {
            assert_eq!(batch[[0, 0, 0, c]], 1.0);
            assert_eq!(batch[[0, 0, 1, c]], 0.5);
            assert_eq!(batch[[0, 1, 1, c]], 0.75);
        }
    }

    #[test]
    fn test_perturb_batch_channels_first() {
        let layout = AxisRoles::channels_at(0).resolve(&[2, 3, 1]).unwrap();
        let input = ArrayD::from_elem(IxDyn(&[2, 3, 1]), 2.0f32);
        let baseline = ArrayD::zeros(IxDyn(&[2, 3, 1]));
        let masks = MaskSet::new(
            ArrayD::from_shape_vec(IxDyn(&[1, 3, 1]), vec![0.0, 0.5, 1.0]).unwrap(),
        )
        .unwrap();

        let batch = PerturbationEvaluator::new(&layout, 1).perturb_batch(
            &input,
            &baseline,
            &masks,
            0..1,
        );

        for c in 0..2 {
            assert_eq!(batch[[0, c, 0, 0]], 0.0);
            assert_eq!(batch[[0, c, 1, 0]], 1.0);
            assert_eq!(batch[[0, c, 2, 0]], 2.0);
        }
    }

    #[test]
    fn test_batches_cover_all_masks() {
        let layout = AxisRoles::new().resolve(&[4]).unwrap();
        let evaluator = PerturbationEvaluator::new(&layout, 4);
        let ranges: Vec<Range<usize>> = evaluator.batches(10).collect();
        assert_eq!(ranges, vec![0..4, 4..8, 8..10]);
    }

    #[test]
    fn test_evaluate_preserves_order_and_partial_batch() {
        let layout = AxisRoles::new().resolve(&[2, 2]).unwrap();
        let input = ArrayD::from_elem(IxDyn(&[2, 2]), 1.0f32);
        let baseline = ArrayD::zeros(IxDyn(&[2, 2]));
        let masks = ramp_masks(10, &[2, 2]);
        let mut model = RecordingModel { batch_sizes: vec![] };
        let (sender, receiver) = progress_channel();

        let evaluation = PerturbationEvaluator::new(&layout, 4)
            .with_progress(Some(&sender))
            .evaluate(&mut model, &input, &baseline, &masks)
            .unwrap();

        assert_eq!(model.batch_sizes, vec![4, 4, 2]);
        assert_eq!(evaluation.masks_processed, 10);
        assert_eq!(evaluation.stopped, None);
        assert_eq!(evaluation.embeddings.dim(), (10, 2));
        for i in 0..10 {
            let expected = 4.0 * i as f32 / 10.0;
            assert!((evaluation.embeddings[[i, 0]] - expected).abs() < 1e-5);
        }
        assert_eq!(evaluation.embeddings[[9, 1]], 3.0);

        drop(sender);
        let processed: Vec<usize> = receiver.iter().map(|e| e.masks_processed).collect();
        assert_eq!(processed, vec![4, 8, 10]);
    }

    #[test]
    fn test_mask_limit_stops_between_batches() {
        let layout = AxisRoles::new().resolve(&[2, 2]).unwrap();
        let input = ArrayD::from_elem(IxDyn(&[2, 2]), 1.0f32);
        let baseline = ArrayD::zeros(IxDyn(&[2, 2]));
        let masks = ramp_masks(20, &[2, 2]);
        let mut model = RecordingModel { batch_sizes: vec![] };

        let evaluation = PerturbationEvaluator::new(&layout, 4)
            .with_mask_limit(Some(6))
            .evaluate(&mut model, &input, &baseline, &masks)
            .unwrap();

        assert_eq!(evaluation.masks_processed, 6);
        assert_eq!(evaluation.stopped, Some(StopReason::MaskLimit));
        assert_eq!(evaluation.embeddings.nrows(), 6);
        assert_eq!(model.batch_sizes, vec![4, 2]);
    }

    #[test]
    fn test_mask_limit_never_exceeded() {
        let layout = AxisRoles::new().resolve(&[2, 2]).unwrap();
        let input = ArrayD::from_elem(IxDyn(&[2, 2]), 1.0f32);
        let baseline = ArrayD::zeros(IxDyn(&[2, 2]));
        let masks = ramp_masks(20, &[2, 2]);

        for limit in [1, 3, 4, 5, 19] {
            let mut model = RecordingModel { batch_sizes: vec![] };
            let evaluation = PerturbationEvaluator::new(&layout, 4)
                .with_mask_limit(Some(limit))
                .evaluate(&mut model, &input, &baseline, &masks)
                .unwrap();

            assert_eq!(evaluation.masks_processed, limit);
            assert_eq!(evaluation.embeddings.nrows(), limit);
            assert_eq!(model.batch_sizes.iter().sum::<usize>(), limit);
            assert_eq!(model.batch_sizes.len(), limit.div_ceil(4));
        }
    }

    #[test]
    fn test_mask_limit_at_or_above_total_completes() {
        let layout = AxisRoles::new().resolve(&[2, 2]).unwrap();
        let input = ArrayD::from_elem(IxDyn(&[2, 2]), 1.0f32);
        let baseline = ArrayD::zeros(IxDyn(&[2, 2]));
        let masks = ramp_masks(8, &[2, 2]);

        for limit in [8, 50] {
            let mut model = RecordingModel { batch_sizes: vec![] };
            let evaluation = PerturbationEvaluator::new(&layout, 4)
                .with_mask_limit(Some(limit))
                .evaluate(&mut model, &input, &baseline, &masks)
                .unwrap();

            assert_eq!(evaluation.masks_processed, 8);
            assert_eq!(evaluation.stopped, None);
        }
    }

    #[test]
    fn test_cancelled_before_first_batch() {
        let layout = AxisRoles::new().resolve(&[2, 2]).unwrap();
        let input = ArrayD::from_elem(IxDyn(&[2, 2]), 1.0f32);
        let baseline = ArrayD::zeros(IxDyn(&[2, 2]));
        let masks = ramp_masks(8, &[2, 2]);
        let mut model = RecordingModel { batch_sizes: vec![] };
        let token = CancellationToken::new();
        token.cancel();

        let evaluation = PerturbationEvaluator::new(&layout, 4)
            .with_cancellation(Some(&token))
            .evaluate(&mut model, &input, &baseline, &masks)
            .unwrap();

        assert_eq!(evaluation.masks_processed, 0);
        assert_eq!(evaluation.stopped, Some(StopReason::Cancelled));
        assert!(model.batch_sizes.is_empty());
    }

    #[test]
    fn test_wrong_embedding_count() {
        let layout = AxisRoles::new().resolve(&[2]).unwrap();
        let input = ArrayD::from_elem(IxDyn(&[2]), 1.0f32);
        let baseline = ArrayD::zeros(IxDyn(&[2]));
        let masks = ramp_masks(4, &[2]);
        let mut model = |_batch: &ArrayD<f32>| -> Array2<f32> { Array2::ones((1, 3)) };

        let err = PerturbationEvaluator::new(&layout, 2)
            .evaluate(&mut model, &input, &baseline, &masks)
            .unwrap_err();
        assert!(matches!(err, ExplainError::ModelOutput(_)));
    }

    #[test]
    fn test_non_finite_embedding() {
        let layout = AxisRoles::new().resolve(&[2]).unwrap();
        let input = ArrayD::from_elem(IxDyn(&[2]), 1.0f32);
        let baseline = ArrayD::zeros(IxDyn(&[2]));
        let masks = ramp_masks(4, &[2]);
        let mut model = |batch: &ArrayD<f32>| -> Array2<f32> {
            let mut out = Array2::ones((batch.shape()[0], 3));
            out[[0, 1]] = f32::NAN;
            out
        };

        let err = PerturbationEvaluator::new(&layout, 2)
            .evaluate(&mut model, &input, &baseline, &masks)
            .unwrap_err();
        assert!(matches!(err, ExplainError::ModelOutput(_)));
    }

    #[test]
    fn test_dimensionality_must_stay_fixed() {
        let layout = AxisRoles::new().resolve(&[2]).unwrap();
        let input = ArrayD::from_elem(IxDyn(&[2]), 1.0f32);
        let baseline = ArrayD::zeros(IxDyn(&[2]));
        let masks = ramp_masks(4, &[2]);
        let mut calls = 0;
        let mut model = |batch: &ArrayD<f32>| -> Array2<f32> {
            calls += 1;
            Array2::ones((batch.shape()[0], 2 + calls))
        };

        let err = PerturbationEvaluator::new(&layout, 2)
            .evaluate(&mut model, &input, &baseline, &masks)
            .unwrap_err();
        assert!(matches!(err, ExplainError::ModelOutput(_)));

        let err = PerturbationEvaluator::new(&layout, 2)
            .with_expected_dim(Some(7))
            .evaluate(&mut RecordingModel { batch_sizes: vec![] }, &input, &baseline, &masks)
            .unwrap_err();
        assert!(matches!(err, ExplainError::ModelOutput(_)));
    }

    #[test]
    fn test_model_failure_propagates() {
        struct FailingModel;
        impl EmbeddingModel for FailingModel {
            fn embed(&mut self, _batch: &ArrayD<f32>) -> distex_core::Result<Array2<f32>> {
                Err(CoreError::ModelError("device lost".to_string()))
            }
        }

        let layout = AxisRoles::new().resolve(&[2]).unwrap();
        let input = ArrayD::from_elem(IxDyn(&[2]), 1.0f32);
        let baseline = ArrayD::zeros(IxDyn(&[2]));
        let masks = ramp_masks(4, &[2]);

        let err = PerturbationEvaluator::new(&layout, 2)
            .evaluate(&mut FailingModel, &input, &baseline, &masks)
            .unwrap_err();
        assert!(matches!(err, ExplainError::Model(CoreError::ModelError(_))));
    }

    #[test]
    fn test_mismatched_mask_shape() {
        let layout = AxisRoles::new().resolve(&[2, 2]).unwrap();
        let input = ArrayD::from_elem(IxDyn(&[2, 2]), 1.0f32);
        let baseline = ArrayD::zeros(IxDyn(&[2, 2]));
        let masks = ramp_masks(4, &[3, 2]);

        let err = PerturbationEvaluator::new(&layout, 2)
            .evaluate(&mut RecordingModel { batch_sizes: vec![] }, &input, &baseline, &masks)
            .unwrap_err();
        assert!(matches!(err, ExplainError::Configuration(_)));
    }
}
