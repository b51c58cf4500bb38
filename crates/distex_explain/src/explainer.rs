//! The distance explainer.

use std::path::Path;

use distex_core::{EmbeddingModel, InputLayout};
use ndarray::{Array1, Array2, ArrayD, ArrayView2, Axis};
use ndarray_npy::NpzWriter;
use rayon::prelude::*;
use tracing::{info, warn};

use crate::aggregate::{Aggregator, AttributionMap};
use crate::config::ExplainerConfig;
use crate::error::{ExplainError, Result};
use crate::masks::{MaskGenerator, MaskSet};
use crate::perturb::PerturbationEvaluator;
use crate::progress::{CancellationToken, ProgressSender};

/// Whether every configured mask contributed to a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultQuality {
    /// All masks were evaluated.
    Complete,
    /// The run stopped early; maps are built from the first `masks_used`
    /// masks.
    Partial {
        /// Masks evaluated.
        masks_used: usize,
        /// Masks configured.
        masks_total: usize,
    },
}

/// Outcome of an explanation run.
#[derive(Debug, Clone)]
pub struct ExplanationResult {
    /// One attribution map per reference point, in reference order.
    pub maps: Vec<AttributionMap>,
    /// Whether the run completed.
    pub quality: ResultQuality,
    /// Masks that were evaluated (diagnostics).
    pub masks: Option<MaskSet>,
    /// Distances of shape `(masks_used, num_references)` (diagnostics).
    pub distances: Option<Array2<f32>>,
    /// Embedding of the unperturbed input, when it was embedded on its own (diagnostics).
    pub input_embedding: Option<Array1<f32>>,
}

impl ExplanationResult {
    /// Whether the run stopped before evaluating every mask.
    pub fn is_partial(&self) -> bool {
        matches!(self.quality, ResultQuality::Partial { .. })
    }

    /// Write the maps and any diagnostics to a NumPy `.npz` archive.
    ///
    /// Maps are stored as `map_0`, `map_1`, ... alongside `neutral_values`;
    /// diagnostics as `masks`, `distances` and `input_embedding`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created or written.
    pub fn save_npz(&self, path: impl AsRef<Path>) -> Result<()> {
        let file = std::fs::File::create(path.as_ref())?;
        let mut npz = NpzWriter::new(file);
        let npz_error = |e: ndarray_npy::WriteNpzError| {
            ExplainError::SerializationError(format!("Failed to write npz archive: {e}"))
        };

        for (index, map) in self.maps.iter().enumerate() {
            npz.add_array(format!("map_{index}"), &map.values)
                .map_err(npz_error)?;
        }
        let neutral_values: Array1<f32> = self.maps.iter().map(|m| m.neutral_value).collect();
        npz.add_array("neutral_values", &neutral_values)
            .map_err(npz_error)?;

        if let Some(masks) = &self.masks {
            npz.add_array("masks", masks.as_array()).map_err(npz_error)?;
        }
        if let Some(distances) = &self.distances {
            npz.add_array("distances", distances).map_err(npz_error)?;
        }
        if let Some(embedding) = &self.input_embedding {
            npz.add_array("input_embedding", embedding)
                .map_err(npz_error)?;
        }

        npz.finish().map_err(npz_error)?;
        Ok(())
    }
}

/// Explains the distance between a model's embedding of an input and one or
/// more reference points.
///
/// Random masks occlude parts of the input; the model embeds every perturbed
/// sample once, and the distance of each embedding to each reference point is
/// aggregated into one attribution map per reference.
///
/// # Example
///
/// ```rust
/// use distex_explain::{DistanceExplainer, ExplainerConfig};
/// use ndarray::{arr2, Array2, ArrayD, Axis, IxDyn};
///
/// let config = ExplainerConfig::default().with_num_masks(50).with_cell_size(2usize);
/// let explainer = DistanceExplainer::new(config);
///
/// // Embeds every sample as (sum, 1)
/// let mut model = |batch: &ArrayD<f32>| {
///     let sums: Vec<f32> = batch.axis_iter(Axis(0)).map(|s| s.sum()).collect();
///     Array2::from_shape_fn((sums.len(), 2), |(i, j)| if j == 0 { sums[i] } else { 1.0 })
/// };
///
/// let input = ArrayD::from_elem(IxDyn(&[4, 4]), 1.0);
/// let references = arr2(&[[16.0f32, 1.0]]);
/// let result = explainer.explain(&mut model, &input, references.view()).unwrap();
/// assert_eq!(result.maps[0].shape(), &[4, 4]);
/// ```
#[derive(Debug, Clone, Default)]
pub struct DistanceExplainer {
    config: ExplainerConfig,
    progress: Option<ProgressSender>,
    cancellation: Option<CancellationToken>,
}

impl DistanceExplainer {
    /// Create an explainer.
    pub fn new(config: ExplainerConfig) -> Self {
        Self {
            config,
            progress: None,
            cancellation: None,
        }
    }

    /// Send a [`ProgressEvent`](crate::ProgressEvent) after every batch.
    #[must_use]
    pub fn with_progress(mut self, progress: ProgressSender) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Stop between batches once `token` is cancelled.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// Get the configuration.
    pub fn config(&self) -> &ExplainerConfig {
        &self.config
    }

    /// Explain the distances from `input` to every row of `references`.
    ///
    /// The model is called `ceil(num_masks / batch_size)` times, plus once on
    /// the unperturbed input when `embedding_dim` is not configured.
    ///
    /// # Errors
    ///
    /// - [`ExplainError::Configuration`] for invalid settings, references or
    ///   baseline, raised before any model call.
    /// - [`ExplainError::MaskGeneration`] if masks cannot cover the input.
    /// - [`ExplainError::ModelOutput`] or [`ExplainError::Model`] if the model
    ///   misbehaves.
    /// - [`ExplainError::Cancelled`] if stopped before the first batch.
    pub fn explain<M: EmbeddingModel + ?Sized>(
        &self,
        model: &mut M,
        input: &ArrayD<f32>,
        references: ArrayView2<'_, f32>,
    ) -> Result<ExplanationResult> {
        let layout = self.prepare(input, references)?;
        let cell_size = self.config.cell_size_for(&layout)?;

        let masks = MaskGenerator::new(self.config.mask_sampling)
            .with_random_shift(self.config.random_shift)
            .with_parallel(self.config.parallel)
            .generate(
                &layout.spatial_shape(),
                self.config.num_masks,
                &cell_size,
                self.config.seed,
            )?;

        self.run(model, input, references, &layout, masks)
    }

    /// Explain with caller supplied masks instead of generated ones.
    ///
    /// # Errors
    ///
    /// As [`explain`](Self::explain); additionally
    /// [`ExplainError::Configuration`] if the number of masks differs from
    /// `num_masks` or their spatial shape differs from the input's.
    pub fn explain_with_masks<M: EmbeddingModel + ?Sized>(
        &self,
        model: &mut M,
        input: &ArrayD<f32>,
        references: ArrayView2<'_, f32>,
        masks: MaskSet,
    ) -> Result<ExplanationResult> {
        let layout = self.prepare(input, references)?;
        if masks.len() != self.config.num_masks {
            return Err(ExplainError::Configuration(format!(
                "got {} masks but num_masks is {}",
                masks.len(),
                self.config.num_masks
            )));
        }
        if masks.spatial_shape() != layout.spatial_shape().as_slice() {
            return Err(ExplainError::Configuration(format!(
                "mask spatial shape {:?} does not match input spatial shape {:?}",
                masks.spatial_shape(),
                layout.spatial_shape()
            )));
        }

        self.run(model, input, references, &layout, masks)
    }

    fn prepare(&self, input: &ArrayD<f32>, references: ArrayView2<'_, f32>) -> Result<InputLayout> {
        let layout = self.config.validate(input.shape())?;
        if input.iter().any(|v| !v.is_finite()) {
            return Err(ExplainError::Configuration(
                "input contains non-finite values".to_string(),
            ));
        }
        self.config.validate_references(references)?;
        Ok(layout)
    }

    fn run<M: EmbeddingModel + ?Sized>(
        &self,
        model: &mut M,
        input: &ArrayD<f32>,
        references: ArrayView2<'_, f32>,
        layout: &InputLayout,
        masks: MaskSet,
    ) -> Result<ExplanationResult> {
        let baseline = self.config.baseline.resolve(input, layout)?;
        let total = masks.len();
        info!(
            "Explaining {} reference(s) for input {} with {} masks",
            references.nrows(),
            layout,
            total
        );

        let (embedding_dim, input_embedding) = match self.config.embedding_dim {
            Some(dim) => (dim, None),
            None => {
                let embedding = embed_unperturbed(model, input)?;
                (embedding.len(), Some(embedding))
            }
        };
        if references.ncols() != embedding_dim {
            return Err(ExplainError::Configuration(format!(
                "references have dimensionality {} but the model embeds into {embedding_dim}",
                references.ncols()
            )));
        }

        let evaluation = PerturbationEvaluator::new(layout, self.config.batch_size)
            .with_expected_dim(Some(embedding_dim))
            .with_mask_limit(self.config.max_masks_before_cancel)
            .with_progress(self.progress.as_ref())
            .with_cancellation(self.cancellation.as_ref())
            .evaluate(model, input, &baseline, &masks)?;

        let used = evaluation.masks_processed;
        if used == 0 {
            return Err(ExplainError::Cancelled);
        }
        let (quality, masks) = if used < total {
            warn!(
                "Stopped early ({:?}) after {}/{} masks; maps are partial",
                evaluation.stopped, used, total
            );
            let quality = ResultQuality::Partial {
                masks_used: used,
                masks_total: total,
            };
            (quality, masks.truncated(used))
        } else {
            (ResultQuality::Complete, masks)
        };

        let distances = self
            .config
            .distance_metric
            .distance_matrix(evaluation.embeddings.view(), references)?;

        let aggregator = Aggregator::new(
            self.config.aggregation,
            self.config.mask_sampling.keep_probability(),
        );
        let maps: Vec<AttributionMap> = if self.config.parallel {
            (0..references.nrows())
                .into_par_iter()
                .map(|r| aggregator.aggregate(&masks, distances.column(r)))
                .collect::<Result<_>>()?
        } else {
            (0..references.nrows())
                .map(|r| aggregator.aggregate(&masks, distances.column(r)))
                .collect::<Result<_>>()?
        };

        info!("Explained {} reference(s) using {} masks", maps.len(), used);

        let keep = self.config.keep_diagnostics;
        Ok(ExplanationResult {
            maps,
            quality,
            masks: keep.then_some(masks),
            distances: keep.then_some(distances),
            input_embedding: input_embedding.filter(|_| keep),
        })
    }
}

/// Embed the unperturbed input on its own.
fn embed_unperturbed<M: EmbeddingModel + ?Sized>(
    model: &mut M,
    input: &ArrayD<f32>,
) -> Result<Array1<f32>> {
    let batch = input.clone().insert_axis(Axis(0));
    let embeddings = model.embed(&batch)?;
    if embeddings.nrows() != 1 || embeddings.ncols() == 0 {
        return Err(ExplainError::ModelOutput(format!(
            "model returned embeddings of shape {:?} for a single sample",
            embeddings.dim()
        )));
    }
    if embeddings.iter().any(|v| !v.is_finite()) {
        return Err(ExplainError::ModelOutput(
            "embedding of the input contains non-finite values".to_string(),
        ));
    }
    Ok(embeddings.row(0).to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::baseline::Baseline;
    use crate::masks::MaskSampling;
    use crate::progress::progress_channel;
    use ndarray::{arr2, IxDyn};

    /// Embeds a sample as (sum, sum of the first half of its values).
    fn halves_model(batch: &ArrayD<f32>) -> Array2<f32> {
        let n = batch.len_of(Axis(0));
        Array2::from_shape_fn((n, 2), |(i, j)| {
            let sample = batch.index_axis(Axis(0), i);
            if j == 0 {
                sample.sum()
            } else {
                sample.iter().take(sample.len() / 2).sum()
            }
        })
    }

    fn ramp_input() -> ArrayD<f32> {
        ArrayD::from_shape_fn(IxDyn(&[8, 8]), |idx| 1.0 + (idx[0] * 8 + idx[1]) as f32 / 64.0)
    }

    fn small_config() -> ExplainerConfig {
        ExplainerConfig::default()
            .with_num_masks(20)
            .with_cell_size(4usize)
            .with_batch_size(6)
            .with_seed(3u64)
    }

    fn references() -> Array2<f32> {
        arr2(&[[1.0f32, 0.5], [1.0, 0.0]])
    }

    #[test]
    fn test_explain_complete() {
        let explainer = DistanceExplainer::new(small_config());
        let result = explainer
            .explain(&mut halves_model, &ramp_input(), references().view())
            .unwrap();

        assert_eq!(result.maps.len(), 2);
        for map in &result.maps {
            assert_eq!(map.shape(), &[8, 8]);
            assert!(map.values.iter().all(|v| v.is_finite()));
            assert_eq!(map.uncovered, 0);
        }
        assert_eq!(result.quality, ResultQuality::Complete);
        assert!(!result.is_partial());
        assert!(result.masks.is_none());
        assert!(result.distances.is_none());
        assert!(result.input_embedding.is_none());
    }

    #[test]
    fn test_model_call_count() {
        let mut calls = 0;
        let mut model = |batch: &ArrayD<f32>| {
            calls += 1;
            halves_model(batch)
        };
        let explainer = DistanceExplainer::new(small_config().with_embedding_dim(2));
        explainer
            .explain(&mut model, &ramp_input(), references().view())
            .unwrap();
        assert_eq!(calls, 4);

        calls = 0;
        let mut model = |batch: &ArrayD<f32>| {
            calls += 1;
            halves_model(batch)
        };
        DistanceExplainer::new(small_config())
            .explain(&mut model, &ramp_input(), references().view())
            .unwrap();
        // One extra call on the unperturbed input
        assert_eq!(calls, 5);
    }

    #[test]
    fn test_configuration_errors_skip_model() {
        let mut calls = 0;
        let mut model = |batch: &ArrayD<f32>| {
            calls += 1;
            halves_model(batch)
        };
        let input = ramp_input();
        let refs = references();

        let failing = [
            (small_config().with_cell_size(3usize), refs.clone()),
            (small_config(), Array2::zeros((0, 2))),
            (small_config(), arr2(&[[f32::INFINITY, 0.0]])),
            (small_config().with_embedding_dim(3), refs.clone()),
            (
                small_config().with_baseline(Baseline::Custom(ArrayD::zeros(IxDyn(&[8, 7])))),
                refs.clone(),
            ),
        ];
        for (config, references) in failing {
            let result = DistanceExplainer::new(config).explain(&mut model, &input, references.view());
            assert!(matches!(result, Err(ExplainError::Configuration(_))));
        }
        assert_eq!(calls, 0);
    }

    #[test]
    fn test_inferred_dimension_mismatch() {
        let mut calls = 0;
        let mut model = |batch: &ArrayD<f32>| {
            calls += 1;
            halves_model(batch)
        };
        let refs = arr2(&[[1.0f32, 0.0, 0.0]]);
        let result =
            DistanceExplainer::new(small_config()).explain(&mut model, &ramp_input(), refs.view());

        assert!(matches!(result, Err(ExplainError::Configuration(_))));
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_mask_limit_gives_partial_result() {
        let config = small_config()
            .with_batch_size(4)
            .with_max_masks_before_cancel(6)
            .with_keep_diagnostics(true);
        let result = DistanceExplainer::new(config)
            .explain(&mut halves_model, &ramp_input(), references().view())
            .unwrap();

        assert_eq!(
            result.quality,
            ResultQuality::Partial {
                masks_used: 6,
                masks_total: 20
            }
        );
        assert!(result.is_partial());
        assert_eq!(result.masks.as_ref().unwrap().len(), 6);
        assert_eq!(result.distances.as_ref().unwrap().dim(), (6, 2));
        assert_eq!(result.maps[0].shape(), &[8, 8]);
    }

    #[test]
    fn test_cancelled_before_first_batch() {
        let token = CancellationToken::new();
        token.cancel();
        let explainer = DistanceExplainer::new(small_config().with_embedding_dim(2))
            .with_cancellation(token);

        let result = explainer.explain(&mut halves_model, &ramp_input(), references().view());
        assert!(matches!(result, Err(ExplainError::Cancelled)));
    }

    #[test]
    fn test_progress_events() {
        let (sender, receiver) = progress_channel();
        let explainer = DistanceExplainer::new(small_config()).with_progress(sender);
        explainer
            .explain(&mut halves_model, &ramp_input(), references().view())
            .unwrap();
        drop(explainer);

        let processed: Vec<usize> = receiver.iter().map(|e| e.masks_processed).collect();
        assert_eq!(processed, vec![6, 12, 18, 20]);
    }

    #[test]
    fn test_diagnostics_kept() {
        let config = small_config().with_keep_diagnostics(true);
        let result = DistanceExplainer::new(config)
            .explain(&mut halves_model, &ramp_input(), references().view())
            .unwrap();

        assert_eq!(result.masks.as_ref().unwrap().len(), 20);
        assert_eq!(result.distances.as_ref().unwrap().dim(), (20, 2));
        let embedding = result.input_embedding.unwrap();
        assert!((embedding[0] - ramp_input().sum()).abs() < 1e-3);
    }

    #[test]
    fn test_explain_with_masks() {
        let config = small_config()
            .with_num_masks(4)
            .with_keep_diagnostics(true);
        let masks = MaskSet::new(ArrayD::from_shape_fn(IxDyn(&[4, 8, 8]), |idx| {
            if (idx[1] < 4) == (idx[0] % 2 == 0) {
                1.0
            } else {
                0.25
            }
        }))
        .unwrap();

        let explainer = DistanceExplainer::new(config);
        let result = explainer
            .explain_with_masks(&mut halves_model, &ramp_input(), references().view(), masks.clone())
            .unwrap();
        assert_eq!(result.masks.as_ref(), Some(&masks));

        let wrong_count = masks.truncated(3);
        assert!(matches!(
            explainer.explain_with_masks(
                &mut halves_model,
                &ramp_input(),
                references().view(),
                wrong_count
            ),
            Err(ExplainError::Configuration(_))
        ));

        let wrong_shape = MaskSet::new(ArrayD::from_elem(IxDyn(&[4, 8, 4]), 0.5)).unwrap();
        assert!(matches!(
            explainer.explain_with_masks(
                &mut halves_model,
                &ramp_input(),
                references().view(),
                wrong_shape
            ),
            Err(ExplainError::Configuration(_))
        ));
    }

    #[test]
    fn test_parallel_matches_sequential() {
        let config = small_config().with_mask_sampling(MaskSampling::Uniform);
        let sequential = DistanceExplainer::new(config.clone())
            .explain(&mut halves_model, &ramp_input(), references().view())
            .unwrap();
        let parallel = DistanceExplainer::new(config.with_parallel(true))
            .explain(&mut halves_model, &ramp_input(), references().view())
            .unwrap();

        for (a, b) in sequential.maps.iter().zip(&parallel.maps) {
            assert_eq!(a.values, b.values);
        }
    }

    #[test]
    fn test_malformed_model_output() {
        let mut model = |batch: &ArrayD<f32>| {
            let n = batch.len_of(Axis(0));
            Array2::from_elem((n, 2), f32::NAN)
        };
        let result = DistanceExplainer::new(small_config()).explain(
            &mut model,
            &ramp_input(),
            references().view(),
        );
        assert!(matches!(result, Err(ExplainError::ModelOutput(_))));
    }

    #[test]
    fn test_save_npz() {
        let config = small_config().with_keep_diagnostics(true);
        let result = DistanceExplainer::new(config)
            .explain(&mut halves_model, &ramp_input(), references().view())
            .unwrap();

        let path = std::env::temp_dir().join("distex_explanation_test.npz");
        result.save_npz(&path).unwrap();

        let file = std::fs::File::open(&path).unwrap();
        let mut npz = ndarray_npy::NpzReader::new(file).unwrap();
        // map_0, map_1, neutral_values, masks, distances, input_embedding
        assert_eq!(npz.len(), 6);
        drop(npz);
        std::fs::remove_file(&path).ok();
    }
}
