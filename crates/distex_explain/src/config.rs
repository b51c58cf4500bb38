//! Explainer configuration.

use std::path::Path;

use distex_core::{AxisRoles, InputLayout, Seed};
use ndarray::ArrayView2;
use serde::{Deserialize, Serialize};

use crate::aggregate::AggregationStrategy;
use crate::baseline::Baseline;
use crate::distance::DistanceMetric;
use crate::error::{ExplainError, Result};
use crate::masks::MaskSampling;

/// Size of a mask grid cell, in locations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CellSize {
    /// The same cell size on every spatial axis.
    Uniform(usize),
    /// One cell size per spatial axis, in axis order.
    PerAxis(Vec<usize>),
}

impl CellSize {
    /// Cell size for each of `spatial_rank` axes.
    ///
    /// # Errors
    ///
    /// Returns [`ExplainError::Configuration`] if a per-axis list has the
    /// wrong length.
    pub fn per_axis(&self, spatial_rank: usize) -> Result<Vec<usize>> {
        match self {
            Self::Uniform(size) => Ok(vec![*size; spatial_rank]),
            Self::PerAxis(sizes) if sizes.len() == spatial_rank => Ok(sizes.clone()),
            Self::PerAxis(sizes) => Err(ExplainError::Configuration(format!(
                "cell_size lists {} axes but the input has {spatial_rank} spatial axes",
                sizes.len()
            ))),
        }
    }
}

impl Default for CellSize {
    fn default() -> Self {
        Self::Uniform(8)
    }
}

impl From<usize> for CellSize {
    fn from(size: usize) -> Self {
        Self::Uniform(size)
    }
}

impl From<Vec<usize>> for CellSize {
    fn from(sizes: Vec<usize>) -> Self {
        Self::PerAxis(sizes)
    }
}

/// Configuration of a [`DistanceExplainer`](crate::DistanceExplainer).
///
/// Missing fields take their defaults when deserializing, so a JSON file only
/// needs the values that differ.
///
/// # Example
///
/// ```rust
/// use distex_core::AxisRoles;
/// use distex_explain::ExplainerConfig;
///
/// let config = ExplainerConfig::default()
///     .with_num_masks(500)
///     .with_cell_size(4usize)
///     .with_axis_roles(AxisRoles::channels_at(0));
///
/// let layout = config.validate(&[3, 32, 32]).unwrap();
/// assert_eq!(config.cell_size_for(&layout).unwrap(), vec![4, 4]);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExplainerConfig {
    /// Number of masks to sample.
    pub num_masks: usize,
    /// Size of the coarse mask grid cells.
    pub cell_size: CellSize,
    /// Number of perturbed samples per model call.
    pub batch_size: usize,
    /// How grid cells are sampled.
    pub mask_sampling: MaskSampling,
    /// Shift every mask by a random sub-cell offset.
    pub random_shift: bool,
    /// What occluded locations are replaced with.
    pub baseline: Baseline,
    /// Distance between embeddings and references.
    pub distance_metric: DistanceMetric,
    /// Roles of the input axes.
    pub axis_roles: AxisRoles,
    /// Seed for mask sampling.
    pub seed: Seed,
    /// Evaluate at most this many masks, then return a partial result.
    pub max_masks_before_cancel: Option<usize>,
    /// Expected embedding dimensionality. Inferred from the model when unset.
    pub embedding_dim: Option<usize>,
    /// How masks and distances become attribution maps.
    pub aggregation: AggregationStrategy,
    /// Keep masks, distances and the input embedding in the result.
    pub keep_diagnostics: bool,
    /// Generate masks and aggregate references on the rayon thread pool.
    pub parallel: bool,
}

impl Default for ExplainerConfig {
    fn default() -> Self {
        Self {
            num_masks: 1000,
            cell_size: CellSize::default(),
            batch_size: 10,
            mask_sampling: MaskSampling::default(),
            random_shift: true,
            baseline: Baseline::Zero,
            distance_metric: DistanceMetric::Cosine,
            axis_roles: AxisRoles::new(),
            seed: Seed::new(0),
            max_masks_before_cancel: None,
            embedding_dim: None,
            aggregation: AggregationStrategy::default(),
            keep_diagnostics: false,
            parallel: false,
        }
    }
}

impl ExplainerConfig {
    /// Set the number of masks.
    #[must_use]
    pub fn with_num_masks(mut self, num_masks: usize) -> Self {
        self.num_masks = num_masks;
        self
    }

    /// Set the cell size.
    #[must_use]
    pub fn with_cell_size(mut self, cell_size: impl Into<CellSize>) -> Self {
        self.cell_size = cell_size.into();
        self
    }

    /// Set the batch size.
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Set the mask sampling.
    #[must_use]
    pub fn with_mask_sampling(mut self, mask_sampling: MaskSampling) -> Self {
        self.mask_sampling = mask_sampling;
        self
    }

    /// Enable or disable the random mask shift.
    #[must_use]
    pub fn with_random_shift(mut self, random_shift: bool) -> Self {
        self.random_shift = random_shift;
        self
    }

    /// Set the baseline.
    #[must_use]
    pub fn with_baseline(mut self, baseline: Baseline) -> Self {
        self.baseline = baseline;
        self
    }

    /// Set the distance metric.
    #[must_use]
    pub fn with_distance_metric(mut self, distance_metric: DistanceMetric) -> Self {
        self.distance_metric = distance_metric;
        self
    }

    /// Set the axis roles.
    #[must_use]
    pub fn with_axis_roles(mut self, axis_roles: AxisRoles) -> Self {
        self.axis_roles = axis_roles;
        self
    }

    /// Set the seed.
    #[must_use]
    pub fn with_seed(mut self, seed: impl Into<Seed>) -> Self {
        self.seed = seed.into();
        self
    }

    /// Stop early once this many masks have been evaluated.
    #[must_use]
    pub fn with_max_masks_before_cancel(mut self, max_masks: usize) -> Self {
        self.max_masks_before_cancel = Some(max_masks);
        self
    }

    /// Declare the embedding dimensionality, skipping the extra model call.
    #[must_use]
    pub fn with_embedding_dim(mut self, embedding_dim: usize) -> Self {
        self.embedding_dim = Some(embedding_dim);
        self
    }

    /// Set the aggregation strategy.
    #[must_use]
    pub fn with_aggregation(mut self, aggregation: AggregationStrategy) -> Self {
        self.aggregation = aggregation;
        self
    }

    /// Keep diagnostics in the result.
    #[must_use]
    pub fn with_keep_diagnostics(mut self, keep_diagnostics: bool) -> Self {
        self.keep_diagnostics = keep_diagnostics;
        self
    }

    /// Enable or disable rayon parallelism.
    #[must_use]
    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    /// Validate the configuration for an input shape and resolve its layout.
    ///
    /// # Errors
    ///
    /// Returns [`ExplainError::Configuration`] describing the first invalid
    /// setting.
    pub fn validate(&self, input_shape: &[usize]) -> Result<InputLayout> {
        if self.num_masks == 0 {
            return Err(ExplainError::Configuration(
                "num_masks must be positive".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(ExplainError::Configuration(
                "batch_size must be positive".to_string(),
            ));
        }
        if let MaskSampling::Bernoulli { p_keep } = self.mask_sampling {
            if !(p_keep > 0.0 && p_keep <= 1.0) {
                return Err(ExplainError::Configuration(format!(
                    "p_keep must be in (0, 1], got {p_keep}"
                )));
            }
        }
        if self.max_masks_before_cancel == Some(0) {
            return Err(ExplainError::Configuration(
                "max_masks_before_cancel must be positive".to_string(),
            ));
        }
        if self.embedding_dim == Some(0) {
            return Err(ExplainError::Configuration(
                "embedding_dim must be positive".to_string(),
            ));
        }
        self.aggregation.validate()?;

        let layout = self
            .axis_roles
            .resolve(input_shape)
            .map_err(|e| ExplainError::Configuration(format!("axis roles: {e}")))?;
        self.cell_size_for(&layout)?;
        Ok(layout)
    }

    /// Cell size per spatial axis of `layout`.
    ///
    /// # Errors
    ///
    /// Returns [`ExplainError::Configuration`] if a cell size is zero or does
    /// not evenly tile its axis.
    pub fn cell_size_for(&self, layout: &InputLayout) -> Result<Vec<usize>> {
        let spatial_shape = layout.spatial_shape();
        let cell_size = self.cell_size.per_axis(spatial_shape.len())?;
        for (&size, &len) in cell_size.iter().zip(&spatial_shape) {
            if size == 0 || len % size != 0 {
                return Err(ExplainError::Configuration(format!(
                    "cell size {cell_size:?} does not evenly tile spatial shape {spatial_shape:?}"
                )));
            }
        }
        Ok(cell_size)
    }

    /// Check the reference points: at least one, all finite, and of the
    /// configured embedding dimensionality when one is set.
    ///
    /// # Errors
    ///
    /// Returns [`ExplainError::Configuration`] for invalid references.
    pub fn validate_references(&self, references: ArrayView2<'_, f32>) -> Result<()> {
        if references.nrows() == 0 {
            return Err(ExplainError::Configuration(
                "at least one reference point is required".to_string(),
            ));
        }
        if references.ncols() == 0 {
            return Err(ExplainError::Configuration(
                "reference points must not be empty".to_string(),
            ));
        }
        if let Some((row, _)) = references
            .outer_iter()
            .enumerate()
            .find(|(_, r)| r.iter().any(|v| !v.is_finite()))
        {
            return Err(ExplainError::Configuration(format!(
                "reference {row} contains non-finite values"
            )));
        }
        if let Some(dim) = self.embedding_dim {
            if references.ncols() != dim {
                return Err(ExplainError::Configuration(format!(
                    "references have dimensionality {} but embedding_dim is {dim}",
                    references.ncols()
                )));
            }
        }
        Ok(())
    }

    /// Save the configuration as pretty JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or writing fails.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| ExplainError::SerializationError(e.to_string()))?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load a configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if reading or parsing fails.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        serde_json::from_str(&json).map_err(|e| {
            ExplainError::SerializationError(format!("Failed to parse configuration: {e}"))
        })
    }
}
