//! Random perturbation masks.
//!
//! Masks are sampled on a coarse grid of cells and upsampled with linear
//! interpolation, so occlusions have soft edges. With random shift enabled
//! the grid carries one extra cell per axis and every mask is cropped at its
//! own random sub-cell offset, which avoids artifacts aligned to the grid.

use distex_core::Seed;
use ndarray::{ArrayD, ArrayViewD, ArrayViewMutD, Axis, IxDyn, Slice, Zip};
use rand::Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{ExplainError, Result};

/// How cell values of the coarse grid are sampled.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MaskSampling {
    /// Cells are kept (1) with probability `p_keep`, otherwise occluded (0).
    Bernoulli {
        /// Probability of keeping a cell. Must be in (0, 1].
        p_keep: f32,
    },
    /// Cells take a continuous value drawn uniformly from [0, 1).
    Uniform,
}

impl MaskSampling {
    /// Expected mask value at any location.
    #[must_use]
    pub fn keep_probability(&self) -> f32 {
        match self {
            Self::Bernoulli { p_keep } => *p_keep,
            Self::Uniform => 0.5,
        }
    }
}

impl Default for MaskSampling {
    fn default() -> Self {
        Self::Bernoulli { p_keep: 0.5 }
    }
}

/// A stack of masks sharing one spatial shape.
///
/// Stored as a single array of shape `(num_masks, spatial...)` with values
/// in [0, 1].
#[derive(Debug, Clone, PartialEq)]
pub struct MaskSet {
    masks: ArrayD<f32>,
}

impl MaskSet {
    /// Wrap caller supplied masks of shape `(num_masks, spatial...)`.
    ///
    /// # Errors
    ///
    /// Returns [`ExplainError::Configuration`] if there is no mask, no
    /// spatial axis, or a value outside [0, 1].
    pub fn new(masks: ArrayD<f32>) -> Result<Self> {
        if masks.ndim() < 2 {
            return Err(ExplainError::Configuration(format!(
                "masks need a leading mask axis and at least one spatial axis, got shape {:?}",
                masks.shape()
            )));
        }
        if masks.len_of(Axis(0)) == 0 {
            return Err(ExplainError::Configuration(
                "at least one mask is required".to_string(),
            ));
        }
        if let Some(value) = masks.iter().find(|v| !(0.0..=1.0).contains(*v)) {
            return Err(ExplainError::Configuration(format!(
                "mask values must lie in [0, 1], found {value}"
            )));
        }
        Ok(Self { masks })
    }

    /// Number of masks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.masks.len_of(Axis(0))
    }

    /// Whether the set holds no masks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Spatial shape shared by every mask.
    #[must_use]
    pub fn spatial_shape(&self) -> &[usize] {
        &self.masks.shape()[1..]
    }

    /// View of a single mask.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    #[must_use]
    pub fn mask(&self, index: usize) -> ArrayViewD<'_, f32> {
        self.masks.index_axis(Axis(0), index)
    }

    /// Iterate over the masks in order.
    pub fn iter(&self) -> impl Iterator<Item = ArrayViewD<'_, f32>> + '_ {
        self.masks.axis_iter(Axis(0))
    }

    /// The first `len` masks as a new set.
    #[must_use]
    pub fn truncated(&self, len: usize) -> Self {
        let len = len.min(self.len());
        Self {
            masks: self
                .masks
                .slice_axis(Axis(0), Slice::from(..len))
                .to_owned(),
        }
    }

    /// Accumulated mask weight per location across all masks.
    #[must_use]
    pub fn coverage(&self) -> ArrayD<f32> {
        self.masks.sum_axis(Axis(0))
    }

    /// Mean mask value over all masks and locations.
    #[must_use]
    pub fn mean_value(&self) -> f32 {
        self.masks.mean().unwrap_or(0.0)
    }

    /// The underlying `(num_masks, spatial...)` array.
    #[must_use]
    pub fn as_array(&self) -> &ArrayD<f32> {
        &self.masks
    }

    /// Consume the set and return the underlying array.
    #[must_use]
    pub fn into_array(self) -> ArrayD<f32> {
        self.masks
    }
}

/// Seeded generator of [`MaskSet`]s.
///
/// # Example
///
/// ```rust
/// use distex_core::Seed;
/// use distex_explain::{MaskGenerator, MaskSampling};
///
/// let generator = MaskGenerator::new(MaskSampling::default());
/// let masks = generator.generate(&[32, 32], 100, &[8, 8], Seed::new(0)).unwrap();
/// assert_eq!(masks.len(), 100);
/// assert_eq!(masks.spatial_shape(), &[32, 32]);
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MaskGenerator {
    sampling: MaskSampling,
    random_shift: bool,
    parallel: bool,
}

impl MaskGenerator {
    /// Create a generator with random shift enabled.
    #[must_use]
    pub fn new(sampling: MaskSampling) -> Self {
        Self {
            sampling,
            random_shift: true,
            parallel: false,
        }
    }

    /// Enable or disable the random sub-cell shift.
    #[must_use]
    pub fn with_random_shift(mut self, random_shift: bool) -> Self {
        self.random_shift = random_shift;
        self
    }

    /// Generate masks on the rayon thread pool.
    ///
    /// Every mask draws from its own fork of the seed, so the result is the
    /// same as sequential generation.
    #[must_use]
    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    /// Generate `num_masks` masks of `spatial_shape` from cells of `cell_size`.
    ///
    /// # Errors
    ///
    /// Returns [`ExplainError::MaskGeneration`] if `num_masks` is zero, the
    /// cell size does not evenly tile the spatial shape, the keep probability
    /// is outside (0, 1], or some location is never covered by any mask.
    pub fn generate(
        &self,
        spatial_shape: &[usize],
        num_masks: usize,
        cell_size: &[usize],
        seed: Seed,
    ) -> Result<MaskSet> {
        let cells = self.check(spatial_shape, num_masks, cell_size)?;

        let mut shape = Vec::with_capacity(spatial_shape.len() + 1);
        shape.push(num_masks);
        shape.extend_from_slice(spatial_shape);
        let mut masks = ArrayD::<f32>::zeros(IxDyn(&shape));

        let fill = |(index, mut dst): (usize, ArrayViewMutD<'_, f32>)| {
            let mask = self.sample_mask(spatial_shape, &cells, cell_size, seed.fork(index as u64));
            dst.assign(&mask);
        };
        if self.parallel {
            masks.axis_iter_mut(Axis(0)).enumerate().par_bridge().for_each(fill);
        } else {
            masks.axis_iter_mut(Axis(0)).enumerate().for_each(fill);
        }
        let set = MaskSet { masks };

        let uncovered = set.coverage().iter().filter(|&&c| c <= 0.0).count();
        if uncovered > 0 {
            return Err(ExplainError::MaskGeneration(format!(
                "{uncovered} location(s) are not covered by any of the {num_masks} masks; \
                 increase num_masks or the keep probability"
            )));
        }

        Ok(set)
    }

    /// Validate parameters and return the number of cells per axis.
    fn check(
        &self,
        spatial_shape: &[usize],
        num_masks: usize,
        cell_size: &[usize],
    ) -> Result<Vec<usize>> {
        if num_masks == 0 {
            return Err(ExplainError::MaskGeneration(
                "num_masks must be positive".to_string(),
            ));
        }
        if spatial_shape.is_empty() {
            return Err(ExplainError::MaskGeneration(
                "masks need at least one spatial axis".to_string(),
            ));
        }
        if cell_size.len() != spatial_shape.len() {
            return Err(ExplainError::MaskGeneration(format!(
                "cell size {cell_size:?} has {} axes but the spatial shape {spatial_shape:?} has {}",
                cell_size.len(),
                spatial_shape.len()
            )));
        }
        if let MaskSampling::Bernoulli { p_keep } = self.sampling {
            if !(p_keep > 0.0 && p_keep <= 1.0) {
                return Err(ExplainError::MaskGeneration(format!(
                    "p_keep must be in (0, 1], got {p_keep}"
                )));
            }
        }

        spatial_shape
            .iter()
            .zip(cell_size)
            .enumerate()
            .map(|(axis, (&len, &cell))| {
                if cell == 0 || len == 0 || len % cell != 0 {
                    Err(ExplainError::MaskGeneration(format!(
                        "cell size {cell} does not evenly tile spatial axis {axis} of length {len}"
                    )))
                } else {
                    Ok(len / cell)
                }
            })
            .collect()
    }

    fn sample_mask(
        &self,
        spatial_shape: &[usize],
        cells: &[usize],
        cell_size: &[usize],
        seed: Seed,
    ) -> ArrayD<f32> {
        let mut rng = seed.to_rng();
        let extra = usize::from(self.random_shift);

        let grid_shape: Vec<usize> = cells.iter().map(|&c| c + extra).collect();
        let mut grid = ArrayD::<f32>::zeros(IxDyn(&grid_shape));
        for value in grid.iter_mut() {
            *value = match self.sampling {
                MaskSampling::Bernoulli { p_keep } => {
                    if rng.gen::<f32>() < p_keep {
                        1.0
                    } else {
                        0.0
                    }
                }
                MaskSampling::Uniform => rng.gen::<f32>(),
            };
        }

        let offsets: Vec<usize> = cell_size
            .iter()
            .map(|&cell| if self.random_shift { rng.gen_range(0..cell) } else { 0 })
            .collect();

        let upsampled = cell_size
            .iter()
            .enumerate()
            .fold(grid, |acc, (axis, &factor)| upsample_axis(&acc, axis, factor));

        upsampled
            .slice_each_axis(|desc| {
                let axis = desc.axis.index();
                let start = offsets[axis];
                Slice::from(start..start + spatial_shape[axis])
            })
            .to_owned()
    }
}

/// Linearly upsample one axis by an integer factor.
///
/// Cell values are anchored at cell centres; positions beyond the first and
/// last centre take the edge value.
fn upsample_axis(grid: &ArrayD<f32>, axis: usize, factor: usize) -> ArrayD<f32> {
    let len = grid.len_of(Axis(axis));
    let mut shape = grid.shape().to_vec();
    shape[axis] = len * factor;

    let mut out = ArrayD::<f32>::zeros(IxDyn(&shape));
    let last = (len - 1) as f32;
    Zip::from(out.lanes_mut(Axis(axis)))
        .and(grid.lanes(Axis(axis)))
        .for_each(|mut dst, src| {
            for (j, value) in dst.iter_mut().enumerate() {
                let pos = ((j as f32 + 0.5) / factor as f32 - 0.5).clamp(0.0, last);
                let lo = pos.floor() as usize;
                let hi = (lo + 1).min(len - 1);
                let frac = pos - lo as f32;
                *value = src[lo] + frac * (src[hi] - src[lo]);
            }
        });
    out
}
