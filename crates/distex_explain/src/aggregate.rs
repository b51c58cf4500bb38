//! Aggregation of per-mask distances into attribution maps.
//!
//! ## Sign convention
//!
//! For every strategy, a larger value means that masking the region out
//! moves the input further away from the reference point: the region is
//! responsible for the input's proximity to the reference. Negative values
//! mark regions whose presence pushes the input away from the reference.

use ndarray::{ArrayD, ArrayView1, IxDyn, Zip};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{ExplainError, Result};
use crate::masks::MaskSet;

/// Denominators below this value are treated as uncovered.
pub const MIN_COVERAGE: f64 = 1e-6;

/// Denominator of the coverage-weighted mean distance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Normalization {
    /// Accumulated mask weight at each location.
    #[default]
    Coverage,
    /// Number of masks times the mean mask value, the same for every location.
    MaskCount,
}

/// Fraction range `[start, end)` of masks ranked by distance.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SelectionRange {
    /// Lower end, in [0, 1].
    pub start: f32,
    /// Upper end, in [start, 1].
    pub end: f32,
}

impl SelectionRange {
    /// Create a range.
    #[must_use]
    pub const fn new(start: f32, end: f32) -> Self {
        Self { start, end }
    }

    /// Indices into a ranking of `n` masks covered by this range.
    fn bounds(&self, n: usize) -> (usize, usize) {
        // Round away the f32 representation error so 0.9 of 300 is 270
        let at = |fraction: f32| {
            let fraction = (f64::from(fraction) * 1e6).round() / 1e6;
            ((n as f64 * fraction) as usize).min(n)
        };
        (at(self.start), at(self.end))
    }

    fn validate(&self, name: &str) -> Result<()> {
        if !(0.0..=1.0).contains(&self.start)
            || !(0.0..=1.0).contains(&self.end)
            || self.start > self.end
        {
            return Err(ExplainError::Configuration(format!(
                "{name} must satisfy 0 <= start <= end <= 1, got [{}, {})",
                self.start, self.end
            )));
        }
        Ok(())
    }
}

/// How masks and distances are combined into an attribution map.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AggregationStrategy {
    /// `mean(d) - Σ d_i m_i / denominator` at every location.
    CoverageWeighted {
        /// Denominator of the weighted mean.
        normalization: Normalization,
    },
    /// Mean of the closest masks minus mean of the furthest masks.
    ///
    /// Values are a difference of mask means and lie in [-1, 1]. The neutral
    /// value is on the same scale: 0 when both selections are non-empty,
    /// otherwise `±keep_probability` for the one non-empty side. It does not
    /// depend on the distance of the unperturbed input. The selection
    /// statistics weigh masks by `exp(-d)` on the metric's raw distance, with
    /// no rescaling per metric.
    RankSelection {
        /// Ranked fraction of masks counted positively (closest first).
        positive_range: SelectionRange,
        /// Ranked fraction of masks counted negatively.
        negative_range: SelectionRange,
    },
}

impl AggregationStrategy {
    /// Rank selection with the closest 10% counted positively and the
    /// furthest 10% negatively.
    #[must_use]
    pub const fn rank_selection() -> Self {
        Self::RankSelection {
            positive_range: SelectionRange::new(0.0, 0.1),
            negative_range: SelectionRange::new(0.9, 1.0),
        }
    }

    /// Check the strategy parameters.
    ///
    /// # Errors
    ///
    /// Returns [`ExplainError::Configuration`] for an invalid selection range.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::CoverageWeighted { .. } => Ok(()),
            Self::RankSelection {
                positive_range,
                negative_range,
            } => {
                positive_range.validate("positive_range")?;
                negative_range.validate("negative_range")
            }
        }
    }
}

impl Default for AggregationStrategy {
    fn default() -> Self {
        Self::CoverageWeighted {
            normalization: Normalization::Coverage,
        }
    }
}

/// Summary of `exp(-distance)` over the masks a rank selection picked.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SelectionStatistics {
    /// Number of selected masks.
    pub count: usize,
    /// Mean weight.
    pub mean: f32,
    /// Standard deviation of the weights.
    pub std: f32,
    /// Smallest weight.
    pub min: f32,
    /// Largest weight.
    pub max: f32,
}

impl SelectionStatistics {
    fn from_distances(distances: impl Iterator<Item = f32>) -> Option<Self> {
        let weights: Vec<f64> = distances.map(|d| (-f64::from(d)).exp()).collect();
        if weights.is_empty() {
            return None;
        }
        let n = weights.len() as f64;
        let mean = weights.iter().sum::<f64>() / n;
        let variance = weights.iter().map(|w| (w - mean).powi(2)).sum::<f64>() / n;
        Some(Self {
            count: weights.len(),
            mean: mean as f32,
            std: variance.sqrt() as f32,
            min: weights.iter().copied().fold(f64::INFINITY, f64::min) as f32,
            max: weights.iter().copied().fold(f64::NEG_INFINITY, f64::max) as f32,
        })
    }
}

/// Attribution map for one reference point.
#[derive(Debug, Clone, PartialEq)]
pub struct AttributionMap {
    /// Attribution values, shaped like the input's spatial axes.
    pub values: ArrayD<f32>,
    /// Value meaning "neither closer nor further".
    pub neutral_value: f32,
    /// Locations whose denominator was too small; they hold the neutral value.
    pub uncovered: usize,
    /// Statistics of the positively counted masks (rank selection only).
    pub positive_statistics: Option<SelectionStatistics>,
    /// Statistics of the negatively counted masks (rank selection only).
    pub negative_statistics: Option<SelectionStatistics>,
}

impl AttributionMap {
    /// Create a new attribution map.
    pub fn new(values: ArrayD<f32>, neutral_value: f32) -> Self {
        Self {
            values,
            neutral_value,
            uncovered: 0,
            positive_statistics: None,
            negative_statistics: None,
        }
    }

    /// Get the shape of the attribution map.
    pub fn shape(&self) -> &[usize] {
        self.values.shape()
    }

    /// Normalize the attribution values to [0, 1].
    ///
    /// The neutral value is rescaled along with the values.
    pub fn normalize(&self) -> Self {
        let min_val = self.values.iter().copied().fold(f32::INFINITY, f32::min);
        let max_val = self.values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let range = max_val - min_val;

        // Avoid division by zero
        let (values, neutral_value) = if range > 1e-8 {
            (
                self.values.mapv(|v| (v - min_val) / range),
                (self.neutral_value - min_val) / range,
            )
        } else {
            (self.values.clone(), self.neutral_value)
        };

        Self {
            values,
            neutral_value,
            ..self.clone()
        }
    }
}

/// Combines masks and the distances of their embeddings to one reference.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aggregator {
    strategy: AggregationStrategy,
    keep_probability: f32,
}

impl Aggregator {
    /// Create an aggregator.
    ///
    /// `keep_probability` is the expected mask value; rank selection uses it
    /// as the neutral value of one-sided selections.
    #[must_use]
    pub fn new(strategy: AggregationStrategy, keep_probability: f32) -> Self {
        Self {
            strategy,
            keep_probability,
        }
    }

    /// Aggregate one distance column (one distance per mask).
    ///
    /// # Errors
    ///
    /// Returns [`ExplainError::Configuration`] if the number of distances
    /// differs from the number of masks or the strategy is invalid.
    pub fn aggregate(
        &self,
        masks: &MaskSet,
        distances: ArrayView1<'_, f32>,
    ) -> Result<AttributionMap> {
        if distances.len() != masks.len() {
            return Err(ExplainError::Configuration(format!(
                "{} distances for {} masks",
                distances.len(),
                masks.len()
            )));
        }
        self.strategy.validate()?;

        match self.strategy {
            AggregationStrategy::CoverageWeighted { normalization } => {
                Ok(coverage_weighted(masks, distances, normalization))
            }
            AggregationStrategy::RankSelection {
                positive_range,
                negative_range,
            } => Ok(self.rank_selection(masks, distances, positive_range, negative_range)),
        }
    }

    fn rank_selection(
        &self,
        masks: &MaskSet,
        distances: ArrayView1<'_, f32>,
        positive_range: SelectionRange,
        negative_range: SelectionRange,
    ) -> AttributionMap {
        let n = masks.len();
        let mut order: Vec<usize> = (0..n).collect();
        order.sort_by(|&a, &b| distances[a].total_cmp(&distances[b]));

        let select = |range: SelectionRange| {
            let (start, end) = range.bounds(n);
            &order[start..end.max(start)]
        };
        let positive = select(positive_range);
        let negative = select(negative_range);

        let mut values = mean_mask(masks, positive);
        values -= &mean_mask(masks, negative);

        let neutral_value = match (positive.is_empty(), negative.is_empty()) {
            (false, true) => self.keep_probability,
            (true, false) => -self.keep_probability,
            _ => 0.0,
        };

        let positive_statistics =
            SelectionStatistics::from_distances(positive.iter().map(|&i| distances[i]));
        let negative_statistics =
            SelectionStatistics::from_distances(negative.iter().map(|&i| distances[i]));
        debug!(
            "Rank selection: positive {:?}, negative {:?}",
            positive_statistics, negative_statistics
        );

        AttributionMap {
            values,
            neutral_value,
            uncovered: 0,
            positive_statistics,
            negative_statistics,
        }
    }
}

fn coverage_weighted(
    masks: &MaskSet,
    distances: ArrayView1<'_, f32>,
    normalization: Normalization,
) -> AttributionMap {
    let n = masks.len();
    let shape = IxDyn(masks.spatial_shape());
    let mut weighted = ArrayD::<f64>::zeros(shape.clone());
    let mut coverage = ArrayD::<f64>::zeros(shape.clone());

    for (mask, &distance) in masks.iter().zip(distances.iter()) {
        let distance = f64::from(distance);
        Zip::from(&mut weighted)
            .and(&mut coverage)
            .and(&mask)
            .for_each(|w, c, &m| {
                let m = f64::from(m);
                *w += distance * m;
                *c += m;
            });
    }

    let mean_distance = distances.iter().map(|&d| f64::from(d)).sum::<f64>() / n as f64;
    let denominators = match normalization {
        Normalization::Coverage => coverage,
        Normalization::MaskCount => {
            ArrayD::from_elem(shape, n as f64 * f64::from(masks.mean_value()))
        }
    };

    let mut uncovered = 0;
    let values = Zip::from(&weighted)
        .and(&denominators)
        .map_collect(|&w, &denominator| {
            if denominator < MIN_COVERAGE {
                uncovered += 1;
                0.0
            } else {
                (mean_distance - w / denominator) as f32
            }
        });
    if uncovered > 0 {
        warn!(
            "{} location(s) have no mask coverage; set to the neutral value",
            uncovered
        );
    }

    AttributionMap {
        values,
        neutral_value: 0.0,
        uncovered,
        positive_statistics: None,
        negative_statistics: None,
    }
}

/// Mean of the selected masks; zeros when nothing is selected.
fn mean_mask(masks: &MaskSet, selected: &[usize]) -> ArrayD<f32> {
    let mut sum = ArrayD::<f32>::zeros(IxDyn(masks.spatial_shape()));
    if selected.is_empty() {
        return sum;
    }
    for &index in selected {
        sum += &masks.mask(index);
    }
    sum / selected.len() as f32
}
