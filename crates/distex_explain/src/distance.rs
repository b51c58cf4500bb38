//! Distances between embeddings and reference points.

use ndarray::{Array2, ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};

use crate::error::{ExplainError, Result};

/// Distance used to compare embeddings with reference points.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMetric {
    /// `1 - cos(a, b)`, in [0, 2].
    ///
    /// When either vector has zero norm the angle is undefined; the distance
    /// is then defined as 1, the value for orthogonal vectors. Models that
    /// embed a fully occluded sample to the zero vector therefore see such
    /// masks at distance 1. Those masks carry no weight anywhere, so under
    /// coverage weighting each one raises the whole map by `1 / N`.
    #[default]
    Cosine,
    /// Euclidean (L2) distance.
    Euclidean,
}

impl DistanceMetric {
    /// Distance between two vectors of equal length.
    ///
    /// Accumulates in `f64`.
    #[must_use]
    pub fn distance(&self, a: ArrayView1<'_, f32>, b: ArrayView1<'_, f32>) -> f32 {
        match self {
            Self::Cosine => {
                let (mut dot, mut norm_a, mut norm_b) = (0.0f64, 0.0f64, 0.0f64);
                for (&x, &y) in a.iter().zip(b.iter()) {
                    let (x, y) = (f64::from(x), f64::from(y));
                    dot += x * y;
                    norm_a += x * x;
                    norm_b += y * y;
                }
                if norm_a == 0.0 || norm_b == 0.0 {
                    return 1.0;
                }
                let cosine = dot / (norm_a.sqrt() * norm_b.sqrt());
                (1.0 - cosine).clamp(0.0, 2.0) as f32
            }
            Self::Euclidean => a
                .iter()
                .zip(b.iter())
                .map(|(&x, &y)| (f64::from(x) - f64::from(y)).powi(2))
                .sum::<f64>()
                .sqrt() as f32,
        }
    }

    /// Distance matrix of shape `(num_embeddings, num_references)`.
    ///
    /// # Errors
    ///
    /// Returns [`ExplainError::Configuration`] if the embedding and reference
    /// dimensionalities differ.
    pub fn distance_matrix(
        &self,
        embeddings: ArrayView2<'_, f32>,
        references: ArrayView2<'_, f32>,
    ) -> Result<Array2<f32>> {
        if embeddings.ncols() != references.ncols() {
            return Err(ExplainError::Configuration(format!(
                "embeddings have dimensionality {} but references have {}",
                embeddings.ncols(),
                references.ncols()
            )));
        }

        Ok(Array2::from_shape_fn(
            (embeddings.nrows(), references.nrows()),
            |(i, r)| self.distance(embeddings.row(i), references.row(r)),
        ))
    }
}
