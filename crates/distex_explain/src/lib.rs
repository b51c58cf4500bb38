//! # distex_explain
//!
//! Masking-based explanations of distances in an embedded space.
//!
//! Given a model that embeds inputs, an input and one or more reference
//! points in the embedded space, a [`DistanceExplainer`] tells which regions
//! of the input make its embedding close to (or far from) each reference.
//!
//! This crate provides:
//! - [`MaskGenerator`] for seeded random masks with soft edges
//! - [`Baseline`] values for occluded regions
//! - [`PerturbationEvaluator`] to embed masked inputs in batches
//! - [`DistanceMetric`] for cosine and Euclidean distances
//! - [`Aggregator`] turning per-mask distances into [`AttributionMap`]s
//! - Progress notifications and cancellation
//!
//! ## Example
//!
//! ```rust
//! use distex_core::AxisRoles;
//! use distex_explain::{DistanceExplainer, ExplainerConfig, MaskSampling};
//! use ndarray::{arr2, Array2, ArrayD, Axis, IxDyn};
//!
//! // Channels-first 2 x 8 x 8 input
//! let config = ExplainerConfig::default()
//!     .with_num_masks(100)
//!     .with_cell_size(4usize)
//!     .with_mask_sampling(MaskSampling::Uniform)
//!     .with_axis_roles(AxisRoles::channels_at(0));
//!
//! let mut model = |batch: &ArrayD<f32>| {
//!     let n = batch.len_of(Axis(0));
//!     Array2::from_shape_fn((n, 2), |(i, c)| {
//!         batch.index_axis(Axis(0), i).index_axis(Axis(0), c).sum()
//!     })
//! };
//!
//! let input = ArrayD::from_elem(IxDyn(&[2, 8, 8]), 1.0);
//! let references = arr2(&[[64.0f32, 0.0]]);
//! let result = DistanceExplainer::new(config)
//!     .explain(&mut model, &input, references.view())
//!     .unwrap();
//! assert_eq!(result.maps[0].shape(), &[8, 8]);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

mod aggregate;
mod baseline;
mod config;
mod distance;
mod error;
mod explainer;
mod masks;
mod perturb;
mod progress;

pub use aggregate::{
    AggregationStrategy, Aggregator, AttributionMap, Normalization, SelectionRange,
    SelectionStatistics, MIN_COVERAGE,
};
pub use baseline::Baseline;
pub use config::{CellSize, ExplainerConfig};
pub use distance::DistanceMetric;
pub use error::{ExplainError, Result};
pub use explainer::{DistanceExplainer, ExplanationResult, ResultQuality};
pub use masks::{MaskGenerator, MaskSampling, MaskSet};
pub use perturb::{Evaluation, PerturbationEvaluator, StopReason};
pub use progress::{progress_channel, CancellationToken, ProgressEvent, ProgressSender};
