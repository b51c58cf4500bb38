//! # distex
//!
//! Explain distances in an embedded space with random masking.
//!
//! A model maps inputs (images, time series, volumes) to embedding vectors.
//! distex answers which regions of an input make its embedding close to a
//! reference point: random masks occlude parts of the input, the model embeds
//! every perturbed sample, and the distances to the reference points are
//! aggregated into one attribution map per reference.
//!
//! - **Core**: seeds, axis roles and the embedding model capability
//! - **Explain**: masks, baselines, distances, aggregation and the explainer
//!
//! ## Quick Start
//!
//! ```rust
//! use distex::prelude::*;
//! use ndarray::{arr2, Array2, ArrayD, Axis, IxDyn};
//!
//! let config = ExplainerConfig::default()
//!     .with_num_masks(200)
//!     .with_cell_size(2usize)
//!     .with_seed(42u64);
//!
//! // Embeds an 8 x 8 sample by its top half and bottom half sums
//! let mut model = |batch: &ArrayD<f32>| {
//!     let n = batch.len_of(Axis(0));
//!     Array2::from_shape_fn((n, 2), |(i, half)| {
//!         let sample = batch.index_axis(Axis(0), i);
//!         sample.iter().skip(half * 32).take(32).sum::<f32>()
//!     })
//! };
//!
//! let input = ArrayD::from_elem(IxDyn(&[8, 8]), 1.0);
//! let references = arr2(&[[32.0f32, 0.0]]);
//! let result = DistanceExplainer::new(config).explain(&mut model, &input, references.view())?;
//!
//! let map = &result.maps[0];
//! assert_eq!(map.shape(), &[8, 8]);
//! # Ok::<(), distex::explain::ExplainError>(())
//! ```
//!
//! ## Feature Flags
//!
//! - `backend-ndarray` (default): CPU backend for [`BurnEmbedder`](core::BurnEmbedder) models

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

// Re-export all crates
pub use distex_core as core;
pub use distex_explain as explain;

/// Prelude module for convenient imports.
///
/// ```rust
/// use distex::prelude::*;
/// ```
pub mod prelude {
    // Core types
    pub use distex_core::{AxisRole, AxisRoles, BurnEmbedder, EmbeddingModel, InputLayout, Seed};

    // Explain
    pub use distex_explain::{
        progress_channel, AggregationStrategy, AttributionMap, Baseline, CancellationToken,
        CellSize, DistanceExplainer, DistanceMetric, ExplainError, ExplainerConfig,
        ExplanationResult, MaskSampling, MaskSet, Normalization, ProgressEvent, ResultQuality,
    };
}

/// Everything, including the lower level building blocks.
pub mod all {
    pub use super::prelude::*;

    pub use distex_core::backend;
    pub use distex_explain::{
        Aggregator, Evaluation, MaskGenerator, PerturbationEvaluator, ProgressSender,
        SelectionRange, SelectionStatistics, StopReason,
    };
}
