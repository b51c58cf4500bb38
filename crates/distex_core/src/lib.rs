//! # distex_core
//!
//! Core types and traits for distex distance explanations.
//!
//! This crate provides:
//! - [`Seed`] for deterministic random number generation
//! - [`AxisRoles`] and [`InputLayout`] for explicit axis roles of an input
//! - [`EmbeddingModel`], the capability an explained model must offer
//! - [`BurnEmbedder`] to explain Burn models
//! - Error types
//!
//! ## Layout Convention
//!
//! A sample is an n-dimensional array with at most one channel axis; every
//! other axis is spatial. Models receive batches with a leading batch axis
//! followed by the sample axes in their original order.
//!
//! ## Example
//!
//! ```rust
//! use distex_core::{AxisRoles, Seed};
//!
//! let seed = Seed::new(42);
//! let layout = AxisRoles::channels_at(0).resolve(&[3, 224, 224]).unwrap();
//! assert_eq!(layout.spatial_shape(), vec![224, 224]);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

mod error;
mod layout;
mod model;
mod seed;

pub use error::{CoreError, Result};
pub use layout::{AxisRole, AxisRoles, InputLayout};
pub use model::{BurnEmbedder, EmbeddingModel};
pub use seed::Seed;

/// Backend type aliases for convenience
pub mod backend {
    #[cfg(feature = "backend-ndarray")]
    pub use burn_ndarray::NdArray;
}
