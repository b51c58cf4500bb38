//! Baselines that replace the occluded part of the input.

use distex_core::InputLayout;
use ndarray::{ArrayD, Axis, IxDyn, Zip};
use serde::{Deserialize, Serialize};

use crate::error::{ExplainError, Result};

/// Value an occluded location is replaced with.
///
/// A perturbed sample is `input * mask + baseline * (1 - mask)`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Baseline {
    /// Occluded locations become zero.
    #[default]
    Zero,
    /// Occluded locations take a constant value.
    Constant(f32),
    /// Per-channel mean of the input over its spatial axes.
    Mean,
    /// Box blur of the input over its spatial axes.
    Blur {
        /// Half width of the averaging window, in locations.
        radius: usize,
    },
    /// Caller supplied array with exactly the input's shape.
    Custom(ArrayD<f32>),
}

impl Baseline {
    /// Materialize the baseline for an input.
    ///
    /// # Errors
    ///
    /// Returns [`ExplainError::Configuration`] if a custom baseline does not
    /// match the input shape or contains non-finite values.
    pub fn resolve(&self, input: &ArrayD<f32>, layout: &InputLayout) -> Result<ArrayD<f32>> {
        let shape = input.raw_dim();
        match self {
            Self::Zero => Ok(ArrayD::zeros(shape)),
            Self::Constant(value) => Ok(ArrayD::from_elem(shape, *value)),
            Self::Mean => Ok(channel_mean(input, layout)),
            Self::Blur { radius } => Ok(layout
                .spatial_axes()
                .iter()
                .fold(input.clone(), |acc, &axis| box_blur_axis(&acc, axis, *radius))),
            Self::Custom(array) => {
                if array.shape() != input.shape() {
                    return Err(ExplainError::Configuration(format!(
                        "custom baseline shape {:?} does not match input shape {:?}",
                        array.shape(),
                        input.shape()
                    )));
                }
                if array.iter().any(|v| !v.is_finite()) {
                    return Err(ExplainError::Configuration(
                        "custom baseline contains non-finite values".to_string(),
                    ));
                }
                Ok(array.clone())
            }
        }
    }
}

fn channel_mean(input: &ArrayD<f32>, layout: &InputLayout) -> ArrayD<f32> {
    let Some(channel_axis) = layout.channel_axis() else {
        return ArrayD::from_elem(input.raw_dim(), input.mean().unwrap_or(0.0));
    };

    let mut out = ArrayD::<f32>::zeros(input.raw_dim());
    for (channel, mut dst) in out.axis_iter_mut(Axis(channel_axis)).enumerate() {
        let mean = input
            .index_axis(Axis(channel_axis), channel)
            .mean()
            .unwrap_or(0.0);
        dst.fill(mean);
    }
    out
}

/// Moving average along one axis; the window shrinks at the edges.
fn box_blur_axis(input: &ArrayD<f32>, axis: usize, radius: usize) -> ArrayD<f32> {
    if radius == 0 {
        return input.clone();
    }

    let mut out = ArrayD::<f32>::zeros(IxDyn(input.shape()));
    Zip::from(out.lanes_mut(Axis(axis)))
        .and(input.lanes(Axis(axis)))
        .for_each(|mut dst, src| {
            let len = src.len();
            for (i, value) in dst.iter_mut().enumerate() {
                let lo = i.saturating_sub(radius);
                let hi = (i + radius + 1).min(len);
                let window = src.slice(ndarray::s![lo..hi]);
                *value = window.sum() / (hi - lo) as f32;
            }
        });
    out
}
