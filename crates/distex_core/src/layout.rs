//! Axis roles and the resolved input layout.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// Role an input axis plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AxisRole {
    /// Channel axis. Masks are broadcast across it.
    Channels,
    /// Spatial axis. Masks vary along it.
    Spatial,
}

/// Mapping from axis index to [`AxisRole`], as found in configuration.
///
/// Axes not present in the mapping are spatial. An empty mapping therefore
/// describes an input without a channel axis.
///
/// # Example
///
/// ```rust
/// use distex_core::{AxisRole, AxisRoles};
///
/// // height x width x channels image
/// let roles = AxisRoles::channels_at(2);
/// let layout = roles.resolve(&[32, 32, 3]).unwrap();
/// assert_eq!(layout.spatial_shape(), vec![32, 32]);
/// assert_eq!(layout.channels(), 3);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AxisRoles(BTreeMap<usize, AxisRole>);

impl AxisRoles {
    /// Create an empty mapping (all axes spatial).
    #[must_use]
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Create a mapping with a single channel axis.
    #[must_use]
    pub fn channels_at(axis: usize) -> Self {
        Self::new().with(axis, AxisRole::Channels)
    }

    /// Set the role of an axis.
    #[must_use]
    pub fn with(mut self, axis: usize, role: AxisRole) -> Self {
        self.0.insert(axis, role);
        self
    }

    /// Get the explicitly configured role of an axis.
    #[must_use]
    pub fn get(&self, axis: usize) -> Option<AxisRole> {
        self.0.get(&axis).copied()
    }

    /// Iterate over the configured `(axis, role)` pairs in axis order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, AxisRole)> + '_ {
        self.0.iter().map(|(&axis, &role)| (axis, role))
    }

    /// Resolve the roles against a concrete input shape.
    ///
    /// # Errors
    ///
    /// Returns an error if an index is out of range, more than one channel
    /// axis is configured, no spatial axis remains, or any axis is empty.
    pub fn resolve(&self, shape: &[usize]) -> Result<InputLayout> {
        if shape.is_empty() {
            return Err(CoreError::InvalidAxisRoles(
                "input must have at least one axis".to_string(),
            ));
        }
        if let Some(axis) = shape.iter().position(|&len| len == 0) {
            return Err(CoreError::InvalidShape {
                expected: "non-empty axes".to_string(),
                got: format!("axis {axis} of {shape:?} has length 0"),
            });
        }

        let mut channel_axis = None;
        for (axis, role) in self.iter() {
            if axis >= shape.len() {
                return Err(CoreError::InvalidAxisRoles(format!(
                    "axis {axis} is out of range for input with {} axes",
                    shape.len()
                )));
            }
            if role == AxisRole::Channels {
                if let Some(previous) = channel_axis {
                    return Err(CoreError::InvalidAxisRoles(format!(
                        "axes {previous} and {axis} are both marked as channels"
                    )));
                }
                channel_axis = Some(axis);
            }
        }

        let spatial_axes: Vec<usize> = (0..shape.len())
            .filter(|&axis| Some(axis) != channel_axis)
            .collect();
        if spatial_axes.is_empty() {
            return Err(CoreError::InvalidAxisRoles(
                "input needs at least one spatial axis".to_string(),
            ));
        }

        Ok(InputLayout {
            shape: shape.to_vec(),
            channel_axis,
            spatial_axes,
        })
    }
}

/// Input layout resolved once from [`AxisRoles`].
///
/// Spatial axes keep the order they have in the input, so a mask of
/// [`spatial_shape`](Self::spatial_shape) lines up with the input once a
/// unit axis is inserted at the channel position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputLayout {
    shape: Vec<usize>,
    channel_axis: Option<usize>,
    spatial_axes: Vec<usize>,
}

impl InputLayout {
    /// Full input shape.
    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Number of input axes.
    #[must_use]
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Index of the channel axis, if any.
    #[must_use]
    pub const fn channel_axis(&self) -> Option<usize> {
        self.channel_axis
    }

    /// Indices of the spatial axes, in input order.
    #[must_use]
    pub fn spatial_axes(&self) -> &[usize] {
        &self.spatial_axes
    }

    /// Shape of the input with the channel axis removed.
    #[must_use]
    pub fn spatial_shape(&self) -> Vec<usize> {
        self.spatial_axes.iter().map(|&axis| self.shape[axis]).collect()
    }

    /// Number of channels (1 when there is no channel axis).
    #[must_use]
    pub fn channels(&self) -> usize {
        self.channel_axis.map_or(1, |axis| self.shape[axis])
    }

    /// Number of spatial locations.
    #[must_use]
    pub fn num_locations(&self) -> usize {
        self.spatial_shape().iter().product()
    }

    /// Shape of a model batch: a leading batch axis followed by the input axes.
    #[must_use]
    pub fn batch_shape(&self, batch: usize) -> Vec<usize> {
        let mut dims = Vec::with_capacity(self.shape.len() + 1);
        dims.push(batch);
        dims.extend_from_slice(&self.shape);
        dims
    }

    /// Check that a sample has exactly this layout's shape.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ShapeMismatch`] if the shapes differ.
    pub fn check(&self, shape: &[usize]) -> Result<()> {
        if shape != self.shape.as_slice() {
            return Err(CoreError::ShapeMismatch(format!(
                "expected sample shape {:?}, got {shape:?}",
                self.shape
            )));
        }
        Ok(())
    }
}

impl std::fmt::Display for InputLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "(")?;
        for (axis, len) in self.shape.iter().enumerate() {
            if axis > 0 {
                write!(f, ", ")?;
            }
            if Some(axis) == self.channel_axis {
                write!(f, "C={len}")?;
            } else {
                write!(f, "S={len}")?;
            }
        }
        write!(f, ")")
    }
}
