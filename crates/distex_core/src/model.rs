//! The embedding model capability.
//!
//! The explainer treats the model as an opaque function from a batch of
//! samples to a batch of embeddings. Anything that implements
//! [`EmbeddingModel`] can be explained: plain closures over ndarray batches,
//! or Burn models through [`BurnEmbedder`].

use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};
use ndarray::{Array2, ArrayD};

use crate::error::{CoreError, Result};

/// A model that maps a batch of samples into an embedded space.
///
/// The batch has a leading batch axis followed by the sample axes, in the
/// sample's own axis order. The output must hold one embedding per sample,
/// shaped `(batch, dim)`.
pub trait EmbeddingModel {
    /// Embed a batch of samples.
    ///
    /// # Errors
    ///
    /// Implementations return an error when the model cannot run on the batch.
    fn embed(&mut self, batch: &ArrayD<f32>) -> Result<Array2<f32>>;
}

impl<F> EmbeddingModel for F
where
    F: FnMut(&ArrayD<f32>) -> Array2<f32>,
{
    fn embed(&mut self, batch: &ArrayD<f32>) -> Result<Array2<f32>> {
        Ok(self(batch))
    }
}

/// Adapter running a Burn forward function as an [`EmbeddingModel`].
///
/// `D` is the rank of the batched input tensor, e.g. 4 for
/// `(batch, channels, height, width)` images.
///
/// # Example
///
/// ```rust,ignore
/// use distex_core::BurnEmbedder;
///
/// let encoder = EncoderConfig::new(512).init::<NdArray>(&device);
/// let model = BurnEmbedder::<NdArray, _, 4>::new(move |x| encoder.forward(x), device);
/// ```
pub struct BurnEmbedder<B: Backend, F, const D: usize> {
    forward: F,
    device: B::Device,
}

impl<B: Backend, F, const D: usize> BurnEmbedder<B, F, D>
where
    F: FnMut(Tensor<B, D>) -> Tensor<B, 2>,
{
    /// Wrap a forward function running on `device`.
    pub fn new(forward: F, device: B::Device) -> Self {
        Self { forward, device }
    }

    /// Device the batches are moved to.
    pub fn device(&self) -> &B::Device {
        &self.device
    }
}

impl<B: Backend, F, const D: usize> EmbeddingModel for BurnEmbedder<B, F, D>
where
    F: FnMut(Tensor<B, D>) -> Tensor<B, 2>,
{
    fn embed(&mut self, batch: &ArrayD<f32>) -> Result<Array2<f32>> {
        if batch.ndim() != D {
            return Err(CoreError::DimensionError {
                expected: D,
                got: batch.ndim(),
            });
        }

        // Logical (row-major) order regardless of the array's memory layout
        let values: Vec<f32> = batch.iter().copied().collect();
        let data = TensorData::new(values, batch.shape().to_vec());
        let input = Tensor::<B, D>::from_data(data, &self.device);

        let output = (self.forward)(input);
        let [n, dim] = output.dims();
        let output_data = output.into_data().convert::<f32>();
        let values: Vec<f32> = output_data
            .as_slice()
            .map_err(|e| CoreError::ModelError(format!("Failed to read embeddings: {e:?}")))?
            .to_vec();

        Array2::from_shape_vec((n, dim), values).map_err(|e| CoreError::InvalidShape {
            expected: format!("({n}, {dim}) embeddings"),
            got: e.to_string(),
        })
    }
}
