pub mod architecture;
pub mod checkpoint;
pub mod loss;

use crate::data::FeatureLayout;
use crate::error::EnsembleError;
use anyhow::Result;
use burn::prelude::*;
use burn::tensor::TensorData;

/// Model configuration
///
/// The input layout is required; everything else has a default matching the
/// canonical ensemble members.
#[derive(Config, Debug)]
pub struct ModelConfig {
    /// Width of the one-hot identity block at the start of each row
    pub sparse_width: usize,

    /// Width of the target-encoding block that follows it
    pub encoding_width: usize,

    /// Output width: reduced components, or the full gene panel
    pub n_outputs: usize,

    /// Embedding width
    #[config(default = "128")]
    pub d_model: usize,

    /// Attention heads per encoder layer
    #[config(default = "8")]
    pub n_heads: usize,

    /// Number of encoder layers
    #[config(default = "6")]
    pub n_layers: usize,

    /// Hidden width of the position-wise feed-forward block
    #[config(default = "2048")]
    pub d_ff: usize,

    /// Dropout rate
    #[config(default = "0.3")]
    pub dropout: f64,
}

impl ModelConfig {
    /// Configuration for features laid out as `layout`
    pub fn for_layout(layout: FeatureLayout, n_outputs: usize, d_model: usize) -> Self {
        Self::new(layout.sparse_width, layout.encoding_width, n_outputs).with_d_model(d_model)
    }

    /// Expected feature width of every input row
    pub fn input_width(&self) -> usize {
        self.sparse_width + self.encoding_width
    }

    pub fn validate(&self) -> Result<()> {
        if self.input_width() == 0 {
            return Err(EnsembleError::configuration("model input width is zero").into());
        }
        if self.n_outputs == 0 {
            return Err(EnsembleError::configuration("model output width is zero").into());
        }
        if self.d_model == 0 || self.n_heads == 0 || self.d_model % self.n_heads != 0 {
            return Err(EnsembleError::configuration(format!(
                "d_model ({}) must be a positive multiple of n_heads ({})",
                self.d_model, self.n_heads
            ))
            .into());
        }
        crate::utils::validation::in_range(self.dropout, 0.0, 1.0, "dropout")?;
        Ok(())
    }
}

/// Copy a row-major matrix onto `device`
pub fn to_tensor<B: Backend>(array: ndarray::ArrayView2<f32>, device: &B::Device) -> Tensor<B, 2> {
    let (rows, cols) = array.dim();
    let values: Vec<f32> = array.iter().copied().collect();
    Tensor::from_data(TensorData::new(values, [rows, cols]), device)
}

/// Read a 2-D tensor back into a matrix
pub fn to_array<B: Backend>(tensor: Tensor<B, 2>) -> Result<ndarray::Array2<f32>> {
    let [rows, cols] = tensor.dims();
    let values = tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| anyhow::anyhow!("failed to read tensor data: {:?}", e))?;
    Ok(ndarray::Array2::from_shape_vec((rows, cols), values)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use ndarray::array;

    #[test]
    fn test_tensor_conversion_keeps_row_order() {
        let device = Default::default();
        let matrix = array![[1.0f32, 2.0, 3.0], [4.0, 5.0, 6.0]];
        let tensor = to_tensor::<NdArray<f32>>(matrix.view(), &device);
        assert_eq!(tensor.dims(), [2, 3]);
        assert_eq!(to_array(tensor).unwrap(), matrix);

        // Transposed views are copied in logical order
        let transposed = to_tensor::<NdArray<f32>>(matrix.t(), &device);
        assert_eq!(to_array(transposed).unwrap(), matrix.t().to_owned());
    }

    #[test]
    fn test_defaults_and_layout() {
        let layout = FeatureLayout { sparse_width: 10, encoding_width: 40 };
        let config = ModelConfig::for_layout(layout, 5, 64);
        assert_eq!(config.input_width(), 50);
        assert_eq!(config.d_model, 64);
        assert_eq!(config.n_heads, 8);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_heads_must_divide_d_model() {
        let config = ModelConfig::new(4, 4, 2).with_d_model(30).with_n_heads(8);
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EnsembleError>(),
            Some(EnsembleError::Configuration(_))
        ));
    }
}
