use crate::model::ModelConfig;
use burn::nn::transformer::{TransformerEncoder, TransformerEncoderConfig, TransformerEncoderInput};
use burn::nn::{LayerNorm, LayerNormConfig, Linear, LinearConfig};
use burn::prelude::*;

/// Transformer regressor from engineered features to the target space
///
/// The one-hot identity block and the target-encoding block are embedded
/// separately, fused, and passed as a single token through the encoder.
#[derive(Module, Debug)]
pub struct PerturbationModel<B: Backend> {
    /// Embeds the one-hot identity columns
    sparse_embedding: Option<Linear<B>>,
    /// Embeds the target-encoding columns
    encoding_embedding: Option<Linear<B>>,
    /// Projects the concatenated embeddings back to `d_model`
    fuse: Linear<B>,
    input_norm: LayerNorm<B>,
    encoder: TransformerEncoder<B>,
    output_norm: LayerNorm<B>,
    head: Linear<B>,
    sparse_width: usize,
    encoding_width: usize,
}

impl<B: Backend> PerturbationModel<B> {
    /// Forward pass: `[batch, input_width]` to `[batch, n_outputs]`
    pub fn forward(&self, input: Tensor<B, 2>) -> Tensor<B, 2> {
        let [batch, _] = input.dims();
        let mut embedded = Vec::with_capacity(2);

        if let Some(embedding) = &self.sparse_embedding {
            let sparse = input.clone().slice([0..batch, 0..self.sparse_width]);
            embedded.push(embedding.forward(sparse));
        }
        if let Some(embedding) = &self.encoding_embedding {
            let start = self.sparse_width;
            let encodings = input.slice([0..batch, start..start + self.encoding_width]);
            embedded.push(embedding.forward(encodings));
        }

        let x = self.fuse.forward(Tensor::cat(embedded, 1));
        let x = self.input_norm.forward(x);

        // One token per sample
        let x = self
            .encoder
            .forward(TransformerEncoderInput::new(x.unsqueeze_dim::<3>(1)))
            .squeeze::<2>(1);

        let x = self.output_norm.forward(x);
        self.head.forward(x)
    }

    pub fn input_width(&self) -> usize {
        self.sparse_width + self.encoding_width
    }
}

/// Initialize the model from configuration
pub fn init_model<B: Backend>(config: &ModelConfig, device: &B::Device) -> PerturbationModel<B> {
    let sparse_embedding = (config.sparse_width > 0)
        .then(|| LinearConfig::new(config.sparse_width, config.d_model).init(device));
    let encoding_embedding = (config.encoding_width > 0)
        .then(|| LinearConfig::new(config.encoding_width, config.d_model).init(device));
    let n_blocks = usize::from(config.sparse_width > 0) + usize::from(config.encoding_width > 0);

    let fuse = LinearConfig::new(n_blocks * config.d_model, config.d_model).init(device);
    let encoder = TransformerEncoderConfig::new(config.d_model, config.d_ff, config.n_heads, config.n_layers)
        .with_dropout(config.dropout)
        .init(device);

    PerturbationModel {
        sparse_embedding,
        encoding_embedding,
        fuse,
        input_norm: LayerNormConfig::new(config.d_model).init(device),
        encoder,
        output_norm: LayerNormConfig::new(config.d_model).init(device),
        head: LinearConfig::new(config.d_model, config.n_outputs).init(device),
        sparse_width: config.sparse_width,
        encoding_width: config.encoding_width,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    fn small_config(sparse: usize, encoding: usize, outputs: usize) -> ModelConfig {
        ModelConfig::new(sparse, encoding, outputs)
            .with_d_model(16)
            .with_n_heads(2)
            .with_n_layers(1)
            .with_d_ff(32)
            .with_dropout(0.0)
    }

    #[test]
    fn test_model_forward_shape() {
        let device = <TestBackend as Backend>::Device::default();
        let model = init_model::<TestBackend>(&small_config(6, 12, 4), &device);
        assert_eq!(model.input_width(), 18);

        let input = Tensor::<TestBackend, 2>::zeros([3, 18], &device);
        let output = model.forward(input);
        assert_eq!(output.dims(), [3, 4]);
    }

    #[test]
    fn test_model_without_encodings() {
        let device = <TestBackend as Backend>::Device::default();
        let model = init_model::<TestBackend>(&small_config(5, 0, 2), &device);

        let input = Tensor::<TestBackend, 2>::ones([2, 5], &device);
        assert_eq!(model.forward(input).dims(), [2, 2]);
    }
}
