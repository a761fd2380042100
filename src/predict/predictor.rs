use crate::error::EnsembleError;
use crate::model::checkpoint::TrainedArtifact;
use crate::model::{to_array, to_tensor};
use crate::predict::PredictionMatrix;
use anyhow::Result;
use burn::prelude::*;
use ndarray::{s, Array2};
use tracing::debug;

/// Batched inference over unseen feature rows
pub struct Predictor<B: Backend> {
    batch_size: usize,
    device: B::Device,
}

impl<B: Backend> Predictor<B> {
    /// Create a predictor with the default batch size of 256
    pub fn new(device: B::Device) -> Self {
        Self {
            batch_size: 256,
            device,
        }
    }

    /// Set batch size
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Predict gene-space signatures for `features`
    ///
    /// Rows are processed in fixed-size batches in order, so output row `i`
    /// always belongs to input row `i`. The inverse transform is applied only
    /// when the artifact carries one.
    pub fn predict(&self, features: &Array2<f32>, artifact: &TrainedArtifact<B>) -> Result<PredictionMatrix> {
        if self.batch_size == 0 {
            return Err(EnsembleError::configuration("prediction batch_size must be positive").into());
        }
        let expected = artifact.model_config.input_width();
        if features.ncols() != expected {
            return Err(EnsembleError::configuration(format!(
                "unseen features have width {} but the model expects {}",
                features.ncols(),
                expected
            ))
            .into());
        }

        let n_rows = features.nrows();
        if n_rows == 0 {
            return Ok(PredictionMatrix::zeros(0, artifact.n_genes()));
        }

        let mut reduced = Array2::<f32>::zeros((n_rows, artifact.model_config.n_outputs));
        for start in (0..n_rows).step_by(self.batch_size) {
            let end = (start + self.batch_size).min(n_rows);
            let input = to_tensor::<B>(features.slice(s![start..end, ..]), &self.device);
            let output = artifact.model.forward(input);
            reduced.slice_mut(s![start..end, ..]).assign(&to_array(output)?);
        }
        debug!("Predicted {} rows in batches of {}", n_rows, self.batch_size);

        let values = match &artifact.transform {
            Some(transform) => transform.inverse_transform(reduced.view())?,
            None => reduced,
        };
        Ok(PredictionMatrix::new(values))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::architecture::init_model;
    use crate::model::ModelConfig;
    use crate::reduction::fit_reduction;
    use crate::utils::random::seeded_rng;
    use approx::assert_abs_diff_eq;
    use burn::backend::NdArray;
    use rand::Rng;

    type TestBackend = NdArray<f32>;

    fn small_config(n_outputs: usize) -> ModelConfig {
        ModelConfig::new(2, 3, n_outputs)
            .with_d_model(8)
            .with_n_heads(2)
            .with_n_layers(1)
            .with_d_ff(16)
            .with_dropout(0.0)
    }

    fn random_matrix(rows: usize, cols: usize, seed: u64) -> Array2<f32> {
        let mut rng = seeded_rng(seed);
        Array2::from_shape_fn((rows, cols), |_| rng.gen::<f32>())
    }

    fn artifact(transformed: bool) -> TrainedArtifact<TestBackend> {
        let device = Default::default();
        let (transform, n_outputs) = if transformed {
            let (transform, _) = fit_reduction(random_matrix(10, 6, 1).view(), 3).unwrap();
            (transform, 3)
        } else {
            (None, 6)
        };
        let config = small_config(n_outputs);
        TrainedArtifact {
            transform,
            model: init_model(&config, &device),
            model_config: config,
        }
    }

    #[test]
    fn test_batched_prediction_preserves_row_order() {
        let artifact = artifact(false);
        let features = random_matrix(5, 5, 2);

        let batched = Predictor::<TestBackend>::new(Default::default())
            .with_batch_size(2)
            .predict(&features, &artifact)
            .unwrap();
        let single = Predictor::<TestBackend>::new(Default::default())
            .with_batch_size(5)
            .predict(&features, &artifact)
            .unwrap();

        assert_eq!(batched.shape(), (5, 6));
        for (a, b) in batched.values.iter().zip(single.values.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-5);
        }

        // each row on its own gives the same answer as in the batch
        for row in 0..5 {
            let one = features.slice(s![row..row + 1, ..]).to_owned();
            let alone = Predictor::<TestBackend>::new(Default::default())
                .predict(&one, &artifact)
                .unwrap();
            for (a, b) in alone.values.row(0).iter().zip(batched.values.row(row).iter()) {
                assert_abs_diff_eq!(a, b, epsilon = 1e-5);
            }
        }
    }

    #[test]
    fn test_inverse_transform_restores_gene_width() {
        let artifact = artifact(true);
        let prediction = Predictor::<TestBackend>::new(Default::default())
            .predict(&random_matrix(4, 5, 3), &artifact)
            .unwrap();
        assert_eq!(prediction.shape(), (4, 6));
    }

    #[test]
    fn test_empty_input_gives_empty_matrix() {
        let artifact = artifact(true);
        let prediction = Predictor::<TestBackend>::new(Default::default())
            .predict(&Array2::zeros((0, 5)), &artifact)
            .unwrap();
        assert_eq!(prediction.shape(), (0, 6));
    }

    #[test]
    fn test_width_mismatch_is_configuration_error() {
        let artifact = artifact(false);
        let err = Predictor::<TestBackend>::new(Default::default())
            .predict(&random_matrix(3, 4, 4), &artifact)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EnsembleError>(),
            Some(EnsembleError::Configuration(_))
        ));
    }
}
