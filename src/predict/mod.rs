pub mod baseline;
pub mod predictor;

use crate::data::loader::write_prediction;
use crate::error::EnsembleError;
use crate::model::loss::metrics;
use anyhow::Result;
use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Gene-space predictions, one row per unseen pair in id-map order
#[derive(Debug, Clone, PartialEq)]
pub struct PredictionMatrix {
    pub values: Array2<f32>,
}

impl PredictionMatrix {
    pub fn new(values: Array2<f32>) -> Self {
        Self { values }
    }

    /// All-zero prediction
    pub fn zeros(n_rows: usize, n_genes: usize) -> Self {
        Self::new(Array2::zeros((n_rows, n_genes)))
    }

    pub fn n_rows(&self) -> usize {
        self.values.nrows()
    }

    pub fn n_genes(&self) -> usize {
        self.values.ncols()
    }

    pub fn shape(&self) -> (usize, usize) {
        self.values.dim()
    }

    pub fn view(&self) -> ArrayView2<'_, f32> {
        self.values.view()
    }

    /// Write with an `id` column and one column per gene
    pub fn save<P: AsRef<Path>>(&self, path: P, ids: &[String], genes: &[String]) -> Result<()> {
        write_prediction(path, ids, genes, &self.values)
    }
}

/// Agreement of a prediction with ground truth
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ScoreReport {
    /// Number of scored rows
    pub n_rows: usize,
    /// Number of scored genes
    pub n_genes: usize,
    /// Mean row-wise Pearson correlation
    pub mean_pearson: f64,
    /// Mean row-wise Spearman correlation
    pub mean_spearman: f64,
    /// Mean row-wise root mean squared error
    pub mrrmse: f64,
}

impl ScoreReport {
    /// Score `prediction` against `truth`; both must have the same shape
    pub fn compute(prediction: ArrayView2<f32>, truth: ArrayView2<f32>) -> Result<Self> {
        if prediction.dim() != truth.dim() {
            return Err(EnsembleError::configuration(format!(
                "prediction is {:?} but ground truth is {:?}",
                prediction.dim(),
                truth.dim()
            ))
            .into());
        }
        Ok(Self {
            n_rows: truth.nrows(),
            n_genes: truth.ncols(),
            mean_pearson: metrics::mean_pearson(prediction, truth),
            mean_spearman: metrics::mean_spearman(prediction, truth),
            mrrmse: metrics::mrrmse(prediction, truth),
        })
    }

    /// Print summary to stdout
    pub fn print(&self) {
        println!("\n=== Score Summary ===");
        println!("Rows scored: {}", self.n_rows);
        println!("Genes scored: {}", self.n_genes);
        println!("Mean Pearson: {:.4}", self.mean_pearson);
        println!("Mean Spearman: {:.4}", self.mean_spearman);
        println!("MRRMSE: {:.4}", self.mrrmse);
        println!("=====================\n");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    #[test]
    fn test_prediction_matrix_shape() {
        let prediction = PredictionMatrix::zeros(3, 4);
        assert_eq!(prediction.n_rows(), 3);
        assert_eq!(prediction.n_genes(), 4);
        assert!(prediction.values.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_score_perfect_prediction() {
        let truth = array![[1.0f32, 2.0, 3.0], [3.0, 1.0, 2.0]];
        let report = ScoreReport::compute(truth.view(), truth.view()).unwrap();
        assert_relative_eq!(report.mean_pearson, 1.0, epsilon = 1e-9);
        assert_relative_eq!(report.mean_spearman, 1.0, epsilon = 1e-9);
        assert_relative_eq!(report.mrrmse, 0.0);
        assert_eq!(report.n_rows, 2);
    }

    #[test]
    fn test_score_shape_mismatch() {
        let a = Array2::<f32>::zeros((2, 3));
        let b = Array2::<f32>::zeros((3, 3));
        let err = ScoreReport::compute(a.view(), b.view()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EnsembleError>(),
            Some(EnsembleError::Configuration(_))
        ));
    }

    #[test]
    fn test_save_writes_ids_and_genes() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("out").join("prediction.csv");
        let prediction = PredictionMatrix::new(array![[0.5f32, -1.0]]);
        prediction
            .save(&path, &["0".to_string()], &["A1BG".to_string(), "TP53".to_string()])
            .unwrap();

        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.starts_with("id,A1BG,TP53"));
        assert!(written.contains("0,0.5,-1"));
    }
}
