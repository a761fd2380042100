//! Control predictors used as lower bounds when scoring.

use crate::error::EnsembleError;
use crate::predict::PredictionMatrix;
use anyhow::Result;
use ndarray::{ArrayView2, Axis};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Baseline {
    /// Every gene of every row is 0
    Zeros,
    /// Every row is the per-gene mean of the labelled table
    MeanOutcome,
}

impl Baseline {
    pub fn as_str(&self) -> &'static str {
        match self {
            Baseline::Zeros => "zeros",
            Baseline::MeanOutcome => "mean_outcome",
        }
    }

    /// Predict `n_rows` rows over the genes of `targets`
    pub fn predict(&self, targets: ArrayView2<f32>, n_rows: usize) -> Result<PredictionMatrix> {
        let n_genes = targets.ncols();
        match self {
            Baseline::Zeros => Ok(PredictionMatrix::zeros(n_rows, n_genes)),
            Baseline::MeanOutcome => {
                let mean = targets.mean_axis(Axis(0)).ok_or_else(|| {
                    EnsembleError::configuration("mean_outcome baseline needs at least one labelled row")
                })?;
                let values = mean
                    .broadcast((n_rows, n_genes))
                    .ok_or_else(|| EnsembleError::configuration("cannot broadcast gene means"))?
                    .to_owned();
                Ok(PredictionMatrix::new(values))
            }
        }
    }
}

impl std::str::FromStr for Baseline {
    type Err = EnsembleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "zeros" | "zero" => Ok(Baseline::Zeros),
            "mean_outcome" | "mean-outcome" | "mean" => Ok(Baseline::MeanOutcome),
            other => Err(EnsembleError::configuration(format!(
                "unknown baseline '{}' (expected 'zeros' or 'mean_outcome')",
                other
            ))),
        }
    }
}

impl std::fmt::Display for Baseline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array2};

    #[test]
    fn test_zeros() {
        let targets = array![[1.0f32, 2.0], [3.0, 4.0]];
        let prediction = Baseline::Zeros.predict(targets.view(), 3).unwrap();
        assert_eq!(prediction.values, Array2::<f32>::zeros((3, 2)));
    }

    #[test]
    fn test_mean_outcome_repeats_gene_means() {
        let targets = array![[1.0f32, 2.0], [3.0, 6.0]];
        let prediction = Baseline::MeanOutcome.predict(targets.view(), 2).unwrap();
        assert_eq!(prediction.values, array![[2.0f32, 4.0], [2.0, 4.0]]);
    }

    #[test]
    fn test_mean_outcome_without_rows() {
        let targets = Array2::<f32>::zeros((0, 2));
        assert!(Baseline::MeanOutcome.predict(targets.view(), 2).is_err());
    }

    #[test]
    fn test_parse() {
        assert_eq!("mean_outcome".parse::<Baseline>().unwrap(), Baseline::MeanOutcome);
        assert_eq!("Zeros".parse::<Baseline>().unwrap(), Baseline::Zeros);
        assert!("median".parse::<Baseline>().is_err());
    }
}
