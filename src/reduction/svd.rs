//! Truncated SVD of the standardised target matrix.
//!
//! The decomposition itself is faer's thin SVD; this module keeps the leading
//! right singular vectors as serialisable `ndarray` rows.

use crate::error::EnsembleError;
use anyhow::Result;
use faer::linalg::solvers::Svd;
use faer::Mat;
use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Squared singular values this far below the leading one count as rank collapse.
const RANK_TOLERANCE: f64 = 1e-9;

/// Orthonormal projection onto the leading singular directions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelReducer {
    /// `n_components x n_genes`, rows orthonormal.
    pub components: Array2<f64>,
    pub singular_values: Vec<f64>,
}

impl LabelReducer {
    /// Fit `n_components` directions on the rows of `data`.
    ///
    /// Component signs are fixed so the largest-magnitude loading of each row
    /// is positive.
    pub fn fit(data: ArrayView2<f64>, n_components: usize) -> Result<Self> {
        let (n, g) = data.dim();
        if n_components == 0 || n_components > n.min(g) {
            return Err(EnsembleError::configuration(format!(
                "cannot extract {} components from a {}x{} matrix",
                n_components, n, g
            ))
            .into());
        }

        let matrix = Mat::<f64>::from_fn(n, g, |i, j| data[[i, j]]);
        let svd = Svd::new_thin(matrix.as_ref())
            .map_err(|e| EnsembleError::numeric(format!("SVD did not converge: {:?}", e)))?;
        let s = svd.S().column_vector();
        let v = svd.V();

        let singular_values: Vec<f64> = (0..n_components).map(|i| s[i]).collect();
        let leading = singular_values[0];
        for (i, &sigma) in singular_values.iter().enumerate() {
            let lambda = sigma * sigma;
            if !lambda.is_finite() || lambda <= 0.0 || lambda < RANK_TOLERANCE * leading * leading {
                return Err(EnsembleError::numeric(format!(
                    "target matrix is rank-deficient: component {} has singular value {:.3e}",
                    i, sigma
                ))
                .into());
            }
        }

        let mut components = Array2::<f64>::from_shape_fn((n_components, g), |(i, j)| v[(j, i)]);
        for mut row in components.rows_mut() {
            let pivot = row.iter().fold(0.0f64, |acc, &x| if x.abs() > acc.abs() { x } else { acc });
            if pivot < 0.0 {
                row.mapv_inplace(|x| -x);
            }
        }

        debug!(
            "Truncated SVD: {} components, leading singular value {:.4}",
            n_components, leading
        );
        Ok(Self { components, singular_values })
    }

    pub fn n_components(&self) -> usize {
        self.components.nrows()
    }

    pub fn n_features(&self) -> usize {
        self.components.ncols()
    }

    /// Project rows onto the components.
    pub fn transform(&self, data: ArrayView2<f64>) -> Result<Array2<f64>> {
        if data.ncols() != self.n_features() {
            return Err(EnsembleError::configuration(format!(
                "reducer expects {} columns, got {}",
                self.n_features(),
                data.ncols()
            ))
            .into());
        }
        Ok(data.dot(&self.components.t()))
    }

    /// Map reduced rows back to gene space.
    pub fn inverse_transform(&self, reduced: ArrayView2<f64>) -> Result<Array2<f64>> {
        if reduced.ncols() != self.n_components() {
            return Err(EnsembleError::configuration(format!(
                "reducer expects {} components, got {}",
                self.n_components(),
                reduced.ncols()
            ))
            .into());
        }
        Ok(reduced.dot(&self.components))
    }
}
