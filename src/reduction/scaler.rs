//! Per-gene standardisation ahead of the low-rank projection.

use crate::error::EnsembleError;
use anyhow::Result;
use ndarray::{Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

/// Variance below which a gene counts as constant.
const MIN_VARIANCE: f64 = 1e-12;

/// Per-column mean and population standard deviation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandardScaler {
    pub mean: Vec<f64>,
    pub scale: Vec<f64>,
}

impl StandardScaler {
    /// Fit on the rows of `data`.
    ///
    /// # Errors
    ///
    /// `Configuration` on an empty matrix, `NumericInstability` on
    /// non-finite values or a constant column.
    pub fn fit(data: ArrayView2<f32>) -> Result<Self> {
        let (n, g) = data.dim();
        if n == 0 || g == 0 {
            return Err(EnsembleError::configuration(format!("cannot fit a scaler on a {}x{} matrix", n, g)).into());
        }
        if data.iter().any(|v| !v.is_finite()) {
            return Err(EnsembleError::numeric("targets contain non-finite values").into());
        }

        let mut mean = Vec::with_capacity(g);
        let mut scale = Vec::with_capacity(g);
        for (j, col) in data.axis_iter(Axis(1)).enumerate() {
            let m = col.iter().map(|&v| f64::from(v)).sum::<f64>() / n as f64;
            let var = col.iter().map(|&v| (f64::from(v) - m).powi(2)).sum::<f64>() / n as f64;
            if var < MIN_VARIANCE {
                return Err(EnsembleError::numeric(format!("target column {} has zero variance", j)).into());
            }
            mean.push(m);
            scale.push(var.sqrt());
        }
        Ok(Self { mean, scale })
    }

    pub fn n_features(&self) -> usize {
        self.mean.len()
    }

    fn check_width(&self, width: usize) -> Result<()> {
        if width != self.n_features() {
            return Err(EnsembleError::configuration(format!(
                "scaler fitted on {} columns, got {}",
                self.n_features(),
                width
            ))
            .into());
        }
        Ok(())
    }

    /// Standardise `data` into f64.
    pub fn scale(&self, data: ArrayView2<f32>) -> Result<Array2<f64>> {
        self.check_width(data.ncols())?;
        let mut out = data.mapv(f64::from);
        for (j, mut col) in out.axis_iter_mut(Axis(1)).enumerate() {
            let (m, s) = (self.mean[j], self.scale[j]);
            col.mapv_inplace(|v| (v - m) / s);
        }
        Ok(out)
    }

    /// Undo [`scale`](Self::scale).
    pub fn unscale(&self, data: ArrayView2<f64>) -> Result<Array2<f32>> {
        self.check_width(data.ncols())?;
        let mut out = Array2::<f32>::zeros(data.dim());
        for ((i, j), v) in data.indexed_iter() {
            out[[i, j]] = (v * self.scale[j] + self.mean[j]) as f32;
        }
        Ok(out)
    }
}
