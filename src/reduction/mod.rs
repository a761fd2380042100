//! Label reduction: standardise the gene panel, then project it onto a
//! truncated SVD basis.
//!
//! Fitting only ever sees training rows. When the requested rank equals the
//! gene panel width no transform is fitted at all and targets flow through
//! unchanged.

pub mod scaler;
pub mod svd;

pub use scaler::StandardScaler;
pub use svd::LabelReducer;

use crate::error::EnsembleError;
use anyhow::Result;
use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Fitted scaler and reducer pair. Both exist or neither does.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetTransform {
    pub scaler: StandardScaler,
    pub reducer: LabelReducer,
}

impl TargetTransform {
    pub fn n_components(&self) -> usize {
        self.reducer.n_components()
    }

    pub fn n_genes(&self) -> usize {
        self.scaler.n_features()
    }

    /// Gene space to reduced space
    pub fn transform(&self, targets: ArrayView2<f32>) -> Result<Array2<f32>> {
        let scaled = self.scaler.scale(targets)?;
        Ok(self.reducer.transform(scaled.view())?.mapv(|v| v as f32))
    }

    /// Reduced space back to gene space
    pub fn inverse_transform(&self, reduced: ArrayView2<f32>) -> Result<Array2<f32>> {
        let reduced = reduced.mapv(f64::from);
        let scaled = self.reducer.inverse_transform(reduced.view())?;
        self.scaler.unscale(scaled.view())
    }
}

/// Fit the label reduction on `targets` and return the reduced targets.
///
/// `n_components == n_genes` is the identity path: no transform, targets
/// returned as-is.
///
/// # Errors
///
/// `Configuration` for `n_components` of 0, above the gene count, or above
/// the sample count. `NumericInstability` for non-finite targets, constant
/// genes, or a rank-deficient fit.
pub fn fit_reduction(
    targets: ArrayView2<f32>,
    n_components: usize,
) -> Result<(Option<TargetTransform>, Array2<f32>)> {
    let (n_samples, n_genes) = targets.dim();

    if n_components == 0 {
        return Err(EnsembleError::configuration("n_components must be at least 1").into());
    }
    if n_components > n_genes {
        return Err(EnsembleError::configuration(format!(
            "n_components ({}) exceeds the gene panel ({})",
            n_components, n_genes
        ))
        .into());
    }
    if targets.iter().any(|v| !v.is_finite()) {
        return Err(EnsembleError::numeric("targets contain non-finite values").into());
    }
    if n_components == n_genes {
        info!("n_components equals the gene panel ({}); no label reduction", n_genes);
        return Ok((None, targets.to_owned()));
    }
    if n_components > n_samples {
        return Err(EnsembleError::configuration(format!(
            "n_components ({}) exceeds the number of training samples ({})",
            n_components, n_samples
        ))
        .into());
    }

    let scaler = StandardScaler::fit(targets)?;
    let scaled = scaler.scale(targets)?;
    let reducer = LabelReducer::fit(scaled.view(), n_components)?;
    let reduced = reducer.transform(scaled.view())?.mapv(|v| v as f32);

    info!(
        "Reduced {} genes to {} components on {} samples",
        n_genes, n_components, n_samples
    );
    Ok((Some(TargetTransform { scaler, reducer }), reduced))
}
