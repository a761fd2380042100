use burn::nn::loss::{HuberLoss, HuberLossConfig, Reduction};

/// Huber loss over `delta`
///
/// Quadratic for residuals up to `delta`, linear beyond, so a handful of
/// extreme DE values cannot dominate the gradient. Callers reduce with
/// [`Reduction::Mean`].
pub fn huber_loss(delta: f32) -> HuberLoss {
    HuberLossConfig::new(delta).init()
}

/// Metrics for evaluation
pub mod metrics {
    use ndarray::{ArrayView1, ArrayView2};

    /// Mean over rows of the per-row root mean squared error
    pub fn mrrmse(predictions: ArrayView2<f32>, targets: ArrayView2<f32>) -> f64 {
        let n = predictions.nrows();
        if n == 0 || predictions.ncols() == 0 {
            return 0.0;
        }
        let total: f64 = predictions
            .rows()
            .into_iter()
            .zip(targets.rows())
            .map(|(p, t)| {
                let mse = p
                    .iter()
                    .zip(t.iter())
                    .map(|(&a, &b)| (f64::from(a) - f64::from(b)).powi(2))
                    .sum::<f64>()
                    / p.len() as f64;
                mse.sqrt()
            })
            .sum();
        total / n as f64
    }

    /// Pearson correlation; 0 when either side is constant
    pub fn pearson(a: &[f64], b: &[f64]) -> f64 {
        let n = a.len() as f64;
        if a.is_empty() {
            return 0.0;
        }
        let mean_a = a.iter().sum::<f64>() / n;
        let mean_b = b.iter().sum::<f64>() / n;

        let mut cov = 0.0;
        let mut var_a = 0.0;
        let mut var_b = 0.0;
        for (&x, &y) in a.iter().zip(b) {
            cov += (x - mean_a) * (y - mean_b);
            var_a += (x - mean_a).powi(2);
            var_b += (y - mean_b).powi(2);
        }

        if var_a <= f64::EPSILON || var_b <= f64::EPSILON {
            0.0
        } else {
            cov / (var_a.sqrt() * var_b.sqrt())
        }
    }

    /// Ordinal ranks; ties are broken by position
    pub fn ranks(values: ArrayView1<f32>) -> Vec<f64> {
        let mut order: Vec<usize> = (0..values.len()).collect();
        order.sort_by(|&i, &j| values[i].total_cmp(&values[j]));
        let mut ranks = vec![0.0; values.len()];
        for (rank, &i) in order.iter().enumerate() {
            ranks[i] = rank as f64;
        }
        ranks
    }

    /// Mean over rows of the Pearson correlation
    pub fn mean_pearson(predictions: ArrayView2<f32>, targets: ArrayView2<f32>) -> f64 {
        row_mean(predictions, targets, |p, t| {
            let p: Vec<f64> = p.iter().map(|&v| f64::from(v)).collect();
            let t: Vec<f64> = t.iter().map(|&v| f64::from(v)).collect();
            pearson(&p, &t)
        })
    }

    /// Mean over rows of the Spearman correlation
    ///
    /// A constant row scores 0 rather than correlating its positional ranks.
    pub fn mean_spearman(predictions: ArrayView2<f32>, targets: ArrayView2<f32>) -> f64 {
        row_mean(predictions, targets, |p, t| {
            if is_constant(p) || is_constant(t) {
                0.0
            } else {
                pearson(&ranks(p), &ranks(t))
            }
        })
    }

    fn is_constant(values: ArrayView1<f32>) -> bool {
        values.iter().all(|&v| v == values[0])
    }

    fn row_mean<F>(predictions: ArrayView2<f32>, targets: ArrayView2<f32>, score: F) -> f64
    where
        F: Fn(ArrayView1<f32>, ArrayView1<f32>) -> f64,
    {
        let n = predictions.nrows();
        if n == 0 {
            return 0.0;
        }
        let total: f64 = predictions
            .rows()
            .into_iter()
            .zip(targets.rows())
            .map(|(p, t)| score(p, t))
            .sum();
        total / n as f64
    }
}

#[cfg(test)]
mod tests {
    use super::metrics::*;
    use super::*;
    use approx::assert_abs_diff_eq;
    use burn::backend::NdArray;
    use burn::prelude::*;
    use ndarray::array;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_huber_loss_regions() {
        let device = <TestBackend as Backend>::Device::default();
        let predictions = Tensor::<TestBackend, 2>::from_floats([[0.5, 3.0]], &device);
        let targets = Tensor::<TestBackend, 2>::zeros([1, 2], &device);

        let loss: f32 = huber_loss(1.0)
            .forward(predictions, targets, Reduction::Mean)
            .into_scalar();
        // (0.5 * 0.25 + (3.0 - 0.5)) / 2
        assert_abs_diff_eq!(loss, 1.3125, epsilon = 1e-6);
    }

    #[test]
    fn test_huber_delta_moves_the_kink() {
        let device = <TestBackend as Backend>::Device::default();
        let predictions = Tensor::<TestBackend, 2>::from_floats([[3.0]], &device);
        let targets = Tensor::<TestBackend, 2>::zeros([1, 1], &device);

        // delta 4 keeps 3.0 in the quadratic region
        let loss: f32 = huber_loss(4.0)
            .forward(predictions, targets, Reduction::Mean)
            .into_scalar();
        assert_abs_diff_eq!(loss, 4.5, epsilon = 1e-6);
    }

    #[test]
    fn test_mrrmse() {
        let predictions = array![[1.0f32, 1.0], [0.0, 0.0]];
        let targets = array![[1.0f32, 1.0], [3.0, 4.0]];
        // row 0: 0, row 1: sqrt(12.5)
        assert_abs_diff_eq!(
            mrrmse(predictions.view(), targets.view()),
            12.5f64.sqrt() / 2.0,
            epsilon = 1e-9
        );
    }

    #[test]
    fn test_correlations() {
        let predictions = array![[1.0f32, 2.0, 3.0], [3.0, 1.0, 2.0]];
        let targets = array![[2.0f32, 4.0, 6.0], [1.0, 8.0, 27.0]];
        // row 0 ranks agree exactly
        assert_abs_diff_eq!(pearson(&[1.0, 2.0, 3.0], &[2.0, 4.0, 6.0]), 1.0, epsilon = 1e-12);

        let spearman = mean_spearman(predictions.view(), targets.view());
        // row 1 ranks [2, 0, 1] vs [0, 1, 2]: correlation -0.5
        assert_abs_diff_eq!(spearman, 0.25, epsilon = 1e-12);
    }

    #[test]
    fn test_constant_row_scores_zero() {
        let predictions = array![[0.0f32, 0.0, 0.0]];
        let targets = array![[1.0f32, 2.0, 3.0]];
        assert_eq!(mean_pearson(predictions.view(), targets.view()), 0.0);
        assert_eq!(mean_spearman(predictions.view(), targets.view()), 0.0);
    }

    #[test]
    fn test_ranks_break_ties_by_position() {
        let values = array![0.5f32, -1.0, 0.5, 2.0];
        assert_eq!(ranks(values.view()), vec![1.0, 0.0, 2.0, 3.0]);
    }
}
