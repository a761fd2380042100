//! K-means clustering of labelled samples by response profile.
//!
//! k-means++ seeding followed by Lloyd iterations; the clustering is
//! restarted `n_init` times from independent seeds and the lowest-inertia
//! run is kept.

use crate::error::EnsembleError;
use crate::utils::random::{derive_seed, seeded_rng};
use anyhow::Result;
use ndarray::{Array2, ArrayView1, ArrayView2};
use rand::Rng;
use tracing::debug;

/// Configuration for k-means clustering.
#[derive(Debug, Clone)]
pub struct KMeansConfig {
    pub n_clusters: usize,
    pub max_iter: usize,
    pub tolerance: f64,
    pub n_init: usize,
    pub seed: u64,
}

impl Default for KMeansConfig {
    fn default() -> Self {
        Self {
            n_clusters: 2,
            max_iter: 300,
            tolerance: 1e-4,
            n_init: 10,
            seed: 42,
        }
    }
}

/// Result of k-means clustering.
#[derive(Debug, Clone)]
pub struct KMeansResult {
    /// Centroids, `n_clusters x n_features`.
    pub centroids: Array2<f64>,
    /// Cluster label for each row.
    pub labels: Vec<usize>,
    /// Sum of squared distances to the assigned centroid.
    pub inertia: f64,
    /// Lloyd iterations of the winning run.
    pub n_iter: usize,
}

impl KMeansResult {
    /// Row indices of every cluster, in ascending order.
    pub fn members(&self) -> Vec<Vec<usize>> {
        let k = self.centroids.nrows();
        let mut members = vec![Vec::new(); k];
        for (row, &label) in self.labels.iter().enumerate() {
            members[label].push(row);
        }
        members
    }
}

/// Cluster the rows of `data`.
pub fn kmeans(data: ArrayView2<f32>, config: &KMeansConfig) -> Result<KMeansResult> {
    let (n, dim) = data.dim();
    let k = config.n_clusters;

    if n == 0 {
        return Err(EnsembleError::configuration("k-means on empty data").into());
    }
    if k == 0 {
        return Err(EnsembleError::configuration("n_clusters must be > 0").into());
    }
    if k > n {
        return Err(EnsembleError::configuration(format!(
            "n_clusters ({}) > n_samples ({})",
            k, n
        ))
        .into());
    }
    if dim == 0 {
        return Err(EnsembleError::configuration("zero-dimensional data").into());
    }
    if data.iter().any(|v| !v.is_finite()) {
        return Err(EnsembleError::numeric("k-means input contains non-finite values").into());
    }

    let data = data.mapv(f64::from);
    let mut best: Option<KMeansResult> = None;
    for run in 0..config.n_init.max(1) {
        let result = lloyd(data.view(), config, derive_seed(config.seed, run as u64));
        debug!("k-means run {}: inertia {:.4} after {} iterations", run, result.inertia, result.n_iter);
        let better = match &best {
            None => true,
            Some(current) => result.inertia < current.inertia,
        };
        if better {
            best = Some(result);
        }
    }

    best.ok_or_else(|| EnsembleError::configuration("k-means produced no run").into())
}

fn lloyd(data: ArrayView2<f64>, config: &KMeansConfig, seed: u64) -> KMeansResult {
    let (n, dim) = data.dim();
    let k = config.n_clusters;
    let mut rng = seeded_rng(seed);

    // k-means++ init
    let mut centroids = Array2::<f64>::zeros((k, dim));
    let first = rng.gen_range(0..n);
    centroids.row_mut(0).assign(&data.row(first));

    let mut dists = vec![f64::INFINITY; n];
    for c in 1..k {
        let prev = centroids.row(c - 1).to_owned();
        for (i, d) in dists.iter_mut().enumerate() {
            *d = d.min(sq_euclidean(data.row(i), prev.view()));
        }
        let total: f64 = dists.iter().sum();
        let chosen = if total == 0.0 {
            // All points identical
            c % n
        } else {
            let threshold = rng.gen::<f64>() * total;
            let mut cumulative = 0.0;
            let mut chosen = n - 1;
            for (i, &d) in dists.iter().enumerate() {
                cumulative += d;
                if cumulative >= threshold {
                    chosen = i;
                    break;
                }
            }
            chosen
        };
        centroids.row_mut(c).assign(&data.row(chosen));
    }

    let mut labels = vec![0usize; n];
    let mut n_iter = 0;

    for _ in 0..config.max_iter {
        n_iter += 1;

        for (i, label) in labels.iter_mut().enumerate() {
            *label = nearest(data.row(i), &centroids).0;
        }

        let mut new_centroids = Array2::<f64>::zeros((k, dim));
        let mut counts = vec![0usize; k];
        for (i, &c) in labels.iter().enumerate() {
            counts[c] += 1;
            let mut row = new_centroids.row_mut(c);
            row += &data.row(i);
        }
        for c in 0..k {
            if counts[c] > 0 {
                new_centroids.row_mut(c).mapv_inplace(|v| v / counts[c] as f64);
            } else {
                // Empty cluster keeps its old centroid
                new_centroids.row_mut(c).assign(&centroids.row(c));
            }
        }

        let max_shift = (0..k)
            .map(|c| sq_euclidean(centroids.row(c), new_centroids.row(c)).sqrt())
            .fold(0.0_f64, f64::max);

        centroids = new_centroids;

        if max_shift < config.tolerance {
            break;
        }
    }

    let mut inertia = 0.0;
    for (i, label) in labels.iter_mut().enumerate() {
        let (c, d) = nearest(data.row(i), &centroids);
        *label = c;
        inertia += d;
    }

    KMeansResult {
        centroids,
        labels,
        inertia,
        n_iter,
    }
}

fn nearest(point: ArrayView1<f64>, centroids: &Array2<f64>) -> (usize, f64) {
    let mut best_c = 0;
    let mut best_dist = f64::INFINITY;
    for (c, centroid) in centroids.rows().into_iter().enumerate() {
        let d = sq_euclidean(point, centroid);
        if d < best_dist {
            best_dist = d;
            best_c = c;
        }
    }
    (best_c, best_dist)
}

fn sq_euclidean(a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_blobs() -> Array2<f32> {
        let mut data = Array2::<f32>::zeros((30, 3));
        for i in 0..30 {
            let base = if i < 20 { 0.0 } else { 10.0 };
            for j in 0..3 {
                data[[i, j]] = base + ((i * 7 + j * 3) % 5) as f32 * 0.1;
            }
        }
        data
    }

    #[test]
    fn test_kmeans_two_clusters() {
        let data = two_blobs();
        let config = KMeansConfig { n_clusters: 2, seed: 7, ..Default::default() };
        let result = kmeans(data.view(), &config).unwrap();

        let members = result.members();
        let mut sizes: Vec<usize> = members.iter().map(|m| m.len()).collect();
        sizes.sort();
        assert_eq!(sizes, vec![10, 20]);

        // All of the first 20 rows share a label
        let first = result.labels[0];
        assert!(result.labels[..20].iter().all(|&l| l == first));
        assert!(result.labels[20..].iter().all(|&l| l != first));
    }

    #[test]
    fn test_kmeans_deterministic_with_seed() {
        let data = two_blobs();
        let config = KMeansConfig { n_clusters: 2, seed: 3, n_init: 4, ..Default::default() };
        let a = kmeans(data.view(), &config).unwrap();
        let b = kmeans(data.view(), &config).unwrap();
        assert_eq!(a.labels, b.labels);
    }

    #[test]
    fn test_kmeans_too_many_clusters() {
        let data = Array2::<f32>::zeros((1, 2));
        let config = KMeansConfig { n_clusters: 2, ..Default::default() };
        assert!(kmeans(data.view(), &config).is_err());
    }

    #[test]
    fn test_kmeans_identical_points() {
        let data = Array2::<f32>::ones((5, 2));
        let config = KMeansConfig { n_clusters: 2, ..Default::default() };
        let result = kmeans(data.view(), &config).unwrap();
        assert_eq!(result.labels.len(), 5);
        assert!(result.inertia.abs() < 1e-12);
    }
}
