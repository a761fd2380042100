use crate::data::cluster::{kmeans, KMeansConfig};
use crate::data::{SamplingStrategy, Split, SplitConfig};
use crate::error::EnsembleError;
use crate::utils::random::{derive_seed, seeded_rng};
use anyhow::Result;
use ndarray::ArrayView2;
use rand::seq::SliceRandom;
use tracing::{debug, info, warn};

impl SamplingStrategy {
    /// Partition the labelled rows into disjoint train and validation sets
    ///
    /// `features` is only used for its row count; the k-means strategy
    /// clusters on the raw, unreduced `targets`.
    pub fn split(
        &self,
        features: ArrayView2<f32>,
        targets: ArrayView2<f32>,
        config: &SplitConfig,
    ) -> Result<Split> {
        if features.nrows() != targets.nrows() {
            return Err(EnsembleError::configuration(format!(
                "cannot split {} feature rows against {} target rows",
                features.nrows(),
                targets.nrows()
            ))
            .into());
        }

        let split = match self {
            SamplingStrategy::Random => random_split(targets.nrows(), config)?,
            SamplingStrategy::KMeans => cluster_split(targets, config)?,
        };

        info!(
            "{} split: train={}, val={} (seed {})",
            self,
            split.train.len(),
            split.val.len(),
            config.seed
        );
        Ok(split)
    }
}

/// Seeded shuffle split with `ceil(fraction * n)` validation rows
pub fn random_split(n_rows: usize, config: &SplitConfig) -> Result<Split> {
    crate::utils::validation::in_range(config.validation_fraction, 0.0, 1.0, "validation_fraction")?;
    let indices: Vec<usize> = (0..n_rows).collect();
    let (train, val) = shuffle_split(&indices, config.validation_fraction, config.seed);
    Ok(Split { train, val })
}

/// Cluster-aware split
///
/// Rows are clustered on their raw targets; every cluster with at least
/// `min_cluster_size` members contributes `cluster_validation_fraction` of
/// its rows to validation, smaller clusters go entirely to training.
pub fn cluster_split(targets: ArrayView2<f32>, config: &SplitConfig) -> Result<Split> {
    crate::utils::validation::in_range(
        config.cluster_validation_fraction,
        0.0,
        1.0,
        "cluster_validation_fraction",
    )?;
    let n_rows = targets.nrows();

    if n_rows < config.n_clusters {
        warn!(
            "Only {} labelled rows for {} clusters; all rows go to training",
            n_rows, config.n_clusters
        );
        return Ok(Split { train: (0..n_rows).collect(), val: Vec::new() });
    }

    let kmeans_config = KMeansConfig {
        n_clusters: config.n_clusters,
        n_init: config.kmeans_restarts,
        seed: config.seed,
        ..KMeansConfig::default()
    };
    let clusters = kmeans(targets, &kmeans_config)?;

    let mut train = Vec::with_capacity(n_rows);
    let mut val = Vec::new();
    for (cluster_id, members) in clusters.members().into_iter().enumerate() {
        if members.len() >= config.min_cluster_size {
            let (cluster_train, cluster_val) = shuffle_split(
                &members,
                config.cluster_validation_fraction,
                derive_seed(config.seed, cluster_id as u64),
            );
            debug!(
                "Cluster {}: {} rows, {} held out for validation",
                cluster_id,
                members.len(),
                cluster_val.len()
            );
            train.extend(cluster_train);
            val.extend(cluster_val);
        } else {
            if !members.is_empty() {
                warn!(
                    "Cluster {} has {} rows (< {}); folding it into training",
                    cluster_id,
                    members.len(),
                    config.min_cluster_size
                );
            }
            train.extend(members);
        }
    }

    train.sort_unstable();
    val.sort_unstable();
    Ok(Split { train, val })
}

/// Shuffle `indices` with `seed` and hold out `ceil(fraction * len)` of them
fn shuffle_split(indices: &[usize], fraction: f32, seed: u64) -> (Vec<usize>, Vec<usize>) {
    let mut shuffled = indices.to_vec();
    let mut rng = seeded_rng(seed);
    shuffled.shuffle(&mut rng);

    // f32 fractions are not exact in f64 (0.1f32 * 60 > 6)
    let raw = (indices.len() as f64) * f64::from(fraction);
    let n_val = ((raw - 1e-6).ceil().max(0.0) as usize).min(indices.len());

    let mut val = shuffled[..n_val].to_vec();
    let mut train = shuffled[n_val..].to_vec();
    train.sort_unstable();
    val.sort_unstable();
    (train, val)
}
