pub mod cluster;
pub mod feature_engineering;
pub mod loader;
pub mod preprocessing;

use crate::error::EnsembleError;
use anyhow::Result;
use ndarray::Array2;
use serde::{Deserialize, Serialize};

/// Metadata columns of a labelled DE table that are neither identity nor genes
pub const METADATA_COLUMNS: &[&str] = &["sm_lincs_id", "SMILES", "control", "split", "index", "id"];

/// Column holding the cell type of a sample
pub const CELL_TYPE_COLUMN: &str = "cell_type";

/// Column holding the compound (perturbation) of a sample
pub const SM_NAME_COLUMN: &str = "sm_name";

/// Column holding the identifier of an unseen sample
pub const ID_COLUMN: &str = "id";

/// Labelled differential-expression table
///
/// One row per (cell type, compound) sample, one column per gene of the
/// fixed panel.
#[derive(Debug, Clone)]
pub struct LabeledTable {
    /// Cell type of each row
    pub cell_types: Vec<String>,
    /// Compound of each row
    pub sm_names: Vec<String>,
    /// Gene panel, in column order
    pub genes: Vec<String>,
    /// DE statistic, rows x genes
    pub values: Array2<f32>,
}

impl LabeledTable {
    /// Create a table, checking that every dimension agrees
    pub fn new(
        cell_types: Vec<String>,
        sm_names: Vec<String>,
        genes: Vec<String>,
        values: Array2<f32>,
    ) -> Result<Self> {
        let (rows, cols) = values.dim();
        if cell_types.len() != rows || sm_names.len() != rows {
            return Err(EnsembleError::configuration(format!(
                "labelled table has {} value rows but {} cell types and {} compounds",
                rows,
                cell_types.len(),
                sm_names.len()
            ))
            .into());
        }
        if genes.len() != cols {
            return Err(EnsembleError::configuration(format!(
                "labelled table has {} value columns but {} gene names",
                cols,
                genes.len()
            ))
            .into());
        }
        Ok(Self { cell_types, sm_names, genes, values })
    }

    /// Number of labelled samples
    pub fn n_samples(&self) -> usize {
        self.values.nrows()
    }

    /// Number of genes in the panel
    pub fn n_genes(&self) -> usize {
        self.genes.len()
    }
}

/// Ordered identifiers of the unseen samples plus their identity
#[derive(Debug, Clone, Default)]
pub struct IdMap {
    pub ids: Vec<String>,
    pub cell_types: Vec<String>,
    pub sm_names: Vec<String>,
}

impl IdMap {
    pub fn new(ids: Vec<String>, cell_types: Vec<String>, sm_names: Vec<String>) -> Result<Self> {
        if ids.len() != cell_types.len() || ids.len() != sm_names.len() {
            return Err(EnsembleError::configuration(format!(
                "id map columns disagree: {} ids, {} cell types, {} compounds",
                ids.len(),
                cell_types.len(),
                sm_names.len()
            ))
            .into());
        }
        Ok(Self { ids, cell_types, sm_names })
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Everything the ensemble consumes from the outside world
#[derive(Debug, Clone)]
pub struct DataSources {
    pub table: LabeledTable,
    pub id_map: IdMap,
}

/// Column layout of an engineered feature matrix
///
/// The first `sparse_width` columns are one-hot identity features, the
/// remaining `encoding_width` columns are target encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureLayout {
    pub sparse_width: usize,
    pub encoding_width: usize,
}

impl FeatureLayout {
    pub fn total_width(&self) -> usize {
        self.sparse_width + self.encoding_width
    }
}

/// Engineered features and targets for one ensemble member
#[derive(Debug, Clone)]
pub struct FeatureSet {
    /// Labelled features, rows aligned with `targets`
    pub train: Array2<f32>,
    /// Full gene-space targets
    pub targets: Array2<f32>,
    /// Features of the unseen samples, in id-map order
    pub unseen: Array2<f32>,
    pub layout: FeatureLayout,
}

impl FeatureSet {
    /// Check that labelled and unseen features agree with each other and the layout
    pub fn validate(&self) -> Result<()> {
        if self.train.nrows() != self.targets.nrows() {
            return Err(EnsembleError::configuration(format!(
                "{} feature rows but {} target rows",
                self.train.nrows(),
                self.targets.nrows()
            ))
            .into());
        }
        let width = self.layout.total_width();
        if self.train.ncols() != width || self.unseen.ncols() != width {
            return Err(EnsembleError::configuration(format!(
                "feature width mismatch: layout {}, training {}, unseen {}",
                width,
                self.train.ncols(),
                self.unseen.ncols()
            ))
            .into());
        }
        Ok(())
    }
}

/// Train/validation partitioning strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SamplingStrategy {
    /// Cluster on the raw targets, then carve validation out of each large cluster
    #[serde(rename = "k-means", alias = "kmeans")]
    KMeans,
    /// Seeded shuffle split
    #[serde(rename = "random")]
    Random,
}

impl SamplingStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SamplingStrategy::KMeans => "k-means",
            SamplingStrategy::Random => "random",
        }
    }
}

impl std::str::FromStr for SamplingStrategy {
    type Err = EnsembleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "k-means" | "kmeans" | "k_means" => Ok(SamplingStrategy::KMeans),
            "random" => Ok(SamplingStrategy::Random),
            other => Err(EnsembleError::configuration(format!(
                "unknown sampling_strategy '{}' (expected 'k-means' or 'random')",
                other
            ))),
        }
    }
}

impl std::fmt::Display for SamplingStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Split configuration
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct SplitConfig {
    /// Validation fraction of the random strategy
    pub validation_fraction: f32,
    /// Number of k-means clusters
    pub n_clusters: usize,
    /// Clusters smaller than this go entirely to training
    pub min_cluster_size: usize,
    /// Validation fraction carved out of each large cluster
    pub cluster_validation_fraction: f32,
    /// Number of k-means restarts; the lowest-inertia run wins
    pub kmeans_restarts: usize,
    /// Random seed
    pub seed: u64,
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            validation_fraction: 0.2,
            n_clusters: 2,
            min_cluster_size: 20,
            cluster_validation_fraction: 0.1,
            kmeans_restarts: 100,
            seed: 18,
        }
    }
}

/// Disjoint train/validation row indices
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Split {
    pub train: Vec<usize>,
    pub val: Vec<usize>,
}

impl Split {
    pub fn total(&self) -> usize {
        self.train.len() + self.val.len()
    }

    pub fn has_validation(&self) -> bool {
        !self.val.is_empty()
    }
}
