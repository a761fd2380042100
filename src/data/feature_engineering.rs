//! Feature engineering for perturbation / cell-type pairs
//!
//! Every sample is described by a one-hot identity block (cell type, then
//! compound) followed by per-gene target encodings aggregated over the
//! labelled table.

use crate::data::{DataSources, FeatureLayout, FeatureSet};
use crate::error::EnsembleError;
use anyhow::Result;
use ndarray::{s, Array1, Array2, ArrayView2};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, info};

/// Which target encodings accompany the one-hot block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TargetRepresentation {
    /// Per-gene mean by cell type and by compound
    #[serde(rename = "mean")]
    Mean,
    /// Per-gene mean and standard deviation by cell type and by compound
    #[serde(rename = "mean_std")]
    MeanStd,
}

impl TargetRepresentation {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetRepresentation::Mean => "mean",
            TargetRepresentation::MeanStd => "mean_std",
        }
    }

    /// Number of encoding blocks, each one gene panel wide
    pub fn blocks(&self) -> usize {
        match self {
            TargetRepresentation::Mean => 2,
            TargetRepresentation::MeanStd => 4,
        }
    }
}

impl std::str::FromStr for TargetRepresentation {
    type Err = EnsembleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mean" => Ok(TargetRepresentation::Mean),
            "mean_std" => Ok(TargetRepresentation::MeanStd),
            other => Err(EnsembleError::configuration(format!(
                "unknown target representation '{}' (expected 'mean' or 'mean_std')",
                other
            ))),
        }
    }
}

impl std::fmt::Display for TargetRepresentation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Turns raw data sources into a member's feature matrices
pub trait FeatureBuilder {
    fn build(
        &self,
        sources: &DataSources,
        representation: TargetRepresentation,
        uncommon: bool,
    ) -> Result<FeatureSet>;
}

/// Per-gene mean and sample standard deviation of one category
#[derive(Debug, Clone)]
struct GroupStats {
    mean: Array1<f32>,
    std: Array1<f32>,
}

/// Aggregate `values` rows by `labels`
///
/// Standard deviation uses one degree of freedom; singleton groups get 0.
fn group_stats(labels: &[String], values: ArrayView2<f32>) -> HashMap<String, GroupStats> {
    let n_genes = values.ncols();
    let mut rows: HashMap<&str, Vec<usize>> = HashMap::new();
    for (i, label) in labels.iter().enumerate() {
        rows.entry(label.as_str()).or_default().push(i);
    }

    rows.into_iter()
        .map(|(label, members)| {
            let count = members.len() as f64;
            let mut sum = vec![0.0f64; n_genes];
            for &r in &members {
                for (acc, &v) in sum.iter_mut().zip(values.row(r).iter()) {
                    *acc += f64::from(v);
                }
            }
            let mean: Vec<f64> = sum.iter().map(|s| s / count).collect();

            let std: Vec<f32> = if members.len() < 2 {
                vec![0.0; n_genes]
            } else {
                let mut sq = vec![0.0f64; n_genes];
                for &r in &members {
                    for ((acc, &v), m) in sq.iter_mut().zip(values.row(r).iter()).zip(&mean) {
                        let d = f64::from(v) - m;
                        *acc += d * d;
                    }
                }
                sq.iter().map(|s| (s / (count - 1.0)).sqrt() as f32).collect()
            };

            let stats = GroupStats {
                mean: mean.into_iter().map(|m| m as f32).collect(),
                std: Array1::from(std),
            };
            (label.to_string(), stats)
        })
        .collect()
}

/// One-hot identity features plus target encodings
#[derive(Debug, Clone, Default)]
pub struct TargetEncodingBuilder;

impl TargetEncodingBuilder {
    pub fn new() -> Self {
        Self
    }

    fn categories(train: &[String], unseen: &[String], uncommon: bool) -> Vec<String> {
        let unseen_set: BTreeSet<&String> = unseen.iter().collect();
        let mut all: BTreeSet<&String> = train.iter().collect();
        all.extend(unseen.iter());
        all.into_iter()
            .filter(|c| !uncommon || unseen_set.contains(c))
            .cloned()
            .collect()
    }

    #[allow(clippy::too_many_arguments)]
    fn encode_rows(
        cell_types: &[String],
        sm_names: &[String],
        cell_index: &HashMap<&str, usize>,
        sm_index: &HashMap<&str, usize>,
        cell_stats: &HashMap<String, GroupStats>,
        sm_stats: &HashMap<String, GroupStats>,
        representation: TargetRepresentation,
        layout: FeatureLayout,
        n_genes: usize,
    ) -> Array2<f32> {
        let n_cells = cell_index.len();
        let mut features = Array2::<f32>::zeros((cell_types.len(), layout.total_width()));

        for (row, (cell, sm)) in cell_types.iter().zip(sm_names).enumerate() {
            if let Some(&c) = cell_index.get(cell.as_str()) {
                features[[row, c]] = 1.0;
            }
            if let Some(&m) = sm_index.get(sm.as_str()) {
                features[[row, n_cells + m]] = 1.0;
            }

            let blocks: Vec<Option<&Array1<f32>>> = match representation {
                TargetRepresentation::MeanStd => vec![
                    cell_stats.get(cell).map(|s| &s.mean),
                    cell_stats.get(cell).map(|s| &s.std),
                    sm_stats.get(sm).map(|s| &s.mean),
                    sm_stats.get(sm).map(|s| &s.std),
                ],
                TargetRepresentation::Mean => vec![
                    cell_stats.get(cell).map(|s| &s.mean),
                    sm_stats.get(sm).map(|s| &s.mean),
                ],
            };

            for (b, block) in blocks.into_iter().enumerate() {
                // Categories without labelled rows stay zero
                if let Some(values) = block {
                    let start = layout.sparse_width + b * n_genes;
                    features
                        .slice_mut(s![row, start..start + n_genes])
                        .assign(values);
                }
            }
        }
        features
    }
}

impl FeatureBuilder for TargetEncodingBuilder {
    fn build(
        &self,
        sources: &DataSources,
        representation: TargetRepresentation,
        uncommon: bool,
    ) -> Result<FeatureSet> {
        let table = &sources.table;
        let id_map = &sources.id_map;
        let n_genes = table.n_genes();

        if table.n_samples() == 0 {
            return Err(EnsembleError::configuration("labelled table has no rows").into());
        }

        let cells = Self::categories(&table.cell_types, &id_map.cell_types, uncommon);
        let sms = Self::categories(&table.sm_names, &id_map.sm_names, uncommon);
        let cell_index: HashMap<&str, usize> =
            cells.iter().enumerate().map(|(i, c)| (c.as_str(), i)).collect();
        let sm_index: HashMap<&str, usize> =
            sms.iter().enumerate().map(|(i, c)| (c.as_str(), i)).collect();

        let layout = FeatureLayout {
            sparse_width: cells.len() + sms.len(),
            encoding_width: representation.blocks() * n_genes,
        };
        debug!(
            "{} cell types, {} compounds, {} encoding columns",
            cells.len(),
            sms.len(),
            layout.encoding_width
        );

        let cell_stats = group_stats(&table.cell_types, table.values.view());
        let sm_stats = group_stats(&table.sm_names, table.values.view());

        let train = Self::encode_rows(
            &table.cell_types,
            &table.sm_names,
            &cell_index,
            &sm_index,
            &cell_stats,
            &sm_stats,
            representation,
            layout,
            n_genes,
        );
        let unseen = Self::encode_rows(
            &id_map.cell_types,
            &id_map.sm_names,
            &cell_index,
            &sm_index,
            &cell_stats,
            &sm_stats,
            representation,
            layout,
            n_genes,
        );

        let features = FeatureSet {
            train,
            targets: table.values.clone(),
            unseen,
            layout,
        };
        features.validate()?;

        info!(
            "Built {} features ({}{}): {} labelled x {} columns, {} unseen",
            representation,
            if uncommon { "uncommon, " } else { "" },
            layout.sparse_width,
            features.train.nrows(),
            layout.total_width(),
            features.unseen.nrows()
        );
        Ok(features)
    }
}
