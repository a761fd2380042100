//! Ensemble configuration
//!
//! An [`EnsembleConfig`] is the single value object a run is driven by; no
//! component reads process-wide state.

pub mod orchestrator;

use crate::data::feature_engineering::TargetRepresentation;
use crate::data::{SamplingStrategy, SplitConfig};
use crate::error::EnsembleError;
use crate::training::TrainingConfig;
use anyhow::Result;
use burn_ndarray::NdArrayDevice;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

fn default_d_model() -> usize {
    128
}

/// One independently trained ensemble member
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberConfig {
    /// Human-readable name; also names the member's store directory
    pub name: String,
    /// Reduced target width; `None` regresses the full gene panel
    #[serde(default)]
    pub n_components: Option<usize>,
    #[serde(default = "default_d_model")]
    pub d_model: usize,
    pub target_representation: TargetRepresentation,
    /// Drop one-hot columns for categories absent from the id map
    #[serde(default)]
    pub uncommon: bool,
    pub sampling_strategy: SamplingStrategy,
    /// Blend weight; weights are never normalized
    pub weight: f32,
}

impl MemberConfig {
    pub fn new(
        name: impl Into<String>,
        target_representation: TargetRepresentation,
        sampling_strategy: SamplingStrategy,
        weight: f32,
    ) -> Self {
        Self {
            name: name.into(),
            n_components: None,
            d_model: default_d_model(),
            target_representation,
            uncommon: false,
            sampling_strategy,
            weight,
        }
    }

    pub fn with_uncommon(mut self, uncommon: bool) -> Self {
        self.uncommon = uncommon;
        self
    }

    pub fn with_n_components(mut self, n_components: usize) -> Self {
        self.n_components = Some(n_components);
        self
    }

    pub fn with_d_model(mut self, d_model: usize) -> Self {
        self.d_model = d_model;
        self
    }

    /// Model output width over a panel of `n_genes` genes
    pub fn n_outputs(&self, n_genes: usize) -> usize {
        self.n_components.unwrap_or(n_genes)
    }
}

/// Transformer hyper-parameters shared by every member
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelHyperparameters {
    pub n_heads: usize,
    pub n_layers: usize,
    pub d_ff: usize,
    pub dropout: f64,
}

impl Default for ModelHyperparameters {
    fn default() -> Self {
        Self {
            n_heads: 8,
            n_layers: 6,
            d_ff: 2048,
            dropout: 0.3,
        }
    }
}

/// Everything an ensemble run needs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnsembleConfig {
    pub members: Vec<MemberConfig>,
    pub training: TrainingConfig,
    pub split: SplitConfig,
    pub model: ModelHyperparameters,
    /// Inference batch size
    pub batch_size: usize,
    /// Seed for splits, initialisation and batch order of every member
    pub seed: u64,
    pub device: String,
    /// Artifact directory; each member gets its own sub-directory
    pub store_dir: Option<PathBuf>,
    /// Load every member from the store instead of training
    pub reuse_artifacts: bool,
    /// Directory receiving each member's per-epoch metrics history
    pub metrics_dir: Option<PathBuf>,
}

impl Default for EnsembleConfig {
    fn default() -> Self {
        Self::canonical()
    }
}

impl EnsembleConfig {
    /// The four-member blend
    pub fn canonical() -> Self {
        use SamplingStrategy::{KMeans, Random};
        use TargetRepresentation::{Mean, MeanStd};

        Self {
            members: vec![
                MemberConfig::new("mean_std_random", MeanStd, Random, 0.5),
                MemberConfig::new("mean_std_uncommon_random", MeanStd, Random, 0.25).with_uncommon(true),
                MemberConfig::new("mean_std_kmeans", MeanStd, KMeans, 0.25),
                MemberConfig::new("mean_random", Mean, Random, 0.3),
            ],
            training: TrainingConfig::default(),
            split: SplitConfig::default(),
            model: ModelHyperparameters::default(),
            batch_size: 256,
            seed: 18,
            device: "cpu".to_string(),
            store_dir: None,
            reuse_artifacts: false,
            metrics_dir: None,
        }
    }

    /// Load configuration from a JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            EnsembleError::configuration(format!("cannot read config {:?}: {}", path, e))
        })?;
        let config: Self = serde_json::from_str(&json).map_err(|e| {
            EnsembleError::configuration(format!("invalid config {:?}: {}", path, e))
        })?;
        Ok(config)
    }

    /// Save configuration as pretty JSON
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Resolve the configured device
    pub fn device(&self) -> Result<NdArrayDevice> {
        parse_device(&self.device)
    }

    pub fn validate(&self) -> Result<()> {
        use crate::utils::validation::{in_range, positive};

        if self.members.is_empty() {
            return Err(EnsembleError::configuration("ensemble has no members").into());
        }
        for member in &self.members {
            if member.n_components == Some(0) {
                return Err(EnsembleError::configuration(format!(
                    "member '{}' has n_components = 0",
                    member.name
                ))
                .into());
            }
            if !member.weight.is_finite() {
                return Err(EnsembleError::configuration(format!(
                    "member '{}' has a non-finite weight",
                    member.name
                ))
                .into());
            }
            positive(member.d_model, "d_model")?;
            if member.d_model % self.model.n_heads.max(1) != 0 {
                return Err(EnsembleError::configuration(format!(
                    "member '{}': d_model {} is not divisible by {} heads",
                    member.name, member.d_model, self.model.n_heads
                ))
                .into());
            }
        }
        if self.reuse_artifacts && self.store_dir.is_none() {
            return Err(EnsembleError::configuration("reuse_artifacts requires store_dir").into());
        }

        positive(self.model.n_heads, "n_heads")?;
        positive(self.model.n_layers, "n_layers")?;
        positive(self.model.d_ff, "d_ff")?;
        positive(self.batch_size, "batch_size")?;
        in_range(self.split.validation_fraction, 0.0, 1.0, "validation_fraction")?;
        in_range(self.split.cluster_validation_fraction, 0.0, 1.0, "cluster_validation_fraction")?;
        positive(self.split.n_clusters, "n_clusters")?;
        self.training.validate()?;
        self.device()?;
        Ok(())
    }
}

/// Parse a device name; only the CPU backend is available
pub fn parse_device(name: &str) -> Result<NdArrayDevice> {
    match name.to_lowercase().as_str() {
        "cpu" => Ok(NdArrayDevice::Cpu),
        other => Err(EnsembleError::configuration(format!(
            "unsupported device '{}' (only 'cpu' is available)",
            other
        ))
        .into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_blend() {
        let config = EnsembleConfig::canonical();
        let weights: Vec<f32> = config.members.iter().map(|m| m.weight).collect();
        assert_eq!(weights, vec![0.5, 0.25, 0.25, 0.3]);
        assert!(config.members.iter().all(|m| m.d_model == 128 && m.n_components.is_none()));
        assert!(config.members[1].uncommon);
        assert_eq!(config.members[2].sampling_strategy, SamplingStrategy::KMeans);
        assert_eq!(config.members[3].target_representation, TargetRepresentation::Mean);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_file_round_trip() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("ensemble.json");
        let mut config = EnsembleConfig::canonical();
        config.members[0].n_components = Some(32);
        config.save(&path).unwrap();

        let loaded = EnsembleConfig::from_file(&path).unwrap();
        assert_eq!(loaded.members, config.members);
        assert_eq!(loaded.training.early_stopping_patience, 5000);
    }

    #[test]
    fn test_unknown_strategy_is_configuration_error() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("bad.json");
        std::fs::write(
            &path,
            r#"{"members": [{"name": "m", "target_representation": "mean",
                 "sampling_strategy": "stratified", "weight": 1.0}]}"#,
        )
        .unwrap();

        let err = EnsembleConfig::from_file(&path).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EnsembleError>(),
            Some(EnsembleError::Configuration(_))
        ));
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("partial.json");
        std::fs::write(
            &path,
            r#"{"members": [{"name": "m", "target_representation": "mean_std",
                 "sampling_strategy": "k-means", "weight": 2.0}], "seed": 7}"#,
        )
        .unwrap();

        let config = EnsembleConfig::from_file(&path).unwrap();
        assert_eq!(config.members.len(), 1);
        assert_eq!(config.members[0].d_model, 128);
        assert_eq!(config.seed, 7);
        assert_eq!(config.device, "cpu");
    }

    #[test]
    fn test_device_parsing() {
        assert!(parse_device("cpu").is_ok());
        assert!(parse_device("CPU").is_ok());
        let err = parse_device("cuda").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EnsembleError>(),
            Some(EnsembleError::Configuration(_))
        ));
    }

    #[test]
    fn test_validation_rejects_bad_members() {
        let mut config = EnsembleConfig::canonical();
        config.members[0].d_model = 100;
        assert!(config.validate().is_err());

        let mut config = EnsembleConfig::canonical();
        config.members.clear();
        assert!(config.validate().is_err());

        let mut config = EnsembleConfig::canonical();
        config.reuse_artifacts = true;
        assert!(config.validate().is_err());
    }
}
