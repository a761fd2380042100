use burn::prelude::*;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder, Recorder};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use anyhow::{anyhow, Context, Result};
use tracing::{debug, info};

use crate::error::EnsembleError;
use crate::model::architecture::{init_model, PerturbationModel};
use crate::model::ModelConfig;
use crate::reduction::{LabelReducer, StandardScaler, TargetTransform};

/// Identifies one persisted artifact inside a store directory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ArtifactKey {
    /// Output width of the model; equals the gene panel on the identity path
    pub n_components: usize,
    pub d_model: usize,
}

impl ArtifactKey {
    pub fn new(n_components: usize, d_model: usize) -> Self {
        Self { n_components, d_model }
    }

    fn suffix(&self) -> String {
        format!("{}_{}", self.n_components, self.d_model)
    }
}

/// On-disk locations of one artifact
#[derive(Debug, Clone)]
pub struct ArtifactPaths {
    pub reducer: PathBuf,
    pub scaler: PathBuf,
    /// Model configuration the weights were trained with
    pub config: PathBuf,
    /// Model record without extension; the recorder appends `.mpk`
    pub model_stem: PathBuf,
}

impl ArtifactPaths {
    pub fn model_file(&self) -> PathBuf {
        self.model_stem.with_extension("mpk")
    }
}

/// Everything needed to turn unseen features into gene-space predictions
#[derive(Debug, Clone)]
pub struct TrainedArtifact<B: Backend> {
    /// Fitted scaler and reducer; `None` on the identity path
    pub transform: Option<TargetTransform>,
    pub model: PerturbationModel<B>,
    pub model_config: ModelConfig,
}

impl<B: Backend> TrainedArtifact<B> {
    /// Output width of the final gene-space prediction
    pub fn n_genes(&self) -> usize {
        self.transform
            .as_ref()
            .map(|t| t.n_genes())
            .unwrap_or(self.model_config.n_outputs)
    }
}

/// Directory of persisted (reducer, scaler, model) triples
#[derive(Debug, Clone)]
pub struct ModelStore {
    dir: PathBuf,
}

impl ModelStore {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn paths(&self, key: ArtifactKey) -> ArtifactPaths {
        let suffix = key.suffix();
        ArtifactPaths {
            reducer: self.dir.join(format!("label_reducer_{}.json", suffix)),
            scaler: self.dir.join(format!("scaler_{}.json", suffix)),
            config: self.dir.join(format!("model_config_{}.json", suffix)),
            model_stem: self.dir.join(format!("model_{}", suffix)),
        }
    }

    /// Whether every file of `key` is present
    pub fn contains(&self, key: ArtifactKey) -> bool {
        let paths = self.paths(key);
        paths.reducer.is_file()
            && paths.scaler.is_file()
            && paths.config.is_file()
            && paths.model_file().is_file()
    }

    /// Persist an artifact, overwriting any previous one with the same key
    pub fn save<B: Backend>(&self, key: ArtifactKey, artifact: &TrainedArtifact<B>) -> Result<()> {
        crate::utils::ensure_dir(&self.dir)?;
        let paths = self.paths(key);

        let reducer = artifact.transform.as_ref().map(|t| &t.reducer);
        let scaler = artifact.transform.as_ref().map(|t| &t.scaler);
        write_json(&paths.reducer, &reducer)?;
        write_json(&paths.scaler, &scaler)?;
        artifact
            .model_config
            .save(&paths.config)
            .with_context(|| format!("Failed to write {:?}", paths.config))?;

        NamedMpkFileRecorder::<FullPrecisionSettings>::new()
            .record(artifact.model.clone().into_record(), paths.model_stem.clone())
            .map_err(|e| anyhow!("{:?}", e))
            .with_context(|| format!("Failed to save model record {:?}", paths.model_file()))?;

        info!("Saved artifact {:?} to {:?}", key, self.dir);
        Ok(())
    }

    /// Load an artifact; the model is rebuilt from `model_config`
    ///
    /// # Errors
    ///
    /// `Configuration` when a file is missing or when the stored model was
    /// trained on a different feature layout or architecture.
    pub fn load<B: Backend>(
        &self,
        key: ArtifactKey,
        model_config: &ModelConfig,
        device: &B::Device,
    ) -> Result<TrainedArtifact<B>> {
        let paths = self.paths(key);
        for path in [&paths.reducer, &paths.scaler, &paths.config, &paths.model_file()] {
            if !path.is_file() {
                return Err(EnsembleError::configuration(format!(
                    "missing persisted artifact {:?}",
                    path
                ))
                .into());
            }
        }

        let stored = ModelConfig::load(&paths.config)
            .map_err(|e| anyhow!("{}", e))
            .with_context(|| format!("Failed to parse {:?}", paths.config))?;
        check_compatible(&stored, model_config)?;

        let reducer: Option<LabelReducer> = read_json(&paths.reducer)?;
        let scaler: Option<StandardScaler> = read_json(&paths.scaler)?;
        let transform = match (reducer, scaler) {
            (Some(reducer), Some(scaler)) => Some(TargetTransform { scaler, reducer }),
            (None, None) => None,
            (reducer, scaler) => {
                return Err(EnsembleError::configuration(format!(
                    "artifact {:?} is inconsistent: reducer {}, scaler {}",
                    key,
                    if reducer.is_some() { "present" } else { "absent" },
                    if scaler.is_some() { "present" } else { "absent" },
                ))
                .into())
            }
        };

        if let Some(transform) = &transform {
            if transform.n_components() != model_config.n_outputs {
                return Err(EnsembleError::configuration(format!(
                    "reducer has {} components but the model outputs {}",
                    transform.n_components(),
                    model_config.n_outputs
                ))
                .into());
            }
        }

        let record = NamedMpkFileRecorder::<FullPrecisionSettings>::new()
            .load(paths.model_stem.clone(), device)
            .map_err(|e| anyhow!("{:?}", e))
            .with_context(|| format!("Failed to load model record {:?}", paths.model_file()))?;
        let model = init_model::<B>(model_config, device).load_record(record);

        debug!("Loaded artifact {:?} from {:?}", key, self.dir);
        Ok(TrainedArtifact {
            transform,
            model,
            model_config: model_config.clone(),
        })
    }
}

/// Stored and requested models must agree on every shape-bearing field
fn check_compatible(stored: &ModelConfig, requested: &ModelConfig) -> Result<()> {
    if stored.sparse_width != requested.sparse_width || stored.encoding_width != requested.encoding_width {
        return Err(EnsembleError::configuration(format!(
            "stored model expects {} features ({} one-hot + {} encoded) but the data has {} ({} + {})",
            stored.input_width(),
            stored.sparse_width,
            stored.encoding_width,
            requested.input_width(),
            requested.sparse_width,
            requested.encoding_width
        ))
        .into());
    }

    let shape = |c: &ModelConfig| (c.n_outputs, c.d_model, c.n_heads, c.n_layers, c.d_ff);
    if shape(stored) != shape(requested) {
        return Err(EnsembleError::configuration(format!(
            "stored model (outputs, d_model, heads, layers, d_ff) = {:?} differs from the configured {:?}",
            shape(stored),
            shape(requested)
        ))
        .into());
    }
    Ok(())
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string(value).context("Failed to serialize artifact")?;
    fs::write(path, json).with_context(|| format!("Failed to write {:?}", path))
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let json = fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))?;
    serde_json::from_str(&json).with_context(|| format!("Failed to parse {:?}", path))
}
