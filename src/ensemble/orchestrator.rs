use crate::data::feature_engineering::{FeatureBuilder, TargetEncodingBuilder};
use crate::data::{DataSources, SplitConfig};
use crate::ensemble::{EnsembleConfig, MemberConfig};
use crate::error::{EnsembleError, Phase};
use crate::model::checkpoint::{ArtifactKey, ModelStore, TrainedArtifact};
use crate::model::ModelConfig;
use crate::predict::predictor::Predictor;
use crate::predict::PredictionMatrix;
use crate::reduction::fit_reduction;
use crate::training::trainer::Trainer;
use crate::training::{TrainingConfig, TrainingData};
use crate::utils::sanitize_component;
use anyhow::Result;
use burn::tensor::backend::AutodiffBackend;
use ndarray::Axis;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Instant;
use tracing::info;

/// What happened to one member during a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberReport {
    pub index: usize,
    pub name: String,
    pub weight: f32,
    /// Model output width
    pub n_outputs: usize,
    /// Training rows; 0 when the artifact was loaded
    pub n_train: usize,
    /// Validation rows; 0 when the artifact was loaded
    pub n_val: usize,
    /// Whether the artifact was trained in this run rather than loaded
    pub trained: bool,
    pub best_epoch: Option<usize>,
    pub best_loss: Option<f64>,
    pub best_mrrmse: Option<f64>,
    pub stopped_early: bool,
    pub duration_secs: f64,
}

/// Result of an ensemble run
#[derive(Debug, Clone)]
pub struct EnsembleOutcome {
    /// Weighted sum of every member's prediction
    pub prediction: PredictionMatrix,
    pub reports: Vec<MemberReport>,
}

/// Drives every member through features, split, reduction, training or
/// loading, and prediction, then blends the results
pub struct EnsembleOrchestrator<B: AutodiffBackend> {
    config: EnsembleConfig,
    features: Box<dyn FeatureBuilder>,
    device: B::Device,
}

impl<B: AutodiffBackend> EnsembleOrchestrator<B> {
    /// Create an orchestrator using target-encoding features
    pub fn new(config: EnsembleConfig, device: B::Device) -> Self {
        Self {
            config,
            features: Box::new(TargetEncodingBuilder::new()),
            device,
        }
    }

    /// Replace the feature builder
    pub fn with_feature_builder(mut self, features: Box<dyn FeatureBuilder>) -> Self {
        self.features = features;
        self
    }

    pub fn config(&self) -> &EnsembleConfig {
        &self.config
    }

    /// Run every member in order and blend their predictions
    ///
    /// The first member failure aborts the run.
    pub fn run(&self, sources: &DataSources) -> Result<EnsembleOutcome> {
        self.config.validate()?;
        let n_rows = sources.id_map.len();
        let n_genes = sources.table.n_genes();
        let n_members = self.config.members.len();

        info!(
            "Running {} members on {} labelled rows -> {} unseen rows x {} genes",
            n_members,
            sources.table.n_samples(),
            n_rows,
            n_genes
        );

        let mut total = PredictionMatrix::zeros(n_rows, n_genes);
        let mut reports = Vec::with_capacity(n_members);
        for (index, member) in self.config.members.iter().enumerate() {
            info!("Member {}/{}: {}", index + 1, n_members, member.name);
            let (prediction, report) = self.run_member(index, member, sources)?;
            accumulate(&mut total, member.weight, &prediction)
                .map_err(|e| EnsembleError::member(index, &member.name, Phase::Combine, e))?;
            reports.push(report);
        }

        let weight_sum: f32 = self.config.members.iter().map(|m| m.weight).sum();
        info!("Blended {} members (weight sum {:.3})", n_members, weight_sum);
        Ok(EnsembleOutcome {
            prediction: total,
            reports,
        })
    }

    fn run_member(
        &self,
        index: usize,
        member: &MemberConfig,
        sources: &DataSources,
    ) -> Result<(PredictionMatrix, MemberReport)> {
        let fail = |phase: Phase| move |e: anyhow::Error| EnsembleError::member(index, &member.name, phase, e);
        let start_time = Instant::now();

        let features = self
            .features
            .build(sources, member.target_representation, member.uncommon)
            .and_then(|features| features.validate().map(|_| features))
            .map_err(fail(Phase::Features))?;

        let n_genes = features.targets.ncols();
        let n_outputs = member.n_outputs(n_genes);
        let hyper = self.config.model;
        let model_config = ModelConfig::for_layout(features.layout, n_outputs, member.d_model)
            .with_n_heads(hyper.n_heads)
            .with_n_layers(hyper.n_layers)
            .with_d_ff(hyper.d_ff)
            .with_dropout(hyper.dropout);
        let key = ArtifactKey::new(n_outputs, member.d_model);
        let store = self.member_store(index, member);

        let mut report = MemberReport {
            index,
            name: member.name.clone(),
            weight: member.weight,
            n_outputs,
            n_train: 0,
            n_val: 0,
            trained: false,
            best_epoch: None,
            best_loss: None,
            best_mrrmse: None,
            stopped_early: false,
            duration_secs: 0.0,
        };

        let artifact: TrainedArtifact<B::InnerBackend> = match (&store, self.config.reuse_artifacts) {
            (Some(store), true) => {
                let artifact = store
                    .load::<B::InnerBackend>(key, &model_config, &self.device)
                    .and_then(|artifact| {
                        if artifact.n_genes() != n_genes {
                            return Err(EnsembleError::configuration(format!(
                                "stored artifact predicts {} genes but the panel has {}",
                                artifact.n_genes(),
                                n_genes
                            ))
                            .into());
                        }
                        Ok(artifact)
                    })
                    .map_err(fail(Phase::Load))?;
                info!("Loaded member '{}' from {:?}", member.name, store.dir());
                artifact
            }
            _ => {
                let split_config = SplitConfig {
                    seed: self.config.seed,
                    ..self.config.split
                };
                let split = member
                    .sampling_strategy
                    .split(features.train.view(), features.targets.view(), &split_config)
                    .map_err(fail(Phase::Split))?;
                report.n_train = split.train.len();
                report.n_val = split.val.len();

                let y_train = features.targets.select(Axis(0), &split.train);
                let (transform, y_train_reduced) =
                    fit_reduction(y_train.view(), n_outputs).map_err(fail(Phase::Reduce))?;

                let data = TrainingData {
                    x_train: features.train.select(Axis(0), &split.train),
                    y_train_reduced,
                    x_val: features.train.select(Axis(0), &split.val),
                    y_val_full: features.targets.select(Axis(0), &split.val),
                };
                let training_config = TrainingConfig {
                    seed: self.config.seed,
                    metrics_log: member_path(self.config.metrics_dir.as_ref(), index, member)
                        .map(|path| path.with_extension("json"))
                        .or_else(|| self.config.training.metrics_log.clone()),
                    ..self.config.training.clone()
                };
                let result = Trainer::<B>::new(training_config, self.device.clone())
                    .train(data, transform, model_config)
                    .map_err(fail(Phase::Train))?;

                if let Some(store) = &store {
                    store.save(key, &result.artifact).map_err(fail(Phase::Save))?;
                }

                report.trained = true;
                report.best_epoch = Some(result.state.best_epoch);
                report.best_loss = Some(result.state.best_loss);
                report.best_mrrmse = result.state.best_mrrmse;
                report.stopped_early = result.stopped_early;
                result.artifact
            }
        };

        let prediction = Predictor::<B::InnerBackend>::new(self.device.clone())
            .with_batch_size(self.config.batch_size)
            .predict(&features.unseen, &artifact)
            .map_err(fail(Phase::Predict))?;

        report.duration_secs = start_time.elapsed().as_secs_f64();
        info!(
            "Member '{}' done in {}{}",
            member.name,
            crate::utils::format_duration(report.duration_secs),
            report
                .best_mrrmse
                .map_or_else(String::new, |m| format!(", best validation MRRMSE {:.4}", m))
        );
        Ok((prediction, report))
    }

    /// Store directory of one member, if a store is configured
    fn member_store(&self, index: usize, member: &MemberConfig) -> Option<ModelStore> {
        member_path(self.config.store_dir.as_ref(), index, member)
            .map(ModelStore::new)
    }
}

/// `root/member_{index}_{name}`
fn member_path(root: Option<&PathBuf>, index: usize, member: &MemberConfig) -> Option<PathBuf> {
    root.map(|dir| dir.join(format!("member_{}_{}", index, sanitize_component(&member.name))))
}

/// Non-normalized weighted sum of member predictions
pub fn combine(weighted: &[(f32, PredictionMatrix)]) -> Result<PredictionMatrix> {
    let (_, first) = weighted
        .first()
        .ok_or_else(|| EnsembleError::configuration("nothing to combine"))?;
    let mut total = PredictionMatrix::zeros(first.n_rows(), first.n_genes());
    for (weight, prediction) in weighted {
        accumulate(&mut total, *weight, prediction)?;
    }
    Ok(total)
}

fn accumulate(total: &mut PredictionMatrix, weight: f32, prediction: &PredictionMatrix) -> Result<()> {
    if total.shape() != prediction.shape() {
        return Err(EnsembleError::configuration(format!(
            "cannot combine a {:?} prediction into a {:?} blend",
            prediction.shape(),
            total.shape()
        ))
        .into());
    }
    total.values.scaled_add(weight, &prediction.values);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::feature_engineering::TargetRepresentation;
    use crate::data::{IdMap, LabeledTable, SamplingStrategy};
    use crate::ensemble::ModelHyperparameters;
    use crate::training::EpochMetrics;
    use crate::utils::random::seeded_rng;
    use approx::assert_abs_diff_eq;
    use burn::backend::{Autodiff, NdArray};
    use ndarray::Array2;
    use rand::Rng;

    type TestBackend = Autodiff<NdArray<f32>>;

    fn sources() -> DataSources {
        let mut rng = seeded_rng(11);
        let n_rows = 100;
        let cell_types: Vec<String> = (0..n_rows).map(|i| format!("cell_{}", i % 4)).collect();
        let sm_names: Vec<String> = (0..n_rows).map(|i| format!("sm_{}", i / 4)).collect();
        let genes: Vec<String> = (0..50).map(|g| format!("G{}", g)).collect();
        let values = Array2::from_shape_fn((n_rows, 50), |_| rng.gen::<f32>() * 2.0 - 1.0);
        let table = LabeledTable::new(cell_types, sm_names, genes, values).unwrap();

        let id_map = IdMap::new(
            (0..10).map(|i| i.to_string()).collect(),
            (0..10).map(|i| format!("cell_{}", i % 2)).collect(),
            (0..10).map(|i| format!("sm_{}", i)).collect(),
        )
        .unwrap();
        DataSources { table, id_map }
    }

    fn small_config(members: Vec<MemberConfig>) -> EnsembleConfig {
        EnsembleConfig {
            members,
            training: TrainingConfig {
                num_epochs: 2,
                ..TrainingConfig::quick_test()
            },
            model: ModelHyperparameters {
                n_heads: 2,
                n_layers: 1,
                d_ff: 16,
                dropout: 0.0,
            },
            batch_size: 4,
            ..EnsembleConfig::canonical()
        }
    }

    fn member(n_components: usize) -> MemberConfig {
        MemberConfig::new("mean_std_random", TargetRepresentation::MeanStd, SamplingStrategy::Random, 1.0)
            .with_n_components(n_components)
            .with_d_model(8)
    }

    #[test]
    fn test_combine_is_not_normalized() {
        let weighted: Vec<(f32, PredictionMatrix)> = [0.5, 0.25, 0.25, 0.3]
            .iter()
            .map(|&w| (w, PredictionMatrix::new(Array2::ones((2, 3)))))
            .collect();
        let blend = combine(&weighted).unwrap();
        for &v in blend.values.iter() {
            assert_abs_diff_eq!(v, 1.3, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_combine_shape_mismatch() {
        let weighted = vec![
            (1.0, PredictionMatrix::zeros(2, 3)),
            (1.0, PredictionMatrix::zeros(2, 4)),
        ];
        let err = combine(&weighted).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EnsembleError>(),
            Some(EnsembleError::Configuration(_))
        ));
    }

    #[test]
    fn test_end_to_end_reduced_member() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let sources = sources();
        let mut config = small_config(vec![member(10)]);
        config.metrics_dir = Some(temp_dir.path().to_path_buf());
        let orchestrator = EnsembleOrchestrator::<TestBackend>::new(config, Default::default());

        let outcome = orchestrator.run(&sources).unwrap();
        assert_eq!(outcome.prediction.shape(), (10, 50));
        assert!(outcome.prediction.values.iter().all(|v| v.is_finite()));

        let report = &outcome.reports[0];
        assert_eq!(report.n_train, 80);
        assert_eq!(report.n_val, 20);
        assert_eq!(report.n_outputs, 10);
        assert!(report.trained);
        assert!(report.best_mrrmse.is_some());

        // the kept checkpoint is the lowest validation loss of the run
        let history: Vec<EpochMetrics> = serde_json::from_str(
            &std::fs::read_to_string(temp_dir.path().join("member_0_mean_std_random.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(history.len(), 2);
        let val_losses: Vec<f64> = history.iter().map(|m| m.val_loss.unwrap()).collect();
        let best_loss = report.best_loss.unwrap();
        assert!(best_loss <= val_losses[0]);
        assert_eq!(best_loss, val_losses.iter().cloned().fold(f64::INFINITY, f64::min));
        assert_eq!(val_losses[report.best_epoch.unwrap()], best_loss);
    }

    #[test]
    fn test_store_reuse_reproduces_weighted_prediction() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let sources = sources();
        let mut config = small_config(vec![member(10)]);
        config.store_dir = Some(temp_dir.path().to_path_buf());

        let fresh = EnsembleOrchestrator::<TestBackend>::new(config.clone(), Default::default())
            .run(&sources)
            .unwrap();
        assert!(temp_dir
            .path()
            .join("member_0_mean_std_random")
            .join("model_10_8.mpk")
            .is_file());

        // reloaded member, blended with twice the weight
        config.reuse_artifacts = true;
        config.members[0].weight = 2.0;
        let reused = EnsembleOrchestrator::<TestBackend>::new(config, Default::default())
            .run(&sources)
            .unwrap();
        assert!(!reused.reports[0].trained);
        for (a, b) in fresh.prediction.values.iter().zip(reused.prediction.values.iter()) {
            assert_abs_diff_eq!(a * 2.0, *b, epsilon = 1e-4);
        }
    }

    #[test]
    fn test_member_failure_names_phase() {
        let sources = sources();
        let orchestrator =
            EnsembleOrchestrator::<TestBackend>::new(small_config(vec![member(60)]), Default::default());

        let err = orchestrator.run(&sources).unwrap_err();
        let phase = err.downcast_ref::<EnsembleError>().and_then(|e| e.phase());
        assert_eq!(phase, Some(Phase::Reduce));
    }

    #[test]
    fn test_missing_artifact_fails_in_load_phase() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let mut config = small_config(vec![member(10)]);
        config.store_dir = Some(temp_dir.path().to_path_buf());
        config.reuse_artifacts = true;

        let err = EnsembleOrchestrator::<TestBackend>::new(config, Default::default())
            .run(&sources())
            .unwrap_err();
        let phase = err.downcast_ref::<EnsembleError>().and_then(|e| e.phase());
        assert_eq!(phase, Some(Phase::Load));
    }

    #[test]
    fn test_reuse_with_wider_id_map_fails_in_load_phase() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let mut config = small_config(vec![member(10).with_uncommon(true)]);
        config.store_dir = Some(temp_dir.path().to_path_buf());
        EnsembleOrchestrator::<TestBackend>::new(config.clone(), Default::default())
            .run(&sources())
            .unwrap();

        // the id map now names four cell types instead of two
        let mut wider = sources();
        wider.id_map = IdMap::new(
            (0..10).map(|i| i.to_string()).collect(),
            (0..10).map(|i| format!("cell_{}", i % 4)).collect(),
            (0..10).map(|i| format!("sm_{}", i)).collect(),
        )
        .unwrap();

        config.reuse_artifacts = true;
        let err = EnsembleOrchestrator::<TestBackend>::new(config, Default::default())
            .run(&wider)
            .unwrap_err();
        let phase = err.downcast_ref::<EnsembleError>().and_then(|e| e.phase());
        assert_eq!(phase, Some(Phase::Load));
        assert!(format!("{:#}", err).contains("stored model expects"));
    }
}
