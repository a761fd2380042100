use crate::error::EnsembleError;
use crate::model::architecture::{init_model, PerturbationModel};
use crate::model::checkpoint::TrainedArtifact;
use crate::model::loss::{huber_loss, metrics};
use crate::model::{to_array, to_tensor, ModelConfig};
use crate::reduction::TargetTransform;
use crate::training::callbacks::{
    CallbackManager, MetricsLoggerCallback, ProgressLoggerCallback, TimerCallback,
};
use crate::training::scheduler::ReduceOnPlateau;
use crate::training::{EpochMetrics, TrainingConfig, TrainingData, TrainingResult, TrainingState};
use crate::utils::random::seeded_rng;
use anyhow::Result;
use burn::module::{AutodiffModule, ModuleVisitor, ParamId};
use burn::nn::loss::{HuberLoss, Reduction};
use burn::optim::{AdamWConfig, GradientsParams, Optimizer};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::{ElementConversion, TensorData};
use indicatif::{ProgressBar, ProgressStyle};
use ndarray::{s, Array2};
use rand::seq::SliceRandom;
use std::marker::PhantomData;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Trainer for the perturbation model
///
/// Runs the epoch loop on an autodiff backend and hands back the best
/// checkpoint on its inner backend.
pub struct Trainer<B: AutodiffBackend> {
    /// Training configuration
    config: TrainingConfig,
    /// Device
    device: B::Device,
}

impl<B: AutodiffBackend> Trainer<B> {
    /// Create new trainer
    pub fn new(config: TrainingConfig, device: B::Device) -> Self {
        Self { config, device }
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    /// Train a fresh model
    ///
    /// Checkpoints on strict improvement of the validation loss (the mean
    /// training loss when there is no validation data) and stops after
    /// `early_stopping_patience` epochs without one.
    pub fn train(
        &self,
        data: TrainingData,
        transform: Option<TargetTransform>,
        model_config: ModelConfig,
    ) -> Result<TrainingResult<B::InnerBackend>> {
        self.config.validate()?;
        model_config.validate()?;
        check_shapes(&data, transform.as_ref(), &model_config)?;

        let start_time = Instant::now();
        let n_outputs = model_config.n_outputs;
        let learning_rate = self.config.learning_rate_for(n_outputs, model_config.input_width());
        let has_validation = data.x_val.nrows() > 0;

        info!(
            "Training on {} rows ({} validation), {} features -> {} outputs, lr {:.0e}",
            data.x_train.nrows(),
            data.x_val.nrows(),
            model_config.input_width(),
            n_outputs,
            learning_rate
        );
        if !has_validation {
            warn!("No validation rows; checkpointing on the training loss");
        }

        let y_val_reduced = match &transform {
            Some(t) if has_validation => t.transform(data.y_val_full.view())?,
            _ => data.y_val_full.clone(),
        };

        B::seed(self.config.seed);
        let mut model = init_model::<B>(&model_config, &self.device);
        let mut optim = AdamWConfig::new()
            .with_weight_decay(self.config.weight_decay as f32)
            .init::<B, PerturbationModel<B>>();
        let mut scheduler = ReduceOnPlateau::new(
            learning_rate,
            self.config.lr_decay,
            self.config.lr_patience,
            self.config.lr_threshold,
        );
        let huber = huber_loss(self.config.huber_delta);
        let mut rng = seeded_rng(self.config.seed);

        let x_train = to_tensor::<B>(data.x_train.view(), &self.device);
        let y_train = to_tensor::<B>(data.y_train_reduced.view(), &self.device);
        let n_train = data.x_train.nrows();

        let mut callbacks = self.callbacks();
        let progress = self.progress_bar();
        let mut state = TrainingState::new();
        let mut best_model: Option<PerturbationModel<B::InnerBackend>> = None;
        let mut stopped_early = false;

        callbacks.on_train_begin();
        for epoch in 0..self.config.num_epochs {
            callbacks.on_epoch_begin(epoch);
            let lr = scheduler.lr();

            let mut order: Vec<usize> = (0..n_train).collect();
            order.shuffle(&mut rng);

            let mut loss_sum = 0.0;
            let mut n_batches = 0usize;
            for chunk in order.chunks(self.config.batch_size) {
                let indices = index_tensor::<B>(chunk, &self.device);
                let x = x_train.clone().select(0, indices.clone());
                let y = y_train.clone().select(0, indices);

                let loss = huber.forward(model.forward(x), y, Reduction::Mean);
                let loss_value: f64 = loss.clone().into_scalar().elem();
                if !loss_value.is_finite() {
                    return Err(EnsembleError::numeric(format!(
                        "non-finite training loss at epoch {}",
                        epoch + 1
                    ))
                    .into());
                }

                let grads = GradientsParams::from_grads(loss.backward(), &model);
                let grads = clip_global_norm::<B, _>(&model, grads, self.config.gradient_clip);
                model = optim.step(lr, model, grads);

                loss_sum += loss_value;
                n_batches += 1;
                state.global_step += 1;
            }
            let train_loss = loss_sum / n_batches.max(1) as f64;

            let (val_loss, val_mrrmse) = if has_validation {
                let (loss, mrrmse) = self.evaluate(
                    &model.valid(),
                    &data.x_val,
                    &y_val_reduced,
                    &data.y_val_full,
                    transform.as_ref(),
                    &huber,
                )?;
                (Some(loss), Some(mrrmse))
            } else {
                (None, None)
            };

            let metrics = EpochMetrics {
                epoch,
                train_loss,
                val_loss,
                val_mrrmse,
                learning_rate: lr,
            };
            if state.update_epoch(&metrics) {
                debug!("Epoch {}: new checkpoint at loss {:.6}", epoch + 1, state.best_loss);
                best_model = Some(model.valid());
            }
            scheduler.step(metrics.criterion());

            progress.set_message(format!(
                "best MRRMSE {} | best loss {:.4} | best epoch {}",
                state.best_mrrmse.map_or_else(|| "-".to_string(), |m| format!("{:.4}", m)),
                state.best_loss,
                state.best_epoch + 1
            ));
            progress.inc(1);
            callbacks.on_epoch_end(&state, &metrics);

            if state.should_stop_early(self.config.early_stopping_patience) {
                info!(
                    "Early stopping at epoch {}: no improvement for {} epochs",
                    epoch + 1,
                    state.epochs_without_improvement
                );
                stopped_early = true;
                break;
            }
        }
        progress.finish_and_clear();
        callbacks.on_train_end(&state);

        let model = best_model
            .ok_or_else(|| EnsembleError::numeric("training never produced a finite checkpoint"))?;
        info!(
            "Best checkpoint from epoch {} (loss {:.6}{})",
            state.best_epoch + 1,
            state.best_loss,
            state
                .best_mrrmse
                .map_or_else(String::new, |m| format!(", best MRRMSE {:.4}", m))
        );

        Ok(TrainingResult {
            artifact: TrainedArtifact {
                transform,
                model,
                model_config,
            },
            state,
            stopped_early,
            duration_secs: start_time.elapsed().as_secs_f64(),
        })
    }

    /// Validation loss in reduced space and MRRMSE in gene space
    fn evaluate(
        &self,
        model: &PerturbationModel<B::InnerBackend>,
        x_val: &Array2<f32>,
        y_val_reduced: &Array2<f32>,
        y_val_full: &Array2<f32>,
        transform: Option<&TargetTransform>,
        huber: &HuberLoss,
    ) -> Result<(f64, f64)> {
        let n = x_val.nrows();
        let batch_size = self.config.batch_size;
        let mut predictions = Array2::<f32>::zeros((n, y_val_reduced.ncols()));
        let mut loss_sum = 0.0;
        let mut n_batches = 0usize;

        for start in (0..n).step_by(batch_size) {
            let end = (start + batch_size).min(n);
            let x = to_tensor::<B::InnerBackend>(x_val.slice(s![start..end, ..]), &self.device);
            let y = to_tensor::<B::InnerBackend>(y_val_reduced.slice(s![start..end, ..]), &self.device);

            let output = model.forward(x);
            let loss: f64 = huber.forward(output.clone(), y, Reduction::Mean).into_scalar().elem();
            predictions.slice_mut(s![start..end, ..]).assign(&to_array(output)?);

            loss_sum += loss;
            n_batches += 1;
        }

        let val_loss = loss_sum / n_batches.max(1) as f64;
        if !val_loss.is_finite() {
            return Err(EnsembleError::numeric("non-finite validation loss").into());
        }

        let predictions = match transform {
            Some(t) => t.inverse_transform(predictions.view())?,
            None => predictions,
        };
        Ok((val_loss, metrics::mrrmse(predictions.view(), y_val_full.view())))
    }

    fn callbacks(&self) -> CallbackManager {
        let mut callbacks = CallbackManager::new();
        callbacks.add_callback(ProgressLoggerCallback::new(self.config.log_frequency));
        callbacks.add_callback(TimerCallback::new());
        if let Some(path) = &self.config.metrics_log {
            callbacks.add_callback(MetricsLoggerCallback::new(path));
        }
        callbacks
    }

    fn progress_bar(&self) -> ProgressBar {
        if !self.config.show_progress {
            return ProgressBar::hidden();
        }
        let bar = ProgressBar::new(self.config.num_epochs as u64);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:30.cyan/blue}] {pos}/{len} {msg}")
        {
            bar.set_style(style.progress_chars("=>-"));
        }
        bar
    }
}

fn check_shapes(
    data: &TrainingData,
    transform: Option<&TargetTransform>,
    model_config: &ModelConfig,
) -> Result<()> {
    let width = model_config.input_width();
    let n_genes = transform.map_or(model_config.n_outputs, |t| t.n_genes());

    let problem = if data.x_train.nrows() == 0 {
        Some("no training rows".to_string())
    } else if data.x_train.nrows() != data.y_train_reduced.nrows() {
        Some(format!(
            "{} training rows but {} training targets",
            data.x_train.nrows(),
            data.y_train_reduced.nrows()
        ))
    } else if data.x_train.ncols() != width || data.x_val.ncols() != width {
        Some(format!(
            "feature width mismatch: model {}, training {}, validation {}",
            width,
            data.x_train.ncols(),
            data.x_val.ncols()
        ))
    } else if data.y_train_reduced.ncols() != model_config.n_outputs {
        Some(format!(
            "training targets have {} columns but the model outputs {}",
            data.y_train_reduced.ncols(),
            model_config.n_outputs
        ))
    } else if transform.is_some_and(|t| t.n_components() != model_config.n_outputs) {
        Some("reducer components disagree with the model output width".to_string())
    } else if data.x_val.nrows() != data.y_val_full.nrows() {
        Some(format!(
            "{} validation rows but {} validation targets",
            data.x_val.nrows(),
            data.y_val_full.nrows()
        ))
    } else if data.x_val.nrows() > 0 && data.y_val_full.ncols() != n_genes {
        Some(format!(
            "validation targets have {} genes, expected {}",
            data.y_val_full.ncols(),
            n_genes
        ))
    } else {
        None
    };

    match problem {
        Some(message) => Err(EnsembleError::configuration(message).into()),
        None => Ok(()),
    }
}

fn index_tensor<B: Backend>(indices: &[usize], device: &B::Device) -> Tensor<B, 1, Int> {
    let values: Vec<i64> = indices.iter().map(|&i| i as i64).collect();
    Tensor::from_data(TensorData::new(values, [indices.len()]), device)
}

/// Sum of squared gradient entries over every float parameter
struct GradientNorm<'a, B: AutodiffBackend> {
    grads: &'a GradientsParams,
    sum_sq: f64,
    _backend: PhantomData<B>,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for GradientNorm<'_, B> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, _tensor: &Tensor<B, D>) {
        if let Some(grad) = self.grads.get::<B::InnerBackend, D>(id) {
            let sq: f64 = grad.powf_scalar(2.0).sum().into_scalar().elem();
            self.sum_sq += sq;
        }
    }
}

struct GradientScale<'a, B: AutodiffBackend> {
    grads: &'a mut GradientsParams,
    scale: f32,
    _backend: PhantomData<B>,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for GradientScale<'_, B> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, _tensor: &Tensor<B, D>) {
        if let Some(grad) = self.grads.remove::<B::InnerBackend, D>(id.clone()) {
            self.grads
                .register::<B::InnerBackend, D>(id, grad.mul_scalar(self.scale));
        }
    }
}

/// Global L2 norm of the gradients of `module`
pub fn gradient_norm<B: AutodiffBackend, M: AutodiffModule<B>>(module: &M, grads: &GradientsParams) -> f64 {
    let mut visitor = GradientNorm::<B> {
        grads,
        sum_sq: 0.0,
        _backend: PhantomData,
    };
    module.visit(&mut visitor);
    visitor.sum_sq.sqrt()
}

/// Rescale all gradients together so their global L2 norm is at most `max_norm`
pub fn clip_global_norm<B: AutodiffBackend, M: AutodiffModule<B>>(
    module: &M,
    mut grads: GradientsParams,
    max_norm: f64,
) -> GradientsParams {
    if max_norm <= 0.0 {
        return grads;
    }
    let total = gradient_norm::<B, M>(module, &grads);
    if total > max_norm {
        let mut visitor = GradientScale::<B> {
            grads: &mut grads,
            scale: (max_norm / (total + 1e-6)) as f32,
            _backend: PhantomData,
        };
        module.visit(&mut visitor);
    }
    grads
}
