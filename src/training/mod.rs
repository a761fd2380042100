pub mod trainer;
pub mod scheduler;
pub mod callbacks;

use crate::model::checkpoint::TrainedArtifact;
use burn::tensor::backend::Backend;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Training configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Epoch budget
    pub num_epochs: usize,
    /// Batch size
    pub batch_size: usize,
    /// Learning rate when targets are compressed below the gene panel
    pub compressed_lr: f64,
    /// Learning rate when the model regresses the full gene panel
    pub full_lr: f64,
    /// Epochs without improvement before the learning rate decays
    pub lr_patience: usize,
    /// Multiplicative learning-rate decay on plateau
    pub lr_decay: f64,
    /// Relative improvement the plateau scheduler requires
    pub lr_threshold: f64,
    /// Decoupled weight decay
    pub weight_decay: f64,
    /// Maximum global L2 norm of the gradients (0 = disabled)
    pub gradient_clip: f64,
    /// Huber loss transition point
    pub huber_delta: f32,
    /// Epochs without checkpoint improvement before stopping
    pub early_stopping_patience: usize,
    /// Random seed for parameter init, dropout and batch order
    pub seed: u64,
    /// Show an epoch progress bar
    pub show_progress: bool,
    /// Log progress every N epochs
    pub log_frequency: usize,
    /// Optional JSON file receiving the per-epoch metrics history
    pub metrics_log: Option<PathBuf>,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            num_epochs: 10,
            batch_size: 32,
            compressed_lr: 1e-3,
            full_lr: 1e-5,
            lr_patience: 500,
            lr_decay: 0.9999,
            lr_threshold: 1e-4,
            weight_decay: 1e-4,
            gradient_clip: 1.0,
            huber_delta: 1.0,
            early_stopping_patience: 5000,
            seed: 18,
            show_progress: true,
            log_frequency: 100,
            metrics_log: None,
        }
    }
}

impl TrainingConfig {
    /// Create configuration for quick testing
    pub fn quick_test() -> Self {
        Self {
            num_epochs: 3,
            batch_size: 16,
            show_progress: false,
            log_frequency: 1,
            ..Default::default()
        }
    }

    /// Learning rate for a model mapping `n_features` inputs to `n_outputs` outputs
    ///
    /// Outputs narrower than the input feature width take the compressed rate.
    pub fn learning_rate_for(&self, n_outputs: usize, n_features: usize) -> f64 {
        if n_outputs < n_features {
            self.compressed_lr
        } else {
            self.full_lr
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        use crate::utils::validation::{in_range, positive};
        positive(self.num_epochs, "num_epochs")?;
        positive(self.batch_size, "batch_size")?;
        positive(self.compressed_lr, "compressed_lr")?;
        positive(self.full_lr, "full_lr")?;
        in_range(self.lr_decay, f64::MIN_POSITIVE, 1.0, "lr_decay")?;
        positive(self.huber_delta, "huber_delta")?;
        positive(self.log_frequency, "log_frequency")?;
        in_range(self.gradient_clip, 0.0, f64::MAX, "gradient_clip")?;
        Ok(())
    }
}

/// Inputs of one training run
///
/// Training targets are already reduced; validation targets stay in gene
/// space and are transformed by the trainer.
#[derive(Debug, Clone)]
pub struct TrainingData {
    pub x_train: Array2<f32>,
    pub y_train_reduced: Array2<f32>,
    pub x_val: Array2<f32>,
    pub y_val_full: Array2<f32>,
}

/// Metrics of one epoch
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EpochMetrics {
    pub epoch: usize,
    /// Mean Huber loss over the training batches
    pub train_loss: f64,
    /// Mean Huber loss over the validation batches, in reduced space
    pub val_loss: Option<f64>,
    /// MRRMSE of the validation predictions, in gene space
    pub val_mrrmse: Option<f64>,
    pub learning_rate: f64,
}

impl EpochMetrics {
    /// Loss that drives checkpointing, early stopping and the scheduler
    pub fn criterion(&self) -> f64 {
        self.val_loss.unwrap_or(self.train_loss)
    }
}

/// Training state
#[derive(Debug, Clone)]
pub struct TrainingState {
    /// Completed epochs
    pub epoch: usize,
    /// Current global step
    pub global_step: usize,
    /// Best checkpoint criterion so far
    pub best_loss: f64,
    /// Best validation MRRMSE so far, reported only
    pub best_mrrmse: Option<f64>,
    /// Epoch of the current checkpoint
    pub best_epoch: usize,
    /// Number of epochs without improvement
    pub epochs_without_improvement: usize,
    /// Training loss history
    pub train_loss_history: Vec<f64>,
    /// Validation loss history
    pub val_loss_history: Vec<f64>,
    /// Learning rate history
    pub lr_history: Vec<f64>,
}

impl TrainingState {
    /// Create new training state
    pub fn new() -> Self {
        Self {
            epoch: 0,
            global_step: 0,
            best_loss: f64::INFINITY,
            best_mrrmse: None,
            best_epoch: 0,
            epochs_without_improvement: 0,
            train_loss_history: Vec::new(),
            val_loss_history: Vec::new(),
            lr_history: Vec::new(),
        }
    }

    /// Update after epoch; returns whether a new checkpoint should be taken
    pub fn update_epoch(&mut self, metrics: &EpochMetrics) -> bool {
        self.epoch += 1;
        self.train_loss_history.push(metrics.train_loss);
        if let Some(val_loss) = metrics.val_loss {
            self.val_loss_history.push(val_loss);
        }
        self.lr_history.push(metrics.learning_rate);

        if let Some(mrrmse) = metrics.val_mrrmse {
            if self.best_mrrmse.map_or(true, |best| mrrmse < best) {
                self.best_mrrmse = Some(mrrmse);
            }
        }

        let criterion = metrics.criterion();
        if criterion < self.best_loss {
            self.best_loss = criterion;
            self.best_epoch = metrics.epoch;
            self.epochs_without_improvement = 0;
            true
        } else {
            self.epochs_without_improvement += 1;
            false
        }
    }

    /// Check if should stop early
    pub fn should_stop_early(&self, patience: usize) -> bool {
        patience > 0 && self.epochs_without_improvement >= patience
    }
}

impl Default for TrainingState {
    fn default() -> Self {
        Self::new()
    }
}

/// Training result
#[derive(Debug, Clone)]
pub struct TrainingResult<B: Backend> {
    /// Best checkpoint, detached from the autodiff graph
    pub artifact: TrainedArtifact<B>,
    /// Final training state
    pub state: TrainingState,
    /// Whether early stopping ended the run
    pub stopped_early: bool,
    /// Training duration in seconds
    pub duration_secs: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn epoch(epoch: usize, train_loss: f64, val_loss: Option<f64>) -> EpochMetrics {
        EpochMetrics { epoch, train_loss, val_loss, val_mrrmse: val_loss.map(|v| v * 2.0), learning_rate: 1e-3 }
    }

    #[test]
    fn test_learning_rate_threshold() {
        let config = TrainingConfig::default();
        assert_eq!(config.learning_rate_for(10, 50), 1e-3);
        assert_eq!(config.learning_rate_for(50, 50), 1e-5);
    }

    #[test]
    fn test_checkpoint_requires_strict_improvement() {
        let mut state = TrainingState::new();
        assert!(state.update_epoch(&epoch(0, 1.0, Some(0.5))));
        assert!(!state.update_epoch(&epoch(1, 0.9, Some(0.5))));
        assert_eq!(state.epochs_without_improvement, 1);
        assert!(state.update_epoch(&epoch(2, 0.9, Some(0.4))));
        assert_eq!(state.best_epoch, 2);
        assert_eq!(state.epochs_without_improvement, 0);
        assert_eq!(state.best_mrrmse, Some(0.8));
    }

    #[test]
    fn test_empty_validation_falls_back_to_train_loss() {
        let mut state = TrainingState::new();
        assert!(state.update_epoch(&epoch(0, 1.0, None)));
        assert!(state.update_epoch(&epoch(1, 0.7, None)));
        assert!(!state.update_epoch(&epoch(2, 0.8, None)));
        assert_eq!(state.best_loss, 0.7);
        assert!(state.best_mrrmse.is_none());
        assert!(state.val_loss_history.is_empty());
    }

    #[test]
    fn test_early_stopping_patience() {
        let mut state = TrainingState::new();
        state.update_epoch(&epoch(0, 1.0, Some(1.0)));
        for e in 1..=3 {
            state.update_epoch(&epoch(e, 1.0, Some(1.0)));
        }
        assert!(state.should_stop_early(3));
        assert!(!state.should_stop_early(4));
        assert!(!state.should_stop_early(0));
    }

    #[test]
    fn test_config_validation() {
        assert!(TrainingConfig::default().validate().is_ok());
        let config = TrainingConfig { batch_size: 0, ..Default::default() };
        assert!(config.validate().is_err());
    }
}
