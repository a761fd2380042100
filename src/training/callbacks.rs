use crate::training::{EpochMetrics, TrainingState};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Training callback trait
///
/// Callbacks observe the training loop; they never influence checkpointing
/// or stopping.
pub trait TrainingCallback {
    /// Called at the start of training
    fn on_train_begin(&mut self) {}

    /// Called at the end of training
    fn on_train_end(&mut self, _state: &TrainingState) {}

    /// Called at the start of each epoch
    fn on_epoch_begin(&mut self, _epoch: usize) {}

    /// Called at the end of each epoch
    fn on_epoch_end(&mut self, _state: &TrainingState, _metrics: &EpochMetrics) {}
}

/// Callback manager that handles multiple callbacks
#[derive(Default)]
pub struct CallbackManager {
    callbacks: Vec<Box<dyn TrainingCallback>>,
}

impl CallbackManager {
    /// Create new callback manager
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a callback
    pub fn add_callback<C: TrainingCallback + 'static>(&mut self, callback: C) {
        self.callbacks.push(Box::new(callback));
    }

    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }

    pub fn on_train_begin(&mut self) {
        for callback in &mut self.callbacks {
            callback.on_train_begin();
        }
    }

    pub fn on_train_end(&mut self, state: &TrainingState) {
        for callback in &mut self.callbacks {
            callback.on_train_end(state);
        }
    }

    pub fn on_epoch_begin(&mut self, epoch: usize) {
        for callback in &mut self.callbacks {
            callback.on_epoch_begin(epoch);
        }
    }

    pub fn on_epoch_end(&mut self, state: &TrainingState, metrics: &EpochMetrics) {
        for callback in &mut self.callbacks {
            callback.on_epoch_end(state, metrics);
        }
    }
}

/// Progress logging callback
pub struct ProgressLoggerCallback {
    log_frequency: usize,
}

impl ProgressLoggerCallback {
    /// Create new progress logger
    pub fn new(log_frequency: usize) -> Self {
        Self {
            log_frequency: log_frequency.max(1),
        }
    }
}

impl TrainingCallback for ProgressLoggerCallback {
    fn on_epoch_end(&mut self, state: &TrainingState, metrics: &EpochMetrics) {
        if (metrics.epoch + 1) % self.log_frequency != 0 {
            return;
        }
        match (metrics.val_loss, metrics.val_mrrmse) {
            (Some(val_loss), Some(mrrmse)) => tracing::info!(
                "Epoch {} - train loss: {:.4}, val loss: {:.4}, val MRRMSE: {:.4}, best epoch: {}",
                metrics.epoch + 1,
                metrics.train_loss,
                val_loss,
                mrrmse,
                state.best_epoch + 1
            ),
            _ => tracing::info!(
                "Epoch {} - train loss: {:.4}, best epoch: {}",
                metrics.epoch + 1,
                metrics.train_loss,
                state.best_epoch + 1
            ),
        }
    }
}

/// Metrics logger callback that saves metrics to file
pub struct MetricsLoggerCallback {
    log_file: PathBuf,
    metrics_history: Vec<EpochMetrics>,
}

impl MetricsLoggerCallback {
    /// Create new metrics logger
    pub fn new<P: AsRef<Path>>(log_file: P) -> Self {
        Self {
            log_file: log_file.as_ref().to_path_buf(),
            metrics_history: Vec::new(),
        }
    }

    pub fn history(&self) -> &[EpochMetrics] {
        &self.metrics_history
    }

    /// Save metrics to file
    fn save_metrics(&self) -> anyhow::Result<()> {
        if let Some(parent) = self.log_file.parent().filter(|p| !p.as_os_str().is_empty()) {
            crate::utils::ensure_dir(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.metrics_history)?;
        std::fs::write(&self.log_file, json)?;
        Ok(())
    }
}

impl TrainingCallback for MetricsLoggerCallback {
    fn on_epoch_end(&mut self, _state: &TrainingState, metrics: &EpochMetrics) {
        self.metrics_history.push(metrics.clone());
    }

    fn on_train_end(&mut self, _state: &TrainingState) {
        if let Err(e) = self.save_metrics() {
            tracing::warn!("Failed to save metrics to {:?}: {}", self.log_file, e);
        }
    }
}

/// Timer callback that tracks training time
#[derive(Default)]
pub struct TimerCallback {
    start_time: Option<Instant>,
    epoch_start: Option<Instant>,
    epoch_times: Vec<Duration>,
}

impl TimerCallback {
    /// Create new timer callback
    pub fn new() -> Self {
        Self::default()
    }

    /// Get average epoch time
    pub fn average_epoch_time(&self) -> Option<Duration> {
        if self.epoch_times.is_empty() {
            None
        } else {
            let total: Duration = self.epoch_times.iter().sum();
            Some(total / self.epoch_times.len() as u32)
        }
    }
}

impl TrainingCallback for TimerCallback {
    fn on_train_begin(&mut self) {
        self.start_time = Some(Instant::now());
    }

    fn on_epoch_begin(&mut self, _epoch: usize) {
        self.epoch_start = Some(Instant::now());
    }

    fn on_epoch_end(&mut self, _state: &TrainingState, _metrics: &EpochMetrics) {
        if let Some(start) = self.epoch_start.take() {
            self.epoch_times.push(start.elapsed());
        }
    }

    fn on_train_end(&mut self, state: &TrainingState) {
        if let Some(start) = self.start_time {
            tracing::info!(
                "Training completed in {} ({} epochs, {:.2?} per epoch)",
                crate::utils::format_duration(start.elapsed().as_secs_f64()),
                state.epoch,
                self.average_epoch_time().unwrap_or_default()
            );
        }
    }
}
