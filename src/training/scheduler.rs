/// Reduce-on-plateau learning-rate scheduler
///
/// Tracks the best value of a minimised metric; once it has failed to improve
/// by a relative `threshold` for more than `patience` consecutive steps the
/// learning rate is multiplied by `factor`.
#[derive(Debug, Clone)]
pub struct ReduceOnPlateau {
    lr: f64,
    factor: f64,
    patience: usize,
    threshold: f64,
    min_lr: f64,
    best: f64,
    num_bad_epochs: usize,
}

impl ReduceOnPlateau {
    /// Create reduce on plateau scheduler
    pub fn new(lr: f64, factor: f64, patience: usize, threshold: f64) -> Self {
        Self {
            lr,
            factor,
            patience,
            threshold,
            min_lr: 0.0,
            best: f64::INFINITY,
            num_bad_epochs: 0,
        }
    }

    /// Set lower bound on the learning rate
    pub fn with_min_lr(mut self, min_lr: f64) -> Self {
        self.min_lr = min_lr;
        self
    }

    /// Get current learning rate
    pub fn lr(&self) -> f64 {
        self.lr
    }

    /// Step the scheduler with this epoch's metric; returns the new learning rate
    pub fn step(&mut self, metric: f64) -> f64 {
        if metric < self.best * (1.0 - self.threshold) {
            self.best = metric;
            self.num_bad_epochs = 0;
        } else {
            self.num_bad_epochs += 1;
        }

        if self.num_bad_epochs > self.patience {
            let new_lr = (self.lr * self.factor).max(self.min_lr);
            if new_lr < self.lr {
                tracing::debug!("Reducing learning rate {:.3e} -> {:.3e}", self.lr, new_lr);
                self.lr = new_lr;
            }
            self.num_bad_epochs = 0;
        }

        self.lr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plateau_decays_after_patience() {
        let mut scheduler = ReduceOnPlateau::new(1e-3, 0.5, 2, 1e-4);
        assert_eq!(scheduler.step(1.0), 1e-3);
        // three epochs without improvement exceed a patience of two
        assert_eq!(scheduler.step(1.0), 1e-3);
        assert_eq!(scheduler.step(1.0), 1e-3);
        assert_eq!(scheduler.step(1.0), 5e-4);
        // counter restarts after a reduction
        assert_eq!(scheduler.step(1.0), 5e-4);
    }

    #[test]
    fn test_improvement_resets_counter() {
        let mut scheduler = ReduceOnPlateau::new(1e-3, 0.5, 1, 1e-4);
        scheduler.step(1.0);
        scheduler.step(1.0);
        scheduler.step(0.5);
        scheduler.step(0.5);
        assert_eq!(scheduler.lr(), 1e-3);
    }

    #[test]
    fn test_improvement_below_threshold_counts_as_plateau() {
        let mut scheduler = ReduceOnPlateau::new(1.0, 0.9999, 0, 1e-4);
        scheduler.step(1.0);
        let lr = scheduler.step(0.99999);
        assert!((lr - 0.9999).abs() < 1e-12);
    }

    #[test]
    fn test_min_lr_floor() {
        let mut scheduler = ReduceOnPlateau::new(1e-3, 0.1, 0, 1e-4).with_min_lr(5e-4);
        scheduler.step(1.0);
        assert_eq!(scheduler.step(1.0), 5e-4);
        assert_eq!(scheduler.step(1.0), 5e-4);
    }
}
