//! Reduce-on-plateau learning rate policy.

use hccr_core::PlateauConfig;
use tracing::{debug, info};

/// Halves (by default) the learning rate once the tracked metric has failed to
/// improve for `patience` consecutive steps.
#[derive(Debug, Clone)]
pub struct PlateauScheduler {
    config: PlateauConfig,
    current_lr: f64,
    best_metric: Option<f64>,
    patience_counter: usize,
}

impl PlateauScheduler {
    pub fn new(initial_lr: f64, config: PlateauConfig) -> Self {
        Self {
            config,
            current_lr: initial_lr,
            best_metric: None,
            patience_counter: 0,
        }
    }

    pub fn current_lr(&self) -> f64 {
        self.current_lr
    }

    /// Overrides the rate, e.g. with the value restored from a checkpoint.
    pub fn set_lr(&mut self, lr: f64) {
        self.current_lr = lr;
    }

    pub fn best_metric(&self) -> Option<f64> {
        self.best_metric
    }

    /// Sets the best metric seen so far without counting a step.
    pub fn seed(&mut self, metric: f64) {
        self.best_metric = Some(metric);
        self.patience_counter = 0;
    }

    /// Records one epoch's metric. Returns `true` when the rate was reduced.
    ///
    /// After a reduction the best metric is cleared, so the next step sets a
    /// new baseline.
    pub fn step(&mut self, metric: f64) -> bool {
        let improved = match self.best_metric {
            Some(best) => metric < best - self.config.threshold,
            None => true,
        };

        if improved {
            self.best_metric = Some(metric);
            self.patience_counter = 0;
            return false;
        }

        self.patience_counter += 1;
        debug!(
            "Metric {:.6} did not improve ({}/{})",
            metric, self.patience_counter, self.config.patience
        );
        if self.patience_counter < self.config.patience {
            return false;
        }

        let old_lr = self.current_lr;
        self.current_lr = (self.current_lr * self.config.factor).max(self.config.min_lr);
        self.patience_counter = 0;
        self.best_metric = None;

        if self.current_lr < old_lr {
            info!(
                "Reducing learning rate: {:.3e} -> {:.3e}",
                old_lr, self.current_lr
            );
            true
        } else {
            false
        }
    }
}
