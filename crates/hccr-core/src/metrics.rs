//! Training progress records and evaluation metrics.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Mean loss over one logging window of batches.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ProgressRecord {
    /// Epoch the window belongs to
    pub epoch: usize,
    /// 1-based index of the last batch in the window
    pub batch_index: usize,
    /// Mean per-batch loss over the window
    pub mean_loss: f64,
    /// Learning rate in effect during the window
    pub learning_rate: f64,
}

/// What happened during one completed epoch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpochSummary {
    pub epoch: usize,
    pub num_batches: usize,
    pub num_samples: usize,
    /// Loss of the final batch, the value fed to the plateau scheduler
    pub last_loss: f64,
    /// Learning rate after the scheduler step, as checkpointed
    pub learning_rate: f64,
    /// Progress records emitted during the epoch
    pub progress: Vec<ProgressRecord>,
}

/// Accumulates per-batch losses and emits a record every `interval` batches.
///
/// A trailing window shorter than `interval` is never reported.
#[derive(Debug, Clone)]
pub struct ProgressWindow {
    interval: usize,
    running_loss: f64,
    batches_in_window: usize,
}

impl ProgressWindow {
    pub fn new(interval: usize) -> Self {
        Self {
            interval: interval.max(1),
            running_loss: 0.0,
            batches_in_window: 0,
        }
    }

    /// Adds the loss of batch `batch_index` (0-based) and returns a record
    /// when the window is full.
    pub fn push(
        &mut self,
        epoch: usize,
        batch_index: usize,
        loss: f64,
        learning_rate: f64,
    ) -> Option<ProgressRecord> {
        self.running_loss += loss;
        self.batches_in_window += 1;

        if (batch_index + 1) % self.interval != 0 {
            return None;
        }

        let record = ProgressRecord {
            epoch,
            batch_index: batch_index + 1,
            mean_loss: self.running_loss / self.batches_in_window as f64,
            learning_rate,
        };
        self.running_loss = 0.0;
        self.batches_in_window = 0;
        Some(record)
    }
}

/// Correct / total counts for one class.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClassCounts {
    pub correct: usize,
    pub total: usize,
}

impl ClassCounts {
    pub fn accuracy(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.correct as f64 / self.total as f64
        }
    }
}

/// Evaluation results over a test manifest.
///
/// With thousands of classes a full confusion matrix is impractical, so only
/// per-class counts are kept.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvaluationMetrics {
    /// Top-1 accuracy
    pub accuracy: f64,
    /// Top-5 accuracy
    pub top5_accuracy: f64,
    /// Total number of samples evaluated
    pub num_samples: usize,
    /// Per-class correct/total counts, keyed by class index
    pub per_class: HashMap<usize, ClassCounts>,
    #[serde(skip)]
    top1_correct: usize,
    #[serde(skip)]
    top5_correct: usize,
}

impl EvaluationMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one prediction. `top5` holds the five highest-scoring classes
    /// (fewer when the model has fewer outputs).
    pub fn record(&mut self, actual: usize, predicted: usize, top5: &[usize]) {
        self.num_samples += 1;
        let counts = self.per_class.entry(actual).or_default();
        counts.total += 1;

        if actual == predicted {
            counts.correct += 1;
            self.top1_correct += 1;
        }
        if top5.contains(&actual) {
            self.top5_correct += 1;
        }

        self.accuracy = self.top1_correct as f64 / self.num_samples as f64;
        self.top5_accuracy = self.top5_correct as f64 / self.num_samples as f64;
    }

    /// Mean of per-class accuracies over classes that appeared.
    pub fn mean_class_accuracy(&self) -> f64 {
        if self.per_class.is_empty() {
            return 0.0;
        }
        let sum: f64 = self.per_class.values().map(ClassCounts::accuracy).sum();
        sum / self.per_class.len() as f64
    }

    /// Classes sorted by ascending accuracy, worst first.
    pub fn worst_classes(&self, n: usize) -> Vec<(usize, f64)> {
        let mut classes: Vec<(usize, f64)> = self
            .per_class
            .iter()
            .map(|(class, counts)| (*class, counts.accuracy()))
            .collect();
        classes.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        classes.truncate(n);
        classes
    }
}

/// Prediction result for a single image
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionResult {
    /// Predicted class ID
    pub class_id: usize,
    /// Softmax probability of the predicted class
    pub confidence: f64,
    /// Highest-scoring classes, best first
    pub top_k: Vec<(usize, f64)>,
}

impl PredictionResult {
    /// Builds a result from (class, probability) pairs sorted best first.
    pub fn from_ranked(top_k: Vec<(usize, f64)>) -> Option<Self> {
        let (class_id, confidence) = *top_k.first()?;
        Some(Self {
            class_id,
            confidence,
            top_k,
        })
    }
}
