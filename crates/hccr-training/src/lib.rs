//! Training, evaluation and inference for handwritten Chinese characters.
//!
//! - EfficientNetV2 model definitions
//! - Epoch loop with checkpoint resume
//! - Reduce-on-plateau learning rate scheduling
//! - Test-split evaluation and single-image prediction

pub mod checkpoint;
pub mod evaluator;
pub mod lr_schedule;
pub mod model;
pub mod predictor;
pub mod trainer;

pub use checkpoint::{Checkpoint, CheckpointStore};
pub use evaluator::{evaluate, load_latest_model, Evaluator, RestoredModel};
pub use lr_schedule::PlateauScheduler;
pub use model::{EfficientNetV2, EfficientNetV2Config, ImageClassifier};
pub use predictor::{predict_image, Predictor};
pub use trainer::{train, ResumeState, Trainer, TrainingReport};
