//! Core type definitions shared across the workspace.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// One labeled handwriting image as recorded in a manifest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Sample {
    /// Path to the image file
    pub image_path: PathBuf,
    /// Class index, taken from the parent directory name
    pub label: usize,
}

impl Sample {
    /// Creates a new sample
    pub fn new(image_path: impl Into<PathBuf>, label: usize) -> Self {
        Self {
            image_path: image_path.into(),
            label,
        }
    }
}

/// What a run of the command-line tool does.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Train (or resume training) from the train split
    Train,
    /// Score the latest checkpoint on the test split
    Evaluate,
    /// Classify a single image
    Demo,
}

impl std::fmt::Display for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunMode::Train => write!(f, "train"),
            RunMode::Evaluate => write!(f, "evaluate"),
            RunMode::Demo => write!(f, "demo"),
        }
    }
}

/// EfficientNetV2 size variant.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ModelVariant {
    /// EfficientNetV2-S stage layout
    Small,
    /// Two-stage network for quick experiments and tests
    Tiny,
}

impl std::fmt::Display for ModelVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelVariant::Small => write!(f, "efficientnetv2_s"),
            ModelVariant::Tiny => write!(f, "efficientnetv2_tiny"),
        }
    }
}
