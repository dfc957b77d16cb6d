//! Configuration structures for character recognition runs.
//!
//! A [`TrainingConfig`] is built once at startup (defaults, then an optional
//! TOML file, then command-line overrides) and passed by reference into every
//! component. Nothing reads process-wide state after that point.

use crate::types::{ModelVariant, RunMode};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Name of the training split directory and manifest stem under the data root.
pub const TRAIN_SPLIT: &str = "train";
/// Name of the test split directory and manifest stem under the data root.
pub const TEST_SPLIT: &str = "test";

/// Everything one run needs. Immutable once the run starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Number of epochs to reach (exclusive upper bound on the epoch index)
    pub epoch_count: usize,
    /// Mini-batch size
    pub batch_size: usize,
    /// Initial learning rate for Adam
    pub learning_rate: f64,
    /// Side length of the square network input
    pub image_size: usize,
    /// Dataset root holding `train/`, `test/` and their manifests
    pub data_root: PathBuf,
    /// Directory holding per-epoch checkpoints
    pub log_root: PathBuf,
    /// Number of character classes
    pub num_classes: usize,
    /// Base seed for the per-epoch shuffle
    pub seed: u64,
    /// Decode worker threads
    pub num_workers: usize,
    /// Batches decoded ahead of the optimization loop
    pub prefetch_batches: usize,
    /// Emit a progress record every this many batches
    pub log_interval: usize,
    /// Network variant
    pub model: ModelVariant,
    /// Learning-rate plateau policy
    pub plateau: PlateauConfig,
    /// Image transform parameters
    pub transform: TransformConfig,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epoch_count: 50,
            batch_size: 512,
            learning_rate: 1e-4,
            image_size: 32,
            data_root: PathBuf::from("../../data/"),
            log_root: PathBuf::from("../../log/"),
            num_classes: 3755,
            seed: 42,
            num_workers: 4,
            prefetch_batches: 2,
            log_interval: 200,
            model: ModelVariant::Small,
            plateau: PlateauConfig::default(),
            transform: TransformConfig::default(),
        }
    }
}

impl TrainingConfig {
    /// Directory of class sub-directories for a split.
    pub fn split_dir(&self, split: &str) -> PathBuf {
        self.data_root.join(split)
    }

    /// Manifest path for a split (`<data_root>/<split>.txt`).
    pub fn manifest_path(&self, split: &str) -> PathBuf {
        self.data_root.join(format!("{split}.txt"))
    }

    /// Rejects values that would make a run meaningless.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be greater than 0".into()));
        }
        if self.num_classes == 0 {
            return Err(Error::Config("num_classes must be greater than 0".into()));
        }
        if self.image_size == 0 {
            return Err(Error::Config("image_size must be greater than 0".into()));
        }
        if !(self.learning_rate > 0.0) {
            return Err(Error::Config(format!(
                "learning_rate must be positive, got {}",
                self.learning_rate
            )));
        }
        if self.log_interval == 0 {
            return Err(Error::Config("log_interval must be greater than 0".into()));
        }
        self.plateau.validate()?;
        self.transform.validate()
    }
}

/// Reduce-on-plateau parameters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PlateauConfig {
    /// Multiplier applied to the rate on a plateau
    pub factor: f64,
    /// Consecutive non-improving epochs that trigger a reduction
    pub patience: usize,
    /// Minimum decrease that counts as an improvement
    pub threshold: f64,
    /// Floor for the learning rate
    pub min_lr: f64,
}

impl Default for PlateauConfig {
    fn default() -> Self {
        Self {
            factor: 0.5,
            patience: 2,
            threshold: 0.0,
            min_lr: 0.0,
        }
    }
}

impl PlateauConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.factor > 0.0 && self.factor < 1.0) {
            return Err(Error::Config(format!(
                "plateau factor must be in (0, 1), got {}",
                self.factor
            )));
        }
        if self.patience == 0 {
            return Err(Error::Config("plateau patience must be at least 1".into()));
        }
        Ok(())
    }
}

/// Image transform parameters applied to every decoded sample.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TransformConfig {
    /// Per-channel mean [R, G, B]
    pub mean: [f32; 3],
    /// Per-channel standard deviation [R, G, B]
    pub std: [f32; 3],
    /// Random color jitter, `None` keeps the transform deterministic
    pub color_jitter: Option<ColorJitterConfig>,
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            // ImageNet statistics
            mean: [0.485, 0.456, 0.406],
            std: [0.229, 0.224, 0.225],
            color_jitter: None,
        }
    }
}

impl TransformConfig {
    pub fn validate(&self) -> Result<()> {
        if self.std.iter().any(|s| *s <= 0.0) {
            return Err(Error::Config(format!(
                "normalization std must be positive, got {:?}",
                self.std
            )));
        }
        if let Some(jitter) = &self.color_jitter {
            for (name, value) in [
                ("brightness", jitter.brightness),
                ("contrast", jitter.contrast),
                ("saturation", jitter.saturation),
            ] {
                if !(0.0..1.0).contains(&value) {
                    return Err(Error::Config(format!(
                        "color jitter {name} must be in [0, 1), got {value}"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Color jitter strengths; each factor is drawn from `[1 - x, 1 + x]`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ColorJitterConfig {
    pub brightness: f32,
    pub contrast: f32,
    pub saturation: f32,
}

impl Default for ColorJitterConfig {
    fn default() -> Self {
        Self {
            brightness: 0.2,
            contrast: 0.2,
            saturation: 0.2,
        }
    }
}

/// Top-level settings consumed by the command-line tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// What the tool should do
    pub mode: RunMode,
    /// Image classified in demo mode
    pub demo_image: PathBuf,
    /// Training / evaluation settings
    pub training: TrainingConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            mode: RunMode::Demo,
            demo_image: PathBuf::from("../asserts/pei.png"),
            training: TrainingConfig::default(),
        }
    }
}

impl AppConfig {
    /// Reads an `AppConfig` from a TOML file; missing keys keep their defaults.
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        crate::cli::load_toml_config(path)
    }
}
