//! Single-image inference for demo mode.

use std::path::Path;

use burn::{
    data::dataloader::batcher::Batcher,
    tensor::{activation::softmax, backend::Backend},
};
use hccr_core::{Error, PredictionResult, Result, TrainingConfig};
use hccr_dataset::{
    decode_image, DecodedSample, HandwritingBatch, HandwritingBatcher, TransformPipeline,
};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::debug;

use crate::evaluator::{load_latest_model, top_k};
use crate::model::{EfficientNetV2, ImageClassifier};

/// Classifies single images with a fixed model.
pub struct Predictor<B: Backend, M = EfficientNetV2<B>> {
    model: M,
    transform: TransformPipeline,
    batcher: HandwritingBatcher,
    top_k: usize,
    device: B::Device,
}

impl<B: Backend, M: ImageClassifier<B>> Predictor<B, M> {
    pub fn new(model: M, config: &TrainingConfig, device: B::Device) -> Self {
        Self {
            model,
            transform: TransformPipeline::new(config.image_size, &config.transform).deterministic(),
            batcher: HandwritingBatcher::new(config.image_size),
            top_k: 5,
            device,
        }
    }

    /// Number of ranked classes kept in each result.
    pub fn with_top_k(mut self, k: usize) -> Self {
        self.top_k = k.max(1);
        self
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    /// Decodes and classifies the image at `path`.
    pub fn predict_path(&self, path: &Path) -> Result<PredictionResult> {
        let image = decode_image(path)?;
        self.predict(&image)
    }

    pub fn predict(&self, image: &image::DynamicImage) -> Result<PredictionResult> {
        // The deterministic transform never draws from the RNG
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let sample = DecodedSample {
            image: self.transform.apply(image, &mut rng),
            label: 0,
        };
        let batch: HandwritingBatch<B> = self.batcher.batch(vec![sample], &self.device);

        let probabilities = softmax(self.model.forward(batch.images), 1)
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|e| Error::Model(format!("failed to read probabilities: {e:?}")))?;

        let ranked: Vec<(usize, f64)> = top_k(&probabilities, self.top_k)
            .into_iter()
            .map(|class| (class, probabilities[class] as f64))
            .collect();
        debug!("Top classes: {:?}", ranked);

        PredictionResult::from_ranked(ranked)
            .ok_or_else(|| Error::Model("model produced no class scores".into()))
    }
}

/// Classifies `image_path` with the latest checkpoint in `config.log_root`.
pub fn predict_image<B: Backend>(
    config: &TrainingConfig,
    image_path: &Path,
    device: B::Device,
) -> Result<PredictionResult> {
    let restored = load_latest_model::<B>(config, &device)?;
    Predictor::<B>::new(restored.model, config, device).predict_path(image_path)
}
