//! Test-split evaluation.
//!
//! Runs the restored model over `<data_root>/test.txt` with the deterministic
//! transform and accumulates top-1/top-5 accuracy plus per-class counts.

use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;

use burn::{
    data::dataloader::batcher::Batcher,
    module::Module,
    tensor::{backend::Backend, Tensor},
};
use hccr_core::{Error, EvaluationMetrics, Result, TrainingConfig, TEST_SPLIT};
use hccr_dataset::{
    BatchPipeline, HandwritingBatch, HandwritingBatcher, PipelineConfig, SampleSource,
    TransformPipeline,
};
use tracing::{debug, info};

use crate::checkpoint::{record_from_bytes, CheckpointStore};
use crate::model::{EfficientNetV2, EfficientNetV2Config, ImageClassifier};
use crate::trainer::panic_to_error;

const TOP_K: usize = 5;

/// Model restored from the newest checkpoint in a log root.
#[derive(Debug)]
pub struct RestoredModel<B: Backend> {
    pub model: EfficientNetV2<B>,
    pub epoch: usize,
    pub path: PathBuf,
}

/// Loads the latest checkpoint's model state into a fresh network.
///
/// Records are stored at full precision, so state saved from the autodiff
/// training backend loads into a plain inference backend.
pub fn load_latest_model<B: Backend>(
    config: &TrainingConfig,
    device: &B::Device,
) -> Result<RestoredModel<B>> {
    let store = CheckpointStore::new(&config.log_root);
    let path = store.find_latest()?;
    let checkpoint = store.load(&path)?;

    let model = EfficientNetV2Config::new(config.num_classes, config.model).init::<B>(device);
    let record = record_from_bytes::<B, <EfficientNetV2<B> as Module<B>>::Record>(
        checkpoint.model_state,
        device,
    )
    .map_err(|e| Error::corrupt_checkpoint(&path, e))?;

    info!(
        "Loaded model from {} (epoch {})",
        path.display(),
        checkpoint.epoch
    );

    Ok(RestoredModel {
        model: model.load_record(record),
        epoch: checkpoint.epoch,
        path,
    })
}

/// Indices of the `k` highest scores, best first. Ties go to the lower index.
pub fn top_k(scores: &[f32], k: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]).then(a.cmp(&b)));
    order.truncate(k);
    order
}

/// Batched inference over a sample source.
pub struct Evaluator<B: Backend> {
    transform: TransformPipeline,
    pipeline: PipelineConfig,
    batcher: HandwritingBatcher,
    device: B::Device,
}

impl<B: Backend> Evaluator<B> {
    pub fn new(config: &TrainingConfig, device: B::Device) -> Self {
        let transform = TransformPipeline::new(config.image_size, &config.transform).deterministic();
        let pipeline = PipelineConfig {
            shuffle: false,
            ..PipelineConfig::from_training(config)
        };

        Self {
            transform,
            pipeline,
            batcher: HandwritingBatcher::new(config.image_size),
            device,
        }
    }

    /// Number of batches [`Evaluator::evaluate`] will run for `source`.
    pub fn num_batches(&self, source: &SampleSource) -> usize {
        source.len().div_ceil(self.pipeline.batch_size.max(1))
    }

    /// Evaluates `model` on every sample of `source` in manifest order.
    /// `on_batch` is called with the number of finished batches.
    pub fn evaluate<M, F>(
        &self,
        model: &M,
        source: &SampleSource,
        mut on_batch: F,
    ) -> Result<EvaluationMetrics>
    where
        M: ImageClassifier<B>,
        F: FnMut(usize),
    {
        if source.is_empty() {
            return Err(Error::Dataset("evaluation set is empty".into()));
        }

        let pipeline = BatchPipeline::new(source, &self.transform, self.pipeline)?;
        let plan = pipeline.plan(0);
        let mut metrics = EvaluationMetrics::new();

        pipeline.for_each_batch(&plan, |batch_index, samples| {
            let labels: Vec<usize> = samples.iter().map(|s| s.label).collect();
            let batch: HandwritingBatch<B> = self.batcher.batch(samples, &self.device);
            let scores = predict_scores(model, batch.images)?;

            let num_classes = model.num_classes();
            for (row, &actual) in scores.chunks(num_classes).zip(&labels) {
                let ranked = top_k(row, TOP_K);
                metrics.record(actual, ranked[0], &ranked);
            }

            debug!(
                "Batch {}: running accuracy {:.4}",
                batch_index + 1,
                metrics.accuracy
            );
            on_batch(batch_index + 1);
            Ok(())
        })?;

        info!(
            "Evaluated {} samples: top-1 {:.4}, top-5 {:.4}",
            metrics.num_samples, metrics.accuracy, metrics.top5_accuracy
        );
        Ok(metrics)
    }
}

/// Forward pass returning row-major `[N, num_classes]` logits on the host.
pub(crate) fn predict_scores<B, M>(model: &M, images: Tensor<B, 4>) -> Result<Vec<f32>>
where
    B: Backend,
    M: ImageClassifier<B>,
{
    let logits = panic::catch_unwind(AssertUnwindSafe(|| model.forward(images)))
        .map_err(panic_to_error)?;

    logits
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| Error::Model(format!("failed to read logits: {e:?}")))
}

/// Evaluates the latest checkpoint on `<data_root>/test.txt`.
pub fn evaluate<B: Backend>(config: &TrainingConfig, device: B::Device) -> Result<EvaluationMetrics> {
    config.validate()?;

    let source = SampleSource::open(&config.manifest_path(TEST_SPLIT), config.num_classes)?;
    let restored = load_latest_model::<B>(config, &device)?;

    Evaluator::<B>::new(config, device).evaluate(&restored.model, &source, |_| {})
}
