//! Epoch loop with checkpoint resume and plateau learning-rate control.
//!
//! A run moves through INIT (fresh model, Adam, plateau scheduler), then
//! RESUMING when the log root holds a checkpoint or FIRST_RUN when it does
//! not, then one EPOCH_LOOP pass per remaining epoch, then DONE.
//!
//! Every epoch shuffles the training set with a RNG seeded from
//! `(seed, epoch)`, steps the optimizer once per batch at the current rate,
//! logs a [`ProgressRecord`] every `log_interval` batches, feeds the final
//! batch's loss to the scheduler and writes a checkpoint.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;

use burn::{
    data::dataloader::batcher::Batcher,
    module::{AutodiffModule, Module},
    nn::loss::CrossEntropyLossConfig,
    optim::{AdamConfig, GradientsParams, Optimizer},
    tensor::{backend::AutodiffBackend, ElementConversion},
};
use hccr_core::{
    EpochSummary, Error, ProgressRecord, ProgressWindow, Result, TrainingConfig, TRAIN_SPLIT,
};
use hccr_dataset::{
    BatchPipeline, HandwritingBatch, HandwritingBatcher, PipelineConfig, SampleSource,
    TransformPipeline,
};
use tracing::{info, warn};

use crate::checkpoint::{record_from_bytes, record_to_bytes, Checkpoint, CheckpointStore};
use crate::lr_schedule::PlateauScheduler;
use crate::model::{EfficientNetV2, EfficientNetV2Config, ImageClassifier};

/// Where the epoch loop starts.
#[derive(Debug, Clone, PartialEq)]
pub struct ResumeState {
    pub start_epoch: usize,
    /// Loss stored with the restored checkpoint, 0.0 on a first run
    pub loss: f64,
    pub resumed_from: Option<PathBuf>,
}

impl ResumeState {
    fn first_run() -> Self {
        Self {
            start_epoch: 0,
            loss: 0.0,
            resumed_from: None,
        }
    }
}

/// Outcome of [`Trainer::run`].
#[derive(Debug)]
pub struct TrainingReport<M> {
    pub start_epoch: usize,
    pub resumed_from: Option<PathBuf>,
    pub epochs: Vec<EpochSummary>,
    pub model: M,
}

/// Drives training for one run. Model and optimizer are only touched on the
/// calling thread.
pub struct Trainer<B: AutodiffBackend> {
    config: TrainingConfig,
    store: CheckpointStore,
    scheduler: PlateauScheduler,
    batcher: HandwritingBatcher,
    device: B::Device,
}

impl<B: AutodiffBackend> Trainer<B> {
    pub fn new(config: TrainingConfig, device: B::Device) -> Self {
        let store = CheckpointStore::new(&config.log_root);
        let scheduler = PlateauScheduler::new(config.learning_rate, config.plateau);
        let batcher = HandwritingBatcher::new(config.image_size);

        Self {
            config,
            store,
            scheduler,
            batcher,
            device,
        }
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &PlateauScheduler {
        &self.scheduler
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    /// Restores model, optimizer and learning rate from the latest checkpoint
    /// when one exists.
    pub fn restore<M, O>(&mut self, model: M, optimizer: O) -> Result<(M, O, ResumeState)>
    where
        M: ImageClassifier<B> + AutodiffModule<B>,
        O: Optimizer<M, B>,
    {
        // A log root that cannot be listed must not be mistaken for a first run
        let Some((_, path)) = self.store.list()?.pop() else {
            info!("No checkpoint in {}, starting from epoch 0", self.store.log_root().display());
            return Ok((model, optimizer, ResumeState::first_run()));
        };

        let checkpoint = self.store.load(&path)?;

        let model_record = record_from_bytes::<B, M::Record>(checkpoint.model_state, &self.device)
            .map_err(|e| Error::corrupt_checkpoint(&path, e))?;
        let optimizer_record =
            record_from_bytes::<B, O::Record>(checkpoint.optimizer_state, &self.device)
                .map_err(|e| Error::corrupt_checkpoint(&path, e))?;

        let model = model.load_record(model_record);
        let optimizer = optimizer.load_record(optimizer_record);

        self.scheduler.set_lr(checkpoint.learning_rate);
        self.scheduler.seed(checkpoint.loss);

        info!(
            "Resuming after epoch {} (loss {:.6}, lr {:.3e})",
            checkpoint.epoch, checkpoint.loss, checkpoint.learning_rate
        );

        Ok((
            model,
            optimizer,
            ResumeState {
                start_epoch: checkpoint.epoch + 1,
                loss: checkpoint.loss,
                resumed_from: Some(path),
            },
        ))
    }

    /// Trains on `source` until `epoch_count`, resuming first if possible.
    pub fn run<M, O>(
        &mut self,
        source: &SampleSource,
        model: M,
        optimizer: O,
    ) -> Result<TrainingReport<M>>
    where
        M: ImageClassifier<B> + AutodiffModule<B>,
        O: Optimizer<M, B>,
    {
        if source.is_empty() {
            return Err(Error::Dataset("training set is empty".into()));
        }

        let (mut model, mut optimizer, state) = self.restore(model, optimizer)?;

        let transform = TransformPipeline::new(self.config.image_size, &self.config.transform);
        let pipeline = BatchPipeline::new(
            source,
            &transform,
            PipelineConfig::from_training(&self.config),
        )?;

        let mut epochs = Vec::new();
        for epoch in state.start_epoch..self.config.epoch_count {
            let (next, summary) = self.run_epoch(&pipeline, epoch, model, &mut optimizer)?;
            model = next;
            epochs.push(summary);
        }

        if epochs.is_empty() {
            info!(
                "Nothing to do: epoch {} >= epoch_count {}",
                state.start_epoch, self.config.epoch_count
            );
        }

        Ok(TrainingReport {
            start_epoch: state.start_epoch,
            resumed_from: state.resumed_from,
            epochs,
            model,
        })
    }

    fn run_epoch<M, O>(
        &mut self,
        pipeline: &BatchPipeline<'_>,
        epoch: usize,
        model: M,
        optimizer: &mut O,
    ) -> Result<(M, EpochSummary)>
    where
        M: ImageClassifier<B> + AutodiffModule<B>,
        O: Optimizer<M, B>,
    {
        let plan = pipeline.plan(epoch);
        let learning_rate = self.scheduler.current_lr();
        let mut window = ProgressWindow::new(self.config.log_interval);
        let mut progress = Vec::new();
        let mut last_loss = None;
        let mut current = Some(model);

        info!(
            "Epoch {}/{}: {} batches, lr {:.3e}",
            epoch + 1,
            self.config.epoch_count,
            plan.num_batches(),
            learning_rate
        );

        pipeline.for_each_batch(&plan, |batch_index, samples| {
            let model = current
                .take()
                .ok_or_else(|| Error::Training("model lost after a failed step".into()))?;
            let batch: HandwritingBatch<B> = self.batcher.batch(samples, &self.device);

            let (model, loss) = train_step(model, optimizer, batch, learning_rate)?;
            current = Some(model);
            last_loss = Some(loss);

            if let Some(record) = window.push(epoch, batch_index, loss, learning_rate) {
                log_progress(&record);
                progress.push(record);
            }
            Ok(())
        })?;

        let model = current.ok_or_else(|| Error::Training("model lost after epoch".into()))?;
        let last_loss =
            last_loss.ok_or_else(|| Error::Dataset(format!("epoch {epoch} produced no batches")))?;

        self.scheduler.step(last_loss);
        let next_lr = self.scheduler.current_lr();

        let checkpoint = Checkpoint::new(
            epoch,
            last_loss,
            next_lr,
            record_to_bytes::<B, _>(model.clone().into_record())?,
            record_to_bytes::<B, _>(optimizer.to_record())?,
        );
        self.store.save(&checkpoint)?;

        info!(
            "Epoch {} done: last loss {:.6}, next lr {:.3e}",
            epoch + 1,
            last_loss,
            next_lr
        );

        Ok((
            model,
            EpochSummary {
                epoch,
                num_batches: plan.num_batches(),
                num_samples: plan.num_samples(),
                last_loss,
                learning_rate: next_lr,
                progress,
            },
        ))
    }
}

fn log_progress(record: &ProgressRecord) {
    info!(
        epoch = record.epoch,
        batch = record.batch_index,
        "[{}, {:5}] loss: {:.3} lr: {:.3e}",
        record.epoch + 1,
        record.batch_index,
        record.mean_loss,
        record.learning_rate
    );
}

/// Forward, cross-entropy, backward and one optimizer step.
///
/// Burn reports allocation failures by panicking, so the step runs under
/// `catch_unwind` and a panic becomes an error.
fn train_step<B, M, O>(
    model: M,
    optimizer: &mut O,
    batch: HandwritingBatch<B>,
    learning_rate: f64,
) -> Result<(M, f64)>
where
    B: AutodiffBackend,
    M: ImageClassifier<B> + AutodiffModule<B>,
    O: Optimizer<M, B>,
{
    panic::catch_unwind(AssertUnwindSafe(move || {
        let logits = model.forward(batch.images);
        let loss = CrossEntropyLossConfig::new()
            .init(&logits.device())
            .forward(logits, batch.targets);
        let loss_value: f64 = loss.clone().into_scalar().elem();

        let grads = GradientsParams::from_grads(loss.backward(), &model);
        let model = optimizer.step(learning_rate, model, grads);
        (model, loss_value)
    }))
    .map_err(panic_to_error)
}

/// Maps a caught panic to `ResourceExhausted` when it looks like memory
/// exhaustion and to `Training` otherwise.
pub fn panic_to_error(payload: Box<dyn Any + Send>) -> Error {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());

    let lower = message.to_lowercase();
    let exhausted = ["out of memory", "oom", "allocation", "alloc failed"]
        .iter()
        .any(|needle| lower.contains(needle));

    if exhausted {
        warn!("Training step ran out of memory: {}", message);
        Error::ResourceExhausted(message)
    } else {
        Error::Training(format!("training step panicked: {message}"))
    }
}

/// Trains the configured EfficientNetV2 on `<data_root>/train.txt`.
pub fn train<B: AutodiffBackend>(
    config: &TrainingConfig,
    device: B::Device,
) -> Result<TrainingReport<EfficientNetV2<B>>> {
    config.validate()?;

    let source = SampleSource::open(&config.manifest_path(TRAIN_SPLIT), config.num_classes)?;
    info!(
        "Training on {} samples from {} classes",
        source.len(),
        source.num_classes_seen()
    );

    let model = EfficientNetV2Config::new(config.num_classes, config.model).init::<B>(&device);
    let optimizer = AdamConfig::new().init::<B, EfficientNetV2<B>>();

    let mut trainer = Trainer::<B>::new(config.clone(), device);
    trainer.run(&source, model, optimizer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{Autodiff, NdArray};
    use burn::tensor::Tensor;
    use hccr_core::{ModelVariant, Sample};
    use hccr_dataset::DecodedSample;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    type TestBackend = Autodiff<NdArray<f32>>;

    fn write_images(dir: &Path, count: usize, classes: usize) -> Vec<Sample> {
        (0..count)
            .map(|i| {
                let label = i % classes;
                let class_dir = dir.join(format!("{label}"));
                fs::create_dir_all(&class_dir).unwrap();
                let path = class_dir.join(format!("{i}.png"));
                image::ImageBuffer::from_fn(8, 8, |x, y| {
                    let on = (x as usize + y as usize + label) % 3 == 0;
                    image::Luma([if on { 0u8 } else { 255u8 }])
                })
                .save(&path)
                .unwrap();
                Sample::new(path, label)
            })
            .collect()
    }

    fn test_config(dir: &Path, epoch_count: usize) -> TrainingConfig {
        TrainingConfig {
            epoch_count,
            batch_size: 2,
            learning_rate: 1e-3,
            image_size: 8,
            data_root: dir.to_path_buf(),
            log_root: dir.join("log"),
            num_classes: 3,
            num_workers: 1,
            prefetch_batches: 1,
            log_interval: 3,
            model: ModelVariant::Tiny,
            ..Default::default()
        }
    }

    fn fresh(
        device: &<TestBackend as burn::tensor::backend::Backend>::Device,
    ) -> EfficientNetV2<TestBackend> {
        EfficientNetV2Config::new(3, ModelVariant::Tiny).init(device)
    }

    fn adam() -> impl Optimizer<EfficientNetV2<TestBackend>, TestBackend> {
        AdamConfig::new().init::<TestBackend, EfficientNetV2<TestBackend>>()
    }

    #[test]
    fn test_first_run_batches_progress_and_checkpoint() {
        let dir = TempDir::new().unwrap();
        let source = SampleSource::from_samples(write_images(dir.path(), 15, 3));
        let config = test_config(dir.path(), 1);
        let device = Default::default();

        let mut trainer = Trainer::<TestBackend>::new(config, device);
        let report = trainer
            .run(&source, fresh(&device), adam())
            .unwrap();

        assert_eq!(report.start_epoch, 0);
        assert!(report.resumed_from.is_none());
        assert_eq!(report.epochs.len(), 1);

        let summary = &report.epochs[0];
        assert_eq!(summary.num_batches, 8);
        assert_eq!(summary.num_samples, 15);
        assert!(summary.last_loss.is_finite());

        // Windows end at batches 3 and 6; the trailing two batches are not reported
        let ends: Vec<usize> = summary.progress.iter().map(|p| p.batch_index).collect();
        assert_eq!(ends, vec![3, 6]);
        assert!(summary.progress.iter().all(|p| p.learning_rate == 1e-3));

        let saved = trainer.store().load(&trainer.store().path_for(0)).unwrap();
        assert_eq!(saved.epoch, 0);
        assert_eq!(saved.loss, summary.last_loss);
        assert!(!saved.model_state.is_empty());
        assert!(!saved.optimizer_state.is_empty());
    }

    #[test]
    fn test_resume_continues_after_latest_checkpoint() {
        let dir = TempDir::new().unwrap();
        let source = SampleSource::from_samples(write_images(dir.path(), 6, 3));
        let device = Default::default();

        let mut first = Trainer::<TestBackend>::new(test_config(dir.path(), 1), device);
        first
            .run(&source, fresh(&device), adam())
            .unwrap();
        let saved = first.store().load_latest().unwrap();

        let mut second = Trainer::<TestBackend>::new(test_config(dir.path(), 3), device);
        let report = second
            .run(&source, fresh(&device), adam())
            .unwrap();

        assert_eq!(report.start_epoch, 1);
        assert_eq!(report.resumed_from, Some(second.store().path_for(0)));
        let epochs: Vec<usize> = report.epochs.iter().map(|e| e.epoch).collect();
        assert_eq!(epochs, vec![1, 2]);

        let listed: Vec<usize> = second.store().list().unwrap().into_iter().map(|(e, _)| e).collect();
        assert_eq!(listed, vec![0, 1, 2]);
        assert_eq!(second.store().load(&second.store().path_for(0)).unwrap(), saved);
    }

    #[test]
    fn test_resume_restores_learning_rate() {
        let dir = TempDir::new().unwrap();
        let source = SampleSource::from_samples(write_images(dir.path(), 4, 2));
        let device = Default::default();
        let config = test_config(dir.path(), 6);

        // Plant a checkpoint with a halved rate built from a real model/optimizer
        let model = fresh(&device);
        let optimizer = AdamConfig::new().init::<TestBackend, EfficientNetV2<TestBackend>>();
        let checkpoint = Checkpoint::new(
            4,
            0.25,
            5e-4,
            record_to_bytes::<TestBackend, _>(model.clone().into_record()).unwrap(),
            record_to_bytes::<TestBackend, _>(optimizer.to_record()).unwrap(),
        );
        CheckpointStore::new(&config.log_root).save(&checkpoint).unwrap();

        let mut trainer = Trainer::<TestBackend>::new(config, device);
        let (_, _, state) = trainer.restore(model, optimizer).unwrap();
        assert_eq!(state.start_epoch, 5);
        assert_eq!(state.loss, 0.25);
        assert_eq!(trainer.scheduler().current_lr(), 5e-4);
        assert_eq!(trainer.scheduler().best_metric(), Some(0.25));

        // Only epoch 5 is left before epoch_count 6
        let report = trainer
            .run(&source, fresh(&device), adam())
            .unwrap();
        assert_eq!(report.start_epoch, 5);
        assert_eq!(report.epochs.len(), 1);
        assert_eq!(report.epochs[0].epoch, 5);
        assert_eq!(report.epochs[0].num_batches, 2);
        assert!(trainer.store().path_for(5).is_file());
    }

    #[test]
    fn test_epoch_count_already_reached_runs_nothing() {
        let dir = TempDir::new().unwrap();
        let source = SampleSource::from_samples(write_images(dir.path(), 4, 2));
        let device = Default::default();
        let config = test_config(dir.path(), 1);

        let model = fresh(&device);
        let checkpoint = Checkpoint::new(
            0,
            0.5,
            1e-3,
            record_to_bytes::<TestBackend, _>(model.into_record()).unwrap(),
            record_to_bytes::<TestBackend, _>(adam().to_record()).unwrap(),
        );
        CheckpointStore::new(&config.log_root).save(&checkpoint).unwrap();

        let report = Trainer::<TestBackend>::new(config, device)
            .run(&source, fresh(&device), adam())
            .unwrap();
        assert_eq!(report.start_epoch, 1);
        assert!(report.epochs.is_empty());
    }

    fn fixed_batch(
        device: &<TestBackend as burn::tensor::backend::Backend>::Device,
    ) -> HandwritingBatch<TestBackend> {
        let samples = (0..4)
            .map(|i| DecodedSample {
                image: (0..3 * 8 * 8)
                    .map(|j| ((i * 7 + j) % 11) as f32 / 11.0 - 0.5)
                    .collect(),
                label: i % 3,
            })
            .collect();
        HandwritingBatcher::new(8).batch(samples, device)
    }

    #[test]
    fn test_restore_reproduces_model_and_optimizer_state() {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path(), 3);
        let device = Default::default();
        let batch = fixed_batch(&device);

        // Two steps so Adam has non-trivial moments
        let mut optimizer = adam();
        let (model, _) = train_step(fresh(&device), &mut optimizer, batch.clone(), 1e-3).unwrap();
        let (model, _) = train_step(model, &mut optimizer, batch.clone(), 1e-3).unwrap();

        let model_state = record_to_bytes::<TestBackend, _>(model.clone().into_record()).unwrap();
        let checkpoint = Checkpoint::new(
            0,
            1.0,
            1e-3,
            model_state.clone(),
            record_to_bytes::<TestBackend, _>(optimizer.to_record()).unwrap(),
        );
        CheckpointStore::new(&config.log_root).save(&checkpoint).unwrap();

        let mut trainer = Trainer::<TestBackend>::new(config, device);
        let (restored, mut restored_optimizer, state) =
            trainer.restore(fresh(&device), adam()).unwrap();
        assert_eq!(state.start_epoch, 1);

        let restored_state =
            record_to_bytes::<TestBackend, _>(restored.clone().into_record()).unwrap();
        assert_eq!(restored_state, model_state);

        // Matching optimizer state means the next step lands on the same weights
        let (expected, _) = train_step(model, &mut optimizer, batch.clone(), 1e-3).unwrap();
        let (actual, _) = train_step(restored, &mut restored_optimizer, batch, 1e-3).unwrap();

        let input = Tensor::<NdArray<f32>, 4>::ones([2, 3, 8, 8], &device);
        let expected: Vec<f32> = expected
            .valid()
            .forward(input.clone())
            .into_data()
            .to_vec()
            .unwrap();
        let actual: Vec<f32> = actual.valid().forward(input).into_data().to_vec().unwrap();
        assert_eq!(expected.len(), actual.len());
        for (e, a) in expected.iter().zip(&actual) {
            assert!((e - a).abs() < 1e-5, "{e} vs {a}");
        }
    }

    #[test]
    fn test_unlistable_log_root_blocks_restore() {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path(), 2);
        fs::write(&config.log_root, "not a directory").unwrap();
        let device = Default::default();

        let mut trainer = Trainer::<TestBackend>::new(config, device);
        let err = trainer.restore(fresh(&device), adam()).err().unwrap();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_corrupt_checkpoint_blocks_resume() {
        let dir = TempDir::new().unwrap();
        let source = SampleSource::from_samples(write_images(dir.path(), 4, 2));
        let config = test_config(dir.path(), 2);
        fs::create_dir_all(&config.log_root).unwrap();
        fs::write(config.log_root.join("checkpoint_epoch_0.ckpt"), b"HCCRCKPT\x05").unwrap();
        let device = Default::default();

        let mut trainer = Trainer::<TestBackend>::new(config, device);
        let err = trainer
            .run(&source, fresh(&device), adam())
            .unwrap_err();
        assert!(matches!(err, Error::CorruptCheckpoint { .. }));
    }

    #[test]
    fn test_decode_error_aborts_without_checkpoint() {
        let dir = TempDir::new().unwrap();
        let mut samples = write_images(dir.path(), 3, 3);
        samples.push(Sample::new(dir.path().join("gone.png"), 0));
        let source = SampleSource::from_samples(samples);
        let device = Default::default();

        let mut trainer = Trainer::<TestBackend>::new(test_config(dir.path(), 1), device);
        let err = trainer
            .run(&source, fresh(&device), adam())
            .unwrap_err();

        assert!(matches!(err, Error::Decode { .. }));
        assert!(!trainer.store().exists_any());
    }

    #[test]
    fn test_empty_source_is_rejected() {
        let dir = TempDir::new().unwrap();
        let device = Default::default();
        let mut trainer = Trainer::<TestBackend>::new(test_config(dir.path(), 1), device);
        let err = trainer
            .run(
                &SampleSource::from_samples(Vec::new()),
                fresh(&device),
                adam(),
            )
            .unwrap_err();
        assert!(matches!(err, Error::Dataset(_)));
    }

    #[test]
    fn test_panic_to_error() {
        let oom: Box<dyn Any + Send> = Box::new("CUDA error: out of memory");
        assert!(matches!(panic_to_error(oom), Error::ResourceExhausted(_)));

        let other: Box<dyn Any + Send> = Box::new(String::from("shape mismatch"));
        assert!(matches!(panic_to_error(other), Error::Training(_)));

        let opaque: Box<dyn Any + Send> = Box::new(42u32);
        assert!(matches!(panic_to_error(opaque), Error::Training(_)));
    }
}
