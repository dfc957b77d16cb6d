//! Epoch planning and prefetching batch decode.
//!
//! Each epoch is planned up front: sample indices are shuffled with a RNG
//! seeded from `(seed, epoch)` and cut into batches. A producer thread decodes
//! batch `i + 1` on a rayon pool while the caller consumes batch `i`. Batches
//! arrive in plan order and samples within a batch keep their plan order.

use std::sync::mpsc;
use std::thread;

use hccr_core::{Error, Result};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use rayon::ThreadPool;
use tracing::{debug, warn};

use crate::source::{DecodedSample, SampleSource};
use crate::transform::TransformPipeline;

/// Batching parameters.
#[derive(Debug, Clone, Copy)]
pub struct PipelineConfig {
    pub batch_size: usize,
    pub num_workers: usize,
    pub prefetch_batches: usize,
    pub seed: u64,
    /// Shuffle sample order each epoch
    pub shuffle: bool,
}

impl PipelineConfig {
    pub fn from_training(config: &hccr_core::TrainingConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            num_workers: config.num_workers,
            prefetch_batches: config.prefetch_batches,
            seed: config.seed,
            shuffle: true,
        }
    }
}

/// Batches for one epoch, as lists of sample indices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EpochPlan {
    pub epoch: usize,
    pub batches: Vec<Vec<usize>>,
}

impl EpochPlan {
    pub fn num_batches(&self) -> usize {
        self.batches.len()
    }

    pub fn num_samples(&self) -> usize {
        self.batches.iter().map(Vec::len).sum()
    }
}

fn epoch_seed(seed: u64, epoch: usize) -> u64 {
    seed.wrapping_add(epoch as u64)
}

/// All indices `0..len` in the shuffled order for `epoch`.
pub fn shuffled_indices(len: usize, seed: u64, epoch: usize) -> Vec<usize> {
    let mut rng = ChaCha8Rng::seed_from_u64(epoch_seed(seed, epoch));
    let mut indices: Vec<usize> = (0..len).collect();
    indices.shuffle(&mut rng);
    indices
}

/// Cuts `indices` into chunks of `batch_size`; the last chunk may be shorter.
pub fn partition(indices: &[usize], batch_size: usize) -> Vec<Vec<usize>> {
    indices
        .chunks(batch_size.max(1))
        .map(<[usize]>::to_vec)
        .collect()
}

/// RNG for the random transform of one sample. Independent of decode order,
/// so results do not depend on how work is spread across workers.
pub fn sample_rng(seed: u64, epoch: usize, index: usize) -> ChaCha8Rng {
    let mut rng = ChaCha8Rng::seed_from_u64(epoch_seed(seed, epoch));
    rng.set_stream(index as u64 + 1);
    rng
}

/// Decodes planned batches from a [`SampleSource`] ahead of the consumer.
pub struct BatchPipeline<'a> {
    source: &'a SampleSource,
    transform: &'a TransformPipeline,
    config: PipelineConfig,
    pool: ThreadPool,
}

impl<'a> BatchPipeline<'a> {
    pub fn new(
        source: &'a SampleSource,
        transform: &'a TransformPipeline,
        config: PipelineConfig,
    ) -> Result<Self> {
        if config.batch_size == 0 {
            return Err(Error::InvalidArgument("batch_size must be > 0".into()));
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.num_workers.max(1))
            .thread_name(|i| format!("hccr-decode-{i}"))
            .build()
            .map_err(|e| Error::Dataset(format!("Failed to build decode pool: {e}")))?;

        Ok(Self {
            source,
            transform,
            config,
            pool,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn plan(&self, epoch: usize) -> EpochPlan {
        let indices = if self.config.shuffle {
            shuffled_indices(self.source.len(), self.config.seed, epoch)
        } else {
            (0..self.source.len()).collect()
        };

        EpochPlan {
            epoch,
            batches: partition(&indices, self.config.batch_size),
        }
    }

    /// Decodes one batch on the worker pool. Fails on the first sample that
    /// does not decode.
    pub fn decode_batch(&self, epoch: usize, indices: &[usize]) -> Result<Vec<DecodedSample>> {
        self.pool.install(|| {
            indices
                .par_iter()
                .map(|&index| {
                    let mut rng = sample_rng(self.config.seed, epoch, index);
                    self.source.load(index, self.transform, &mut rng)
                })
                .collect()
        })
    }

    /// Runs `consume(batch_index, samples)` for every batch of `plan`, in
    /// order, with decode running one step ahead on a producer thread.
    ///
    /// The first decode error or consumer error stops the epoch and is
    /// returned; the producer is shut down before this returns.
    pub fn for_each_batch<F>(&self, plan: &EpochPlan, mut consume: F) -> Result<()>
    where
        F: FnMut(usize, Vec<DecodedSample>) -> Result<()>,
    {
        thread::scope(|scope| {
            // `rx` must drop before the producer is joined
            let (tx, rx) =
                mpsc::sync_channel::<Result<Vec<DecodedSample>>>(self.config.prefetch_batches);

            scope.spawn(move || {
                for indices in &plan.batches {
                    let decoded = self.decode_batch(plan.epoch, indices);
                    let failed = decoded.is_err();
                    if tx.send(decoded).is_err() {
                        debug!("Consumer stopped, producer exiting");
                        return;
                    }
                    if failed {
                        return;
                    }
                }
            });

            for (batch_index, decoded) in rx.iter().enumerate() {
                let samples = decoded.inspect_err(|e| {
                    warn!("Batch {} of epoch {} failed: {}", batch_index, plan.epoch, e)
                })?;
                consume(batch_index, samples)?;
            }
            Ok(())
        })
    }
}
