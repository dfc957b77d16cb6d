//! Burn batcher turning decoded samples into image and target tensors.

use burn::data::dataloader::batcher::Batcher;
use burn::prelude::*;

use crate::source::DecodedSample;

/// A batch of handwriting images ready for the model.
#[derive(Clone, Debug)]
pub struct HandwritingBatch<B: Backend> {
    /// Normalized images with shape [batch_size, 3, height, width]
    pub images: Tensor<B, 4>,
    /// Class indices with shape [batch_size]
    pub targets: Tensor<B, 1, Int>,
}

impl<B: Backend> HandwritingBatch<B> {
    pub fn len(&self) -> usize {
        self.targets.dims()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Stacks [`DecodedSample`]s. Normalization already happened per sample.
#[derive(Clone, Debug)]
pub struct HandwritingBatcher {
    image_size: usize,
}

impl HandwritingBatcher {
    pub fn new(image_size: usize) -> Self {
        Self { image_size }
    }
}

impl<B: Backend> Batcher<B, DecodedSample, HandwritingBatch<B>> for HandwritingBatcher {
    fn batch(&self, items: Vec<DecodedSample>, device: &B::Device) -> HandwritingBatch<B> {
        let batch_size = items.len();
        let size = self.image_size;

        let mut images_data = Vec::with_capacity(batch_size * 3 * size * size);
        let mut targets_data = Vec::with_capacity(batch_size);
        for item in items {
            images_data.extend(item.image);
            targets_data.push(item.label as i64);
        }

        let images = Tensor::<B, 4>::from_floats(
            TensorData::new(images_data, [batch_size, 3, size, size]),
            device,
        );
        let targets =
            Tensor::<B, 1, Int>::from_data(TensorData::new(targets_data, [batch_size]), device);

        HandwritingBatch { images, targets }
    }
}
