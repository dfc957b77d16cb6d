//! Handwritten character dataset handling.
//!
//! Builds manifests from a class-per-directory layout, reads them back as
//! indexed sample sources, decodes and transforms images, and batches them
//! for Burn.

pub mod batcher;
pub mod manifest;
pub mod pipeline;
pub mod source;
pub mod transform;

pub use batcher::{HandwritingBatch, HandwritingBatcher};
pub use manifest::{BuildOutcome, LabelIndexBuilder};
pub use pipeline::{BatchPipeline, EpochPlan, PipelineConfig};
pub use source::{decode_image, DecodedSample, SampleSource};
pub use transform::TransformPipeline;
