//! Indexed access to the samples listed in a manifest.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use burn::data::dataset::Dataset;
use hccr_core::{Error, Result, Sample};
use image::ImageReader;
use rand::Rng;
use tracing::{debug, info};

use crate::manifest::parse_record;
use crate::transform::TransformPipeline;

/// A sample after decoding and transformation.
#[derive(Debug, Clone)]
pub struct DecodedSample {
    /// Normalized pixels in CHW order
    pub image: Vec<f32>,
    pub label: usize,
}

/// Samples read from a manifest, truncated at the class limit.
#[derive(Debug, Clone)]
pub struct SampleSource {
    samples: Vec<Sample>,
}

impl SampleSource {
    /// Reads `manifest_path` in order and stops at the first record whose
    /// label is `>= class_limit`.
    ///
    /// Records are expected to be grouped by ascending label, so everything
    /// after that record is ignored without being parsed.
    pub fn open(manifest_path: &Path, class_limit: usize) -> Result<Self> {
        let file = File::open(manifest_path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::NotFound(format!(
                "Manifest not found: {}",
                manifest_path.display()
            )),
            _ => Error::Io(e),
        })?;

        let mut samples = Vec::new();
        for (index, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|e| match e.kind() {
                std::io::ErrorKind::InvalidData => Error::Manifest {
                    line: index + 1,
                    reason: format!("line is not valid UTF-8: {e}"),
                },
                _ => Error::Io(e),
            })?;
            let Some(sample) = parse_record(&line, index + 1)? else {
                continue;
            };
            if sample.label >= class_limit {
                debug!(
                    "Stopping manifest read at line {} (label {} >= limit {})",
                    index + 1,
                    sample.label,
                    class_limit
                );
                break;
            }
            samples.push(sample);
        }

        info!(
            "Loaded {} samples from {}",
            samples.len(),
            manifest_path.display()
        );
        Ok(Self { samples })
    }

    /// Wraps samples that are already in memory.
    pub fn from_samples(samples: Vec<Sample>) -> Self {
        Self { samples }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn sample(&self, index: usize) -> Option<&Sample> {
        self.samples.get(index)
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    /// Number of distinct labels present.
    pub fn num_classes_seen(&self) -> usize {
        self.samples
            .iter()
            .map(|s| s.label)
            .collect::<BTreeSet<_>>()
            .len()
    }

    /// Decodes sample `index` and runs it through `transform`.
    pub fn load<R: Rng + ?Sized>(
        &self,
        index: usize,
        transform: &TransformPipeline,
        rng: &mut R,
    ) -> Result<DecodedSample> {
        let sample = self.samples.get(index).ok_or_else(|| {
            Error::InvalidArgument(format!(
                "Sample index {} out of range (len {})",
                index,
                self.samples.len()
            ))
        })?;

        let image = decode_image(&sample.image_path)?;
        Ok(DecodedSample {
            image: transform.apply(&image, rng),
            label: sample.label,
        })
    }
}

impl Dataset<Sample> for SampleSource {
    fn get(&self, index: usize) -> Option<Sample> {
        self.samples.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.samples.len()
    }
}

/// Opens an image file, guessing the format from its content.
pub fn decode_image(path: &Path) -> Result<image::DynamicImage> {
    ImageReader::open(path)
        .map_err(|e| Error::decode(path, e))?
        .with_guessed_format()
        .map_err(|e| Error::decode(path, e))?
        .decode()
        .map_err(|e| Error::decode(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hccr_core::TransformConfig;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use std::fs;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn write_manifest(dir: &TempDir, lines: &[String]) -> PathBuf {
        let path = dir.path().join("train.txt");
        fs::write(&path, lines.join("\n") + "\n").unwrap();
        path
    }

    #[test]
    fn test_open_stops_at_first_label_over_limit() {
        let dir = TempDir::new().unwrap();
        let lines: Vec<String> = ["a\t0", "b\t0", "c\t1", "d\t2", "e\t0", "f\t1"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let path = write_manifest(&dir, &lines);

        let source = SampleSource::open(&path, 2).unwrap();
        assert_eq!(source.len(), 3);
        assert_eq!(source.num_classes_seen(), 2);
        assert_eq!(source.sample(2).unwrap().image_path, PathBuf::from("c"));
        assert!(source.sample(3).is_none());
    }

    #[test]
    fn test_open_does_not_parse_after_stop() {
        let dir = TempDir::new().unwrap();
        let lines = vec!["a\t0".to_string(), "b\t5".to_string(), "garbage".to_string()];
        let path = write_manifest(&dir, &lines);

        let source = SampleSource::open(&path, 1).unwrap();
        assert_eq!(source.len(), 1);
    }

    #[test]
    fn test_open_reports_malformed_line() {
        let dir = TempDir::new().unwrap();
        let lines = vec!["a\t0".to_string(), "".to_string(), "broken".to_string()];
        let path = write_manifest(&dir, &lines);

        let err = SampleSource::open(&path, 10).unwrap_err();
        assert!(matches!(err, Error::Manifest { line: 3, .. }));
    }

    #[test]
    fn test_open_missing_manifest() {
        let dir = TempDir::new().unwrap();
        let err = SampleSource::open(&dir.path().join("nope.txt"), 10).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn test_load_decodes_and_transforms() {
        let dir = TempDir::new().unwrap();
        let img_path = dir.path().join("char.png");
        image::ImageBuffer::from_pixel(10, 12, image::Luma([200u8]))
            .save(&img_path)
            .unwrap();

        let source = SampleSource::from_samples(vec![Sample::new(&img_path, 4)]);
        let transform = TransformPipeline::new(8, &TransformConfig::default());
        let decoded = source
            .load(0, &transform, &mut ChaCha8Rng::seed_from_u64(0))
            .unwrap();

        assert_eq!(decoded.label, 4);
        assert_eq!(decoded.image.len(), 3 * 8 * 8);
    }

    #[test]
    fn test_load_unreadable_image_is_decode_error() {
        let dir = TempDir::new().unwrap();
        let bad = dir.path().join("bad.png");
        fs::write(&bad, b"not an image").unwrap();

        let source = SampleSource::from_samples(vec![
            Sample::new(&bad, 0),
            Sample::new(dir.path().join("missing.png"), 0),
        ]);
        let transform = TransformPipeline::new(8, &TransformConfig::default());
        let mut rng = ChaCha8Rng::seed_from_u64(0);

        match source.load(0, &transform, &mut rng).unwrap_err() {
            Error::Decode { path, .. } => assert_eq!(path, bad),
            other => panic!("unexpected error: {other}"),
        }
        assert!(matches!(
            source.load(1, &transform, &mut rng),
            Err(Error::Decode { .. })
        ));
        assert!(matches!(
            source.load(2, &transform, &mut rng),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_burn_dataset_view() {
        let source = SampleSource::from_samples(vec![Sample::new("a", 0), Sample::new("b", 1)]);
        assert_eq!(Dataset::len(&source), 2);
        assert_eq!(Dataset::get(&source, 1), Some(Sample::new("b", 1)));
    }

    #[test]
    fn test_invalid_utf8_line_is_a_manifest_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("train.txt");
        fs::write(&path, b"a.png\t0\n\xff\xfe.png\t0\n").unwrap();

        let err = SampleSource::open(&path, 10).unwrap_err();
        assert!(matches!(err, Error::Manifest { line: 2, .. }));
    }
}
