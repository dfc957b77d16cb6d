//! Manifest files mapping image paths to class indices.
//!
//! A manifest is plain UTF-8 text with one `<image_path>\t<label>` record per
//! line. [`LabelIndexBuilder`] produces one from a directory tree laid out as
//! `<root>/<class index>/<image>`; [`crate::SampleSource`] reads it back.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use hccr_core::{Error, Result, Sample};
use tracing::{debug, info, warn};

/// File extensions accepted as images (compared case-insensitively).
pub const IMAGE_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "bmp", "gif"];

/// Formats one manifest record, without the trailing newline.
pub fn format_record(sample: &Sample) -> Result<String> {
    let path = sample.image_path.to_str().ok_or_else(|| {
        Error::Dataset(format!(
            "Image path is not valid UTF-8: {}",
            sample.image_path.display()
        ))
    })?;
    if path.contains('\n') {
        return Err(Error::Dataset(format!(
            "Image path contains a newline: {path:?}"
        )));
    }
    Ok(format!("{path}\t{}", sample.label))
}

/// Parses one manifest line. Blank lines yield `None`.
///
/// The label is taken after the last tab so paths may themselves contain tabs.
pub fn parse_record(line: &str, line_number: usize) -> Result<Option<Sample>> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() {
        return Ok(None);
    }

    let (path, label) = line.rsplit_once('\t').ok_or_else(|| Error::Manifest {
        line: line_number,
        reason: "expected '<image_path>\\t<label>'".to_string(),
    })?;

    if path.is_empty() {
        return Err(Error::Manifest {
            line: line_number,
            reason: "empty image path".to_string(),
        });
    }

    let label = label.trim().parse::<usize>().map_err(|e| Error::Manifest {
        line: line_number,
        reason: format!("invalid label '{label}': {e}"),
    })?;

    Ok(Some(Sample::new(path, label)))
}

/// Result of [`LabelIndexBuilder::build`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildOutcome {
    /// The output already existed and was left untouched
    Skipped,
    /// A new manifest was written
    Written { records: usize, classes: usize },
}

/// Scans `<root>/<class index>/*` and writes a manifest.
#[derive(Debug, Clone)]
pub struct LabelIndexBuilder {
    dataset_root: PathBuf,
    max_classes: usize,
}

impl LabelIndexBuilder {
    pub fn new(dataset_root: impl Into<PathBuf>, max_classes: usize) -> Self {
        Self {
            dataset_root: dataset_root.into(),
            max_classes,
        }
    }

    /// Writes the manifest to `output` unless it already exists.
    ///
    /// An existing manifest is never rebuilt, even if the dataset or the class
    /// limit changed since it was written. Delete it to force a rebuild.
    pub fn build(&self, output: &Path) -> Result<BuildOutcome> {
        if output.exists() {
            info!("Manifest {} already exists, skipping scan", output.display());
            return Ok(BuildOutcome::Skipped);
        }

        let samples = self.collect_samples()?;
        let classes = count_classes(&samples);
        write_manifest(output, &samples)?;

        info!(
            "Wrote {} records for {} classes to {}",
            samples.len(),
            classes,
            output.display()
        );

        Ok(BuildOutcome::Written {
            records: samples.len(),
            classes,
        })
    }

    /// Enumerates samples in manifest order without writing anything.
    pub fn collect_samples(&self) -> Result<Vec<Sample>> {
        let mut samples = Vec::new();
        for (label, class_dir) in self.class_directories()? {
            let images = scan_images(&class_dir)?;
            debug!("Class {:>5}: {} images", label, images.len());
            samples.extend(images.into_iter().map(|path| Sample::new(path, label)));
        }
        Ok(samples)
    }

    /// Class directories with index below the limit, ascending by index.
    fn class_directories(&self) -> Result<Vec<(usize, PathBuf)>> {
        if !self.dataset_root.is_dir() {
            return Err(Error::NotFound(format!(
                "Dataset directory not found: {}",
                self.dataset_root.display()
            )));
        }

        let mut classes = Vec::new();
        for entry in fs::read_dir(&self.dataset_root)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }

            let name = entry.file_name();
            match name.to_str().and_then(|n| n.parse::<usize>().ok()) {
                Some(index) if index < self.max_classes => classes.push((index, path)),
                Some(_) => {}
                None => warn!(
                    "Skipping directory with non-numeric class name: {}",
                    path.display()
                ),
            }
        }

        classes.sort_by_key(|(index, _)| *index);
        Ok(classes)
    }
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.as_str()))
}

/// Image files directly inside `dir`, sorted by file name.
fn scan_images(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut images = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && is_image(&path) {
            images.push(path);
        }
    }
    images.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(images)
}

fn count_classes(samples: &[Sample]) -> usize {
    let mut count = 0;
    let mut previous = None;
    for sample in samples {
        if previous != Some(sample.label) {
            count += 1;
            previous = Some(sample.label);
        }
    }
    count
}

/// Writes through a temporary file so an interrupted build never leaves a
/// partial manifest behind for the next run to skip over.
fn write_manifest(output: &Path, samples: &[Sample]) -> Result<()> {
    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let mut tmp_name = output.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);

    {
        let mut writer = BufWriter::new(File::create(&tmp_path)?);
        for sample in samples {
            writeln!(writer, "{}", format_record(sample)?)?;
        }
        writer.flush()?;
    }

    fs::rename(&tmp_path, output)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_image(path: &Path) {
        let img = image::ImageBuffer::from_fn(4, 4, |_, _| image::Rgb([255u8, 255u8, 255u8]));
        img.save(path).unwrap();
    }

    fn create_class(root: &Path, name: &str, files: &[&str]) {
        let dir = root.join(name);
        fs::create_dir_all(&dir).unwrap();
        for file in files {
            create_test_image(&dir.join(file));
        }
    }

    #[test]
    fn test_parse_record() {
        let sample = parse_record("data/train/00003/7.png\t3\n", 1).unwrap().unwrap();
        assert_eq!(sample, Sample::new("data/train/00003/7.png", 3));
        assert!(parse_record("   \n", 2).unwrap().is_none());
    }

    #[test]
    fn test_parse_record_errors_carry_line_number() {
        let err = parse_record("no-tab-here", 5).unwrap_err();
        assert!(matches!(err, Error::Manifest { line: 5, .. }));

        let err = parse_record("a.png\tseven", 9).unwrap_err();
        assert!(matches!(err, Error::Manifest { line: 9, .. }));
    }

    #[test]
    fn test_format_record() {
        let line = format_record(&Sample::new("x/00001/a.png", 1)).unwrap();
        assert_eq!(line, "x/00001/a.png\t1");
        assert_eq!(parse_record(&line, 1).unwrap(), Some(Sample::new("x/00001/a.png", 1)));
    }

    #[test]
    fn test_build_orders_classes_numerically() {
        let root = TempDir::new().unwrap();
        create_class(root.path(), "10", &["a.png"]);
        create_class(root.path(), "2", &["b.png", "a.png"]);
        create_class(root.path(), "0", &["z.jpg"]);

        let samples = LabelIndexBuilder::new(root.path(), 100).collect_samples().unwrap();
        let labels: Vec<usize> = samples.iter().map(|s| s.label).collect();
        assert_eq!(labels, vec![0, 2, 2, 10]);
        assert!(samples[1].image_path.ends_with("2/a.png"));
        assert!(samples[2].image_path.ends_with("2/b.png"));
    }

    #[test]
    fn test_build_respects_class_limit_and_skips_non_numeric() {
        let root = TempDir::new().unwrap();
        create_class(root.path(), "00000", &["1.png", "2.png"]);
        create_class(root.path(), "00001", &["1.png"]);
        create_class(root.path(), "00002", &["1.png"]);
        create_class(root.path(), "README", &["1.png"]);
        fs::write(root.path().join("00001").join("notes.txt"), "x").unwrap();

        let output = root.path().join("train.txt");
        let outcome = LabelIndexBuilder::new(root.path(), 2).build(&output).unwrap();
        assert_eq!(outcome, BuildOutcome::Written { records: 3, classes: 2 });

        let content = fs::read_to_string(&output).unwrap();
        assert_eq!(content.lines().count(), 3);
        assert!(content.lines().all(|l| l.ends_with("\t0") || l.ends_with("\t1")));
    }

    #[test]
    fn test_build_skips_existing_output() {
        let root = TempDir::new().unwrap();
        create_class(root.path(), "0", &["1.png"]);
        let output = root.path().join("train.txt");
        fs::write(&output, "stale\t0\n").unwrap();

        let outcome = LabelIndexBuilder::new(root.path(), 10).build(&output).unwrap();
        assert_eq!(outcome, BuildOutcome::Skipped);
        assert_eq!(fs::read_to_string(&output).unwrap(), "stale\t0\n");
    }

    #[test]
    fn test_build_is_idempotent() {
        let root = TempDir::new().unwrap();
        create_class(root.path(), "0", &["1.png", "2.PNG"]);
        let output = root.path().join("out").join("train.txt");
        let builder = LabelIndexBuilder::new(root.path(), 10);

        builder.build(&output).unwrap();
        let first = fs::read_to_string(&output).unwrap();
        assert_eq!(builder.build(&output).unwrap(), BuildOutcome::Skipped);
        assert_eq!(fs::read_to_string(&output).unwrap(), first);
        assert_eq!(first.lines().count(), 2);
    }

    #[test]
    fn test_build_missing_root() {
        let root = TempDir::new().unwrap();
        let builder = LabelIndexBuilder::new(root.path().join("missing"), 10);
        let err = builder.build(&root.path().join("train.txt")).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
