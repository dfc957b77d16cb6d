//! Per-sample image transforms: resize, color jitter, tensor conversion and
//! normalization.

use hccr_core::{ColorJitterConfig, TransformConfig};
use image::imageops::FilterType;
use image::{DynamicImage, Rgb, RgbImage};
use rand::Rng;

/// Turns a decoded image into a normalized CHW `f32` buffer.
#[derive(Debug, Clone)]
pub struct TransformPipeline {
    image_size: u32,
    mean: [f32; 3],
    std: [f32; 3],
    color_jitter: Option<ColorJitterConfig>,
}

impl TransformPipeline {
    pub fn new(image_size: usize, config: &TransformConfig) -> Self {
        Self {
            image_size: image_size as u32,
            mean: config.mean,
            std: config.std,
            color_jitter: config.color_jitter,
        }
    }

    /// Same resize and normalization, no randomness. Used for evaluation.
    pub fn deterministic(&self) -> Self {
        Self {
            color_jitter: None,
            ..self.clone()
        }
    }

    pub fn image_size(&self) -> usize {
        self.image_size as usize
    }

    /// Number of `f32` values produced per image (3 * size * size).
    pub fn output_len(&self) -> usize {
        3 * self.image_size() * self.image_size()
    }

    /// Output shape as `[channels, height, width]`.
    pub fn output_shape(&self) -> [usize; 3] {
        [3, self.image_size(), self.image_size()]
    }

    pub fn apply<R: Rng + ?Sized>(&self, image: &DynamicImage, rng: &mut R) -> Vec<f32> {
        let mut rgb = self.resize(image);
        if let Some(jitter) = &self.color_jitter {
            color_jitter(&mut rgb, jitter, rng);
        }
        self.to_normalized_chw(&rgb)
    }

    fn resize(&self, image: &DynamicImage) -> RgbImage {
        let rgb = image.to_rgb8();
        if rgb.dimensions() == (self.image_size, self.image_size) {
            return rgb;
        }
        image::imageops::resize(&rgb, self.image_size, self.image_size, FilterType::Triangle)
    }

    fn to_normalized_chw(&self, image: &RgbImage) -> Vec<f32> {
        let (width, height) = image.dimensions();
        let mut normalized = Vec::with_capacity((width * height * 3) as usize);

        for channel in 0..3 {
            for y in 0..height {
                for x in 0..width {
                    let value = image.get_pixel(x, y)[channel] as f32 / 255.0;
                    normalized.push((value - self.mean[channel]) / self.std[channel]);
                }
            }
        }

        normalized
    }
}

fn jitter_factor<R: Rng + ?Sized>(strength: f32, rng: &mut R) -> Option<f32> {
    (strength > 0.0).then(|| rng.gen_range((1.0 - strength)..=(1.0 + strength)))
}

fn luminance(pixel: &Rgb<u8>) -> f32 {
    0.299 * pixel[0] as f32 + 0.587 * pixel[1] as f32 + 0.114 * pixel[2] as f32
}

fn blend(value: u8, other: f32, factor: f32) -> u8 {
    (value as f32 * factor + other * (1.0 - factor)).clamp(0.0, 255.0) as u8
}

/// Brightness, then contrast, then saturation, each with a factor drawn from
/// `[1 - strength, 1 + strength]`.
fn color_jitter<R: Rng + ?Sized>(image: &mut RgbImage, config: &ColorJitterConfig, rng: &mut R) {
    if let Some(factor) = jitter_factor(config.brightness, rng) {
        for pixel in image.pixels_mut() {
            for c in 0..3 {
                pixel[c] = blend(pixel[c], 0.0, factor);
            }
        }
    }

    if let Some(factor) = jitter_factor(config.contrast, rng) {
        let count = (image.width() * image.height()).max(1) as f32;
        let mean = image.pixels().map(luminance).sum::<f32>() / count;
        for pixel in image.pixels_mut() {
            for c in 0..3 {
                pixel[c] = blend(pixel[c], mean, factor);
            }
        }
    }

    if let Some(factor) = jitter_factor(config.saturation, rng) {
        for pixel in image.pixels_mut() {
            let gray = luminance(pixel);
            for c in 0..3 {
                pixel[c] = blend(pixel[c], gray, factor);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Luma};
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn rng() -> ChaCha8Rng {
        ChaCha8Rng::seed_from_u64(7)
    }

    #[test]
    fn test_output_shape_after_resize() {
        let pipeline = TransformPipeline::new(32, &TransformConfig::default());
        let img = DynamicImage::ImageRgb8(ImageBuffer::from_pixel(50, 20, Rgb([10u8, 20, 30])));

        let out = pipeline.apply(&img, &mut rng());
        assert_eq!(out.len(), pipeline.output_len());
        assert_eq!(pipeline.output_shape(), [3, 32, 32]);
    }

    #[test]
    fn test_normalization_values() {
        let config = TransformConfig {
            mean: [0.5, 0.5, 0.5],
            std: [0.5, 0.5, 0.5],
            color_jitter: None,
        };
        let pipeline = TransformPipeline::new(2, &config);
        let img = DynamicImage::ImageRgb8(ImageBuffer::from_pixel(2, 2, Rgb([255u8, 0, 255])));

        let out = pipeline.apply(&img, &mut rng());
        // CHW: 4 red values, 4 green values, 4 blue values
        assert!(out[..4].iter().all(|v| (v - 1.0).abs() < 1e-6));
        assert!(out[4..8].iter().all(|v| (v + 1.0).abs() < 1e-6));
        assert!(out[8..].iter().all(|v| (v - 1.0).abs() < 1e-6));
    }

    #[test]
    fn test_grayscale_input_becomes_three_channels() {
        let pipeline = TransformPipeline::new(4, &TransformConfig::default());
        let img = DynamicImage::ImageLuma8(ImageBuffer::from_pixel(4, 4, Luma([128u8])));

        let out = pipeline.apply(&img, &mut rng());
        assert_eq!(out.len(), 3 * 4 * 4);
        assert!(out.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_without_jitter_is_deterministic() {
        let pipeline = TransformPipeline::new(8, &TransformConfig::default());
        let img = DynamicImage::ImageRgb8(ImageBuffer::from_fn(8, 8, |x, y| {
            Rgb([(x * 30) as u8, (y * 30) as u8, 100])
        }));

        let a = pipeline.apply(&img, &mut ChaCha8Rng::seed_from_u64(1));
        let b = pipeline.apply(&img, &mut ChaCha8Rng::seed_from_u64(2));
        assert_eq!(a, b);
    }

    #[test]
    fn test_jitter_changes_output_and_deterministic_drops_it() {
        let config = TransformConfig {
            color_jitter: Some(ColorJitterConfig {
                brightness: 0.5,
                contrast: 0.0,
                saturation: 0.0,
            }),
            ..Default::default()
        };
        let pipeline = TransformPipeline::new(4, &config);
        let img = DynamicImage::ImageRgb8(ImageBuffer::from_pixel(4, 4, Rgb([100u8, 100, 100])));

        let plain = pipeline.deterministic().apply(&img, &mut rng());
        let outputs: Vec<Vec<f32>> = (0..4)
            .map(|seed| pipeline.apply(&img, &mut ChaCha8Rng::seed_from_u64(seed)))
            .collect();
        assert!(outputs.iter().any(|out| *out != plain));
    }
}
