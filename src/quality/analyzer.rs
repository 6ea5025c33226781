//! Image analysis behind the quality score

use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, GrayImage};

use crate::quality::phash::PerceptualHash;

/// Longest edge of the working copy used for statistics
const ANALYSIS_EDGE: u32 = 512;

/// Laplacian variance at which an image counts as fully sharp
const SHARP_LAPLACIAN_VARIANCE: f64 = 300.0;

/// Luma standard deviation at which an image counts as fully contrasted
const FULL_CONTRAST_STDDEV: f64 = 50.0;

const SHARPNESS_WEIGHT: f64 = 0.40;
const CONTRAST_WEIGHT: f64 = 0.35;
const EXPOSURE_WEIGHT: f64 = 0.25;

/// Measurements taken from a decoded image
#[derive(Debug, Clone, PartialEq)]
pub struct ImageAnalysis {
    pub width: u32,
    pub height: u32,
    /// Aggregate score in `0.0..=1.0`
    pub score: f64,
    /// Content issues found, in detection order
    pub issues: Vec<String>,
    pub perceptual_hash: PerceptualHash,
}

/// Scores an encoded image
pub trait ImageAnalyzer: Send + Sync {
    fn analyze(&self, image: &[u8]) -> Result<ImageAnalysis, String>;
}

/// Pixel-statistics analyzer: sharpness, contrast and exposure
#[derive(Debug, Default, Clone)]
pub struct PixelAnalyzer;

impl ImageAnalyzer for PixelAnalyzer {
    fn analyze(&self, image: &[u8]) -> Result<ImageAnalysis, String> {
        let decoded = image::load_from_memory(image)
            .map_err(|e| format!("Image could not be decoded: {e}"))?;
        Ok(analyze_image(&decoded))
    }
}

pub fn analyze_image(image: &DynamicImage) -> ImageAnalysis {
    let (width, height) = image.dimensions();

    let working = if width.max(height) > ANALYSIS_EDGE {
        image.resize(ANALYSIS_EDGE, ANALYSIS_EDGE, FilterType::Triangle)
    } else {
        image.clone()
    };
    let gray = working.to_luma8();

    let (mean, stddev) = luma_stats(&gray);
    let sharpness = (laplacian_variance(&gray) / SHARP_LAPLACIAN_VARIANCE).min(1.0);
    let contrast = (stddev / FULL_CONTRAST_STDDEV).min(1.0);
    let exposure = 1.0 - ((mean - 128.0).abs() / 128.0).min(1.0);

    let mut issues = Vec::new();
    if sharpness < 0.3 {
        issues.push("Image appears blurry".to_string());
    }
    if contrast < 0.3 {
        issues.push("Low contrast".to_string());
    }
    if mean < 40.0 {
        issues.push("Image is underexposed".to_string());
    } else if mean > 215.0 {
        issues.push("Image is overexposed".to_string());
    }

    let score = SHARPNESS_WEIGHT * sharpness + CONTRAST_WEIGHT * contrast + EXPOSURE_WEIGHT * exposure;

    ImageAnalysis {
        width,
        height,
        score: (score * 1000.0).round() / 1000.0,
        issues,
        perceptual_hash: PerceptualHash::of(&gray),
    }
}

fn luma_stats(gray: &GrayImage) -> (f64, f64) {
    let count = (gray.width() as f64 * gray.height() as f64).max(1.0);
    let mean = gray.pixels().map(|p| p[0] as f64).sum::<f64>() / count;
    let variance = gray
        .pixels()
        .map(|p| {
            let d = p[0] as f64 - mean;
            d * d
        })
        .sum::<f64>()
        / count;
    (mean, variance.sqrt())
}

/// Variance of the 4-neighbour Laplacian over interior pixels
fn laplacian_variance(gray: &GrayImage) -> f64 {
    let (width, height) = gray.dimensions();
    if width < 3 || height < 3 {
        return 0.0;
    }

    let at = |x: u32, y: u32| gray.get_pixel(x, y)[0] as f64;
    let mut sum = 0.0;
    let mut sum_sq = 0.0;
    let mut n = 0.0;

    for y in 1..height - 1 {
        for x in 1..width - 1 {
            let lap = 4.0 * at(x, y) - at(x - 1, y) - at(x + 1, y) - at(x, y - 1) - at(x, y + 1);
            sum += lap;
            sum_sq += lap * lap;
            n += 1.0;
        }
    }

    let mean = sum / n;
    sum_sq / n - mean * mean
}
