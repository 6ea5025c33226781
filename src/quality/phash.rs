//! Difference hash (dHash) perceptual fingerprints

use image::imageops::{self, FilterType};
use image::GrayImage;

const HASH_BITS: u32 = 64;

/// 64-bit perceptual hash of an image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PerceptualHash(pub u64);

impl PerceptualHash {
    /// Hash a grayscale image by comparing horizontally adjacent pixels of a 9x8 thumbnail
    pub fn of(gray: &GrayImage) -> Self {
        let small = imageops::resize(gray, 9, 8, FilterType::Triangle);
        let mut bits = 0u64;

        for y in 0..8 {
            for x in 0..8 {
                let left = small.get_pixel(x, y)[0];
                let right = small.get_pixel(x + 1, y)[0];
                bits <<= 1;
                if left > right {
                    bits |= 1;
                }
            }
        }

        Self(bits)
    }

    pub fn to_hex(&self) -> String {
        format!("{:016x}", self.0)
    }

    pub fn from_hex(hex: &str) -> Option<Self> {
        u64::from_str_radix(hex, 16).ok().map(Self)
    }

    pub fn distance(&self, other: &PerceptualHash) -> u32 {
        (self.0 ^ other.0).count_ones()
    }

    /// Fraction of matching bits, 0.0..=1.0
    pub fn similarity(&self, other: &PerceptualHash) -> f64 {
        1.0 - self.distance(other) as f64 / HASH_BITS as f64
    }
}
