use image::DynamicImage;
use image_hasher::{HashAlg, Hasher, HasherConfig};
use std::fmt;

/// 64-bit perceptual hash (8x8 DCT mean hash). Similar images land a small
/// Hamming distance apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PerceptualHash(u64);

impl PerceptualHash {
    pub fn from_u64(bits: u64) -> Self {
        Self(bits)
    }

    pub fn bits(&self) -> u64 {
        self.0
    }

    /// Number of differing bits.
    pub fn distance(&self, other: &PerceptualHash) -> u32 {
        (self.0 ^ other.0).count_ones()
    }

    pub fn to_hex(&self) -> String {
        format!("{:016x}", self.0)
    }

    pub fn from_hex(hex: &str) -> Option<Self> {
        if hex.len() != 16 {
            return None;
        }
        u64::from_str_radix(hex, 16).ok().map(Self)
    }
}

impl fmt::Display for PerceptualHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

pub struct PerceptualHasher {
    hasher: Hasher,
}

impl PerceptualHasher {
    pub fn new() -> Self {
        let hasher = HasherConfig::new()
            .hash_size(8, 8)
            .preproc_dct()
            .hash_alg(HashAlg::Mean)
            .to_hasher();
        Self { hasher }
    }

    pub fn hash(&self, image: &DynamicImage) -> PerceptualHash {
        let hash = self.hasher.hash_image(image);
        let bits = hash
            .as_bytes()
            .iter()
            .take(8)
            .fold(0u64, |acc, &byte| (acc << 8) | u64::from(byte));
        PerceptualHash(bits)
    }
}

impl Default for PerceptualHasher {
    fn default() -> Self {
        Self::new()
    }
}
