use image::{DynamicImage, GrayImage};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;

use crate::core::faces::{DisabledFaceAnalyzer, FaceAnalyzer};
use crate::database::models::FaceSummary;

/// Weights of the composite quality score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScoreWeights {
    pub sharpness: f64,
    pub brightness: f64,
    pub faces: f64,
    pub eyes_open: f64,
    pub smile: f64,
    pub isolation: f64,
    pub naturalness: f64,
    pub head_pose: f64,
}

pub const DEFAULT_WEIGHTS: ScoreWeights = ScoreWeights {
    sharpness: 0.45,
    brightness: 0.13,
    faces: 0.10,
    eyes_open: 0.12,
    smile: 0.09,
    isolation: 0.05,
    naturalness: 0.04,
    head_pose: 0.02,
};

/// Faces beyond this many add nothing to the score.
pub const MAX_COUNTED_FACES: u32 = 3;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct QualityMetrics {
    /// Variance of the Laplacian of the grayscale image.
    pub sharpness: f64,
    /// Mean grayscale intensity, 0..=255.
    pub brightness: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PhotoScore {
    pub metrics: QualityMetrics,
    pub faces: FaceSummary,
    pub quality_score: f64,
}

impl PhotoScore {
    /// Score of a photo that could not be decoded.
    pub fn unreadable() -> Self {
        Self::default()
    }
}

pub fn measure(image: &DynamicImage) -> QualityMetrics {
    let gray = image.to_luma8();
    QualityMetrics {
        sharpness: laplacian_variance(&gray),
        brightness: mean_brightness(&gray),
    }
}

/// Variance of the 4-neighbour Laplacian over interior pixels. Images
/// smaller than 3x3 have no interior and score 0.
pub fn laplacian_variance(gray: &GrayImage) -> f64 {
    let (width, height) = gray.dimensions();
    if width < 3 || height < 3 {
        return 0.0;
    }

    let pixels = gray.as_raw();
    let stride = width as usize;
    let mut sum = 0.0f64;
    let mut sum_sq = 0.0f64;
    let mut count = 0usize;

    for y in 1..(height as usize - 1) {
        for x in 1..(width as usize - 1) {
            let idx = y * stride + x;
            let center = f64::from(pixels[idx]);
            let response = f64::from(pixels[idx - stride])
                + f64::from(pixels[idx + stride])
                + f64::from(pixels[idx - 1])
                + f64::from(pixels[idx + 1])
                - 4.0 * center;
            sum += response;
            sum_sq += response * response;
            count += 1;
        }
    }

    let n = count as f64;
    let mean = sum / n;
    (sum_sq / n - mean * mean).max(0.0)
}

pub fn mean_brightness(gray: &GrayImage) -> f64 {
    let pixels = gray.as_raw();
    if pixels.is_empty() {
        return 0.0;
    }
    pixels.iter().map(|&p| f64::from(p)).sum::<f64>() / pixels.len() as f64
}

/// Composite quality score. Missing expression signals contribute nothing.
pub fn quality_score(metrics: &QualityMetrics, faces: &FaceSummary, weights: &ScoreWeights) -> f64 {
    let sharpness = metrics.sharpness.max(0.0);
    let face_term = f64::from(faces.face_count.min(MAX_COUNTED_FACES));

    weights.sharpness * (sharpness + 1.0).ln()
        + weights.brightness * (metrics.brightness / 255.0)
        + weights.faces * face_term
        + weights.eyes_open * faces.eyes_open.unwrap_or(0.0)
        + weights.smile * faces.smile.unwrap_or(0.0)
        + weights.isolation * faces.isolation
        + weights.naturalness * faces.naturalness.unwrap_or(0.0)
        + weights.head_pose * faces.head_pose_frontal.unwrap_or(0.0)
}

/// Scores photos for the suggestion engine.
pub struct ScoringService {
    analyzer: Arc<dyn FaceAnalyzer>,
    weights: ScoreWeights,
}

impl ScoringService {
    pub fn new(analyzer: Arc<dyn FaceAnalyzer>) -> Self {
        Self {
            analyzer,
            weights: DEFAULT_WEIGHTS,
        }
    }

    pub fn without_faces() -> Self {
        Self::new(Arc::new(DisabledFaceAnalyzer))
    }

    pub fn score_image(&self, image: &DynamicImage) -> PhotoScore {
        let metrics = measure(image);
        let faces = match self.analyzer.analyze(image) {
            Ok(analysis) => analysis.summary(),
            Err(e) => {
                log::warn!("Face analysis failed, scoring without faces: {}", e);
                FaceSummary::default()
            }
        };
        PhotoScore {
            metrics,
            faces,
            quality_score: quality_score(&metrics, &faces, &self.weights),
        }
    }

    /// Score a file on disk. Undecodable files score 0.
    pub fn score_path(&self, path: &Path) -> PhotoScore {
        match image::open(path) {
            Ok(image) => self.score_image(&image),
            Err(e) => {
                log::warn!("Cannot decode {} for scoring: {}", path.display(), e);
                PhotoScore::unreadable()
            }
        }
    }
}
