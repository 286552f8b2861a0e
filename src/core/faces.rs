//! Face analysis behind a pluggable detector.
//!
//! A [`FaceDetector`] finds faces and optionally reads expression signals for
//! one face. [`MultiScaleAnalyzer`] runs a detector at several image scales,
//! merges overlapping detections and aggregates the per-face signals into a
//! [`FaceSummary`] for scoring. The built-in detector is SCRFD on ONNX
//! Runtime (see [`super::scrfd`]); without a detector the scan uses
//! [`DisabledFaceAnalyzer`].

use image::imageops::{self, FilterType};
use image::{DynamicImage, RgbImage};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

use super::scrfd;
use crate::config::ScanConfig;
use crate::database::models::FaceSummary;

/// Scales the detector runs at, relative to the original image.
pub const DETECTION_SCALES: [f32; 3] = [1.0, 0.5, 0.25];

/// Scaled images whose shorter side falls below this are skipped.
pub const MIN_SCALED_SIDE: u32 = 128;

/// A face counts toward isolation when its area is at least this share of
/// the largest face in the photo.
pub const MAIN_FACE_AREA_RATIO: f64 = 0.25;

#[derive(Debug, Error)]
pub enum FaceError {
    #[error("Face detection failed: {0}")]
    Detection(String),

    #[error("Expression analysis failed: {0}")]
    Expression(String),

    #[error("Face model unavailable: {0}")]
    Model(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl BoundingBox {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    pub fn area(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }

    pub fn min_side(&self) -> u32 {
        self.width.min(self.height)
    }

    fn right(&self) -> u32 {
        self.x.saturating_add(self.width)
    }

    fn bottom(&self) -> u32 {
        self.y.saturating_add(self.height)
    }

    /// Intersection over union, 0.0 for disjoint boxes.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let left = self.x.max(other.x);
        let top = self.y.max(other.y);
        let right = self.right().min(other.right());
        let bottom = self.bottom().min(other.bottom());
        if right <= left || bottom <= top {
            return 0.0;
        }

        let intersection = u64::from(right - left) * u64::from(bottom - top);
        let union = self.area() + other.area() - intersection;
        if union == 0 {
            return 0.0;
        }
        intersection as f32 / union as f32
    }

    /// Smallest box containing both.
    pub fn union(&self, other: &BoundingBox) -> BoundingBox {
        let left = self.x.min(other.x);
        let top = self.y.min(other.y);
        let right = self.right().max(other.right());
        let bottom = self.bottom().max(other.bottom());
        BoundingBox::new(left, top, right - left, bottom - top)
    }

    /// Map a box found on a scaled image back to original coordinates,
    /// clamped to `bounds`.
    fn rescaled(&self, factor: f32, bounds: (u32, u32)) -> BoundingBox {
        let scale = |v: u32| (v as f32 * factor).round() as u32;
        let x = scale(self.x).min(bounds.0);
        let y = scale(self.y).min(bounds.1);
        let width = scale(self.width).min(bounds.0 - x);
        let height = scale(self.height).min(bounds.1 - y);
        BoundingBox::new(x, y, width, height)
    }
}

/// Expression signals for one face, each in `0.0..=1.0`. A backend leaves
/// out the signals it cannot measure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ExpressionSignals {
    pub eyes_open: Option<f64>,
    pub smile: Option<f64>,
    pub naturalness: Option<f64>,
    pub head_pose_frontal: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FaceObservation {
    pub bounding_box: BoundingBox,
    pub expression: Option<ExpressionSignals>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FaceAnalysis {
    pub faces: Vec<FaceObservation>,
    pub isolation: f64,
}

impl FaceAnalysis {
    pub fn face_count(&self) -> usize {
        self.faces.len()
    }

    /// Average each expression signal over the faces that have it.
    pub fn summary(&self) -> FaceSummary {
        let expressions: Vec<&ExpressionSignals> = self
            .faces
            .iter()
            .filter_map(|face| face.expression.as_ref())
            .collect();

        let average = |pick: fn(&ExpressionSignals) -> Option<f64>| {
            let values: Vec<f64> = expressions.iter().filter_map(|e| pick(e)).collect();
            if values.is_empty() {
                None
            } else {
                Some(values.iter().sum::<f64>() / values.len() as f64)
            }
        };

        FaceSummary {
            face_count: u32::try_from(self.faces.len()).unwrap_or(u32::MAX),
            eyes_open: average(|e| e.eyes_open),
            smile: average(|e| e.smile),
            naturalness: average(|e| e.naturalness),
            head_pose_frontal: average(|e| e.head_pose_frontal),
            isolation: self.isolation,
        }
    }
}

/// A face detection backend.
pub trait FaceDetector: Send + Sync {
    fn detect_faces(&self, image: &RgbImage) -> Result<Vec<BoundingBox>, FaceError>;

    /// Expression signals for one face, `None` when the backend cannot tell.
    fn analyze_expressions(
        &self,
        _image: &RgbImage,
        _face: &BoundingBox,
    ) -> Result<Option<ExpressionSignals>, FaceError> {
        Ok(None)
    }
}

pub trait FaceAnalyzer: Send + Sync {
    fn analyze(&self, image: &DynamicImage) -> Result<FaceAnalysis, FaceError>;
}

/// Reports no faces for every photo.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledFaceAnalyzer;

impl FaceAnalyzer for DisabledFaceAnalyzer {
    fn analyze(&self, _image: &DynamicImage) -> Result<FaceAnalysis, FaceError> {
        Ok(FaceAnalysis::default())
    }
}

pub struct MultiScaleAnalyzer {
    detector: Arc<dyn FaceDetector>,
    merge_iou: f32,
    min_expression_px: u32,
}

impl MultiScaleAnalyzer {
    pub fn new(detector: Arc<dyn FaceDetector>) -> Self {
        let defaults = ScanConfig::default();
        Self {
            detector,
            merge_iou: defaults.face_merge_iou,
            min_expression_px: defaults.min_expression_face_px,
        }
    }

    pub fn with_config(mut self, config: &ScanConfig) -> Self {
        self.merge_iou = config.face_merge_iou;
        self.min_expression_px = config.min_expression_face_px;
        self
    }

    fn detect_all_scales(&self, rgb: &RgbImage) -> Result<Vec<BoundingBox>, FaceError> {
        let (width, height) = rgb.dimensions();
        let mut merged: Vec<BoundingBox> = Vec::new();

        for &scale in &DETECTION_SCALES {
            let detections = if scale >= 1.0 {
                self.detector.detect_faces(rgb)?
            } else {
                let scaled_width = (width as f32 * scale).round() as u32;
                let scaled_height = (height as f32 * scale).round() as u32;
                if scaled_width.min(scaled_height) < MIN_SCALED_SIDE {
                    continue;
                }
                let scaled = imageops::resize(rgb, scaled_width, scaled_height, FilterType::Triangle);
                self.detector
                    .detect_faces(&scaled)?
                    .into_iter()
                    .map(|b| b.rescaled(1.0 / scale, (width, height)))
                    .collect()
            };

            for detection in detections {
                merge_detection(&mut merged, detection, self.merge_iou);
            }
        }

        Ok(merged)
    }
}

impl FaceAnalyzer for MultiScaleAnalyzer {
    fn analyze(&self, image: &DynamicImage) -> Result<FaceAnalysis, FaceError> {
        let rgb = image.to_rgb8();
        let boxes = self.detect_all_scales(&rgb)?;
        let isolation = isolation_score(&boxes);

        let faces = boxes
            .into_iter()
            .map(|bounding_box| {
                let expression = if bounding_box.min_side() >= self.min_expression_px {
                    match self.detector.analyze_expressions(&rgb, &bounding_box) {
                        Ok(signals) => signals,
                        Err(e) => {
                            log::warn!("Expression analysis skipped for one face: {}", e);
                            None
                        }
                    }
                } else {
                    None
                };
                FaceObservation {
                    bounding_box,
                    expression,
                }
            })
            .collect();

        Ok(FaceAnalysis { faces, isolation })
    }
}

/// Pick the analyzer for a scan. An injected detector wins; otherwise the
/// SCRFD model from the config is loaded. Face detection enabled with no
/// usable detector degrades to no faces, with a warning.
pub fn analyzer_for(
    config: &ScanConfig,
    detector: Option<Arc<dyn FaceDetector>>,
) -> Arc<dyn FaceAnalyzer> {
    if !config.face_detection_enabled {
        return Arc::new(DisabledFaceAnalyzer);
    }

    let detector = match detector {
        Some(detector) => Some(detector),
        None => match config.resolved_face_model() {
            Some(model) => match scrfd::load_detector(&model, config) {
                Ok(detector) => Some(detector),
                Err(e) => {
                    log::warn!("{}; scoring without faces", e);
                    None
                }
            },
            None => {
                log::warn!("Face detection is enabled but no face model is configured; scoring without faces");
                None
            }
        },
    };

    match detector {
        Some(detector) => Arc::new(MultiScaleAnalyzer::new(detector).with_config(config)),
        None => Arc::new(DisabledFaceAnalyzer),
    }
}

/// Fold `detection` into `merged`: an overlap above `threshold` grows the
/// existing box, anything else is a new face.
fn merge_detection(merged: &mut Vec<BoundingBox>, detection: BoundingBox, threshold: f32) {
    match merged.iter_mut().find(|existing| existing.iou(&detection) > threshold) {
        Some(existing) => *existing = existing.union(&detection),
        None => merged.push(detection),
    }
}

/// Share of faces that are main subjects rather than small background faces.
pub fn isolation_score(boxes: &[BoundingBox]) -> f64 {
    let Some(largest) = boxes.iter().map(BoundingBox::area).max() else {
        return 0.0;
    };
    let threshold = largest as f64 * MAIN_FACE_AREA_RATIO;
    let main_faces = boxes.iter().filter(|b| b.area() as f64 >= threshold).count();
    main_faces as f64 / boxes.len() as f64
}
