//! SCRFD face detector (InsightFace) on ONNX Runtime.
//!
//! Letterboxing, anchor decoding and suppression work on plain tensors. Only
//! the inference session needs the `face-detection` feature.

use image::imageops::{self, FilterType};
use image::RgbImage;
use std::path::Path;
use std::sync::Arc;

use super::faces::{BoundingBox, FaceDetector, FaceError};
use crate::config::ScanConfig;

/// Side of the square model input.
pub const INPUT_SIZE: u32 = 640;

/// Feature map strides of the three detection heads, in output order.
pub const STRIDES: [u32; 3] = [8, 16, 32];

/// Overlap above which the weaker of two detections is dropped.
pub const NMS_IOU: f32 = 0.4;

const INPUT_MEAN: f32 = 127.5;
const INPUT_STD: f32 = 128.0;

/// Margin around a face, relative to its size, kept when cropping it for
/// landmark detection.
const CROP_MARGIN: f32 = 0.25;

type Point = (f32, f32);

/// The five SCRFD keypoints, in image coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Landmarks {
    pub left_eye: Point,
    pub right_eye: Point,
    pub nose: Point,
    pub mouth_left: Point,
    pub mouth_right: Point,
}

impl Landmarks {
    fn from_points(p: &[f32; 10]) -> Self {
        Self {
            left_eye: (p[0], p[1]),
            right_eye: (p[2], p[3]),
            nose: (p[4], p[5]),
            mouth_left: (p[6], p[7]),
            mouth_right: (p[8], p[9]),
        }
    }

    /// 1.0 with the nose midway between the eyes, falling to 0.0 as it
    /// reaches either eye.
    pub fn frontal_score(&self) -> f64 {
        let (lx, ly) = self.left_eye;
        let (rx, ry) = self.right_eye;
        let eye_distance = ((rx - lx).powi(2) + (ry - ly).powi(2)).sqrt();
        if eye_distance < 1e-3 {
            return 0.0;
        }
        let offset = (self.nose.0 - (lx + rx) / 2.0).abs() / eye_distance;
        f64::from(1.0 - 2.0 * offset).clamp(0.0, 1.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub confidence: f32,
    pub landmarks: Option<Landmarks>,
}

impl Detection {
    fn area(&self) -> f32 {
        (self.x2 - self.x1).max(0.0) * (self.y2 - self.y1).max(0.0)
    }

    fn iou(&self, other: &Detection) -> f32 {
        let width = (self.x2.min(other.x2) - self.x1.max(other.x1)).max(0.0);
        let height = (self.y2.min(other.y2) - self.y1.max(other.y1)).max(0.0);
        let intersection = width * height;
        let union = self.area() + other.area() - intersection;
        if union <= 0.0 {
            0.0
        } else {
            intersection / union
        }
    }

    pub fn bounding_box(&self) -> BoundingBox {
        let x = self.x1.round() as u32;
        let y = self.y1.round() as u32;
        BoundingBox::new(
            x,
            y,
            (self.x2.round() as u32).saturating_sub(x),
            (self.y2.round() as u32).saturating_sub(y),
        )
    }
}

/// NCHW input tensor and the factor the image was scaled by.
pub struct Prepared {
    pub tensor: Vec<f32>,
    pub scale: f32,
}

/// Fit `image` into the top-left of a black square input, normalized the way
/// SCRFD was trained (RGB, mean 127.5, std 128).
pub fn prepare(image: &RgbImage) -> Prepared {
    let (width, height) = image.dimensions();
    let scale = INPUT_SIZE as f32 / width.max(height).max(1) as f32;
    let fit = |v: u32| ((v as f32 * scale).round() as u32).clamp(1, INPUT_SIZE);
    let resized = imageops::resize(image, fit(width), fit(height), FilterType::Triangle);

    let plane = (INPUT_SIZE * INPUT_SIZE) as usize;
    let mut tensor = vec![-INPUT_MEAN / INPUT_STD; 3 * plane];
    for (x, y, pixel) in resized.enumerate_pixels() {
        let offset = (y * INPUT_SIZE + x) as usize;
        for channel in 0..3 {
            tensor[channel * plane + offset] = (f32::from(pixel[channel]) - INPUT_MEAN) / INPUT_STD;
        }
    }

    Prepared { tensor, scale }
}

/// Flattened outputs of one detection head.
pub struct StrideOutput<'a> {
    pub stride: u32,
    pub scores: &'a [f32],
    pub boxes: &'a [f32],
    pub landmarks: Option<&'a [f32]>,
}

/// Turn raw head outputs into detections in original image coordinates,
/// clamped to `bounds`, strongest first.
pub fn decode(
    heads: &[StrideOutput<'_>],
    scale: f32,
    bounds: (u32, u32),
    min_confidence: f32,
) -> Vec<Detection> {
    let mut detections = Vec::new();

    for head in heads {
        let side = (INPUT_SIZE / head.stride) as usize;
        let points = side * side;
        if head.scores.is_empty() || head.scores.len() % points != 0 {
            log::warn!(
                "Ignoring stride {} output with {} scores for a {}x{} grid",
                head.stride,
                head.scores.len(),
                side,
                side
            );
            continue;
        }
        let anchors = head.scores.len() / points;
        let stride = head.stride as f32;
        let to_image = |v: f32, limit: u32| (v / scale).clamp(0.0, limit as f32);

        for (index, &confidence) in head.scores.iter().enumerate() {
            if confidence < min_confidence {
                continue;
            }
            let Some(distances) = head.boxes.get(index * 4..index * 4 + 4) else {
                continue;
            };
            let point = index / anchors;
            let cx = (point % side) as f32 * stride;
            let cy = (point / side) as f32 * stride;

            let x1 = to_image(cx - distances[0] * stride, bounds.0);
            let y1 = to_image(cy - distances[1] * stride, bounds.1);
            let x2 = to_image(cx + distances[2] * stride, bounds.0);
            let y2 = to_image(cy + distances[3] * stride, bounds.1);
            if x2 <= x1 || y2 <= y1 {
                continue;
            }

            let landmarks = head
                .landmarks
                .and_then(|k| k.get(index * 10..index * 10 + 10))
                .map(|k| {
                    let mut points = [0.0f32; 10];
                    for i in 0..5 {
                        points[2 * i] = (cx + k[2 * i] * stride) / scale;
                        points[2 * i + 1] = (cy + k[2 * i + 1] * stride) / scale;
                    }
                    Landmarks::from_points(&points)
                });

            detections.push(Detection {
                x1,
                y1,
                x2,
                y2,
                confidence,
                landmarks,
            });
        }
    }

    non_max_suppression(detections, NMS_IOU)
}

/// Greedy suppression: keep the strongest detection of every overlapping group.
pub fn non_max_suppression(mut detections: Vec<Detection>, max_iou: f32) -> Vec<Detection> {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<Detection> = Vec::with_capacity(detections.len());
    for detection in detections {
        if kept.iter().all(|k| k.iou(&detection) <= max_iou) {
            kept.push(detection);
        }
    }
    kept
}

/// The face plus a margin on every side, clipped to the image.
pub fn crop_face(image: &RgbImage, face: &BoundingBox) -> RgbImage {
    let (width, height) = image.dimensions();
    let margin_x = (face.width as f32 * CROP_MARGIN).round() as u32;
    let margin_y = (face.height as f32 * CROP_MARGIN).round() as u32;
    let x = face.x.saturating_sub(margin_x).min(width.saturating_sub(1));
    let y = face.y.saturating_sub(margin_y).min(height.saturating_sub(1));
    let right = face.x.saturating_add(face.width).saturating_add(margin_x).min(width);
    let bottom = face.y.saturating_add(face.height).saturating_add(margin_y).min(height);
    imageops::crop_imm(
        image,
        x,
        y,
        right.saturating_sub(x).max(1),
        bottom.saturating_sub(y).max(1),
    )
    .to_image()
}

#[cfg(feature = "face-detection")]
pub use session::ScrfdDetector;

#[cfg(feature = "face-detection")]
mod session {
    use ort::session::Session;
    use ort::value::Value;
    use std::sync::Mutex;

    use super::*;
    use crate::core::faces::ExpressionSignals;

    pub struct ScrfdDetector {
        session: Mutex<Session>,
        min_confidence: f32,
    }

    impl ScrfdDetector {
        pub fn load(model: &Path, min_confidence: f32) -> Result<Self, FaceError> {
            if !model.is_file() {
                return Err(FaceError::Model(format!("{} not found", model.display())));
            }
            let session = Session::builder()
                .and_then(|builder| builder.commit_from_file(model))
                .map_err(|e| FaceError::Model(format!("cannot load {}: {}", model.display(), e)))?;

            let outputs = session.outputs.len();
            if outputs != STRIDES.len() * 2 && outputs != STRIDES.len() * 3 {
                return Err(FaceError::Model(format!(
                    "{} has {} outputs; an SCRFD model has 6, or 9 with keypoints",
                    model.display(),
                    outputs
                )));
            }

            log::info!("Loaded SCRFD face model from {}", model.display());
            Ok(Self {
                session: Mutex::new(session),
                min_confidence,
            })
        }

        fn run(&self, image: &RgbImage) -> Result<Vec<Detection>, FaceError> {
            let detection_error = |e: ort::Error| FaceError::Detection(e.to_string());
            let prepared = prepare(image);

            let mut session = self
                .session
                .lock()
                .map_err(|_| FaceError::Detection("face model lock poisoned".to_string()))?;
            let input_name = session.inputs[0].name.clone();
            let output_names: Vec<String> =
                session.outputs.iter().map(|output| output.name.clone()).collect();

            let shape = vec![1i64, 3, i64::from(INPUT_SIZE), i64::from(INPUT_SIZE)];
            let input = Value::from_array((shape, prepared.tensor)).map_err(detection_error)?;
            let outputs = session
                .run(ort::inputs![input_name => input])
                .map_err(detection_error)?;

            let mut tensors: Vec<&[f32]> = Vec::with_capacity(output_names.len());
            for name in &output_names {
                let value = outputs
                    .get(name.as_str())
                    .ok_or_else(|| FaceError::Detection(format!("missing model output {}", name)))?;
                let (_, data) = value.try_extract_tensor::<f32>().map_err(detection_error)?;
                tensors.push(data);
            }

            // Outputs come grouped by kind: scores, then boxes, then keypoints.
            let heads = STRIDES.len();
            let with_landmarks = tensors.len() == heads * 3;
            let strides: Vec<StrideOutput<'_>> = STRIDES
                .iter()
                .enumerate()
                .map(|(i, &stride)| StrideOutput {
                    stride,
                    scores: tensors[i],
                    boxes: tensors[heads + i],
                    landmarks: with_landmarks.then(|| tensors[2 * heads + i]),
                })
                .collect();

            Ok(decode(&strides, prepared.scale, image.dimensions(), self.min_confidence))
        }
    }

    impl FaceDetector for ScrfdDetector {
        fn detect_faces(&self, image: &RgbImage) -> Result<Vec<BoundingBox>, FaceError> {
            Ok(self.run(image)?.iter().map(Detection::bounding_box).collect())
        }

        /// Head pose from the keypoints of the strongest face in the crop.
        /// SCRFD has no eye or mouth state, so those signals stay empty.
        fn analyze_expressions(
            &self,
            image: &RgbImage,
            face: &BoundingBox,
        ) -> Result<Option<ExpressionSignals>, FaceError> {
            let crop = crop_face(image, face);
            let landmarks = self
                .run(&crop)
                .map_err(|e| FaceError::Expression(e.to_string()))?
                .into_iter()
                .find_map(|detection| detection.landmarks);

            Ok(landmarks.map(|landmarks| ExpressionSignals {
                head_pose_frontal: Some(landmarks.frontal_score()),
                ..ExpressionSignals::default()
            }))
        }
    }
}

/// Load the SCRFD detector from `model`.
#[cfg(feature = "face-detection")]
pub fn load_detector(model: &Path, config: &ScanConfig) -> Result<Arc<dyn FaceDetector>, FaceError> {
    Ok(Arc::new(ScrfdDetector::load(model, config.face_min_confidence)?))
}

/// Load the SCRFD detector from `model`.
#[cfg(not(feature = "face-detection"))]
pub fn load_detector(model: &Path, _config: &ScanConfig) -> Result<Arc<dyn FaceDetector>, FaceError> {
    Err(FaceError::Model(format!(
        "cannot load {}: built without the face-detection feature",
        model.display()
    )))
}
