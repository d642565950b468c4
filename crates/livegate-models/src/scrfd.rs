//! SCRFD face detector (insightface `det_10g`).
//!
//! The model sees a 640x640 canvas with the frame resized into the top-left
//! corner. It emits, for each of the strides 8/16/32, a score, a bbox
//! distance and a 5-point landmark tensor per anchor (2 anchors per cell).

use std::path::Path;

use livegate_core::{CapabilityError, Detection, FaceDetector, FaceRegion, Frame};
use ndarray::Array4;
use ort::session::Session;

use crate::onnx::{self, ModelLoadError};

const CAPABILITY: &str = "face_detector";
const INPUT_SIZE: u32 = 640;
const STRIDES: [usize; 3] = [8, 16, 32];
const ANCHORS_PER_CELL: usize = 2;
const SCORE_THRESHOLD: f32 = 0.5;
const NMS_IOU_THRESHOLD: f32 = 0.4;

pub struct ScrfdDetector {
    session: Session,
    score_threshold: f32,
}

impl ScrfdDetector {
    pub fn load(path: &Path) -> Result<Self, ModelLoadError> {
        Ok(Self {
            session: onnx::load_session(path)?,
            score_threshold: SCORE_THRESHOLD,
        })
    }
}

impl FaceDetector for ScrfdDetector {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>, CapabilityError> {
        let (tensor, scale) = canvas(frame)?;
        let outputs = onnx::run_flat(&mut self.session, tensor, CAPABILITY)?;
        if outputs.len() < STRIDES.len() * 3 {
            return Err(CapabilityError::UnexpectedOutput {
                capability: CAPABILITY,
                message: format!("expected 9 outputs, got {}", outputs.len()),
            });
        }

        let mut candidates = Vec::new();
        for (i, &stride) in STRIDES.iter().enumerate() {
            candidates.extend(decode_stride(
                stride,
                &outputs[i],
                &outputs[i + 3],
                &outputs[i + 6],
                self.score_threshold,
            ));
        }

        let kept = nms(candidates, NMS_IOU_THRESHOLD);
        Ok(kept
            .into_iter()
            .map(|c| c.into_detection(scale))
            .collect())
    }
}

/// Resize into the top-left of a 640x640 canvas, keeping aspect ratio.
/// Returns the tensor and the frame-to-canvas scale.
fn canvas(frame: &Frame) -> Result<(Array4<f32>, f32), CapabilityError> {
    if frame.is_empty() {
        return Err(CapabilityError::InvalidInput("empty frame".to_string()));
    }
    let scale = (INPUT_SIZE as f32 / frame.width() as f32)
        .min(INPUT_SIZE as f32 / frame.height() as f32);
    let new_w = ((frame.width() as f32 * scale).round() as u32).clamp(1, INPUT_SIZE);
    let new_h = ((frame.height() as f32 * scale).round() as u32).clamp(1, INPUT_SIZE);

    let resized = onnx::to_nchw(
        frame,
        new_w,
        new_h,
        onnx::Normalize {
            mean: [127.5; 3],
            scale: 1.0 / 128.0,
            bgr: false,
        },
    )?;

    let (h, w) = (new_h as usize, new_w as usize);
    let mut tensor = Array4::<f32>::zeros((1, 3, INPUT_SIZE as usize, INPUT_SIZE as usize));
    tensor.slice_mut(ndarray::s![.., .., ..h, ..w]).assign(&resized);
    Ok((tensor, scale))
}

/// A detection in canvas coordinates.
#[derive(Debug, Clone, PartialEq)]
struct Candidate {
    bbox: [f32; 4],
    score: f32,
    landmarks: [(f32, f32); 5],
}

impl Candidate {
    fn into_detection(self, scale: f32) -> Detection {
        let [x1, y1, x2, y2] = self.bbox.map(|v| v / scale);
        let mut landmarks = self.landmarks;
        for point in &mut landmarks {
            *point = (point.0 / scale, point.1 / scale);
        }
        Detection {
            region: FaceRegion::new(
                x1.round() as i32,
                y1.round() as i32,
                (x2 - x1).round() as i32,
                (y2 - y1).round() as i32,
            ),
            confidence: self.score,
            landmarks: Some(landmarks),
        }
    }
}

/// Decode one stride level. Anchor centres sit on the stride grid and the
/// predictions are distances in units of the stride.
fn decode_stride(
    stride: usize,
    scores: &[f32],
    bboxes: &[f32],
    kps: &[f32],
    threshold: f32,
) -> Vec<Candidate> {
    let cells = INPUT_SIZE as usize / stride;
    let anchors = cells * cells * ANCHORS_PER_CELL;
    let s = stride as f32;

    let mut out = Vec::new();
    for a in 0..anchors.min(scores.len()) {
        let score = scores[a];
        if score < threshold || bboxes.len() < (a + 1) * 4 || kps.len() < (a + 1) * 10 {
            continue;
        }
        let cell = a / ANCHORS_PER_CELL;
        let cx = (cell % cells) as f32 * s;
        let cy = (cell / cells) as f32 * s;

        let d = &bboxes[a * 4..a * 4 + 4];
        let bbox = [cx - d[0] * s, cy - d[1] * s, cx + d[2] * s, cy + d[3] * s];

        let k = &kps[a * 10..a * 10 + 10];
        let mut landmarks = [(0.0, 0.0); 5];
        for (p, point) in landmarks.iter_mut().enumerate() {
            *point = (cx + k[p * 2] * s, cy + k[p * 2 + 1] * s);
        }

        out.push(Candidate {
            bbox,
            score,
            landmarks,
        });
    }
    out
}

fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let ix = (a[2].min(b[2]) - a[0].max(b[0])).max(0.0);
    let iy = (a[3].min(b[3]) - a[1].max(b[1])).max(0.0);
    let inter = ix * iy;
    if inter == 0.0 {
        return 0.0;
    }
    let area_a = (a[2] - a[0]) * (a[3] - a[1]);
    let area_b = (b[2] - b[0]) * (b[3] - b[1]);
    inter / (area_a + area_b - inter)
}

/// Greedy non-maximum suppression, highest score first.
fn nms(mut candidates: Vec<Candidate>, iou_threshold: f32) -> Vec<Candidate> {
    candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
    let mut kept: Vec<Candidate> = Vec::with_capacity(candidates.len());
    for c in candidates {
        if kept.iter().all(|k| iou(&k.bbox, &c.bbox) <= iou_threshold) {
            kept.push(c);
        }
    }
    kept
}
