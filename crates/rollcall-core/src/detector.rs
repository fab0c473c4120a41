//! ONNX face detector.
//!
//! Runs a single-stage anchor-free detection model (SCRFD family) over a
//! letterboxed grayscale frame and decodes per-stride scores and boxes into
//! [`DetectedFace`] regions. Landmark outputs, when the model has them, are
//! ignored: downstream classification works on raw pixel crops and needs no
//! alignment points.

use crate::types::DetectedFace;
use image::imageops::{self, FilterType};
use image::GrayImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

// --- Named constants (no magic numbers) ---
const DETECT_INPUT_SIZE: usize = 640;
const DETECT_MEAN: f32 = 127.5;
const DETECT_STD: f32 = 128.0;
const DETECT_SCORE_THRESHOLD: f32 = 0.5;
const DETECT_NMS_IOU: f32 = 0.4;
const DETECT_STRIDES: [usize; 3] = [8, 16, 32];
const ANCHORS_PER_CELL: usize = 2;
/// Score+bbox per stride; landmark tensors are optional on top of these.
const REQUIRED_OUTPUTS: usize = 6;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("detector model not found at {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    Inference(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Scale and padding applied by the letterbox resize, kept for de-mapping
/// detections back into source-frame coordinates.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

/// Output tensor indices for one stride: (score_idx, bbox_idx).
type StrideOutputs = (usize, usize);

/// Face detector over an ONNX inference session.
///
/// Holds mutable inference state, so each owner keeps its own instance; the
/// engine gives every live session one and serializes frames through the
/// session's lock.
#[derive(Debug)]
pub struct FaceDetector {
    session: Session,
    input_size: usize,
    /// Per-stride (score, bbox) output indices for strides [8, 16, 32],
    /// discovered by name at load time with a positional fallback.
    stride_outputs: [StrideOutputs; 3],
    /// Detections below this area are dropped as noise.
    min_face_area: f32,
}

impl FaceDetector {
    /// Load the detection model. `min_face_size` is the side of the smallest
    /// face worth keeping; anything with less area is filtered out.
    pub fn load(model_path: &Path, min_face_size: u32) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)
            .map_err(ort::Error::from)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> =
            session.outputs().iter().map(|o| o.name().to_string()).collect();
        let num_outputs = output_names.len();

        tracing::info!(
            path = %model_path.display(),
            outputs = ?output_names,
            "loaded face detection model"
        );

        if num_outputs < REQUIRED_OUTPUTS {
            return Err(DetectorError::Inference(format!(
                "model exposes {num_outputs} outputs, need at least {REQUIRED_OUTPUTS} (3 strides x score/bbox)"
            )));
        }

        let stride_outputs = discover_outputs(&output_names);
        tracing::debug!(?stride_outputs, "detector output tensor mapping");

        Ok(Self {
            session,
            input_size: DETECT_INPUT_SIZE,
            stride_outputs,
            min_face_area: (min_face_size * min_face_size) as f32,
        })
    }

    /// Detect faces in a grayscale frame.
    ///
    /// Returns zero or more boxes in source-frame coordinates, best score
    /// first. Order is a convenience, not a contract.
    pub fn detect(&mut self, frame: &GrayImage) -> Result<Vec<DetectedFace>, DetectorError> {
        let (input, letterbox) = self.preprocess(frame);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut detections = Vec::new();
        for (pos, &stride) in DETECT_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx) = self.stride_outputs[pos];

            let (_, scores) = outputs[score_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::Inference(format!("scores stride {stride}: {e}")))?;
            let (_, bboxes) = outputs[bbox_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::Inference(format!("bboxes stride {stride}: {e}")))?;

            detections.extend(decode_level(
                scores,
                bboxes,
                stride,
                self.input_size,
                &letterbox,
                DETECT_SCORE_THRESHOLD,
            ));
        }

        let min_area = self.min_face_area;
        let mut faces = nms(detections, DETECT_NMS_IOU);
        faces.retain(|f| f.area() >= min_area);
        faces.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

        Ok(faces)
    }

    /// Letterbox the frame into an NCHW float tensor, grayscale replicated
    /// across the three input channels.
    fn preprocess(&self, frame: &GrayImage) -> (Array4<f32>, Letterbox) {
        let (letterbox, new_w, new_h) =
            letterbox_for(frame.width(), frame.height(), self.input_size);
        let resized = imageops::resize(frame, new_w, new_h, FilterType::Triangle);

        let pad_x = letterbox.pad_x.floor() as usize;
        let pad_y = letterbox.pad_y.floor() as usize;

        let mut tensor = Array4::<f32>::zeros((1, 3, self.input_size, self.input_size));
        for y in 0..self.input_size {
            for x in 0..self.input_size {
                let inside = y >= pad_y
                    && y < pad_y + new_h as usize
                    && x >= pad_x
                    && x < pad_x + new_w as usize;
                let pixel = if inside {
                    resized.get_pixel((x - pad_x) as u32, (y - pad_y) as u32).0[0] as f32
                } else {
                    // Pad value normalizes to 0.0.
                    DETECT_MEAN
                };
                let normalized = (pixel - DETECT_MEAN) / DETECT_STD;
                tensor[[0, 0, y, x]] = normalized;
                tensor[[0, 1, y, x]] = normalized;
                tensor[[0, 2, y, x]] = normalized;
            }
        }

        (tensor, letterbox)
    }
}

/// Compute the letterbox fit of a `width` x `height` frame into a square
/// `input` x `input` canvas. Returns the mapping plus the resized dimensions.
fn letterbox_for(width: u32, height: u32, input: usize) -> (Letterbox, u32, u32) {
    let scale_w = input as f32 / width as f32;
    let scale_h = input as f32 / height as f32;
    let scale = scale_w.min(scale_h);

    let new_w = ((width as f32 * scale).round() as u32).clamp(1, input as u32);
    let new_h = ((height as f32 * scale).round() as u32).clamp(1, input as u32);
    let pad_x = (input as f32 - new_w as f32) / 2.0;
    let pad_y = (input as f32 - new_h as f32) / 2.0;

    (Letterbox { scale, pad_x, pad_y }, new_w, new_h)
}

/// Discover the (score, bbox) tensor pair per stride by output name.
///
/// SCRFD exports either descriptive names ("score_8", "bbox_16", ...) or
/// opaque numeric ones. Unrecognized names fall back to the standard
/// positional layout: scores first, then bboxes, landmarks (if any) last.
fn discover_outputs(names: &[String]) -> [StrideOutputs; 3] {
    let find = |prefix: &str, stride: usize| -> Option<usize> {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| n == &target)
    };

    let named = DETECT_STRIDES
        .iter()
        .all(|&stride| find("score", stride).is_some() && find("bbox", stride).is_some());

    if named {
        std::array::from_fn(|i| {
            let stride = DETECT_STRIDES[i];
            // Presence checked above.
            (
                find("score", stride).unwrap_or(i),
                find("bbox", stride).unwrap_or(3 + i),
            )
        })
    } else {
        tracing::debug!(
            ?names,
            "detector output names not recognized, using positional mapping [0-2]=scores, [3-5]=bboxes"
        );
        [(0, 3), (1, 4), (2, 5)]
    }
}

/// Decode anchor-center detections for one stride level.
fn decode_level(
    scores: &[f32],
    bboxes: &[f32],
    stride: usize,
    input_size: usize,
    letterbox: &Letterbox,
    threshold: f32,
) -> Vec<DetectedFace> {
    let grid = input_size / stride;
    let num_anchors = grid * grid * ANCHORS_PER_CELL;

    let mut detections = Vec::new();
    for idx in 0..num_anchors {
        let score = scores.get(idx).copied().unwrap_or(0.0);
        if score <= threshold {
            continue;
        }

        let cell = idx / ANCHORS_PER_CELL;
        let anchor_cx = (cell % grid) as f32 * stride as f32;
        let anchor_cy = (cell / grid) as f32 * stride as f32;

        // Box regression: [left, top, right, bottom] distances in stride units.
        let off = idx * 4;
        if off + 3 >= bboxes.len() {
            continue;
        }
        let x1 = anchor_cx - bboxes[off] * stride as f32;
        let y1 = anchor_cy - bboxes[off + 1] * stride as f32;
        let x2 = anchor_cx + bboxes[off + 2] * stride as f32;
        let y2 = anchor_cy + bboxes[off + 3] * stride as f32;

        detections.push(DetectedFace {
            x: (x1 - letterbox.pad_x) / letterbox.scale,
            y: (y1 - letterbox.pad_y) / letterbox.scale,
            width: (x2 - x1) / letterbox.scale,
            height: (y2 - y1) / letterbox.scale,
            score,
        });
    }

    detections
}

/// Greedy non-maximum suppression by IoU.
fn nms(mut detections: Vec<DetectedFace>, iou_threshold: f32) -> Vec<DetectedFace> {
    detections.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

    let mut keep = Vec::new();
    let mut suppressed = vec![false; detections.len()];

    for i in 0..detections.len() {
        if suppressed[i] {
            continue;
        }
        keep.push(detections[i].clone());
        for j in (i + 1)..detections.len() {
            if !suppressed[j] && iou(&detections[i], &detections[j]) > iou_threshold {
                suppressed[j] = true;
            }
        }
    }

    keep
}

/// Intersection-over-union of two boxes.
fn iou(a: &DetectedFace, b: &DetectedFace) -> f32 {
    let x1 = a.x.max(b.x);
    let y1 = a.y.max(b.y);
    let x2 = (a.x + a.width).min(b.x + b.width);
    let y2 = (a.y + a.height).min(b.y + b.height);

    let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let union = a.area() + b.area() - inter;

    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}
