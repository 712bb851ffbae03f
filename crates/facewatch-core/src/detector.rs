//! SCRFD face detector via ONNX Runtime.
//!
//! Letterboxes an RGB frame into the 640×640 model input, decodes the three
//! anchor-free stride heads (boxes + five landmarks) and suppresses overlaps.

use crate::types::BoundingBox;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const SCRFD_INPUT_SIZE: usize = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}: download det_10g.onnx from insightface into the model directory")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("frame buffer too short: expected {expected} RGB bytes, got {actual}")]
    InvalidFrame { expected: usize, actual: usize },
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Score and overlap thresholds applied after decoding.
#[derive(Debug, Clone, Copy)]
pub struct DetectorSettings {
    pub confidence_threshold: f32,
    pub nms_threshold: f32,
    /// Faces narrower than this (in frame pixels) are dropped.
    pub min_face_size: f32,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.5,
            nms_threshold: 0.4,
            min_face_size: 20.0,
        }
    }
}

/// Scale and padding used to fit a frame into the square model input.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
    scaled_w: usize,
    scaled_h: usize,
}

impl Letterbox {
    fn fit(width: usize, height: usize, target: usize) -> Self {
        let scale = (target as f32 / width as f32).min(target as f32 / height as f32);
        let scaled_w = ((width as f32 * scale).round() as usize).clamp(1, target);
        let scaled_h = ((height as f32 * scale).round() as usize).clamp(1, target);
        Self {
            scale,
            pad_x: (target - scaled_w) as f32 / 2.0,
            pad_y: (target - scaled_h) as f32 / 2.0,
            scaled_w,
            scaled_h,
        }
    }

    /// Map a point in model-input space back to frame space.
    fn to_frame(&self, (x, y): (f32, f32)) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// Output positions of (score, bbox, kps) tensors for one stride.
type HeadIndices = (usize, usize, usize);

/// SCRFD-based face detector.
pub struct FaceDetector {
    session: Session,
    heads: [HeadIndices; 3],
    settings: DetectorSettings,
}

impl FaceDetector {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: &str, settings: DetectorSettings) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        tracing::info!(path = model_path, outputs = ?output_names, "loaded SCRFD model");

        if output_names.len() < 9 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model requires 9 outputs (3 strides x score/bbox/kps), got {}",
                output_names.len()
            )));
        }

        let heads = locate_heads(&output_names);
        tracing::debug!(?heads, "SCRFD output tensor mapping");

        Ok(Self { session, heads, settings })
    }

    /// Detect faces in a packed RGB24 frame.
    ///
    /// Results are ordered by descending confidence; equal scores keep decode
    /// order, so repeated calls on the same frame return the same sequence.
    pub fn detect(&mut self, rgb: &[u8], width: u32, height: u32) -> Result<Vec<BoundingBox>, DetectorError> {
        let (w, h) = (width as usize, height as usize);
        let expected = w * h * 3;
        if w == 0 || h == 0 || rgb.len() < expected {
            return Err(DetectorError::InvalidFrame { expected, actual: rgb.len() });
        }

        let letterbox = Letterbox::fit(w, h, SCRFD_INPUT_SIZE);
        let input = letterbox_tensor(rgb, w, h, &letterbox);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (&stride, &(score_idx, bbox_idx, kps_idx)) in SCRFD_STRIDES.iter().zip(self.heads.iter()) {
            let extract = |idx: usize, what: &str| {
                outputs[idx]
                    .try_extract_tensor::<f32>()
                    .map(|(_, data)| data)
                    .map_err(|e| DetectorError::InferenceFailed(format!("{what} stride {stride}: {e}")))
            };
            let head = StrideHead {
                stride,
                scores: extract(score_idx, "scores")?,
                boxes: extract(bbox_idx, "bboxes")?,
                landmarks: extract(kps_idx, "kps")?,
            };
            candidates.extend(head.decode(&letterbox, self.settings.confidence_threshold));
        }

        candidates.retain(|b| b.width >= self.settings.min_face_size);
        Ok(non_max_suppression(candidates, self.settings.nms_threshold))
    }
}

/// Resize (bilinear) and pad an RGB frame into a normalised NCHW tensor.
fn letterbox_tensor(rgb: &[u8], width: usize, height: usize, lb: &Letterbox) -> Array4<f32> {
    let size = SCRFD_INPUT_SIZE;
    // Padding normalises to 0.0.
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    let off_x = lb.pad_x.floor() as usize;
    let off_y = lb.pad_y.floor() as usize;
    let inv = 1.0 / lb.scale;

    for y in 0..lb.scaled_h {
        let src_y = ((y as f32 + 0.5) * inv - 0.5).max(0.0);
        let y0 = (src_y.floor() as usize).min(height - 1);
        let y1 = (y0 + 1).min(height - 1);
        let fy = src_y - y0 as f32;

        for x in 0..lb.scaled_w {
            let src_x = ((x as f32 + 0.5) * inv - 0.5).max(0.0);
            let x0 = (src_x.floor() as usize).min(width - 1);
            let x1 = (x0 + 1).min(width - 1);
            let fx = src_x - x0 as f32;

            for c in 0..3 {
                let px = |xx: usize, yy: usize| rgb[(yy * width + xx) * 3 + c] as f32;
                let top = px(x0, y0) * (1.0 - fx) + px(x1, y0) * fx;
                let bottom = px(x0, y1) * (1.0 - fx) + px(x1, y1) * fx;
                let value = (top * (1.0 - fy) + bottom * fy).clamp(0.0, 255.0);
                tensor[[0, c, off_y + y, off_x + x]] = (value - SCRFD_MEAN) / SCRFD_STD;
            }
        }
    }

    tensor
}

/// Find score/bbox/kps tensors per stride by name ("score_8", "bbox_16", ...).
///
/// Exports with generic numeric names fall back to the standard positional
/// layout: [0-2] scores, [3-5] boxes, [6-8] landmarks.
fn locate_heads(names: &[String]) -> [HeadIndices; 3] {
    let position = |prefix: &str, stride: usize| {
        let wanted = format!("{prefix}_{stride}");
        names.iter().position(|n| *n == wanted)
    };

    let mut named = [(0usize, 0usize, 0usize); 3];
    for (slot, &stride) in SCRFD_STRIDES.iter().enumerate() {
        match (position("score", stride), position("bbox", stride), position("kps", stride)) {
            (Some(s), Some(b), Some(k)) => named[slot] = (s, b, k),
            _ => {
                tracing::info!(?names, "SCRFD: output names not recognized, using positional mapping");
                return [(0, 3, 6), (1, 4, 7), (2, 5, 8)];
            }
        }
    }
    named
}

/// Raw tensors of one stride level.
struct StrideHead<'a> {
    stride: usize,
    scores: &'a [f32],
    boxes: &'a [f32],
    landmarks: &'a [f32],
}

impl StrideHead<'_> {
    fn decode(&self, letterbox: &Letterbox, threshold: f32) -> Vec<BoundingBox> {
        let stride = self.stride as f32;
        let grid_w = SCRFD_INPUT_SIZE / self.stride;
        let grid_h = SCRFD_INPUT_SIZE / self.stride;
        let anchors = grid_w * grid_h * SCRFD_ANCHORS_PER_CELL;

        let mut faces = Vec::new();
        for idx in 0..anchors.min(self.scores.len()) {
            let score = self.scores[idx];
            if score <= threshold {
                continue;
            }
            let Some(dist) = self.boxes.get(idx * 4..idx * 4 + 4) else {
                continue;
            };

            let cell = idx / SCRFD_ANCHORS_PER_CELL;
            let cx = (cell % grid_w) as f32 * stride;
            let cy = (cell / grid_w) as f32 * stride;

            let (x1, y1) = letterbox.to_frame((cx - dist[0] * stride, cy - dist[1] * stride));
            let (x2, y2) = letterbox.to_frame((cx + dist[2] * stride, cy + dist[3] * stride));

            let landmarks = self.landmarks.get(idx * 10..idx * 10 + 10).map(|kps| {
                std::array::from_fn(|i| letterbox.to_frame((cx + kps[i * 2] * stride, cy + kps[i * 2 + 1] * stride)))
            });

            faces.push(BoundingBox {
                x: x1,
                y: y1,
                width: x2 - x1,
                height: y2 - y1,
                confidence: score,
                landmarks,
            });
        }
        faces
    }
}

/// Greedy non-maximum suppression; output ordered by descending confidence.
fn non_max_suppression(mut boxes: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    boxes.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept: Vec<BoundingBox> = Vec::with_capacity(boxes.len());
    for candidate in boxes {
        if kept.iter().all(|k| k.iou(&candidate) <= iou_threshold) {
            kept.push(candidate);
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    fn face(x: f32, y: f32, w: f32, h: f32, conf: f32) -> BoundingBox {
        BoundingBox { x, y, width: w, height: h, confidence: conf, landmarks: None }
    }

    #[test]
    fn test_nms_suppresses_overlapping() {
        let result = non_max_suppression(
            vec![
                face(5.0, 5.0, 100.0, 100.0, 0.8),
                face(0.0, 0.0, 100.0, 100.0, 0.9),
                face(200.0, 200.0, 50.0, 50.0, 0.7),
            ],
            0.4,
        );
        assert_eq!(result.len(), 2);
        assert!((result[0].confidence - 0.9).abs() < 1e-6);
        assert!((result[1].confidence - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_nms_keeps_disjoint_and_handles_empty() {
        let result = non_max_suppression(vec![face(0.0, 0.0, 10.0, 10.0, 0.9), face(50.0, 50.0, 10.0, 10.0, 0.8)], 0.4);
        assert_eq!(result.len(), 2);
        assert!(non_max_suppression(vec![], 0.4).is_empty());
    }

    #[test]
    fn test_nms_equal_scores_keep_input_order() {
        let result = non_max_suppression(vec![face(0.0, 0.0, 10.0, 10.0, 0.8), face(40.0, 0.0, 10.0, 10.0, 0.8)], 0.4);
        assert_eq!(result[0].x, 0.0);
        assert_eq!(result[1].x, 40.0);
    }

    #[test]
    fn test_letterbox_maps_back_to_frame() {
        let lb = Letterbox::fit(320, 240, SCRFD_INPUT_SIZE);
        assert_eq!(lb.scaled_w, 640);
        assert_eq!(lb.scaled_h, 480);
        assert!((lb.pad_y - 80.0).abs() < 1e-6);

        let (x, y) = lb.to_frame((100.0 * lb.scale + lb.pad_x, 50.0 * lb.scale + lb.pad_y));
        assert!((x - 100.0).abs() < 0.1 && (y - 50.0).abs() < 0.1);
    }

    #[test]
    fn test_letterbox_tensor_padding_is_zero() {
        let (w, h) = (64usize, 32usize);
        let rgb = vec![200u8; w * h * 3];
        let lb = Letterbox::fit(w, h, SCRFD_INPUT_SIZE);
        let tensor = letterbox_tensor(&rgb, w, h, &lb);

        assert_eq!(tensor.shape(), &[1, 3, SCRFD_INPUT_SIZE, SCRFD_INPUT_SIZE]);
        // Top rows are padding.
        assert_eq!(tensor[[0, 0, 0, 320]], 0.0);
        // Centre is image content, uniform after bilinear resize.
        let expected = (200.0 - SCRFD_MEAN) / SCRFD_STD;
        for c in 0..3 {
            assert!((tensor[[0, c, 320, 320]] - expected).abs() < 1e-5);
        }
    }

    #[test]
    fn test_locate_heads_named_and_shuffled() {
        let names: Vec<String> = ["bbox_8", "kps_8", "score_8", "bbox_16", "kps_16", "score_16", "bbox_32", "kps_32", "score_32"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(locate_heads(&names), [(2, 0, 1), (5, 3, 4), (8, 6, 7)]);
    }

    #[test]
    fn test_locate_heads_positional_fallback() {
        let names: Vec<String> = (0..9).map(|i: usize| (i + 400).to_string()).collect();
        assert_eq!(locate_heads(&names), [(0, 3, 6), (1, 4, 7), (2, 5, 8)]);
    }

    #[test]
    fn test_stride_decode_single_anchor() {
        // Stride 32 grid is 20x20 with two anchors per cell.
        let anchors = 20 * 20 * 2;
        let mut scores = vec![0.0f32; anchors];
        let mut boxes = vec![0.0f32; anchors * 4];
        let kps = vec![0.0f32; anchors * 10];

        // Cell (col 3, row 2), first anchor.
        let idx = (2 * 20 + 3) * 2;
        scores[idx] = 0.9;
        boxes[idx * 4..idx * 4 + 4].copy_from_slice(&[1.0, 1.0, 1.0, 1.0]);

        let head = StrideHead { stride: 32, scores: &scores, boxes: &boxes, landmarks: &kps };
        let lb = Letterbox { scale: 1.0, pad_x: 0.0, pad_y: 0.0, scaled_w: 640, scaled_h: 640 };
        let faces = head.decode(&lb, 0.5);

        assert_eq!(faces.len(), 1);
        let f = &faces[0];
        assert_eq!((f.x, f.y, f.width, f.height), (64.0, 32.0, 64.0, 64.0));
        assert_eq!(f.landmarks.unwrap()[0], (96.0, 64.0));
    }
}
