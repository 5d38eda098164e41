//! SCRFD face detector via ONNX Runtime.
//!
//! Implements the SCRFD (Sample and Computation Redistribution for Efficient Face
//! Detection) model with 3-stride anchor decoding and NMS post-processing.
//! Anchors per cell are inferred from the score tensor size, never assumed.

use crate::types::{BoundingBox, Detection, Landmarks};
use image::imageops::FilterType;
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

// --- Named constants (no magic numbers) ---
pub const SCRFD_INPUT_SIZE: usize = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
pub const SCRFD_CONFIDENCE_THRESHOLD: f32 = 0.5;
pub const SCRFD_NMS_THRESHOLD: f32 = 0.4;
pub const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0} — download buffalo_l from insightface and place det_10g.onnx in the model dir")]
    ModelNotFound(String),
    #[error("detection model unavailable")]
    ModelUnavailable,
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Anything that turns a decoded frame into suppressed face detections.
pub trait FaceDetect {
    /// Detect faces, returning NMS-suppressed detections sorted by descending score.
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<Detection>, DetectorError>;
}

/// A detector that failed to load reports itself as unavailable.
impl<T: FaceDetect> FaceDetect for Option<T> {
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<Detection>, DetectorError> {
        match self {
            Some(detector) => detector.detect(image),
            None => Err(DetectorError::ModelUnavailable),
        }
    }
}

/// Uniform scale applied when letterboxing into the square input.
/// The image sits at the top-left corner, so no offset is needed to map back.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
}

/// Output tensor indices for one stride: (score_idx, bbox_idx, kps_idx).
type StrideOutputIndices = (usize, usize, usize);

/// One output tensor copied out of the session, keyed by name and shape.
#[derive(Debug, Clone, Default)]
struct RawOutput {
    name: String,
    shape: Vec<i64>,
    data: Vec<f32>,
}

/// Flattened detector outputs for a single stride.
#[derive(Debug, Clone, Copy)]
pub struct StrideTensors<'a> {
    pub stride: usize,
    /// One confidence per anchor.
    pub scores: &'a [f32],
    /// Four distances (left, top, right, bottom) per anchor, in stride units.
    pub bboxes: &'a [f32],
    /// Ten landmark offsets (x, y per point) per anchor, in stride units.
    pub kps: &'a [f32],
}

/// SCRFD-based face detector.
pub struct FaceDetector {
    session: Session,
    input_size: usize,
    /// Per-stride output indices for strides [8, 16, 32], resolved on the first run.
    layout: Option<[StrideOutputIndices; 3]>,
}

impl FaceDetector {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: &Path) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session
            .outputs()
            .iter()
            .map(|o| o.name().to_string())
            .collect();
        let num_outputs = output_names.len();

        tracing::info!(
            path = %model_path.display(),
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?output_names,
            "loaded SCRFD model"
        );

        if num_outputs < 9 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model requires 9 outputs (3 strides × score/bbox/kps), got {num_outputs}"
            )));
        }

        Ok(Self {
            session,
            input_size: SCRFD_INPUT_SIZE,
            layout: discover_output_indices(&output_names),
        })
    }

    fn run(&mut self, input: &Array4<f32>) -> Result<Vec<RawOutput>, DetectorError> {
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let raw = outputs
            .iter()
            .map(|(name, value)| match value.try_extract_tensor::<f32>() {
                Ok((shape, data)) => RawOutput {
                    name: name.to_string(),
                    shape: shape.iter().copied().collect(),
                    data: data.to_vec(),
                },
                Err(e) => {
                    tracing::warn!(output = name, error = %e, "SCRFD output is not an f32 tensor");
                    RawOutput {
                        name: name.to_string(),
                        ..RawOutput::default()
                    }
                }
            })
            .collect();

        Ok(raw)
    }
}

impl FaceDetect for FaceDetector {
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<Detection>, DetectorError> {
        if image.width() == 0 || image.height() == 0 {
            return Ok(Vec::new());
        }

        let (input, letterbox) = preprocess(image, self.input_size);
        let raw = self.run(&input)?;

        let layout = match self.layout {
            Some(layout) => layout,
            None => {
                let layout = resolve_layout(&raw);
                tracing::debug!(?layout, "SCRFD output tensor mapping");
                self.layout = Some(layout);
                layout
            }
        };

        let tensor = |idx: usize| raw.get(idx).map(|o| o.data.as_slice()).unwrap_or(&[]);
        let strides: Vec<StrideTensors<'_>> = SCRFD_STRIDES
            .iter()
            .zip(layout.iter())
            .map(|(&stride, &(score_idx, bbox_idx, kps_idx))| StrideTensors {
                stride,
                scores: tensor(score_idx),
                bboxes: tensor(bbox_idx),
                kps: tensor(kps_idx),
            })
            .collect();

        let candidates = decode_outputs(
            &strides,
            self.input_size,
            letterbox.scale,
            SCRFD_CONFIDENCE_THRESHOLD,
        );
        let result = nms(candidates, SCRFD_NMS_THRESHOLD);

        tracing::debug!(faces = result.len(), "SCRFD detection complete");
        Ok(result)
    }
}

/// Letterbox an RGB frame into a square NCHW float tensor.
///
/// The resized image is placed at the top-left; the remainder is black
/// (pixel value 0) before normalization.
fn preprocess(image: &RgbImage, input_size: usize) -> (Array4<f32>, Letterbox) {
    let (width, height) = image.dimensions();
    let scale = (input_size as f32 / width as f32).min(input_size as f32 / height as f32);

    let new_w = ((width as f32 * scale) as u32).clamp(1, input_size as u32);
    let new_h = ((height as f32 * scale) as u32).clamp(1, input_size as u32);
    let resized = image::imageops::resize(image, new_w, new_h, FilterType::Triangle);

    let pad_value = (0.0 - SCRFD_MEAN) / SCRFD_STD;
    let mut tensor = Array4::<f32>::from_elem((1, 3, input_size, input_size), pad_value);

    for (x, y, pixel) in resized.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (pixel[c] as f32 - SCRFD_MEAN) / SCRFD_STD;
        }
    }

    (tensor, Letterbox { scale })
}

/// Pick per-stride output indices: by name, then by shape, then by position.
fn resolve_layout(raw: &[RawOutput]) -> [StrideOutputIndices; 3] {
    let names: Vec<&str> = raw.iter().map(|o| o.name.as_str()).collect();
    if let Some(layout) = discover_output_indices(&names) {
        return layout;
    }

    let shapes: Vec<Vec<i64>> = raw.iter().map(|o| o.shape.clone()).collect();
    if let Some(layout) = discover_output_indices_by_shape(&shapes) {
        tracing::info!("SCRFD: using shape-based output tensor mapping");
        return layout;
    }

    // Positional fallback: [scores 8/16/32, bboxes 8/16/32, kps 8/16/32]
    tracing::info!(
        ?names,
        "SCRFD: output layout not recognized, using positional mapping [0-2]=scores, [3-5]=bboxes, [6-8]=kps"
    );
    [(0, 3, 6), (1, 4, 7), (2, 5, 8)]
}

/// Discover output tensor ordering by name.
///
/// SCRFD exports that keep their graph names expose "score_8", "bbox_16",
/// "kps_32" and so on. Returns `None` for generic numeric names.
fn discover_output_indices<S: AsRef<str>>(names: &[S]) -> Option<[StrideOutputIndices; 3]> {
    let find = |prefix: &str, stride: usize| -> Option<usize> {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| n.as_ref() == target)
    };

    let mut layout = [(0, 0, 0); 3];
    for (slot, &stride) in SCRFD_STRIDES.iter().enumerate() {
        layout[slot] = (find("score", stride)?, find("bbox", stride)?, find("kps", stride)?);
    }

    tracing::info!("SCRFD: using name-based output tensor mapping");
    Some(layout)
}

/// Discover output tensor ordering from tensor shapes.
///
/// The trailing dimension tells the kind (1 = score, 4 = bbox, 10 = kps) and
/// the anchor count orders strides: the finest stride has the most anchors.
fn discover_output_indices_by_shape(shapes: &[Vec<i64>]) -> Option<[StrideOutputIndices; 3]> {
    // (output index, anchor count) per kind: score, bbox, kps
    let mut groups: [Vec<(usize, i64)>; 3] = Default::default();

    for (idx, shape) in shapes.iter().enumerate() {
        let Some(&last) = shape.last() else {
            continue;
        };
        let kind = match last {
            1 => 0,
            4 => 1,
            10 => 2,
            _ => continue,
        };
        let anchors = shape.iter().product::<i64>() / last;
        groups[kind].push((idx, anchors));
    }

    if groups.iter().any(|g| g.len() != SCRFD_STRIDES.len()) {
        return None;
    }
    for group in groups.iter_mut() {
        group.sort_by(|a, b| b.1.cmp(&a.1));
    }
    for slot in 0..SCRFD_STRIDES.len() {
        let anchors = groups[0][slot].1;
        if groups[1][slot].1 != anchors || groups[2][slot].1 != anchors {
            return None;
        }
    }

    Some(std::array::from_fn(|slot| {
        (groups[0][slot].0, groups[1][slot].0, groups[2][slot].0)
    }))
}

/// Decode candidates for every stride, mapping coordinates back to the
/// original image by dividing by the letterbox `scale`.
///
/// Any absent or malformed stride discards the whole frame's candidates.
pub fn decode_outputs(
    strides: &[StrideTensors<'_>],
    input_size: usize,
    scale: f32,
    threshold: f32,
) -> Vec<Detection> {
    if scale <= 0.0 || !scale.is_finite() {
        return Vec::new();
    }

    let mut detections = Vec::new();
    for tensors in strides {
        match decode_stride(tensors, input_size, scale, threshold) {
            Some(dets) => detections.extend(dets),
            None => {
                tracing::warn!(
                    stride = tensors.stride,
                    scores = tensors.scores.len(),
                    bboxes = tensors.bboxes.len(),
                    kps = tensors.kps.len(),
                    "malformed SCRFD output, discarding detections"
                );
                return Vec::new();
            }
        }
    }
    detections
}

/// Decode detections for a single stride level.
///
/// Anchors are laid out row-major (y outer, x inner) with
/// `scores.len() / cells` anchors per cell.
fn decode_stride(
    tensors: &StrideTensors<'_>,
    input_size: usize,
    scale: f32,
    threshold: f32,
) -> Option<Vec<Detection>> {
    if tensors.stride == 0 {
        return None;
    }
    let grid = input_size / tensors.stride;
    let cells = grid * grid;
    let num_anchors = tensors.scores.len();
    if cells == 0 || num_anchors == 0 || num_anchors % cells != 0 {
        return None;
    }
    if tensors.bboxes.len() < num_anchors * 4 || tensors.kps.len() < num_anchors * 10 {
        return None;
    }

    let anchors_per_cell = num_anchors / cells;
    let stride = tensors.stride as f32;
    let mut detections = Vec::new();

    for (idx, &score) in tensors.scores.iter().enumerate() {
        if score.is_nan() || score < threshold {
            continue;
        }

        let cell = idx / anchors_per_cell;
        let anchor_cx = (cell % grid) as f32 * stride;
        let anchor_cy = (cell / grid) as f32 * stride;

        let b = &tensors.bboxes[idx * 4..idx * 4 + 4];
        let bbox = BoundingBox::from_corners(
            (anchor_cx - b[0] * stride) / scale,
            (anchor_cy - b[1] * stride) / scale,
            (anchor_cx + b[2] * stride) / scale,
            (anchor_cy + b[3] * stride) / scale,
        );

        let k = &tensors.kps[idx * 10..idx * 10 + 10];
        let landmarks: Landmarks = std::array::from_fn(|i| {
            (
                (anchor_cx + k[i * 2] * stride) / scale,
                (anchor_cy + k[i * 2 + 1] * stride) / scale,
            )
        });

        detections.push(Detection { bbox, landmarks, score });
    }

    Some(detections)
}

/// Non-Maximum Suppression: remove overlapping detections.
///
/// The stable sort keeps the input order among equal scores.
pub fn nms(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    detections.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep = Vec::new();
    let mut suppressed = vec![false; detections.len()];

    for i in 0..detections.len() {
        if suppressed[i] {
            continue;
        }
        keep.push(detections[i].clone());

        for j in (i + 1)..detections.len() {
            if suppressed[j] {
                continue;
            }
            if detections[i].bbox.iou(&detections[j].bbox) > iou_threshold {
                suppressed[j] = true;
            }
        }
    }

    keep
}
