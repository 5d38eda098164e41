use serde::{Deserialize, Serialize};

/// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
pub type Landmarks = [(f32, f32); 5];

/// Axis-aligned rectangle in original-image pixel space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn from_corners(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self {
            x: x1,
            y: y1,
            width: x2 - x1,
            height: y2 - y1,
        }
    }

    /// Area of the rectangle; inverted rectangles have zero area.
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Intersection-over-Union with another rectangle.
    ///
    /// Zero or negative intersection yields 0, as does an empty union.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.width).min(other.x + other.width);
        let y2 = (self.y + self.height).min(other.y + other.height);

        let inter_w = x2 - x1;
        let inter_h = y2 - y1;
        if inter_w <= 0.0 || inter_h <= 0.0 {
            return 0.0;
        }
        let inter_area = inter_w * inter_h;
        let union_area = self.area() + other.area() - inter_area;

        if union_area > 0.0 {
            inter_area / union_area
        } else {
            0.0
        }
    }
}

/// A face found in one frame. Only lives for the duration of that frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub landmarks: Landmarks,
    /// Detector confidence in [0, 1].
    pub score: f32,
}

/// Face embedding vector (512-dimensional for w600k_r50 ArcFace).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    /// The "no usable embedding" value.
    pub fn empty() -> Self {
        Self { values: Vec::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn norm(&self) -> f32 {
        self.values.iter().map(|v| v * v).sum::<f32>().sqrt()
    }

    /// L2-normalize into a unit vector. A zero vector stays the zero vector.
    pub fn normalized(raw: Vec<f32>) -> Self {
        let norm: f32 = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
        let values = if norm > 0.0 {
            raw.iter().map(|x| x / norm).collect()
        } else {
            raw
        };
        Self { values }
    }

    /// Pack as a headerless little-endian f32 array (4 bytes per dimension).
    pub fn to_bytes(&self) -> Vec<u8> {
        self.values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    /// Inverse of [`to_bytes`](Self::to_bytes). A blob whose length is not a
    /// multiple of 4 is not a valid embedding and decodes to empty.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        if bytes.len() % 4 != 0 {
            return Self::empty();
        }
        let values = bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Self { values }
    }

    /// Compute cosine similarity between two embeddings.
    ///
    /// Returns a value in [-1, 1]. Higher = more similar. Empty, zero-norm
    /// or length-mismatched inputs yield 0.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        if self.values.is_empty() || self.values.len() != other.values.len() {
            return 0.0;
        }

        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 { dot / denom } else { 0.0 }
    }
}

/// Highest-similarity gallery entry for a probe.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BestMatch {
    /// Position of the entry in gallery order.
    pub index: usize,
    /// Cosine similarity of the best match [-1, 1].
    pub similarity: f32,
}

/// Strategy for comparing a probe embedding against a gallery of enrolled faces.
///
/// Acceptance thresholds belong to the caller; a matcher only ranks.
pub trait Matcher {
    fn best_match<'a, I>(&self, probe: &Embedding, gallery: I) -> Option<BestMatch>
    where
        I: IntoIterator<Item = &'a Embedding>;
}

/// Cosine similarity matcher. Always visits every gallery entry; ties keep
/// the earliest entry.
pub struct CosineMatcher;

impl Matcher for CosineMatcher {
    fn best_match<'a, I>(&self, probe: &Embedding, gallery: I) -> Option<BestMatch>
    where
        I: IntoIterator<Item = &'a Embedding>,
    {
        let mut best: Option<BestMatch> = None;

        for (index, candidate) in gallery.into_iter().enumerate() {
            let similarity = probe.similarity(candidate);
            let is_better = match best {
                None => true,
                Some(prev) => similarity > prev.similarity,
            };
            if is_better {
                best = Some(BestMatch { index, similarity });
            }
        }

        best
    }
}
