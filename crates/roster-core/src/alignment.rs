//! Face alignment via a 3-point affine transform.
//!
//! Maps the detected left eye, right eye and nose onto the ArcFace 112×112
//! reference template and warps the face into a canonical crop. Mouth
//! corners are ignored: the closed-form three-point solve is more stable
//! frame-to-frame than a five-point fit on noisy landmarks.

use crate::types::Landmarks;
use image::{Rgb, RgbImage};
use thiserror::Error;

/// ArcFace reference landmarks for a 112×112 output.
pub const REFERENCE_LANDMARKS_112: Landmarks = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose
    (41.5493, 92.3655), // left mouth
    (70.7299, 92.2041), // right mouth
];

pub const ALIGNED_SIZE: u32 = 112;

const DEGENERATE_EPSILON: f64 = 1e-9;

#[derive(Error, Debug, PartialEq)]
pub enum AlignmentError {
    #[error("landmarks are collinear or coincident; affine transform is degenerate")]
    DegenerateLandmarks,
    #[error("landmarks are not finite")]
    NonFiniteLandmarks,
    #[error("source image is empty")]
    EmptyImage,
}

/// Row-major 2×3 affine matrix:
/// ```text
/// | m0  m1  m2 |
/// | m3  m4  m5 |
/// ```
pub type AffineMatrix = [f32; 6];

/// Solve the affine transform mapping three `src` points exactly onto three `dst` points.
///
/// Each output row is the solution of a 3×3 system
/// `[sx sy 1] · [a b c]ᵀ = d`, solved with Cramer's rule.
pub fn estimate_affine(
    src: &[(f32, f32); 3],
    dst: &[(f32, f32); 3],
) -> Result<AffineMatrix, AlignmentError> {
    let finite = |p: &(f32, f32)| p.0.is_finite() && p.1.is_finite();
    if !src.iter().all(finite) || !dst.iter().all(finite) {
        return Err(AlignmentError::NonFiniteLandmarks);
    }

    let s: [(f64, f64); 3] = std::array::from_fn(|i| (src[i].0 as f64, src[i].1 as f64));
    let d: [(f64, f64); 3] = std::array::from_fn(|i| (dst[i].0 as f64, dst[i].1 as f64));

    // det of [[x0 y0 1], [x1 y1 1], [x2 y2 1]]
    let det = s[0].0 * (s[1].1 - s[2].1) - s[0].1 * (s[1].0 - s[2].0)
        + (s[1].0 * s[2].1 - s[2].0 * s[1].1);
    if det.abs() < DEGENERATE_EPSILON {
        return Err(AlignmentError::DegenerateLandmarks);
    }

    let solve_row = |r: [f64; 3]| -> [f64; 3] {
        let det_a = r[0] * (s[1].1 - s[2].1) - s[0].1 * (r[1] - r[2])
            + (r[1] * s[2].1 - r[2] * s[1].1);
        let det_b = s[0].0 * (r[1] - r[2]) - r[0] * (s[1].0 - s[2].0)
            + (s[1].0 * r[2] - s[2].0 * r[1]);
        let det_c = s[0].0 * (s[1].1 * r[2] - s[2].1 * r[1])
            - s[0].1 * (s[1].0 * r[2] - s[2].0 * r[1])
            + r[0] * (s[1].0 * s[2].1 - s[2].0 * s[1].1);
        [det_a / det, det_b / det, det_c / det]
    };

    let x = solve_row([d[0].0, d[1].0, d[2].0]);
    let y = solve_row([d[0].1, d[1].1, d[2].1]);

    Ok([
        x[0] as f32, x[1] as f32, x[2] as f32,
        y[0] as f32, y[1] as f32, y[2] as f32,
    ])
}

/// Invert a 2×3 affine matrix.
pub fn invert_affine(m: &AffineMatrix) -> Result<AffineMatrix, AlignmentError> {
    let det = m[0] as f64 * m[4] as f64 - m[1] as f64 * m[3] as f64;
    if det.abs() < DEGENERATE_EPSILON {
        return Err(AlignmentError::DegenerateLandmarks);
    }
    let inv = 1.0 / det;
    let a = m[4] as f64 * inv;
    let b = -(m[1] as f64) * inv;
    let c = -(m[3] as f64) * inv;
    let d = m[0] as f64 * inv;
    let tx = -(a * m[2] as f64 + b * m[5] as f64);
    let ty = -(c * m[2] as f64 + d * m[5] as f64);
    Ok([a as f32, b as f32, tx as f32, c as f32, d as f32, ty as f32])
}

/// Apply a 2×3 affine warp to produce an `out_size`×`out_size` image.
///
/// `matrix` maps source to destination; each output pixel is sampled
/// through its inverse with bilinear interpolation. Out-of-bounds pixels
/// are filled with 0 (black).
pub fn warp_affine(
    image: &RgbImage,
    matrix: &AffineMatrix,
    out_size: u32,
) -> Result<RgbImage, AlignmentError> {
    let inv = invert_affine(matrix)?;
    let (src_w, src_h) = (image.width() as i64, image.height() as i64);

    let sample = |x: i64, y: i64| -> [f32; 3] {
        if x >= 0 && x < src_w && y >= 0 && y < src_h {
            let p = image.get_pixel(x as u32, y as u32);
            [p[0] as f32, p[1] as f32, p[2] as f32]
        } else {
            [0.0; 3]
        }
    };

    let mut output = RgbImage::new(out_size, out_size);

    for (ox, oy, pixel) in output.enumerate_pixels_mut() {
        let (dx, dy) = (ox as f32, oy as f32);
        let sx = inv[0] * dx + inv[1] * dy + inv[2];
        let sy = inv[3] * dx + inv[4] * dy + inv[5];

        let x0 = sx.floor() as i64;
        let y0 = sy.floor() as i64;
        let fx = sx - x0 as f32;
        let fy = sy - y0 as f32;

        let tl = sample(x0, y0);
        let tr = sample(x0 + 1, y0);
        let bl = sample(x0, y0 + 1);
        let br = sample(x0 + 1, y0 + 1);

        let mut rgb = [0u8; 3];
        for c in 0..3 {
            let val = tl[c] * (1.0 - fx) * (1.0 - fy)
                + tr[c] * fx * (1.0 - fy)
                + bl[c] * (1.0 - fx) * fy
                + br[c] * fx * fy;
            rgb[c] = val.round().clamp(0.0, 255.0) as u8;
        }
        *pixel = Rgb(rgb);
    }

    Ok(output)
}

/// Align a detected face to a canonical 112×112 crop.
///
/// Uses the left eye, right eye and nose landmarks against the ArcFace template.
pub fn align_face(image: &RgbImage, landmarks: &Landmarks) -> Result<RgbImage, AlignmentError> {
    if image.width() == 0 || image.height() == 0 {
        return Err(AlignmentError::EmptyImage);
    }
    let src = [landmarks[0], landmarks[1], landmarks[2]];
    let dst = [
        REFERENCE_LANDMARKS_112[0],
        REFERENCE_LANDMARKS_112[1],
        REFERENCE_LANDMARKS_112[2],
    ];
    let matrix = estimate_affine(&src, &dst)?;
    warp_affine(image, &matrix, ALIGNED_SIZE)
}
