//! ArcFace face recognizer via ONNX Runtime.
//!
//! Extracts 512-dimensional face embeddings from aligned face crops,
//! using the w600k_r50 ArcFace model.

use crate::alignment::{self, AlignmentError, ALIGNED_SIZE};
use crate::types::{Detection, Embedding};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

// --- Named constants ---
const ARCFACE_INPUT_SIZE: usize = ALIGNED_SIZE as usize;
const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 128.0;
pub const ARCFACE_EMBEDDING_DIM: usize = 512;

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0} — download buffalo_l from insightface and place w600k_r50.onnx in the model dir")]
    ModelNotFound(String),
    #[error("recognition model unavailable")]
    ModelUnavailable,
    #[error("face alignment failed: {0}")]
    Alignment(#[from] AlignmentError),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("recognizer produced no usable embedding")]
    EmptyEmbedding,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Anything that turns a detected face into a unit-norm embedding.
pub trait FaceEmbed {
    fn embed(&mut self, image: &RgbImage, face: &Detection) -> Result<Embedding, RecognizerError>;
}

/// A recognizer that failed to load reports itself as unavailable.
impl<T: FaceEmbed> FaceEmbed for Option<T> {
    fn embed(&mut self, image: &RgbImage, face: &Detection) -> Result<Embedding, RecognizerError> {
        match self {
            Some(recognizer) => recognizer.embed(image, face),
            None => Err(RecognizerError::ModelUnavailable),
        }
    }
}

/// ArcFace-based face recognizer.
pub struct FaceRecognizer {
    session: Session,
}

impl FaceRecognizer {
    /// Load the ArcFace ONNX model from the given path.
    pub fn load(model_path: &Path) -> Result<Self, RecognizerError> {
        if !model_path.exists() {
            return Err(RecognizerError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded ArcFace model"
        );

        Ok(Self { session })
    }

    /// Preprocess a 112x112 RGB aligned face crop into a NCHW float tensor.
    fn preprocess(aligned_face: &RgbImage) -> Array4<f32> {
        let size = ARCFACE_INPUT_SIZE;
        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));

        for (x, y, pixel) in aligned_face.enumerate_pixels() {
            let (x, y) = (x as usize, y as usize);
            if x >= size || y >= size {
                continue;
            }
            for c in 0..3 {
                tensor[[0, c, y, x]] = (pixel[c] as f32 - ARCFACE_MEAN) / ARCFACE_STD;
            }
        }

        tensor
    }
}

impl FaceEmbed for FaceRecognizer {
    /// Align the face to the canonical 112x112 pose, run ArcFace and
    /// L2-normalize the output.
    fn embed(&mut self, image: &RgbImage, face: &Detection) -> Result<Embedding, RecognizerError> {
        let aligned = alignment::align_face(image, &face.landmarks)?;
        let input = Self::preprocess(&aligned);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw_data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("embedding extraction: {e}")))?;

        let embedding = embedding_from_output(raw_data)?;
        if embedding.len() != ARCFACE_EMBEDDING_DIM {
            tracing::debug!(dim = embedding.len(), "unexpected ArcFace embedding dimension");
        }
        Ok(embedding)
    }
}

/// Turn the raw model output into a unit-norm embedding.
///
/// An empty or non-finite output is not a usable embedding. An all-zero
/// output stays the zero vector.
pub fn embedding_from_output(raw: &[f32]) -> Result<Embedding, RecognizerError> {
    if raw.is_empty() || raw.iter().any(|v| !v.is_finite()) {
        return Err(RecognizerError::EmptyEmbedding);
    }
    Ok(Embedding::normalized(raw.to_vec()))
}
