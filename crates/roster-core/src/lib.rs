//! roster-core — Face detection, alignment and recognition.
//!
//! Uses SCRFD for face detection and ArcFace for face recognition,
//! both running via ONNX Runtime for CPU inference. Pure post-processing
//! (anchor decoding, NMS, affine alignment, cosine matching) lives here
//! too so it can be exercised without a model on disk.

pub mod alignment;
pub mod detector;
pub mod recognizer;
pub mod types;

pub use detector::{DetectorError, FaceDetect, FaceDetector};
pub use recognizer::{FaceEmbed, FaceRecognizer, RecognizerError};
pub use types::{BestMatch, BoundingBox, CosineMatcher, Detection, Embedding, Landmarks, Matcher};
