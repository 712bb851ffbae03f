//! facewatch-core: face detection, embeddings, matching and event cooldown.
//!
//! Detects faces with SCRFD, embeds them with ArcFace (both via ONNX
//! Runtime), matches embeddings against an immutable gallery snapshot and
//! gates identification events through a per-identity cooldown.

pub mod alignment;
pub mod analysis;
pub mod cooldown;
pub mod detector;
pub mod gallery;
pub mod recognizer;
pub mod types;

pub use analysis::{best_detection, AnalysisError, Detection, FaceAnalyzer, OnnxFaceAnalyzer};
pub use cooldown::{CooldownGate, CooldownState};
pub use detector::{DetectorSettings, FaceDetector};
pub use gallery::{EuclideanMatcher, GallerySnapshot, MatchOutcome, Matcher};
pub use recognizer::FaceRecognizer;
pub use types::{BoundingBox, Embedding, IdentificationEvent, Identity, SourceKind};

/// Default Euclidean tolerance below which a gallery entry is accepted.
///
/// ArcFace embeddings are unit vectors, so distance `d` and cosine
/// similarity `s` are related by `d = sqrt(2 - 2s)`. 1.10 corresponds to a
/// cosine similarity of about 0.40.
pub const DEFAULT_MATCH_TOLERANCE: f32 = 1.10;

/// File name of the SCRFD detection model inside a model directory.
pub const DETECTOR_MODEL_FILE: &str = "det_10g.onnx";

/// File name of the ArcFace recognition model inside a model directory.
pub const RECOGNIZER_MODEL_FILE: &str = "w600k_r50.onnx";
