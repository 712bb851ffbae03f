//! Detection stage: face regions plus one embedding per region.

use crate::detector::{DetectorError, DetectorSettings, FaceDetector};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::types::{BoundingBox, Embedding};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),
}

/// One detected face and its embedding.
#[derive(Debug, Clone)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub embedding: Embedding,
}

/// Per-frame face analysis.
///
/// Implementations keep no state between calls: the result is a function of
/// the frame alone. Zero faces is an empty vector, not an error. The order of
/// the returned detections is stable for a given frame.
pub trait FaceAnalyzer: Send {
    fn analyze(&mut self, rgb: &[u8], width: u32, height: u32) -> Result<Vec<Detection>, AnalysisError>;
}

/// SCRFD detection followed by ArcFace embedding of every face.
pub struct OnnxFaceAnalyzer {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl OnnxFaceAnalyzer {
    pub fn load(detector_path: &str, recognizer_path: &str, settings: DetectorSettings) -> Result<Self, AnalysisError> {
        let detector = FaceDetector::load(detector_path, settings)?;
        let recognizer = FaceRecognizer::load(recognizer_path)?;
        Ok(Self { detector, recognizer })
    }

    pub fn from_parts(detector: FaceDetector, recognizer: FaceRecognizer) -> Self {
        Self { detector, recognizer }
    }
}

impl FaceAnalyzer for OnnxFaceAnalyzer {
    fn analyze(&mut self, rgb: &[u8], width: u32, height: u32) -> Result<Vec<Detection>, AnalysisError> {
        let faces = self.detector.detect(rgb, width, height)?;
        let mut detections = Vec::with_capacity(faces.len());
        for bbox in faces {
            let embedding = self.recognizer.extract(rgb, width, height, &bbox)?;
            detections.push(Detection { bbox, embedding });
        }
        Ok(detections)
    }
}

/// Pick the face to enroll from an analysed reference image: the one with
/// the highest detector confidence (first on ties).
pub fn best_detection(detections: Vec<Detection>) -> Option<Detection> {
    detections.into_iter().reduce(|best, d| {
        if d.bbox.confidence > best.bbox.confidence {
            d
        } else {
            best
        }
    })
}
