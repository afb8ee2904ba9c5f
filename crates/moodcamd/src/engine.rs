//! Inference engine thread.
//!
//! A dedicated OS thread owns the detector, classifier, and annotator
//! (the ONNX session needs `&mut` to run), and handlers talk to it over
//! an mpsc channel with oneshot replies. One frame is analyzed at a
//! time; concurrent requests queue on the channel.

use crate::config::Config;
use moodcam_core::annotate::Annotator;
use moodcam_core::classifier::{self, ClassifierError, EmotionClassifier};
use moodcam_core::detector::FaceDetector;
use moodcam_core::imaging::{self, ImagingError};
use moodcam_core::types::Detection;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, Error)]
pub enum EngineError {
    // The imaging messages are already client-facing, pass them through.
    #[error("{0}")]
    Decode(ImagingError),
    #[error("{0}")]
    Encode(ImagingError),
    #[error("classifier error: {0}")]
    Classifier(#[from] ClassifierError),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Result of analyzing one frame.
#[derive(Debug)]
pub struct Analysis {
    /// Annotated frame, JPEG-encoded.
    pub jpeg: Vec<u8>,
    pub detections: Vec<Detection>,
}

/// Messages sent from handlers to the engine thread.
enum EngineRequest {
    Analyze {
        bytes: Vec<u8>,
        reply: oneshot::Sender<Result<Analysis, EngineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    /// Analyze one encoded image: detect faces, classify each, annotate.
    pub async fn analyze(&self, bytes: Vec<u8>) -> Result<Analysis, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Analyze {
                bytes,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }
}

/// The model state owned by the engine thread.
pub struct Pipeline {
    detector: Option<FaceDetector>,
    classifier: Option<EmotionClassifier>,
    annotator: Annotator,
    jpeg_quality: u8,
}

impl Pipeline {
    /// Pipeline with no detector and no classifier: every frame re-encodes
    /// with zero detections. Lets the HTTP layer run without model files.
    pub fn detection_disabled(jpeg_quality: u8) -> Self {
        Self {
            detector: None,
            classifier: None,
            annotator: Annotator::new(image::Rgb([0, 255, 0]), None),
            jpeg_quality,
        }
    }

    fn analyze(&mut self, bytes: &[u8]) -> Result<Analysis, EngineError> {
        let decoded = imaging::decode(bytes).map_err(EngineError::Decode)?;
        let mut rgb = decoded.to_rgb8();
        let gray = decoded.to_luma8();
        let (width, height) = gray.dimensions();

        let mut detections = Vec::new();
        if let (Some(detector), Some(classifier)) = (&self.detector, &mut self.classifier) {
            for rect in detector.detect(gray.as_raw(), width, height) {
                let Some(input) = classifier::preprocess(gray.as_raw(), width, height, &rect)
                else {
                    continue;
                };
                let (emotion, confidence) = classifier.classify(&input)?;
                detections.push(Detection {
                    rect,
                    emotion,
                    confidence,
                });
            }
        }

        tracing::debug!(width, height, faces = detections.len(), "frame analyzed");

        self.annotator.annotate(&mut rgb, &detections);
        let jpeg = imaging::encode_jpeg(&rgb, self.jpeg_quality).map_err(EngineError::Encode)?;
        Ok(Analysis { jpeg, detections })
    }
}

/// Load models per the startup policy: a missing or unparseable cascade
/// logs a warning and disables detection (the service stays up and every
/// frame yields zero faces); a missing classifier model is fatal.
pub fn build_pipeline(config: &Config) -> Result<Pipeline, EngineError> {
    let cascade_path = config.cascade_path();
    let detector = match FaceDetector::load(&cascade_path, config.detect_params()) {
        Ok(detector) => Some(detector),
        Err(e) => {
            tracing::warn!(
                path = %cascade_path.display(),
                error = %e,
                "face cascade unavailable, detection disabled"
            );
            None
        }
    };

    let classifier = EmotionClassifier::load(&config.model_path(), config.model_layout)?;

    let annotator = Annotator::new(config.box_color, config.font_path().as_deref());

    Ok(Pipeline {
        detector,
        classifier: Some(classifier),
        annotator,
        jpeg_quality: config.jpeg_quality,
    })
}

/// Spawn the engine on a dedicated OS thread and return its handle.
pub fn spawn(mut pipeline: Pipeline) -> EngineHandle {
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("moodcam-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Analyze { bytes, reply } => {
                        let _ = reply.send(pipeline.analyze(&bytes));
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .expect("failed to spawn engine thread");

    EngineHandle { tx }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = image::RgbImage::from_pixel(width, height, image::Rgb([80, 120, 200]));
        let mut out = std::io::Cursor::new(Vec::new());
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut out, image::ImageFormat::Png)
            .unwrap();
        out.into_inner()
    }

    #[test]
    fn test_disabled_pipeline_reencodes_with_zero_detections() {
        let mut pipeline = Pipeline::detection_disabled(90);
        let analysis = pipeline.analyze(&png_bytes(20, 16)).unwrap();
        assert!(analysis.detections.is_empty());

        let round_trip = image::load_from_memory(&analysis.jpeg).unwrap();
        assert_eq!(round_trip.width(), 20);
        assert_eq!(round_trip.height(), 16);
    }

    #[test]
    fn test_pipeline_rejects_undecodable_bytes() {
        let mut pipeline = Pipeline::detection_disabled(90);
        let err = pipeline.analyze(b"definitely not an image").unwrap_err();
        assert!(matches!(err, EngineError::Decode(_)));
    }

    #[tokio::test]
    async fn test_engine_handle_round_trip() {
        let handle = spawn(Pipeline::detection_disabled(80));
        let analysis = handle.analyze(png_bytes(12, 12)).await.unwrap();
        assert!(analysis.detections.is_empty());
        assert!(!analysis.jpeg.is_empty());
    }

    #[tokio::test]
    async fn test_engine_serializes_concurrent_requests() {
        let handle = spawn(Pipeline::detection_disabled(80));
        let a = handle.analyze(png_bytes(10, 10));
        let b = handle.analyze(png_bytes(11, 11));
        let (ra, rb) = tokio::join!(a, b);
        assert!(ra.is_ok());
        assert!(rb.is_ok());
    }
}
