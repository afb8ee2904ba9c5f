//! moodcam-core: face detection and emotion classification engine.
//!
//! Detects faces with a pretrained OpenCV Haar cascade (the runtime is
//! implemented here; the trained stage data is loaded from the stock XML)
//! and classifies each face crop with a pretrained seven-class emotion
//! network running via ONNX Runtime for CPU inference.

pub mod annotate;
pub mod cascade;
pub mod classifier;
pub mod detector;
pub mod imaging;
pub mod messages;
pub mod types;

pub use annotate::Annotator;
pub use cascade::CascadeModel;
pub use classifier::{EmotionClassifier, TensorLayout};
pub use detector::{DetectParams, FaceDetector};
pub use messages::MessageCatalog;
pub use types::{Detection, Emotion, EmotionCounts, FaceRect};
