//! Emotion classifier via ONNX Runtime.
//!
//! Runs a 7-class expression network on 48x48 grayscale face crops and
//! returns the argmax label with its softmax probability.

use crate::imaging::{crop_gray, resize_gray_bilinear};
use crate::types::{Emotion, FaceRect};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

// --- Named constants ---
const INPUT_SIZE: usize = 48;
const NUM_CLASSES: usize = Emotion::ALL.len();
/// Crops are scaled from [0, 255] to [0, 1], the range FER-style models
/// are trained on.
const PIXEL_SCALE: f32 = 255.0;

#[derive(Error, Debug)]
pub enum ClassifierError {
    #[error("model file not found: {0} (export the emotion network to ONNX and place it in models/)")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("unknown tensor layout {0:?} (expected \"nhwc\" or \"nchw\")")]
    InvalidLayout(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Declared input layout of the ONNX export.
///
/// Keras-converted models declare `[1, 48, 48, 1]`, torch exports
/// `[1, 1, 48, 48]`. A single-channel 48x48 crop is the same 2304 floats
/// row-major either way; only the shape handed to the session differs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TensorLayout {
    #[default]
    Nhwc,
    Nchw,
}

impl std::str::FromStr for TensorLayout {
    type Err = ClassifierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "nhwc" => Ok(Self::Nhwc),
            "nchw" => Ok(Self::Nchw),
            other => Err(ClassifierError::InvalidLayout(other.to_string())),
        }
    }
}

/// ONNX-backed emotion classifier.
#[derive(Debug)]
pub struct EmotionClassifier {
    session: Session,
    layout: TensorLayout,
}

impl EmotionClassifier {
    /// Load the emotion ONNX model from the given path.
    pub fn load(model_path: &Path, layout: TensorLayout) -> Result<Self, ClassifierError> {
        if !model_path.exists() {
            return Err(ClassifierError::ModelNotFound(
                model_path.display().to_string(),
            ));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            ?layout,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded emotion model"
        );

        Ok(Self { session, layout })
    }

    /// Classify one preprocessed crop (2304 floats in [0, 1], row-major).
    pub fn classify(&mut self, face: &[f32]) -> Result<(Emotion, f32), ClassifierError> {
        let pixels = face.to_vec();
        let input = match self.layout {
            TensorLayout::Nhwc => Array4::from_shape_vec((1, INPUT_SIZE, INPUT_SIZE, 1), pixels),
            TensorLayout::Nchw => Array4::from_shape_vec((1, 1, INPUT_SIZE, INPUT_SIZE), pixels),
        }
        .map_err(|e| ClassifierError::InferenceFailed(format!("input tensor: {e}")))?;

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, scores) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| ClassifierError::InferenceFailed(format!("class scores: {e}")))?;

        if scores.len() != NUM_CLASSES {
            return Err(ClassifierError::InferenceFailed(format!(
                "expected {NUM_CLASSES} class scores, got {}",
                scores.len()
            )));
        }

        let probs = softmax(scores);
        let mut best = 0usize;
        for i in 1..NUM_CLASSES {
            if probs[i] > probs[best] {
                best = i;
            }
        }
        Ok((Emotion::ALL[best], probs[best]))
    }
}

/// Prepare a 48x48 classifier input from one detected face.
///
/// Clamps the rect to the frame, crops the grayscale region, resizes it
/// with bilinear interpolation, and scales pixels to [0, 1]. Returns
/// `None` when the clamped rect is empty, which means the caller handed
/// in a rect entirely outside the frame.
pub fn preprocess(gray: &[u8], width: u32, height: u32, rect: &FaceRect) -> Option<Vec<f32>> {
    let clamped = rect.clamped_to(width, height)?;
    let crop = crop_gray(gray, width, &clamped);
    let resized = resize_gray_bilinear(
        &crop,
        clamped.width,
        clamped.height,
        INPUT_SIZE as u32,
        INPUT_SIZE as u32,
    );
    Some(resized.iter().map(|&p| p as f32 / PIXEL_SCALE).collect())
}

/// Numerically-stable softmax over the raw class scores.
fn softmax(scores: &[f32]) -> [f32; NUM_CLASSES] {
    let mut out = [0f32; NUM_CLASSES];
    let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut denom = 0f32;
    for (i, &s) in scores.iter().take(NUM_CLASSES).enumerate() {
        let e = (s - max).exp();
        out[i] = e;
        denom += e;
    }
    if denom > 0.0 {
        for v in &mut out {
            *v /= denom;
        }
    }
    out
}
