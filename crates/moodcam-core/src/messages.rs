//! Motivational message catalog.
//!
//! Maps each detected emotion (and the no-face case) to a short message
//! shown alongside the annotated frame. The default catalog is embedded
//! at compile time from `assets/messages.toml`; deployments can override
//! any subset of keys with their own TOML file.

use crate::types::{Detection, Emotion};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

/// Compile-time embedded default catalog.
const DEFAULT_CATALOG: &str = include_str!("../assets/messages.toml");

/// Top-level catalog file structure.
#[derive(Debug, Clone, Deserialize)]
struct CatalogFile {
    messages: BTreeMap<String, String>,
}

/// Per-emotion message table.
#[derive(Debug, Clone)]
pub struct MessageCatalog {
    by_emotion: [String; Emotion::ALL.len()],
    no_face: String,
}

impl MessageCatalog {
    /// The catalog parsed from the embedded defaults.
    pub fn embedded() -> Self {
        let mut catalog = Self::bare();
        match toml::from_str::<CatalogFile>(DEFAULT_CATALOG) {
            Ok(file) => catalog.apply(file, "embedded"),
            Err(e) => tracing::error!(error = %e, "embedded message catalog failed to parse"),
        }
        catalog
    }

    /// The embedded catalog with overrides applied from a TOML file.
    ///
    /// A missing or malformed file logs a warning and leaves the defaults
    /// in place; keys absent from the file keep their embedded value.
    pub fn with_overrides(path: &Path) -> Self {
        let mut catalog = Self::embedded();
        match std::fs::read_to_string(path) {
            Ok(text) => match toml::from_str::<CatalogFile>(&text) {
                Ok(file) => catalog.apply(file, &path.display().to_string()),
                Err(e) => tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "message override file did not parse, keeping defaults"
                ),
            },
            Err(e) => tracing::warn!(
                path = %path.display(),
                error = %e,
                "message override file not readable, keeping defaults"
            ),
        }
        catalog
    }

    /// Placeholder messages derived from the labels themselves, used only
    /// when the embedded TOML cannot be parsed.
    fn bare() -> Self {
        Self {
            by_emotion: Emotion::ALL.map(|e| format!("You look {}.", e.label())),
            no_face: "No face detected.".to_string(),
        }
    }

    fn apply(&mut self, file: CatalogFile, source: &str) {
        for (key, text) in file.messages {
            if key == "no_face" {
                self.no_face = text;
                continue;
            }
            match Emotion::ALL.iter().find(|e| e.label() == key) {
                Some(emotion) => self.by_emotion[emotion.index()] = text,
                None => tracing::warn!(%key, source, "unknown message key ignored"),
            }
        }
    }

    pub fn for_emotion(&self, emotion: Emotion) -> &str {
        &self.by_emotion[emotion.index()]
    }

    pub fn no_face(&self) -> &str {
        &self.no_face
    }

    /// The message for a frame: the highest-confidence detection's emotion,
    /// or the no-face message for an empty frame.
    pub fn for_detections(&self, detections: &[Detection]) -> &str {
        detections
            .iter()
            .max_by(|a, b| {
                a.confidence
                    .partial_cmp(&b.confidence)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|d| self.for_emotion(d.emotion))
            .unwrap_or_else(|| self.no_face())
    }
}

impl Default for MessageCatalog {
    fn default() -> Self {
        Self::embedded()
    }
}
