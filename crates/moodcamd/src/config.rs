use image::Rgb;
use moodcam_core::annotate::parse_hex_color;
use moodcam_core::classifier::TensorLayout;
use moodcam_core::detector::DetectParams;
use std::path::PathBuf;

/// The original service's green.
const DEFAULT_BOX_COLOR: Rgb<u8> = Rgb([0, 255, 0]);

/// Daemon configuration, loaded from environment variables.
pub struct Config {
    /// Listen address (default: 127.0.0.1:5000).
    pub bind: String,
    /// Directory containing the cascade XML, ONNX model, and optional font.
    pub model_dir: PathBuf,
    /// Cascade file name within the model dir.
    pub cascade_file: String,
    /// Emotion model file name within the model dir.
    pub model_file: String,
    /// Optional TTF file name within the model dir, for box labels.
    pub font_file: Option<String>,
    /// Declared input layout of the ONNX export.
    pub model_layout: TensorLayout,
    /// Pyramid step between detector scan scales.
    pub scale_factor: f32,
    /// Minimum raw-hit cluster size for a detection.
    pub min_neighbors: u32,
    /// Smallest face size in pixels.
    pub min_face_size: u32,
    /// JPEG quality for re-encoded result frames (1-100).
    pub jpeg_quality: u8,
    /// Box and label color.
    pub box_color: Rgb<u8>,
    /// Optional message catalog override file.
    pub messages_file: Option<PathBuf>,
    /// Idle time after which a session is pruned.
    pub session_ttl_secs: u64,
    /// Request body cap for uploads and snapshots.
    pub max_upload_bytes: usize,
    /// Timeout for fetching a remote image URL.
    pub fetch_timeout_secs: u64,
    /// Response size cap for fetched remote images.
    pub max_fetch_bytes: usize,
}

impl Config {
    /// Load configuration from `MOODCAM_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let model_dir = std::env::var("MOODCAM_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./models"));

        let model_layout = match std::env::var("MOODCAM_MODEL_LAYOUT") {
            Ok(value) => value.parse().unwrap_or_else(|e| {
                tracing::warn!(error = %e, "bad MOODCAM_MODEL_LAYOUT, using nhwc");
                TensorLayout::default()
            }),
            Err(_) => TensorLayout::default(),
        };

        let box_color = std::env::var("MOODCAM_BOX_COLOR")
            .ok()
            .and_then(|value| {
                let parsed = parse_hex_color(&value);
                if parsed.is_none() {
                    tracing::warn!(%value, "bad MOODCAM_BOX_COLOR, using #00FF00");
                }
                parsed
            })
            .unwrap_or(DEFAULT_BOX_COLOR);

        let scale_factor = env_f32("MOODCAM_SCALE_FACTOR", 1.3);
        let scale_factor = if scale_factor > 1.0 {
            scale_factor
        } else {
            tracing::warn!(scale_factor, "MOODCAM_SCALE_FACTOR must be > 1.0, using 1.3");
            1.3
        };

        Self {
            bind: std::env::var("MOODCAM_BIND")
                .unwrap_or_else(|_| "127.0.0.1:5000".to_string()),
            model_dir,
            cascade_file: std::env::var("MOODCAM_CASCADE")
                .unwrap_or_else(|_| "haarcascade_frontalface_default.xml".to_string()),
            model_file: std::env::var("MOODCAM_MODEL")
                .unwrap_or_else(|_| "emotion.onnx".to_string()),
            font_file: std::env::var("MOODCAM_FONT").ok(),
            model_layout,
            scale_factor,
            min_neighbors: env_u32("MOODCAM_MIN_NEIGHBORS", 5),
            min_face_size: env_u32("MOODCAM_MIN_FACE_SIZE", 40),
            jpeg_quality: env_u8("MOODCAM_JPEG_QUALITY", 90),
            box_color,
            messages_file: std::env::var("MOODCAM_MESSAGES").ok().map(PathBuf::from),
            session_ttl_secs: env_u64("MOODCAM_SESSION_TTL_SECS", 3600),
            max_upload_bytes: env_usize("MOODCAM_MAX_UPLOAD_BYTES", 10 * 1024 * 1024),
            fetch_timeout_secs: env_u64("MOODCAM_FETCH_TIMEOUT_SECS", 10),
            max_fetch_bytes: env_usize("MOODCAM_MAX_FETCH_BYTES", 10 * 1024 * 1024),
        }
    }

    /// Path to the face cascade XML.
    pub fn cascade_path(&self) -> PathBuf {
        self.model_dir.join(&self.cascade_file)
    }

    /// Path to the emotion ONNX model.
    pub fn model_path(&self) -> PathBuf {
        self.model_dir.join(&self.model_file)
    }

    /// Path to the label font, when configured.
    pub fn font_path(&self) -> Option<PathBuf> {
        self.font_file.as_ref().map(|name| self.model_dir.join(name))
    }

    pub fn detect_params(&self) -> DetectParams {
        DetectParams {
            scale_factor: self.scale_factor,
            min_neighbors: self.min_neighbors,
            min_size: self.min_face_size,
        }
    }
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u8(key: &str, default: u8) -> u8 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
