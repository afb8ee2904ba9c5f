use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use image::Rgb;
use moodcam_core::classifier::{self, TensorLayout};
use moodcam_core::detector::DetectParams;
use moodcam_core::imaging;
use moodcam_core::types::{Detection, Emotion};
use moodcam_core::{Annotator, CascadeModel, EmotionClassifier, FaceDetector};

#[derive(Parser)]
#[command(name = "moodcam", about = "Moodcam emotion analysis CLI")]
struct Cli {
    /// Directory containing the cascade XML and ONNX model
    #[arg(long, default_value = "./models")]
    models: PathBuf,

    /// Cascade file name within the model dir
    #[arg(long, default_value = "haarcascade_frontalface_default.xml")]
    cascade: String,

    /// Model file name within the model dir
    #[arg(long, default_value = "emotion.onnx")]
    model: String,

    /// Input layout of the ONNX export ("nhwc" or "nchw")
    #[arg(long, default_value = "nhwc")]
    layout: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Detect faces in an image file and classify each one
    Analyze {
        /// Image file to analyze
        image: PathBuf,
        /// Write the annotated JPEG here
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Print detections as JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Print cascade and model details
    Inspect,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let layout: TensorLayout = cli.layout.parse()?;
    let cascade_path = cli.models.join(&cli.cascade);
    let model_path = cli.models.join(&cli.model);

    match cli.command {
        Commands::Analyze {
            image,
            output,
            json,
        } => analyze(&cascade_path, &model_path, layout, &image, output, json),
        Commands::Inspect => inspect(&cascade_path, &model_path, layout),
    }
}

fn analyze(
    cascade_path: &Path,
    model_path: &Path,
    layout: TensorLayout,
    image: &Path,
    output: Option<PathBuf>,
    json: bool,
) -> Result<()> {
    let detector = FaceDetector::load(cascade_path, DetectParams::default())?;
    let mut classifier = EmotionClassifier::load(model_path, layout)?;

    let bytes = std::fs::read(image).with_context(|| format!("reading {}", image.display()))?;
    let decoded = imaging::decode(&bytes)?;
    let mut rgb = decoded.to_rgb8();
    let gray = decoded.to_luma8();
    let (width, height) = gray.dimensions();

    let mut detections = Vec::new();
    for rect in detector.detect(gray.as_raw(), width, height) {
        let Some(input) = classifier::preprocess(gray.as_raw(), width, height, &rect) else {
            continue;
        };
        let (emotion, confidence) = classifier.classify(&input)?;
        detections.push(Detection {
            rect,
            emotion,
            confidence,
        });
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&detections)?);
    } else if detections.is_empty() {
        println!("No faces detected");
    } else {
        for (i, d) in detections.iter().enumerate() {
            println!(
                "face {}: {} {} at ({}, {}) {}x{} ({:.1}%)",
                i + 1,
                d.emotion.label(),
                d.emotion.emoji(),
                d.rect.x,
                d.rect.y,
                d.rect.width,
                d.rect.height,
                d.confidence * 100.0
            );
        }
    }

    if let Some(output) = output {
        let annotator = Annotator::new(Rgb([0, 255, 0]), None);
        annotator.annotate(&mut rgb, &detections);
        let jpeg = imaging::encode_jpeg(&rgb, 90)?;
        std::fs::write(&output, jpeg)
            .with_context(|| format!("writing {}", output.display()))?;
        println!("Annotated image written to {}", output.display());
    }

    Ok(())
}

fn inspect(cascade_path: &Path, model_path: &Path, layout: TensorLayout) -> Result<()> {
    let model = CascadeModel::from_file(cascade_path)?;
    println!("cascade: {}", cascade_path.display());
    println!("  window: {}x{}", model.window_width, model.window_height);
    println!("  stages: {}", model.num_stages());
    println!("  features: {}", model.num_features());
    println!("  weak classifiers: {}", model.num_weak_classifiers());

    let _classifier = EmotionClassifier::load(model_path, layout)?;
    println!("model: {}", model_path.display());
    println!("  layout: {layout:?}");
    let labels = Emotion::ALL.map(|e| e.label());
    println!("  labels: {}", labels.join(", "));

    Ok(())
}
