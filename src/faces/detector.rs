//! ONNX face detection (UltraFace) and face embedding (ArcFace).

use anyhow::{anyhow, Context, Result};
use image::{DynamicImage, GenericImageView};
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Tensor;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crate::adapters::{FaceDetector, FaceRecognizer};
use crate::db::{BoundingBox, DetectedFace};

const ULTRAFACE_FILE: &str = "ultraface-320.onnx";
const ULTRAFACE_URL: &str = "https://github.com/onnx/models/raw/main/validated/vision/body_analysis/ultraface/models/version-RFB-320.onnx";

const ARCFACE_FILE: &str = "arcface-resnet100.onnx";
const ARCFACE_URL: &str = "https://github.com/onnx/models/raw/main/validated/vision/body_analysis/arcface/model/arcfaceresnet100-11-int8.onnx";

/// Download a model file into `models_dir` if it isn't there yet
fn ensure_model(models_dir: &Path, filename: &str, url: &str) -> Result<PathBuf> {
    std::fs::create_dir_all(models_dir)?;
    let model_path = models_dir.join(filename);

    if !model_path.exists() {
        tracing::info!(model = %filename, "Downloading model");
        let response = ureq::get(url)
            .call()
            .map_err(|e| anyhow!("Failed to download model {}: {}", filename, e))?;

        // Write under a temporary name so an interrupted download is retried
        let partial = model_path.with_extension("part");
        let mut file = std::fs::File::create(&partial)?;
        std::io::copy(&mut response.into_reader(), &mut file)?;
        std::fs::rename(&partial, &model_path)?;
        tracing::info!(model = %filename, path = %model_path.display(), "Model downloaded");
    }

    Ok(model_path)
}

fn load_session(models_dir: &Path, filename: &str, url: &str) -> Result<Session> {
    let model_path = ensure_model(models_dir, filename, url)?;
    let session = Session::builder()?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .with_intra_threads(4)?
        .commit_from_file(&model_path)
        .with_context(|| format!("loading {}", model_path.display()))?;
    Ok(session)
}

/// A model session loaded on first use and shared by all workers.
struct LazySession {
    models_dir: PathBuf,
    filename: &'static str,
    url: &'static str,
    session: Mutex<Option<Session>>,
}

impl LazySession {
    fn new(models_dir: &Path, filename: &'static str, url: &'static str) -> Self {
        Self {
            models_dir: models_dir.to_path_buf(),
            filename,
            url,
            session: Mutex::new(None),
        }
    }

    fn with<T>(&self, f: impl FnOnce(&mut Session) -> Result<T>) -> Result<T> {
        let mut guard: MutexGuard<'_, Option<Session>> = self
            .session
            .lock()
            .map_err(|e| anyhow!("Failed to lock {} session: {}", self.filename, e))?;
        if guard.is_none() {
            *guard = Some(load_session(&self.models_dir, self.filename, self.url)?);
        }
        match guard.as_mut() {
            Some(session) => f(session),
            None => Err(anyhow!("{} session not initialized", self.filename)),
        }
    }
}

/// UltraFace 320x240 detector (lightweight and fast).
pub struct UltraFaceDetector {
    session: LazySession,
    confidence_threshold: f32,
}

impl UltraFaceDetector {
    pub fn new(models_dir: &Path, confidence_threshold: f32) -> Self {
        Self {
            session: LazySession::new(models_dir, ULTRAFACE_FILE, ULTRAFACE_URL),
            confidence_threshold,
        }
    }
}

impl FaceDetector for UltraFaceDetector {
    fn detect(&self, image: &[u8]) -> Result<Vec<DetectedFace>> {
        let img = image::load_from_memory(image).context("decoding image for detection")?;
        let boxes = self
            .session
            .with(|session| run_ultraface_detection(session, &img, self.confidence_threshold))?;

        Ok(boxes
            .into_iter()
            .filter(|(bbox, _)| bbox.is_valid())
            .map(|(bbox, confidence)| DetectedFace { bbox, confidence })
            .collect())
    }
}

/// ArcFace ResNet100 recognizer producing 512-dim L2-normalized embeddings.
pub struct ArcFaceRecognizer {
    session: LazySession,
}

impl ArcFaceRecognizer {
    pub fn new(models_dir: &Path) -> Self {
        Self {
            session: LazySession::new(models_dir, ARCFACE_FILE, ARCFACE_URL),
        }
    }
}

impl FaceRecognizer for ArcFaceRecognizer {
    fn embed(&self, face: &DynamicImage) -> Result<Vec<f32>> {
        self.session.with(|session| run_arcface_embedding(session, face))
    }
}

/// Run UltraFace detection model
fn run_ultraface_detection(
    session: &mut Session,
    img: &DynamicImage,
    confidence_threshold: f32,
) -> Result<Vec<(BoundingBox, f32)>> {
    const INPUT_WIDTH: u32 = 320;
    const INPUT_HEIGHT: u32 = 240;
    const NMS_THRESHOLD: f32 = 0.3;

    let (orig_width, orig_height) = img.dimensions();

    let resized = img.resize_exact(INPUT_WIDTH, INPUT_HEIGHT, image::imageops::FilterType::Triangle);
    let rgb = resized.to_rgb8();

    // NCHW, normalized to roughly [-1, 1]
    let plane = (INPUT_HEIGHT * INPUT_WIDTH) as usize;
    let mut input_data = vec![0.0f32; 3 * plane];
    for (x, y, pixel) in rgb.enumerate_pixels() {
        let idx = y as usize * INPUT_WIDTH as usize + x as usize;
        input_data[idx] = (pixel[0] as f32 - 127.0) / 128.0;
        input_data[plane + idx] = (pixel[1] as f32 - 127.0) / 128.0;
        input_data[2 * plane + idx] = (pixel[2] as f32 - 127.0) / 128.0;
    }

    let input_tensor = Tensor::from_array((
        [1usize, 3, INPUT_HEIGHT as usize, INPUT_WIDTH as usize],
        input_data.into_boxed_slice(),
    ))?;

    let outputs = session.run(ort::inputs!["input" => input_tensor])?;

    let scores_value = outputs.get("scores").ok_or_else(|| anyhow!("No scores output"))?;
    let boxes_value = outputs.get("boxes").ok_or_else(|| anyhow!("No boxes output"))?;

    let (scores_shape, scores_data) = scores_value.try_extract_tensor::<f32>()?;
    let (_boxes_shape, boxes_data) = boxes_value.try_extract_tensor::<f32>()?;

    // scores: [1, anchors, 2] (background, face); boxes: [1, anchors, 4] normalized corners
    let num_anchors = scores_shape.get(1).copied().unwrap_or(0).max(0) as usize;
    let num_anchors = num_anchors
        .min(scores_data.len() / 2)
        .min(boxes_data.len() / 4);

    let mut face_boxes = Vec::new();
    for i in 0..num_anchors {
        let confidence = scores_data[i * 2 + 1];
        if confidence <= confidence_threshold {
            continue;
        }

        let x1 = (boxes_data[i * 4] * orig_width as f32) as i32;
        let y1 = (boxes_data[i * 4 + 1] * orig_height as f32) as i32;
        let x2 = (boxes_data[i * 4 + 2] * orig_width as f32) as i32;
        let y2 = (boxes_data[i * 4 + 3] * orig_height as f32) as i32;

        let bbox = BoundingBox {
            x: x1.max(0),
            y: y1.max(0),
            width: x2.min(orig_width as i32) - x1.max(0),
            height: y2.min(orig_height as i32) - y1.max(0),
        };
        face_boxes.push((bbox, confidence));
    }

    Ok(nms(face_boxes, NMS_THRESHOLD))
}

/// Non-maximum suppression to remove overlapping detections
fn nms(mut boxes: Vec<(BoundingBox, f32)>, threshold: f32) -> Vec<(BoundingBox, f32)> {
    boxes.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    let mut keep: Vec<(BoundingBox, f32)> = Vec::new();
    for candidate in boxes {
        if keep.iter().all(|(kept, _)| compute_iou(kept, &candidate.0) <= threshold) {
            keep.push(candidate);
        }
    }
    keep
}

/// Intersection over Union of two boxes
fn compute_iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let x1 = a.x.max(b.x);
    let y1 = a.y.max(b.y);
    let x2 = (a.x + a.width).min(b.x + b.width);
    let y2 = (a.y + a.height).min(b.y + b.height);

    let intersection = ((x2 - x1).max(0) * (y2 - y1).max(0)) as f32;
    let area_a = (a.width * a.height) as f32;
    let area_b = (b.width * b.height) as f32;
    let union = area_a + area_b - intersection;

    if union > 0.0 {
        intersection / union
    } else {
        0.0
    }
}

/// Crop a face out of its image with 20% padding, clamped to the image.
pub fn crop_face(img: &DynamicImage, bbox: &BoundingBox) -> DynamicImage {
    let (img_width, img_height) = img.dimensions();
    let padding_x = (bbox.width as f32 * 0.2) as i32;
    let padding_y = (bbox.height as f32 * 0.2) as i32;

    let x = ((bbox.x - padding_x).max(0) as u32).min(img_width.saturating_sub(1));
    let y = ((bbox.y - padding_y).max(0) as u32).min(img_height.saturating_sub(1));
    let w = ((bbox.width + padding_x * 2).max(1) as u32).min(img_width - x);
    let h = ((bbox.height + padding_y * 2).max(1) as u32).min(img_height - y);

    img.crop_imm(x, y, w.max(1), h.max(1))
}

/// Run ArcFace embedding model
fn run_arcface_embedding(session: &mut Session, face_img: &DynamicImage) -> Result<Vec<f32>> {
    const INPUT_SIZE: u32 = 112;

    let resized = face_img.resize_exact(INPUT_SIZE, INPUT_SIZE, image::imageops::FilterType::Triangle);
    let rgb = resized.to_rgb8();

    let plane = (INPUT_SIZE * INPUT_SIZE) as usize;
    let mut input_data = vec![0.0f32; 3 * plane];
    for (x, y, pixel) in rgb.enumerate_pixels() {
        let idx = y as usize * INPUT_SIZE as usize + x as usize;
        input_data[idx] = (pixel[0] as f32 - 127.5) / 127.5;
        input_data[plane + idx] = (pixel[1] as f32 - 127.5) / 127.5;
        input_data[2 * plane + idx] = (pixel[2] as f32 - 127.5) / 127.5;
    }

    let input_tensor = Tensor::from_array((
        [1usize, 3, INPUT_SIZE as usize, INPUT_SIZE as usize],
        input_data.into_boxed_slice(),
    ))?;

    // ArcFace ONNX model uses "data" as input name
    let outputs = session.run(ort::inputs!["data" => input_tensor])?;

    let embedding_output = outputs
        .iter()
        .next()
        .ok_or_else(|| anyhow!("No embedding output"))?;
    let (_shape, embedding_data) = embedding_output.1.try_extract_tensor::<f32>()?;

    Ok(l2_normalize(embedding_data.to_vec()))
}

fn l2_normalize(embedding: Vec<f32>) -> Vec<f32> {
    let norm: f32 = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        embedding.into_iter().map(|x| x / norm).collect()
    } else {
        embedding
    }
}
