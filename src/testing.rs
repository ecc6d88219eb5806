//! Mock adapters for tests.

use anyhow::{bail, Result};
use image::DynamicImage;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::adapters::{Adapters, FaceDetector, FaceRecognizer, MetadataExtractor, ThumbnailGenerator};
use crate::db::DetectedFace;
use crate::scanner::metadata::ImageMetadata;

pub fn face(x: i32, y: i32, width: i32, height: i32) -> DetectedFace {
    DetectedFace::new(x, y, width, height, 0.9)
}

/// Adapters that always succeed; the detector finds `faces` faces.
pub fn adapters(faces: usize) -> Adapters {
    let boxes = (0..faces as i32).map(|i| face(i * 12, 0, 10, 10)).collect();
    Adapters {
        thumbnails: Arc::new(StaticThumbnailer),
        metadata: Arc::new(StaticMetadata),
        detector: Arc::new(FixedDetector(boxes)),
        recognizer: Some(Arc::new(FixedRecognizer)),
    }
}

/// Write a small decodable PNG (whatever the extension says) and return its path.
pub fn write_source_image(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    image::RgbImage::from_pixel(64, 48, image::Rgb([120, 90, 60]))
        .save_with_format(&path, image::ImageFormat::Png)
        .unwrap();
    path
}

pub struct StaticThumbnailer;

impl ThumbnailGenerator for StaticThumbnailer {
    fn generate(&self, source: &Path) -> Result<PathBuf> {
        Ok(PathBuf::from("/thumbs").join(source.file_name().unwrap_or_default()))
    }
}

pub struct FailingThumbnailer;

impl ThumbnailGenerator for FailingThumbnailer {
    fn generate(&self, _source: &Path) -> Result<PathBuf> {
        bail!("thumbnail backend unavailable")
    }
}

pub struct StaticMetadata;

impl MetadataExtractor for StaticMetadata {
    fn extract(&self, _source: &Path) -> Result<ImageMetadata> {
        Ok(ImageMetadata {
            width: Some(64),
            height: Some(48),
            camera_make: Some("Canon".to_string()),
            ..Default::default()
        })
    }
}

pub struct PanickingMetadata;

impl MetadataExtractor for PanickingMetadata {
    fn extract(&self, _source: &Path) -> Result<ImageMetadata> {
        panic!("exif parser blew up")
    }
}

pub struct FixedDetector(pub Vec<DetectedFace>);

impl FaceDetector for FixedDetector {
    fn detect(&self, _image: &[u8]) -> Result<Vec<DetectedFace>> {
        Ok(self.0.clone())
    }
}

pub struct FailingDetector;

impl FaceDetector for FailingDetector {
    fn detect(&self, _image: &[u8]) -> Result<Vec<DetectedFace>> {
        bail!("detector model missing")
    }
}

pub struct FixedRecognizer;

impl FaceRecognizer for FixedRecognizer {
    fn embed(&self, _face: &DynamicImage) -> Result<Vec<f32>> {
        Ok(vec![1.0, 0.0, 0.0])
    }
}

#[derive(Default)]
struct GateState {
    open: bool,
    active: usize,
    max_active: usize,
    calls: usize,
}

/// Detector that blocks inside `detect` until released, and records how
/// many calls ran at once.
pub struct GatedDetector {
    faces: Vec<DetectedFace>,
    state: Mutex<GateState>,
    changed: Condvar,
}

impl GatedDetector {
    pub fn new(faces: Vec<DetectedFace>) -> Self {
        Self {
            faces,
            state: Mutex::new(GateState::default()),
            changed: Condvar::new(),
        }
    }

    /// Block until `n` calls have entered `detect`.
    pub fn wait_until_entered(&self, n: usize) {
        let state = self.state.lock().unwrap();
        let (_state, timeout) = self
            .changed
            .wait_timeout_while(state, Duration::from_secs(5), |s| s.calls < n)
            .unwrap();
        assert!(!timeout.timed_out(), "detector was never called");
    }

    /// Let current and future calls through.
    pub fn release(&self) {
        self.state.lock().unwrap().open = true;
        self.changed.notify_all();
    }

    pub fn calls(&self) -> usize {
        self.state.lock().unwrap().calls
    }

    pub fn max_concurrent(&self) -> usize {
        self.state.lock().unwrap().max_active
    }
}

impl FaceDetector for GatedDetector {
    fn detect(&self, _image: &[u8]) -> Result<Vec<DetectedFace>> {
        let mut state = self.state.lock().unwrap();
        state.calls += 1;
        state.active += 1;
        state.max_active = state.max_active.max(state.active);
        self.changed.notify_all();

        let mut state = self.changed.wait_while(state, |s| !s.open).unwrap();
        state.active -= 1;
        Ok(self.faces.clone())
    }
}
