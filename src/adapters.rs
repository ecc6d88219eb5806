//! Replaceable codec and extraction steps run by the workers.
//!
//! Each adapter is a stateless function from a source image to a result.
//! Errors are plain `anyhow` errors; the worker turns them into the task's
//! `error` status and they never cross the worker boundary.

use anyhow::Result;
use image::DynamicImage;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::db::DetectedFace;
use crate::scanner::metadata::ImageMetadata;

pub trait ThumbnailGenerator: Send + Sync {
    /// Write a thumbnail for `source` and return where it was written.
    fn generate(&self, source: &Path) -> Result<PathBuf>;
}

pub trait MetadataExtractor: Send + Sync {
    fn extract(&self, source: &Path) -> Result<ImageMetadata>;
}

pub trait FaceDetector: Send + Sync {
    /// Detect faces in encoded image bytes. Boxes are in source pixels.
    fn detect(&self, image: &[u8]) -> Result<Vec<DetectedFace>>;
}

pub trait FaceRecognizer: Send + Sync {
    /// Embedding of one cropped face.
    fn embed(&self, face: &DynamicImage) -> Result<Vec<f32>>;
}

/// The adapters a worker pool runs with.
#[derive(Clone)]
pub struct Adapters {
    pub thumbnails: Arc<dyn ThumbnailGenerator>,
    pub metadata: Arc<dyn MetadataExtractor>,
    pub detector: Arc<dyn FaceDetector>,
    /// Without a recognizer, recognition jobs only log and skip.
    pub recognizer: Option<Arc<dyn FaceRecognizer>>,
}
