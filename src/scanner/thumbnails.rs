use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

use crate::adapters::ThumbnailGenerator;
use crate::config::ThumbnailConfig;

/// Writes JPEG thumbnails into a cache directory.
pub struct ImageThumbnailer {
    cache_dir: PathBuf,
    size: u32,
}

impl ImageThumbnailer {
    pub fn new(config: &ThumbnailConfig) -> Self {
        Self {
            cache_dir: config.path.clone(),
            size: config.size,
        }
    }

    /// Cache file for a source path. The name is a hash of the path, so the
    /// same source always maps to the same file.
    pub fn cache_path(&self, source: &Path) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(source.to_string_lossy().as_bytes());
        let digest = hasher.finalize();
        let name: String = digest[..16].iter().map(|b| format!("{:02x}", b)).collect();
        self.cache_dir.join(format!("{}.jpg", name))
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }
}

impl ThumbnailGenerator for ImageThumbnailer {
    /// Always regenerates: the task only runs when the source changed or
    /// the previous attempt failed.
    fn generate(&self, source: &Path) -> Result<PathBuf> {
        fs::create_dir_all(&self.cache_dir)?;

        let cache_path = self.cache_path(source);
        let img = image::ImageReader::open(source)
            .with_context(|| format!("opening {}", source.display()))?
            .with_guessed_format()?
            .decode()
            .with_context(|| format!("decoding {}", source.display()))?;
        let thumbnail = img.thumbnail(self.size, self.size).to_rgb8();
        thumbnail
            .save_with_format(&cache_path, image::ImageFormat::Jpeg)
            .with_context(|| format!("writing {}", cache_path.display()))?;

        Ok(cache_path)
    }
}
