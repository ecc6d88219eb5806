use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub library: LibraryConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub workers: WorkerConfig,

    #[serde(default)]
    pub thumbnails: ThumbnailConfig,

    #[serde(default)]
    pub faces: FaceConfig,

    #[serde(default)]
    pub archive: ArchiveConfig,

    #[serde(default)]
    pub daemon: DaemonConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LibraryConfig {
    /// Root of the photo tree. Record keys are relative to it.
    #[serde(default = "default_photo_root")]
    pub root: PathBuf,

    #[serde(default = "default_image_extensions")]
    pub image_extensions: Vec<String>,
}

fn default_photo_root() -> PathBuf {
    dirs::picture_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

fn default_image_extensions() -> Vec<String> {
    ["jpg", "jpeg", "png", "gif", "webp", "tif", "tiff", "bmp"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for LibraryConfig {
    fn default() -> Self {
        Self {
            root: default_photo_root(),
            image_extensions: default_image_extensions(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("galleria")
        .join("galleria.db")
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_worker_count")]
    pub count: usize,

    /// Jobs that may wait in the queue before submissions are rejected.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

fn default_queue_capacity() -> usize {
    1024
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            count: default_worker_count(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThumbnailConfig {
    #[serde(default = "default_thumb_cache_path")]
    pub path: PathBuf,

    #[serde(default = "default_thumb_cache_size")]
    pub size: u32,
}

fn default_thumb_cache_path() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from(".cache"))
        .join("galleria/thumbnails")
}

fn default_thumb_cache_size() -> u32 {
    256
}

impl Default for ThumbnailConfig {
    fn default() -> Self {
        Self {
            path: default_thumb_cache_path(),
            size: default_thumb_cache_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaceConfig {
    /// Set to false to mark detection `not_required` for every image.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Where the ONNX models live (downloaded on first use).
    #[serde(default = "default_models_dir")]
    pub models_dir: PathBuf,

    /// Cosine similarity above which a face is suggested or auto-tagged.
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,

    /// Minimum detector score for a box to count as a face.
    #[serde(default = "default_detection_confidence")]
    pub detection_confidence: f32,
}

fn default_true() -> bool {
    true
}

fn default_models_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("galleria")
        .join("models")
}

fn default_similarity_threshold() -> f32 {
    0.6
}

fn default_detection_confidence() -> f32 {
    0.7
}

impl Default for FaceConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            models_dir: default_models_dir(),
            similarity_threshold: default_similarity_threshold(),
            detection_confidence: default_detection_confidence(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    #[serde(default = "default_archive_dir")]
    pub path: PathBuf,
}

fn default_archive_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from(".cache"))
        .join("galleria/archives")
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            path: default_archive_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Seconds between library sync passes.
    #[serde(default = "default_sync_interval")]
    pub sync_interval: u64,

    /// Log directory for the file backend (when journald is unavailable).
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

fn default_sync_interval() -> u64 {
    300
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            sync_interval: default_sync_interval(),
            log_dir: None,
        }
    }
}

impl Config {
    /// Load from `GALLERIA_CONFIG` or the default location.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    /// Load a config file, writing the defaults there if it does not exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            let config: Config = toml::from_str(&content)
                .with_context(|| format!("parsing config {}", path.display()))?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        Ok(())
    }

    pub fn config_path() -> PathBuf {
        if let Some(path) = std::env::var_os("GALLERIA_CONFIG") {
            return PathBuf::from(path);
        }
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("galleria")
            .join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_writes_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/config.toml");

        let config = Config::load_from(&path).unwrap();

        assert!(path.exists());
        assert_eq!(config.workers.queue_capacity, 1024);
        assert_eq!(config.daemon.sync_interval, 300);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[library]\nroot = \"/srv/photos\"\n\n[faces]\nsimilarity_threshold = 0.8\n",
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();

        assert_eq!(config.library.root, PathBuf::from("/srv/photos"));
        assert!(!config.library.image_extensions.is_empty());
        assert_eq!(config.faces.similarity_threshold, 0.8);
        assert!(config.faces.enabled);
        assert_eq!(config.thumbnails.size, 256);
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[workers\ncount = ").unwrap();

        assert!(Config::load_from(&path).is_err());
    }
}
