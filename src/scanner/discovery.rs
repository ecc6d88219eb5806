use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// All files under `root` with one of `extensions` (case-insensitive),
/// sorted by path. Unreadable entries are skipped.
pub fn discover_images(root: &Path, extensions: &[String]) -> Vec<PathBuf> {
    let mut images = Vec::new();

    for entry in WalkDir::new(root).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::debug!(error = %e, "Skipping unreadable entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        if let Some(ext) = path.extension() {
            let ext_lower = ext.to_string_lossy().to_lowercase();
            if extensions.iter().any(|e| e.to_lowercase() == ext_lower) {
                images.push(path.to_path_buf());
            }
        }
    }

    images.sort();
    images
}
