use anyhow::{Context, Result};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use crate::adapters::MetadataExtractor;

/// Output of the metadata task.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImageMetadata {
    // Image dimensions
    pub width: Option<u32>,
    pub height: Option<u32>,

    // Exposure settings
    pub aperture: Option<f64>,
    pub shutter_speed: Option<String>,
    pub iso: Option<u32>,
    pub focal_length: Option<f64>,

    // Lens and camera
    pub lens_make: Option<String>,
    pub lens_model: Option<String>,
    pub camera_make: Option<String>,
    pub camera_model: Option<String>,

    pub taken_at: Option<String>,
}

/// Reads dimensions with the `image` crate and everything else from EXIF.
///
/// An image whose dimensions cannot be read is an error; a missing or
/// partial EXIF block is not.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExifExtractor;

impl MetadataExtractor for ExifExtractor {
    fn extract(&self, source: &Path) -> Result<ImageMetadata> {
        let (width, height) = image::ImageReader::open(source)
            .with_context(|| format!("opening {}", source.display()))?
            .with_guessed_format()?
            .into_dimensions()
            .with_context(|| format!("reading dimensions of {}", source.display()))?;

        let mut metadata = ImageMetadata {
            width: Some(width),
            height: Some(height),
            ..Default::default()
        };

        let file = File::open(source)?;
        let mut bufreader = BufReader::new(file);
        match exif::Reader::new().read_from_container(&mut bufreader) {
            Ok(exif) => read_exif(&exif, &mut metadata),
            Err(e) => tracing::debug!(path = %source.display(), error = %e, "No EXIF data"),
        }

        Ok(metadata)
    }
}

fn read_exif(exif: &exif::Exif, metadata: &mut ImageMetadata) {
    metadata.camera_make = text_field(exif, exif::Tag::Make);
    metadata.camera_model = text_field(exif, exif::Tag::Model);
    metadata.lens_make = text_field(exif, exif::Tag::LensMake);
    metadata.lens_model = text_field(exif, exif::Tag::LensModel);
    metadata.taken_at = text_field(exif, exif::Tag::DateTimeOriginal);

    metadata.focal_length = rational_field(exif, exif::Tag::FocalLength);
    metadata.aperture = rational_field(exif, exif::Tag::FNumber);

    if let Some(field) = exif.get_field(exif::Tag::ExposureTime, exif::In::PRIMARY) {
        metadata.shutter_speed = Some(field.display_value().to_string());
    }

    if let Some(field) = exif.get_field(exif::Tag::PhotographicSensitivity, exif::In::PRIMARY) {
        metadata.iso = field.value.get_uint(0);
    }
}

fn text_field(exif: &exif::Exif, tag: exif::Tag) -> Option<String> {
    let field = exif.get_field(tag, exif::In::PRIMARY)?;
    let value = field
        .display_value()
        .to_string()
        .trim_matches('"')
        .trim()
        .to_string();
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

fn rational_field(exif: &exif::Exif, tag: exif::Tag) -> Option<f64> {
    let field = exif.get_field(tag, exif::In::PRIMARY)?;
    match field.value {
        exif::Value::Rational(ref v) => v.first().filter(|r| r.denom != 0).map(|r| r.to_f64()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_dimensions_without_exif() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("plain.png");
        image::RgbImage::new(32, 24).save(&path).unwrap();

        let metadata = ExifExtractor.extract(&path).unwrap();

        assert_eq!(metadata.width, Some(32));
        assert_eq!(metadata.height, Some(24));
        assert!(metadata.camera_make.is_none());
        assert!(metadata.taken_at.is_none());
    }

    #[test]
    fn test_unreadable_image_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.jpg");
        std::fs::write(&path, b"not an image").unwrap();

        assert!(ExifExtractor.extract(&path).is_err());
        assert!(ExifExtractor.extract(&dir.path().join("missing.jpg")).is_err());
    }
}
