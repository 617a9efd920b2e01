//! Image intake: media-type validation, decoding and preview.

use anyhow::{Context, Result};
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageFormat};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const INVALID_TYPE_ALERT: &str = "Please upload a valid JPG, PNG, or WebP image.";

const PREVIEW_MAX_SIDE: u32 = 512;

#[derive(Debug, Error)]
pub enum IntakeError {
    #[error("unsupported media type `{0}`: {}", INVALID_TYPE_ALERT)]
    UnsupportedMediaType(String),

    #[error("failed to read image {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to decode {media_type} image: {source}")]
    Decode {
        media_type: MediaType,
        #[source]
        source: image::ImageError,
    },
}

impl IntakeError {
    /// True for the bad-file-type case the user must be alerted about.
    pub fn is_validation(&self) -> bool {
        matches!(self, IntakeError::UnsupportedMediaType(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MediaType {
    #[serde(rename = "image/jpeg")]
    Jpeg,
    #[serde(rename = "image/png")]
    Png,
    #[serde(rename = "image/webp")]
    WebP,
}

impl MediaType {
    /// Accept only the three upload types; anything else is a validation error.
    pub fn from_mime(mime: &str) -> Result<Self, IntakeError> {
        match mime.trim().to_ascii_lowercase().as_str() {
            "image/jpeg" => Ok(MediaType::Jpeg),
            "image/png" => Ok(MediaType::Png),
            "image/webp" => Ok(MediaType::WebP),
            _ => Err(IntakeError::UnsupportedMediaType(mime.trim().to_string())),
        }
    }

    pub fn as_mime(self) -> &'static str {
        match self {
            MediaType::Jpeg => "image/jpeg",
            MediaType::Png => "image/png",
            MediaType::WebP => "image/webp",
        }
    }

    fn image_format(self) -> ImageFormat {
        match self {
            MediaType::Jpeg => ImageFormat::Jpeg,
            MediaType::Png => ImageFormat::Png,
            MediaType::WebP => ImageFormat::WebP,
        }
    }
}

impl std::fmt::Display for MediaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_mime())
    }
}

/// Declared MIME type for a file, derived from its extension.
pub fn detect_mime_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase();

    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "webp" => "image/webp",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "avif" => "image/avif",
        "bmp" => "image/bmp",
        "tiff" | "tif" => "image/tiff",
        _ => "application/octet-stream",
    }
}

/// A file as handed over by the upload control: a name, a declared type and bytes.
#[derive(Debug, Clone)]
pub struct UploadFile {
    pub name: String,
    pub declared_type: String,
    pub bytes: Vec<u8>,
}

impl UploadFile {
    /// Read a file from disk. `declared_type` overrides extension detection.
    pub fn from_path(path: &Path, declared_type: Option<&str>) -> Result<Self, IntakeError> {
        let bytes = fs::read(path).map_err(|source| IntakeError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let declared_type = declared_type
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| detect_mime_type(path).to_string());
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("upload")
            .to_string();
        Ok(Self {
            name,
            declared_type,
            bytes,
        })
    }
}

/// A validated and decoded upload.
#[derive(Debug, Clone)]
pub struct UploadedImage {
    pub name: String,
    pub media_type: MediaType,
    pub bytes: Vec<u8>,
    pub image: DynamicImage,
}

impl UploadedImage {
    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    pub fn preview(&self) -> Preview {
        let (width, height) = self.dimensions();
        Preview {
            name: self.name.clone(),
            media_type: self.media_type,
            width,
            height,
            byte_len: self.bytes.len(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Preview {
    pub name: String,
    pub media_type: MediaType,
    pub width: u32,
    pub height: u32,
    pub byte_len: usize,
}

/// Check the declared type without touching the bytes.
pub fn validate(file: &UploadFile) -> Result<MediaType, IntakeError> {
    MediaType::from_mime(&file.declared_type)
}

/// Decode bytes using the format implied by the declared type.
pub fn decode(file: UploadFile, media_type: MediaType) -> Result<UploadedImage, IntakeError> {
    let image = image::load_from_memory_with_format(&file.bytes, media_type.image_format())
        .map_err(|source| IntakeError::Decode { media_type, source })?;
    log::debug!(
        "decoded {} ({}, {}x{})",
        file.name,
        media_type,
        image.width(),
        image.height()
    );
    Ok(UploadedImage {
        name: file.name,
        media_type,
        bytes: file.bytes,
        image,
    })
}

/// Validate then decode.
pub fn accept(file: UploadFile) -> Result<UploadedImage, IntakeError> {
    let media_type = validate(&file)?;
    decode(file, media_type)
}

/// Write a PNG thumbnail whose longest side is at most 512 px.
pub fn write_preview(image: &UploadedImage, path: &Path) -> Result<()> {
    let (w, h) = image.dimensions();
    let thumb = if w.max(h) > PREVIEW_MAX_SIDE {
        image
            .image
            .resize(PREVIEW_MAX_SIDE, PREVIEW_MAX_SIDE, FilterType::Triangle)
    } else {
        image.image.clone()
    };
    ensure_parent_dir(path)?;
    thumb
        .save_with_format(path, ImageFormat::Png)
        .with_context(|| format!("failed to write preview: {}", path.display()))?;
    Ok(())
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory: {}", parent.display())
            })?;
        }
    }
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn allowed_mime_types_parse() {
        assert_eq!(MediaType::from_mime("image/jpeg").unwrap(), MediaType::Jpeg);
        assert_eq!(MediaType::from_mime(" IMAGE/PNG ").unwrap(), MediaType::Png);
        assert_eq!(MediaType::from_mime("image/webp").unwrap(), MediaType::WebP);
    }

    #[test]
    fn gif_is_rejected_as_validation_error() {
        let err = MediaType::from_mime("image/gif").unwrap_err();
        assert!(err.is_validation());
        assert!(err.to_string().contains(INVALID_TYPE_ALERT));
    }

    #[test]
    fn detects_mime_from_extension() {
        assert_eq!(detect_mime_type(Path::new("photo.JPG")), "image/jpeg");
        assert_eq!(detect_mime_type(Path::new("a.webp")), "image/webp");
        assert_eq!(detect_mime_type(Path::new("anim.gif")), "image/gif");
        assert_eq!(detect_mime_type(Path::new("noext")), "application/octet-stream");
    }

    #[test]
    fn accepts_png_and_jpeg() {
        let png = accept(png_upload("p.png", 8, 6)).unwrap();
        assert_eq!(png.dimensions(), (8, 6));
        assert_eq!(png.media_type, MediaType::Png);

        let jpeg = accept(UploadFile {
            name: "j.jpg".to_string(),
            declared_type: "image/jpeg".to_string(),
            bytes: encoded(5, 5, ImageFormat::Jpeg),
        })
        .unwrap();
        assert_eq!(jpeg.preview().width, 5);
    }

    #[test]
    fn corrupt_bytes_fail_to_decode() {
        let err = accept(UploadFile {
            name: "bad.png".to_string(),
            declared_type: "image/png".to_string(),
            bytes: b"not an image".to_vec(),
        })
        .unwrap_err();
        assert!(matches!(err, IntakeError::Decode { .. }));
        assert!(!err.is_validation());
    }

    #[test]
    fn from_path_uses_extension_unless_overridden() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("shot.gif");
        fs::write(&path, encoded(2, 2, ImageFormat::Png)).unwrap();

        let file = UploadFile::from_path(&path, None).unwrap();
        assert_eq!(file.declared_type, "image/gif");
        assert!(validate(&file).is_err());

        let file = UploadFile::from_path(&path, Some("image/png")).unwrap();
        assert_eq!(file.name, "shot.gif");
        assert!(accept(file).is_ok());
    }

    #[test]
    fn missing_file_is_read_error() {
        let err = UploadFile::from_path(Path::new("/nonexistent/x.png"), None).unwrap_err();
        assert!(matches!(err, IntakeError::Read { .. }));
    }

    #[test]
    fn preview_thumbnail_is_bounded() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("nested").join("preview.png");
        let img = accept(png_upload("big.png", 1024, 256)).unwrap();
        write_preview(&img, &target).unwrap();

        let thumb = image::open(&target).unwrap();
        assert_eq!(thumb.width(), 512);
        assert_eq!(thumb.height(), 128);
    }
}
