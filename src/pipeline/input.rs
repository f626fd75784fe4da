//! Input classification: decide once what kind of image the caller handed us.
//!
//! Every downstream stage matches on [`ImageInput`] and never re-inspects a
//! string to guess whether it is a path or a payload. The only place where
//! guessing happens is [`ImageInput::from_arg`], used at the CLI boundary,
//! and the content sniff in [`sniff_media_type`].

use crate::error::InvoiceError;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::DynamicImage;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Decoded payloads at or below this size are never treated as images.
pub const MIN_SNIFF_BYTES: usize = 50;

/// File extensions picked up when a directory is given as input.
pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp"];

/// Something the normalizer can turn into an [`crate::pipeline::encode::EncodedImage`].
#[derive(Debug, Clone)]
pub enum ImageInput {
    /// An image file on disk.
    Path(PathBuf),
    /// An already-decoded image.
    Image(DynamicImage),
    /// Raw encoded bytes (JPEG, PNG, …) held in memory.
    Bytes(Vec<u8>),
    /// A bare base64 payload.
    Base64(String),
    /// A `data:image/...;base64,` URI.
    DataUri(String),
}

impl ImageInput {
    /// Classify a command-line argument.
    ///
    /// `data:` URIs are recognised by prefix; an existing file wins over a
    /// string that merely happens to be valid base64; anything else that
    /// decodes as base64 into a recognisable image is a payload. Everything
    /// left is treated as a path so the caller gets a `NotFound` naming it.
    pub fn from_arg(arg: &str) -> Self {
        if arg.starts_with("data:") {
            return ImageInput::DataUri(arg.to_string());
        }
        let path = Path::new(arg);
        if path.exists() {
            return ImageInput::Path(path.to_path_buf());
        }
        if let Ok(bytes) = STANDARD.decode(arg.trim()) {
            if is_image_payload(&bytes) {
                return ImageInput::Base64(arg.trim().to_string());
            }
        }
        ImageInput::Path(path.to_path_buf())
    }

    /// Human-readable origin used in error messages.
    pub fn origin(&self) -> String {
        match self {
            ImageInput::Path(p) => p.display().to_string(),
            ImageInput::Image(_) => "in-memory image".to_string(),
            ImageInput::Bytes(b) => format!("in-memory bytes ({} bytes)", b.len()),
            ImageInput::Base64(_) => "base64 payload".to_string(),
            ImageInput::DataUri(_) => "data URI".to_string(),
        }
    }
}

impl From<PathBuf> for ImageInput {
    fn from(p: PathBuf) -> Self {
        ImageInput::Path(p)
    }
}

impl From<&Path> for ImageInput {
    fn from(p: &Path) -> Self {
        ImageInput::Path(p.to_path_buf())
    }
}

impl From<DynamicImage> for ImageInput {
    fn from(img: DynamicImage) -> Self {
        ImageInput::Image(img)
    }
}

/// Identify an image by its leading bytes.
///
/// | Format | Signature |
/// |--------|-----------|
/// | JPEG | `FF D8 FF` |
/// | PNG  | `89 50 4E 47 0D 0A 1A 0A` |
/// | GIF  | `GIF87a` / `GIF89a` |
/// | WebP | `WEBP` at offset 8 |
pub fn sniff_media_type(bytes: &[u8]) -> Option<&'static str> {
    if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        Some("image/jpeg")
    } else if bytes.starts_with(b"\x89PNG\r\n\x1a\n") {
        Some("image/png")
    } else if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
        Some("image/gif")
    } else if bytes.len() > 12 && &bytes[8..12] == b"WEBP" {
        Some("image/webp")
    } else {
        None
    }
}

/// Decoded bytes that are long enough and carry a known image signature.
pub fn is_image_payload(bytes: &[u8]) -> bool {
    bytes.len() > MIN_SNIFF_BYTES && sniff_media_type(bytes).is_some()
}

/// Split a `data:<media>;base64,<payload>` URI.
pub fn parse_data_uri(uri: &str) -> Result<(&str, &str), InvoiceError> {
    let rest = uri
        .strip_prefix("data:")
        .ok_or_else(|| unsupported("not a data URI"))?;
    let (header, payload) = rest
        .split_once(',')
        .ok_or_else(|| unsupported("data URI has no payload"))?;
    let media_type = header
        .strip_suffix(";base64")
        .ok_or_else(|| unsupported("data URI is not base64-encoded"))?;
    if !media_type.starts_with("image/") {
        return Err(unsupported(format!(
            "data URI media type '{media_type}' is not an image"
        )));
    }
    Ok((media_type, payload))
}

/// Media type guessed from a file extension; JPEG when unknown.
///
/// Only a hint: the normaliser trusts the file's magic bytes first.
pub fn media_type_for_extension(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        _ => "image/jpeg",
    }
}

/// Whether `path` has one of [`IMAGE_EXTENSIONS`].
pub fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Expand files and directories into a sorted, deduplicated list of images.
///
/// Directories are scanned one level deep. Explicit files are kept even when
/// their extension is unusual; the decoder gets the final say.
pub fn discover_images(inputs: &[PathBuf]) -> Result<Vec<PathBuf>, InvoiceError> {
    let mut found = Vec::new();
    for input in inputs {
        if input.is_dir() {
            let entries = std::fs::read_dir(input).map_err(|e| {
                InvoiceError::Internal(format!("Failed to read directory {}: {e}", input.display()))
            })?;
            let mut dir_images: Vec<PathBuf> = entries
                .filter_map(Result::ok)
                .map(|e| e.path())
                .filter(|p| p.is_file() && has_image_extension(p))
                .collect();
            dir_images.sort();
            debug!("{}: {} images", input.display(), dir_images.len());
            found.extend(dir_images);
        } else {
            found.push(input.clone());
        }
    }
    let mut seen = std::collections::HashSet::new();
    found.retain(|p| seen.insert(p.clone()));
    Ok(found)
}

fn unsupported(detail: impl Into<String>) -> InvoiceError {
    InvoiceError::UnsupportedInput {
        detail: detail.into(),
    }
}
