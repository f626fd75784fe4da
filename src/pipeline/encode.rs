//! Image normalisation: any [`ImageInput`] → base64 JPEG [`EncodedImage`].
//!
//! Receipt photos straight off a phone are 12 MP, rotated via EXIF rather than
//! in the pixel data, and carry GPS metadata. Re-encoding through the decoder
//! fixes all three: orientation is applied to the pixels, the longest edge is
//! bounded, and the output JPEG carries no metadata at all.
//!
//! JPEG (not PNG like a rendered document page) because receipts are
//! photographs: at quality ~90 the text stays sharp and the payload is a
//! fraction of the lossless size, which matters for upload limits.

use crate::error::InvoiceError;
use crate::pipeline::input::{
    has_image_extension, is_image_payload, media_type_for_extension, parse_data_uri,
    sniff_media_type, ImageInput,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ImageDecoder, ImageFormat, ImageReader};
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use tracing::debug;

/// Default JPEG quality.
pub const DEFAULT_QUALITY: u8 = 90;

/// A base64 image payload ready for a multimodal request body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedImage {
    /// e.g. `image/jpeg`
    pub media_type: String,
    /// Standard-alphabet, padded base64.
    pub data: String,
}

impl EncodedImage {
    pub fn new(media_type: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            media_type: media_type.into(),
            data: data.into(),
        }
    }

    /// `data:<media_type>;base64,<data>`
    pub fn data_uri(&self) -> String {
        format!("data:{};base64,{}", self.media_type, self.data)
    }
}

/// Resize and encoding knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NormalizeOptions {
    pub max_width: Option<u32>,
    pub max_height: Option<u32>,
    /// JPEG quality, 1–100.
    pub quality: u8,
}

impl Default for NormalizeOptions {
    fn default() -> Self {
        Self {
            max_width: None,
            max_height: None,
            quality: DEFAULT_QUALITY,
        }
    }
}

/// Normalise one image input.
///
/// Payloads that already look like an encoded image (see
/// [`crate::pipeline::input::sniff_media_type`]) pass through untouched, so
/// normalising twice is a no-op. Everything else is decoded, oriented,
/// bounded and re-encoded.
pub fn normalize(input: ImageInput, opts: &NormalizeOptions) -> Result<EncodedImage, InvoiceError> {
    let origin = input.origin();
    match input {
        ImageInput::DataUri(uri) => {
            let (declared, payload) = parse_data_uri(&uri)?;
            let bytes = decode_base64(payload)?;
            if is_image_payload(&bytes) {
                let media_type = sniff_media_type(&bytes).unwrap_or(declared);
                return Ok(EncodedImage::new(media_type, payload));
            }
            encode_bytes(&bytes, &origin, None, opts)
        }
        ImageInput::Base64(payload) => {
            let payload = payload.trim();
            let bytes = decode_base64(payload)?;
            if let (true, Some(media_type)) = (is_image_payload(&bytes), sniff_media_type(&bytes)) {
                return Ok(EncodedImage::new(media_type, payload));
            }
            encode_bytes(&bytes, &origin, None, opts)
        }
        ImageInput::Path(path) => {
            if !path.exists() {
                return Err(InvoiceError::NotFound { path });
            }
            let bytes = std::fs::read(&path).map_err(|e| InvoiceError::image(&origin, e))?;
            let hint = has_image_extension(&path)
                .then(|| ImageFormat::from_mime_type(media_type_for_extension(&path)))
                .flatten();
            encode_bytes(&bytes, &origin, hint, opts)
        }
        ImageInput::Bytes(bytes) => encode_bytes(&bytes, &origin, None, opts),
        ImageInput::Image(img) => encode_image(img, &origin, opts),
    }
}

/// Normalise several inputs, failing on the first error.
pub fn normalize_all(
    inputs: Vec<ImageInput>,
    opts: &NormalizeOptions,
) -> Result<Vec<EncodedImage>, InvoiceError> {
    inputs.into_iter().map(|i| normalize(i, opts)).collect()
}

/// Target size for a downscale, or `None` when the image already fits.
///
/// `scale = min(max_width / width, max_height / height)`, an unset bound
/// counting as infinite. Never upscales.
pub fn fit_within(
    width: u32,
    height: u32,
    max_width: Option<u32>,
    max_height: Option<u32>,
) -> Option<(u32, u32)> {
    if (max_width.is_none() && max_height.is_none()) || width == 0 || height == 0 {
        return None;
    }
    let scale_x = max_width.map_or(f64::INFINITY, |m| f64::from(m) / f64::from(width));
    let scale_y = max_height.map_or(f64::INFINITY, |m| f64::from(m) / f64::from(height));
    let scale = scale_x.min(scale_y);
    if scale >= 1.0 {
        return None;
    }

    let scaled = |dim: u32, bound: Option<u32>| {
        let v = (f64::from(dim) * scale).round() as u32;
        bound.map_or(v, |b| v.min(b)).max(1)
    };
    Some((scaled(width, max_width), scaled(height, max_height)))
}

fn decode_base64(payload: &str) -> Result<Vec<u8>, InvoiceError> {
    STANDARD
        .decode(payload)
        .map_err(|e| InvoiceError::UnsupportedInput {
            detail: format!("payload is not valid base64: {e}"),
        })
}

/// Decode raw bytes, apply EXIF orientation, then bound and re-encode.
///
/// The format is sniffed from the content; `hint` (from a file extension) is
/// used only when sniffing finds nothing.
fn encode_bytes(
    bytes: &[u8],
    origin: &str,
    hint: Option<ImageFormat>,
    opts: &NormalizeOptions,
) -> Result<EncodedImage, InvoiceError> {
    let mut reader = ImageReader::new(Cursor::new(bytes));
    if let Some(format) = hint {
        reader.set_format(format);
    }
    let reader = reader
        .with_guessed_format()
        .map_err(|e| InvoiceError::image(origin, e))?;
    let Some(format) = reader.format() else {
        return Err(InvoiceError::UnsupportedInput {
            detail: format!("{origin}: unrecognised image format"),
        });
    };

    let mut decoder = reader
        .into_decoder()
        .map_err(|e| InvoiceError::image(origin, e))?;
    let orientation = decoder
        .orientation()
        .map_err(|e| InvoiceError::image(origin, e))?;
    let mut img = DynamicImage::from_decoder(decoder).map_err(|e| InvoiceError::image(origin, e))?;
    img.apply_orientation(orientation);

    debug!(
        "Decoded {} as {:?}: {}x{} ({:?})",
        origin,
        format,
        img.width(),
        img.height(),
        orientation
    );

    encode_image(img, origin, opts)
}

fn encode_image(
    img: DynamicImage,
    origin: &str,
    opts: &NormalizeOptions,
) -> Result<EncodedImage, InvoiceError> {
    let img = match fit_within(img.width(), img.height(), opts.max_width, opts.max_height) {
        Some((w, h)) => {
            debug!("Resizing {} from {}x{} to {}x{}", origin, img.width(), img.height(), w, h);
            img.resize_exact(w, h, FilterType::Lanczos3)
        }
        None => img,
    };

    // JPEG has no alpha channel.
    let rgb = DynamicImage::ImageRgb8(img.to_rgb8());
    let mut buf = Vec::new();
    let quality = opts.quality.clamp(1, 100);
    rgb.write_with_encoder(JpegEncoder::new_with_quality(&mut buf, quality))
        .map_err(|e| InvoiceError::image(origin, e))?;

    let b64 = STANDARD.encode(&buf);
    debug!(
        "Encoded {} → {} bytes JPEG, {} bytes base64 (q={})",
        origin,
        buf.len(),
        b64.len(),
        quality
    );

    Ok(EncodedImage::new("image/jpeg", b64))
}
