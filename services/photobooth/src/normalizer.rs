use crate::config::NormalizeBounds;
use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageFormat};
use thiserror::Error;
use tracing::{debug, instrument};

/// Media type of every normalized payload.
pub const NORMALIZED_CONTENT_TYPE: &str = "image/jpeg";

/// File extension matching [`NORMALIZED_CONTENT_TYPE`].
pub const NORMALIZED_EXTENSION: &str = "jpg";

/// Errors that can occur during normalization.
#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("Unsupported image format: {0}")]
    UnsupportedFormat(String),

    #[error("Failed to decode image: {0}")]
    Decode(String),

    #[error("Failed to encode image: {0}")]
    Encode(String),
}

/// Source media types accepted for normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFormat {
    Jpeg,
    Png,
}

impl SourceFormat {
    /// Parse a client-declared mime type against the allow-list.
    ///
    /// Parameters such as `; charset=...` are ignored. `image/jpg` is accepted
    /// because browsers still send it.
    pub fn from_declared_mime(mime: &str) -> Result<Self, NormalizeError> {
        let essence = mime
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();

        match essence.as_str() {
            "image/jpeg" | "image/jpg" => Ok(SourceFormat::Jpeg),
            "image/png" => Ok(SourceFormat::Png),
            _ => Err(NormalizeError::UnsupportedFormat(mime.to_string())),
        }
    }

    /// Detect the format from the payload's magic bytes.
    pub fn sniff(raw: &[u8]) -> Result<Self, NormalizeError> {
        match image::guess_format(raw) {
            Ok(ImageFormat::Jpeg) => Ok(SourceFormat::Jpeg),
            Ok(ImageFormat::Png) => Ok(SourceFormat::Png),
            Ok(other) => Err(NormalizeError::UnsupportedFormat(format!("{other:?}").to_lowercase())),
            Err(e) => Err(NormalizeError::Decode(e.to_string())),
        }
    }

    fn image_format(self) -> ImageFormat {
        match self {
            SourceFormat::Jpeg => ImageFormat::Jpeg,
            SourceFormat::Png => ImageFormat::Png,
        }
    }
}

/// A normalized image ready for the object store.
#[derive(Debug, Clone)]
pub struct NormalizedImage {
    /// JPEG encoded payload
    pub data: Bytes,
    /// Output width in pixels
    pub width: u32,
    /// Output height in pixels
    pub height: u32,
    /// Width of the decoded source
    pub original_width: u32,
    /// Height of the decoded source
    pub original_height: u32,
}

impl NormalizedImage {
    pub fn content_type(&self) -> &'static str {
        NORMALIZED_CONTENT_TYPE
    }
}

/// Decode, bound and re-encode an image.
///
/// Output is always JPEG. The aspect ratio is kept, and images already
/// narrower than the bound keep their dimensions.
///
/// This is CPU bound; async callers should run it on a blocking thread.
#[instrument(skip(raw), fields(input_bytes = raw.len()))]
pub fn normalize(raw: &[u8], bounds: NormalizeBounds) -> Result<NormalizedImage, NormalizeError> {
    let format = SourceFormat::sniff(raw)?;

    let decoded = image::load_from_memory_with_format(raw, format.image_format())
        .map_err(|e| NormalizeError::Decode(e.to_string()))?;
    let (original_width, original_height) = decoded.dimensions();

    let resized = downscale(decoded, bounds.max_width);
    let (width, height) = resized.dimensions();

    let data = encode_jpeg(&resized, bounds.quality)?;

    debug!(
        original_width,
        original_height,
        width,
        height,
        output_bytes = data.len(),
        "Image normalized"
    );

    Ok(NormalizedImage {
        data,
        width,
        height,
        original_width,
        original_height,
    })
}

/// Compute output dimensions for a source of `width`x`height` bounded by `max_width`.
pub fn target_dimensions(width: u32, height: u32, max_width: u32) -> (u32, u32) {
    if width <= max_width {
        return (width, height);
    }
    let scaled = (u64::from(height) * u64::from(max_width) + u64::from(width) / 2) / u64::from(width);
    (max_width, scaled.max(1) as u32)
}

fn downscale(image: DynamicImage, max_width: u32) -> DynamicImage {
    let (width, height) = image.dimensions();
    let (target_width, target_height) = target_dimensions(width, height, max_width);
    if (target_width, target_height) == (width, height) {
        return image;
    }
    image.resize_exact(target_width, target_height, FilterType::Triangle)
}

fn encode_jpeg(image: &DynamicImage, quality: u8) -> Result<Bytes, NormalizeError> {
    // JPEG has no alpha channel
    let rgb = image.to_rgb8();
    let mut buffer = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100));
    encoder
        .encode_image(&rgb)
        .map_err(|e| NormalizeError::Encode(e.to_string()))?;
    Ok(Bytes::from(buffer))
}
