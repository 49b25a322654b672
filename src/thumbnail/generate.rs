//! Thumbnail generation: decode, fit to a box, re-encode.

use image::codecs::jpeg::JpegEncoder;
use image::codecs::webp::WebPEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ImageError, ImageFormat, ImageReader, Rgba, RgbaImage};
use serde::{Deserialize, Serialize};
use std::io::{self, Cursor};
use std::path::Path;
use std::str::FromStr;

use crate::error::{ThumbnailError, ThumbnailResult};
use crate::index::is_supported_image;

/// Turns a source image into encoded thumbnail bytes.
///
/// Implementations are called concurrently from several workers on
/// different inputs and must not share mutable state between calls.
pub trait Generator: Send + Sync + 'static {
    fn generate(&self, source: &Path, width: u32, height: u32) -> ThumbnailResult<Vec<u8>>;
}

/// Encoding of generated thumbnails
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ThumbnailFormat {
    /// Lossless WebP
    #[default]
    Webp,
    Png,
    Jpeg,
}

impl ThumbnailFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ThumbnailFormat::Webp => "webp",
            ThumbnailFormat::Png => "png",
            ThumbnailFormat::Jpeg => "jpg",
        }
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            ThumbnailFormat::Webp => "image/webp",
            ThumbnailFormat::Png => "image/png",
            ThumbnailFormat::Jpeg => "image/jpeg",
        }
    }
}

impl FromStr for ThumbnailFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "webp" => Ok(ThumbnailFormat::Webp),
            "png" => Ok(ThumbnailFormat::Png),
            "jpg" | "jpeg" => Ok(ThumbnailFormat::Jpeg),
            other => Err(format!("unknown thumbnail format {other:?}")),
        }
    }
}

/// The production generator, backed by the `image` crate
#[derive(Debug, Clone, Copy)]
pub struct ImageGenerator {
    format: ThumbnailFormat,
    /// JPEG quality (1-100); ignored by lossless formats
    quality: u8,
}

impl ImageGenerator {
    pub fn new(format: ThumbnailFormat, quality: u8) -> Self {
        Self {
            format,
            quality: quality.clamp(1, 100),
        }
    }

    pub fn format(&self) -> ThumbnailFormat {
        self.format
    }

    fn encode(&self, img: &DynamicImage, source: &Path) -> ThumbnailResult<Vec<u8>> {
        let mut buffer = Cursor::new(Vec::new());

        let written = match self.format {
            ThumbnailFormat::Png => img.write_to(&mut buffer, ImageFormat::Png),
            // The WebP encoder only takes 8-bit RGB(A)
            ThumbnailFormat::Webp => DynamicImage::ImageRgba8(img.to_rgba8())
                .write_with_encoder(WebPEncoder::new_lossless(&mut buffer)),
            // JPEG has no alpha channel
            ThumbnailFormat::Jpeg => DynamicImage::ImageRgb8(img.to_rgb8())
                .write_with_encoder(JpegEncoder::new_with_quality(&mut buffer, self.quality)),
        };

        written.map_err(|e| ThumbnailError::Encode {
            path: source.to_path_buf(),
            reason: e.to_string(),
        })?;

        Ok(buffer.into_inner())
    }
}

impl Default for ImageGenerator {
    fn default() -> Self {
        Self::new(ThumbnailFormat::default(), 90)
    }
}

impl Generator for ImageGenerator {
    fn generate(&self, source: &Path, width: u32, height: u32) -> ThumbnailResult<Vec<u8>> {
        // Read the whole source up front so decoding never holds the file open
        let data = std::fs::read(source).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => ThumbnailError::NotFound(source.to_path_buf()),
            _ => decode_error(source, e),
        })?;

        let reader = ImageReader::new(Cursor::new(data.as_slice()))
            .with_guessed_format()
            .map_err(|e| decode_error(source, e))?;

        if reader.format().is_none() {
            // Garbage under an image extension is corrupt, not unsupported
            return Err(if is_supported_image(source) {
                decode_error(source, "unrecognized image data")
            } else {
                ThumbnailError::UnsupportedFormat(source.to_path_buf())
            });
        }

        let img = reader.decode().map_err(|e| match e {
            ImageError::Unsupported(_) => ThumbnailError::UnsupportedFormat(source.to_path_buf()),
            other => decode_error(source, other),
        })?;

        let thumbnail = fit_within(img, width, height);
        self.encode(&thumbnail, source)
    }
}

/// Shrink to fit inside `width` x `height`, keeping the aspect ratio.
/// Images already inside the box are returned untouched (never upscaled).
pub fn fit_within(img: DynamicImage, width: u32, height: u32) -> DynamicImage {
    if img.width() <= width && img.height() <= height {
        return img;
    }
    img.resize(width.max(1), height.max(1), FilterType::Lanczos3)
}

/// Flat grey stand-in for thumbnails that failed to generate
pub fn placeholder(width: u32, height: u32, format: ThumbnailFormat) -> ThumbnailResult<Vec<u8>> {
    let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(
        width.max(1),
        height.max(1),
        Rgba([200, 200, 200, 255]),
    ));
    ImageGenerator::new(format, 90).encode(&img, Path::new("<placeholder>"))
}

fn decode_error(source: &Path, reason: impl ToString) -> ThumbnailError {
    ThumbnailError::Decode {
        path: source.to_path_buf(),
        reason: reason.to_string(),
    }
}
