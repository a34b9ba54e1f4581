//! Resize and compression, both fail-open.
//!
//! Only [`AssetFormat::is_reencodable`] formats are touched. Any decode or
//! encode error, a blown time budget, or an output that is not smaller falls
//! back to the bytes that went in.

use std::io::Cursor;
use std::time::Duration;

use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType as PngFilterType, PngEncoder};
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat, ImageResult};
use tracing::{debug, warn};

use super::format::AssetFormat;

#[derive(Debug, Clone)]
pub struct OptimiseSettings {
    /// Longest edge after resizing, in pixels.
    pub max_dimension: u32,
    pub compress_timeout: Duration,
    pub jpeg_quality: u8,
}

impl Default for OptimiseSettings {
    fn default() -> Self {
        Self {
            max_dimension: 2048,
            compress_timeout: Duration::from_secs(5),
            jpeg_quality: 82,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Optimised {
    pub bytes: Vec<u8>,
    /// Bytes shaved off by compression; 0 on every fallback path.
    pub bytes_saved: u64,
    pub resized: bool,
    pub compressed: bool,
}

fn image_format(format: AssetFormat) -> Option<ImageFormat> {
    match format {
        AssetFormat::Png => Some(ImageFormat::Png),
        AssetFormat::Jpeg => Some(ImageFormat::Jpeg),
        _ => None,
    }
}

fn decode(bytes: &[u8], format: ImageFormat) -> ImageResult<DynamicImage> {
    image::load_from_memory_with_format(bytes, format)
}

/// Downscales to fit `max_dimension`. `Ok(None)` when already small enough.
pub fn resize_to_fit(
    bytes: &[u8],
    format: AssetFormat,
    max_dimension: u32,
) -> ImageResult<Option<Vec<u8>>> {
    let Some(fmt) = image_format(format) else {
        return Ok(None);
    };
    let img = decode(bytes, fmt)?;
    if img.width() <= max_dimension && img.height() <= max_dimension {
        return Ok(None);
    }
    let resized = img.resize(max_dimension, max_dimension, FilterType::Lanczos3);
    let mut out = Vec::new();
    resized.write_to(&mut Cursor::new(&mut out), fmt)?;
    Ok(Some(out))
}

/// Re-encodes with stronger settings. Caller decides whether the result is worth keeping.
pub fn compress(bytes: &[u8], format: AssetFormat, jpeg_quality: u8) -> ImageResult<Option<Vec<u8>>> {
    let Some(fmt) = image_format(format) else {
        return Ok(None);
    };
    let img = decode(bytes, fmt)?;
    let mut out = Vec::new();
    match format {
        AssetFormat::Jpeg => {
            let rgb = img.to_rgb8();
            JpegEncoder::new_with_quality(&mut out, jpeg_quality).encode_image(&rgb)?;
        }
        _ => {
            let encoder =
                PngEncoder::new_with_quality(&mut out, CompressionType::Best, PngFilterType::Adaptive);
            img.write_with_encoder(encoder)?;
        }
    }
    Ok(Some(out))
}

/// Resize then compress, never failing. Runs the CPU work on the blocking pool.
pub async fn optimise(bytes: Vec<u8>, format: AssetFormat, settings: &OptimiseSettings) -> Optimised {
    if !format.is_reencodable() {
        return Optimised {
            bytes,
            bytes_saved: 0,
            resized: false,
            compressed: false,
        };
    }

    let max_dimension = settings.max_dimension;
    let input = bytes.clone();
    let (bytes, resized) =
        match tokio::task::spawn_blocking(move || resize_to_fit(&input, format, max_dimension)).await {
            Ok(Ok(Some(resized))) => (resized, true),
            Ok(Ok(None)) => (bytes, false),
            Ok(Err(e)) => {
                warn!(error = %e, ?format, "[ASSET] Resize failed, keeping original bytes");
                (bytes, false)
            }
            Err(e) => {
                warn!(error = %e, ?format, "[ASSET] Resize task aborted, keeping original bytes");
                (bytes, false)
            }
        };

    let quality = settings.jpeg_quality;
    let input = bytes.clone();
    let attempt = tokio::time::timeout(
        settings.compress_timeout,
        tokio::task::spawn_blocking(move || compress(&input, format, quality)),
    )
    .await;

    let fallback = |bytes: Vec<u8>, reason: &str| {
        debug!(reason, ?format, "[ASSET] Compression skipped");
        Optimised {
            bytes,
            bytes_saved: 0,
            resized,
            compressed: false,
        }
    };

    match attempt {
        Ok(Ok(Ok(Some(compressed)))) if compressed.len() < bytes.len() => {
            let saved = (bytes.len() - compressed.len()) as u64;
            Optimised {
                bytes: compressed,
                bytes_saved: saved,
                resized,
                compressed: true,
            }
        }
        Ok(Ok(Ok(_))) => fallback(bytes, "no size reduction"),
        Ok(Ok(Err(e))) => {
            warn!(error = %e, "[ASSET] Compression failed");
            fallback(bytes, "encoder error")
        }
        Ok(Err(e)) => {
            warn!(error = %e, "[ASSET] Compression task aborted");
            fallback(bytes, "task aborted")
        }
        Err(_) => {
            warn!(timeout_ms = settings.compress_timeout.as_millis() as u64, "[ASSET] Compression timed out");
            fallback(bytes, "timeout")
        }
    }
}
