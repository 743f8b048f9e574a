// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Image loading, resizing, and base64-encoding utilities for relay.
//!
//! This crate converts local image files into data URLs that can be embedded
//! directly in multimodal LLM API requests.
//!
//! ## Size limits
//! Images wider than [`MAX_WIDTH`] or taller than [`MAX_HEIGHT`] are downscaled
//! while preserving aspect ratio before encoding.  This keeps request payloads
//! reasonable and aligns with provider limits (most cap uploads at ~20 MB).
//!
//! ## Caching
//! [`load_image`] transparently caches encoded results in an in-process
//! LRU cache keyed on the SHA-256 of the raw file bytes.  Repeated calls with
//! the same file (or different paths to identical content) avoid the decode →
//! resize → re-encode work.  The cache holds up to [`CACHE_CAPACITY`] entries.

use std::io::Cursor;
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::{Mutex, OnceLock};

use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use sha2::Digest as _;

pub use error::ImageError;

mod error;

// ─── LRU image cache ──────────────────────────────────────────────────────────

/// Maximum number of encoded images held in the in-process LRU cache.
pub const CACHE_CAPACITY: usize = 32;

type CacheKey = [u8; 32]; // SHA-256 digest

fn image_cache() -> &'static Mutex<lru::LruCache<CacheKey, EncodedImage>> {
    static CACHE: OnceLock<Mutex<lru::LruCache<CacheKey, EncodedImage>>> = OnceLock::new();
    CACHE.get_or_init(|| {
        Mutex::new(lru::LruCache::new(
            NonZeroUsize::new(CACHE_CAPACITY).unwrap(),
        ))
    })
}

/// Maximum image width in pixels before downscaling.
pub const MAX_WIDTH: u32 = 2000;
/// Maximum image height in pixels before downscaling.
pub const MAX_HEIGHT: u32 = 2000;
/// Maximum encoded payload size before the quality/scale ladders kick in.
pub const MAX_BYTES: usize = 4 * 1024 * 1024 + 512 * 1024; // 4.5 MiB
/// Default JPEG quality used for the initial PNG-vs-JPEG comparison.
pub const DEFAULT_JPEG_QUALITY: u8 = 80;
/// Quality levels tried, in order, once the default-quality encoding is over [`MAX_BYTES`].
const JPEG_QUALITY_LADDER: &[u8] = &[85, 70, 55, 40];
/// Scale factors tried, in order, once every quality level at full scale is still over budget.
/// The quality ladder is retried at each scale.
const SCALE_LADDER: &[f64] = &[1.0, 0.75, 0.5, 0.35, 0.25];

/// An image that has been loaded, (optionally) resized, and encoded as base64.
#[derive(Debug, Clone)]
pub struct EncodedImage {
    /// MIME type, e.g. `"image/png"` or `"image/jpeg"`.
    pub mime_type: String,
    /// Raw bytes of the (possibly re-encoded) image.
    pub bytes: Vec<u8>,
    /// True if the source was downscaled and/or quality-reduced to fit
    /// [`MAX_WIDTH`]/[`MAX_HEIGHT`]/[`MAX_BYTES`].
    pub was_resized: bool,
}

impl EncodedImage {
    /// Return a data URL: `data:<mime>;base64,<b64>`.
    pub fn into_data_url(self) -> String {
        let encoded = B64.encode(&self.bytes);
        format!("data:{};base64,{}", self.mime_type, encoded)
    }

    /// Return the base64-encoded string only (no `data:…;base64,` prefix).
    pub fn to_base64(&self) -> String {
        B64.encode(&self.bytes)
    }
}

/// Load an image from `path`, resize if needed, and return an [`EncodedImage`].
///
/// Results are transparently cached by content hash: if the same image bytes
/// have been loaded before (even from a different path) the cached result is
/// returned immediately, avoiding redundant decode → resize → re-encode work.
///
/// PNG images are re-encoded as PNG; everything else is re-encoded as JPEG.
pub fn load_image(path: &Path) -> Result<EncodedImage, ImageError> {
    let raw = std::fs::read(path).map_err(|e| ImageError::Io(path.display().to_string(), e))?;

    // Content-addressed cache lookup.
    let key: CacheKey = sha2::Sha256::digest(&raw).into();
    if let Ok(mut cache) = image_cache().lock() {
        if let Some(cached) = cache.get(&key) {
            return Ok(cached.clone());
        }
    }

    let result = encode_image_bytes(&raw, path)?;

    if let Ok(mut cache) = image_cache().lock() {
        cache.put(key, result.clone());
    }

    Ok(result)
}

/// Decode, resize, and re-encode raw image bytes.
///
/// Strategy, applied in order until the result fits within [`MAX_BYTES`]:
///
/// 1. Scale to fit [`MAX_WIDTH`]×[`MAX_HEIGHT`] (preserving aspect ratio; a
///    no-op if the source already fits).
/// 2. Encode as both PNG and JPEG (at [`DEFAULT_JPEG_QUALITY`]); keep
///    whichever is smaller.
/// 3. If still over [`MAX_BYTES`], re-encode as JPEG at each quality in
///    [`JPEG_QUALITY_LADDER`] until one fits.
/// 4. If no quality at the current scale fits, downscale further through
///    [`SCALE_LADDER`] and repeat the quality ladder at each scale.
///
/// If every combination is still over budget, the smallest encoding found
/// (lowest quality, smallest scale) is returned rather than failing — a
/// caller that needs a hard cap should check `bytes.len()` itself.
///
/// `hint_path` is used only for format detection (extension fallback) and
/// error messages; the bytes themselves are the source of truth.
fn encode_image_bytes(raw: &[u8], hint_path: &Path) -> Result<EncodedImage, ImageError> {
    let fmt = image::guess_format(raw)
        .or_else(|_| {
            let ext = hint_path
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or("")
                .to_lowercase();
            match ext.as_str() {
                "jpg" | "jpeg" => Ok(image::ImageFormat::Jpeg),
                "png" => Ok(image::ImageFormat::Png),
                "gif" => Ok(image::ImageFormat::Gif),
                "webp" => Ok(image::ImageFormat::WebP),
                _ => Err(image::ImageError::Unsupported(
                    image::error::UnsupportedError::from_format_and_kind(
                        image::error::ImageFormatHint::Unknown,
                        image::error::UnsupportedErrorKind::Format(
                            image::error::ImageFormatHint::Unknown,
                        ),
                    ),
                )),
            }
        })
        .map_err(|_| ImageError::UnsupportedFormat(hint_path.display().to_string()))?;

    let original_dims_over_limit = {
        let probe = image::load_from_memory_with_format(raw, fmt)
            .map_err(|e| ImageError::Decode(hint_path.display().to_string(), e.to_string()))?;
        probe.width() > MAX_WIDTH || probe.height() > MAX_HEIGHT
    };

    let img = image::load_from_memory_with_format(raw, fmt)
        .map_err(|e| ImageError::Decode(hint_path.display().to_string(), e.to_string()))?;
    let fitted = scale_to_fit(img, 1.0);

    // Step 2: PNG vs JPEG(default quality), pick smaller.
    let png_bytes = encode_png(&fitted)?;
    let jpeg_bytes = encode_jpeg(&fitted, DEFAULT_JPEG_QUALITY)?;
    let (mut best_mime, mut best_bytes) = if png_bytes.len() <= jpeg_bytes.len() {
        ("image/png", png_bytes)
    } else {
        ("image/jpeg", jpeg_bytes)
    };
    let mut resized = original_dims_over_limit;

    if best_bytes.len() <= MAX_BYTES {
        return Ok(EncodedImage { mime_type: best_mime.into(), bytes: best_bytes, was_resized: resized });
    }

    // Steps 3/4: JPEG quality ladder, repeated at each scale in SCALE_LADDER.
    // Re-decode fresh at each scale so repeated resizes don't compound loss.
    'scales: for &scale in SCALE_LADDER {
        let scaled = if scale == 1.0 {
            fitted.clone()
        } else {
            let base = image::load_from_memory_with_format(raw, fmt)
                .map_err(|e| ImageError::Decode(hint_path.display().to_string(), e.to_string()))?;
            scale_to_fit(base, scale)
        };
        if scale != 1.0 {
            resized = true;
        }
        for &quality in JPEG_QUALITY_LADDER {
            let candidate = encode_jpeg(&scaled, quality)?;
            if candidate.len() < best_bytes.len() {
                best_mime = "image/jpeg";
                best_bytes = candidate.clone();
                resized = true;
            }
            if candidate.len() <= MAX_BYTES {
                best_mime = "image/jpeg";
                best_bytes = candidate;
                resized = true;
                break 'scales;
            }
        }
    }

    Ok(EncodedImage { mime_type: best_mime.into(), bytes: best_bytes, was_resized: resized })
}

fn encode_png(img: &image::DynamicImage) -> Result<Vec<u8>, ImageError> {
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, image::ImageFormat::Png)
        .map_err(|e| ImageError::Encode(e.to_string()))?;
    Ok(out.into_inner())
}

fn encode_jpeg(img: &image::DynamicImage, quality: u8) -> Result<Vec<u8>, ImageError> {
    let mut out = Cursor::new(Vec::new());
    let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, quality);
    img.write_with_encoder(encoder)
        .map_err(|e| ImageError::Encode(e.to_string()))?;
    Ok(out.into_inner())
}

/// Scale `img` to fit `MAX_WIDTH * factor` × `MAX_HEIGHT * factor`, preserving
/// aspect ratio. A no-op if the image already fits.
fn scale_to_fit(img: image::DynamicImage, factor: f64) -> image::DynamicImage {
    let (w, h) = (img.width(), img.height());
    let max_w = (MAX_WIDTH as f64 * factor).max(1.0);
    let max_h = (MAX_HEIGHT as f64 * factor).max(1.0);
    if (w as f64) <= max_w && (h as f64) <= max_h {
        return img;
    }
    let ratio_w = max_w / w as f64;
    let ratio_h = max_h / h as f64;
    let ratio = ratio_w.min(ratio_h);
    let new_w = ((w as f64 * ratio).round() as u32).max(1);
    let new_h = ((h as f64 * ratio).round() as u32).max(1);
    img.resize(new_w, new_h, image::imageops::FilterType::Lanczos3)
}

/// Parse a data URL and return `(mime_type, raw_bytes)`.
///
/// Accepts `data:<mime>;base64,<data>` format.
pub fn parse_data_url(data_url: &str) -> Result<(String, Vec<u8>), ImageError> {
    let rest = data_url
        .strip_prefix("data:")
        .ok_or_else(|| ImageError::InvalidDataUrl(data_url.to_string()))?;
    let (meta, b64) = rest
        .split_once(',')
        .ok_or_else(|| ImageError::InvalidDataUrl(data_url.to_string()))?;
    let mime = meta.strip_suffix(";base64").unwrap_or(meta).to_string();
    let bytes = B64
        .decode(b64)
        .map_err(|e| ImageError::Base64(e.to_string()))?;
    Ok((mime, bytes))
}

/// Return whether the given file extension belongs to a supported image format.
pub fn is_image_extension(ext: &str) -> bool {
    matches!(
        ext.to_lowercase().as_str(),
        "png" | "jpg" | "jpeg" | "gif" | "webp" | "bmp" | "tiff" | "tif"
    )
}

// ─── Tests ────────────────────────────────────────────────────────────────────
