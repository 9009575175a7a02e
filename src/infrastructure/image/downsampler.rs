//! Decoding with on-the-fly downsampling.
//!
//! Decoding is CPU bound; async callers go through [`decode_async`], which runs the
//! work on the blocking pool.
//!
//! JPEG sources are decoded through IDCT scaling (1/2, 1/4 or 1/8), so a bounded
//! request never materializes the full-resolution bitmap. Other formats decode fully
//! and are shrunk afterwards.

use std::io::Cursor;

use bytes::Bytes;
use image::{
    DynamicImage, GrayImage, ImageDecoder, ImageFormat, ImageReader, RgbImage,
    metadata::Orientation,
};
use tracing::{debug, trace};

use crate::domain::ports::{CacheError, CacheResult};

/// JPEG quality used when re-encoding opaque images for the disk tier.
const FALLBACK_JPEG_QUALITY: u8 = 90;

/// Decodes `bytes`, bounding the longest edge by `max_dimension` when given.
///
/// The bounded path applies EXIF orientation and uses a scaled decode for JPEG. If it
/// fails the bytes are decoded plainly; only when both fail is a
/// [`CacheError::DecodeError`] returned. Images are never upscaled.
///
/// # Errors
/// Returns `DecodeError` if the bytes are not a supported image.
pub fn decode(bytes: &[u8], max_dimension: Option<u32>) -> CacheResult<DynamicImage> {
    let Some(max) = max_dimension.filter(|&m| m > 0) else {
        return decode_full(bytes);
    };

    if let Some(img) = decode_jpeg_scaled(bytes, max) {
        return Ok(fit_within(img, max));
    }

    match decode_oriented(bytes) {
        Ok(img) => Ok(fit_within(img, max)),
        Err(e) => {
            debug!(error = %e, "Thumbnail decode failed, falling back to full decode");
            decode_full(bytes).map(|img| fit_within(img, max))
        }
    }
}

/// Runs [`decode`] on the blocking thread pool.
///
/// # Errors
/// Returns `DecodeError` if decoding fails or the decode task panics.
pub async fn decode_async(bytes: Bytes, max_dimension: Option<u32>) -> CacheResult<DynamicImage> {
    tokio::task::spawn_blocking(move || decode(&bytes, max_dimension))
        .await
        .map_err(|e| CacheError::DecodeError(format!("Decode task panicked: {e}")))?
}

/// Re-encodes a decoded image for persistence: PNG if it carries alpha, JPEG otherwise.
///
/// # Errors
/// Returns `DecodeError` if encoding fails.
pub fn encode_fallback(image: &DynamicImage) -> CacheResult<Vec<u8>> {
    let mut buf = Cursor::new(Vec::new());
    if image.color().has_alpha() {
        image
            .write_to(&mut buf, ImageFormat::Png)
            .map_err(|e| CacheError::DecodeError(format!("Failed to encode PNG: {e}")))?;
    } else {
        let rgb = image.to_rgb8();
        let encoder =
            image::codecs::jpeg::JpegEncoder::new_with_quality(&mut buf, FALLBACK_JPEG_QUALITY);
        rgb.write_with_encoder(encoder)
            .map_err(|e| CacheError::DecodeError(format!("Failed to encode JPEG: {e}")))?;
    }
    Ok(buf.into_inner())
}

fn decode_oriented(bytes: &[u8]) -> image::ImageResult<DynamicImage> {
    let mut decoder = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()?
        .into_decoder()?;
    let orientation = decoder.orientation()?;
    let mut img = DynamicImage::from_decoder(decoder)?;
    img.apply_orientation(orientation);
    Ok(img)
}

/// Decodes a JPEG at the smallest IDCT scale that still covers the bounded size.
///
/// Returns `None` for non-JPEG input, unsupported pixel formats, or any decoder error,
/// leaving the caller to take the generic path.
fn decode_jpeg_scaled(bytes: &[u8], max: u32) -> Option<DynamicImage> {
    if image::guess_format(bytes).ok()? != ImageFormat::Jpeg {
        return None;
    }

    let mut decoder = jpeg_decoder::Decoder::new(Cursor::new(bytes));
    decoder.read_info().ok()?;
    let info = decoder.info()?;
    let (width, height) = (u32::from(info.width), u32::from(info.height));
    if width.max(height) <= max {
        return None;
    }

    let (target_w, target_h) = bounded_size(width, height, max);
    let (out_w, out_h) = decoder
        .scale(clamp_u16(target_w), clamp_u16(target_h))
        .ok()?;
    let pixels = decoder.decode().ok()?;
    let (out_w, out_h) = (u32::from(out_w), u32::from(out_h));

    let mut img = match decoder.info()?.pixel_format {
        jpeg_decoder::PixelFormat::RGB24 => {
            DynamicImage::ImageRgb8(RgbImage::from_raw(out_w, out_h, pixels)?)
        }
        jpeg_decoder::PixelFormat::L8 => {
            DynamicImage::ImageLuma8(GrayImage::from_raw(out_w, out_h, pixels)?)
        }
        _ => return None,
    };
    trace!(width, height, scaled_width = out_w, scaled_height = out_h, "Scaled JPEG decode");

    img.apply_orientation(jpeg_orientation(bytes));
    Some(img)
}

/// Reads EXIF orientation from the headers without decoding pixels.
fn jpeg_orientation(bytes: &[u8]) -> Orientation {
    ImageReader::with_format(Cursor::new(bytes), ImageFormat::Jpeg)
        .into_decoder()
        .and_then(|mut decoder| decoder.orientation())
        .unwrap_or(Orientation::NoTransforms)
}

/// Size of `width` x `height` shrunk so the longest edge is `max`.
fn bounded_size(width: u32, height: u32, max: u32) -> (u32, u32) {
    let scale = f64::from(max) / f64::from(width.max(height));
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let fit = |edge: u32| ((f64::from(edge) * scale).round() as u32).max(1);
    (fit(width), fit(height))
}

fn clamp_u16(value: u32) -> u16 {
    u16::try_from(value).unwrap_or(u16::MAX)
}

fn decode_full(bytes: &[u8]) -> CacheResult<DynamicImage> {
    image::load_from_memory(bytes)
        .map_err(|e| CacheError::DecodeError(format!("Failed to decode image: {e}")))
}

/// Shrinks `img` so its longest edge is at most `max`, keeping the aspect ratio.
fn fit_within(img: DynamicImage, max: u32) -> DynamicImage {
    if img.width().max(img.height()) <= max {
        return img;
    }
    let thumb = img.thumbnail(max, max);
    trace!(
        from_width = img.width(),
        from_height = img.height(),
        width = thumb.width(),
        height = thumb.height(),
        "Downsampled image"
    );
    thumb
}


#[cfg(test)]
mod tests {
    use super::fixtures::{jpeg, png};
    use super::*;
    use test_case::test_case;

    #[test_case(1200, 1800, 280, (187, 280) ; "portrait_cover")]
    #[test_case(1800, 1200, 280, (280, 187) ; "landscape_cover")]
    #[test_case(600, 600, 100, (100, 100) ; "square")]
    fn test_downsample_bounds_longest_edge(w: u32, h: u32, max: u32, expected: (u32, u32)) {
        let img = decode(&png(w, h), Some(max)).unwrap();
        assert!(img.width().max(img.height()) <= max);
        assert!(img.width().abs_diff(expected.0) <= 1);
        assert!(img.height().abs_diff(expected.1) <= 1);
    }

    #[test]
    fn test_jpeg_bounded_decode_is_scaled() {
        let scaled = decode_jpeg_scaled(&jpeg(1600, 800), 100).unwrap();
        assert_eq!((scaled.width(), scaled.height()), (200, 100));

        let img = decode(&jpeg(1600, 800), Some(100)).unwrap();
        assert_eq!((img.width(), img.height()), (100, 50));
    }

    #[test_case(4000, 2000, 280 ; "eighth_is_floor")]
    #[test_case(1200, 1800, 280 ; "portrait_cover")]
    #[test_case(700, 500, 300 ; "half")]
    fn test_jpeg_intermediate_stays_small(w: u32, h: u32, max: u32) {
        let scaled = decode_jpeg_scaled(&jpeg(w, h), max).unwrap();
        let longest = scaled.width().max(scaled.height());
        assert!(longest >= max);
        assert!(longest <= (2 * max).max(w.max(h).div_ceil(8)));
    }

    #[test]
    fn test_scaled_path_skips_small_and_non_jpeg() {
        assert!(decode_jpeg_scaled(&jpeg(64, 64), 100).is_none());
        assert!(decode_jpeg_scaled(&png(1600, 800), 100).is_none());
    }

    #[test]
    fn test_no_upscaling() {
        let img = decode(&png(64, 48), Some(280)).unwrap();
        assert_eq!((img.width(), img.height()), (64, 48));
    }

    #[test_case(None ; "absent")]
    #[test_case(Some(0) ; "zero")]
    fn test_full_resolution_without_hint(max: Option<u32>) {
        let img = decode(&jpeg(640, 960), max).unwrap();
        assert_eq!((img.width(), img.height()), (640, 960));
    }

    #[test]
    fn test_corrupt_bytes_fail_with_decode_error() {
        let err = decode(b"definitely not an image", Some(100)).unwrap_err();
        assert!(err.is_decode());

        let err = decode(b"", None).unwrap_err();
        assert!(err.is_decode());
    }

    #[test]
    fn test_truncated_png_fails() {
        let mut bytes = png(200, 200);
        bytes.truncate(bytes.len() / 3);
        assert!(decode(&bytes, Some(50)).is_err());
    }

    #[tokio::test]
    async fn test_decode_async() {
        let img = decode_async(Bytes::from(png(500, 250)), Some(100))
            .await
            .unwrap();
        assert_eq!(img.width(), 100);
        assert_eq!(img.height(), 50);
    }

    #[test]
    fn test_encode_fallback_formats() {
        let opaque = encode_fallback(&DynamicImage::new_rgb8(20, 10)).unwrap();
        assert_eq!(image::guess_format(&opaque).unwrap(), ImageFormat::Jpeg);

        let translucent = encode_fallback(&DynamicImage::new_rgba8(20, 10)).unwrap();
        assert_eq!(image::guess_format(&translucent).unwrap(), ImageFormat::Png);

        let round_trip = decode(&translucent, None).unwrap();
        assert_eq!((round_trip.width(), round_trip.height()), (20, 10));
    }
}
