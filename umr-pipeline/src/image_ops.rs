//! Snapshot image helpers: media type sniffing and rotation

use image::{DynamicImage, ImageFormat};
use std::borrow::Cow;
use std::io::Cursor;

use crate::error::PipelineError;
use crate::types::Rotation;

/// Media type assumed when the bytes cannot be identified
pub const FALLBACK_MEDIA_TYPE: &str = "image/jpeg";

/// Sniff the media type of image bytes
pub fn media_type(bytes: &[u8]) -> &'static str {
    infer::get(bytes)
        .filter(|kind| kind.matcher_type() == infer::MatcherType::Image)
        .map(|kind| kind.mime_type())
        .unwrap_or(FALLBACK_MEDIA_TYPE)
}

/// File extension for archived image bytes
pub fn extension(bytes: &[u8]) -> &'static str {
    infer::get(bytes)
        .filter(|kind| kind.matcher_type() == infer::MatcherType::Image)
        .map(|kind| kind.extension())
        .unwrap_or("jpg")
}

/// Rotate image bytes clockwise, re-encoding in the source format
///
/// `Rotation::None` returns the input untouched.
pub fn rotate(bytes: &[u8], rotation: Rotation) -> Result<Cow<'_, [u8]>, PipelineError> {
    if rotation == Rotation::None {
        return Ok(Cow::Borrowed(bytes));
    }

    let format = image::guess_format(bytes)
        .map_err(|e| PipelineError::Image(format!("unrecognised image format: {}", e)))?;
    let img = image::load_from_memory_with_format(bytes, format)
        .map_err(|e| PipelineError::Image(format!("decode failed: {}", e)))?;

    let rotated = match rotation {
        Rotation::Cw90 => img.rotate90(),
        Rotation::Cw180 => img.rotate180(),
        Rotation::Cw270 => img.rotate270(),
        Rotation::None => img,
    };

    // Only JPEG and PNG encoders are built in
    let (output, out_format) = match format {
        ImageFormat::Png => (rotated, ImageFormat::Png),
        _ => (DynamicImage::ImageRgb8(rotated.to_rgb8()), ImageFormat::Jpeg),
    };

    let mut buf = Vec::with_capacity(bytes.len());
    output
        .write_to(&mut Cursor::new(&mut buf), out_format)
        .map_err(|e| PipelineError::Image(format!("encode failed: {}", e)))?;

    Ok(Cow::Owned(buf))
}
