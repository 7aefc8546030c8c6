//! Image concatenation for backends that accept a single image per task.

use std::io::Cursor;

use image::{DynamicImage, GenericImage, ImageFormat, RgbImage};

use crate::error::{Error, Result};
use crate::task::ImagePayload;

/// Stack images top to bottom into one JPEG.
///
/// The canvas is as wide as the widest image and as tall as all of them
/// together; narrower images are left-aligned on a black background.
pub fn concat_vertical(images: &[ImagePayload]) -> Result<Vec<u8>> {
    if images.is_empty() {
        return Err(Error::Codec("nothing to concatenate".to_string()));
    }

    let decoded = images
        .iter()
        .map(|payload| {
            let bytes = payload.to_bytes()?;
            image::load_from_memory(&bytes)
                .map(|img| img.to_rgb8())
                .map_err(|e| Error::Codec(format!("failed to decode image: {}", e)))
        })
        .collect::<Result<Vec<RgbImage>>>()?;

    let width = decoded.iter().map(|img| img.width()).max().unwrap_or(0);
    let height = decoded.iter().map(|img| img.height()).sum();

    let mut canvas = RgbImage::new(width, height);
    let mut y = 0;
    for img in &decoded {
        canvas
            .copy_from(img, 0, y)
            .map_err(|e| Error::Codec(format!("failed to paste image: {}", e)))?;
        y += img.height();
    }

    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(canvas)
        .write_to(&mut out, ImageFormat::Jpeg)
        .map_err(|e| Error::Codec(format!("failed to encode JPEG: {}", e)))?;
    Ok(out.into_inner())
}
