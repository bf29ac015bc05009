//! Raster image transform: grayscale and bounded downscale.
//!
//! * Color images get a contrast boost, then become single-channel luma
//!   (standard luma weights; transparent pixels are flattened onto white).
//! * Images whose longest side exceeds the profile maximum are downscaled
//!   with an area-averaging filter, preserving aspect ratio, then lightly
//!   unsharpened.
//! * The result is re-encoded in its original format so hrefs and media
//!   types in the manifest stay valid.
//!
//! Formats other than PNG and JPEG, and data that fails to decode, are
//! reported back as [`ImageOutcome::Unsupported`] and left alone.

use crate::config::OptimizationProfile;
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, GenericImageView, ImageFormat, Rgb, RgbImage};
use std::io::Cursor;
use tracing::debug;

/// What happened to one image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageOutcome {
    /// Already gray and within bounds; bytes stay as they are.
    Unchanged,
    Rewritten {
        data: Vec<u8>,
        converted_to_gray: bool,
        /// New dimensions when the image was downscaled.
        resized_to: Option<(u32, u32)>,
    },
    /// Not a format this transform handles; the reason is for the warning.
    Unsupported(String),
}

/// Dimensions after fitting the longest side into `max`.
pub fn fit_within(width: u32, height: u32, max: u32) -> (u32, u32) {
    let longest = width.max(height);
    if longest <= max {
        return (width, height);
    }
    let scale = max as f64 / longest as f64;
    let w = ((width as f64 * scale).round() as u32).clamp(1, max);
    let h = ((height as f64 * scale).round() as u32).clamp(1, max);
    (w, h)
}

fn is_gray(img: &DynamicImage) -> bool {
    matches!(
        img,
        DynamicImage::ImageLuma8(_) | DynamicImage::ImageLuma16(_)
    )
}

fn has_alpha(img: &DynamicImage) -> bool {
    img.color().has_alpha()
}

/// Composite onto white so transparent regions do not turn black.
fn flatten_on_white(img: &DynamicImage) -> DynamicImage {
    let rgba = img.to_rgba8();
    let (w, h) = rgba.dimensions();
    let mut out = RgbImage::new(w, h);
    for (x, y, px) in rgba.enumerate_pixels() {
        let a = u32::from(px[3]);
        let blend = |c: u8| ((u32::from(c) * a + 255 * (255 - a) + 127) / 255) as u8;
        out.put_pixel(x, y, Rgb([blend(px[0]), blend(px[1]), blend(px[2])]));
    }
    DynamicImage::ImageRgb8(out)
}

/// `adjust_contrast` takes a percentage; convert a multiplicative factor to it.
fn contrast_percent(factor: f32) -> f32 {
    100.0 * (factor.sqrt() - 1.0)
}

/// Apply the profile's image rules to one encoded image.
pub fn transform_image(data: &[u8], profile: &OptimizationProfile) -> ImageOutcome {
    let format = match image::guess_format(data) {
        Ok(f @ (ImageFormat::Png | ImageFormat::Jpeg)) => f,
        Ok(other) => return ImageOutcome::Unsupported(format!("unsupported format {other:?}")),
        Err(e) => return ImageOutcome::Unsupported(format!("unrecognised image data: {e}")),
    };
    let img = match image::load_from_memory_with_format(data, format) {
        Ok(img) => img,
        Err(e) => return ImageOutcome::Unsupported(format!("decode failed: {e}")),
    };

    let (width, height) = img.dimensions();
    let target = fit_within(width, height, profile.max_image_dimension);
    let needs_gray = profile.grayscale && !is_gray(&img);
    let needs_resize = target != (width, height);
    if !needs_gray && !needs_resize {
        return ImageOutcome::Unchanged;
    }

    let mut img = img;
    if needs_gray {
        if has_alpha(&img) {
            img = flatten_on_white(&img);
        }
        if (profile.contrast_boost - 1.0).abs() > f32::EPSILON {
            img = img.adjust_contrast(contrast_percent(profile.contrast_boost));
        }
        img = DynamicImage::ImageLuma8(img.to_luma8());
    } else if matches!(img, DynamicImage::ImageLuma16(_)) {
        img = DynamicImage::ImageLuma8(img.to_luma8());
    }

    if needs_resize {
        img = img.thumbnail_exact(target.0, target.1).unsharpen(1.0, 3);
    }

    let encoded = match encode(&img, format, profile.jpeg_quality) {
        Ok(bytes) => bytes,
        Err(e) => return ImageOutcome::Unsupported(format!("re-encode failed: {e}")),
    };
    debug!(
        "Image {}x{} → {}x{} ({} → {} bytes)",
        width,
        height,
        target.0,
        target.1,
        data.len(),
        encoded.len()
    );

    ImageOutcome::Rewritten {
        data: encoded,
        converted_to_gray: needs_gray,
        resized_to: needs_resize.then_some(target),
    }
}

fn encode(img: &DynamicImage, format: ImageFormat, quality: u8) -> image::ImageResult<Vec<u8>> {
    let mut buf = Vec::new();
    match format {
        ImageFormat::Jpeg => {
            // JPEG has no alpha channel.
            let img = if has_alpha(img) {
                flatten_on_white(img)
            } else {
                img.clone()
            };
            img.write_with_encoder(JpegEncoder::new_with_quality(&mut buf, quality))?;
        }
        _ => img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)?,
    }
    Ok(buf)
}
