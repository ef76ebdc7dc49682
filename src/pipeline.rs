//! Decode and pixel transforms
//!
//! Every transform takes ownership of its input handle and returns a new one.
//! These functions do not check engine state; callers go through [`Engine`].
//!
//! [`Engine`]: crate::engine::Engine

use crate::encoder::OutputFormat;
use crate::error::PipelineError;
use crate::handle::ImageHandle;
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat, ImageReader};
use std::io::Cursor;

/// Encoded formats accepted by [`decode`].
pub const SUPPORTED_FORMATS: [ImageFormat; 3] =
    [ImageFormat::Jpeg, ImageFormat::Png, ImageFormat::WebP];

/// Largest accepted blur sigma; cost grows with the kernel radius.
pub const MAX_BLUR_SIGMA: f32 = 10.0;

/// Parameters for one pass through the pipeline.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TransformRequest {
    /// Target `(width, height)` for a cover-and-crop resize.
    pub resize: Option<(u32, u32)>,
    pub grayscale: bool,
    /// Gaussian blur sigma.
    pub blur: Option<f32>,
    pub format: OutputFormat,
}

impl TransformRequest {
    pub fn new(format: OutputFormat) -> Self {
        Self {
            format,
            ..Self::default()
        }
    }

    /// Checks parameters before any engine work is scheduled.
    pub fn validate(&self, max_dimension: u32) -> Result<(), PipelineError> {
        if let Some((width, height)) = self.resize {
            validate_dimensions(width, height)?;
            if width > max_dimension || height > max_dimension {
                return Err(PipelineError::InvalidParameter(format!(
                    "width and height must be at most {max_dimension}"
                )));
            }
        }

        if let Some(sigma) = self.blur {
            validate_sigma(sigma)?;
        }

        Ok(())
    }
}

fn validate_dimensions(width: u32, height: u32) -> Result<(), PipelineError> {
    if width == 0 || height == 0 {
        return Err(PipelineError::InvalidParameter(format!(
            "width and height must be positive, got {width}x{height}"
        )));
    }
    Ok(())
}

fn validate_sigma(sigma: f32) -> Result<(), PipelineError> {
    if !sigma.is_finite() || sigma <= 0.0 || sigma > MAX_BLUR_SIGMA {
        return Err(PipelineError::InvalidParameter(format!(
            "blur sigma must be greater than 0 and at most {MAX_BLUR_SIGMA}, got {sigma}"
        )));
    }
    Ok(())
}

/// Decode an encoded buffer into a raster.
pub(crate) fn decode(buffer: &[u8], max_resolution: u32) -> Result<DynamicImage, PipelineError> {
    if buffer.is_empty() {
        return Err(PipelineError::EmptyInput);
    }

    let format = image::guess_format(buffer).map_err(|_| PipelineError::UnrecognizedFormat)?;
    if !SUPPORTED_FORMATS.contains(&format) {
        return Err(PipelineError::UnrecognizedFormat);
    }

    // Header first, so oversized images are rejected before allocating.
    let (width, height) = ImageReader::with_format(Cursor::new(buffer), format)
        .into_dimensions()
        .map_err(|e| PipelineError::Decode(e.to_string()))?;

    if width > max_resolution || height > max_resolution {
        return Err(PipelineError::ImageTooLarge {
            width,
            height,
            max: max_resolution,
        });
    }

    let mut reader = ImageReader::with_format(Cursor::new(buffer), format);
    reader.no_limits();
    reader
        .decode()
        .map_err(|e| PipelineError::Decode(e.to_string()))
}

/// Centred region of a `src_width x src_height` source with the aspect ratio
/// of `width x height`, as `(x, y, crop_width, crop_height)`.
fn cover_crop(src_width: u32, src_height: u32, width: u32, height: u32) -> (u32, u32, u32, u32) {
    let (sw, sh) = (u64::from(src_width), u64::from(src_height));
    let (w, h) = (u64::from(width), u64::from(height));

    let crop_width = sw.min(sh * w / h).max(1);
    let crop_height = sh.min(sw * h / w).max(1);

    // Both fit the source, so the narrowing is lossless.
    let crop_width = crop_width as u32;
    let crop_height = crop_height as u32;
    (
        (src_width - crop_width) / 2,
        (src_height - crop_height) / 2,
        crop_width,
        crop_height,
    )
}

/// Crop the centre to the target aspect ratio, then scale to exactly
/// `width x height`. Peak memory stays within source plus output.
pub(crate) fn resize(
    handle: ImageHandle,
    width: u32,
    height: u32,
) -> Result<ImageHandle, PipelineError> {
    validate_dimensions(width, height)?;

    let image = handle.image().ok_or(PipelineError::InvalidImage {
        operation: "resizing image",
    })?;
    let (x, y, crop_width, crop_height) = cover_crop(image.width(), image.height(), width, height);
    let resized = image
        .crop_imm(x, y, crop_width, crop_height)
        .resize_exact(width, height, FilterType::Lanczos3);

    Ok(handle.replace(resized))
}

/// Convert to luminance, keeping alpha when present.
pub(crate) fn grayscale(handle: ImageHandle) -> Result<ImageHandle, PipelineError> {
    let image = handle.image().ok_or(PipelineError::InvalidImage {
        operation: "changing image colorspace",
    })?;
    let gray = image.grayscale();

    Ok(handle.replace(gray))
}

pub(crate) fn blur(handle: ImageHandle, sigma: f32) -> Result<ImageHandle, PipelineError> {
    validate_sigma(sigma)?;

    let image = handle.image().ok_or(PipelineError::InvalidImage {
        operation: "applying blur",
    })?;
    let blurred = image.blur(sigma);

    Ok(handle.replace(blurred))
}
