//! JPEG and WebP serialization of image handles

use crate::error::{EncodeCause, PipelineError};
use crate::handle::ImageHandle;
use bytes::Bytes;
use image::codecs::webp::WebPEncoder;
use image::{DynamicImage, ExtendedColorType};
use serde::{Deserialize, Serialize};
use std::fmt;
use turbojpeg::{Compressor, Image, PixelFormat, Subsamp};

/// Largest width or height a WebP bitstream can describe.
pub const WEBP_MAX_DIMENSION: u32 = 16383;

/// JPEG COM segments carry at most this many payload bytes.
const MAX_COMMENT_LEN: usize = u16::MAX as usize - 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    #[serde(alias = "jpg")]
    Jpeg,
    Webp,
}

impl OutputFormat {
    pub fn content_type(self) -> &'static str {
        match self {
            OutputFormat::Jpeg => "image/jpeg",
            OutputFormat::Webp => "image/webp",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Jpeg => "jpg",
            OutputFormat::Webp => "webp",
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" => Some(OutputFormat::Jpeg),
            "webp" => Some(OutputFormat::Webp),
            _ => None,
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputFormat::Jpeg => f.write_str("jpeg"),
            OutputFormat::Webp => f.write_str("webp"),
        }
    }
}

/// Final output of the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedBuffer {
    format: OutputFormat,
    data: Bytes,
}

impl EncodedBuffer {
    pub fn format(&self) -> OutputFormat {
        self.format
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn into_bytes(self) -> Bytes {
        self.data
    }
}

fn encode_error(format: OutputFormat, cause: impl fmt::Display) -> PipelineError {
    PipelineError::Encode {
        format,
        cause: EncodeCause::Encoder(cause.to_string()),
    }
}

fn require_image(handle: &ImageHandle, format: OutputFormat) -> Result<&DynamicImage, PipelineError> {
    handle.image().ok_or(PipelineError::Encode {
        format,
        cause: EncodeCause::NoImageData,
    })
}

/// Encode with libjpeg-turbo. Luma images become single-component JPEGs;
/// alpha is dropped.
pub(crate) fn encode_jpeg(handle: &ImageHandle, quality: u8) -> Result<EncodedBuffer, PipelineError> {
    let image = require_image(handle, OutputFormat::Jpeg)?;
    let width = image.width() as usize;
    let height = image.height() as usize;

    let mut compressor =
        Compressor::new().map_err(|e| encode_error(OutputFormat::Jpeg, e))?;
    compressor.set_quality(i32::from(quality));

    let compressed = if image.color().has_color() {
        compressor.set_subsamp(Subsamp::Sub2x2); // 4:2:0 chroma subsampling
        let rgb = image.to_rgb8();
        let pixels = Image {
            pixels: rgb.as_raw().as_slice(),
            width,
            pitch: width * 3,
            height,
            format: PixelFormat::RGB,
        };
        compressor.compress_to_vec(pixels)
    } else {
        compressor.set_subsamp(Subsamp::Gray);
        let luma = image.to_luma8();
        let pixels = Image {
            pixels: luma.as_raw().as_slice(),
            width,
            pitch: width,
            height,
            format: PixelFormat::GRAY,
        };
        compressor.compress_to_vec(pixels)
    };
    let jpeg = compressed.map_err(|e| encode_error(OutputFormat::Jpeg, e))?;

    let data = match handle.user_comment() {
        Some(comment) => insert_comment(&jpeg, comment),
        None => jpeg,
    };

    Ok(EncodedBuffer {
        format: OutputFormat::Jpeg,
        data: Bytes::from(data),
    })
}

/// Encode as lossless WebP.
pub(crate) fn encode_webp(handle: &ImageHandle) -> Result<EncodedBuffer, PipelineError> {
    let image = require_image(handle, OutputFormat::Webp)?;
    let (width, height) = (image.width(), image.height());
    if width > WEBP_MAX_DIMENSION || height > WEBP_MAX_DIMENSION {
        return Err(PipelineError::InvalidParameter(format!(
            "webp output is limited to {WEBP_MAX_DIMENSION}x{WEBP_MAX_DIMENSION}, got {width}x{height}"
        )));
    }
    let color = image.color();

    let mut out = Vec::new();
    let encoder = WebPEncoder::new_lossless(&mut out);
    let result = match (color.has_color(), color.has_alpha()) {
        (true, true) => encoder.encode(image.to_rgba8().as_raw(), width, height, ExtendedColorType::Rgba8),
        (true, false) => encoder.encode(image.to_rgb8().as_raw(), width, height, ExtendedColorType::Rgb8),
        (false, true) => encoder.encode(
            image.to_luma_alpha8().as_raw(),
            width,
            height,
            ExtendedColorType::La8,
        ),
        (false, false) => encoder.encode(image.to_luma8().as_raw(), width, height, ExtendedColorType::L8),
    };
    result.map_err(|e| encode_error(OutputFormat::Webp, e))?;

    Ok(EncodedBuffer {
        format: OutputFormat::Webp,
        data: Bytes::from(out),
    })
}

/// Insert a COM segment after SOI (and after the JFIF APP0 segment when present).
fn insert_comment(jpeg: &[u8], comment: &str) -> Vec<u8> {
    let mut end = comment.len().min(MAX_COMMENT_LEN);
    while !comment.is_char_boundary(end) {
        end -= 1;
    }
    let payload = &comment.as_bytes()[..end];

    let mut at = 2;
    if jpeg.len() >= 6 && jpeg[2..4] == [0xFF, 0xE0] {
        let app0_len = u16::from_be_bytes([jpeg[4], jpeg[5]]) as usize;
        at = (4 + app0_len).min(jpeg.len());
    }
    if jpeg.len() < at {
        return jpeg.to_vec();
    }

    let segment_len = (payload.len() + 2) as u16;
    let mut out = Vec::with_capacity(jpeg.len() + payload.len() + 4);
    out.extend_from_slice(&jpeg[..at]);
    out.extend_from_slice(&[0xFF, 0xFE]);
    out.extend_from_slice(&segment_len.to_be_bytes());
    out.extend_from_slice(payload);
    out.extend_from_slice(&jpeg[at..]);
    out
}
