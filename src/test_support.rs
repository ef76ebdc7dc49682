//! Shared fixtures for unit tests

use crate::engine::{Engine, EngineOptions};
use crate::handle::{ImageHandle, Lease};
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use std::io::Cursor;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

/// A colourful RGB test card.
pub fn gradient(width: u32, height: u32) -> DynamicImage {
    let img = RgbImage::from_fn(width, height, |x, y| {
        Rgb([
            (x * 255 / width.max(1)) as u8,
            (y * 255 / height.max(1)) as u8,
            ((x + y) % 256) as u8,
        ])
    });
    DynamicImage::ImageRgb8(img)
}

pub fn jpeg_bytes(image: &DynamicImage) -> Vec<u8> {
    encode_with(image, ImageFormat::Jpeg)
}

pub fn png_bytes(image: &DynamicImage) -> Vec<u8> {
    encode_with(image, ImageFormat::Png)
}

pub fn webp_bytes(image: &DynamicImage) -> Vec<u8> {
    encode_with(image, ImageFormat::WebP)
}

fn encode_with(image: &DynamicImage, format: ImageFormat) -> Vec<u8> {
    let mut out = Cursor::new(Vec::new());
    image.write_to(&mut out, format).unwrap();
    out.into_inner()
}

/// Wraps a raster in a handle that is not tracked by any engine.
pub fn handle_for(image: DynamicImage) -> ImageHandle {
    ImageHandle::new(image, Lease::acquire(&Arc::new(AtomicUsize::new(0))))
}

pub fn engine_options() -> EngineOptions {
    EngineOptions {
        worker_threads: 2,
        jpeg_quality: 80,
        max_resolution: crate::encoder::WEBP_MAX_DIMENSION,
    }
}

/// A freshly initialized engine.
pub fn ready_engine() -> Arc<Engine> {
    let engine = Arc::new(Engine::new(engine_options()));
    engine.initialize(tracing::info_span!("engine")).unwrap();
    engine
}
