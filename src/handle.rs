//! Exclusively owned handles to decoded rasters
//!
//! A handle is move-only. Transforms consume their input and hand back a new
//! handle; the old raster is released inside the call. Handles created by the
//! engine hold a lease on its live-handle counter until they are dropped.

use image::DynamicImage;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Colour layout of a decoded raster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Colorspace {
    Rgb,
    Rgba,
    Luma,
    LumaAlpha,
}

impl Colorspace {
    fn of(image: &DynamicImage) -> Self {
        let color = image.color();
        match (color.has_color(), color.has_alpha()) {
            (true, false) => Colorspace::Rgb,
            (true, true) => Colorspace::Rgba,
            (false, false) => Colorspace::Luma,
            (false, true) => Colorspace::LumaAlpha,
        }
    }

}

impl fmt::Display for Colorspace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Colorspace::Rgb => "rgb",
            Colorspace::Rgba => "rgba",
            Colorspace::Luma => "luma",
            Colorspace::LumaAlpha => "luma-alpha",
        };
        f.write_str(name)
    }
}

/// Counts a handle against the engine that created it.
#[derive(Debug)]
pub(crate) struct Lease(Arc<AtomicUsize>);

impl Lease {
    pub(crate) fn acquire(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(Arc::clone(counter))
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// An owned reference to a decoded image.
#[derive(Debug)]
pub struct ImageHandle {
    image: Option<DynamicImage>,
    comment: Option<String>,
    lease: Option<Lease>,
}

impl ImageHandle {
    /// The imageless sentinel. Every engine operation on it fails with a
    /// "no image data" error.
    pub fn empty() -> Self {
        Self {
            image: None,
            comment: None,
            lease: None,
        }
    }

    pub(crate) fn new(image: DynamicImage, lease: Lease) -> Self {
        Self {
            image: Some(image),
            comment: None,
            lease: Some(lease),
        }
    }

    pub fn dimensions(&self) -> Option<(u32, u32)> {
        self.image.as_ref().map(|img| (img.width(), img.height()))
    }

    pub fn colorspace(&self) -> Option<Colorspace> {
        self.image.as_ref().map(Colorspace::of)
    }

    /// Stamps a free-form comment on the handle. Pixels are untouched; the
    /// comment follows the handle through transforms and lands in JPEG output.
    pub fn set_user_comment(&mut self, comment: impl Into<String>) {
        self.comment = Some(comment.into());
    }

    pub fn user_comment(&self) -> Option<&str> {
        self.comment.as_deref()
    }

    pub(crate) fn image(&self) -> Option<&DynamicImage> {
        self.image.as_ref()
    }

    /// Retires `self` and returns a handle over `image` carrying the same
    /// comment and lease.
    pub(crate) fn replace(self, image: DynamicImage) -> ImageHandle {
        let ImageHandle {
            image: previous,
            comment,
            lease,
        } = self;
        drop(previous);

        ImageHandle {
            image: Some(image),
            comment,
            lease,
        }
    }

    /// Releases the raster now.
    pub fn retire(self) {
        drop(self);
    }
}
