//! Alpha compositing of an overlay layer onto a base image

use image::imageops::{self, FilterType};
use image::{DynamicImage, RgbImage, RgbaImage};
use tracing::debug;

/// Source-over blend of `overlay` onto `base`, flattened to opaque RGB.
///
/// The overlay is resampled with Lanczos3 when its dimensions differ. Each
/// channel is `(overlay * a + base * (255 - a)) / 255`, rounded to nearest,
/// so a fully transparent overlay leaves the base untouched and a fully
/// opaque one replaces it.
pub(crate) fn composite(base: &DynamicImage, overlay: &DynamicImage) -> RgbImage {
    let base = base.to_rgb8();
    let (width, height) = base.dimensions();

    let overlay: RgbaImage = if overlay.width() == width && overlay.height() == height {
        overlay.to_rgba8()
    } else {
        debug!(
            from_width = overlay.width(),
            from_height = overlay.height(),
            width,
            height,
            "Resizing overlay to base"
        );
        imageops::resize(&overlay.to_rgba8(), width, height, FilterType::Lanczos3)
    };

    let mut out = base;
    for (dst, src) in out.pixels_mut().zip(overlay.pixels()) {
        let alpha = u32::from(src[3]);
        for c in 0..3 {
            dst[c] = blend(u32::from(src[c]), u32::from(dst[c]), alpha);
        }
    }
    out
}

#[inline]
fn blend(over: u32, under: u32, alpha: u32) -> u8 {
    ((over * alpha + under * (255 - alpha) + 127) / 255) as u8
}
