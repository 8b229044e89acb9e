//! Asset reconstruction
//!
//! Turns a fetched payload into exactly one canonical image. Plain images are
//! decoded and re-encoded; base + overlay bundles are composited first. Every
//! result goes through the same encoder, so identical pixels always produce
//! identical bytes and therefore the same identity.

mod archive;
mod composite;

use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, RgbImage};
use tracing::debug;

use crate::error::UnsupportedAsset;
use crate::fetch::PayloadKind;
use archive::DecodedLayer;

/// JPEG quality of the canonical encoding. Changing it changes every identity.
pub const CANONICAL_JPEG_QUALITY: u8 = 95;

/// The canonical image for one entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconstructedImage {
    /// Canonical JPEG bytes
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Source layers merged: 1 for a plain image, 2 for a bundle
    pub layers: u8,
}

/// Flattens payloads into canonical images. CPU-bound; callers on an async
/// runtime should run it on a blocking thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct AssetReconstructor;

impl AssetReconstructor {
    pub fn new() -> Self {
        Self
    }

    pub fn reconstruct(
        &self,
        kind: PayloadKind,
        bytes: &[u8],
    ) -> Result<ReconstructedImage, UnsupportedAsset> {
        match kind {
            PayloadKind::Image => {
                let image = decode("payload", bytes)?;
                encode_canonical(image.to_rgb8(), 1)
            },
            PayloadKind::Archive => self.reconstruct_bundle(bytes),
        }
    }

    fn reconstruct_bundle(&self, bytes: &[u8]) -> Result<ReconstructedImage, UnsupportedAsset> {
        let layers = archive::read_layers(bytes)?
            .into_iter()
            .map(|layer| {
                decode(&layer.name, &layer.bytes).map(|image| DecodedLayer {
                    name: layer.name,
                    image,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let (base, overlay) = archive::split_base_overlay(layers)?;
        debug!(base = %base.name, overlay = %overlay.name, "Compositing layers");

        let flat = composite::composite(&base.image, &overlay.image);
        encode_canonical(flat, 2)
    }
}

fn decode(name: &str, bytes: &[u8]) -> Result<DynamicImage, UnsupportedAsset> {
    if bytes.is_empty() {
        return Err(UnsupportedAsset::new(format!("{} is empty", name)));
    }
    image::load_from_memory(bytes)
        .map_err(|e| UnsupportedAsset::new(format!("cannot decode {}: {}", name, e)))
}

fn encode_canonical(pixels: RgbImage, layers: u8) -> Result<ReconstructedImage, UnsupportedAsset> {
    let (width, height) = pixels.dimensions();
    if width == 0 || height == 0 {
        return Err(UnsupportedAsset::new("image has no pixels"));
    }

    let mut bytes = Vec::new();
    JpegEncoder::new_with_quality(&mut bytes, CANONICAL_JPEG_QUALITY)
        .encode_image(&pixels)
        .map_err(|e| UnsupportedAsset::new(format!("canonical encoding failed: {}", e)))?;

    Ok(ReconstructedImage {
        bytes,
        width,
        height,
        layers,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgb};
    use std::io::Cursor;

    fn png_bytes(image: &DynamicImage) -> Vec<u8> {
        let mut out = Cursor::new(Vec::new());
        image.write_to(&mut out, ImageFormat::Png).unwrap();
        out.into_inner()
    }

    #[test]
    fn test_plain_image_is_canonical_jpeg() {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(4, 3, Rgb([1, 2, 3])));
        let out = AssetReconstructor::new()
            .reconstruct(PayloadKind::Image, &png_bytes(&img))
            .unwrap();

        assert_eq!((out.width, out.height, out.layers), (4, 3, 1));
        assert!(out.bytes.starts_with(&[0xFF, 0xD8]));
    }

    #[test]
    fn test_encoding_is_deterministic() {
        let img = DynamicImage::ImageRgb8(RgbImage::from_fn(16, 16, |x, y| {
            Rgb([(x * 16) as u8, (y * 16) as u8, 7])
        }));
        let bytes = png_bytes(&img);
        let r = AssetReconstructor::new();
        let a = r.reconstruct(PayloadKind::Image, &bytes).unwrap();
        let b = r.reconstruct(PayloadKind::Image, &bytes).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_undecodable_payloads() {
        let r = AssetReconstructor::new();
        assert!(r.reconstruct(PayloadKind::Image, b"").is_err());
        assert!(r.reconstruct(PayloadKind::Image, b"<html>expired</html>").is_err());
        assert!(r.reconstruct(PayloadKind::Archive, b"PK\x03\x04garbage").is_err());
    }
}
