//! Layer extraction from base + overlay bundles

use image::DynamicImage;
use std::io::{Cursor, Read};
use tracing::debug;

use crate::error::UnsupportedAsset;

/// Largest single member we are willing to inflate
const MAX_LAYER_BYTES: u64 = 64 * 1024 * 1024;

/// One image member of a bundle
#[derive(Debug)]
pub(crate) struct Layer {
    pub name: String,
    pub bytes: Vec<u8>,
}

/// A decoded layer
#[derive(Debug)]
pub(crate) struct DecodedLayer {
    pub name: String,
    pub image: DynamicImage,
}

/// Read the image members of a ZIP bundle.
///
/// Directories, `__MACOSX/` resource forks, dotfiles and members that do not
/// look like an image are ignored.
pub(crate) fn read_layers(data: &[u8]) -> Result<Vec<Layer>, UnsupportedAsset> {
    let mut archive = zip::ZipArchive::new(Cursor::new(data))
        .map_err(|e| UnsupportedAsset::new(format!("unreadable archive: {}", e)))?;

    let mut layers = Vec::new();
    for i in 0..archive.len() {
        let mut file = archive
            .by_index(i)
            .map_err(|e| UnsupportedAsset::new(format!("unreadable archive member {}: {}", i, e)))?;

        if file.is_dir() {
            continue;
        }

        let path = file.name().to_string();
        let name = path.rsplit('/').next().unwrap_or(&path).to_string();
        if path.starts_with("__MACOSX/") || name.starts_with('.') {
            debug!(member = %path, "Ignoring archive metadata");
            continue;
        }

        if file.size() > MAX_LAYER_BYTES {
            return Err(UnsupportedAsset::new(format!(
                "archive member {} is {} bytes, limit is {}",
                path,
                file.size(),
                MAX_LAYER_BYTES
            )));
        }

        let mut bytes = Vec::with_capacity(file.size() as usize);
        (&mut file)
            .take(MAX_LAYER_BYTES)
            .read_to_end(&mut bytes)
            .map_err(|e| UnsupportedAsset::new(format!("failed to inflate {}: {}", path, e)))?;

        if image::guess_format(&bytes).is_err() {
            debug!(member = %path, "Ignoring non-image archive member");
            continue;
        }

        debug!(member = %path, bytes = bytes.len(), "Extracted layer");
        layers.push(Layer { name, bytes });
    }

    Ok(layers)
}

/// Decide which of two layers is the base and which is the overlay.
///
/// A layer whose name mentions "overlay" wins; otherwise the only layer with
/// an alpha channel does. The overlay must carry alpha.
pub(crate) fn split_base_overlay(
    mut layers: Vec<DecodedLayer>,
) -> Result<(DecodedLayer, DecodedLayer), UnsupportedAsset> {
    if layers.len() != 2 {
        return Err(UnsupportedAsset::new(format!(
            "expected a base and an overlay layer, found {} image layer(s)",
            layers.len()
        )));
    }

    let named: Vec<usize> = layers
        .iter()
        .enumerate()
        .filter(|(_, l)| l.name.to_lowercase().contains("overlay"))
        .map(|(i, _)| i)
        .collect();
    let with_alpha: Vec<usize> = layers
        .iter()
        .enumerate()
        .filter(|(_, l)| l.image.color().has_alpha())
        .map(|(i, _)| i)
        .collect();

    let overlay_idx = match (named.as_slice(), with_alpha.as_slice()) {
        ([i], _) => *i,
        (_, [i]) => *i,
        _ => {
            return Err(UnsupportedAsset::new(
                "cannot tell the base layer from the overlay",
            ))
        },
    };

    let overlay = layers.remove(overlay_idx);
    let base = layers.remove(0);

    if !overlay.image.color().has_alpha() {
        return Err(UnsupportedAsset::new(format!(
            "overlay layer {} has no alpha channel",
            overlay.name
        )));
    }

    Ok((base, overlay))
}
