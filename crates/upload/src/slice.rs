//! Re-pagination of long strip pages.
//!
//! Pages of a common width are stacked top to bottom into one tall strip,
//! which is then cut into parts at most `ratio × width` pixels tall. Only the
//! last part can be shorter.

use crate::error::{ErrorKind, Rejection, Result};
use exn::OptionExt;
use image::RgbImage;
use image::imageops;

/// Row ranges `(top, height)` of each part of a strip `total_height` rows
/// tall.
///
/// There are `ceil(total_height / (ratio × width))` parts.
pub fn part_bounds(total_height: u32, width: u32, ratio: u32) -> Vec<(u32, u32)> {
    let part = u64::from(width) * u64::from(ratio);
    let total = u64::from(total_height);
    if total == 0 {
        return vec![];
    }
    if part == 0 {
        return vec![(0, total_height)];
    }
    (0..total.div_ceil(part))
        .map(|i| {
            let top = part * i;
            let bottom = total.min(top + part);
            // Both fit: `top < total <= u32::MAX`.
            (top as u32, (bottom - top) as u32)
        })
        .collect()
}

/// Stack `images` in order and cut the result into parts.
///
/// Rejects an empty selection, images of differing widths, and a strip of
/// more than `max_pixels` pixels.
pub fn cut(images: &[RgbImage], ratio: u32, max_pixels: u64) -> Result<Vec<RgbImage>> {
    let Some(width) = images.first().map(RgbImage::width) else {
        exn::bail!(ErrorKind::from(Rejection::EmptySelection));
    };
    if images.iter().any(|image| image.width() != width) {
        exn::bail!(ErrorKind::from(Rejection::WidthMismatch));
    }
    let total_height = images
        .iter()
        .try_fold(0u32, |total, image| total.checked_add(image.height()))
        .ok_or_raise(|| ErrorKind::Image)?;
    let pixels = u64::from(width) * u64::from(total_height);
    if pixels > max_pixels {
        exn::bail!(ErrorKind::from(Rejection::SliceTooLarge(pixels, max_pixels)));
    }

    let mut strip = RgbImage::new(width, total_height);
    let mut top = 0i64;
    for image in images {
        imageops::replace(&mut strip, image, 0, top);
        top += i64::from(image.height());
    }

    let parts = part_bounds(total_height, width, ratio)
        .into_iter()
        .map(|(top, height)| imageops::crop_imm(&strip, 0, top, width, height).to_image())
        .collect::<Vec<_>>();
    tracing::debug!(inputs = images.len(), parts = parts.len(), width, total_height, "Sliced pages");
    Ok(parts)
}
