//! Post-merge passes: optional face restoration and a best-effort sharpen.

use anyhow::{Context, Result};
use tracing::debug;

use crate::config::Normalization;
use crate::image::{PixelImage, CHANNELS};
use crate::session::InferenceSession;
use crate::tensor;

pub const DEFAULT_SHARPEN_AMOUNT: f32 = 0.5;
pub const DEFAULT_SHARPEN_RADIUS: u32 = 1;

/// Run the secondary (face restoration) model once over the full merged
/// image. The output is decoded at the input's dimensions.
///
/// Callers treat any error here as recoverable: log, keep the pre-pass image.
pub fn restore_faces(
    session: &mut dyn InferenceSession,
    image: &PixelImage,
    normalize: Normalization,
) -> Result<PixelImage> {
    let w = image.width() as usize;
    let h = image.height() as usize;

    let input = tensor::encode_rgba(image.data(), w, h, normalize);
    let output = session.run(input).context("face restoration run failed")?;

    let values = output
        .as_slice()
        .map(|s| s.to_vec())
        .unwrap_or_else(|| output.iter().copied().collect());
    let rgba = tensor::decode_tensor(&values, w, h, normalize)?;
    PixelImage::from_rgba(image.width(), image.height(), rgba)
}

/// Unsharp-mask sharpen: composite a blurred copy back onto the original with
/// an additive blend at `amount` opacity.
///
/// Cosmetic and infallible by construction; `amount <= 0` or `radius == 0`
/// returns the input unchanged.
pub fn unsharp_mask(image: &PixelImage, amount: f32, radius: u32) -> PixelImage {
    if amount <= 0.0 || radius == 0 {
        return image.clone();
    }

    let w = image.width() as usize;
    let h = image.height() as usize;
    let blurred = box_blur(image.data(), w, h, radius as usize);

    let src = image.data();
    let mut out = vec![0u8; src.len()];
    for i in (0..src.len()).step_by(CHANNELS) {
        for c in 0..3 {
            let v = src[i + c] as f32 + blurred[i + c] as f32 * amount;
            out[i + c] = v.min(255.0) as u8;
        }
        out[i + 3] = 255;
    }

    debug!(amount, radius, "Applied unsharp mask");
    // buffer length is src.len() by construction
    PixelImage::from_rgba(image.width(), image.height(), out).unwrap()
}

/// Separable box blur over the RGB channels; alpha is left opaque.
fn box_blur(src: &[u8], w: usize, h: usize, radius: usize) -> Vec<u8> {
    let mut horizontal = vec![0u8; src.len()];
    for y in 0..h {
        for x in 0..w {
            let x0 = x.saturating_sub(radius);
            let x1 = (x + radius).min(w - 1);
            let count = (x1 - x0 + 1) as f32;
            let di = (y * w + x) * CHANNELS;
            for c in 0..3 {
                let mut sum = 0.0f32;
                for xx in x0..=x1 {
                    sum += src[(y * w + xx) * CHANNELS + c] as f32;
                }
                horizontal[di + c] = (sum / count).round() as u8;
            }
            horizontal[di + 3] = 255;
        }
    }

    let mut out = vec![0u8; src.len()];
    for y in 0..h {
        let y0 = y.saturating_sub(radius);
        let y1 = (y + radius).min(h - 1);
        let count = (y1 - y0 + 1) as f32;
        for x in 0..w {
            let di = (y * w + x) * CHANNELS;
            for c in 0..3 {
                let mut sum = 0.0f32;
                for yy in y0..=y1 {
                    sum += horizontal[(yy * w + x) * CHANNELS + c] as f32;
                }
                out[di + c] = (sum / count).round() as u8;
            }
            out[di + 3] = 255;
        }
    }

    out
}
