//! Pixel ↔ tensor conversion.
//!
//! Tensors are planar `[1, 3, H, W]` f32 in R,G,B order, normalized per
//! [`Normalization`]. A tensor never aliases a pixel buffer; each conversion
//! owns its output.

use anyhow::{bail, Result};
use ndarray::Array4;

use crate::config::Normalization;
use crate::image::CHANNELS;
use crate::tile::Tile;

/// Convert a tile's RGBA pixels to a normalized NCHW tensor.
pub fn encode_tile(tile: &Tile, normalize: Normalization) -> Array4<f32> {
    encode_rgba(&tile.data, tile.w as usize, tile.h as usize, normalize)
}

/// Convert an RGBA buffer to a normalized `[1, 3, h, w]` tensor.
pub fn encode_rgba(data: &[u8], w: usize, h: usize, normalize: Normalization) -> Array4<f32> {
    let hw = h * w;

    let mut tensor = Array4::<f32>::zeros((1, 3, h, w));
    // zeros() yields a C-contiguous array
    let slice = tensor.as_slice_mut().unwrap();

    for c in 0..3 {
        for y in 0..h {
            for x in 0..w {
                let v = data[(y * w + x) * CHANNELS + c] as f32;
                slice[c * hw + y * w + x] = match normalize {
                    Normalization::ZeroToOne => v / 255.0,
                    Normalization::MinusOneToOne => (v / 255.0) * 2.0 - 1.0,
                };
            }
        }
    }

    tensor
}

/// Convert planar NCHW f32 model output back to RGBA pixels.
///
/// Inverts the normalization, clamps every value to [0, 1] before scaling to
/// [0, 255] (model outputs drift slightly out of range), and decodes NaN as
/// 0. Alpha is always fully opaque.
pub fn decode_tensor(
    values: &[f32],
    out_w: usize,
    out_h: usize,
    normalize: Normalization,
) -> Result<Vec<u8>> {
    let hw = out_w * out_h;
    if values.len() < 3 * hw {
        bail!(
            "output tensor too small: expected at least {} (3x{}x{}), got {}",
            3 * hw,
            out_h,
            out_w,
            values.len()
        );
    }

    let mut rgba = vec![0u8; hw * CHANNELS];
    for i in 0..hw {
        let r = denormalize(values[i], normalize);
        let g = denormalize(values[hw + i], normalize);
        let b = denormalize(values[2 * hw + i], normalize);
        let px = i * CHANNELS;
        rgba[px] = r;
        rgba[px + 1] = g;
        rgba[px + 2] = b;
        rgba[px + 3] = 255;
    }
    Ok(rgba)
}

fn denormalize(v: f32, normalize: Normalization) -> u8 {
    if v.is_nan() {
        return 0;
    }
    let unit = match normalize {
        Normalization::ZeroToOne => v,
        Normalization::MinusOneToOne => (v + 1.0) / 2.0,
    };
    // infinities saturate through the clamp
    (unit.clamp(0.0, 1.0) * 255.0).round() as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient_tile(w: u32, h: u32) -> Tile {
        let mut data = Vec::with_capacity((w * h) as usize * CHANNELS);
        for y in 0..h {
            for x in 0..w {
                data.extend_from_slice(&[
                    ((x * 255) / w.max(1)) as u8,
                    ((y * 255) / h.max(1)) as u8,
                    ((x + y) % 256) as u8,
                    255,
                ]);
            }
        }
        Tile {
            x: 0,
            y: 0,
            w,
            h,
            data,
        }
    }

    #[test]
    fn encode_layout_is_channel_planar_rgb() {
        let tile = Tile {
            x: 0,
            y: 0,
            w: 2,
            h: 1,
            data: vec![10, 20, 30, 255, 40, 50, 60, 255],
        };
        let tensor = encode_tile(&tile, Normalization::ZeroToOne);
        assert_eq!(tensor.shape(), &[1, 3, 1, 2]);
        let flat = tensor.as_slice().unwrap();
        // R plane, then G plane, then B plane
        assert!((flat[0] - 10.0 / 255.0).abs() < 1e-6);
        assert!((flat[1] - 40.0 / 255.0).abs() < 1e-6);
        assert!((flat[2] - 20.0 / 255.0).abs() < 1e-6);
        assert!((flat[4] - 30.0 / 255.0).abs() < 1e-6);
    }

    #[test]
    fn roundtrip_within_one_unit_for_both_normalizations() {
        let tile = gradient_tile(13, 9);
        for normalize in [Normalization::ZeroToOne, Normalization::MinusOneToOne] {
            let tensor = encode_tile(&tile, normalize);
            let decoded = decode_tensor(
                tensor.as_slice().unwrap(),
                tile.w as usize,
                tile.h as usize,
                normalize,
            )
            .expect("decode");
            for (a, b) in tile.data.iter().zip(decoded.iter()) {
                assert!(
                    (*a as i32 - *b as i32).abs() <= 1,
                    "roundtrip drifted more than one unit: {a} vs {b} ({normalize:?})"
                );
            }
        }
    }

    #[test]
    fn decode_clamps_out_of_range_and_zeroes_nan() {
        let values = vec![
            1.5, -0.25, // R plane
            f32::NAN, f32::INFINITY, // G plane
            f32::NEG_INFINITY, 0.5, // B plane
        ];
        let rgba = decode_tensor(&values, 2, 1, Normalization::ZeroToOne).expect("decode");
        assert_eq!(rgba[0], 255); // clamped high
        assert_eq!(rgba[4], 0); // clamped low
        assert_eq!(rgba[1], 0); // NaN → 0
        assert_eq!(rgba[5], 255); // +inf saturates up
        assert_eq!(rgba[2], 0); // -inf saturates down
        assert_eq!(rgba[6], 128);
        assert_eq!(rgba[3], 255); // alpha opaque
        assert_eq!(rgba[7], 255);
    }

    #[test]
    fn decode_rejects_short_buffers() {
        assert!(decode_tensor(&[0.0; 11], 2, 2, Normalization::ZeroToOne).is_err());
    }
}
