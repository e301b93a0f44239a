//! Pure-Rust bilinear resampling for passthrough tiles.

use crate::image::CHANNELS;

/// Bilinear interpolation resample for RGBA8 data.
pub fn resample_bilinear(
    src: &[u8],
    src_w: usize,
    src_h: usize,
    dst_w: usize,
    dst_h: usize,
) -> Vec<u8> {
    let mut dst = vec![0u8; dst_w * dst_h * CHANNELS];

    for dst_y in 0..dst_h {
        // Map destination pixel center to source coordinates
        let src_yf = (dst_y as f64 + 0.5) * src_h as f64 / dst_h as f64 - 0.5;
        let src_y0 = src_yf.floor().max(0.0) as usize;
        let src_y1 = (src_y0 + 1).min(src_h - 1);
        let fy = (src_yf - src_y0 as f64).clamp(0.0, 1.0);

        for dst_x in 0..dst_w {
            let src_xf = (dst_x as f64 + 0.5) * src_w as f64 / dst_w as f64 - 0.5;
            let src_x0 = src_xf.floor().max(0.0) as usize;
            let src_x1 = (src_x0 + 1).min(src_w - 1);
            let fx = (src_xf - src_x0 as f64).clamp(0.0, 1.0);

            let di = (dst_y * dst_w + dst_x) * CHANNELS;

            for c in 0..CHANNELS {
                let p00 = src[(src_y0 * src_w + src_x0) * CHANNELS + c] as f64;
                let p10 = src[(src_y0 * src_w + src_x1) * CHANNELS + c] as f64;
                let p01 = src[(src_y1 * src_w + src_x0) * CHANNELS + c] as f64;
                let p11 = src[(src_y1 * src_w + src_x1) * CHANNELS + c] as f64;

                let top = p00 * (1.0 - fx) + p10 * fx;
                let bot = p01 * (1.0 - fx) + p11 * fx;
                let val = top * (1.0 - fy) + bot * fy;

                dst[di + c] = val.round().clamp(0.0, 255.0) as u8;
            }
        }
    }

    dst
}
