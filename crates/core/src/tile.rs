//! Overlapping tile partition of the source image.

use crate::image::{PixelImage, CHANNELS};

/// One rectangular sub-region of the source image with an owned pixel copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tile {
    /// Origin in source coordinates.
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
    /// RGBA8 row-major, `w * h * 4` bytes.
    pub data: Vec<u8>,
}

/// Partition `image` into overlapping tiles in row-major order.
///
/// Steps with stride `tile_size - overlap` on both axes; the last tile in each
/// row/column is clipped to the image bounds and may be smaller than
/// `tile_size`. The union of all tiles covers the image exactly, and interior
/// neighbors overlap by exactly `overlap` pixels.
///
/// Caller must ensure `overlap < tile_size` (see `PipelineConfig::validate`).
pub fn split_tiles(image: &PixelImage, tile_size: u32, overlap: u32) -> Vec<Tile> {
    debug_assert!(overlap < tile_size);
    let stride = (tile_size - overlap) as usize;
    let pw = image.width() as usize;
    let ph = image.height() as usize;
    let src = image.data();

    let mut tiles = Vec::new();
    let mut y = 0usize;
    while y < ph {
        let h = tile_size.min((ph - y) as u32) as usize;
        let mut x = 0usize;
        while x < pw {
            let w = tile_size.min((pw - x) as u32) as usize;

            let mut data = vec![0u8; w * h * CHANNELS];
            for row in 0..h {
                let src_off = ((y + row) * pw + x) * CHANNELS;
                let dst_off = row * w * CHANNELS;
                data[dst_off..dst_off + w * CHANNELS]
                    .copy_from_slice(&src[src_off..src_off + w * CHANNELS]);
            }

            tiles.push(Tile {
                x: x as u32,
                y: y as u32,
                w: w as u32,
                h: h as u32,
                data,
            });

            x += stride;
        }
        y += stride;
    }

    tiles
}
