//! RGBA8 pixel buffer and the encoded-bytes boundary.
//!
//! One encoded format in each direction is enough to move pixels across the
//! worker boundary: inputs may be PNG or JPEG, outputs are encoded per
//! [`OutputFormat`].

use std::io::Cursor;

use anyhow::{Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::{ColorType, ImageEncoder};

use crate::config::OutputFormat;
use crate::error::StageError;

pub const CHANNELS: usize = 4;

/// Decoded image: 4 channels, 8-bit, row-major. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelImage {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl PixelImage {
    /// Wrap an owned RGBA buffer. Length must be `width * height * 4`.
    pub fn from_rgba(width: u32, height: u32, data: Vec<u8>) -> Result<Self> {
        let expected = width as usize * height as usize * CHANNELS;
        if data.len() != expected {
            anyhow::bail!(
                "pixel buffer length mismatch: expected {} ({}x{}x4), got {}",
                expected,
                width,
                height,
                data.len()
            );
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    /// Decode PNG or JPEG bytes.
    pub fn from_encoded(bytes: &[u8]) -> Result<Self> {
        let decoded = image::load_from_memory(bytes)
            .context("failed to decode source image bytes")
            .context(StageError::ImageDecodeFailed)?;
        let rgba = decoded.to_rgba8();
        let (width, height) = rgba.dimensions();
        Ok(Self {
            width,
            height,
            data: rgba.into_raw(),
        })
    }

    /// Encode to the configured output format. `quality` is in (0, 1] and is
    /// ignored for PNG.
    pub fn to_encoded(&self, format: OutputFormat, quality: f32) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        match format {
            OutputFormat::Png => {
                PngEncoder::new(&mut out)
                    .write_image(&self.data, self.width, self.height, ColorType::Rgba8.into())
                    .context("PNG encode failed")
                    .context(StageError::EncodeFailed)?;
            }
            OutputFormat::Jpeg => {
                // JPEG has no alpha; drop the opaque channel.
                let rgb = self.to_rgb();
                JpegEncoder::new_with_quality(
                    Cursor::new(&mut out),
                    jpeg_quality_from_fraction(quality),
                )
                .write_image(&rgb, self.width, self.height, ColorType::Rgb8.into())
                .context("JPEG encode failed")
                .context(StageError::EncodeFailed)?;
            }
        }
        Ok(out)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    fn to_rgb(&self) -> Vec<u8> {
        let pixels = self.width as usize * self.height as usize;
        let mut rgb = vec![0u8; pixels * 3];
        for i in 0..pixels {
            rgb[i * 3] = self.data[i * CHANNELS];
            rgb[i * 3 + 1] = self.data[i * CHANNELS + 1];
            rgb[i * 3 + 2] = self.data[i * CHANNELS + 2];
        }
        rgb
    }
}

/// Map the (0, 1] quality fraction to the encoder's 1–100 scale.
fn jpeg_quality_from_fraction(quality: f32) -> u8 {
    (quality.clamp(0.01, 1.0) * 100.0).round() as u8
}
