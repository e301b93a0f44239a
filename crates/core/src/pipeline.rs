//! Per-image orchestration: split → encode/run/decode per tile → merge →
//! post-process.
//!
//! One pipeline instance owns its sessions and processes one image at a time;
//! tiles run strictly sequentially so peak memory stays near one tile tensor
//! plus the merge accumulation buffer.

use anyhow::{bail, Context, Result};
use tracing::{debug, warn};

use crate::blend::{merge_tiles, OutputTile};
use crate::config::PipelineConfig;
use crate::error::StageError;
use crate::image::PixelImage;
use crate::postprocess::{self, DEFAULT_SHARPEN_AMOUNT, DEFAULT_SHARPEN_RADIUS};
use crate::resize::resample_bilinear;
use crate::session::InferenceSession;
use crate::tensor::{decode_tensor, encode_tile};
use crate::tile::{split_tiles, Tile};

/// Out-of-band notifications emitted while processing one image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    Progress { percent: u8, status: String },
    Log { message: String },
}

pub struct Pipeline {
    config: PipelineConfig,
    primary: Option<Box<dyn InferenceSession>>,
    face: Option<Box<dyn InferenceSession>>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            primary: None,
            face: None,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn set_primary(&mut self, session: Option<Box<dyn InferenceSession>>) {
        self.primary = session;
    }

    pub fn set_face(&mut self, session: Option<Box<dyn InferenceSession>>) {
        self.face = session;
    }

    /// Degraded mode: no primary session, tiles pass through without
    /// inference (resampled to scale, see [`Self::upscale_tile`]).
    pub fn is_degraded(&self) -> bool {
        self.primary.is_none()
    }

    /// Run one source image through the full pipeline, emitting progress and
    /// log notices along the way. Progress percentages are monotonically
    /// non-decreasing.
    pub fn process(
        &mut self,
        source: &PixelImage,
        emit: &mut dyn FnMut(Notice),
    ) -> Result<PixelImage> {
        let scale = self.config.scale;
        let out_w = source.width() * scale;
        let out_h = source.height() * scale;

        if self.is_degraded() {
            emit(Notice::Log {
                message: "degraded mode: no primary session, tiles are resampled without inference"
                    .to_string(),
            });
        }

        let tiles = split_tiles(source, self.config.tile_size, self.config.overlap);
        debug!(
            tiles = tiles.len(),
            tile_size = self.config.tile_size,
            overlap = self.config.overlap,
            scale,
            "Starting tiled upscale"
        );

        let tile_count = tiles.len();
        let mut out_tiles = Vec::with_capacity(tile_count);
        for (index, tile) in tiles.into_iter().enumerate() {
            emit(Notice::Progress {
                percent: 5 + ((index * 70) / tile_count) as u8,
                status: format!("processing tile {}/{tile_count}", index + 1),
            });
            out_tiles.push(self.upscale_tile(tile)?);
        }

        emit(Notice::Progress {
            percent: 85,
            status: "merging tiles".to_string(),
        });
        let merged = merge_tiles(&out_tiles, out_w, out_h, self.config.overlap * scale)?;
        drop(out_tiles);

        emit(Notice::Progress {
            percent: 90,
            status: "post-processing".to_string(),
        });
        let restored = match &mut self.face {
            Some(face) => {
                match postprocess::restore_faces(face.as_mut(), &merged, self.config.normalize) {
                    Ok(image) => image,
                    Err(error) => {
                        // never fatal: keep the pre-pass image
                        warn!(error = %format!("{error:#}"), "Face restoration failed, skipping");
                        emit(Notice::Log {
                            message: format!("face restore failed: {error:#}"),
                        });
                        merged
                    }
                }
            }
            None => merged,
        };

        Ok(postprocess::unsharp_mask(
            &restored,
            DEFAULT_SHARPEN_AMOUNT,
            DEFAULT_SHARPEN_RADIUS,
        ))
    }

    /// Produce one output tile at `scale×` resolution.
    ///
    /// Without a primary session the tile is bilinearly resampled instead of
    /// inferred, so the merge stage can keep positioning every tile in scaled
    /// coordinates.
    fn upscale_tile(&mut self, tile: Tile) -> Result<OutputTile> {
        let scale = self.config.scale;
        let out_w = tile.w * scale;
        let out_h = tile.h * scale;
        let out_x = tile.x * scale;
        let out_y = tile.y * scale;

        let Some(primary) = &mut self.primary else {
            let data = resample_bilinear(
                &tile.data,
                tile.w as usize,
                tile.h as usize,
                out_w as usize,
                out_h as usize,
            );
            return Ok(OutputTile {
                x: out_x,
                y: out_y,
                w: out_w,
                h: out_h,
                data,
            });
        };

        let input = encode_tile(&tile, self.config.normalize);
        let output = primary
            .run(input)
            .with_context(|| format!("tile at ({}, {})", tile.x, tile.y))
            .context(StageError::InferenceRunFailed)?;

        let shape = output.shape();
        if shape.len() != 4 || shape[2] != out_h as usize || shape[3] != out_w as usize {
            bail!(
                "unexpected output tensor shape {shape:?} for tile {}x{} at scale {scale}",
                tile.w,
                tile.h
            );
        }

        let values = output
            .as_slice()
            .map(|s| s.to_vec())
            .unwrap_or_else(|| output.iter().copied().collect());
        let data = decode_tensor(
            &values,
            out_w as usize,
            out_h as usize,
            self.config.normalize,
        )?;

        Ok(OutputTile {
            x: out_x,
            y: out_y,
            w: out_w,
            h: out_h,
            data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Normalization;
    use crate::image::CHANNELS;
    use ndarray::{Array4, ArrayD};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Nearest-neighbor ×N upscaler standing in for the model.
    struct FakeUpscaler {
        scale: usize,
        calls: Arc<AtomicUsize>,
    }

    impl InferenceSession for FakeUpscaler {
        fn run(&mut self, input: Array4<f32>) -> Result<ArrayD<f32>> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            let (_, c, h, w) = input.dim();
            let s = self.scale;
            let mut out = Array4::<f32>::zeros((1, c, h * s, w * s));
            for ci in 0..c {
                for y in 0..h * s {
                    for x in 0..w * s {
                        out[[0, ci, y, x]] = input[[0, ci, y / s, x / s]];
                    }
                }
            }
            Ok(out.into_dyn())
        }
    }

    struct FailingUpscaler;

    impl InferenceSession for FailingUpscaler {
        fn run(&mut self, _input: Array4<f32>) -> Result<ArrayD<f32>> {
            anyhow::bail!("provider lost")
        }
    }

    fn flat_image(w: u32, h: u32, value: u8) -> PixelImage {
        let data = vec![value, value, value, 255]
            .into_iter()
            .cycle()
            .take((w * h) as usize * CHANNELS)
            .collect();
        PixelImage::from_rgba(w, h, data).expect("valid buffer")
    }

    fn test_config() -> PipelineConfig {
        PipelineConfig {
            scale: 2,
            tile_size: 16,
            overlap: 4,
            ..Default::default()
        }
    }

    #[test]
    fn process_upscales_to_scaled_dimensions() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut pipeline = Pipeline::new(test_config()).expect("config");
        pipeline.set_primary(Some(Box::new(FakeUpscaler {
            scale: 2,
            calls: calls.clone(),
        })));

        let source = flat_image(30, 20, 80);
        let mut notices = Vec::new();
        let result = pipeline
            .process(&source, &mut |n| notices.push(n))
            .expect("process");

        assert_eq!(result.width(), 60);
        assert_eq!(result.height(), 40);
        assert!(calls.load(Ordering::Relaxed) > 0, "inference must run per tile");
        // flat input stays flat through upscale+merge; unsharp brightens it
        // uniformly (80 + 80*0.5 = 120)
        assert!(result.data().chunks(4).all(|px| px[0] == 120 && px[3] == 255));
    }

    #[test]
    fn progress_is_monotone_non_decreasing() {
        let mut pipeline = Pipeline::new(test_config()).expect("config");
        pipeline.set_primary(Some(Box::new(FakeUpscaler {
            scale: 2,
            calls: Arc::new(AtomicUsize::new(0)),
        })));

        let source = flat_image(40, 40, 10);
        let mut percents = Vec::new();
        pipeline
            .process(&source, &mut |n| {
                if let Notice::Progress { percent, .. } = n {
                    percents.push(percent);
                }
            })
            .expect("process");

        assert!(!percents.is_empty());
        assert!(percents.windows(2).all(|w| w[0] <= w[1]), "{percents:?}");
        assert_eq!(percents.last(), Some(&90));
    }

    #[test]
    fn degraded_mode_skips_inference_but_keeps_scaled_output() {
        let mut pipeline = Pipeline::new(test_config()).expect("config");
        assert!(pipeline.is_degraded());

        let source = flat_image(30, 20, 64);
        let mut logs = Vec::new();
        let result = pipeline
            .process(&source, &mut |n| {
                if let Notice::Log { message } = n {
                    logs.push(message);
                }
            })
            .expect("process");

        // passthrough tiles are resampled so the output contract holds
        assert_eq!(result.width(), 60);
        assert_eq!(result.height(), 40);
        assert!(logs.iter().any(|m| m.contains("degraded mode")));
    }

    #[test]
    fn primary_failure_is_fatal_and_classified() {
        let mut pipeline = Pipeline::new(test_config()).expect("config");
        pipeline.set_primary(Some(Box::new(FailingUpscaler)));

        let source = flat_image(8, 8, 1);
        let error = pipeline
            .process(&source, &mut |_| {})
            .expect_err("must fail");
        assert_eq!(
            crate::error::classify(&error),
            Some(StageError::InferenceRunFailed)
        );
    }

    #[test]
    fn face_failure_logs_and_keeps_pre_pass_image() {
        let mut pipeline = Pipeline::new(test_config()).expect("config");
        pipeline.set_primary(Some(Box::new(FakeUpscaler {
            scale: 2,
            calls: Arc::new(AtomicUsize::new(0)),
        })));
        pipeline.set_face(Some(Box::new(FailingUpscaler)));

        let source = flat_image(16, 16, 40);
        let mut logs = Vec::new();
        let result = pipeline
            .process(&source, &mut |n| {
                if let Notice::Log { message } = n {
                    logs.push(message);
                }
            })
            .expect("face failure must not abort");

        assert_eq!(result.width(), 32);
        assert!(logs.iter().any(|m| m.contains("face restore failed")));
    }

    #[test]
    fn rejects_sessions_with_wrong_output_scale() {
        let mut pipeline = Pipeline::new(test_config()).expect("config");
        // claims scale 2 in config but produces 3x tensors
        pipeline.set_primary(Some(Box::new(FakeUpscaler {
            scale: 3,
            calls: Arc::new(AtomicUsize::new(0)),
        })));

        let source = flat_image(8, 8, 1);
        assert!(pipeline.process(&source, &mut |_| {}).is_err());
    }
}
