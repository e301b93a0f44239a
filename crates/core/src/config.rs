use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_SCALE: u32 = 4;
pub const DEFAULT_TILE_SIZE: u32 = 512;
pub const DEFAULT_OVERLAP: u32 = 16;
pub const DEFAULT_INPUT_NAME: &str = "input";
pub const DEFAULT_QUALITY: f32 = 0.92;

/// Value range the model expects its input tensor normalized to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Normalization {
    /// Pixel / 255 → [0, 1].
    #[default]
    #[serde(rename = "0-1")]
    ZeroToOne,
    /// Pixel / 255 * 2 - 1 → [-1, 1].
    #[serde(rename = "-1-1")]
    MinusOneToOne,
}

/// Encoded format for the final output image.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Jpeg,
    Png,
}

impl OutputFormat {
    /// Parse from string (case-insensitive). Returns `Jpeg` for unknown values.
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "png" | "image/png" => Self::Png,
            _ => Self::Jpeg,
        }
    }
}

/// Per-instance pipeline configuration. Immutable after `init`; validated by
/// [`PipelineConfig::validate`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Output magnification factor of the primary model.
    pub scale: u32,
    /// Source-side tile edge length in pixels.
    pub tile_size: u32,
    /// Source-side overlap between adjacent tiles, in pixels.
    pub overlap: u32,
    /// Input tensor binding name.
    pub input_name: String,
    /// Output tensor binding name; defaults to the session's first output.
    pub output_name: Option<String>,
    pub normalize: Normalization,
    pub format: OutputFormat,
    /// Output encoding quality in (0, 1]; ignored for PNG.
    pub quality: f32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            scale: DEFAULT_SCALE,
            tile_size: DEFAULT_TILE_SIZE,
            overlap: DEFAULT_OVERLAP,
            input_name: DEFAULT_INPUT_NAME.to_string(),
            output_name: None,
            normalize: Normalization::default(),
            format: OutputFormat::default(),
            quality: DEFAULT_QUALITY,
        }
    }
}

impl PipelineConfig {
    /// Tile coverage is only well-defined for `overlap < tile_size`.
    pub fn validate(&self) -> Result<()> {
        if self.scale < 1 {
            bail!("scale must be >= 1, got {}", self.scale);
        }
        if self.tile_size == 0 {
            bail!("tile_size must be > 0");
        }
        if self.overlap >= self.tile_size {
            bail!(
                "overlap ({}) must be smaller than tile_size ({})",
                self.overlap,
                self.tile_size
            );
        }
        if !(self.quality > 0.0 && self.quality <= 1.0) {
            bail!("quality must be in (0, 1], got {}", self.quality);
        }
        Ok(())
    }

    /// Source-side stride between tile origins.
    pub fn stride(&self) -> u32 {
        self.tile_size - self.overlap
    }
}

/// Partial configuration carried by an `init` request; unset fields keep the
/// current value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigOverrides {
    pub scale: Option<u32>,
    pub tile_size: Option<u32>,
    pub overlap: Option<u32>,
    pub input_name: Option<String>,
    pub output_name: Option<String>,
    pub normalize: Option<Normalization>,
    pub format: Option<OutputFormat>,
    pub quality: Option<f32>,
}

impl ConfigOverrides {
    pub fn apply_to(&self, config: &mut PipelineConfig) {
        if let Some(scale) = self.scale {
            config.scale = scale;
        }
        if let Some(tile_size) = self.tile_size {
            config.tile_size = tile_size;
        }
        if let Some(overlap) = self.overlap {
            config.overlap = overlap;
        }
        if let Some(input_name) = &self.input_name {
            config.input_name = input_name.clone();
        }
        if let Some(output_name) = &self.output_name {
            config.output_name = Some(output_name.clone());
        }
        if let Some(normalize) = self.normalize {
            config.normalize = normalize;
        }
        if let Some(format) = self.format {
            config.format = format;
        }
        if let Some(quality) = self.quality {
            config.quality = quality;
        }
    }
}

/// App-level configuration file (TOML), holding pipeline defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub pipeline: PipelineConfig,
}

impl AppConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config TOML: {}", path.display()))
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .context("config path does not have a parent directory")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory: {}", parent.display()))?;

        let encoded = toml::to_string_pretty(self).context("failed to serialize config TOML")?;
        fs::write(path, encoded)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_model_defaults() {
        let cfg = PipelineConfig::default();
        assert_eq!(cfg.scale, 4);
        assert_eq!(cfg.tile_size, 512);
        assert_eq!(cfg.overlap, 16);
        assert_eq!(cfg.input_name, "input");
        assert_eq!(cfg.output_name, None);
        assert_eq!(cfg.normalize, Normalization::ZeroToOne);
        assert_eq!(cfg.format, OutputFormat::Jpeg);
        assert!((cfg.quality - 0.92).abs() < f32::EPSILON);
        assert_eq!(cfg.stride(), 496);
        cfg.validate().expect("defaults must validate");
    }

    #[test]
    fn validate_rejects_overlap_not_smaller_than_tile_size() {
        let cfg = PipelineConfig {
            tile_size: 64,
            overlap: 64,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = PipelineConfig {
            tile_size: 64,
            overlap: 63,
            ..Default::default()
        };
        cfg.validate().expect("overlap < tile_size is valid");
    }

    #[test]
    fn validate_rejects_zero_tile_size_and_scale() {
        let cfg = PipelineConfig {
            tile_size: 0,
            overlap: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = PipelineConfig {
            scale: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn overrides_merge_only_set_fields() {
        let mut cfg = PipelineConfig::default();
        let overrides = ConfigOverrides {
            scale: Some(2),
            normalize: Some(Normalization::MinusOneToOne),
            output_name: Some("output".to_string()),
            ..Default::default()
        };

        overrides.apply_to(&mut cfg);

        assert_eq!(cfg.scale, 2);
        assert_eq!(cfg.normalize, Normalization::MinusOneToOne);
        assert_eq!(cfg.output_name.as_deref(), Some("output"));
        // untouched fields keep their defaults
        assert_eq!(cfg.tile_size, 512);
        assert_eq!(cfg.overlap, 16);
        assert_eq!(cfg.input_name, "input");
    }

    #[test]
    fn normalization_serde_uses_range_names() {
        let json = serde_json::to_string(&Normalization::ZeroToOne).expect("serialize");
        assert_eq!(json, "\"0-1\"");
        let parsed: Normalization = serde_json::from_str("\"-1-1\"").expect("deserialize");
        assert_eq!(parsed, Normalization::MinusOneToOne);
    }

    #[test]
    fn output_format_from_str_lossy_accepts_mime_names() {
        assert_eq!(OutputFormat::from_str_lossy("png"), OutputFormat::Png);
        assert_eq!(OutputFormat::from_str_lossy("image/png"), OutputFormat::Png);
        assert_eq!(OutputFormat::from_str_lossy("jpeg"), OutputFormat::Jpeg);
        assert_eq!(
            OutputFormat::from_str_lossy("image/jpeg"),
            OutputFormat::Jpeg
        );
        assert_eq!(OutputFormat::from_str_lossy("webp"), OutputFormat::Jpeg);
    }

    #[test]
    fn toml_roundtrip_preserves_values() {
        let original = AppConfig {
            pipeline: PipelineConfig {
                scale: 2,
                overlap: 8,
                format: OutputFormat::Png,
                ..Default::default()
            },
        };
        let encoded = toml::to_string_pretty(&original).expect("serialize config");
        let decoded: AppConfig = toml::from_str(&encoded).expect("deserialize config");
        assert_eq!(decoded, original);
    }

    #[test]
    fn load_from_nonexistent_file_returns_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("missing.toml");
        let loaded = AppConfig::load_from_path(&path).expect("load config");
        assert_eq!(loaded, AppConfig::default());
    }

    #[test]
    fn save_then_load_roundtrips_through_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("config.toml");
        let config = AppConfig {
            pipeline: PipelineConfig {
                tile_size: 256,
                quality: 0.8,
                ..Default::default()
            },
        };
        config.save_to_path(&path).expect("save config");
        let loaded = AppConfig::load_from_path(&path).expect("load config");
        assert_eq!(loaded, config);
    }
}
