//! Engine Configuration
//!
//! Tunable thresholds for anchor detection, template matching, fusion and
//! preprocessing, stored in TOML format.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::Error;

/// Extraction engine settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Anchor label detection
    pub anchors: AnchorSettings,
    /// Visual template matching
    pub templates: TemplateSettings,
    /// Engine fusion and correction
    pub fusion: FusionSettings,
    /// Zone image preprocessing
    pub preprocessing: PreprocessSettings,
    /// Barcode / QR payload handling
    pub codes: CodeSettings,
}

/// Anchor label detection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnchorSettings {
    /// Minimum label/token similarity to accept a match (0.0 - 1.0)
    pub similarity_threshold: f64,
    /// Language hint for the full-page word pass
    pub page_language: String,
    /// Tokens at or below this confidence (0 - 100) are ignored
    pub min_token_confidence: f32,
}

impl Default for AnchorSettings {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.7,
            page_language: "fra+eng".to_string(),
            min_token_confidence: 20.0,
        }
    }
}

/// Template patch matching settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TemplateSettings {
    /// Keypoints retained per image
    pub max_features: usize,
    /// Minimum keypoints required on each side before matching
    pub min_keypoints: usize,
    /// Minimum mutual matches for a keypoint detection
    pub min_matches: usize,
    /// FAST corner intensity threshold
    pub fast_threshold: u8,
    /// Number of pyramid levels scanned for keypoints
    pub pyramid_levels: usize,
    /// Downscale factor between pyramid levels
    pub pyramid_scale: f32,
    /// Minimum normalized cross-correlation for the pixel fallback
    pub correlation_threshold: f32,
}

impl Default for TemplateSettings {
    fn default() -> Self {
        Self {
            max_features: 1000,
            min_keypoints: 4,
            min_matches: 10,
            fast_threshold: 20,
            pyramid_levels: 4,
            pyramid_scale: 1.2,
            correlation_threshold: 0.65,
        }
    }
}

/// Multi-engine fusion settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionSettings {
    /// Zones below this confidence get a second engine pass
    pub confidence_floor: f32,
    /// Minimum score for an expected-value correction
    pub correction_threshold: f32,
    /// Correction score that upgrades the zone status to ok
    pub promotion_threshold: f32,
    /// Added to the correction score when one value contains the other
    pub containment_bonus: f32,
}

impl Default for FusionSettings {
    fn default() -> Self {
        Self {
            confidence_floor: 0.6,
            correction_threshold: 0.6,
            promotion_threshold: 0.8,
            containment_bonus: 0.2,
        }
    }
}

/// Zone preprocessing settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessSettings {
    /// Zones shorter than this (pixels) are upscaled
    pub upscale_min_height: u32,
    /// Height after upscaling
    pub upscale_target_height: u32,
    /// Dark-text isolation thresholds for textured backgrounds
    pub textured_thresholds: Vec<u8>,
    /// Dark-text isolation thresholds for latin documents (vertical lines removed)
    pub latin_thresholds: Vec<u8>,
}

impl Default for PreprocessSettings {
    fn default() -> Self {
        Self {
            upscale_min_height: 100,
            upscale_target_height: 200,
            textured_thresholds: vec![60, 80, 100],
            latin_thresholds: vec![80, 100],
        }
    }
}

/// Code payload settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CodeSettings {
    /// Separator splitting a decoded payload into sequences
    pub delimiter: String,
}

impl Default for CodeSettings {
    fn default() -> Self {
        Self {
            delimiter: "*".to_string(),
        }
    }
}

impl EngineConfig {
    /// Reject thresholds outside their range
    pub fn validate(&self) -> crate::error::Result<()> {
        let ratios = [
            ("anchors.similarity_threshold", self.anchors.similarity_threshold as f32),
            ("templates.correlation_threshold", self.templates.correlation_threshold),
            ("fusion.confidence_floor", self.fusion.confidence_floor),
            ("fusion.correction_threshold", self.fusion.correction_threshold),
            ("fusion.promotion_threshold", self.fusion.promotion_threshold),
        ];
        for (name, value) in ratios {
            if !(0.0..=1.0).contains(&value) {
                return Err(Error::Config(format!("{} must be within 0-1, got {}", name, value)));
            }
        }
        if self.codes.delimiter.is_empty() {
            return Err(Error::Config("codes.delimiter must not be empty".to_string()));
        }
        if self.preprocessing.upscale_target_height < self.preprocessing.upscale_min_height {
            return Err(Error::Config(
                "preprocessing.upscale_target_height is below upscale_min_height".to_string(),
            ));
        }
        Ok(())
    }
}

/// Load configuration from file
pub fn load_config(path: &Path) -> Result<EngineConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config {}", path.display()))?;
    let config: EngineConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("Invalid config {}", path.display()))?;
    Ok(config)
}

/// Save configuration to file
pub fn save_config(config: &EngineConfig, path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(config)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, content)?;
    Ok(())
}

/// Load the config at `path`, or the default config file, or built-in defaults
pub fn resolve_config(path: Option<&Path>) -> Result<EngineConfig> {
    if let Some(path) = path {
        let config = load_config(path)?;
        tracing::info!("Loaded configuration from {:?}", path);
        return Ok(config);
    }

    let path = crate::storage::default_config_path()?;
    if path.exists() {
        let config = load_config(&path)?;
        tracing::info!("Loaded configuration from {:?}", path);
        Ok(config)
    } else {
        tracing::info!("Using default configuration");
        Ok(EngineConfig::default())
    }
}
