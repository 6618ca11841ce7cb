use std::{fs, path::Path};

use anyhow::{Context, Result, anyhow};
use omni_prompt_core::{
    PositionEncoding, TokenId, VisionSettings, VisionTokens,
    settings::{DEFAULT_IMAGE_MEAN, DEFAULT_IMAGE_NORM, DEFAULT_IMAGE_SIZE},
};
use serde::{Deserialize, Serialize};

/// `config.json` shipped next to an exported model.
///
/// Token ids are signed so a negative `vision_start`/`vision_end` can disable the vision
/// boundaries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub is_visual: bool,
    #[serde(alias = "is_mrope")]
    pub mrope: bool,
    /// Declared input names of the vision module.
    pub visual_inputs: Vec<String>,
    pub hidden_size: Option<usize>,
    pub image_size: u32,
    pub image_pad: i64,
    pub vision_start: i64,
    pub vision_end: i64,
    pub image_mean: [f32; 3],
    pub image_norm: [f32; 3],
    pub image_size_unit: u32,
    pub image_max_size: u32,
    pub global_image: i64,
    pub vision_slice_start_id: i64,
    pub vision_slice_end_id: i64,
    pub vision_id_start_id: i64,
    pub vision_id_end_id: i64,
    pub patch_size: usize,
    #[serde(alias = "spatial_merge_size")]
    pub merge_size: usize,
    pub temporal_patch_size: usize,
    pub vision_window_size: usize,
    pub vision_len: usize,
    pub scale_resolution: u32,
    pub max_slice_nums: usize,
    pub patches_per_side: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        let vision = VisionSettings::default();
        let tokens = &vision.tokens;
        Self {
            is_visual: false,
            mrope: false,
            visual_inputs: Vec::new(),
            hidden_size: None,
            image_size: DEFAULT_IMAGE_SIZE,
            image_pad: i64::from(tokens.pad),
            vision_start: tokens.start.map_or(-1, i64::from),
            vision_end: tokens.end.map_or(-1, i64::from),
            image_mean: DEFAULT_IMAGE_MEAN,
            image_norm: DEFAULT_IMAGE_NORM,
            image_size_unit: vision.size_unit,
            image_max_size: vision.max_size,
            global_image: i64::from(tokens.global),
            vision_slice_start_id: i64::from(tokens.slice_start),
            vision_slice_end_id: i64::from(tokens.slice_end),
            vision_id_start_id: i64::from(tokens.id_start),
            vision_id_end_id: i64::from(tokens.id_end),
            patch_size: vision.patch_size,
            merge_size: vision.merge_size,
            temporal_patch_size: vision.temporal_patch_size,
            vision_window_size: vision.window_size,
            vision_len: vision.rows_per_tile,
            scale_resolution: vision.scale_resolution,
            max_slice_nums: vision.max_slice_nums,
            patches_per_side: vision.patches_per_side,
        }
    }
}

impl ModelConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)
            .with_context(|| format!("failed to read model config from {}", path.display()))?;
        serde_json::from_slice(&bytes)
            .with_context(|| format!("failed to parse model config at {}", path.display()))
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).context("failed to parse model config")
    }

    pub fn position_encoding(&self) -> PositionEncoding {
        if self.mrope {
            PositionEncoding::Mrope
        } else {
            PositionEncoding::Sequential
        }
    }

    /// Vision preprocessing settings; `None` for text-only models.
    pub fn vision_settings(&self) -> Result<Option<VisionSettings>> {
        if !self.is_visual {
            return Ok(None);
        }
        let (start, end) = match (optional_id(self.vision_start), optional_id(self.vision_end)) {
            (Some(start), Some(end)) => (Some(start), Some(end)),
            _ => (None, None),
        };
        let tokens = VisionTokens {
            pad: required_id("image_pad", self.image_pad)?,
            start,
            end,
            global: required_id("global_image", self.global_image)?,
            slice_start: required_id("vision_slice_start_id", self.vision_slice_start_id)?,
            slice_end: required_id("vision_slice_end_id", self.vision_slice_end_id)?,
            id_start: required_id("vision_id_start_id", self.vision_id_start_id)?,
            id_end: required_id("vision_id_end_id", self.vision_id_end_id)?,
        };
        Ok(Some(VisionSettings {
            tokens,
            image_size: self.image_size.max(1),
            image_mean: self.image_mean,
            image_norm: self.image_norm,
            size_unit: self.image_size_unit.max(1),
            max_size: self.image_max_size,
            patch_size: self.patch_size.max(1),
            merge_size: self.merge_size.max(1),
            temporal_patch_size: self.temporal_patch_size.max(1),
            window_size: self.vision_window_size.max(1),
            rows_per_tile: self.vision_len,
            scale_resolution: self.scale_resolution.max(1),
            max_slice_nums: self.max_slice_nums.max(1),
            patches_per_side: self.patches_per_side.max(1),
        }))
    }
}

fn optional_id(raw: i64) -> Option<TokenId> {
    TokenId::try_from(raw).ok()
}

fn required_id(key: &str, raw: i64) -> Result<TokenId> {
    TokenId::try_from(raw).map_err(|_| anyhow!("model config `{key}` must be a valid token id, got {raw}"))
}
