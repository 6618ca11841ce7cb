use serde::{Deserialize, Serialize};

use crate::tokenizer::TokenId;

pub const DEFAULT_IMAGE_SIZE: u32 = 448;
pub const DEFAULT_IMAGE_MEAN: [f32; 3] = [122.770_94, 116.746_01, 104.093_74];
pub const DEFAULT_IMAGE_NORM: [f32; 3] = [0.014_598_43, 0.015_007_77, 0.014_220_07];

/// How the decoder expects position ids for the prefill step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PositionEncoding {
    /// One scalar per token (`[seq]`).
    #[default]
    Sequential,
    /// Three axes per token (`[3, seq]`).
    Mrope,
}

/// Reserved token ids the patchifiers splice into the token stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisionTokens {
    pub pad: TokenId,
    pub start: Option<TokenId>,
    pub end: Option<TokenId>,
    /// Marker following `start` in the tiled scheme's global block.
    pub global: TokenId,
    pub slice_start: TokenId,
    pub slice_end: TokenId,
    pub id_start: TokenId,
    pub id_end: TokenId,
}

impl Default for VisionTokens {
    fn default() -> Self {
        Self {
            pad: 151_859,
            start: Some(151_857),
            end: Some(151_858),
            global: 49_152,
            slice_start: 111,
            slice_end: 112,
            id_start: 113,
            id_end: 114,
        }
    }
}

/// Per-model geometry and normalisation for vision preprocessing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisionSettings {
    pub tokens: VisionTokens,
    /// Default square edge used when an image carries no size hint.
    pub image_size: u32,
    pub image_mean: [f32; 3],
    pub image_norm: [f32; 3],
    /// Tile edge for the tiled scheme, rounding unit for the default scheme and patch edge
    /// for the sliced scheme.
    pub size_unit: u32,
    pub max_size: u32,
    pub patch_size: usize,
    pub merge_size: usize,
    pub temporal_patch_size: usize,
    pub window_size: usize,
    /// Embedding rows produced per tile or slice by the tiled and sliced schemes.
    pub rows_per_tile: usize,
    pub scale_resolution: u32,
    pub max_slice_nums: usize,
    pub patches_per_side: usize,
}

impl Default for VisionSettings {
    fn default() -> Self {
        Self {
            tokens: VisionTokens::default(),
            image_size: DEFAULT_IMAGE_SIZE,
            image_mean: DEFAULT_IMAGE_MEAN,
            image_norm: DEFAULT_IMAGE_NORM,
            size_unit: 1,
            max_size: 2048,
            patch_size: 14,
            merge_size: 2,
            temporal_patch_size: 2,
            window_size: 4,
            rows_per_tile: 64,
            scale_resolution: 448,
            max_slice_nums: 9,
            patches_per_side: 70,
        }
    }
}

impl VisionSettings {
    /// Rounding factor for the windowed-grid scheme.
    pub fn grid_factor(&self) -> u32 {
        (self.patch_size * self.merge_size).max(1) as u32
    }
}
