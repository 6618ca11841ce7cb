pub mod default;
pub mod preprocess;
pub mod sliced;
pub mod tiled;
pub mod windowed;

use std::sync::Arc;

use anyhow::{Context, Result, ensure};
use candle_core::{Device, Tensor};
use image::DynamicImage;
use tracing::{debug, info};

pub use crate::mrope::VisionGrid;
pub use preprocess::{Planes, prepare_planes, resize_rgb_image};
pub use sliced::{SliceLayout, best_slice_layout};

use crate::{
    error::CompileError,
    prompt::SizeHint,
    settings::VisionSettings,
    tokenizer::{TextTokenizer, TokenId},
};

/// The vision sub-model as seen by the prompt compiler.
///
/// `forward` receives the tensors named by `input_names`, in that order. The output is one
/// row per placeholder token: `[rows, hidden]` (or any shape whose trailing axis is
/// `hidden`) for single-view schemes and `[views, rows, hidden]` for the tiled and sliced
/// schemes.
pub trait VisionEncoder: Send + Sync {
    fn input_names(&self) -> &[String];

    /// Device the input tensors are built on.
    fn device(&self) -> &Device;

    fn forward(&self, inputs: &[Tensor]) -> Result<Tensor>;
}

/// Patchification strategy, resolved once from the vision module's input signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisionScheme {
    Default,
    /// Qwen2-VL style flattened patches with 2-D position ids.
    WindowedGrid { window_attention: bool },
    /// SmolVLM style fixed-size tiles plus a global view.
    Tiled,
    /// MiniCPM-V style adaptive slices plus a global view.
    Sliced,
}

impl VisionScheme {
    pub fn select<S: AsRef<str>>(input_names: &[S]) -> Self {
        let first = input_names.first().map(AsRef::as_ref);
        match first {
            Some("patches") if input_names.len() >= 3 => VisionScheme::WindowedGrid {
                window_attention: input_names.len() == 4
                    && input_names[3].as_ref() == "window_index",
            },
            Some("pixel_values") if input_names.len() == 1 => VisionScheme::Tiled,
            Some("pixel_values") => VisionScheme::Sliced,
            _ => VisionScheme::Default,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            VisionScheme::Default => "default",
            VisionScheme::WindowedGrid { .. } => "windowed-grid",
            VisionScheme::Tiled => "tiled",
            VisionScheme::Sliced => "sliced",
        }
    }
}

/// Patch grid of one windowed-grid call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridDescriptor {
    pub grid_t: usize,
    pub grid_h: usize,
    pub grid_w: usize,
    pub patch_size: usize,
    pub merge_size: usize,
}

impl GridDescriptor {
    pub fn patch_count(&self) -> usize {
        self.grid_t * self.grid_h * self.grid_w
    }

    /// Grid after spatial merging, as handed to the position tracker.
    pub fn merged(&self) -> VisionGrid {
        let merge = self.merge_size.max(1);
        VisionGrid::new(self.grid_t, self.grid_h / merge, self.grid_w / merge)
    }
}

/// One image to patchify.
#[derive(Debug, Clone, Copy)]
pub struct PatchRequest<'a> {
    pub image: &'a DynamicImage,
    pub geometry: SizeHint,
    /// Number of images compiled earlier in the same prompt.
    pub image_index: usize,
}

/// Output of one patchifier call.
#[derive(Debug, Clone)]
pub struct PatchifiedImage {
    /// Embedding buffers in production order, each `[rows, hidden]`.
    pub embeddings: Vec<Tensor>,
    /// Placeholder id-run spliced into the token sequence.
    pub ids: Vec<TokenId>,
    /// Set by schemes whose placeholders carry mRoPE grid positions.
    pub grid: Option<GridDescriptor>,
}

impl PatchifiedImage {
    pub fn rows(&self) -> usize {
        self.embeddings.iter().map(|e| e.dims()[0]).sum()
    }

    pub fn pad_count(&self, pad: TokenId) -> usize {
        self.ids.iter().filter(|&&id| id == pad).count()
    }

    /// Checks that every embedding row has exactly one pad id.
    pub fn verify(&self, scheme: VisionScheme, pad: TokenId) -> Result<(), CompileError> {
        let pads = self.pad_count(pad);
        let rows = self.rows();
        if pads != rows {
            return Err(CompileError::PadRowMismatch {
                scheme: scheme.name(),
                pads,
                rows,
            });
        }
        Ok(())
    }
}

/// A loaded vision capability: encoder, resolved scheme and preprocessing settings.
pub struct VisionPipeline {
    encoder: Arc<dyn VisionEncoder>,
    scheme: VisionScheme,
    settings: VisionSettings,
}

impl VisionPipeline {
    pub fn new(encoder: Arc<dyn VisionEncoder>, settings: VisionSettings) -> Self {
        let scheme = VisionScheme::select(encoder.input_names());
        info!(
            scheme = scheme.name(),
            inputs = ?encoder.input_names(),
            "vision pipeline ready"
        );
        Self {
            encoder,
            scheme,
            settings,
        }
    }

    pub fn scheme(&self) -> VisionScheme {
        self.scheme
    }

    pub fn settings(&self) -> &VisionSettings {
        &self.settings
    }

    pub fn patchify(
        &self,
        request: &PatchRequest<'_>,
        tokenizer: &dyn TextTokenizer,
    ) -> Result<PatchifiedImage> {
        let encoder = self.encoder.as_ref();
        let patched = match self.scheme {
            VisionScheme::Default => default::patchify(encoder, &self.settings, request),
            VisionScheme::WindowedGrid { window_attention } => {
                windowed::patchify(encoder, &self.settings, request, window_attention)
            }
            VisionScheme::Tiled => tiled::patchify(encoder, &self.settings, request, tokenizer),
            VisionScheme::Sliced => sliced::patchify(encoder, &self.settings, request, tokenizer),
        }
        .with_context(|| format!("{} patchification failed", self.scheme.name()))?;
        patched.verify(self.scheme, self.settings.tokens.pad)?;
        debug!(
            scheme = self.scheme.name(),
            buffers = patched.embeddings.len(),
            rows = patched.rows(),
            ids = patched.ids.len(),
            "image patchified"
        );
        Ok(patched)
    }
}

/// Flattens every axis but the last into rows.
pub(crate) fn as_rows(tensor: Tensor) -> Result<Tensor> {
    let dims = tensor.dims().to_vec();
    ensure!(
        dims.len() >= 2,
        "vision output must have at least two axes, got {dims:?}"
    );
    if dims.len() == 2 {
        return Ok(tensor);
    }
    let hidden = dims[dims.len() - 1];
    let rows: usize = dims[..dims.len() - 1].iter().product();
    Ok(tensor.reshape((rows, hidden))?)
}

/// Splits a `[views, rows, hidden]` output into one buffer per view.
pub(crate) fn split_views(tensor: Tensor, views: usize) -> Result<Vec<Tensor>> {
    let dims = tensor.dims().to_vec();
    ensure!(
        dims.len() == 3 && dims[0] == views,
        "vision output must have shape [{views}, rows, hidden], got {dims:?}"
    );
    (0..views)
        .map(|i| Ok(tensor.get(i)?))
        .collect::<Result<Vec<_>>>()
}

/// `count` copies of the pad id.
pub(crate) fn pad_run(pad: TokenId, count: usize) -> impl Iterator<Item = TokenId> {
    std::iter::repeat_n(pad, count)
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheme_selection_follows_signature() {
        assert_eq!(
            VisionScheme::select(&["patches", "position_ids", "attention_mask"]),
            VisionScheme::WindowedGrid {
                window_attention: false
            }
        );
        assert_eq!(
            VisionScheme::select(&["patches", "position_ids", "attention_mask", "window_index"]),
            VisionScheme::WindowedGrid {
                window_attention: true
            }
        );
        assert_eq!(VisionScheme::select(&["pixel_values"]), VisionScheme::Tiled);
        assert_eq!(
            VisionScheme::select(&["pixel_values", "position_ids", "attention_mask", "tgt_sizes"]),
            VisionScheme::Sliced
        );
        assert_eq!(VisionScheme::select(&["patches", "x"]), VisionScheme::Default);
        assert_eq!(VisionScheme::select(&["input"]), VisionScheme::Default);
        assert_eq!(VisionScheme::select::<&str>(&[]), VisionScheme::Default);
    }

    #[test]
    fn as_rows_flattens_leading_axes() -> Result<()> {
        let t = Tensor::zeros((2, 3, 5), candle_core::DType::F32, &Device::Cpu)?;
        assert_eq!(as_rows(t)?.dims(), &[6, 5]);
        let t = Tensor::zeros(5, candle_core::DType::F32, &Device::Cpu)?;
        assert!(as_rows(t).is_err());
        Ok(())
    }

    #[test]
    fn verify_counts_pads_against_rows() -> Result<()> {
        let patched = PatchifiedImage {
            embeddings: vec![Tensor::zeros((2, 4), candle_core::DType::F32, &Device::Cpu)?],
            ids: vec![7, 1, 1, 8],
            grid: None,
        };
        assert!(patched.verify(VisionScheme::Default, 1).is_ok());
        assert_eq!(
            patched.verify(VisionScheme::Tiled, 7),
            Err(CompileError::PadRowMismatch {
                scheme: "tiled",
                pads: 1,
                rows: 2
            })
        );
        Ok(())
    }
}
