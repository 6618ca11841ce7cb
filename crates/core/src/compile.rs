use std::{borrow::Cow, sync::Arc};

use anyhow::{Context, Result};
use candle_core::Tensor;
use image::DynamicImage;
use tracing::{debug, warn};

use crate::{
    error::CompileError,
    image_source::{ImageFetcher, LocalImageFetcher},
    interleave::{EmbeddingInterleaver, VisionQueue},
    mrope::{MropePositions, PositionIds},
    prompt::{MultimodalPrompt, SizeHint, Span},
    settings::PositionEncoding,
    tensor::TokenEmbedder,
    timing::{CompileStats, Timer},
    tokenizer::{TextTokenizer, TokenId},
    vision::{PatchRequest, PatchifiedImage, VisionPipeline},
};

/// Turns multimodal prompts into token ids, vision buffers and a position table.
///
/// A compiler is cheap to clone and holds no per-prompt state; every call to
/// [`PromptCompiler::compile`] starts a fresh position tracker and vision queue.
#[derive(Clone)]
pub struct PromptCompiler {
    tokenizer: Arc<dyn TextTokenizer>,
    vision: Option<Arc<VisionPipeline>>,
    fetcher: Arc<dyn ImageFetcher>,
    encoding: PositionEncoding,
}

impl PromptCompiler {
    pub fn new(tokenizer: Arc<dyn TextTokenizer>) -> Self {
        Self {
            tokenizer,
            vision: None,
            fetcher: Arc::new(LocalImageFetcher::new()),
            encoding: PositionEncoding::default(),
        }
    }

    pub fn with_vision(mut self, pipeline: Arc<VisionPipeline>) -> Self {
        self.vision = Some(pipeline);
        self
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn ImageFetcher>) -> Self {
        self.fetcher = fetcher;
        self
    }

    pub fn with_position_encoding(mut self, encoding: PositionEncoding) -> Self {
        self.encoding = encoding;
        self
    }

    pub fn vision(&self) -> Option<&VisionPipeline> {
        self.vision.as_deref()
    }

    pub fn position_encoding(&self) -> PositionEncoding {
        self.encoding
    }

    /// Placeholder id marking vision rows, `None` for text-only models.
    pub fn pad_token(&self) -> Option<TokenId> {
        self.vision.as_ref().map(|v| v.settings().tokens.pad)
    }

    pub fn compile(&self, prompt: &MultimodalPrompt) -> Result<CompiledPrompt> {
        let timer = Timer::new("compile_prompt");
        let mut stats = CompileStats::default();
        let mut token_ids = Vec::new();
        let mut positions = MropePositions::new();
        let mut vision = VisionQueue::new();

        for span in prompt.spans() {
            match span {
                Span::Text(text) => {
                    let ids = self
                        .tokenizer
                        .encode(text)
                        .context("failed to tokenize prompt text")?;
                    positions = positions.push_text(ids.len());
                    stats.text_tokens += ids.len();
                    token_ids.extend(ids);
                }
                Span::Image { content, size_hint } => {
                    stats.images += 1;
                    let image_index = stats.images - stats.skipped_images - 1;
                    let Some(patched) =
                        self.compile_image(prompt, &content, size_hint, image_index, &mut stats)?
                    else {
                        stats.skipped_images += 1;
                        continue;
                    };
                    positions = match (self.encoding, patched.grid) {
                        (PositionEncoding::Mrope, Some(grid)) => {
                            positions.push_vision(grid.merged())
                        }
                        _ => positions.push_text(patched.ids.len()),
                    };
                    stats.vision_rows += patched.rows();
                    for buffer in patched.embeddings {
                        vision.push(buffer)?;
                    }
                    token_ids.extend(patched.ids);
                }
            }
        }

        if positions.len() != token_ids.len() {
            return Err(CompileError::PositionLengthMismatch {
                positions: positions.len(),
                tokens: token_ids.len(),
            }
            .into());
        }

        timer.finish(|event| {
            event.add_field("tokens", token_ids.len());
            event.add_field("images", stats.images);
            event.add_field("skipped_images", stats.skipped_images);
            event.add_field("vision_rows", stats.vision_rows);
            event.add_field("vision_us", stats.vision_us);
        });
        Ok(CompiledPrompt {
            token_ids,
            positions,
            vision,
            stats,
            pad: self.pad_token(),
            encoding: self.encoding,
        })
    }

    /// Resolves and patchifies one image span; `None` when it compiles to an empty run.
    fn compile_image(
        &self,
        prompt: &MultimodalPrompt,
        content: &str,
        tag_hint: Option<SizeHint>,
        image_index: usize,
        stats: &mut CompileStats,
    ) -> Result<Option<PatchifiedImage>> {
        let Some(pipeline) = self.vision.as_deref() else {
            warn!(image = content, "model has no vision module; image tag compiles to nothing");
            return Ok(None);
        };
        let (image, part_hint): (Cow<'_, DynamicImage>, _) = match prompt.images.get(content) {
            Some(part) => (Cow::Borrowed(&part.image), part.size_hint),
            None => match self.fetcher.fetch(content) {
                Ok(image) => (Cow::Owned(image), None),
                Err(err) => {
                    warn!(image = content, error = %err, "skipping unresolvable image");
                    return Ok(None);
                }
            },
        };
        let geometry = tag_hint
            .or(part_hint)
            .unwrap_or_else(|| SizeHint::square(pipeline.settings().image_size))
            .clamp_to(pipeline.settings().max_size);
        debug!(
            image = content,
            height = geometry.height,
            width = geometry.width,
            image_index,
            "compiling image"
        );

        let timer = Timer::new("vision");
        let request = PatchRequest {
            image: image.as_ref(),
            geometry,
            image_index,
        };
        let patched = pipeline.patchify(&request, self.tokenizer.as_ref())?;
        let elapsed = timer.finish(|event| {
            event.add_field("scheme", pipeline.scheme().name());
            event.add_field("rows", patched.rows());
        });
        stats.vision_us += elapsed.as_micros() as u64;
        Ok(Some(patched))
    }
}

/// Result of compiling one prompt, ready to be turned into decoder inputs.
#[derive(Debug, Clone)]
pub struct CompiledPrompt {
    pub token_ids: Vec<TokenId>,
    pub positions: MropePositions,
    pub vision: VisionQueue,
    pub stats: CompileStats,
    pad: Option<TokenId>,
    encoding: PositionEncoding,
}

impl CompiledPrompt {
    pub fn len(&self) -> usize {
        self.token_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.token_ids.is_empty()
    }

    pub fn pad_token(&self) -> Option<TokenId> {
        self.pad
    }

    pub fn position_encoding(&self) -> PositionEncoding {
        self.encoding
    }

    /// Prefill position ids offset by `past_len` previously consumed tokens.
    pub fn position_ids(&self, past_len: usize) -> PositionIds {
        self.positions.clone().into_position_ids(self.encoding, past_len)
    }

    /// Consumes the compiled prompt into `[seq, hidden]` embeddings and matching position ids.
    pub fn prefill(self, embedder: &dyn TokenEmbedder, past_len: usize) -> Result<DecoderInputs> {
        let position_ids = self.positions.into_position_ids(self.encoding, past_len);
        let embeddings =
            EmbeddingInterleaver::new(embedder, self.pad).interleave(&self.token_ids, self.vision)?;
        Ok(DecoderInputs {
            embeddings,
            position_ids,
            token_ids: self.token_ids,
        })
    }
}

/// Inputs for the decoder's prefill step.
#[derive(Debug, Clone)]
pub struct DecoderInputs {
    /// `[seq, hidden]`
    pub embeddings: Tensor,
    pub position_ids: PositionIds,
    pub token_ids: Vec<TokenId>,
}

impl DecoderInputs {
    pub fn seq_len(&self) -> usize {
        self.token_ids.len()
    }

    /// Position ids on the embeddings' device.
    pub fn position_tensor(&self) -> Result<Tensor> {
        self.position_ids.to_tensor(self.embeddings.device())
    }
}
