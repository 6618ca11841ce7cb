#![allow(dead_code)]

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use ahash::AHashMap;
use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use image::{DynamicImage, Rgb, RgbImage};
use tokenizers::{Tokenizer, models::wordlevel::WordLevel, pre_tokenizers::whitespace::Whitespace};

use omni_prompt_core::{
    EmbeddingTable, ImagePart, TextTokenizer, TokenId, VisionEncoder, VisionPipeline,
    VisionSettings, VisionTokens,
};

pub const HIDDEN: usize = 4;
pub const VOCAB: usize = 64;
pub const PAD: u32 = 50;
pub const START: u32 = 51;
pub const END: u32 = 52;

pub fn build_test_tokenizer() -> Tokenizer {
    let words = [
        "[UNK]", "hello", "world", "describe", "the", "image", "0", "1", "and", "compare",
    ];
    let mut vocab = AHashMap::new();
    for (id, word) in words.iter().enumerate() {
        vocab.insert(word.to_string(), id as u32);
    }
    let model = WordLevel::builder()
        .vocab(vocab)
        .unk_token("[UNK]".into())
        .build()
        .expect("wordlevel model");
    let mut tokenizer = Tokenizer::new(model);
    tokenizer.with_pre_tokenizer(Some(Whitespace::default()));
    tokenizer
}

pub fn test_tokens() -> VisionTokens {
    VisionTokens {
        pad: PAD,
        start: Some(START),
        end: Some(END),
        global: 53,
        slice_start: 54,
        slice_end: 55,
        id_start: 56,
        id_end: 57,
    }
}

pub fn test_settings() -> VisionSettings {
    VisionSettings {
        tokens: test_tokens(),
        image_size: 28,
        ..VisionSettings::default()
    }
}

/// Row `i` of the table holds the value `i` in every column.
pub fn embedding_table() -> EmbeddingTable {
    let data: Vec<f32> = (0..VOCAB).flat_map(|row| [row as f32; HIDDEN]).collect();
    let weight = Tensor::from_vec(data, (VOCAB, HIDDEN), &Device::Cpu).expect("weight");
    EmbeddingTable::new(weight).expect("embedding table")
}

type ShapeFn = dyn Fn(&[Tensor]) -> Vec<usize> + Send + Sync;

/// Vision module stand-in. The n-th forward call fills its output with `1000 + n`.
pub struct FakeEncoder {
    names: Vec<String>,
    device: Device,
    shape: Box<ShapeFn>,
    calls: AtomicUsize,
}

impl FakeEncoder {
    pub fn new(
        names: &[&str],
        shape: impl Fn(&[Tensor]) -> Vec<usize> + Send + Sync + 'static,
    ) -> Self {
        Self {
            names: names.iter().map(|n| n.to_string()).collect(),
            device: Device::Cpu,
            shape: Box::new(shape),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl VisionEncoder for FakeEncoder {
    fn input_names(&self) -> &[String] {
        &self.names
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn forward(&self, inputs: &[Tensor]) -> Result<Tensor> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let mut shape = (self.shape)(inputs);
        shape.push(HIDDEN);
        let value = 1000.0 + call as f64;
        Ok(Tensor::full(value, shape, &self.device)?.to_dtype(DType::F32)?)
    }
}

/// Batched vision stand-in returning `[views, rows, HIDDEN]` where view `i` holds `2000 + i`.
pub struct ViewEncoder {
    names: Vec<String>,
    device: Device,
    rows: usize,
}

impl ViewEncoder {
    pub fn new(names: &[&str], rows: usize) -> Self {
        Self {
            names: names.iter().map(|n| n.to_string()).collect(),
            device: Device::Cpu,
            rows,
        }
    }
}

impl VisionEncoder for ViewEncoder {
    fn input_names(&self) -> &[String] {
        &self.names
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn forward(&self, inputs: &[Tensor]) -> Result<Tensor> {
        let views = inputs[0].dims()[0];
        let data: Vec<f32> = (0..views)
            .flat_map(|view| std::iter::repeat_n(2000.0 + view as f32, self.rows * HIDDEN))
            .collect();
        Ok(Tensor::from_vec(data, (views, self.rows, HIDDEN), &self.device)?)
    }
}

pub const NEWLINE: u32 = 10;

/// Test tokenizer that also knows the tile labels `<row_r_col_c>` (ids `20 + 3(r-1) + (c-1)`)
/// and the newline.
pub struct LabelTokenizer {
    inner: Tokenizer,
}

impl LabelTokenizer {
    pub fn new() -> Self {
        Self {
            inner: build_test_tokenizer(),
        }
    }

    pub fn label(row: u32, col: u32) -> TokenId {
        20 + 3 * (row - 1) + (col - 1)
    }
}

impl TextTokenizer for LabelTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<TokenId>> {
        if text == "\n" {
            return Ok(vec![NEWLINE]);
        }
        let label = text
            .strip_prefix("<row_")
            .and_then(|rest| rest.strip_suffix('>'))
            .and_then(|rest| rest.split_once("_col_"));
        if let Some((row, col)) = label {
            return Ok(vec![Self::label(row.parse()?, col.parse()?)]);
        }
        TextTokenizer::encode(&self.inner, text)
    }
}

/// First-column values under each contiguous pad run, one entry per run.
pub fn pad_run_values(token_ids: &[u32], embeddings: &Tensor) -> Vec<Vec<f32>> {
    let column = first_column(embeddings);
    let mut runs: Vec<Vec<f32>> = Vec::new();
    let mut in_run = false;
    for (id, value) in token_ids.iter().zip(column) {
        if *id == PAD {
            if !in_run {
                runs.push(Vec::new());
            }
            if let Some(run) = runs.last_mut() {
                run.push(value);
            }
            in_run = true;
        } else {
            in_run = false;
        }
    }
    runs
}

pub fn pipeline(encoder: Arc<FakeEncoder>) -> Arc<VisionPipeline> {
    pipeline_with_settings(encoder, test_settings())
}

pub fn pipeline_with_settings(
    encoder: Arc<dyn VisionEncoder>,
    settings: VisionSettings,
) -> Arc<VisionPipeline> {
    Arc::new(VisionPipeline::new(encoder, settings))
}

pub fn solid_part(width: u32, height: u32) -> ImagePart {
    ImagePart::new(DynamicImage::ImageRgb8(RgbImage::from_pixel(
        width,
        height,
        Rgb([200, 100, 50]),
    )))
}

/// First column of a `[seq, hidden]` tensor.
pub fn first_column(tensor: &Tensor) -> Vec<f32> {
    tensor
        .to_vec2::<f32>()
        .expect("2-D tensor")
        .into_iter()
        .map(|row| row[0])
        .collect()
}
