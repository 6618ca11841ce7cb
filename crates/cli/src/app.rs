use std::{
    io::{self, Write},
    sync::Arc,
};

use anyhow::{Context, Result, anyhow};
use candle_core::{DType, Device, Tensor};
use omni_prompt_config::{AppConfig, CompileSettings, ModelConfig};
use omni_prompt_core::{
    CompileStats, EmbeddingTable, ImageFetcher, LocalImageFetcher, PositionEncoding, PositionIds,
    PromptCompiler, TokenId, VisionPipeline,
};
use serde::Serialize;
use tokenizers::Tokenizer;
use tracing::{info, warn};

use crate::{args::InspectArgs, encoder::ShapeOnlyEncoder, prompt::load_prompt};

#[derive(Debug, Serialize)]
struct InspectReport {
    model: String,
    scheme: Option<&'static str>,
    position_encoding: PositionEncoding,
    token_ids: Vec<TokenId>,
    /// One `[t, h, w]` triple per token; sequential positions repeat the scalar.
    positions: Vec<[i64; 3]>,
    vision_rows: Vec<usize>,
    embedding_shape: Vec<usize>,
    stats: StatsReport,
}

#[derive(Debug, Serialize)]
struct StatsReport {
    images: usize,
    skipped_images: usize,
    vision_rows: usize,
    text_tokens: usize,
    vision_us: u64,
}

impl From<&CompileStats> for StatsReport {
    fn from(stats: &CompileStats) -> Self {
        Self {
            images: stats.images,
            skipped_images: stats.skipped_images,
            vision_rows: stats.vision_rows,
            text_tokens: stats.text_tokens,
            vision_us: stats.vision_us,
        }
    }
}

pub fn run_inspect(args: InspectArgs) -> Result<()> {
    let prompt = load_prompt(&args)?;

    let (app_config, descriptor, resources) = AppConfig::load_with_overrides((&args).into())?;
    match descriptor.location.as_ref() {
        Some(path) => info!(
            "Using configuration {} (active model `{}`)",
            path.display(),
            app_config.models.active
        ),
        None => info!("Using built-in configuration defaults"),
    }

    let model = match resources.config.as_deref() {
        Some(path) => ModelConfig::load(path)?,
        None => {
            warn!(model = %resources.id, "no model config given, treating model as text-only");
            ModelConfig::default()
        }
    };
    let tokenizer_path = resources.tokenizer_path()?;
    let tokenizer = Tokenizer::from_file(tokenizer_path).map_err(|err| {
        anyhow!(
            "failed to load tokenizer from {}: {err}",
            tokenizer_path.display()
        )
    })?;
    let vocab_size = tokenizer.get_vocab_size(true);

    let hidden = args
        .hidden_size
        .or(model.hidden_size)
        .unwrap_or(app_config.inspect.hidden_size)
        .max(1);
    let encoding = app_config
        .compile
        .position_encoding
        .unwrap_or_else(|| model.position_encoding());

    let mut compiler = PromptCompiler::new(Arc::new(tokenizer))
        .with_fetcher(build_fetcher(&app_config.compile)?)
        .with_position_encoding(encoding);
    if let Some(settings) = model.vision_settings()? {
        let names = if args.visual_inputs.is_empty() {
            model.visual_inputs.clone()
        } else {
            args.visual_inputs.clone()
        };
        let encoder = ShapeOnlyEncoder::new(
            names,
            &settings,
            hidden,
            app_config.inspect.default_rows,
        );
        compiler = compiler.with_vision(Arc::new(VisionPipeline::new(
            Arc::new(encoder),
            settings,
        )));
    }

    let compiled = compiler.compile(&prompt)?;
    let scheme = compiler.vision().map(|vision| vision.scheme().name());
    let vision_rows = compiled.vision.row_counts();
    let stats = StatsReport::from(&compiled.stats);
    let max_id = compiled.token_ids.iter().copied().max().map_or(0, |id| id as usize + 1);

    let table = zero_table(vocab_size.max(max_id), hidden)?;
    let inputs = compiled.prefill(&table, 0)?;

    let report = InspectReport {
        model: resources.id.clone(),
        scheme,
        position_encoding: encoding,
        positions: position_triples(&inputs.position_ids),
        embedding_shape: inputs.embeddings.dims().to_vec(),
        token_ids: inputs.token_ids,
        vision_rows,
        stats,
    };

    let stdout = io::stdout();
    let mut out = stdout.lock();
    if args.json {
        serde_json::to_writer_pretty(&mut out, &report).context("failed to write JSON report")?;
        writeln!(out)?;
    } else {
        write_text_report(&mut out, &report)?;
    }
    out.flush()?;
    Ok(())
}

fn build_fetcher(settings: &CompileSettings) -> Result<Arc<dyn ImageFetcher>> {
    let local = match settings.image_root.as_ref() {
        Some(root) => LocalImageFetcher::with_root(root),
        None => LocalImageFetcher::new(),
    };
    if settings.allow_remote_images {
        #[cfg(feature = "remote-images")]
        {
            return Ok(Arc::new(omni_prompt_core::HttpImageFetcher::new(local)));
        }
        #[cfg(not(feature = "remote-images"))]
        {
            anyhow::bail!("remote images need a build with the `remote-images` feature");
        }
    }
    Ok(Arc::new(local))
}

fn zero_table(vocab: usize, hidden: usize) -> Result<EmbeddingTable> {
    let weight = Tensor::zeros((vocab.max(1), hidden), DType::F32, &Device::Cpu)?;
    EmbeddingTable::new(weight)
}

fn position_triples(ids: &PositionIds) -> Vec<[i64; 3]> {
    match ids {
        PositionIds::Sequential(seq) => seq.iter().map(|&p| [p, p, p]).collect(),
        PositionIds::Mrope([t, h, w]) => t
            .iter()
            .zip(h)
            .zip(w)
            .map(|((&t, &h), &w)| [t, h, w])
            .collect(),
    }
}

fn write_text_report(out: &mut impl Write, report: &InspectReport) -> Result<()> {
    writeln!(out, "model:      {}", report.model)?;
    writeln!(out, "scheme:     {}", report.scheme.unwrap_or("none (text-only)"))?;
    writeln!(out, "positions:  {:?}", report.position_encoding)?;
    writeln!(
        out,
        "tokens:     {} ({} text, {} vision rows across {} buffers)",
        report.token_ids.len(),
        report.stats.text_tokens,
        report.stats.vision_rows,
        report.vision_rows.len()
    )?;
    writeln!(
        out,
        "images:     {} ({} skipped, {} us in vision)",
        report.stats.images, report.stats.skipped_images, report.stats.vision_us
    )?;
    writeln!(out, "embeddings: {:?}", report.embedding_shape)?;
    writeln!(out)?;
    writeln!(out, "{:>6}  {:>8}  {:>6} {:>6} {:>6}", "index", "id", "t", "h", "w")?;
    for (index, (id, [t, h, w])) in report.token_ids.iter().zip(&report.positions).enumerate() {
        writeln!(out, "{index:>6}  {id:>8}  {t:>6} {h:>6} {w:>6}")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequential_positions_are_repeated_across_axes() {
        let triples = position_triples(&PositionIds::Sequential(vec![4, 5]));
        assert_eq!(triples, vec![[4, 4, 4], [5, 5, 5]]);
        let triples = position_triples(&PositionIds::Mrope([vec![1, 2], vec![1, 3], vec![1, 4]]));
        assert_eq!(triples, vec![[1, 1, 1], [2, 3, 4]]);
    }

    #[test]
    fn text_report_lists_every_token() -> Result<()> {
        let report = InspectReport {
            model: "default".into(),
            scheme: None,
            position_encoding: PositionEncoding::Sequential,
            token_ids: vec![7, 9],
            positions: vec![[0, 0, 0], [1, 1, 1]],
            vision_rows: Vec::new(),
            embedding_shape: vec![2, 8],
            stats: StatsReport::from(&CompileStats::default()),
        };
        let mut buf = Vec::new();
        write_text_report(&mut buf, &report)?;
        let text = String::from_utf8(buf)?;
        assert!(text.contains("none (text-only)"));
        assert_eq!(text.lines().count(), 7 + 1 + 2);
        Ok(())
    }
}
