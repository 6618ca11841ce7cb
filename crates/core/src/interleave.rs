use std::{collections::VecDeque, ops::Range};

use anyhow::{Context, Result, ensure};
use candle_core::Tensor;

use crate::{error::CompileError, tensor::TokenEmbedder, tokenizer::TokenId};

/// FIFO of vision embedding buffers (`[rows, hidden]`) in production order.
#[derive(Debug, Clone, Default)]
pub struct VisionQueue {
    buffers: VecDeque<Tensor>,
}

impl VisionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, buffer: Tensor) -> Result<()> {
        ensure!(
            buffer.rank() == 2,
            "vision embedding buffer must have shape [rows, hidden], got {:?}",
            buffer.dims()
        );
        self.buffers.push_back(buffer);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Row count of every buffer, front to back.
    pub fn row_counts(&self) -> Vec<usize> {
        self.buffers.iter().map(|b| b.dims()[0]).collect()
    }

    pub fn pop(&mut self) -> Option<Tensor> {
        self.buffers.pop_front()
    }
}

/// One contiguous piece of the interleaved sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Block {
    /// Token ids `ids[range]` embedded through the token table.
    Text(Range<usize>),
    /// The next vision buffer, identified by its queue position.
    Vision(usize),
}

#[derive(Debug, Clone, Copy)]
enum ScanState {
    Text { start: Option<usize> },
    Vision { buffer: usize, remaining: usize },
}

/// Splits `ids` into text runs and vision buffers.
///
/// A pad id starts the next buffer when the current one is exhausted, so adjacent images
/// without separators are split by row count. Without a pad id the whole sequence is text.
pub fn plan(ids: &[TokenId], pad: Option<TokenId>, rows: &[usize]) -> Result<Vec<Block>, CompileError> {
    let mut blocks = Vec::new();
    let mut next_buffer = 0usize;
    let mut state = ScanState::Text { start: None };
    for (position, &id) in ids.iter().enumerate() {
        let is_pad = pad == Some(id);
        state = match (state, is_pad) {
            (ScanState::Text { start }, false) => ScanState::Text {
                start: start.or(Some(position)),
            },
            (ScanState::Vision { buffer, remaining }, false) => {
                if remaining > 0 {
                    return Err(CompileError::ShortPadRun {
                        buffer,
                        consumed: rows[buffer] - remaining,
                        rows: rows[buffer],
                        position,
                    });
                }
                ScanState::Text {
                    start: Some(position),
                }
            }
            (ScanState::Vision { buffer, remaining }, true) if remaining > 0 => {
                ScanState::Vision {
                    buffer,
                    remaining: remaining - 1,
                }
            }
            (state, true) => {
                if let ScanState::Text { start: Some(start) } = state {
                    blocks.push(Block::Text(start..position));
                }
                let buffer = next_buffer;
                let buffer_rows = *rows
                    .get(buffer)
                    .ok_or(CompileError::VisionQueueExhausted { position })?;
                if buffer_rows == 0 {
                    return Err(CompileError::EmptyVisionBuffer { buffer });
                }
                blocks.push(Block::Vision(buffer));
                next_buffer += 1;
                ScanState::Vision {
                    buffer,
                    remaining: buffer_rows - 1,
                }
            }
        };
    }
    match state {
        ScanState::Text { start: Some(start) } => blocks.push(Block::Text(start..ids.len())),
        ScanState::Vision { buffer, remaining } if remaining > 0 => {
            return Err(CompileError::ShortPadRun {
                buffer,
                consumed: rows[buffer] - remaining,
                rows: rows[buffer],
                position: ids.len(),
            });
        }
        _ => {}
    }
    if next_buffer < rows.len() {
        return Err(CompileError::UnconsumedVisionEmbeddings {
            remaining: rows.len() - next_buffer,
        });
    }
    Ok(blocks)
}

/// Rebuilds the decoder input sequence `[seq, hidden]` from token ids and vision buffers.
pub struct EmbeddingInterleaver<'a> {
    embedder: &'a dyn TokenEmbedder,
    pad: Option<TokenId>,
}

impl<'a> EmbeddingInterleaver<'a> {
    pub fn new(embedder: &'a dyn TokenEmbedder, pad: Option<TokenId>) -> Self {
        Self { embedder, pad }
    }

    pub fn interleave(&self, ids: &[TokenId], mut vision: VisionQueue) -> Result<Tensor> {
        ensure!(!ids.is_empty(), "cannot build embeddings for an empty token sequence");
        let blocks = plan(ids, self.pad, &vision.row_counts())?;

        let mut text_blocks = Vec::new();
        for block in &blocks {
            if let Block::Text(range) = block {
                text_blocks.push(self.embedder.embed(&ids[range.clone()])?);
            }
        }
        let reference = text_blocks.first().map(|t| (t.dtype(), t.device().clone()));

        let mut text_iter = text_blocks.into_iter();
        let mut segments = Vec::with_capacity(blocks.len());
        for block in &blocks {
            let segment = match block {
                Block::Text(_) => text_iter
                    .next()
                    .context("text block count changed while interleaving")?,
                Block::Vision(index) => {
                    let buffer = vision
                        .pop()
                        .with_context(|| format!("vision buffer {index} missing from queue"))?;
                    match &reference {
                        Some((dtype, device)) => buffer.to_dtype(*dtype)?.to_device(device)?,
                        None => buffer,
                    }
                }
            };
            segments.push(segment);
        }
        let hidden = segments.iter().map(|s| s.dims()[1]).collect::<Vec<_>>();
        ensure!(
            hidden.windows(2).all(|w| w[0] == w[1]),
            "text and vision embeddings disagree on hidden size: {hidden:?}"
        );
        Ok(Tensor::cat(&segments, 0)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    const PAD: TokenId = 99;

    struct ConstEmbedder;

    impl TokenEmbedder for ConstEmbedder {
        fn embed(&self, ids: &[TokenId]) -> Result<Tensor> {
            let data: Vec<f32> = ids.iter().flat_map(|&id| [id as f32; 2]).collect();
            Ok(Tensor::from_vec(data, (ids.len(), 2), &Device::Cpu)?)
        }
    }

    fn buffer(rows: usize, value: f32) -> Tensor {
        Tensor::full(value, (rows, 2), &Device::Cpu).expect("buffer")
    }

    #[test]
    fn plan_text_pad_text() {
        let blocks = plan(&[5, 6, PAD, PAD, PAD, 7], Some(PAD), &[3]).expect("plan");
        assert_eq!(
            blocks,
            vec![Block::Text(0..2), Block::Vision(0), Block::Text(5..6)]
        );
    }

    #[test]
    fn plan_without_pad_is_one_text_block() {
        let blocks = plan(&[1, PAD, 2], None, &[]).expect("plan");
        assert_eq!(blocks, vec![Block::Text(0..3)]);
    }

    #[test]
    fn adjacent_runs_split_by_row_count() {
        let blocks = plan(&[PAD, PAD, PAD], Some(PAD), &[1, 2]).expect("plan");
        assert_eq!(blocks, vec![Block::Vision(0), Block::Vision(1)]);
    }

    #[test]
    fn pads_without_buffers_exhaust_queue() {
        let err = plan(&[PAD, PAD], Some(PAD), &[]).unwrap_err();
        assert_eq!(err, CompileError::VisionQueueExhausted { position: 0 });
    }

    #[test]
    fn mismatched_runs_are_fatal() {
        let err = plan(&[PAD, 1], Some(PAD), &[2]).unwrap_err();
        assert_eq!(
            err,
            CompileError::ShortPadRun {
                buffer: 0,
                consumed: 1,
                rows: 2,
                position: 1
            }
        );
        let err = plan(&[PAD], Some(PAD), &[1, 4]).unwrap_err();
        assert_eq!(err, CompileError::UnconsumedVisionEmbeddings { remaining: 1 });
        let err = plan(&[PAD], Some(PAD), &[0]).unwrap_err();
        assert_eq!(err, CompileError::EmptyVisionBuffer { buffer: 0 });
    }

    #[test]
    fn interleave_splices_vision_rows() -> Result<()> {
        let mut queue = VisionQueue::new();
        queue.push(buffer(3, -1.0).to_dtype(DType::F64)?)?;
        let out = EmbeddingInterleaver::new(&ConstEmbedder, Some(PAD))
            .interleave(&[5, 6, PAD, PAD, PAD, 7], queue)?;
        assert_eq!(out.dims(), &[6, 2]);
        assert_eq!(out.dtype(), DType::F32);
        let column: Vec<f32> = out.to_vec2::<f32>()?.into_iter().map(|r| r[0]).collect();
        assert_eq!(column, vec![5.0, 6.0, -1.0, -1.0, -1.0, 7.0]);
        Ok(())
    }

    #[test]
    fn interleave_reports_typed_error() {
        let err = EmbeddingInterleaver::new(&ConstEmbedder, Some(PAD))
            .interleave(&[PAD, PAD], VisionQueue::new())
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<CompileError>(),
            Some(&CompileError::VisionQueueExhausted { position: 0 })
        );
    }
}
