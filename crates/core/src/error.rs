use thiserror::Error;

/// Invariant violations between placeholder ids and vision embedding rows.
///
/// These indicate a patchifier producing id-runs that disagree with its own forward outputs
/// and are never recovered from: the caller should abort the request rather than feed a
/// misaligned sequence to the decoder.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CompileError {
    #[error("vision queue exhausted at token {position}: no embedding buffer left for pad run")]
    VisionQueueExhausted { position: usize },
    #[error(
        "pad run ended at token {position} after {consumed} of {rows} rows of vision buffer {buffer}"
    )]
    ShortPadRun {
        buffer: usize,
        consumed: usize,
        rows: usize,
        position: usize,
    },
    #[error("vision buffer {buffer} has no embedding rows")]
    EmptyVisionBuffer { buffer: usize },
    #[error("{remaining} vision embedding buffer(s) left unconsumed after interleaving")]
    UnconsumedVisionEmbeddings { remaining: usize },
    #[error("{scheme} id-run carries {pads} pad ids but the vision module produced {rows} rows")]
    PadRowMismatch {
        scheme: &'static str,
        pads: usize,
        rows: usize,
    },
    #[error("position table covers {positions} tokens but the sequence has {tokens}")]
    PositionLengthMismatch { positions: usize, tokens: usize },
}
