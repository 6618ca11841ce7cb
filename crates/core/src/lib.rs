pub mod compile;
pub mod error;
pub mod image_source;
pub mod interleave;
pub mod mrope;
pub mod prompt;
pub mod settings;
pub mod tensor;
pub mod timing;
pub mod tokenizer;
pub mod vision;

pub use compile::{CompiledPrompt, DecoderInputs, PromptCompiler};
pub use error::CompileError;
#[cfg(feature = "remote-images")]
pub use image_source::HttpImageFetcher;
pub use image_source::{ImageFetcher, LocalImageFetcher, NoFetch};
pub use interleave::{EmbeddingInterleaver, VisionQueue};
pub use mrope::{MropePositions, PositionIds, VisionGrid};
pub use prompt::{ImagePart, MultimodalPrompt, SizeHint, Span, parse_prompt};
pub use settings::{PositionEncoding, VisionSettings, VisionTokens};
pub use tensor::{EmbeddingTable, TokenEmbedder};
pub use timing::CompileStats;
pub use tokenizer::{TextTokenizer, TokenId};
pub use vision::{VisionEncoder, VisionPipeline, VisionScheme};
