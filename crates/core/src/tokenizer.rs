use anyhow::{Result, anyhow};
use tokenizers::Tokenizer;

/// Token id as stored in compiled sequences.
pub type TokenId = u32;

/// Subword tokenizer used for literal text spans and synthesised labels.
pub trait TextTokenizer: Send + Sync {
    fn encode(&self, text: &str) -> Result<Vec<TokenId>>;

    /// First id produced for `text`; labels such as `<row_1_col_2>` are expected to map to
    /// a single special token.
    fn encode_single(&self, text: &str) -> Result<TokenId> {
        self.encode(text)?
            .first()
            .copied()
            .ok_or_else(|| anyhow!("tokenizer produced no ids for `{text}`"))
    }
}

impl TextTokenizer for Tokenizer {
    fn encode(&self, text: &str) -> Result<Vec<TokenId>> {
        if text.is_empty() {
            return Ok(Vec::new());
        }
        let encoding = (**self)
            .encode(text, false)
            .map_err(|err| anyhow!("tokenization failed: {err}"))?;
        Ok(encoding.get_ids().to_vec())
    }
}

impl<T: TextTokenizer + ?Sized> TextTokenizer for &T {
    fn encode(&self, text: &str) -> Result<Vec<TokenId>> {
        (**self).encode(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ahash::AHashMap;
    use tokenizers::{models::wordlevel::WordLevel, pre_tokenizers::whitespace::Whitespace};

    fn tokenizer() -> Tokenizer {
        let mut vocab = AHashMap::new();
        vocab.insert("[UNK]".to_string(), 0);
        vocab.insert("hello".to_string(), 1);
        vocab.insert("world".to_string(), 2);
        let model = WordLevel::builder()
            .vocab(vocab)
            .unk_token("[UNK]".into())
            .build()
            .expect("wordlevel model");
        let mut tokenizer = Tokenizer::new(model);
        tokenizer.with_pre_tokenizer(Some(Whitespace::default()));
        tokenizer
    }

    #[test]
    fn empty_text_encodes_to_nothing() -> Result<()> {
        let tok = tokenizer();
        assert!(TextTokenizer::encode(&tok, "")?.is_empty());
        assert_eq!(TextTokenizer::encode(&tok, "hello world")?, vec![1, 2]);
        Ok(())
    }

    #[test]
    fn encode_single_takes_first_id() -> Result<()> {
        let tok = tokenizer();
        assert_eq!(tok.encode_single("world hello")?, 2);
        assert!(tok.encode_single("").is_err());
        Ok(())
    }
}
