use anyhow::{Context, Result, bail, ensure};
use candle_core::{DType, Device, Tensor};

use crate::tokenizer::TokenId;

/// Maps token ids to decoder input embeddings.
pub trait TokenEmbedder: Send + Sync {
    /// Returns `[ids.len(), hidden]`.
    fn embed(&self, ids: &[TokenId]) -> Result<Tensor>;
}

/// Embedding lookup over a `[vocab, hidden]` weight matrix.
#[derive(Debug, Clone)]
pub struct EmbeddingTable {
    weight: Tensor,
}

impl EmbeddingTable {
    pub fn new(weight: Tensor) -> Result<Self> {
        ensure!(
            weight.rank() == 2,
            "embedding weight must have shape [vocab, hidden], got {:?}",
            weight.dims()
        );
        Ok(Self { weight })
    }

    pub fn vocab_size(&self) -> usize {
        self.weight.dims()[0]
    }
}

impl TokenEmbedder for EmbeddingTable {
    fn embed(&self, ids: &[TokenId]) -> Result<Tensor> {
        let vocab = self.vocab_size();
        if let Some(bad) = ids.iter().find(|&&id| id as usize >= vocab) {
            bail!("token id {bad} is outside the embedding table ({vocab} rows)");
        }
        let ids = ids_tensor(ids, self.weight.device())?;
        gather_token_embeddings(&self.weight, &ids)
    }
}

/// Gather token embeddings for a flat run of input ids.
///
/// `weight` must be `[vocab, hidden]` and `ids` rank-1 `[seq]`. The returned tensor has shape
/// `[seq, hidden]`.
pub fn gather_token_embeddings(weight: &Tensor, ids: &Tensor) -> Result<Tensor> {
    ensure!(
        ids.rank() == 1,
        "input ids must have shape [seq], got rank {}",
        ids.rank()
    );
    let (_vocab, hidden) = weight.shape().dims2()?;
    let seq_len = ids.dim(0)?;
    if seq_len == 0 {
        return Tensor::zeros((0, hidden), weight.dtype(), weight.device())
            .context("failed to allocate empty embedding block");
    }
    let ids = if ids.dtype() == DType::I64 {
        ids.clone()
    } else {
        ids.to_dtype(DType::I64)?
    };
    let weight = weight.force_contiguous()?;
    let gathered = weight.index_select(&ids.force_contiguous()?, 0)?;
    Ok(gathered)
}

/// Token ids as an `i64` tensor of shape `[ids.len()]`.
pub fn ids_tensor(ids: &[TokenId], device: &Device) -> Result<Tensor> {
    let data: Vec<i64> = ids.iter().map(|&id| i64::from(id)).collect();
    let len = data.len();
    Tensor::from_vec(data, len, device).context("failed to build token id tensor")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> Result<EmbeddingTable> {
        // Row i is filled with the value i.
        let data: Vec<f32> = (0..4).flat_map(|row| [row as f32; 3]).collect();
        EmbeddingTable::new(Tensor::from_vec(data, (4, 3), &Device::Cpu)?)
    }

    #[test]
    fn embed_selects_rows_in_order() -> Result<()> {
        let table = table()?;
        let out = table.embed(&[2, 0, 3])?;
        assert_eq!(out.dims(), &[3, 3]);
        let rows = out.to_vec2::<f32>()?;
        assert_eq!(rows[0], vec![2.0; 3]);
        assert_eq!(rows[1], vec![0.0; 3]);
        assert_eq!(rows[2], vec![3.0; 3]);
        Ok(())
    }

    #[test]
    fn embed_handles_empty_and_out_of_range() -> Result<()> {
        let table = table()?;
        assert_eq!(table.embed(&[])?.dims(), &[0, 3]);
        assert!(table.embed(&[4]).is_err());
        Ok(())
    }

    #[test]
    fn rejects_non_matrix_weight() {
        let weight = Tensor::zeros(4, DType::F32, &Device::Cpu).expect("tensor");
        assert!(EmbeddingTable::new(weight).is_err());
    }
}
