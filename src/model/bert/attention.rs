//! Multi-head attention for the BERT encoder.
//!
//! Scores follow the BERT formulation, optionally extended with learned
//! relative-distance embeddings (Shaw et al. 2018, the "music transformer"
//! relative attention):
//!
//! ```text
//! scores = Q·Kᵀ                               (absolute)
//!        + Q·E_{l-r}ᵀ                         (relative_key)
//!        + K·E_{l-r}ᵀ                         (relative_key_query)
//! probs  = softmax(scores / √d + mask)
//! ```
//!
//! where `E` has `2·max_position_embeddings - 1` rows indexed by the signed
//! distance between query position `l` and key position `r`.

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{Dropout, Embedding, LayerNorm, Linear, VarBuilder};

use crate::config::{BertConfig, PositionEmbeddingType};
use crate::{Error, Result};

/// Query/key/value projections and scaled dot-product attention.
///
/// Used for self-attention (`kv` = `hidden_states`) and cross-attention
/// (`kv` = encoder output).
#[derive(Debug, Clone)]
pub struct BertSelfAttention {
    query: Linear,
    key: Linear,
    value: Linear,
    dropout: Dropout,
    distance_embedding: Option<Embedding>,
    position_embedding_type: PositionEmbeddingType,
    max_position_embeddings: usize,
    num_heads: usize,
    head_dim: usize,
}

impl BertSelfAttention {
    pub fn new(cfg: &BertConfig, vb: VarBuilder) -> Result<Self> {
        let all_head_size = cfg.num_attention_heads * cfg.head_dim();
        let query = candle_nn::linear(cfg.hidden_size, all_head_size, vb.pp("query"))?;
        let key = candle_nn::linear(cfg.hidden_size, all_head_size, vb.pp("key"))?;
        let value = candle_nn::linear(cfg.hidden_size, all_head_size, vb.pp("value"))?;
        let distance_embedding = match cfg.position_embedding_type {
            PositionEmbeddingType::Absolute => None,
            PositionEmbeddingType::RelativeKey | PositionEmbeddingType::RelativeKeyQuery => {
                Some(candle_nn::embedding(
                    2 * cfg.max_position_embeddings - 1,
                    cfg.head_dim(),
                    vb.pp("distance_embedding"),
                )?)
            }
        };
        Ok(Self {
            query,
            key,
            value,
            dropout: Dropout::new(cfg.attention_probs_dropout_prob as f32),
            distance_embedding,
            position_embedding_type: cfg.position_embedding_type,
            max_position_embeddings: cfg.max_position_embeddings,
            num_heads: cfg.num_attention_heads,
            head_dim: cfg.head_dim(),
        })
    }

    /// `[B, S, H·D]` → `[B, H, S, D]`
    fn split_heads(&self, xs: &Tensor) -> Result<Tensor> {
        let (batch, seq_len, _) = xs.dims3()?;
        Ok(xs
            .reshape((batch, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?)
    }

    /// Relative-distance embeddings `[L, R, D]`.
    fn distance_embeddings(
        &self,
        embedding: &Embedding,
        q_len: usize,
        k_len: usize,
        device: &Device,
    ) -> Result<Tensor> {
        let max = self.max_position_embeddings;
        if q_len > max || k_len > max {
            return Err(Error::Config(format!(
                "sequence of {} positions exceeds max_position_embeddings {max}",
                q_len.max(k_len)
            )));
        }
        let ids: Vec<u32> = (0..q_len)
            .flat_map(|l| (0..k_len).map(move |r| (l + max - 1 - r) as u32))
            .collect();
        let ids = Tensor::from_vec(ids, (q_len, k_len), device)?;
        Ok(embedding.forward(&ids)?)
    }

    /// Forward pass.
    ///
    /// - `hidden_states`: `[B, L, hidden]`: queries
    /// - `kv`: `[B, R, hidden]`: keys/values, `None` for self-attention
    /// - `mask`: additive, broadcastable to `[B, H, L, R]`
    ///
    /// Returns the context `[B, L, hidden]`.
    pub fn forward(
        &self,
        hidden_states: &Tensor,
        kv: Option<&Tensor>,
        mask: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        let kv = kv.unwrap_or(hidden_states);
        let (batch, q_len, _) = hidden_states.dims3()?;
        let k_len = kv.dim(1)?;

        let q = self.split_heads(&self.query.forward(hidden_states)?)?;
        let k = self.split_heads(&self.key.forward(kv)?)?;
        let v = self.split_heads(&self.value.forward(kv)?)?;

        // [B, H, L, R]
        let mut scores = q.matmul(&k.transpose(2, 3)?.contiguous()?)?;

        if let Some(embedding) = &self.distance_embedding {
            let positional = self
                .distance_embeddings(embedding, q_len, k_len, hidden_states.device())?
                .to_dtype(q.dtype())?;
            // einsum("bhld,lrd->bhlr"): batch the matmul over query positions.
            let pos_t = positional.transpose(1, 2)?.contiguous()?; // [L, D, R]
            let q_by_pos = q
                .permute((2, 0, 1, 3))? // [L, B, H, D]
                .reshape((q_len, batch * self.num_heads, self.head_dim))?;
            let rel_q = q_by_pos
                .matmul(&pos_t)? // [L, B·H, R]
                .reshape((q_len, batch, self.num_heads, k_len))?
                .permute((1, 2, 0, 3))?;
            scores = (scores + rel_q)?;

            if self.position_embedding_type == PositionEmbeddingType::RelativeKeyQuery {
                // einsum("bhrd,lrd->bhlr")
                let rel_k = k
                    .unsqueeze(2)? // [B, H, 1, R, D]
                    .broadcast_mul(&positional.unsqueeze(0)?.unsqueeze(0)?)? // [B, H, L, R, D]
                    .sum(4)?;
                scores = (scores + rel_k)?;
            }
        }

        let mut scores = (scores / (self.head_dim as f64).sqrt())?;
        if let Some(mask) = mask {
            scores = scores.broadcast_add(&mask.to_dtype(scores.dtype())?)?;
        }

        let probs = candle_nn::ops::softmax_last_dim(&scores.to_dtype(DType::F32)?)?
            .to_dtype(scores.dtype())?;
        let probs = self.dropout.forward(&probs, train)?;

        let context = probs.matmul(&v)?; // [B, H, L, D]
        Ok(context
            .transpose(1, 2)?
            .reshape((batch, q_len, self.num_heads * self.head_dim))?)
    }
}

/// Dense projection, dropout and post-norm residual.
#[derive(Debug, Clone)]
pub struct BertSelfOutput {
    dense: Linear,
    layer_norm: LayerNorm,
    dropout: Dropout,
}

impl BertSelfOutput {
    pub fn new(cfg: &BertConfig, in_dim: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            dense: candle_nn::linear(in_dim, cfg.hidden_size, vb.pp("dense"))?,
            layer_norm: candle_nn::layer_norm(cfg.hidden_size, cfg.layer_norm_eps, vb.pp("LayerNorm"))?,
            dropout: Dropout::new(cfg.hidden_dropout_prob as f32),
        })
    }

    pub fn forward(&self, hidden_states: &Tensor, input: &Tensor, train: bool) -> Result<Tensor> {
        let h = self.dense.forward(hidden_states)?;
        let h = self.dropout.forward(&h, train)?;
        Ok(self.layer_norm.forward(&(h + input)?)?)
    }
}

/// Attention block: attention followed by its output projection.
#[derive(Debug, Clone)]
pub struct BertAttention {
    attention: BertSelfAttention,
    output: BertSelfOutput,
}

impl BertAttention {
    pub fn new(cfg: &BertConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            attention: BertSelfAttention::new(cfg, vb.pp("self"))?,
            output: BertSelfOutput::new(cfg, cfg.hidden_size, vb.pp("output"))?,
        })
    }

    pub fn forward(
        &self,
        hidden_states: &Tensor,
        kv: Option<&Tensor>,
        mask: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        let context = self.attention.forward(hidden_states, kv, mask, train)?;
        self.output.forward(&context, hidden_states, train)
    }
}
