//! Denoising transformer of the diffusion language model.
//!
//! Predicts clean note embeddings from noised ones. In `ConditionalGen` mode
//! a source sequence is encoded separately and attended to through
//! cross-attention in every decoder layer.
//!
//! ```text
//! t ──sinusoid(model_channels)──▶ Linear ─ SiLU ─ Linear ──────────────┐
//! x ──up_proj──▶ e ──(e + PE) + e ─────────────────────────────────── + ─▶ LayerNorm ─▶ Dropout
//!                                                                             │
//! src_ids ─▶ encoder_emb ─▶ encoder ─────────── cross-attention ──▶ input_transformers
//!                                                                             │
//!                                                              output_down_proj ─▶ [B, L, out]
//! ```

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{Dropout, Embedding, LayerNorm, Linear, VarBuilder};
use serde::{Deserialize, Serialize};

use crate::config::{BertConfig, PositionEmbeddingType};
use crate::model::bert::BertEncoder;
use crate::model::timed::UpProjection;
use crate::model::timestep::timestep_embedding;
use crate::{Error, Result};

/// Longest sequence and timestep period the model supports.
pub const MAX_PERIOD: usize = 2048;

/// Unconditional or source-conditioned generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentMode {
    #[default]
    Lm,
    ConditionalGen,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MusicTransformerConfig {
    /// Note embedding width.
    pub in_channels: usize,
    /// Width of the sinusoidal timestep embedding.
    pub model_channels: usize,
    pub out_channels: usize,
    #[serde(default)]
    pub dropout: f64,
    pub vocab_size: usize,
    #[serde(default)]
    pub experiment_mode: ExperimentMode,
}

impl MusicTransformerConfig {
    /// Unconditional model predicting embeddings of its input width.
    pub fn lm(in_channels: usize, model_channels: usize, vocab_size: usize) -> Self {
        Self {
            in_channels,
            model_channels,
            out_channels: in_channels,
            dropout: 0.0,
            vocab_size,
            experiment_mode: ExperimentMode::Lm,
        }
    }
}

/// Sinusoidal position table `[max_len, d_model]`: even columns `sin`, odd
/// columns `cos`.
#[derive(Debug, Clone)]
pub struct PositionalEncoding {
    pe: Tensor,
    dropout: Dropout,
}

impl PositionalEncoding {
    pub fn new(d_model: usize, dropout: f64, max_len: usize, device: &Device) -> Result<Self> {
        let mut table = vec![0f32; max_len * d_model];
        for pos in 0..max_len {
            for i in (0..d_model).step_by(2) {
                let div = (-(10000f64.ln()) * i as f64 / d_model as f64).exp();
                let angle = pos as f64 * div;
                table[pos * d_model + i] = angle.sin() as f32;
                if i + 1 < d_model {
                    table[pos * d_model + i + 1] = angle.cos() as f32;
                }
            }
        }
        Ok(Self {
            pe: Tensor::from_vec(table, (max_len, d_model), device)?,
            dropout: Dropout::new(dropout as f32),
        })
    }

    /// `x + pe[0..L]` for `x` `[B, L, d_model]`.
    pub fn forward(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let seq_len = xs.dim(1)?;
        let pe = self.pe.narrow(0, 0, seq_len)?.to_dtype(xs.dtype())?.unsqueeze(0)?;
        Ok(self.dropout.forward(&xs.broadcast_add(&pe)?, train)?)
    }
}

#[derive(Debug, Clone)]
struct Conditioning {
    encoder_emb: Embedding,
    encoder: BertEncoder,
}

#[derive(Debug, Clone)]
pub struct MusicTransformer {
    word_embedding: Embedding,
    lm_head: Linear,
    time_embed: (Linear, Linear),
    input_up_proj: UpProjection,
    positional_encoding: PositionalEncoding,
    layer_norm: LayerNorm,
    dropout: Dropout,
    input_transformers: BertEncoder,
    output_down_proj: (Linear, Linear),
    conditioning: Option<Conditioning>,
    model_channels: usize,
}

impl MusicTransformer {
    pub fn new(cfg: &MusicTransformerConfig, bert: &BertConfig, vb: VarBuilder) -> Result<Self> {
        let mut encoder_cfg = bert.clone();
        encoder_cfg.hidden_dropout_prob = cfg.dropout;
        encoder_cfg.max_position_embeddings = MAX_PERIOD;
        encoder_cfg.position_embedding_type = PositionEmbeddingType::RelativeKey;
        let hidden = encoder_cfg.hidden_size;

        let conditioning = match cfg.experiment_mode {
            ExperimentMode::Lm => None,
            ExperimentMode::ConditionalGen => Some(Conditioning {
                encoder_emb: candle_nn::embedding(cfg.vocab_size, hidden, vb.pp("encoder_emb"))?,
                encoder: BertEncoder::new(&encoder_cfg, vb.pp("encoder"))?,
            }),
        };
        let mut decoder_cfg = encoder_cfg.clone();
        decoder_cfg.add_cross_attention = conditioning.is_some();

        let word_embedding = candle_nn::embedding(cfg.vocab_size, cfg.in_channels, vb.pp("word_embedding"))?;
        let lm_bias = vb.pp("lm_head").get(cfg.vocab_size, "bias")?;
        let lm_head = Linear::new(word_embedding.embeddings().clone(), Some(lm_bias));

        let time_embed_dim = cfg.model_channels * 4;
        let time_embed = (
            candle_nn::linear(cfg.model_channels, time_embed_dim, vb.pp("time_embed.0"))?,
            candle_nn::linear(time_embed_dim, hidden, vb.pp("time_embed.2"))?,
        );
        let output_down_proj = (
            candle_nn::linear(hidden, hidden, vb.pp("output_down_proj.0"))?,
            candle_nn::linear(hidden, cfg.out_channels, vb.pp("output_down_proj.2"))?,
        );

        Ok(Self {
            word_embedding,
            lm_head,
            time_embed,
            input_up_proj: UpProjection::new(cfg.in_channels, hidden, vb.pp("input_up_proj"))?,
            positional_encoding: PositionalEncoding::new(hidden, cfg.dropout, MAX_PERIOD, vb.device())?,
            layer_norm: candle_nn::layer_norm(hidden, encoder_cfg.layer_norm_eps, vb.pp("LayerNorm"))?,
            dropout: Dropout::new(cfg.dropout as f32),
            input_transformers: BertEncoder::new(&decoder_cfg, vb.pp("input_transformers"))?,
            output_down_proj,
            conditioning,
            model_channels: cfg.model_channels,
        })
    }

    /// Token ids → note embeddings.
    pub fn get_embeds(&self, input_ids: &Tensor) -> Result<Tensor> {
        Ok(self.word_embedding.forward(input_ids)?)
    }

    /// Note embeddings → vocabulary logits, through the tied embedding matrix.
    pub fn get_logits(&self, hidden: &Tensor) -> Result<Tensor> {
        Ok(self.lm_head.forward(hidden)?)
    }

    /// - `x`: noised embeddings `[B, L, in_channels]`
    /// - `timesteps`: `[B]`
    /// - `src_ids`, `src_mask`: `[B, S]`, conditional mode only
    ///
    /// Returns `[B, L, out_channels]` in the dtype of `x`.
    pub fn forward(
        &self,
        x: &Tensor,
        timesteps: &Tensor,
        src_ids: Option<&Tensor>,
        src_mask: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        let seq_len = x.dim(1)?;
        if seq_len > MAX_PERIOD {
            return Err(Error::Config(format!(
                "sequence length {seq_len} exceeds {MAX_PERIOD}"
            )));
        }

        let t_freq = timestep_embedding(timesteps, self.model_channels, MAX_PERIOD as f64)?
            .to_dtype(x.dtype())?;
        let emb = self
            .time_embed
            .1
            .forward(&self.time_embed.0.forward(&t_freq)?.silu()?)?;

        let memory = match &self.conditioning {
            Some(cond) => {
                let (Some(src_ids), Some(src_mask)) = (src_ids, src_mask) else {
                    return Err(Error::NotImplemented(
                        "conditional generation needs src_ids and src_mask".into(),
                    ));
                };
                let src_emb = cond.encoder_emb.forward(src_ids)?;
                let encoded = cond.encoder.forward(&src_emb, Some(src_mask), None, None, train)?;
                Some((encoded.last_hidden_state, src_mask))
            }
            None => None,
        };

        let emb_x = self.input_up_proj.forward(x)?;
        let emb_inputs = (self.positional_encoding.forward(&emb_x, train)? + &emb_x)?
            .broadcast_add(&emb.unsqueeze(1)?)?;
        let emb_inputs = self.dropout.forward(&self.layer_norm.forward(&emb_inputs)?, train)?;

        let hidden = match &memory {
            Some((states, mask)) => {
                self.input_transformers
                    .forward(&emb_inputs, None, Some(states), Some(mask), train)?
            }
            None => self.input_transformers.forward(&emb_inputs, None, None, None, train)?,
        };

        let h = self
            .output_down_proj
            .1
            .forward(&self.output_down_proj.0.forward(&hidden.last_hidden_state)?.tanh()?)?;
        Ok(h.to_dtype(x.dtype())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::IndexOp;
    use candle_nn::VarMap;

    fn bert() -> BertConfig {
        BertConfig {
            hidden_size: 16,
            num_hidden_layers: 1,
            num_attention_heads: 2,
            intermediate_size: 32,
            ..BertConfig::default()
        }
    }

    fn build(cfg: &MusicTransformerConfig) -> (VarMap, MusicTransformer) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = MusicTransformer::new(cfg, &bert(), vb).unwrap();
        (varmap, model)
    }

    #[test]
    fn positional_encoding_table() {
        let pe = PositionalEncoding::new(4, 0.0, 10, &Device::Cpu).unwrap();
        let x = Tensor::zeros((1, 3, 4), DType::F32, &Device::Cpu).unwrap();
        let out: Vec<Vec<f32>> = pe.forward(&x, false).unwrap().i(0).unwrap().to_vec2().unwrap();
        assert_eq!(out[0], vec![0.0, 1.0, 0.0, 1.0]);
        assert!((out[1][0] - 1f32.sin()).abs() < 1e-6);
        assert!((out[2][1] - 2f32.cos()).abs() < 1e-6);
    }

    #[test]
    fn lm_forward_shape_and_tied_head() {
        let cfg = MusicTransformerConfig::lm(8, 12, 30);
        let (varmap, model) = build(&cfg);
        let dev = Device::Cpu;

        let ids = Tensor::new(&[[1u32, 2, 3, 4, 5], [6, 7, 8, 9, 10]], &dev).unwrap();
        let x = model.get_embeds(&ids).unwrap();
        let t = Tensor::new(&[3u32, 700], &dev).unwrap();
        let out = model.forward(&x, &t, None, None, false).unwrap();
        assert_eq!(out.dims(), &[2, 5, 8]);

        let logits = model.get_logits(&out).unwrap();
        assert_eq!(logits.dims(), &[2, 5, 30]);
        let names: Vec<String> = varmap.data().lock().unwrap().keys().cloned().collect();
        assert!(names.iter().any(|n| n == "lm_head.bias"));
        assert!(!names.iter().any(|n| n == "lm_head.weight"));
        assert!(!names.iter().any(|n| n.starts_with("encoder")));
    }

    #[test]
    fn conditional_generation_requires_source() {
        let cfg = MusicTransformerConfig {
            experiment_mode: ExperimentMode::ConditionalGen,
            ..MusicTransformerConfig::lm(8, 12, 30)
        };
        let (_varmap, model) = build(&cfg);
        let dev = Device::Cpu;
        let x = Tensor::randn(0f32, 1.0, (2, 4, 8), &dev).unwrap();
        let t = Tensor::new(&[1u32, 2], &dev).unwrap();
        assert!(matches!(
            model.forward(&x, &t, None, None, false),
            Err(Error::NotImplemented(_))
        ));

        let src = Tensor::new(&[[1u32, 2, 3, 0, 0, 0], [4, 5, 6, 7, 8, 9]], &dev).unwrap();
        let src_mask = Tensor::new(&[[1u32, 1, 1, 0, 0, 0], [1, 1, 1, 1, 1, 1]], &dev).unwrap();
        let out = model.forward(&x, &t, Some(&src), Some(&src_mask), false).unwrap();
        assert_eq!(out.dims(), &[2, 4, 8]);
    }
}
