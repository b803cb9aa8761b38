//! BERT encoder stack.
//!
//! Post-norm transformer layers with the BERT weight layout:
//!
//! ```text
//! layer.{i}.attention.self.{query,key,value}
//! layer.{i}.attention.self.distance_embedding      (relative positions only)
//! layer.{i}.attention.output.{dense,LayerNorm}
//! layer.{i}.crossattention.*                       (add_cross_attention only)
//! layer.{i}.intermediate.dense
//! layer.{i}.output.{dense,LayerNorm}
//! ```
//!
//! The encoder consumes embeddings, not ids: callers build their own input
//! embeddings (timestep + position + projected token embedding).

pub mod attention;
pub mod heads;
pub mod mask;

use candle_core::{Module, Tensor};
use candle_nn::{Linear, VarBuilder};

use crate::Result;
use crate::config::BertConfig;
use attention::{BertAttention, BertSelfOutput};

/// Feed-forward expansion with GELU.
#[derive(Debug, Clone)]
pub struct BertIntermediate {
    dense: Linear,
}

impl BertIntermediate {
    pub fn new(cfg: &BertConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            dense: candle_nn::linear(cfg.hidden_size, cfg.intermediate_size, vb.pp("dense"))?,
        })
    }

    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        Ok(self.dense.forward(xs)?.gelu_erf()?)
    }
}

/// One encoder layer: self-attention, optional cross-attention, FFN.
#[derive(Debug, Clone)]
pub struct BertLayer {
    attention: BertAttention,
    crossattention: Option<BertAttention>,
    intermediate: BertIntermediate,
    output: BertSelfOutput,
}

impl BertLayer {
    pub fn new(cfg: &BertConfig, vb: VarBuilder) -> Result<Self> {
        let crossattention = if cfg.add_cross_attention {
            Some(BertAttention::new(cfg, vb.pp("crossattention"))?)
        } else {
            None
        };
        Ok(Self {
            attention: BertAttention::new(cfg, vb.pp("attention"))?,
            crossattention,
            intermediate: BertIntermediate::new(cfg, vb.pp("intermediate"))?,
            output: BertSelfOutput::new(cfg, cfg.intermediate_size, vb.pp("output"))?,
        })
    }

    /// Forward pass.
    ///
    /// - `hidden_states`: `[B, L, hidden]`
    /// - `attention_mask`: additive, broadcastable to `[B, H, L, L]`
    /// - `encoder_hidden_states`: `[B, S, hidden]` (cross-attention layers only)
    /// - `encoder_attention_mask`: additive, broadcastable to `[B, H, L, S]`
    pub fn forward(
        &self,
        hidden_states: &Tensor,
        attention_mask: Option<&Tensor>,
        encoder_hidden_states: Option<&Tensor>,
        encoder_attention_mask: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        let mut h = self
            .attention
            .forward(hidden_states, None, attention_mask, train)?;

        if let (Some(cross), Some(encoder_hidden_states)) = (&self.crossattention, encoder_hidden_states) {
            h = cross.forward(&h, Some(encoder_hidden_states), encoder_attention_mask, train)?;
        }

        let ff = self.intermediate.forward(&h)?;
        self.output.forward(&ff, &h, train)
    }
}

/// Encoder result.
#[derive(Debug, Clone)]
pub struct EncoderOutput {
    pub last_hidden_state: Tensor,
    /// Input embeddings followed by every layer's output, when
    /// `output_hidden_states` is set; empty otherwise.
    pub hidden_states: Vec<Tensor>,
}

/// Stack of [`BertLayer`]s.
#[derive(Debug, Clone)]
pub struct BertEncoder {
    layers: Vec<BertLayer>,
    is_decoder: bool,
    output_hidden_states: bool,
}

impl BertEncoder {
    pub fn new(cfg: &BertConfig, vb: VarBuilder) -> Result<Self> {
        cfg.validate()?;
        let vb = vb.pp("layer");
        let layers = (0..cfg.num_hidden_layers)
            .map(|i| BertLayer::new(cfg, vb.pp(i)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            layers,
            is_decoder: cfg.is_decoder,
            output_hidden_states: cfg.output_hidden_states,
        })
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Run all layers.
    ///
    /// - `embeddings`: `[B, L, hidden]`
    /// - `attention_mask`: `[B, L]` padding mask (1 = valid)
    /// - `encoder_hidden_states`: `[B, S, hidden]`
    /// - `encoder_attention_mask`: `[B, S]` padding mask (1 = valid)
    ///
    /// Decoder configs add a causal mask on top of the padding mask.
    pub fn forward(
        &self,
        embeddings: &Tensor,
        attention_mask: Option<&Tensor>,
        encoder_hidden_states: Option<&Tensor>,
        encoder_attention_mask: Option<&Tensor>,
        train: bool,
    ) -> Result<EncoderOutput> {
        let dtype = embeddings.dtype();
        let seq_len = embeddings.dim(1)?;

        let padding = attention_mask
            .map(|m| mask::padding_mask(m, dtype))
            .transpose()?;
        let causal = if self.is_decoder {
            Some(mask::causal_mask(seq_len, dtype, embeddings.device())?)
        } else {
            None
        };
        let self_mask = mask::combine(padding, causal)?;
        let cross_mask = encoder_attention_mask
            .map(|m| mask::padding_mask(m, dtype))
            .transpose()?;

        let mut hidden_states = Vec::new();
        let mut h = embeddings.clone();
        for layer in &self.layers {
            if self.output_hidden_states {
                hidden_states.push(h.clone());
            }
            h = layer.forward(
                &h,
                self_mask.as_ref(),
                encoder_hidden_states,
                cross_mask.as_ref(),
                train,
            )?;
        }
        if self.output_hidden_states {
            hidden_states.push(h.clone());
        }

        Ok(EncoderOutput {
            last_hidden_state: h,
            hidden_states,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PositionEmbeddingType;
    use candle_core::{DType, Device, IndexOp};
    use candle_nn::VarMap;

    fn tiny_config() -> BertConfig {
        BertConfig {
            vocab_size: 20,
            hidden_size: 16,
            num_hidden_layers: 2,
            num_attention_heads: 4,
            intermediate_size: 32,
            max_position_embeddings: 32,
            position_embedding_type: PositionEmbeddingType::RelativeKey,
            diffusion_steps: 10,
            ..BertConfig::default()
        }
    }

    #[test]
    fn encoder_preserves_shape() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let encoder = BertEncoder::new(&tiny_config(), vb).unwrap();
        assert_eq!(encoder.num_layers(), 2);

        let x = Tensor::randn(0f32, 1.0, (3, 6, 16), &device).unwrap();
        let out = encoder.forward(&x, None, None, None, false).unwrap();
        assert_eq!(out.last_hidden_state.dims(), &[3, 6, 16]);
        assert!(out.hidden_states.is_empty());
    }

    #[test]
    fn output_hidden_states_collects_every_layer() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let cfg = BertConfig {
            output_hidden_states: true,
            ..tiny_config()
        };
        let encoder = BertEncoder::new(&cfg, vb).unwrap();
        let x = Tensor::randn(0f32, 1.0, (1, 4, 16), &device).unwrap();
        let out = encoder.forward(&x, None, None, None, false).unwrap();
        assert_eq!(out.hidden_states.len(), 3);
    }

    #[test]
    fn causal_decoder_ignores_future_tokens() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let cfg = BertConfig {
            is_decoder: true,
            ..tiny_config()
        };
        let encoder = BertEncoder::new(&cfg, vb).unwrap();

        let x = Tensor::randn(0f32, 1.0, (1, 5, 16), &device).unwrap();
        let changed_tail = Tensor::cat(
            &[
                x.narrow(1, 0, 3).unwrap(),
                Tensor::randn(0f32, 1.0, (1, 2, 16), &device).unwrap(),
            ],
            1,
        )
        .unwrap();
        let a = encoder.forward(&x, None, None, None, false).unwrap().last_hidden_state;
        let b = encoder
            .forward(&changed_tail, None, None, None, false)
            .unwrap()
            .last_hidden_state;
        let diff: f32 = (a.i((.., 0..3, ..)).unwrap() - b.i((.., 0..3, ..)).unwrap())
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(diff < 1e-5, "prefix changed by {diff}");
    }

    #[test]
    fn cross_attention_layers_accept_encoder_states() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let cfg = BertConfig {
            add_cross_attention: true,
            ..tiny_config()
        };
        let encoder = BertEncoder::new(&cfg, vb).unwrap();
        let x = Tensor::randn(0f32, 1.0, (2, 4, 16), &device).unwrap();
        let memory = Tensor::randn(0f32, 1.0, (2, 7, 16), &device).unwrap();
        let memory_mask = Tensor::new(&[[1u32, 1, 1, 1, 1, 0, 0], [1, 1, 1, 1, 1, 1, 1]], &device).unwrap();
        let out = encoder
            .forward(&x, None, Some(&memory), Some(&memory_mask), false)
            .unwrap();
        assert_eq!(out.last_hidden_state.dims(), &[2, 4, 16]);
        assert!(varmap.data().lock().unwrap().keys().any(|k| k.contains("crossattention")));
    }
}
