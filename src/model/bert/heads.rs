//! Output heads on top of the encoder.

use candle_core::{IndexOp, Module, Tensor};
use candle_nn::{LayerNorm, Linear, VarBuilder};

use crate::Result;
use crate::config::BertConfig;

/// First-token summary: `tanh(dense(h[:, 0]))`.
#[derive(Debug, Clone)]
pub struct BertPooler {
    dense: Linear,
}

impl BertPooler {
    pub fn new(cfg: &BertConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            dense: candle_nn::linear(cfg.hidden_size, cfg.hidden_size, vb.pp("dense"))?,
        })
    }

    /// `[B, L, hidden]` → `[B, hidden]`
    pub fn forward(&self, hidden_states: &Tensor) -> Result<Tensor> {
        let first = hidden_states.i((.., 0))?;
        Ok(self.dense.forward(&first)?.tanh()?)
    }
}

/// Masked-LM prediction head: transform (dense, GELU, LayerNorm) then a
/// projection to the vocabulary.
#[derive(Debug, Clone)]
pub struct BertOnlyMlmHead {
    transform: Linear,
    layer_norm: LayerNorm,
    decoder: Linear,
}

impl BertOnlyMlmHead {
    pub fn new(cfg: &BertConfig, vb: VarBuilder) -> Result<Self> {
        let vb = vb.pp("predictions");
        Ok(Self {
            transform: candle_nn::linear(cfg.hidden_size, cfg.hidden_size, vb.pp("transform.dense"))?,
            layer_norm: candle_nn::layer_norm(
                cfg.hidden_size,
                cfg.layer_norm_eps,
                vb.pp("transform.LayerNorm"),
            )?,
            decoder: candle_nn::linear(cfg.hidden_size, cfg.vocab_size, vb.pp("decoder"))?,
        })
    }

    /// `[B, L, hidden]` → `[B, L, vocab]`
    pub fn forward(&self, hidden_states: &Tensor) -> Result<Tensor> {
        let h = self.transform.forward(hidden_states)?.gelu_erf()?;
        let h = self.layer_norm.forward(&h)?;
        Ok(self.decoder.forward(&h)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn head_shapes() {
        let dev = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &dev);
        let cfg = BertConfig {
            vocab_size: 11,
            hidden_size: 8,
            num_attention_heads: 2,
            ..BertConfig::default()
        };
        let h = Tensor::randn(0f32, 1.0, (3, 5, 8), &dev).unwrap();

        let pooler = BertPooler::new(&cfg, vb.pp("pooler")).unwrap();
        assert_eq!(pooler.forward(&h).unwrap().dims(), &[3, 8]);

        let mlm = BertOnlyMlmHead::new(&cfg, vb.pp("cls")).unwrap();
        assert_eq!(mlm.forward(&h).unwrap().dims(), &[3, 5, 11]);
    }

    #[test]
    fn pooler_reads_only_the_first_token() {
        let dev = Device::Cpu;
        let varmap = candle_nn::VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let cfg = BertConfig {
            hidden_size: 4,
            num_attention_heads: 1,
            ..BertConfig::default()
        };
        let pooler = BertPooler::new(&cfg, vb).unwrap();
        let a = Tensor::randn(0f32, 1.0, (1, 3, 4), &dev).unwrap();
        let tail = Tensor::randn(0f32, 1.0, (1, 2, 4), &dev).unwrap();
        let b = Tensor::cat(&[&a.narrow(1, 0, 1).unwrap(), &tail], 1).unwrap();
        let pa: Vec<Vec<f32>> = pooler.forward(&a).unwrap().to_vec2().unwrap();
        let pb: Vec<Vec<f32>> = pooler.forward(&b).unwrap().to_vec2().unwrap();
        assert_eq!(pa, pb);
    }
}
