//! Next-token pretraining head.

use candle_core::Tensor;
use candle_nn::VarBuilder;

use crate::Result;
use crate::config::BertConfig;
use crate::diffusion::GaussianDiffusion;
use crate::model::bert::heads::BertOnlyMlmHead;
use crate::model::loss;
use crate::model::timed::TimedTransformerNet;

/// Output of [`TimedTransformerForPretrain::forward`].
#[derive(Debug, Clone)]
pub struct PretrainOutput {
    pub loss: Option<Tensor>,
    /// `[B, L, vocab]`
    pub prediction_logits: Tensor,
    pub hidden_states: Vec<Tensor>,
}

/// [`TimedTransformerNet`] with a masked-LM head trained on shifted
/// next-token targets.
#[derive(Debug, Clone)]
pub struct TimedTransformerForPretrain {
    transformer_net: TimedTransformerNet,
    cls: BertOnlyMlmHead,
    vocab_size: usize,
}

impl TimedTransformerForPretrain {
    pub fn new(
        cfg: &BertConfig,
        in_channels: usize,
        diffusion: Option<GaussianDiffusion>,
        vb: VarBuilder,
    ) -> Result<Self> {
        Ok(Self {
            transformer_net: TimedTransformerNet::new(cfg, in_channels, diffusion, vb.pp("transformer_net"))?,
            cls: BertOnlyMlmHead::new(cfg, vb.pp("cls"))?,
            vocab_size: cfg.vocab_size,
        })
    }

    pub fn transformer_net(&self) -> &TimedTransformerNet {
        &self.transformer_net
    }

    /// - `input_ids`: `[B, L]`, embedded unless `input_embeds` is given
    /// - `timesteps`: `[B]`, required without a diffusion
    /// - `labels`: `[B, L]`; position `i` is scored against `labels[i + 1]`
    pub fn forward(
        &self,
        input_ids: &Tensor,
        timesteps: Option<&Tensor>,
        input_embeds: Option<&Tensor>,
        labels: Option<&Tensor>,
        train: bool,
    ) -> Result<PretrainOutput> {
        let embeds = match input_embeds {
            Some(embeds) => embeds.clone(),
            None => self.transformer_net.embed(input_ids)?,
        };
        let output = self.transformer_net.forward(&embeds, timesteps, train)?;
        let prediction_logits = self.cls.forward(&output.last_hidden_state)?;

        let loss = match labels {
            Some(labels) => Some(self.shifted_loss(&prediction_logits, labels)?),
            None => None,
        };

        Ok(PretrainOutput {
            loss,
            prediction_logits,
            hidden_states: output.hidden_states,
        })
    }

    fn shifted_loss(&self, logits: &Tensor, labels: &Tensor) -> Result<Tensor> {
        let seq_len = logits.dim(1)?;
        let shifted = logits
            .narrow(1, 0, seq_len - 1)?
            .contiguous()?
            .reshape(((), self.vocab_size))?;
        let targets = labels.narrow(1, 1, seq_len - 1)?.contiguous()?.flatten_all()?;
        loss::cross_entropy(&shifted, &targets)
    }
}
