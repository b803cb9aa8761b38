//! Sequence classification head.

use std::sync::OnceLock;

use candle_core::{DType, Module, Tensor};
use candle_nn::{Dropout, Linear, VarBuilder};

use crate::Result;
use crate::config::{BertConfig, ProblemType};
use crate::diffusion::GaussianDiffusion;
use crate::model::bert::heads::BertPooler;
use crate::model::loss;
use crate::model::timed::TimedTransformerNet;

/// Output of [`TransformerNetClassifier::forward`].
#[derive(Debug, Clone)]
pub struct ClassifierOutput {
    pub loss: Option<Tensor>,
    /// `[B, num_labels]`
    pub logits: Tensor,
    pub hidden_states: Vec<Tensor>,
}

/// [`TimedTransformerNet`] → pooler → dropout → linear classifier.
#[derive(Debug, Clone)]
pub struct TransformerNetClassifier {
    transformer_net: TimedTransformerNet,
    pooler: BertPooler,
    dropout: Dropout,
    classifier: Linear,
    num_labels: usize,
    /// Fixed by the config, or by the first labelled batch.
    problem_type: OnceLock<ProblemType>,
}

impl TransformerNetClassifier {
    pub fn new(
        cfg: &BertConfig,
        in_channels: usize,
        diffusion: Option<GaussianDiffusion>,
        vb: VarBuilder,
    ) -> Result<Self> {
        let problem_type = OnceLock::new();
        if let Some(pt) = cfg.problem_type {
            let _ = problem_type.set(pt);
        }
        Ok(Self {
            transformer_net: TimedTransformerNet::new(cfg, in_channels, diffusion, vb.pp("transformer_net"))?,
            pooler: BertPooler::new(cfg, vb.pp("pooler"))?,
            dropout: Dropout::new(cfg.classifier_dropout_prob() as f32),
            classifier: candle_nn::linear(cfg.hidden_size, cfg.num_labels, vb.pp("classifier"))?,
            num_labels: cfg.num_labels,
            problem_type,
        })
    }

    pub fn transformer_net(&self) -> &TimedTransformerNet {
        &self.transformer_net
    }

    pub fn num_labels(&self) -> usize {
        self.num_labels
    }

    /// Problem type in effect, if already known.
    pub fn problem_type(&self) -> Option<ProblemType> {
        self.problem_type.get().copied()
    }

    /// - `input_ids`: `[B, L]`, embedded unless `input_embeds` is given
    /// - `labels`: `[B]` class ids, or `[B, num_labels]` floats for
    ///   regression and multi-label problems
    /// - `timesteps`: `[B]`, required without a diffusion
    pub fn forward(
        &self,
        input_ids: &Tensor,
        labels: Option<&Tensor>,
        timesteps: Option<&Tensor>,
        input_embeds: Option<&Tensor>,
        train: bool,
    ) -> Result<ClassifierOutput> {
        let embeds = match input_embeds {
            Some(embeds) => embeds.clone(),
            None => self.transformer_net.embed(input_ids)?,
        };
        let output = self.transformer_net.forward(&embeds, timesteps, train)?;
        let pooled = self.pooler.forward(&output.last_hidden_state)?;
        let pooled = self.dropout.forward(&pooled, train)?;
        let logits = self.classifier.forward(&pooled)?;

        let loss = match labels {
            Some(labels) => Some(self.loss(&logits, labels)?),
            None => None,
        };

        Ok(ClassifierOutput {
            loss,
            logits,
            hidden_states: output.hidden_states,
        })
    }

    fn loss(&self, logits: &Tensor, labels: &Tensor) -> Result<Tensor> {
        let problem_type = *self
            .problem_type
            .get_or_init(|| infer_problem_type(self.num_labels, labels.dtype()));
        match problem_type {
            ProblemType::Regression if self.num_labels == 1 => {
                loss::mse(&logits.flatten_all()?, &labels.flatten_all()?)
            }
            ProblemType::Regression => loss::mse(logits, labels),
            ProblemType::SingleLabelClassification => {
                loss::cross_entropy(&logits.reshape(((), self.num_labels))?, &labels.flatten_all()?)
            }
            ProblemType::MultiLabelClassification => loss::bce_with_logits(logits, labels),
        }
    }
}

/// One label → regression; integer labels → single-label; otherwise
/// multi-label.
pub fn infer_problem_type(num_labels: usize, label_dtype: DType) -> ProblemType {
    if num_labels == 1 {
        ProblemType::Regression
    } else if matches!(label_dtype, DType::U8 | DType::U32 | DType::I64) {
        ProblemType::SingleLabelClassification
    } else {
        ProblemType::MultiLabelClassification
    }
}
